//! Records import failures without stopping the import.

use async_trait::async_trait;
use serde_json::json;

use crate::db::pool::DbPool;
use crate::error::ImportError;
use crate::models::{ImportFailure, Stage};
use crate::services::now;

/// Message stored on a run that finished with non-fatal failures.
pub const PARTIAL_IMPORT_MESSAGE: &str = "The remote data could not be fully imported.";

/// Where a failure was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSource {
    /// A stage worker's entity importer.
    Stage,
    /// A fanned-out sub-job.
    Object,
}

impl FailureSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stage => "stage",
            Self::Object => "object",
        }
    }
}

#[async_trait]
pub trait FailureTracker: Send + Sync {
    async fn record(
        &self,
        project_id: i64,
        stage: Stage,
        source: FailureSource,
        error: &ImportError,
    ) -> Result<(), ImportError>;

    /// JSON summary of recorded failures, `None` when nothing failed.
    async fn summary(&self, project_id: i64) -> Result<Option<String>, ImportError> {
        let _ = project_id;
        Ok(None)
    }
}

/// [`FailureTracker`] writing to the `import_failures` table.
#[derive(Debug, Clone)]
pub struct SqliteFailureTracker {
    pool: DbPool,
}

impl SqliteFailureTracker {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// All failures of a project, oldest first.
    pub async fn failures_for(&self, project_id: i64) -> Result<Vec<ImportFailure>, ImportError> {
        let failures = sqlx::query_as::<_, ImportFailure>(
            r#"
            SELECT id, project_id, stage, source, error_kind, message, fatal, created_at
            FROM import_failures
            WHERE project_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(failures)
    }
}

#[async_trait]
impl FailureTracker for SqliteFailureTracker {
    async fn record(
        &self,
        project_id: i64,
        stage: Stage,
        source: FailureSource,
        error: &ImportError,
    ) -> Result<(), ImportError> {
        sqlx::query(
            r#"
            INSERT INTO import_failures (project_id, stage, source, error_kind, message, fatal, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(project_id)
        .bind(stage.as_str())
        .bind(source.as_str())
        .bind(error.kind())
        .bind(error.message())
        .bind(error.is_fatal())
        .bind(now())
        .execute(&self.pool)
        .await?;

        log::warn!(
            "Project {}: {} failure in stage {}: {}",
            project_id,
            source.as_str(),
            stage,
            error
        );

        Ok(())
    }

    async fn summary(&self, project_id: i64) -> Result<Option<String>, ImportError> {
        let failures = self.failures_for(project_id).await?;
        if failures.is_empty() {
            return Ok(None);
        }

        let errors: Vec<_> = failures
            .iter()
            .map(|failure| json!({"type": failure.stage, "errors": failure.message}))
            .collect();

        let summary = json!({
            "message": PARTIAL_IMPORT_MESSAGE,
            "errors": errors,
        });

        Ok(Some(summary.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::tempdir;

    async fn setup_tracker() -> SqliteFailureTracker {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        std::mem::forget(dir);

        SqliteFailureTracker::new(crate::db::initialize(&db_path).await.unwrap())
    }

    #[tokio::test]
    async fn test_record_and_list() {
        let tracker = setup_tracker().await;
        tracker
            .record(
                1,
                Stage::PullRequests,
                FailureSource::Stage,
                &ImportError::importer("remote timed out"),
            )
            .await
            .unwrap();
        tracker
            .record(
                1,
                Stage::Notes,
                FailureSource::Object,
                &ImportError::fatal("bad payload"),
            )
            .await
            .unwrap();

        let failures = tracker.failures_for(1).await.unwrap();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].stage, "pull_requests");
        assert_eq!(failures[0].error_kind, "importer");
        assert!(!failures[0].fatal);
        assert_eq!(failures[1].source.as_deref(), Some("object"));
        assert!(failures[1].fatal);

        assert!(tracker.failures_for(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_summary_format() {
        let tracker = setup_tracker().await;
        assert_eq!(tracker.summary(1).await.unwrap(), None);

        tracker
            .record(
                1,
                Stage::LfsObjects,
                FailureSource::Stage,
                &ImportError::importer("LFS server unavailable"),
            )
            .await
            .unwrap();

        let summary: Value = serde_json::from_str(&tracker.summary(1).await.unwrap().unwrap()).unwrap();
        assert_eq!(summary["message"], PARTIAL_IMPORT_MESSAGE);
        assert_eq!(summary["errors"][0]["type"], "lfs_objects");
        assert_eq!(summary["errors"][0]["errors"], "LFS server unavailable");
    }
}
