//! Import event log.
//!
//! Lifecycle events double as completion metrics: finished imports, their
//! duration, and per-stage progress can all be read back from here.

use sqlx::SqliteConnection;

use crate::db::pool::DbPool;
use crate::error::ImportError;
use crate::models::{EventStatus, ImportEvent};
use crate::services::now;

/// Operation recorded when a stage worker completes.
pub const STAGE_COMPLETED: &str = "stage_completed";

/// Operation recorded when an import is marked finished.
pub const IMPORT_FINISHED: &str = "import_finished";

/// Operation recorded when an import is marked failed.
pub const IMPORT_FAILED: &str = "import_failed";

/// Append an event.
pub async fn log_event(
    pool: &DbPool,
    project_id: i64,
    operation: &str,
    status: EventStatus,
    message: Option<&str>,
    duration_ms: Option<i64>,
) -> Result<(), ImportError> {
    let mut conn = pool.acquire().await?;
    log_event_in(&mut conn, project_id, operation, status, message, duration_ms).await
}

/// [`log_event`] on an open connection or transaction.
pub async fn log_event_in(
    conn: &mut SqliteConnection,
    project_id: i64,
    operation: &str,
    status: EventStatus,
    message: Option<&str>,
    duration_ms: Option<i64>,
) -> Result<(), ImportError> {
    sqlx::query(
        r#"
        INSERT INTO import_events (project_id, operation, status, message, duration_ms, timestamp)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(project_id)
    .bind(operation)
    .bind(status.to_string())
    .bind(message)
    .bind(duration_ms)
    .bind(now())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Events of a project, newest first.
pub async fn events_for_project(
    pool: &DbPool,
    project_id: i64,
    limit: i64,
) -> Result<Vec<ImportEvent>, ImportError> {
    let events = sqlx::query_as::<_, ImportEvent>(
        r#"
        SELECT id, project_id, operation, status, message, duration_ms, timestamp
        FROM import_events
        WHERE project_id = ?
        ORDER BY id DESC
        LIMIT ?
        "#,
    )
    .bind(project_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(events)
}

/// Total number of events with a given operation, across projects.
pub async fn count_events(pool: &DbPool, operation: &str) -> Result<i64, ImportError> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM import_events WHERE operation = ?")
        .bind(operation)
        .fetch_one(pool)
        .await?;

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_log_and_read_events() {
        let dir = tempdir().unwrap();
        let pool = crate::db::initialize(&dir.path().join("test.db")).await.unwrap();

        log_event(&pool, 1, STAGE_COMPLETED, EventStatus::Success, Some("repository"), None)
            .await
            .unwrap();
        log_event(&pool, 1, IMPORT_FINISHED, EventStatus::Success, None, Some(1500))
            .await
            .unwrap();
        log_event(&pool, 2, IMPORT_FAILED, EventStatus::Error, Some("boom"), None)
            .await
            .unwrap();

        let events = events_for_project(&pool, 1, 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].operation, IMPORT_FINISHED);
        assert_eq!(events[0].duration_ms, Some(1500));
        assert!(!events[0].is_error());

        assert_eq!(count_events(&pool, IMPORT_FINISHED).await.unwrap(), 1);
        assert!(events_for_project(&pool, 2, 10).await.unwrap()[0].is_error());
    }
}
