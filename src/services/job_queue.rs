//! Persisted job queue and the [`Scheduler`] seam.
//!
//! Jobs are rows in `scheduled_jobs`. Runners in any process claim due rows
//! with a single `UPDATE ... RETURNING`, so a row is only ever handed to one
//! runner at a time.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::db::pool::DbPool;
use crate::error::ImportError;
use crate::models::{Job, ScheduledJob};
use crate::services::now;

const JOB_COLUMNS: &str = "id, job_id, project_id, job_type, payload, status, attempts, last_error, run_at, claimed_at, created_at, finished_at";

/// Enqueues background work.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run `job` as soon as a runner is free. Returns the job id.
    async fn perform_async(&self, job: Job) -> Result<String, ImportError>;

    /// Run `job` no earlier than `delay` from now. Returns the job id.
    async fn perform_in(&self, delay: Duration, job: Job) -> Result<String, ImportError>;
}

/// SQLite-backed [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SqliteJobQueue {
    pool: DbPool,
}

impl SqliteJobQueue {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn enqueue(&self, job: &Job, run_at: i64) -> Result<String, ImportError> {
        let job_id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(job)?;

        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (job_id, project_id, job_type, payload, status, attempts, run_at, created_at)
            VALUES (?, ?, ?, ?, 'pending', 0, ?, ?)
            "#,
        )
        .bind(&job_id)
        .bind(job.project_id())
        .bind(job.job_type())
        .bind(&payload)
        .bind(run_at)
        .bind(now())
        .execute(&self.pool)
        .await?;

        log::debug!("Enqueued {} job {} for project {}", job.job_type(), job_id, job.project_id());
        Ok(job_id)
    }

    /// Claim the oldest job due at `at`, marking it running.
    ///
    /// # Returns
    /// The claimed job with `attempts` already incremented, or `None` when nothing is due.
    pub async fn claim_due(&self, at: i64) -> Result<Option<ScheduledJob>, ImportError> {
        let job = sqlx::query_as::<_, ScheduledJob>(&format!(
            r#"
            UPDATE scheduled_jobs
            SET status = 'running', attempts = attempts + 1, claimed_at = ?
            WHERE id = (
                SELECT id FROM scheduled_jobs
                WHERE status = 'pending' AND run_at <= ?
                ORDER BY run_at ASC, id ASC
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(now())
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Mark a claimed job as done.
    pub async fn mark_done(&self, id: i64) -> Result<(), ImportError> {
        sqlx::query("UPDATE scheduled_jobs SET status = 'done', last_error = NULL, finished_at = ? WHERE id = ?")
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Put a failed job back in the queue to run after `delay`.
    pub async fn retry_later(&self, id: i64, error: &str, delay: Duration) -> Result<(), ImportError> {
        sqlx::query(
            "UPDATE scheduled_jobs SET status = 'pending', last_error = ?, run_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(now() + delay.as_secs() as i64)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark a job as permanently failed.
    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<(), ImportError> {
        sqlx::query(
            "UPDATE scheduled_jobs SET status = 'failed', last_error = ?, finished_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Return jobs left `running` by a crashed runner to the queue.
    ///
    /// Only jobs claimed more than `older_than` ago are touched; jobs a live
    /// runner is still working on stay claimed.
    ///
    /// # Returns
    /// Number of requeued jobs
    pub async fn requeue_stale(&self, older_than: Duration) -> Result<u64, ImportError> {
        let cutoff = now() - older_than.as_secs() as i64;
        let result = sqlx::query(
            "UPDATE scheduled_jobs SET status = 'pending' WHERE status = 'running' AND (claimed_at IS NULL OR claimed_at < ?)",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            log::warn!(
                "Requeued {} job(s) claimed more than {}s ago",
                result.rows_affected(),
                older_than.as_secs()
            );
        }

        Ok(result.rows_affected())
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<ScheduledJob>, ImportError> {
        let job = sqlx::query_as::<_, ScheduledJob>(&format!(
            "SELECT {} FROM scheduled_jobs WHERE job_id = ?",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// All jobs of a project, oldest first.
    pub async fn jobs_for_project(&self, project_id: i64) -> Result<Vec<ScheduledJob>, ImportError> {
        let jobs = sqlx::query_as::<_, ScheduledJob>(&format!(
            "SELECT {} FROM scheduled_jobs WHERE project_id = ? ORDER BY id ASC",
            JOB_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// Counts of pending and failed jobs.
    ///
    /// # Returns
    /// Tuple of (pending_count, failed_count)
    pub async fn job_counts(&self) -> Result<(i64, i64), ImportError> {
        let (pending, failed): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(CASE WHEN status = 'pending' OR status = 'running' THEN 1 END),
                COUNT(CASE WHEN status = 'failed' THEN 1 END)
            FROM scheduled_jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok((pending, failed))
    }

    /// Delete finished jobs older than `before`.
    ///
    /// # Returns
    /// Number of deleted jobs
    pub async fn cleanup_done(&self, before: i64) -> Result<u64, ImportError> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE status = 'done' AND finished_at < ?")
            .bind(before)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl Scheduler for SqliteJobQueue {
    async fn perform_async(&self, job: Job) -> Result<String, ImportError> {
        self.enqueue(&job, now()).await
    }

    async fn perform_in(&self, delay: Duration, job: Job) -> Result<String, ImportError> {
        self.enqueue(&job, now() + delay.as_secs() as i64).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobStatus, Stage};
    use tempfile::tempdir;

    async fn setup_queue() -> SqliteJobQueue {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        std::mem::forget(dir);

        SqliteJobQueue::new(crate::db::initialize(&db_path).await.unwrap())
    }

    fn stage_job(project_id: i64, stage: Stage) -> Job {
        Job::RunStage {
            project_id,
            attempt: 1,
            stage,
        }
    }

    #[tokio::test]
    async fn test_perform_async_is_immediately_due() {
        let queue = setup_queue().await;
        let job_id = queue.perform_async(stage_job(1, Stage::Repository)).await.unwrap();

        let claimed = queue.claim_due(now()).await.unwrap().unwrap();
        assert_eq!(claimed.job_id, job_id);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.status_enum(), JobStatus::Running);
        assert_eq!(claimed.job().unwrap(), stage_job(1, Stage::Repository));

        // Claimed jobs are not handed out twice
        assert!(queue.claim_due(now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_perform_in_delays_the_job() {
        let queue = setup_queue().await;
        let job_id = queue
            .perform_in(Duration::from_secs(30), stage_job(1, Stage::Finish))
            .await
            .unwrap();

        assert!(queue.claim_due(now()).await.unwrap().is_none());

        let job = queue.get_job(&job_id).await.unwrap().unwrap();
        let delay = job.run_at - job.created_at;
        assert!((29..=31).contains(&delay), "unexpected delay {}", delay);

        let claimed = queue.claim_due(now() + 31).await.unwrap().unwrap();
        assert_eq!(claimed.job_id, job_id);
    }

    #[tokio::test]
    async fn test_claims_in_due_order() {
        let queue = setup_queue().await;
        queue
            .perform_in(Duration::from_secs(10), stage_job(1, Stage::Notes))
            .await
            .unwrap();
        queue.perform_async(stage_job(2, Stage::Repository)).await.unwrap();

        let first = queue.claim_due(now() + 60).await.unwrap().unwrap();
        assert_eq!(first.project_id, 2);
        let second = queue.claim_due(now() + 60).await.unwrap().unwrap();
        assert_eq!(second.project_id, 1);
    }

    #[tokio::test]
    async fn test_retry_and_fail() {
        let queue = setup_queue().await;
        let job_id = queue.perform_async(stage_job(1, Stage::Notes)).await.unwrap();

        let claimed = queue.claim_due(now()).await.unwrap().unwrap();
        queue
            .retry_later(claimed.id, "timeout", Duration::from_secs(0))
            .await
            .unwrap();

        let again = queue.claim_due(now()).await.unwrap().unwrap();
        assert_eq!(again.attempts, 2);
        assert_eq!(again.last_error.as_deref(), Some("timeout"));

        queue.mark_failed(again.id, "still broken").await.unwrap();
        let job = queue.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status_enum(), JobStatus::Failed);
        assert_eq!(queue.job_counts().await.unwrap(), (0, 1));
    }

    #[tokio::test]
    async fn test_requeue_stale_and_cleanup() {
        let queue = setup_queue().await;
        queue.perform_async(stage_job(1, Stage::Notes)).await.unwrap();
        let claimed = queue.claim_due(now()).await.unwrap().unwrap();
        assert!(claimed.claimed_at.is_some());

        sqlx::query("UPDATE scheduled_jobs SET claimed_at = ? WHERE id = ?")
            .bind(now() - 600)
            .bind(claimed.id)
            .execute(&queue.pool)
            .await
            .unwrap();

        assert_eq!(queue.requeue_stale(Duration::from_secs(300)).await.unwrap(), 1);
        let claimed = queue.claim_due(now()).await.unwrap().unwrap();
        queue.mark_done(claimed.id).await.unwrap();

        assert_eq!(queue.cleanup_done(now() + 1).await.unwrap(), 1);
        assert!(queue.jobs_for_project(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requeue_stale_leaves_recent_claims_alone() {
        let queue = setup_queue().await;
        queue.perform_async(stage_job(1, Stage::Notes)).await.unwrap();
        queue.perform_async(stage_job(2, Stage::Notes)).await.unwrap();
        let live = queue.claim_due(now()).await.unwrap().unwrap();
        let crashed = queue.claim_due(now()).await.unwrap().unwrap();

        sqlx::query("UPDATE scheduled_jobs SET claimed_at = ? WHERE id = ?")
            .bind(now() - 3600)
            .bind(crashed.id)
            .execute(&queue.pool)
            .await
            .unwrap();

        assert_eq!(queue.requeue_stale(Duration::from_secs(300)).await.unwrap(), 1);

        let live = queue.get_job(&live.job_id).await.unwrap().unwrap();
        assert_eq!(live.status_enum(), JobStatus::Running);
        let crashed = queue.get_job(&crashed.job_id).await.unwrap().unwrap();
        assert_eq!(crashed.status_enum(), JobStatus::Pending);

        // The live runner's job is not handed to anyone else.
        let next = queue.claim_due(now()).await.unwrap().unwrap();
        assert_eq!(next.job_id, crashed.job_id);
        assert!(queue.claim_due(now()).await.unwrap().is_none());
    }
}
