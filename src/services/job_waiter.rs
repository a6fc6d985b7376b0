//! Cross-process counting barrier between stages.
//!
//! A stage that fans out N sub-jobs registers a waiter with `remaining = N`.
//! Each sub-job reports completion exactly once per completion id; when the
//! counter drains, the next stage is scheduled. Scheduling goes through a
//! check-and-set gate in `stage_transitions`, so a stage is scheduled at most
//! once per import attempt no matter how many reporters observe the zero
//! crossing.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::db::pool::DbPool;
use crate::error::ImportError;
use crate::models::{Job, JobWaiterRecord, Stage, WaiterDescriptor, WaiterKey};
use crate::services::job_queue::Scheduler;
use crate::services::now;

/// Result of registering a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Counter stored; `remaining` already accounts for early completions.
    Registered { remaining: u64 },
    /// The key was already registered for this attempt. The first registration wins.
    Duplicate,
}

/// Result of reporting one sub-job completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Counted { remaining: u64 },
    /// This completion id was already counted.
    Duplicate,
    /// No waiter is registered under the key yet; the report is kept.
    Unregistered,
}

#[derive(Clone)]
pub struct JobWaiter {
    pool: DbPool,
    scheduler: Arc<dyn Scheduler>,
}

impl JobWaiter {
    pub fn new(pool: DbPool, scheduler: Arc<dyn Scheduler>) -> Self {
        Self { pool, scheduler }
    }

    /// Store the barrier counter for a fan-out.
    ///
    /// Completions reported before registration are subtracted up front.
    pub async fn register(
        &self,
        project_id: i64,
        attempt: i64,
        stage: Stage,
        descriptor: &WaiterDescriptor,
        next_stage: Stage,
    ) -> Result<Registration, ImportError> {
        let expected = i64::try_from(descriptor.expected_count).map_err(|_| {
            ImportError::invalid_input_field("expected count is too large", "expected_count")
        })?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO job_waiters
                (project_id, attempt, waiter_key, stage, next_stage, expected_count, remaining, created_at)
            VALUES (?, ?, ?, ?, ?, ?, MAX(? - (
                SELECT COUNT(*) FROM job_waiter_completions
                WHERE project_id = ? AND attempt = ? AND waiter_key = ?
            ), 0), ?)
            "#,
        )
        .bind(project_id)
        .bind(attempt)
        .bind(descriptor.key.as_str())
        .bind(stage.as_str())
        .bind(next_stage.as_str())
        .bind(expected)
        .bind(expected)
        .bind(project_id)
        .bind(attempt)
        .bind(descriptor.key.as_str())
        .bind(now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            log::warn!(
                "Project {}: waiter key {} is already registered, ignoring duplicate registration from stage {}",
                project_id,
                descriptor.key,
                stage
            );
            return Ok(Registration::Duplicate);
        }

        let remaining = self
            .get(project_id, attempt, &descriptor.key)
            .await?
            .map(|w| w.remaining.max(0) as u64)
            .unwrap_or(0);

        log::info!(
            "Project {}: stage {} waiting on {} sub-job(s) under {}",
            project_id,
            stage,
            remaining,
            descriptor.key
        );

        Ok(Registration::Registered { remaining })
    }

    /// Report that the sub-job for `completion_id` finished, successfully or not.
    ///
    /// Idempotent per completion id. Schedules the next stage when the counter drains.
    pub async fn notify(
        &self,
        project_id: i64,
        attempt: i64,
        key: &WaiterKey,
        completion_id: &str,
    ) -> Result<Completion, ImportError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO job_waiter_completions (project_id, attempt, waiter_key, completion_id, completed_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(project_id)
        .bind(attempt)
        .bind(key.as_str())
        .bind(completion_id)
        .bind(now())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.commit().await?;
            log::debug!(
                "Project {}: completion of {} for {} already counted",
                project_id,
                completion_id,
                key
            );

            // The earlier report may have drained the counter without scheduling.
            self.try_advance(project_id, attempt, key).await?;
            return Ok(Completion::Duplicate);
        }

        let remaining: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE job_waiters SET remaining = MAX(remaining - 1, 0)
            WHERE project_id = ? AND attempt = ? AND waiter_key = ?
            RETURNING remaining
            "#,
        )
        .bind(project_id)
        .bind(attempt)
        .bind(key.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        let Some((remaining,)) = remaining else {
            log::warn!(
                "Project {}: completion of {} reported for unregistered waiter {}",
                project_id,
                completion_id,
                key
            );
            return Ok(Completion::Unregistered);
        };

        if remaining == 0 {
            self.try_advance(project_id, attempt, key).await?;
        }

        Ok(Completion::Counted {
            remaining: remaining as u64,
        })
    }

    /// Decrement several counters by reported counts and advance once all are drained.
    ///
    /// Counts are not deduplicated; each batch must be reported once.
    ///
    /// # Returns
    /// `true` if this call scheduled `next_stage`
    pub async fn advance(
        &self,
        project_id: i64,
        attempt: i64,
        completions: &BTreeMap<WaiterKey, u64>,
        next_stage: Stage,
    ) -> Result<bool, ImportError> {
        let mut tx = self.pool.begin().await?;
        let mut unknown = Vec::new();
        let mut outstanding = 0i64;

        for (key, count) in completions {
            let count = i64::try_from(*count).unwrap_or(i64::MAX);
            let remaining: Option<(i64,)> = sqlx::query_as(
                r#"
                UPDATE job_waiters SET remaining = MAX(remaining - ?, 0)
                WHERE project_id = ? AND attempt = ? AND waiter_key = ?
                RETURNING remaining
                "#,
            )
            .bind(count)
            .bind(project_id)
            .bind(attempt)
            .bind(key.as_str())
            .fetch_optional(&mut *tx)
            .await?;

            match remaining {
                Some((remaining,)) => outstanding += remaining,
                None => unknown.push(key),
            }
        }

        tx.commit().await?;

        if !unknown.is_empty() {
            for key in unknown {
                log::warn!(
                    "Project {}: completion counts reported for unregistered waiter {}",
                    project_id,
                    key
                );
            }
            return Ok(false);
        }

        if outstanding > 0 {
            return Ok(false);
        }

        self.proceed(project_id, attempt, next_stage).await
    }

    /// Schedule the waiter's next stage if its counter has drained.
    ///
    /// # Returns
    /// `true` if this call scheduled the next stage
    pub async fn try_advance(
        &self,
        project_id: i64,
        attempt: i64,
        key: &WaiterKey,
    ) -> Result<bool, ImportError> {
        let Some(waiter) = self.get(project_id, attempt, key).await? else {
            return Ok(false);
        };

        if !waiter.is_drained() {
            return Ok(false);
        }

        let next_stage = next_stage_of(&waiter)?;
        self.proceed(project_id, attempt, next_stage).await
    }

    /// Deadline path: schedule the next stage even if sub-jobs are missing.
    pub async fn expire(
        &self,
        project_id: i64,
        attempt: i64,
        key: &WaiterKey,
    ) -> Result<bool, ImportError> {
        let Some(waiter) = self.get(project_id, attempt, key).await? else {
            log::warn!("Project {}: timeout for unregistered waiter {}", project_id, key);
            return Ok(false);
        };

        let next_stage = next_stage_of(&waiter)?;
        if self.has_fired(project_id, attempt, next_stage).await? {
            return Ok(false);
        }

        log::warn!(
            "Project {}: waiter {} timed out with {} of {} sub-job(s) outstanding, advancing to {}",
            project_id,
            key,
            waiter.remaining,
            waiter.expected_count,
            next_stage
        );

        self.proceed(project_id, attempt, next_stage).await
    }

    /// Schedule `next_stage` unless it was already scheduled for this attempt.
    ///
    /// # Returns
    /// `true` if this call won the gate and scheduled the stage
    pub async fn proceed(
        &self,
        project_id: i64,
        attempt: i64,
        next_stage: Stage,
    ) -> Result<bool, ImportError> {
        let claimed = sqlx::query(
            "INSERT OR IGNORE INTO stage_transitions (project_id, attempt, stage, fired_at) VALUES (?, ?, ?, ?)",
        )
        .bind(project_id)
        .bind(attempt)
        .bind(next_stage.as_str())
        .bind(now())
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        if !claimed {
            log::debug!("Project {}: stage {} already scheduled", project_id, next_stage);
            return Ok(false);
        }

        let job = Job::RunStage {
            project_id,
            attempt,
            stage: next_stage,
        };

        if let Err(e) = self.scheduler.perform_async(job).await {
            // Release the gate so a later report can try again.
            sqlx::query("DELETE FROM stage_transitions WHERE project_id = ? AND attempt = ? AND stage = ?")
                .bind(project_id)
                .bind(attempt)
                .bind(next_stage.as_str())
                .execute(&self.pool)
                .await?;
            return Err(e);
        }

        log::info!("Project {}: advancing to stage {}", project_id, next_stage);
        Ok(true)
    }

    /// Whether `stage` has been scheduled for an attempt of a project.
    pub async fn has_fired(
        &self,
        project_id: i64,
        attempt: i64,
        stage: Stage,
    ) -> Result<bool, ImportError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT fired_at FROM stage_transitions WHERE project_id = ? AND attempt = ? AND stage = ?",
        )
        .bind(project_id)
        .bind(attempt)
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    pub async fn get(
        &self,
        project_id: i64,
        attempt: i64,
        key: &WaiterKey,
    ) -> Result<Option<JobWaiterRecord>, ImportError> {
        let waiter = sqlx::query_as::<_, JobWaiterRecord>(
            r#"
            SELECT project_id, attempt, waiter_key, stage, next_stage, expected_count, remaining, created_at
            FROM job_waiters
            WHERE project_id = ? AND attempt = ? AND waiter_key = ?
            "#,
        )
        .bind(project_id)
        .bind(attempt)
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(waiter)
    }
}

fn next_stage_of(waiter: &JobWaiterRecord) -> Result<Stage, ImportError> {
    waiter.next_stage_enum().ok_or_else(|| {
        ImportError::integrity(format!(
            "Waiter {} has unknown next stage {}",
            waiter.waiter_key, waiter.next_stage
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::job_queue::SqliteJobQueue;
    use tempfile::tempdir;

    struct Fixture {
        waiter: JobWaiter,
        queue: SqliteJobQueue,
    }

    async fn setup() -> Fixture {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        std::mem::forget(dir);

        let pool = crate::db::initialize(&db_path).await.unwrap();
        let queue = SqliteJobQueue::new(pool.clone());
        Fixture {
            waiter: JobWaiter::new(pool, Arc::new(queue.clone())),
            queue,
        }
    }

    async fn scheduled_stages(queue: &SqliteJobQueue, project_id: i64) -> Vec<Stage> {
        queue
            .jobs_for_project(project_id)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|job| match job.job().unwrap() {
                Job::RunStage { stage, .. } => Some(stage),
                _ => None,
            })
            .collect()
    }

    fn descriptor(key: &str, expected: u64) -> WaiterDescriptor {
        WaiterDescriptor::new(WaiterKey::from(key), expected)
    }

    #[tokio::test]
    async fn test_fires_once_after_all_completions() {
        let f = setup().await;
        let key = WaiterKey::from("pr-42");
        f.waiter
            .register(1, 1, Stage::PullRequests, &descriptor("pr-42", 3), Stage::Notes)
            .await
            .unwrap();

        assert_eq!(
            f.waiter.notify(1, 1, &key, "a").await.unwrap(),
            Completion::Counted { remaining: 2 }
        );
        assert_eq!(
            f.waiter.notify(1, 1, &key, "b").await.unwrap(),
            Completion::Counted { remaining: 1 }
        );
        assert!(scheduled_stages(&f.queue, 1).await.is_empty());

        assert_eq!(
            f.waiter.notify(1, 1, &key, "c").await.unwrap(),
            Completion::Counted { remaining: 0 }
        );
        assert_eq!(scheduled_stages(&f.queue, 1).await, vec![Stage::Notes]);
    }

    #[tokio::test]
    async fn test_duplicate_reports_are_ignored() {
        let f = setup().await;
        let key = WaiterKey::from("k");
        f.waiter
            .register(1, 1, Stage::PullRequests, &descriptor("k", 2), Stage::Notes)
            .await
            .unwrap();

        f.waiter.notify(1, 1, &key, "a").await.unwrap();
        assert_eq!(f.waiter.notify(1, 1, &key, "a").await.unwrap(), Completion::Duplicate);
        assert_eq!(f.waiter.get(1, 1, &key).await.unwrap().unwrap().remaining, 1);
        assert!(scheduled_stages(&f.queue, 1).await.is_empty());
    }

    #[tokio::test]
    async fn test_counter_never_goes_negative() {
        let f = setup().await;
        let key = WaiterKey::from("k");
        f.waiter
            .register(1, 1, Stage::Notes, &descriptor("k", 1), Stage::LfsObjects)
            .await
            .unwrap();

        f.waiter.notify(1, 1, &key, "a").await.unwrap();
        assert_eq!(
            f.waiter.notify(1, 1, &key, "b").await.unwrap(),
            Completion::Counted { remaining: 0 }
        );
        assert_eq!(f.waiter.get(1, 1, &key).await.unwrap().unwrap().remaining, 0);
        assert_eq!(scheduled_stages(&f.queue, 1).await, vec![Stage::LfsObjects]);
    }

    #[tokio::test]
    async fn test_zero_expected_advances_on_try_advance() {
        let f = setup().await;
        let key = WaiterKey::from("empty");
        let registration = f
            .waiter
            .register(1, 1, Stage::LfsObjects, &descriptor("empty", 0), Stage::Finish)
            .await
            .unwrap();
        assert_eq!(registration, Registration::Registered { remaining: 0 });

        assert!(f.waiter.try_advance(1, 1, &key).await.unwrap());
        assert!(!f.waiter.try_advance(1, 1, &key).await.unwrap());
        assert_eq!(scheduled_stages(&f.queue, 1).await, vec![Stage::Finish]);
    }

    #[tokio::test]
    async fn test_duplicate_registration_keeps_first() {
        let f = setup().await;
        f.waiter
            .register(1, 1, Stage::PullRequests, &descriptor("k", 2), Stage::Notes)
            .await
            .unwrap();

        let second = f
            .waiter
            .register(1, 1, Stage::PullRequests, &descriptor("k", 5), Stage::Notes)
            .await
            .unwrap();

        assert_eq!(second, Registration::Duplicate);
        let waiter = f.waiter.get(1, 1, &WaiterKey::from("k")).await.unwrap().unwrap();
        assert_eq!(waiter.expected_count, 2);
    }

    #[tokio::test]
    async fn test_early_completions_are_reconciled_at_registration() {
        let f = setup().await;
        let key = WaiterKey::from("k");

        assert_eq!(f.waiter.notify(1, 1, &key, "a").await.unwrap(), Completion::Unregistered);
        assert!(scheduled_stages(&f.queue, 1).await.is_empty());

        let registration = f
            .waiter
            .register(1, 1, Stage::PullRequests, &descriptor("k", 2), Stage::Notes)
            .await
            .unwrap();
        assert_eq!(registration, Registration::Registered { remaining: 1 });

        f.waiter.notify(1, 1, &key, "b").await.unwrap();
        assert_eq!(scheduled_stages(&f.queue, 1).await, vec![Stage::Notes]);
    }

    #[tokio::test]
    async fn test_advance_with_completion_map() {
        let f = setup().await;
        f.waiter
            .register(1, 1, Stage::PullRequests, &descriptor("a", 2), Stage::Notes)
            .await
            .unwrap();
        f.waiter
            .register(1, 1, Stage::PullRequests, &descriptor("b", 1), Stage::Notes)
            .await
            .unwrap();

        let mut completions = BTreeMap::new();
        completions.insert(WaiterKey::from("a"), 1);
        completions.insert(WaiterKey::from("b"), 1);
        assert!(!f.waiter.advance(1, 1, &completions, Stage::Notes).await.unwrap());

        let mut rest = BTreeMap::new();
        rest.insert(WaiterKey::from("a"), 5);
        assert!(f.waiter.advance(1, 1, &rest, Stage::Notes).await.unwrap());
        assert_eq!(f.waiter.get(1, 1, &WaiterKey::from("a")).await.unwrap().unwrap().remaining, 0);

        // A second drain report does not fire again
        assert!(!f.waiter.advance(1, 1, &rest, Stage::Notes).await.unwrap());
        assert_eq!(scheduled_stages(&f.queue, 1).await, vec![Stage::Notes]);
    }

    #[tokio::test]
    async fn test_advance_with_unknown_key_does_not_fire() {
        let f = setup().await;
        let mut completions = BTreeMap::new();
        completions.insert(WaiterKey::from("ghost"), 1);

        assert!(!f.waiter.advance(1, 1, &completions, Stage::Notes).await.unwrap());
        assert!(scheduled_stages(&f.queue, 1).await.is_empty());
    }

    #[tokio::test]
    async fn test_expire_forces_advance_once() {
        let f = setup().await;
        let key = WaiterKey::from("slow");
        f.waiter
            .register(1, 1, Stage::Notes, &descriptor("slow", 10), Stage::LfsObjects)
            .await
            .unwrap();

        assert!(f.waiter.expire(1, 1, &key).await.unwrap());
        assert!(!f.waiter.expire(1, 1, &key).await.unwrap());

        // Late completions do not schedule the stage a second time
        for i in 0..10 {
            f.waiter.notify(1, 1, &key, &format!("job-{}", i)).await.unwrap();
        }
        assert_eq!(scheduled_stages(&f.queue, 1).await, vec![Stage::LfsObjects]);
    }

    #[tokio::test]
    async fn test_waiters_are_scoped_per_project() {
        let f = setup().await;
        let key = WaiterKey::from("shared");
        f.waiter
            .register(1, 1, Stage::PullRequests, &descriptor("shared", 1), Stage::Notes)
            .await
            .unwrap();
        f.waiter
            .register(2, 1, Stage::PullRequests, &descriptor("shared", 1), Stage::Notes)
            .await
            .unwrap();

        f.waiter.notify(1, 1, &key, "a").await.unwrap();
        assert_eq!(scheduled_stages(&f.queue, 1).await, vec![Stage::Notes]);
        assert!(scheduled_stages(&f.queue, 2).await.is_empty());
    }

    #[tokio::test]
    async fn test_attempts_do_not_share_counters_or_gates() {
        let f = setup().await;
        let key = WaiterKey::from("k");
        f.waiter
            .register(1, 1, Stage::PullRequests, &descriptor("k", 1), Stage::Notes)
            .await
            .unwrap();
        f.waiter
            .register(1, 2, Stage::PullRequests, &descriptor("k", 2), Stage::Notes)
            .await
            .unwrap();

        // A straggler of the first attempt drains only its own counter.
        f.waiter.notify(1, 1, &key, "a").await.unwrap();
        assert_eq!(f.waiter.get(1, 2, &key).await.unwrap().unwrap().remaining, 2);
        assert!(f.waiter.has_fired(1, 1, Stage::Notes).await.unwrap());
        assert!(!f.waiter.has_fired(1, 2, Stage::Notes).await.unwrap());

        f.waiter.notify(1, 2, &key, "a").await.unwrap();
        f.waiter.notify(1, 2, &key, "b").await.unwrap();
        assert!(f.waiter.has_fired(1, 2, Stage::Notes).await.unwrap());

        let attempts: Vec<i64> = f
            .queue
            .jobs_for_project(1)
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.job().unwrap().attempt())
            .collect();
        assert_eq!(attempts, vec![1, 2]);
    }
}
