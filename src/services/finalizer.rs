//! Final stage: wait for placeholder references to drain, then finish.
//!
//! The finalizer never sleeps in-process. While references remain it
//! triggers resolution and schedules another iteration of itself.

use std::sync::Arc;
use std::time::Duration;

use crate::db::pool::DbPool;
use crate::error::ImportError;
use crate::models::{EventStatus, Job, Stage};
use crate::services::failure_tracker::FailureTracker;
use crate::services::import_log::{self, IMPORT_FINISHED};
use crate::services::import_state;
use crate::services::job_queue::Scheduler;
use crate::services::placeholder_store::PlaceholderReferenceStore;

/// Result of one finalizer iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    /// The import is not running.
    Skipped,
    /// The run was marked finished.
    Finished,
    /// References remain; another iteration is scheduled.
    Rescheduled { remaining: u64 },
}

#[derive(Clone)]
pub struct Finalizer {
    pool: DbPool,
    placeholders: Arc<dyn PlaceholderReferenceStore>,
    failures: Arc<dyn FailureTracker>,
    scheduler: Arc<dyn Scheduler>,
    poll_delay: Duration,
}

impl Finalizer {
    pub fn new(
        pool: DbPool,
        placeholders: Arc<dyn PlaceholderReferenceStore>,
        failures: Arc<dyn FailureTracker>,
        scheduler: Arc<dyn Scheduler>,
        poll_delay: Duration,
    ) -> Self {
        Self {
            pool,
            placeholders,
            failures,
            scheduler,
            poll_delay,
        }
    }

    /// One iteration for an import attempt of a project.
    ///
    /// Marking the run finished, storing the failure summary, logging the
    /// finish event and clearing transient state commit together or not at all.
    pub async fn perform(&self, project_id: i64, attempt: i64) -> Result<FinishOutcome, ImportError> {
        let run = import_state::find_import_run(&self.pool, project_id).await?;
        match run {
            Some(run) if run.is_running_attempt(attempt) => {}
            Some(run) => {
                log::info!(
                    "Project {}: import is {} at attempt {}, not finishing attempt {}",
                    project_id,
                    run.status,
                    run.attempt,
                    attempt
                );
                return Ok(FinishOutcome::Skipped);
            }
            None => {
                log::info!("Project {}: no import run, not finishing", project_id);
                return Ok(FinishOutcome::Skipped);
            }
        }

        let remaining = self.placeholders.count(project_id).await?;
        if remaining > 0 {
            self.placeholders.trigger_resolution(project_id).await?;
            self.scheduler
                .perform_in(
                    self.poll_delay,
                    Job::RunStage {
                        project_id,
                        attempt,
                        stage: Stage::Finish,
                    },
                )
                .await?;

            log::info!(
                "Project {}: {} placeholder reference(s) outstanding, checking again in {}s",
                project_id,
                remaining,
                self.poll_delay.as_secs()
            );
            return Ok(FinishOutcome::Rescheduled { remaining });
        }

        let summary = self.failures.summary(project_id).await?;

        let mut tx = self.pool.begin().await?;

        let Some(run) =
            import_state::finish_in(&mut tx, project_id, attempt, summary.as_deref()).await?
        else {
            // Canceled or failed between the guard and the update.
            return Ok(FinishOutcome::Skipped);
        };
        let duration_ms = run.duration_ms();

        import_log::log_event_in(
            &mut tx,
            project_id,
            IMPORT_FINISHED,
            EventStatus::Success,
            None,
            duration_ms,
        )
        .await?;

        import_state::clear_transient_state_in(&mut tx, project_id).await?;

        tx.commit().await?;

        log::info!(
            "Project {}: import finished in {}ms",
            project_id,
            duration_ms.unwrap_or(0)
        );

        Ok(FinishOutcome::Finished)
    }
}
