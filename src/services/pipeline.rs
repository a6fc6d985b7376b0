//! Wires the stage chain, barrier, finalizer and stores together, and
//! dispatches queued jobs to them.

use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::db::pool::DbPool;
use crate::error::ImportError;
use crate::models::{EventStatus, ImportRun, Job, NewImportRun, Stage};
use crate::services::failure_tracker::{FailureTracker, SqliteFailureTracker};
use crate::services::finalizer::Finalizer;
use crate::services::import_log::{self, IMPORT_FAILED};
use crate::services::import_state;
use crate::services::job_queue::{Scheduler, SqliteJobQueue};
use crate::services::job_waiter::JobWaiter;
use crate::services::placeholder_store::{PlaceholderReferenceStore, SqlitePlaceholderStore};
use crate::services::stage_worker::{StageChain, StageWorker};

/// Builder for [`Pipeline`]. Collaborators default to the SQLite implementations.
pub struct PipelineBuilder {
    pool: DbPool,
    chain: StageChain,
    config: PipelineConfig,
    scheduler: Option<Arc<dyn Scheduler>>,
    failures: Option<Arc<dyn FailureTracker>>,
    placeholders: Option<Arc<dyn PlaceholderReferenceStore>>,
}

impl PipelineBuilder {
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn failure_tracker(mut self, failures: Arc<dyn FailureTracker>) -> Self {
        self.failures = Some(failures);
        self
    }

    pub fn placeholder_store(mut self, placeholders: Arc<dyn PlaceholderReferenceStore>) -> Self {
        self.placeholders = Some(placeholders);
        self
    }

    pub fn build(self) -> Pipeline {
        let pool = self.pool;
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(SqliteJobQueue::new(pool.clone())));
        let failures = self
            .failures
            .unwrap_or_else(|| Arc::new(SqliteFailureTracker::new(pool.clone())));
        let placeholders = self
            .placeholders
            .unwrap_or_else(|| Arc::new(SqlitePlaceholderStore::new(pool.clone())));

        let waiter = JobWaiter::new(pool.clone(), scheduler.clone());
        let stage_worker = StageWorker::new(
            pool.clone(),
            Arc::new(self.chain),
            scheduler.clone(),
            waiter.clone(),
            failures.clone(),
            self.config.waiter_timeout(),
        );
        let finalizer = Finalizer::new(
            pool.clone(),
            placeholders,
            failures,
            scheduler.clone(),
            self.config.finish_poll_delay(),
        );

        Pipeline {
            pool,
            config: self.config,
            scheduler,
            waiter,
            stage_worker,
            finalizer,
        }
    }
}

/// The staged import pipeline.
#[derive(Clone)]
pub struct Pipeline {
    pool: DbPool,
    config: PipelineConfig,
    scheduler: Arc<dyn Scheduler>,
    waiter: JobWaiter,
    stage_worker: StageWorker,
    finalizer: Finalizer,
}

impl Pipeline {
    pub fn builder(pool: DbPool, chain: StageChain) -> PipelineBuilder {
        PipelineBuilder {
            pool,
            chain,
            config: PipelineConfig::default(),
            scheduler: None,
            failures: None,
            placeholders: None,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn job_waiter(&self) -> &JobWaiter {
        &self.waiter
    }

    pub fn stage_worker(&self) -> &StageWorker {
        &self.stage_worker
    }

    pub fn finalizer(&self) -> &Finalizer {
        &self.finalizer
    }

    /// Register the import and move it to `scheduled`.
    pub async fn schedule_import(&self, input: NewImportRun) -> Result<ImportRun, ImportError> {
        let project_id = input.project_id;
        import_state::create_import_run(&self.pool, input).await?;

        if !import_state::mark_scheduled(&self.pool, project_id).await? {
            return Err(ImportError::invalid_input_field(
                format!("Import for project {} cannot be scheduled", project_id),
                "project_id",
            ));
        }

        import_state::get_import_run(&self.pool, project_id).await
    }

    /// Move a scheduled import to `started` and schedule its first stage.
    ///
    /// # Returns
    /// `false` if the import was not in `scheduled`
    pub async fn start_import(&self, project_id: i64) -> Result<bool, ImportError> {
        if !import_state::mark_started(&self.pool, project_id).await? {
            log::info!("Project {}: import is not scheduled, not starting", project_id);
            return Ok(false);
        }

        let run = import_state::get_import_run(&self.pool, project_id).await?;
        let first = self.stage_worker.chain().first_stage();
        log::info!("Project {}: import attempt {} started", project_id, run.attempt);
        self.waiter.proceed(project_id, run.attempt, first).await?;
        Ok(true)
    }

    /// Cancel an import. Running sub-jobs still report; later stages become no-ops.
    pub async fn cancel_import(&self, project_id: i64) -> Result<bool, ImportError> {
        let canceled = import_state::mark_canceled(&self.pool, project_id).await?;
        if canceled {
            log::info!("Project {}: import canceled", project_id);
        }
        Ok(canceled)
    }

    /// Run one job.
    pub async fn perform(&self, job: &Job) -> Result<(), ImportError> {
        match job {
            Job::RunStage {
                project_id,
                attempt,
                stage: Stage::Finish,
            } => {
                self.finalizer.perform(*project_id, *attempt).await?;
            }
            Job::RunStage {
                project_id,
                attempt,
                stage,
            } => {
                self.stage_worker
                    .perform(*project_id, *attempt, *stage)
                    .await?;
            }
            Job::ImportObject {
                project_id,
                attempt,
                stage,
                waiter_key,
                object_id,
                object,
            } => {
                self.stage_worker
                    .import_object(*project_id, *attempt, *stage, waiter_key, object_id, object)
                    .await?;
            }
            Job::AdvanceStage {
                project_id,
                attempt,
                completions,
                next_stage,
            } => {
                self.waiter
                    .advance(*project_id, *attempt, completions, *next_stage)
                    .await?;
            }
            Job::WaiterTimeout {
                project_id,
                attempt,
                waiter_key,
            } => {
                let running = import_state::find_import_run(&self.pool, *project_id)
                    .await?
                    .is_some_and(|run| run.is_running_attempt(*attempt));
                if running {
                    self.waiter
                        .expire(*project_id, *attempt, waiter_key)
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Called once a job will not be retried again.
    ///
    /// Abandoned sub-jobs still count as done for their waiter. A stage that
    /// cannot complete fails the import, unless the import has moved on to
    /// another attempt.
    pub async fn on_exhausted(&self, job: &Job, error: &ImportError) -> Result<(), ImportError> {
        match job {
            Job::ImportObject {
                project_id,
                attempt,
                stage,
                waiter_key,
                object_id,
                ..
            } => {
                self.stage_worker
                    .abandon_object(*project_id, *attempt, *stage, waiter_key, object_id, error)
                    .await
            }
            Job::RunStage {
                project_id,
                attempt,
                stage,
            } => {
                let message = error.to_string();
                if import_state::mark_failed(&self.pool, *project_id, *attempt, &message).await? {
                    log::error!(
                        "Project {}: import failed in stage {}: {}",
                        project_id,
                        stage,
                        message
                    );
                    import_log::log_event(
                        &self.pool,
                        *project_id,
                        IMPORT_FAILED,
                        EventStatus::Error,
                        Some(&message),
                        None,
                    )
                    .await?;
                } else {
                    log::info!(
                        "Project {}: stage {} of attempt {} gave up after the import moved on: {}",
                        project_id,
                        stage,
                        attempt,
                        message
                    );
                }
                Ok(())
            }
            Job::AdvanceStage { .. } | Job::WaiterTimeout { .. } => Ok(()),
        }
    }
}
