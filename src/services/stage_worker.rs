//! Stage chain driver.
//!
//! A [`StageChain`] maps each stage to its entity importer. The
//! [`StageWorker`] runs one stage for one import attempt: it checks that the
//! attempt is still running, invokes the importer, and either hands the
//! fan-out to the barrier or schedules the next stage directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use crate::db::pool::DbPool;
use crate::error::ImportError;
use crate::models::{EventStatus, ImportRun, Job, Stage, WaiterDescriptor, WaiterKey};
use crate::services::failure_tracker::{FailureSource, FailureTracker};
use crate::services::import_cache;
use crate::services::import_log::{self, STAGE_COMPLETED};
use crate::services::import_state;
use crate::services::job_queue::Scheduler;
use crate::services::job_waiter::{JobWaiter, Registration};

/// What an entity importer sees while running a stage.
pub struct StageContext<'a> {
    pub run: &'a ImportRun,
    pub stage: Stage,
    pool: &'a DbPool,
    scheduler: &'a dyn Scheduler,
    failures: &'a dyn FailureTracker,
}

impl<'a> StageContext<'a> {
    pub fn new(
        run: &'a ImportRun,
        stage: Stage,
        pool: &'a DbPool,
        scheduler: &'a dyn Scheduler,
        failures: &'a dyn FailureTracker,
    ) -> Self {
        Self {
            run,
            stage,
            pool,
            scheduler,
            failures,
        }
    }

    pub fn project_id(&self) -> i64 {
        self.run.project_id
    }

    /// Key of this stage's fan-out. Every run of the stage within one import
    /// attempt gets the same key.
    pub fn waiter_key(&self) -> WaiterKey {
        WaiterKey::for_stage(self.run.project_id, self.run.attempt, self.stage)
    }

    /// Schedule a sub-job importing `object`, reporting to `key` when done.
    ///
    /// Objects already spawned under `key` by an earlier run of the stage
    /// are skipped.
    ///
    /// # Returns
    /// The sub-job id, or `None` if the object was already spawned
    pub async fn spawn_object(
        &self,
        key: &WaiterKey,
        object_id: &str,
        object: Value,
    ) -> Result<Option<String>, ImportError> {
        let project_id = self.run.project_id;
        if import_cache::fanout_job(self.pool, project_id, key, object_id)
            .await?
            .is_some()
        {
            return Ok(None);
        }

        let job_id = self
            .scheduler
            .perform_async(Job::ImportObject {
                project_id,
                attempt: self.run.attempt,
                stage: self.stage,
                waiter_key: key.clone(),
                object_id: object_id.to_string(),
                object,
            })
            .await?;

        import_cache::record_fanout(self.pool, project_id, key, object_id, &job_id).await?;
        Ok(Some(job_id))
    }

    /// Number of objects spawned under `key` so far, including earlier runs
    /// of the stage. This is the expected count of the fan-out.
    pub async fn spawned_count(&self, key: &WaiterKey) -> Result<u64, ImportError> {
        import_cache::fanout_count(self.pool, self.run.project_id, key).await
    }

    /// Record a failure that does not stop the stage.
    pub async fn record_failure(&self, error: &ImportError) -> Result<(), ImportError> {
        self.failures
            .record(self.run.project_id, self.stage, FailureSource::Stage, error)
            .await
    }
}

/// Imports one kind of entity for a stage.
///
/// Importers must be idempotent: stages and sub-jobs are retried.
#[async_trait]
pub trait EntityImporter: Send + Sync {
    /// Run the stage. Return a descriptor when sub-jobs were fanned out
    /// through [`StageContext::spawn_object`].
    async fn execute(&self, ctx: &StageContext<'_>) -> Result<Option<WaiterDescriptor>, ImportError>;

    /// Import one fanned-out object.
    async fn import_object(&self, run: &ImportRun, object: &Value) -> Result<(), ImportError> {
        let _ = (run, object);
        Err(ImportError::fatal("importer does not fan out sub-jobs"))
    }
}

/// Ordered stage table. `Finish` is never part of it; it always follows the
/// last entry.
#[derive(Clone)]
pub struct StageChain {
    entries: Vec<(Stage, Arc<dyn EntityImporter>)>,
}

impl StageChain {
    /// Build a chain. Stages must be unique, in import order, and exclude `Finish`.
    pub fn new(entries: Vec<(Stage, Arc<dyn EntityImporter>)>) -> Result<Self, ImportError> {
        if entries.is_empty() {
            return Err(ImportError::invalid_input("stage chain is empty"));
        }
        if entries.iter().any(|(stage, _)| *stage == Stage::Finish) {
            return Err(ImportError::invalid_input(
                "finish is handled by the finalizer and cannot have an importer",
            ));
        }
        if entries.windows(2).any(|pair| pair[0].0 >= pair[1].0) {
            return Err(ImportError::invalid_input("stages must be unique and in import order"));
        }

        Ok(Self { entries })
    }

    pub fn first_stage(&self) -> Stage {
        self.entries
            .first()
            .map(|(stage, _)| *stage)
            .unwrap_or(Stage::Finish)
    }

    /// Stage scheduled after `stage` completes.
    pub fn next_stage(&self, stage: Stage) -> Stage {
        self.entries
            .iter()
            .skip_while(|(s, _)| *s != stage)
            .nth(1)
            .map(|(s, _)| *s)
            .unwrap_or(Stage::Finish)
    }

    pub fn importer(&self, stage: Stage) -> Option<&Arc<dyn EntityImporter>> {
        self.entries
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, importer)| importer)
    }

    pub fn stages(&self) -> impl Iterator<Item = Stage> + '_ {
        self.entries.iter().map(|(stage, _)| *stage)
    }
}

/// Result of one stage worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The import is not running; nothing happened.
    Skipped,
    /// No sub-jobs; the next stage was handed to the scheduler.
    Advanced { next_stage: Stage },
    /// Sub-jobs are running; the barrier schedules the next stage.
    Waiting { key: WaiterKey, expected_count: u64 },
    /// The importer returned a key that was already registered.
    DuplicateWaiter { key: WaiterKey },
}

#[derive(Clone)]
pub struct StageWorker {
    pool: DbPool,
    chain: Arc<StageChain>,
    scheduler: Arc<dyn Scheduler>,
    waiter: JobWaiter,
    failures: Arc<dyn FailureTracker>,
    waiter_timeout: Duration,
}

impl StageWorker {
    pub fn new(
        pool: DbPool,
        chain: Arc<StageChain>,
        scheduler: Arc<dyn Scheduler>,
        waiter: JobWaiter,
        failures: Arc<dyn FailureTracker>,
        waiter_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            chain,
            scheduler,
            waiter,
            failures,
            waiter_timeout,
        }
    }

    pub fn chain(&self) -> &StageChain {
        &self.chain
    }

    /// Load the run if stage work scheduled for `attempt` may happen for it.
    async fn started_run(
        &self,
        project_id: i64,
        attempt: i64,
        stage: Stage,
    ) -> Result<Option<ImportRun>, ImportError> {
        match import_state::find_import_run(&self.pool, project_id).await? {
            Some(run) if run.is_running_attempt(attempt) => Ok(Some(run)),
            Some(run) if run.attempt != attempt => {
                log::info!(
                    "Project {}: {} work belongs to attempt {}, current attempt is {}, skipping",
                    project_id,
                    stage,
                    attempt,
                    run.attempt
                );
                Ok(None)
            }
            Some(run) => {
                log::info!(
                    "Project {}: import is {}, skipping {} work",
                    project_id,
                    run.status,
                    stage
                );
                Ok(None)
            }
            None => {
                log::info!("Project {}: no import run, skipping {} work", project_id, stage);
                Ok(None)
            }
        }
    }

    /// Run `stage` for an import attempt of a project.
    ///
    /// Importer errors are recorded with the failure tracker and returned so
    /// the job runner can retry the stage.
    pub async fn perform(
        &self,
        project_id: i64,
        attempt: i64,
        stage: Stage,
    ) -> Result<StageOutcome, ImportError> {
        let Some(run) = self.started_run(project_id, attempt, stage).await? else {
            return Ok(StageOutcome::Skipped);
        };

        let importer = self.chain.importer(stage).ok_or_else(|| {
            ImportError::invalid_input_field(format!("No importer for stage {}", stage), "stage")
        })?;
        let next_stage = self.chain.next_stage(stage);
        let started = Instant::now();

        log::info!("Project {}: running stage {}", project_id, stage);

        let ctx = StageContext::new(
            &run,
            stage,
            &self.pool,
            self.scheduler.as_ref(),
            self.failures.as_ref(),
        );
        let descriptor = match importer.execute(&ctx).await {
            Ok(descriptor) => descriptor,
            Err(err) => {
                let err = err.in_stage(stage.as_str());
                if let Err(track_err) = self
                    .failures
                    .record(project_id, stage, FailureSource::Stage, &err)
                    .await
                {
                    log::error!(
                        "Project {}: could not record failure of stage {}: {}",
                        project_id,
                        stage,
                        track_err
                    );
                }
                return Err(err);
            }
        };

        let outcome = match descriptor {
            Some(descriptor) => {
                self.wait_for(project_id, attempt, stage, descriptor, next_stage)
                    .await?
            }
            None => {
                self.waiter.proceed(project_id, attempt, next_stage).await?;
                StageOutcome::Advanced { next_stage }
            }
        };

        import_log::log_event(
            &self.pool,
            project_id,
            STAGE_COMPLETED,
            EventStatus::Success,
            Some(stage.as_str()),
            Some(started.elapsed().as_millis() as i64),
        )
        .await?;

        Ok(outcome)
    }

    async fn wait_for(
        &self,
        project_id: i64,
        attempt: i64,
        stage: Stage,
        descriptor: WaiterDescriptor,
        next_stage: Stage,
    ) -> Result<StageOutcome, ImportError> {
        let registration = self
            .waiter
            .register(project_id, attempt, stage, &descriptor, next_stage)
            .await?;

        if registration == Registration::Duplicate {
            // A retry after the stage already registered; the stored counter stands.
            self.waiter
                .try_advance(project_id, attempt, &descriptor.key)
                .await?;
            return Ok(StageOutcome::DuplicateWaiter {
                key: descriptor.key,
            });
        }

        self.scheduler
            .perform_in(
                self.waiter_timeout,
                Job::WaiterTimeout {
                    project_id,
                    attempt,
                    waiter_key: descriptor.key.clone(),
                },
            )
            .await?;

        // Covers zero sub-jobs and sub-jobs that finished before registration.
        self.waiter
            .try_advance(project_id, attempt, &descriptor.key)
            .await?;

        Ok(StageOutcome::Waiting {
            key: descriptor.key,
            expected_count: descriptor.expected_count,
        })
    }

    /// Sub-job body: import one object, then report completion under `object_id`.
    ///
    /// Objects of an attempt that is no longer running are not imported, but
    /// the completion is still reported.
    pub async fn import_object(
        &self,
        project_id: i64,
        attempt: i64,
        stage: Stage,
        key: &WaiterKey,
        object_id: &str,
        object: &Value,
    ) -> Result<(), ImportError> {
        if let Some(run) = self.started_run(project_id, attempt, stage).await? {
            let importer = self.chain.importer(stage).ok_or_else(|| {
                ImportError::invalid_input_field(format!("No importer for stage {}", stage), "stage")
            })?;
            importer
                .import_object(&run, object)
                .await
                .map_err(|e| e.in_stage(stage.as_str()))?;
        }

        self.waiter
            .notify(project_id, attempt, key, object_id)
            .await?;
        Ok(())
    }

    /// A sub-job gave up: record why and report it as done so the stage can move on.
    ///
    /// Failures of an earlier attempt are only logged.
    pub async fn abandon_object(
        &self,
        project_id: i64,
        attempt: i64,
        stage: Stage,
        key: &WaiterKey,
        object_id: &str,
        error: &ImportError,
    ) -> Result<(), ImportError> {
        let current = import_state::find_import_run(&self.pool, project_id)
            .await?
            .is_some_and(|run| run.attempt == attempt);

        if current {
            self.failures
                .record(project_id, stage, FailureSource::Object, error)
                .await?;
        } else {
            log::warn!(
                "Project {}: object {} of attempt {} gave up: {}",
                project_id,
                object_id,
                attempt,
                error
            );
        }

        self.waiter
            .notify(project_id, attempt, key, object_id)
            .await?;
        Ok(())
    }
}
