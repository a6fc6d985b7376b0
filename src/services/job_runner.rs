//! Background job runner.
//!
//! Claims due jobs from the queue and hands them to the [`Pipeline`]. Failed
//! jobs are retried with bounded exponential backoff until they are fatal or
//! run out of attempts.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::error::ImportError;
use crate::models::ScheduledJob;
use crate::services::job_queue::SqliteJobQueue;
use crate::services::now;
use crate::services::pipeline::Pipeline;
use crate::services::retry::backoff_delay;

pub struct JobRunner {
    pipeline: Arc<Pipeline>,
    queue: SqliteJobQueue,
    config: PipelineConfig,
}

impl JobRunner {
    pub fn new(pipeline: Arc<Pipeline>, queue: SqliteJobQueue) -> Self {
        let config = pipeline.config().clone();
        Self {
            pipeline,
            queue,
            config,
        }
    }

    /// Process one job due now.
    ///
    /// # Returns
    /// `false` if no job was due
    pub async fn run_once(&self) -> Result<bool, ImportError> {
        self.run_once_at(now()).await
    }

    /// Process one job due at `at` (Unix).
    pub async fn run_once_at(&self, at: i64) -> Result<bool, ImportError> {
        match self.queue.claim_due(at).await? {
            Some(job) => {
                self.process(job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Process jobs until none are due now.
    ///
    /// # Returns
    /// Number of processed jobs
    pub async fn drain(&self) -> Result<usize, ImportError> {
        let mut processed = 0;
        while self.run_once().await? {
            processed += 1;
        }
        Ok(processed)
    }

    /// Process jobs until none are due at `at`, including jobs scheduled
    /// while draining.
    pub async fn drain_at(&self, at: i64) -> Result<usize, ImportError> {
        let mut processed = 0;
        while self.run_once_at(at).await? {
            processed += 1;
        }
        Ok(processed)
    }

    async fn process(&self, scheduled: ScheduledJob) -> Result<(), ImportError> {
        let job = match scheduled.job() {
            Ok(job) => job,
            Err(e) => {
                log::error!("Job {} has an unreadable payload: {}", scheduled.job_id, e);
                self.queue
                    .mark_failed(scheduled.id, &format!("Invalid payload: {}", e))
                    .await?;
                return Ok(());
            }
        };

        let err = match self.pipeline.perform(&job).await {
            Ok(()) => return self.queue.mark_done(scheduled.id).await,
            Err(err) => err,
        };

        let message = err.to_string();
        if err.is_fatal() || scheduled.attempts >= self.config.job_max_attempts {
            log::error!(
                "Job {} ({}) for project {} failed permanently after {} attempt(s): {}",
                scheduled.job_id,
                scheduled.job_type,
                scheduled.project_id,
                scheduled.attempts,
                message
            );
            self.queue.mark_failed(scheduled.id, &message).await?;
            self.pipeline.on_exhausted(&job, &err).await?;
        } else {
            let delay = backoff_delay(
                scheduled.attempts.max(1) as u32,
                self.config.job_retry_base_delay(),
                self.config.job_retry_max_delay(),
            );
            log::warn!(
                "Job {} ({}) for project {} failed on attempt {}, retrying in {}s: {}",
                scheduled.job_id,
                scheduled.job_type,
                scheduled.project_id,
                scheduled.attempts,
                delay.as_secs(),
                message
            );
            self.queue
                .retry_later(scheduled.id, &message, delay)
                .await?;
        }

        Ok(())
    }

    /// Poll the queue in the background until `cancel` fires.
    pub fn start_background(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            log::info!(
                "Job runner started, polling every {}ms",
                self.config.poll_interval_millis
            );

            match self.queue.requeue_stale(self.config.stale_job_timeout()).await {
                Ok(0) => {}
                Ok(n) => log::info!("Job runner returned {} abandoned job(s) to the queue", n),
                Err(e) => log::error!("Job runner could not requeue abandoned jobs: {}", e),
            }

            let mut interval = time::interval(self.config.poll_interval());
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match self.drain().await {
                            Ok(0) => {}
                            Ok(n) => log::debug!("Job runner processed {} job(s)", n),
                            Err(e) => log::error!("Job runner error: {}", e),
                        }
                    }
                }
            }

            log::info!("Job runner stopped");
        })
    }
}
