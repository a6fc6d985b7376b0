//! Background job payloads and queue rows.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

use super::stage::Stage;
use super::waiter::WaiterKey;

/// A unit of background work.
///
/// Every job carries the import attempt it was scheduled for. Jobs of an
/// earlier attempt are no-ops once the project is scheduled again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Job {
    /// Run one stage worker. `Finish` is handled by the finalizer.
    RunStage {
        project_id: i64,
        attempt: i64,
        stage: Stage,
    },

    /// Import a single object fanned out by a stage, then report to its waiter.
    ImportObject {
        project_id: i64,
        attempt: i64,
        stage: Stage,
        waiter_key: WaiterKey,
        /// Source id of the object; counted once per waiter.
        object_id: String,
        object: Value,
    },

    /// Batched completion report for one or more waiters.
    AdvanceStage {
        project_id: i64,
        attempt: i64,
        completions: BTreeMap<WaiterKey, u64>,
        next_stage: Stage,
    },

    /// Force a waiter forward once its deadline passes.
    WaiterTimeout {
        project_id: i64,
        attempt: i64,
        waiter_key: WaiterKey,
    },
}

impl Job {
    pub fn project_id(&self) -> i64 {
        match self {
            Self::RunStage { project_id, .. }
            | Self::ImportObject { project_id, .. }
            | Self::AdvanceStage { project_id, .. }
            | Self::WaiterTimeout { project_id, .. } => *project_id,
        }
    }

    pub fn attempt(&self) -> i64 {
        match self {
            Self::RunStage { attempt, .. }
            | Self::ImportObject { attempt, .. }
            | Self::AdvanceStage { attempt, .. }
            | Self::WaiterTimeout { attempt, .. } => *attempt,
        }
    }

    /// Stored in `scheduled_jobs.job_type` for filtering.
    pub fn job_type(&self) -> &'static str {
        match self {
            Self::RunStage { .. } => "run_stage",
            Self::ImportObject { .. } => "import_object",
            Self::AdvanceStage { .. } => "advance_stage",
            Self::WaiterTimeout { .. } => "waiter_timeout",
        }
    }
}

/// Status of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl From<&str> for JobStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "running" => Self::Running,
            "done" => Self::Done,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Job persisted in the queue.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScheduledJob {
    /// Queue row ID.
    pub id: i64,

    /// Stable job identity (UUID); also the sub-job id reported to waiters.
    pub job_id: String,

    pub project_id: i64,

    /// `run_stage`, `import_object`, `advance_stage`, `waiter_timeout`.
    pub job_type: String,

    /// JSON-encoded [`Job`].
    pub payload: String,

    /// Status: `pending`, `running`, `done`, `failed`.
    pub status: String,

    /// Number of times the job has been claimed.
    pub attempts: i64,

    pub last_error: Option<String>,

    /// Earliest time the job may run (Unix).
    pub run_at: i64,

    /// When a runner last claimed the job (Unix).
    pub claimed_at: Option<i64>,

    pub created_at: i64,
    pub finished_at: Option<i64>,
}

impl ScheduledJob {
    pub fn status_enum(&self) -> JobStatus {
        JobStatus::from(self.status.as_str())
    }

    /// Decode the payload.
    pub fn job(&self) -> Result<Job, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}
