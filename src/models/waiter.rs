//! Barrier descriptors and persisted counters.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::stage::Stage;

/// Identifier of one fan-out.
///
/// Stable across retries of the same stage within one import attempt, so a
/// retried stage keeps adding to the fan-out it started.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WaiterKey(String);

impl WaiterKey {
    /// Key of the fan-out of `stage`, of the form `<project>:<attempt>:<stage>`.
    pub fn for_stage(project_id: i64, attempt: i64, stage: Stage) -> Self {
        Self(format!("{}:{}:{}", project_id, attempt, stage))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WaiterKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WaiterKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for WaiterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handed back by an entity importer that fanned out `expected_count` sub-jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaiterDescriptor {
    pub key: WaiterKey,
    pub expected_count: u64,
}

impl WaiterDescriptor {
    pub fn new(key: WaiterKey, expected_count: u64) -> Self {
        Self {
            key,
            expected_count,
        }
    }
}

/// Persisted barrier counter.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobWaiterRecord {
    pub project_id: i64,

    /// Import attempt the fan-out belongs to.
    pub attempt: i64,

    pub waiter_key: String,

    /// Stage that fanned out.
    pub stage: String,

    /// Stage scheduled once the counter drains.
    pub next_stage: String,

    pub expected_count: i64,

    /// Sub-jobs still outstanding; never negative.
    pub remaining: i64,

    pub created_at: i64,
}

impl JobWaiterRecord {
    pub fn is_drained(&self) -> bool {
        self.remaining == 0
    }

    pub fn next_stage_enum(&self) -> Option<Stage> {
        Stage::parse(&self.next_stage)
    }
}
