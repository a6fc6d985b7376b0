//! Import failures and import event log models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Failure recorded while importing a project.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ImportFailure {
    pub id: i64,
    pub project_id: i64,

    /// Stage the failure happened in.
    pub stage: String,

    /// Component that raised the error: `stage` or `object` (optional).
    pub source: Option<String>,

    /// Error kind, see `ImportError::kind`.
    pub error_kind: String,

    pub message: String,

    /// Whether the failure aborted the import.
    pub fatal: bool,

    pub created_at: i64,
}

/// Status of an import event entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Success,
    Error,
}

impl From<&str> for EventStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "success" => Self::Success,
            _ => Self::Error,
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Log of import lifecycle events, used for completion metrics.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ImportEvent {
    pub id: i64,
    pub project_id: i64,

    /// Operation: `stage_completed`, `import_finished`, etc.
    pub operation: String,

    /// Status: `success`, `error`.
    pub status: String,

    pub message: Option<String>,

    /// Operation duration in milliseconds.
    pub duration_ms: Option<i64>,

    /// When the event occurred (Unix).
    pub timestamp: i64,
}

impl ImportEvent {
    pub fn status_enum(&self) -> EventStatus {
        EventStatus::from(self.status.as_str())
    }

    pub fn is_error(&self) -> bool {
        self.status_enum() == EventStatus::Error
    }
}
