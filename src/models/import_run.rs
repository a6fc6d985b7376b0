//! Import run model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::ImportError;

/// Lifecycle status of an import run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    None,
    Scheduled,
    Started,
    Finished,
    Failed,
    Canceled,
}

impl ImportStatus {
    /// Whether the run reached an end state and may be scheduled again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Canceled)
    }
}

impl From<&str> for ImportStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "scheduled" => Self::Scheduled,
            "started" => Self::Started,
            "finished" => Self::Finished,
            "failed" => Self::Failed,
            "canceled" => Self::Canceled,
            _ => Self::None,
        }
    }
}

impl std::fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Started => write!(f, "started"),
            Self::Finished => write!(f, "finished"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// Connection parameters for the source Bitbucket Server repository.
///
/// Stored as JSON on the import run; the pipeline only hands it to importers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSource {
    /// Base URL of the Bitbucket Server instance.
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Bitbucket project key, e.g. `PRJ`.
    pub project_key: String,
    pub repo_slug: String,
}

/// One import attempt for one target project.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ImportRun {
    /// Target project ID.
    pub project_id: i64,

    /// Status: `none`, `scheduled`, `started`, `finished`, `failed`, `canceled`.
    pub status: String,

    /// Incremented each time the import is scheduled; jobs carry it.
    pub attempt: i64,

    /// JSON-encoded [`ImportSource`].
    #[serde(skip_serializing)]
    pub source: String,

    /// Last error message or failure summary (optional).
    pub last_error: Option<String>,

    /// When the run entered `started` (Unix, optional).
    pub started_at: Option<i64>,

    /// When the run entered `finished` (Unix, optional).
    pub finished_at: Option<i64>,

    pub created_at: i64,
    pub updated_at: i64,
}

impl ImportRun {
    /// Parse the status string into an enum.
    pub fn status_enum(&self) -> ImportStatus {
        ImportStatus::from(self.status.as_str())
    }

    /// Check if stage workers may run for this import.
    pub fn is_started(&self) -> bool {
        self.status_enum() == ImportStatus::Started
    }

    /// Check if work scheduled for `attempt` may still run.
    pub fn is_running_attempt(&self, attempt: i64) -> bool {
        self.is_started() && self.attempt == attempt
    }

    /// Decode the stored connection parameters.
    pub fn source(&self) -> Result<ImportSource, ImportError> {
        serde_json::from_str(&self.source).map_err(|e| {
            ImportError::invalid_input_field(
                format!("Invalid import source for project {}: {}", self.project_id, e),
                "source",
            )
        })
    }

    /// Wall-clock duration of a finished run in milliseconds.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).max(0) * 1000),
            _ => None,
        }
    }
}

/// Input for registering a new import run.
#[derive(Debug, Clone)]
pub struct NewImportRun {
    pub project_id: i64,
    pub source: ImportSource,
}
