//! Import stages.

use serde::{Deserialize, Serialize};

/// Ordered step of an import.
///
/// `Repository → PullRequests → Notes → LfsObjects → Finish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Repository,
    PullRequests,
    Notes,
    LfsObjects,
    Finish,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 5] = [
        Stage::Repository,
        Stage::PullRequests,
        Stage::Notes,
        Stage::LfsObjects,
        Stage::Finish,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Repository => "repository",
            Self::PullRequests => "pull_requests",
            Self::Notes => "notes",
            Self::LfsObjects => "lfs_objects",
            Self::Finish => "finish",
        }
    }

    /// Parse a stored stage name.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|stage| stage.as_str() == s)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
