//! Typed Bitbucket Server API records.
//!
//! Only the fields the pipeline reads are modelled; entity importers that need
//! more can deserialize the raw JSON carried by each sub-job.

use serde::{Deserialize, Serialize};

/// Bitbucket user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Author or reviewer wrapper around a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user: User,
}

/// Source or target ref of a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestRef {
    /// Fully qualified ref, e.g. `refs/heads/feature`.
    pub id: String,
    pub display_id: String,
    pub latest_commit: Option<String>,
}

/// Pull request as listed by `/pull-requests`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// `OPEN`, `MERGED` or `DECLINED`.
    pub state: String,
    pub created_date: i64,
    pub updated_date: i64,
    pub from_ref: PullRequestRef,
    pub to_ref: PullRequestRef,
    #[serde(default)]
    pub author: Option<Participant>,
}

impl PullRequest {
    /// Temporary branch names used to restore commits of merged pull requests.
    pub fn temp_branch_names(&self) -> (String, String) {
        (
            format!("gitlab/import/pull-request/{}/from", self.id),
            format!("gitlab/import/pull-request/{}/to", self.id),
        )
    }

    pub fn is_merged(&self) -> bool {
        self.state.eq_ignore_ascii_case("MERGED")
    }
}

/// Entry of a pull request's activity stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: i64,
    /// `COMMENTED`, `APPROVED`, `MERGED`, ...
    pub action: String,
    pub created_date: i64,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub comment: Option<serde_json::Value>,
}

impl Activity {
    pub fn is_comment(&self) -> bool {
        self.action == "COMMENTED" && self.comment.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
    pub key: String,
}

/// Repository metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub project: ProjectRef,
}
