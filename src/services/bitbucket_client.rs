//! Typed Bitbucket Server client.
//!
//! Thin layer over [`Connection`] that knows the REST paths and item types
//! the import stages consume.

use serde_json::{json, Value};

use crate::config::PipelineConfig;
use crate::models::{Activity, ImportSource, PullRequest, Repository};
use crate::services::connection::{ApiRoot, Connection, ConnectionConfig, ConnectionError};
use crate::services::pagination::{Collection, Paginator};
use crate::services::retry::RetryWithDelay;

#[derive(Debug, Clone)]
pub struct BitbucketServerClient {
    connection: Connection,
    page_length: u32,
}

impl BitbucketServerClient {
    pub fn new(connection: Connection, page_length: u32) -> Self {
        Self {
            connection,
            page_length,
        }
    }

    /// Build a client for an import run's source repository.
    pub fn from_source(
        source: &ImportSource,
        config: &PipelineConfig,
    ) -> Result<Self, ConnectionError> {
        let connection = Connection::new(
            ConnectionConfig::from_source(source, config),
            RetryWithDelay::new(config.max_retry_delay()),
        )?;
        Ok(Self::new(connection, config.page_length))
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn repo_path(project_key: &str, repo_slug: &str) -> String {
        format!(
            "/projects/{}/repos/{}",
            urlencoding::encode(project_key),
            urlencoding::encode(repo_slug)
        )
    }

    /// Fetch repository metadata.
    pub async fn repo(
        &self,
        project_key: &str,
        repo_slug: &str,
    ) -> Result<Repository, ConnectionError> {
        let path = Self::repo_path(project_key, repo_slug);
        let body = self.connection.get(&path, &[]).await?;
        serde_json::from_value(body).map_err(|e| ConnectionError::InvalidJson {
            endpoint: path,
            message: e.to_string(),
        })
    }

    /// Paginator over all pull requests, in any state.
    pub fn pull_requests_paginator(
        &self,
        project_key: &str,
        repo_slug: &str,
        page_offset: u64,
    ) -> Paginator<'_, PullRequest> {
        let path = format!("{}/pull-requests", Self::repo_path(project_key, repo_slug));
        Paginator::with_offset(&self.connection, path, page_offset, self.page_length)
            .with_query("state", "ALL")
    }

    pub fn pull_requests(
        &self,
        project_key: &str,
        repo_slug: &str,
        page_offset: u64,
    ) -> Collection<'_, PullRequest> {
        Collection::new(self.pull_requests_paginator(project_key, repo_slug, page_offset))
    }

    /// Activity stream (comments, approvals, merges) of one pull request.
    pub fn activities(
        &self,
        project_key: &str,
        repo_slug: &str,
        pull_request_id: i64,
        page_offset: u64,
    ) -> Collection<'_, Activity> {
        let path = format!(
            "{}/pull-requests/{}/activities",
            Self::repo_path(project_key, repo_slug),
            pull_request_id
        );
        Collection::new(Paginator::with_offset(
            &self.connection,
            path,
            page_offset,
            self.page_length,
        ))
    }

    /// Create a branch at `start_point`.
    pub async fn create_branch(
        &self,
        project_key: &str,
        repo_slug: &str,
        branch_name: &str,
        start_point: &str,
    ) -> Result<Value, ConnectionError> {
        let path = format!("{}/branches", Self::repo_path(project_key, repo_slug));
        self.connection
            .post(
                &path,
                &json!({
                    "name": branch_name,
                    "startPoint": start_point,
                    "message": "Creating branch for GitLab import",
                }),
            )
            .await
    }

    /// Delete a branch, only if it still points at `end_point`.
    pub async fn delete_branch(
        &self,
        project_key: &str,
        repo_slug: &str,
        branch_name: &str,
        end_point: &str,
    ) -> Result<(), ConnectionError> {
        let path = format!("{}/branches", Self::repo_path(project_key, repo_slug));
        self.connection
            .delete(
                ApiRoot::BranchUtils,
                &path,
                &json!({
                    "name": branch_name,
                    "dryRun": false,
                    "endPoint": end_point,
                }),
            )
            .await?;
        Ok(())
    }
}
