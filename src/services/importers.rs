//! Bitbucket Server entity importers.
//!
//! [`RepositoryImporter`] runs inline. [`CollectionImporter`] pages through
//! pull requests and fans out one sub-job per pull request not imported yet;
//! what happens to each pull request is up to its [`ObjectHandler`].
//! [`LfsObjectsImporter`] runs inline and never stops the import.

use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::Value;

use crate::config::PipelineConfig;
use crate::db::pool::DbPool;
use crate::error::ImportError;
use crate::models::{ImportRun, PullRequest, WaiterDescriptor};
use crate::services::bitbucket_client::BitbucketServerClient;
use crate::services::import_cache;
use crate::services::placeholder_store::SqlitePlaceholderStore;
use crate::services::stage_worker::{EntityImporter, StageContext};

fn client_for(run: &ImportRun, config: &PipelineConfig) -> Result<BitbucketServerClient, ImportError> {
    let source = run.source()?;
    Ok(BitbucketServerClient::from_source(&source, config)?)
}

/// Checks that the source repository is reachable.
pub struct RepositoryImporter {
    config: PipelineConfig,
}

impl RepositoryImporter {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EntityImporter for RepositoryImporter {
    async fn execute(&self, ctx: &StageContext<'_>) -> Result<Option<WaiterDescriptor>, ImportError> {
        let source = ctx.run.source()?;
        let client = BitbucketServerClient::from_source(&source, &self.config)?;
        let repo = client.repo(&source.project_key, &source.repo_slug).await?;

        log::info!(
            "Project {}: importing {}/{} (repository {})",
            ctx.project_id(),
            repo.project.key,
            repo.slug,
            repo.id
        );
        Ok(None)
    }
}

/// Per pull request work of a [`CollectionImporter`].
#[async_trait]
pub trait ObjectHandler: Send + Sync {
    async fn handle(
        &self,
        run: &ImportRun,
        client: &BitbucketServerClient,
        pull_request: &PullRequest,
    ) -> Result<(), ImportError>;
}

/// Which pass over the pull requests a [`CollectionImporter`] makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    PullRequests,
    PullRequestNotes,
}

impl CollectionKind {
    /// Kind stored in the already-imported cache.
    pub fn cache_kind(self) -> &'static str {
        match self {
            Self::PullRequests => "pull_request",
            Self::PullRequestNotes => "pull_request_notes",
        }
    }

    /// Name of the page counter.
    pub fn collection(self) -> &'static str {
        match self {
            Self::PullRequests => "pull_requests",
            Self::PullRequestNotes => "pull_request_notes",
        }
    }
}

/// Fans out one sub-job per pull request.
///
/// The page offset is saved after every page and pull requests already
/// spawned under the stage's waiter key are skipped, so a retried stage does
/// not spawn work twice. The expected count covers every run of the stage.
pub struct CollectionImporter {
    kind: CollectionKind,
    pool: DbPool,
    config: PipelineConfig,
    handler: Arc<dyn ObjectHandler>,
}

impl CollectionImporter {
    pub fn new(
        kind: CollectionKind,
        pool: DbPool,
        config: PipelineConfig,
        handler: Arc<dyn ObjectHandler>,
    ) -> Self {
        Self {
            kind,
            pool,
            config,
            handler,
        }
    }
}

#[async_trait]
impl EntityImporter for CollectionImporter {
    async fn execute(&self, ctx: &StageContext<'_>) -> Result<Option<WaiterDescriptor>, ImportError> {
        let project_id = ctx.project_id();
        let source = ctx.run.source()?;
        let client = BitbucketServerClient::from_source(&source, &self.config)?;

        let start = import_cache::page_counter(&self.pool, project_id, self.kind.collection()).await?;
        let mut paginator =
            client.pull_requests_paginator(&source.project_key, &source.repo_slug, start);

        let key = ctx.waiter_key();
        let mut spawned = 0u64;

        while let Some(page) = paginator.items().await? {
            for pull_request in page {
                let source_id = pull_request.id.to_string();
                if ctx
                    .spawn_object(&key, &source_id, serde_json::to_value(&pull_request)?)
                    .await?
                    .is_some()
                {
                    spawned += 1;
                }
            }

            import_cache::set_page_counter(
                &self.pool,
                project_id,
                self.kind.collection(),
                paginator.offset(),
            )
            .await?;
        }

        let expected = ctx.spawned_count(&key).await?;
        log::info!(
            "Project {}: scheduled {} {} job(s), {} in total",
            project_id,
            spawned,
            self.kind.cache_kind(),
            expected
        );

        Ok(Some(WaiterDescriptor::new(key, expected)))
    }

    async fn import_object(&self, run: &ImportRun, object: &Value) -> Result<(), ImportError> {
        let pull_request: PullRequest = serde_json::from_value(object.clone())
            .map_err(|e| ImportError::fatal(format!("Invalid pull request payload: {}", e)))?;
        let source_id = pull_request.id.to_string();

        if import_cache::is_imported(&self.pool, run.project_id, self.kind.cache_kind(), &source_id)
            .await?
        {
            return Ok(());
        }

        let client = client_for(run, &self.config)?;
        self.handler.handle(run, &client, &pull_request).await?;

        import_cache::mark_imported(&self.pool, run.project_id, self.kind.cache_kind(), &source_id)
            .await
    }
}

/// Restores the commits of merged pull requests.
///
/// Merged source branches are usually gone, so the head and base commits are
/// pinned with temporary branches while the pull request is imported.
pub struct PullRequestHandler;

#[async_trait]
impl ObjectHandler for PullRequestHandler {
    async fn handle(
        &self,
        run: &ImportRun,
        client: &BitbucketServerClient,
        pull_request: &PullRequest,
    ) -> Result<(), ImportError> {
        if !pull_request.is_merged() {
            return Ok(());
        }

        let source = run.source()?;
        let (from_branch, to_branch) = pull_request.temp_branch_names();
        let pins = [
            (from_branch, pull_request.from_ref.latest_commit.as_deref()),
            (to_branch, pull_request.to_ref.latest_commit.as_deref()),
        ];

        for (branch, commit) in &pins {
            if let Some(commit) = commit {
                client
                    .create_branch(&source.project_key, &source.repo_slug, branch, commit)
                    .await?;
            }
        }

        log::debug!(
            "Project {}: restored commits of merged pull request {}",
            run.project_id,
            pull_request.id
        );

        for (branch, commit) in &pins {
            if let Some(commit) = commit {
                if let Err(e) = client
                    .delete_branch(&source.project_key, &source.repo_slug, branch, commit)
                    .await
                {
                    log::warn!(
                        "Project {}: could not delete temporary branch {}: {}",
                        run.project_id,
                        branch,
                        e
                    );
                }
            }
        }

        Ok(())
    }
}

/// Imports pull request comments.
///
/// Comment authors are not mapped to local users yet, so each comment leaves
/// a placeholder reference behind.
pub struct NotesHandler {
    placeholders: SqlitePlaceholderStore,
}

impl NotesHandler {
    pub fn new(placeholders: SqlitePlaceholderStore) -> Self {
        Self { placeholders }
    }
}

#[async_trait]
impl ObjectHandler for NotesHandler {
    async fn handle(
        &self,
        run: &ImportRun,
        client: &BitbucketServerClient,
        pull_request: &PullRequest,
    ) -> Result<(), ImportError> {
        let source = run.source()?;
        let activities: Vec<_> = client
            .activities(&source.project_key, &source.repo_slug, pull_request.id, 0)
            .into_stream()
            .try_filter(|activity| futures::future::ready(activity.is_comment()))
            .try_collect()
            .await?;

        for activity in &activities {
            if let Some(user) = &activity.user {
                self.placeholders
                    .add_reference(run.project_id, &user.name, "Note", activity.id)
                    .await?;
            }
        }

        log::debug!(
            "Project {}: imported {} comment(s) of pull request {}",
            run.project_id,
            activities.len(),
            pull_request.id
        );
        Ok(())
    }
}

/// Downloads the LFS objects of the source repository.
#[async_trait]
pub trait LfsImportService: Send + Sync {
    async fn execute(&self, run: &ImportRun) -> Result<(), ImportError>;
}

/// Message prefix of a failed LFS download in the failure summary.
pub const LFS_FAILURE_PREFIX: &str = "The Lfs import process failed.";

/// Runs the LFS download inline.
///
/// A failed download is recorded for the finish summary and the import
/// carries on without the objects.
pub struct LfsObjectsImporter {
    enabled: bool,
    service: Arc<dyn LfsImportService>,
}

impl LfsObjectsImporter {
    pub fn new(config: &PipelineConfig, service: Arc<dyn LfsImportService>) -> Self {
        Self {
            enabled: config.lfs_enabled,
            service,
        }
    }
}

#[async_trait]
impl EntityImporter for LfsObjectsImporter {
    async fn execute(&self, ctx: &StageContext<'_>) -> Result<Option<WaiterDescriptor>, ImportError> {
        if !self.enabled {
            log::info!("Project {}: LFS is disabled, skipping LFS objects", ctx.project_id());
            return Ok(None);
        }

        match self.service.execute(ctx.run).await {
            Ok(()) => log::info!("Project {}: LFS objects imported", ctx.project_id()),
            Err(e) => {
                let failure =
                    ImportError::importer(format!("{} {}", LFS_FAILURE_PREFIX, e.message()));
                ctx.record_failure(&failure).await?;
            }
        }

        Ok(None)
    }
}
