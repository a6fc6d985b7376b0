//! Full import run against a mock Bitbucket Server.
//!
//! Drives an import through repository, pull request, notes and LFS stages
//! with the job runner, the way a background worker would:
//! 1. The repository stage runs inline
//! 2. Pull requests and notes fan out one sub-job per pull request
//! 3. LFS objects are downloaded inline
//! 4. Finish waits for the comment authors to be mapped, then closes the run

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use import_pipeline::config::PipelineConfig;
use import_pipeline::db::pool::DbPool;
use import_pipeline::error::ImportError;
use import_pipeline::models::{ImportRun, ImportSource, NewImportRun, Stage};
use import_pipeline::services::import_cache;
use import_pipeline::services::import_log::{self, IMPORT_FINISHED, STAGE_COMPLETED};
use import_pipeline::services::import_state;
use import_pipeline::services::importers::{
    CollectionImporter, CollectionKind, LfsImportService, LfsObjectsImporter, NotesHandler,
    PullRequestHandler, RepositoryImporter,
};
use import_pipeline::services::job_queue::SqliteJobQueue;
use import_pipeline::services::placeholder_store::{PlaceholderReferenceStore, SqlitePlaceholderStore};
use import_pipeline::services::stage_worker::{EntityImporter, StageChain};
use import_pipeline::{JobRunner, Pipeline};
use mockito::Matcher;
use serde_json::json;
use tempfile::{tempdir, TempDir};

const PROJECT: i64 = 3;
const REPO_PATH: &str = "/rest/api/1.0/projects/PRJ/repos/demo";

#[derive(Default)]
struct FakeLfs {
    downloads: AtomicUsize,
}

#[async_trait::async_trait]
impl LfsImportService for FakeLfs {
    async fn execute(&self, _run: &ImportRun) -> Result<(), ImportError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn pull_request(id: i64, state: &str) -> serde_json::Value {
    json!({
        "id": id,
        "title": format!("Pull request {}", id),
        "state": state,
        "createdDate": 1_500_000_000_000_i64,
        "updatedDate": 1_500_000_100_000_i64,
        "fromRef": {"id": "refs/heads/feature-1", "displayId": "feature-1", "latestCommit": "aaa111"},
        "toRef": {"id": "refs/heads/main", "displayId": "main", "latestCommit": "bbb222"},
        "author": {"user": {"name": "jdoe"}}
    })
}

async fn mock_bitbucket(server: &mut mockito::ServerGuard) -> Vec<mockito::Mock> {
    let mut mocks = Vec::new();

    mocks.push(
        server
            .mock("GET", REPO_PATH)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({"id": 1, "slug": "demo", "name": "Demo", "project": {"key": "PRJ"}})
                    .to_string(),
            )
            .expect(1)
            .create_async()
            .await,
    );

    // Listed once by the pull request stage and once by the notes stage.
    mocks.push(
        server
            .mock("GET", format!("{}/pull-requests", REPO_PATH).as_str())
            .match_query(Matcher::UrlEncoded("start".into(), "0".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "values": [
                        pull_request(1, "MERGED"),
                        pull_request(2, "OPEN"),
                        pull_request(3, "DECLINED")
                    ],
                    "isLastPage": true
                })
                .to_string(),
            )
            .expect(2)
            .create_async()
            .await,
    );

    for id in 1..=3 {
        mocks.push(
            server
                .mock(
                    "GET",
                    format!("{}/pull-requests/{}/activities", REPO_PATH, id).as_str(),
                )
                .match_query(Matcher::Any)
                .with_status(200)
                .with_header("content-type", "application/json")
                .with_body(
                    json!({
                        "values": [
                            {"id": id * 10, "action": "COMMENTED", "createdDate": 1, "user": {"name": "jdoe"}, "comment": {"text": "LGTM"}},
                            {"id": id * 10 + 1, "action": "APPROVED", "createdDate": 2, "user": {"name": "asmith"}}
                        ],
                        "isLastPage": true
                    })
                    .to_string(),
                )
                .expect(1)
                .create_async()
                .await,
        );
    }

    // Only the merged pull request needs its commits pinned.
    mocks.push(
        server
            .mock("POST", format!("{}/branches", REPO_PATH).as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"displayId": "gitlab/import/pull-request/1/from"}"#)
            .expect(2)
            .create_async()
            .await,
    );
    mocks.push(
        server
            .mock("DELETE", "/rest/branch-utils/1.0/projects/PRJ/repos/demo/branches")
            .with_status(204)
            .expect(2)
            .create_async()
            .await,
    );

    mocks
}

async fn setup(
    server: &mockito::ServerGuard,
    lfs: Arc<FakeLfs>,
) -> (TempDir, DbPool, Arc<Pipeline>, NewImportRun) {
    let dir = tempdir().unwrap();
    let pool = import_pipeline::db::initialize(&dir.path().join("test.db"))
        .await
        .unwrap();

    let config = PipelineConfig {
        page_length: 2,
        request_timeout_secs: 5,
        ..PipelineConfig::default()
    };
    let placeholders = SqlitePlaceholderStore::new(pool.clone());

    let chain = StageChain::new(vec![
        (
            Stage::Repository,
            Arc::new(RepositoryImporter::new(config.clone())) as Arc<dyn EntityImporter>,
        ),
        (
            Stage::PullRequests,
            Arc::new(CollectionImporter::new(
                CollectionKind::PullRequests,
                pool.clone(),
                config.clone(),
                Arc::new(PullRequestHandler),
            )) as Arc<dyn EntityImporter>,
        ),
        (
            Stage::Notes,
            Arc::new(CollectionImporter::new(
                CollectionKind::PullRequestNotes,
                pool.clone(),
                config.clone(),
                Arc::new(NotesHandler::new(placeholders)),
            )) as Arc<dyn EntityImporter>,
        ),
        (
            Stage::LfsObjects,
            Arc::new(LfsObjectsImporter::new(&config, lfs)) as Arc<dyn EntityImporter>,
        ),
    ])
    .unwrap();

    let pipeline = Arc::new(Pipeline::builder(pool.clone(), chain).config(config).build());
    let run = NewImportRun {
        project_id: PROJECT,
        source: ImportSource {
            base_url: server.url(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            project_key: "PRJ".to_string(),
            repo_slug: "demo".to_string(),
        },
    };

    (dir, pool, pipeline, run)
}

#[tokio::test]
async fn test_full_import_run() {
    let mut server = mockito::Server::new_async().await;
    let mocks = mock_bitbucket(&mut server).await;
    let lfs = Arc::new(FakeLfs::default());
    let (_dir, pool, pipeline, run) = setup(&server, lfs.clone()).await;
    let runner = JobRunner::new(pipeline.clone(), SqliteJobQueue::new(pool.clone()));
    let placeholders = SqlitePlaceholderStore::new(pool.clone());

    let scheduled = pipeline.schedule_import(run).await.unwrap();
    assert_eq!(scheduled.status, "scheduled");
    assert!(pipeline.start_import(PROJECT).await.unwrap());
    assert!(!pipeline.start_import(PROJECT).await.unwrap());

    runner.drain().await.unwrap();

    // Everything is imported; only the comment authors are left unmapped.
    let run = import_state::get_import_run(&pool, PROJECT).await.unwrap();
    assert_eq!(run.status, "started");
    assert_eq!(
        import_cache::imported_count(&pool, PROJECT, CollectionKind::PullRequests.cache_kind())
            .await
            .unwrap(),
        3
    );
    assert_eq!(
        import_cache::imported_count(&pool, PROJECT, CollectionKind::PullRequestNotes.cache_kind())
            .await
            .unwrap(),
        3
    );
    assert_eq!(placeholders.count(PROJECT).await.unwrap(), 3);
    assert_eq!(placeholders.resolution_requests(PROJECT).await.unwrap(), 1);

    for mock in &mocks {
        mock.assert_async().await;
    }

    placeholders.resolve_user(PROJECT, "jdoe").await.unwrap();
    runner
        .drain_at(chrono::Utc::now().timestamp() + 60)
        .await
        .unwrap();

    let run = import_state::get_import_run(&pool, PROJECT).await.unwrap();
    assert_eq!(run.status, "finished");
    assert!(run.last_error.is_none());
    assert_eq!(lfs.downloads.load(Ordering::SeqCst), 1);

    let events = import_log::events_for_project(&pool, PROJECT, 20).await.unwrap();
    let stages: Vec<_> = events
        .iter()
        .rev()
        .filter(|e| e.operation == STAGE_COMPLETED)
        .filter_map(|e| e.message.clone())
        .collect();
    assert_eq!(stages, vec!["repository", "pull_requests", "notes", "lfs_objects"]);
    assert_eq!(import_log::count_events(&pool, IMPORT_FINISHED).await.unwrap(), 1);

    // Transient barrier state is gone once the run is finished.
    assert_eq!(
        import_cache::imported_count(&pool, PROJECT, CollectionKind::PullRequests.cache_kind())
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_cannot_schedule_while_running() {
    let server = mockito::Server::new_async().await;
    let (_dir, _pool, pipeline, run) = setup(&server, Arc::new(FakeLfs::default())).await;

    pipeline.schedule_import(run.clone()).await.unwrap();
    assert!(pipeline.schedule_import(run).await.is_err());
}
