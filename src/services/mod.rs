//! Import pipeline services.
//!
//! Leaves first: retry and HTTP plumbing, then persistence helpers, then the
//! barrier, stage driver and finalizer that the [`pipeline::Pipeline`] wires
//! together and the [`job_runner::JobRunner`] drives.

pub mod bitbucket_client;
pub mod connection;
pub mod failure_tracker;
pub mod finalizer;
pub mod import_cache;
pub mod import_log;
pub mod import_state;
pub mod importers;
pub mod job_queue;
pub mod job_runner;
pub mod job_waiter;
pub mod pagination;
pub mod pipeline;
pub mod placeholder_store;
pub mod retry;
pub mod stage_worker;

pub use bitbucket_client::BitbucketServerClient;
pub use connection::{Connection, ConnectionConfig, ConnectionError};
pub use failure_tracker::{FailureTracker, SqliteFailureTracker};
pub use finalizer::{FinishOutcome, Finalizer};
pub use job_queue::{Scheduler, SqliteJobQueue};
pub use job_runner::JobRunner;
pub use job_waiter::JobWaiter;
pub use pagination::{Collection, Paginator};
pub use pipeline::Pipeline;
pub use placeholder_store::{PlaceholderReferenceStore, SqlitePlaceholderStore};
pub use retry::RetryWithDelay;
pub use stage_worker::{EntityImporter, StageChain, StageContext, StageOutcome, StageWorker};

/// Current Unix timestamp in seconds.
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
