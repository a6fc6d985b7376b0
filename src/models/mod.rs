//! Data models for the pipeline.
//!
//! These models represent the rows stored in the SQLite coordination store
//! and the payloads passed between workers.
//!
//! Row models derive Serialize and FromRow for SQLx database queries.

pub mod import_event;
pub mod import_run;
pub mod job;
pub mod representation;
pub mod stage;
pub mod waiter;

// Re-exports for convenient access
pub use import_event::{EventStatus, ImportEvent, ImportFailure};
pub use import_run::{ImportRun, ImportSource, ImportStatus, NewImportRun};
pub use job::{Job, JobStatus, ScheduledJob};
pub use representation::{Activity, PullRequest, PullRequestRef, Repository};
pub use stage::Stage;
pub use waiter::{JobWaiterRecord, WaiterDescriptor, WaiterKey};
