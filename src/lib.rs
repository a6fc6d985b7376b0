//! Import Pipeline - staged, resumable project imports from Bitbucket Server.
//!
//! An import runs as a chain of stages. Each stage may fan out sub-jobs; a
//! persisted barrier schedules the next stage once they all report back, and
//! the finalizer closes the run when placeholder references have drained.
//! All coordination state lives in SQLite, so any process can pick up a job.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;

pub use config::PipelineConfig;
pub use error::ImportError;
pub use services::{JobRunner, Pipeline, StageChain};
