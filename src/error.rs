//! Pipeline error types.
//!
//! These errors are serializable so job rows and failure records can carry a
//! structured description of what went wrong.

use serde::Serialize;
use thiserror::Error;

use crate::services::connection::ConnectionError;

/// Pipeline-level errors returned by stages, sub-jobs and stores.
///
/// All variants serialize to a structured JSON object.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum ImportError {
    /// Database operation failed.
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation: Option<String>,
    },

    /// Remote source system request failed.
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },

    /// An entity importer failed.
    #[error("Importer error: {message}")]
    Importer {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
        /// Fatal errors abort the import instead of being retried.
        fatal: bool,
    },

    /// Requested resource not found.
    #[error("Not found: {resource}")]
    NotFound {
        resource: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// Invalid input provided.
    #[error("Invalid input: {message}")]
    InvalidInput {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },

    /// Persisted coordination state is inconsistent.
    #[error("Integrity error: {message}")]
    Integrity { message: String },

    /// Internal pipeline error.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ImportError {
    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            operation: None,
        }
    }

    /// Create a database error with operation context.
    pub fn database_with_op(message: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            operation: Some(operation.into()),
        }
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            status_code: None,
            endpoint: None,
        }
    }

    /// Create a connection error with status code and endpoint.
    pub fn connection_full(
        message: impl Into<String>,
        status_code: u16,
        endpoint: impl Into<String>,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            status_code: Some(status_code),
            endpoint: Some(endpoint.into()),
        }
    }

    /// Create a retryable importer error.
    pub fn importer(message: impl Into<String>) -> Self {
        Self::Importer {
            message: message.into(),
            stage: None,
            fatal: false,
        }
    }

    /// Create a fatal importer error that aborts the import.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Importer {
            message: message.into(),
            stage: None,
            fatal: true,
        }
    }

    /// Attach the stage name to an importer error. Other variants are returned unchanged.
    pub fn in_stage(self, stage_name: impl Into<String>) -> Self {
        match self {
            Self::Importer {
                message,
                stage: None,
                fatal,
            } => Self::Importer {
                message,
                stage: Some(stage_name.into()),
                fatal,
            },
            other => other,
        }
    }

    /// Create a not found error.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: None,
        }
    }

    /// Create a not found error with ID.
    pub fn not_found_with_id(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: Some(id.into()),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            field: None,
        }
    }

    /// Create an invalid input error with field name.
    pub fn invalid_input_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create an integrity error.
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether retrying the failed job can never succeed.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Importer { fatal, .. } => *fatal,
            Self::InvalidInput { .. } | Self::Integrity { .. } => true,
            _ => false,
        }
    }

    /// The error message without the variant prefix.
    pub fn message(&self) -> String {
        match self {
            Self::Database { message, .. }
            | Self::Connection { message, .. }
            | Self::Importer { message, .. }
            | Self::InvalidInput { message, .. }
            | Self::Integrity { message }
            | Self::Internal { message } => message.clone(),
            Self::NotFound { .. } => self.to_string(),
        }
    }

    /// Short machine-readable name of the variant, used as the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Database { .. } => "database",
            Self::Connection { .. } => "connection",
            Self::Importer { .. } => "importer",
            Self::NotFound { .. } => "not_found",
            Self::InvalidInput { .. } => "invalid_input",
            Self::Integrity { .. } => "integrity",
            Self::Internal { .. } => "internal",
        }
    }
}

// Conversions from common error types

impl From<sqlx::Error> for ImportError {
    fn from(err: sqlx::Error) -> Self {
        Self::database(err.to_string())
    }
}

impl From<serde_json::Error> for ImportError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("JSON error: {}", err))
    }
}

impl From<crate::db::DbError> for ImportError {
    fn from(err: crate::db::DbError) -> Self {
        Self::database(err.to_string())
    }
}

impl From<ConnectionError> for ImportError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Status {
                status_code,
                endpoint,
                message,
            } => Self::connection_full(message, status_code, endpoint),
            other => Self::connection(other.to_string()),
        }
    }
}
