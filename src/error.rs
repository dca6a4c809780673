//! Error types for Quarry.
//!
//! Defines the main error enum used throughout the engine. Local validation
//! errors (templating, configuration) never reach the query service; remote
//! lifecycle errors always carry the execution id once one exists.

use thiserror::Error;

use crate::service::ServiceError;

/// Main error type for Quarry operations.
#[derive(Error, Debug)]
pub enum QuarryError {
    /// A `${name}` placeholder has no bound parameter.
    #[error("Unbound parameter: ${{{name}}} is referenced but no value was bound")]
    UnboundParameter { name: String },

    /// An identifier parameter failed the identifier-safety pattern.
    #[error("Invalid identifier for parameter '{name}': {value:?}")]
    InvalidIdentifier { name: String, value: String },

    /// A parameter value cannot be rendered as a SQL literal.
    #[error("Invalid value for parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    /// The service rejected the query before running it (syntax, permissions,
    /// workgroup or output location misconfiguration).
    #[error("Query submission rejected: {0}")]
    Submission(#[source] ServiceError),

    /// The execution reached FAILED.
    #[error("Query {execution_id} failed: {reason}")]
    QueryFailed { execution_id: String, reason: String },

    /// The execution reached CANCELLED, by request or interrupt.
    #[error("Query {execution_id} was cancelled: {reason}")]
    QueryCancelled { execution_id: String, reason: String },

    /// A result chunk could not be fetched or parsed.
    #[error("Failed to fetch results of query {execution_id} (chunk {chunk}): {message}")]
    ResultFetch {
        execution_id: String,
        chunk: usize,
        message: String,
    },

    /// Transport or service failure outside submission.
    #[error("Service error{}: {source}", .execution_id.as_deref().map(|id| format!(" (query {id})")).unwrap_or_default())]
    Service {
        execution_id: Option<String>,
        #[source]
        source: ServiceError,
    },

    /// Object storage errors (listing, reading, deleting output objects).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration errors (invalid config file, missing required fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Reading a query file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QuarryError {
    /// Creates a storage error with the given message.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wraps a service error raised while working on a known execution.
    pub fn service(execution_id: impl Into<String>, source: ServiceError) -> Self {
        Self::Service {
            execution_id: Some(execution_id.into()),
            source,
        }
    }

    /// Returns the execution id this error refers to, if any.
    pub fn execution_id(&self) -> Option<&str> {
        match self {
            Self::QueryFailed { execution_id, .. }
            | Self::QueryCancelled { execution_id, .. }
            | Self::ResultFetch { execution_id, .. } => Some(execution_id),
            Self::Service { execution_id, .. } => execution_id.as_deref(),
            _ => None,
        }
    }

    /// Returns true if this error reports a cancelled execution.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::QueryCancelled { .. })
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::UnboundParameter { .. }
            | Self::InvalidIdentifier { .. }
            | Self::InvalidParameter { .. } => "Template Error",
            Self::Submission(_) => "Submission Error",
            Self::QueryFailed { .. } => "Query Failed",
            Self::QueryCancelled { .. } => "Query Cancelled",
            Self::ResultFetch { .. } => "Result Fetch Error",
            Self::Service { .. } => "Service Error",
            Self::Storage(_) => "Storage Error",
            Self::Config(_) => "Configuration Error",
            Self::Io(_) => "I/O Error",
            Self::Internal(_) => "Internal Error",
        }
    }
}

/// Result type alias using QuarryError.
pub type Result<T> = std::result::Result<T, QuarryError>;
