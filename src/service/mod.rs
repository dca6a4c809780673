//! Query service abstraction for Quarry.
//!
//! Provides a trait-based interface to the remote query service, allowing the
//! real Athena client and the scripted test fake to be used interchangeably.

mod athena;
mod mock;

pub use athena::{AthenaClient, AthenaConfig};
pub use mock::{ScriptedExecution, ScriptedQueryService};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::execution::{ExecutionStats, QueryState, StatementType};

/// Maximum rows the service returns per result page.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Trait defining the calls the engine makes against the query service.
///
/// Implementations must not retry: transient failures are surfaced to the
/// engine, which surfaces them to the caller.
#[async_trait]
pub trait QueryService: Send + Sync {
    /// Starts a query and returns the execution id assigned by the service.
    async fn start_query(&self, request: &StartQueryRequest) -> ServiceResult<String>;

    /// Fetches the current status and statistics of an execution.
    async fn get_execution(&self, execution_id: &str) -> ServiceResult<ExecutionStatus>;

    /// Fetches one page of results. `token` is `None` for the first page.
    async fn get_result_page(
        &self,
        execution_id: &str,
        token: Option<&str>,
        page_size: usize,
    ) -> ServiceResult<ResultPage>;

    /// Requests cancellation of an execution.
    async fn stop_query(&self, execution_id: &str) -> ServiceResult<()>;
}

/// Parameters of a query submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartQueryRequest {
    /// Final SQL text.
    pub sql: String,
    /// Workgroup the execution is queued and billed under.
    pub workgroup: String,
    /// Database the query runs against, when the SQL does not qualify names.
    pub database: Option<String>,
    /// Where the service writes the result set.
    pub output_location: Option<String>,
}

/// Status of an execution as reported by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionStatus {
    pub state: QueryState,
    /// Service-provided explanation for the latest state change.
    pub state_change_reason: Option<String>,
    pub statement_type: Option<StatementType>,
    pub output_location: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub stats: ExecutionStats,
}

impl ExecutionStatus {
    /// Creates a status with the given state and no other information.
    pub fn new(state: QueryState) -> Self {
        Self {
            state,
            state_change_reason: None,
            statement_type: None,
            output_location: None,
            submitted_at: None,
            stats: ExecutionStats::default(),
        }
    }
}

/// Column metadata as declared by the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    /// Declared SQL type, e.g. `varchar`, `bigint`, `date`.
    pub declared_type: String,
}

impl ColumnMetadata {
    /// Creates column metadata with the given name and declared type.
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declared_type: declared_type.into(),
        }
    }
}

/// One page of a paginated result set. Cells are raw strings; `None` is NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPage {
    pub columns: Vec<ColumnMetadata>,
    pub rows: Vec<Vec<Option<String>>>,
    /// Continuation token; absent on the last page.
    pub next_token: Option<String>,
}

/// Category of a service failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorKind {
    /// The request was malformed or referenced something invalid.
    InvalidRequest,
    /// The caller is not permitted to perform the request.
    AccessDenied,
    /// The service is rate-limiting the caller.
    Throttled,
    /// The request never got a well-formed response.
    Transport,
    /// The service reported an internal failure.
    Internal,
}

impl fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidRequest => "invalid request",
            Self::AccessDenied => "access denied",
            Self::Throttled => "throttled",
            Self::Transport => "transport",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Error returned by [`QueryService`] implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub message: String,
}

impl ServiceError {
    /// Creates a service error of the given kind.
    pub fn new(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Returns true when the service rejected the request itself, as opposed to
    /// failing to answer it.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.kind,
            ServiceErrorKind::InvalidRequest | ServiceErrorKind::AccessDenied
        )
    }
}

/// Result type for service calls.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;
