//! Execution state types.
//!
//! A [`QueryExecution`] is created on submission and afterwards only mutated
//! by its polling loop. Once a terminal state is recorded it never changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Bytes in one MiB.
const MIB: u64 = 1024 * 1024;

/// Bytes in one TiB.
const TIB: f64 = (1024u64 * 1024 * 1024 * 1024) as f64;

/// The service bills at least this many bytes per query.
const MIN_BILLED_BYTES: u64 = 10 * MIB;

/// Lifecycle state of a remote execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl QueryState {
    /// Returns the state as the service spells it.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Returns true for SUCCEEDED, FAILED and CANCELLED.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for QueryState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("Unknown query state: {other}")),
        }
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of statement the service ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatementType {
    /// Schema statements: CREATE, DROP, SHOW, ...
    Ddl,
    /// Data statements: SELECT, CTAS, INSERT INTO.
    Dml,
    /// EXPLAIN, DESCRIBE, ...
    Utility,
}

impl FromStr for StatementType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "DDL" => Ok(Self::Ddl),
            "DML" => Ok(Self::Dml),
            "UTILITY" => Ok(Self::Utility),
            other => Err(format!("Unknown statement type: {other}")),
        }
    }
}

/// Statistics snapshot of an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Total time the service has spent on the execution so far.
    pub elapsed: Duration,
    /// Bytes read from storage so far.
    pub bytes_scanned: u64,
}

impl ExecutionStats {
    /// Creates a stats snapshot.
    pub fn new(elapsed: Duration, bytes_scanned: u64) -> Self {
        Self {
            elapsed,
            bytes_scanned,
        }
    }

    /// Estimated cost of the scan in USD at `price_per_tib` per TiB, applying
    /// the per-query billing minimum.
    pub fn estimated_cost(&self, price_per_tib: f64) -> f64 {
        let billed = self.bytes_scanned.max(MIN_BILLED_BYTES);
        billed as f64 / TIB * price_per_tib
    }

    /// Bytes scanned expressed in whole MiB.
    pub fn scanned_mib(&self) -> u64 {
        (self.bytes_scanned + MIB / 2) / MIB
    }
}

/// One server-side run of a submitted query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryExecution {
    /// Opaque id assigned by the service.
    pub id: String,
    pub state: QueryState,
    pub submitted_at: DateTime<Utc>,
    pub output_location: Option<String>,
    pub statement_type: Option<StatementType>,
    /// Explanation of the latest state change, e.g. a failure message.
    pub state_change_reason: Option<String>,
    pub stats: ExecutionStats,
}

impl QueryExecution {
    /// Creates the record of a freshly submitted execution.
    pub fn submitted(id: impl Into<String>, output_location: Option<String>) -> Self {
        Self {
            id: id.into(),
            state: QueryState::Queued,
            submitted_at: Utc::now(),
            output_location,
            statement_type: None,
            state_change_reason: None,
            stats: ExecutionStats::default(),
        }
    }

    /// Returns true once the execution reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Applies a status report from the service.
    ///
    /// Returns false and leaves the record untouched when it is already
    /// terminal.
    pub fn apply(&mut self, status: crate::service::ExecutionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = status.state;
        self.stats = status.stats;
        if let Some(at) = status.submitted_at {
            self.submitted_at = at;
        }
        if status.output_location.is_some() {
            self.output_location = status.output_location;
        }
        if status.statement_type.is_some() {
            self.statement_type = status.statement_type;
        }
        if status.state_change_reason.is_some() {
            self.state_change_reason = status.state_change_reason;
        }
        true
    }
}
