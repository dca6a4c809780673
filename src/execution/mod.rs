//! Query execution state machine.
//!
//! Submits SQL to the query service and tracks each execution through
//! `QUEUED`/`RUNNING` to one of the terminal states, reacting to cancellation
//! requests along the way.

mod executor;
mod state;

pub use executor::{ExecutionHandle, QueryExecutor};
pub use state::{ExecutionStats, QueryExecution, QueryState, StatementType};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancels `token` when the process receives Ctrl-C.
///
/// The host decides when interrupts should cancel queries; the engine only
/// observes the token. Drop or abort the returned handle to stop listening.
pub fn cancel_on_ctrl_c(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => {
                    info!("Interrupt received, cancelling in-flight queries");
                    token.cancel();
                }
                Err(e) => warn!("Could not listen for Ctrl-C: {}", e),
            }
        }
    })
}
