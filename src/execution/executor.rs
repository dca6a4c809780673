//! Submission and polling of remote executions.
//!
//! [`QueryExecutor::await_completion`] is the only place an execution is
//! mutated. It races the sleep between polls against the handle's
//! cancellation token so an explicit cancel or a host interrupt is acted on
//! at the next tick boundary.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{QuarryError, Result};
use crate::service::{QueryService, ServiceErrorKind, StartQueryRequest};

use super::{QueryExecution, QueryState};

/// Reason reported when the caller cancels and the service gives none.
const CALLER_CANCEL_REASON: &str = "cancelled by caller";

/// Handle to a submitted execution.
///
/// Clones share the same snapshot and cancellation token, so one clone can be
/// polled while another is used to observe progress or cancel.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    snapshot: Arc<watch::Sender<QueryExecution>>,
    cancel: CancellationToken,
}

impl ExecutionHandle {
    fn new(execution: QueryExecution, cancel: CancellationToken) -> Self {
        let (tx, _rx) = watch::channel(execution);
        Self {
            snapshot: Arc::new(tx),
            cancel,
        }
    }

    /// Returns the execution id.
    pub fn id(&self) -> String {
        self.snapshot.borrow().id.clone()
    }

    /// Returns the execution as of the last completed poll.
    pub fn snapshot(&self) -> QueryExecution {
        self.snapshot.borrow().clone()
    }

    /// Subscribes to snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<QueryExecution> {
        self.snapshot.subscribe()
    }

    /// Requests cancellation. The polling loop issues the remote cancel.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns the token the polling loop observes.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn publish(&self, execution: QueryExecution) {
        self.snapshot.send_replace(execution);
    }
}

/// Submits queries and drives them to a terminal state.
#[derive(Clone)]
pub struct QueryExecutor {
    service: Arc<dyn QueryService>,
    workgroup: String,
    output_location: Option<String>,
}

impl QueryExecutor {
    /// Creates a new executor bound to a workgroup and result location.
    pub fn new(
        service: Arc<dyn QueryService>,
        workgroup: impl Into<String>,
        output_location: Option<String>,
    ) -> Self {
        Self {
            service,
            workgroup: workgroup.into(),
            output_location,
        }
    }

    /// Returns the underlying service.
    pub fn service(&self) -> &Arc<dyn QueryService> {
        &self.service
    }

    /// Submits a query. Makes a single remote call and returns immediately
    /// with the execution in QUEUED.
    ///
    /// `cancel` is observed by [`await_completion`](Self::await_completion);
    /// pass a child of a host-level token to have interrupts cancel the query.
    pub async fn submit(
        &self,
        sql: &str,
        database: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<ExecutionHandle> {
        debug!("Submitting query to workgroup {}:\n{}", self.workgroup, sql);

        let request = StartQueryRequest {
            sql: sql.to_string(),
            workgroup: self.workgroup.clone(),
            database: database.map(str::to_string),
            output_location: self.output_location.clone(),
        };

        let id = self.service.start_query(&request).await.map_err(|e| {
            if e.is_rejection() {
                QuarryError::Submission(e)
            } else {
                QuarryError::Service {
                    execution_id: None,
                    source: e,
                }
            }
        })?;

        info!("Query with id `{}` has been run", id);
        let execution = QueryExecution::submitted(id, self.output_location.clone());
        Ok(ExecutionHandle::new(execution, cancel))
    }

    /// Polls the execution until it reaches a terminal state.
    ///
    /// Returns the final execution on SUCCEEDED. On FAILED returns
    /// [`QuarryError::QueryFailed`]. Once cancellation has been requested the
    /// loop issues one remote cancel and keeps polling until the execution is
    /// terminal, then returns [`QuarryError::QueryCancelled`] whatever the
    /// terminal state turned out to be.
    pub async fn await_completion(
        &self,
        handle: &ExecutionHandle,
        poll_interval: Duration,
    ) -> Result<QueryExecution> {
        let mut execution = handle.snapshot();
        let mut cancel_requested = false;
        let mut stop_failure: Option<String> = None;
        let mut polls: u64 = 0;

        loop {
            if !cancel_requested && handle.cancel.is_cancelled() {
                cancel_requested = true;
                info!("Cancel query with id `{}`", execution.id);
                if let Err(e) = self.service.stop_query(&execution.id).await {
                    warn!(
                        "Failed to cancel query `{}`, polling until it finishes: {}",
                        execution.id, e
                    );
                    stop_failure = Some(e.to_string());
                }
            }

            let status = self
                .service
                .get_execution(&execution.id)
                .await
                .map_err(|e| QuarryError::service(&execution.id, e))?;
            polls += 1;

            let previous = execution.state;
            execution.apply(status);
            handle.publish(execution.clone());

            if execution.state != previous {
                debug!(
                    "Query `{}` moved {} -> {} after {:?}",
                    execution.id, previous, execution.state, execution.stats.elapsed
                );
            }

            if execution.is_terminal() {
                debug!("Query `{}` terminal after {} polls", execution.id, polls);
                return self.finish(execution, cancel_requested, stop_failure);
            }

            if cancel_requested {
                tokio::time::sleep(poll_interval).await;
            } else {
                tokio::select! {
                    biased;
                    _ = handle.cancel.cancelled() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }

    /// Submits a query and waits for it to succeed.
    pub async fn run(
        &self,
        sql: &str,
        database: Option<&str>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<QueryExecution> {
        let handle = self.submit(sql, database, cancel).await?;
        self.await_completion(&handle, poll_interval).await
    }

    /// Cancels an execution out of band.
    ///
    /// Cancelling an execution that is already terminal is a no-op.
    pub async fn cancel_query(&self, execution_id: &str) -> Result<()> {
        let status = self
            .service
            .get_execution(execution_id)
            .await
            .map_err(|e| QuarryError::service(execution_id, e))?;

        if status.state.is_terminal() {
            debug!(
                "Query `{}` already {}, nothing to cancel",
                execution_id, status.state
            );
            return Ok(());
        }

        info!("Cancel query with id `{}`", execution_id);
        match self.service.stop_query(execution_id).await {
            Ok(()) => Ok(()),
            // Finished between the status check and the stop request.
            Err(e) if e.kind == ServiceErrorKind::InvalidRequest => {
                debug!("Stop of `{}` rejected: {}", execution_id, e);
                Ok(())
            }
            Err(e) => Err(QuarryError::service(execution_id, e)),
        }
    }

    fn finish(
        &self,
        execution: QueryExecution,
        cancel_requested: bool,
        stop_failure: Option<String>,
    ) -> Result<QueryExecution> {
        if cancel_requested || execution.state == QueryState::Cancelled {
            let reason = execution
                .state_change_reason
                .unwrap_or_else(|| CALLER_CANCEL_REASON.to_string());
            return Err(QuarryError::QueryCancelled {
                reason: match stop_failure {
                    Some(e) => format!("{reason} (remote cancel failed: {e})"),
                    None => reason,
                },
                execution_id: execution.id,
            });
        }

        match execution.state {
            QueryState::Succeeded => {
                info!(
                    "Query execution time: {} sec",
                    execution.stats.elapsed.as_secs_f64().round()
                );
                info!("Data scanned: {} mb", execution.stats.scanned_mib());
                Ok(execution)
            }
            QueryState::Failed => Err(QuarryError::QueryFailed {
                reason: execution
                    .state_change_reason
                    .unwrap_or_else(|| "no reason reported".to_string()),
                execution_id: execution.id,
            }),
            state => Err(QuarryError::internal(format!(
                "Query `{}` finished polling in state {}",
                execution.id, state
            ))),
        }
    }
}
