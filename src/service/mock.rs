//! Scripted query service for testing.
//!
//! Plays back a per-execution script of states and result pages, and records
//! every call so tests can assert on how the engine drove the service.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    ExecutionStatus, QueryService, ResultPage, ServiceError, ServiceErrorKind, ServiceResult,
    StartQueryRequest,
};
use crate::execution::{ExecutionStats, QueryState, StatementType};

/// Reason reported for executions stopped through the fake.
const STOPPED_REASON: &str = "Query cancelled by user";

/// Script for one execution.
#[derive(Debug, Clone)]
pub struct ScriptedExecution {
    states: Vec<QueryState>,
    /// Keep reporting the last non-terminal state until stopped.
    until_stopped: bool,
    failure_reason: Option<String>,
    statement_type: StatementType,
    final_stats: ExecutionStats,
    pages: Vec<ResultPage>,
    failing_page: Option<usize>,
}

impl ScriptedExecution {
    /// Reports the given states in order, then repeats the last one.
    pub fn with_states(states: impl IntoIterator<Item = QueryState>) -> Self {
        Self {
            states: states.into_iter().collect(),
            until_stopped: false,
            failure_reason: None,
            statement_type: StatementType::Dml,
            final_stats: ExecutionStats::new(Duration::from_millis(1500), 3 * 1024 * 1024),
            pages: vec![ResultPage::default()],
            failing_page: None,
        }
    }

    /// QUEUED, RUNNING, SUCCEEDED.
    pub fn succeeding() -> Self {
        Self::with_states([QueryState::Queued, QueryState::Running, QueryState::Succeeded])
    }

    /// QUEUED, RUNNING, FAILED with the given reason.
    pub fn failing(reason: impl Into<String>) -> Self {
        let mut script =
            Self::with_states([QueryState::Queued, QueryState::Running, QueryState::Failed]);
        script.failure_reason = Some(reason.into());
        script
    }

    /// QUEUED, then RUNNING until a stop request arrives.
    pub fn running_until_stopped() -> Self {
        let mut script = Self::with_states([QueryState::Queued, QueryState::Running]);
        script.until_stopped = true;
        script
    }

    /// Sets the result pages. Continuation tokens are assigned by the fake.
    pub fn with_pages(mut self, pages: Vec<ResultPage>) -> Self {
        self.pages = pages;
        self
    }

    /// Makes the fetch of page `index` fail.
    pub fn with_failing_page(mut self, index: usize) -> Self {
        self.failing_page = Some(index);
        self
    }

    /// Sets the statement type reported with every status.
    pub fn with_statement_type(mut self, statement_type: StatementType) -> Self {
        self.statement_type = statement_type;
        self
    }

    /// Sets the statistics reported once the execution is terminal.
    pub fn with_final_stats(mut self, stats: ExecutionStats) -> Self {
        self.final_stats = stats;
        self
    }
}

#[derive(Debug)]
struct ExecutionRecord {
    script: ScriptedExecution,
    output_location: Option<String>,
    polls: usize,
    stopped: bool,
    /// Terminal state once one has been reported.
    settled: Option<QueryState>,
    stop_calls: usize,
    page_requests: Vec<Option<String>>,
}

#[derive(Debug, Default)]
struct Inner {
    scripts: VecDeque<ScriptedExecution>,
    executions: HashMap<String, ExecutionRecord>,
    started: Vec<StartQueryRequest>,
    next_id: usize,
    reject_next_start: Option<ServiceError>,
    stop_failure: Option<ServiceError>,
}

/// A [`QueryService`] that plays back scripted executions.
#[derive(Debug, Default)]
pub struct ScriptedQueryService {
    inner: Mutex<Inner>,
}

impl ScriptedQueryService {
    /// Creates a fake with no scripts. Queries started without a queued script
    /// follow [`ScriptedExecution::succeeding`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the script for the next started query.
    pub fn push_execution(&self, script: ScriptedExecution) {
        self.inner().scripts.push_back(script);
    }

    /// Makes the next `start_query` call fail with `error`.
    pub fn reject_next_start(&self, error: ServiceError) {
        self.inner().reject_next_start = Some(error);
    }

    /// Makes every `stop_query` call fail with `error`.
    pub fn fail_stops(&self, error: ServiceError) {
        self.inner().stop_failure = Some(error);
    }

    /// Returns every accepted submission, in order.
    pub fn started_queries(&self) -> Vec<StartQueryRequest> {
        self.inner().started.clone()
    }

    /// Returns how many times the status of `execution_id` was fetched.
    pub fn poll_count(&self, execution_id: &str) -> usize {
        self.inner()
            .executions
            .get(execution_id)
            .map_or(0, |record| record.polls)
    }

    /// Returns how many stop requests `execution_id` received.
    pub fn stop_calls(&self, execution_id: &str) -> usize {
        self.inner()
            .executions
            .get(execution_id)
            .map_or(0, |record| record.stop_calls)
    }

    /// Returns the tokens of every page request for `execution_id`.
    pub fn page_requests(&self, execution_id: &str) -> Vec<Option<String>> {
        self.inner()
            .executions
            .get(execution_id)
            .map(|record| record.page_requests.clone())
            .unwrap_or_default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn unknown_execution(execution_id: &str) -> ServiceError {
    ServiceError::new(
        ServiceErrorKind::InvalidRequest,
        format!("QueryExecution {execution_id} was not found"),
    )
}

fn page_token(index: usize) -> String {
    format!("page-{index}")
}

impl ExecutionRecord {
    fn next_state(&mut self) -> QueryState {
        if let Some(state) = self.settled {
            return state;
        }

        let script = &self.script;
        let step = self.polls.min(script.states.len().saturating_sub(1));
        let scripted = script
            .states
            .get(step)
            .copied()
            .unwrap_or(QueryState::Succeeded);
        self.polls += 1;

        let state = if self.stopped {
            QueryState::Cancelled
        } else {
            scripted
        };
        if state.is_terminal() {
            self.settled = Some(state);
        }
        state
    }

    fn status(&mut self, execution_id: &str) -> ExecutionStatus {
        let state = self.next_state();
        let mut status = ExecutionStatus::new(state);
        status.statement_type = Some(self.script.statement_type);
        status.output_location = self
            .output_location
            .as_ref()
            .map(|location| format!("{}/{}.csv", location.trim_end_matches('/'), execution_id));
        status.stats = if state.is_terminal() {
            self.script.final_stats
        } else {
            ExecutionStats::new(Duration::from_millis(100 * self.polls as u64), 0)
        };
        status.state_change_reason = match state {
            QueryState::Failed => self.script.failure_reason.clone(),
            QueryState::Cancelled => Some(STOPPED_REASON.to_string()),
            _ => None,
        };
        status
    }
}

#[async_trait]
impl QueryService for ScriptedQueryService {
    async fn start_query(&self, request: &StartQueryRequest) -> ServiceResult<String> {
        let mut inner = self.inner();
        if let Some(error) = inner.reject_next_start.take() {
            return Err(error);
        }

        inner.next_id += 1;
        let id = format!("query-{}", inner.next_id);
        let script = inner
            .scripts
            .pop_front()
            .unwrap_or_else(ScriptedExecution::succeeding);

        inner.executions.insert(
            id.clone(),
            ExecutionRecord {
                script,
                output_location: request.output_location.clone(),
                polls: 0,
                stopped: false,
                settled: None,
                stop_calls: 0,
                page_requests: Vec::new(),
            },
        );
        inner.started.push(request.clone());
        Ok(id)
    }

    async fn get_execution(&self, execution_id: &str) -> ServiceResult<ExecutionStatus> {
        let mut inner = self.inner();
        let record = inner
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| unknown_execution(execution_id))?;
        Ok(record.status(execution_id))
    }

    async fn get_result_page(
        &self,
        execution_id: &str,
        token: Option<&str>,
        page_size: usize,
    ) -> ServiceResult<ResultPage> {
        let mut inner = self.inner();
        let record = inner
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| unknown_execution(execution_id))?;
        record.page_requests.push(token.map(str::to_string));

        if record.settled != Some(QueryState::Succeeded) {
            return Err(ServiceError::new(
                ServiceErrorKind::InvalidRequest,
                format!("Query has not yet finished. Current state: {execution_id}"),
            ));
        }

        let index = match token {
            None => 0,
            Some(token) => token
                .strip_prefix("page-")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| {
                    ServiceError::new(
                        ServiceErrorKind::InvalidRequest,
                        format!("Invalid NextToken: {token}"),
                    )
                })?,
        };

        if record.script.failing_page == Some(index) {
            return Err(ServiceError::new(
                ServiceErrorKind::Internal,
                format!("page {index} is unavailable"),
            ));
        }

        let pages = &record.script.pages;
        let mut page = pages.get(index).cloned().unwrap_or_default();
        page.rows.truncate(page_size.max(1));
        page.next_token = (index + 1 < pages.len()).then(|| page_token(index + 1));
        Ok(page)
    }

    async fn stop_query(&self, execution_id: &str) -> ServiceResult<()> {
        let mut inner = self.inner();
        let failure = inner.stop_failure.clone();
        let record = inner
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| unknown_execution(execution_id))?;
        record.stop_calls += 1;

        if let Some(error) = failure {
            return Err(error);
        }
        if record.settled.is_none() {
            record.stopped = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ColumnMetadata;

    fn request() -> StartQueryRequest {
        StartQueryRequest {
            sql: "SELECT 1".to_string(),
            workgroup: "primary".to_string(),
            database: None,
            output_location: Some("s3://results/".to_string()),
        }
    }

    #[tokio::test]
    async fn test_scripted_states_then_settles() {
        let service = ScriptedQueryService::new();
        service.push_execution(ScriptedExecution::succeeding());
        let id = service.start_query(&request()).await.unwrap();

        let mut states = Vec::new();
        for _ in 0..5 {
            states.push(service.get_execution(&id).await.unwrap().state);
        }

        assert_eq!(
            states,
            vec![
                QueryState::Queued,
                QueryState::Running,
                QueryState::Succeeded,
                QueryState::Succeeded,
                QueryState::Succeeded,
            ]
        );
        assert_eq!(service.poll_count(&id), 3);
    }

    #[tokio::test]
    async fn test_stop_cancels_running_execution() {
        let service = ScriptedQueryService::new();
        service.push_execution(ScriptedExecution::running_until_stopped());
        let id = service.start_query(&request()).await.unwrap();

        assert_eq!(service.get_execution(&id).await.unwrap().state, QueryState::Queued);
        assert_eq!(service.get_execution(&id).await.unwrap().state, QueryState::Running);
        assert_eq!(service.get_execution(&id).await.unwrap().state, QueryState::Running);

        service.stop_query(&id).await.unwrap();
        let status = service.get_execution(&id).await.unwrap();
        assert_eq!(status.state, QueryState::Cancelled);
        assert_eq!(status.state_change_reason.as_deref(), Some(STOPPED_REASON));
    }

    #[tokio::test]
    async fn test_pages_are_token_chained() {
        let page = |value: &str| ResultPage {
            columns: vec![ColumnMetadata::new("v", "varchar")],
            rows: vec![vec![Some(value.to_string())]],
            next_token: None,
        };
        let service = ScriptedQueryService::new();
        service.push_execution(
            ScriptedExecution::with_states([QueryState::Succeeded])
                .with_pages(vec![page("a"), page("b")]),
        );
        let id = service.start_query(&request()).await.unwrap();
        service.get_execution(&id).await.unwrap();

        let first = service.get_result_page(&id, None, 10).await.unwrap();
        assert_eq!(first.next_token.as_deref(), Some("page-1"));
        let second = service
            .get_result_page(&id, first.next_token.as_deref(), 10)
            .await
            .unwrap();
        assert_eq!(second.rows, vec![vec![Some("b".to_string())]]);
        assert!(second.next_token.is_none());
    }

    #[tokio::test]
    async fn test_unknown_execution_is_invalid_request() {
        let service = ScriptedQueryService::new();
        let err = service.get_execution("nope").await.unwrap_err();
        assert_eq!(err.kind, ServiceErrorKind::InvalidRequest);
    }
}
