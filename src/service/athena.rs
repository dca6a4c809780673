//! Athena query service client.
//!
//! Speaks Athena's JSON 1.1 protocol over HTTPS. Requests are sent unsigned:
//! point `endpoint` at a SigV4 signing proxy (or a local emulator) so that
//! credential handling stays outside this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{
    ColumnMetadata, ExecutionStatus, QueryService, ResultPage, ServiceError, ServiceErrorKind,
    ServiceResult, StartQueryRequest, MAX_PAGE_SIZE,
};
use crate::execution::{ExecutionStats, QueryState};

/// Default timeout for a single API request.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// JSON protocol content type.
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";

/// Target prefix for Athena operations.
const TARGET_PREFIX: &str = "AmazonAthena";

/// Athena client configuration.
#[derive(Debug, Clone)]
pub struct AthenaConfig {
    /// Base URL requests are posted to.
    pub endpoint: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl AthenaConfig {
    /// Creates a config for the given endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Creates a config for the public endpoint of `region`.
    pub fn for_region(region: &str) -> Self {
        Self::new(format!("https://athena.{region}.amazonaws.com"))
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

/// Athena client.
#[derive(Debug, Clone)]
pub struct AthenaClient {
    config: AthenaConfig,
    client: Client,
}

impl AthenaClient {
    /// Creates a new client with the given configuration.
    pub fn new(config: AthenaConfig) -> ServiceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                ServiceError::new(
                    ServiceErrorKind::Transport,
                    format!("Failed to create HTTP client: {e}"),
                )
            })?;

        Ok(Self { config, client })
    }

    /// Posts one operation and decodes its response.
    async fn call<B, R>(&self, operation: &str, body: &B) -> ServiceResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        debug!("Athena {} request", operation);

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("X-Amz-Target", format!("{TARGET_PREFIX}.{operation}"))
            .header("Content-Type", CONTENT_TYPE)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                let message = if e.is_timeout() {
                    format!("{operation} timed out")
                } else if e.is_connect() {
                    format!("Failed to connect to {}: {e}", self.config.endpoint)
                } else {
                    format!("{operation} request failed: {e}")
                };
                ServiceError::new(ServiceErrorKind::Transport, message)
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            ServiceError::new(
                ServiceErrorKind::Transport,
                format!("Failed to read {operation} response: {e}"),
            )
        })?;

        if !status.is_success() {
            return Err(parse_error(status, &text));
        }

        serde_json::from_str(&text).map_err(|e| {
            ServiceError::new(
                ServiceErrorKind::Internal,
                format!("Failed to parse {operation} response: {e}"),
            )
        })
    }
}

/// Maps an error response to a [`ServiceError`].
fn parse_error(status: StatusCode, body: &str) -> ServiceError {
    let parsed = serde_json::from_str::<AthenaErrorResponse>(body).ok();
    let error_type = parsed
        .as_ref()
        .and_then(|e| e.error_type.as_deref())
        .map(|t| t.rsplit('#').next().unwrap_or(t).to_string());
    let message = parsed
        .and_then(|e| e.message)
        .unwrap_or_else(|| format!("HTTP {status}: {body}"));

    let kind = match error_type.as_deref() {
        Some("InvalidRequestException") | Some("ResourceNotFoundException") => {
            ServiceErrorKind::InvalidRequest
        }
        Some("AccessDeniedException")
        | Some("UnrecognizedClientException")
        | Some("InvalidSignatureException") => ServiceErrorKind::AccessDenied,
        Some("ThrottlingException") | Some("TooManyRequestsException") => {
            ServiceErrorKind::Throttled
        }
        _ if status == StatusCode::TOO_MANY_REQUESTS => ServiceErrorKind::Throttled,
        _ if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED => {
            ServiceErrorKind::AccessDenied
        }
        _ if status.is_client_error() => ServiceErrorKind::InvalidRequest,
        _ => ServiceErrorKind::Internal,
    };

    match error_type {
        Some(t) => ServiceError::new(kind, format!("{t}: {message}")),
        None => ServiceError::new(kind, message),
    }
}

fn epoch_to_datetime(seconds: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis((seconds * 1000.0).round() as i64)
}

#[async_trait]
impl QueryService for AthenaClient {
    async fn start_query(&self, request: &StartQueryRequest) -> ServiceResult<String> {
        let body = StartQueryExecutionInput {
            query_string: &request.sql,
            work_group: &request.workgroup,
            query_execution_context: request
                .database
                .as_deref()
                .map(|database| QueryExecutionContext { database }),
            result_configuration: request
                .output_location
                .as_deref()
                .map(|output_location| ResultConfigurationInput { output_location }),
        };
        let output: StartQueryExecutionOutput = self.call("StartQueryExecution", &body).await?;
        Ok(output.query_execution_id)
    }

    async fn get_execution(&self, execution_id: &str) -> ServiceResult<ExecutionStatus> {
        let body = QueryExecutionIdInput {
            query_execution_id: execution_id,
        };
        let output: GetQueryExecutionOutput = self.call("GetQueryExecution", &body).await?;
        output.query_execution.into_status()
    }

    async fn get_result_page(
        &self,
        execution_id: &str,
        token: Option<&str>,
        page_size: usize,
    ) -> ServiceResult<ResultPage> {
        let body = GetQueryResultsInput {
            query_execution_id: execution_id,
            next_token: token,
            max_results: page_size.clamp(1, MAX_PAGE_SIZE),
        };
        let output: GetQueryResultsOutput = self.call("GetQueryResults", &body).await?;

        let columns = output
            .result_set
            .result_set_metadata
            .column_info
            .into_iter()
            .map(|c| ColumnMetadata::new(c.name, c.column_type))
            .collect();
        let rows = output
            .result_set
            .rows
            .into_iter()
            .map(|row| row.data.into_iter().map(|d| d.var_char_value).collect())
            .collect();

        Ok(ResultPage {
            columns,
            rows,
            next_token: output.next_token,
        })
    }

    async fn stop_query(&self, execution_id: &str) -> ServiceResult<()> {
        let body = QueryExecutionIdInput {
            query_execution_id: execution_id,
        };
        let _: serde_json::Value = self.call("StopQueryExecution", &body).await?;
        Ok(())
    }
}

// Athena API types

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StartQueryExecutionInput<'a> {
    query_string: &'a str,
    work_group: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_execution_context: Option<QueryExecutionContext<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result_configuration: Option<ResultConfigurationInput<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct QueryExecutionContext<'a> {
    database: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ResultConfigurationInput<'a> {
    output_location: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StartQueryExecutionOutput {
    query_execution_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct QueryExecutionIdInput<'a> {
    query_execution_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetQueryExecutionOutput {
    query_execution: QueryExecutionOutput,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueryExecutionOutput {
    #[serde(default)]
    statement_type: Option<String>,
    #[serde(default)]
    result_configuration: Option<ResultConfigurationOutput>,
    status: StatusOutput,
    #[serde(default)]
    statistics: Option<StatisticsOutput>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResultConfigurationOutput {
    #[serde(default)]
    output_location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StatusOutput {
    state: String,
    #[serde(default)]
    state_change_reason: Option<String>,
    #[serde(default)]
    submission_date_time: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StatisticsOutput {
    #[serde(default)]
    total_execution_time_in_millis: Option<u64>,
    #[serde(default)]
    engine_execution_time_in_millis: Option<u64>,
    #[serde(default)]
    data_scanned_in_bytes: Option<u64>,
}

impl QueryExecutionOutput {
    fn into_status(self) -> ServiceResult<ExecutionStatus> {
        let state: QueryState = self
            .status
            .state
            .parse()
            .map_err(|e: String| ServiceError::new(ServiceErrorKind::Internal, e))?;
        let stats = self.statistics.unwrap_or_default();
        let elapsed_ms = stats
            .total_execution_time_in_millis
            .or(stats.engine_execution_time_in_millis)
            .unwrap_or(0);

        Ok(ExecutionStatus {
            state,
            state_change_reason: self.status.state_change_reason,
            statement_type: self.statement_type.and_then(|t| t.parse().ok()),
            output_location: self.result_configuration.and_then(|r| r.output_location),
            submitted_at: self.status.submission_date_time.and_then(epoch_to_datetime),
            stats: ExecutionStats::new(
                Duration::from_millis(elapsed_ms),
                stats.data_scanned_in_bytes.unwrap_or(0),
            ),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetQueryResultsInput<'a> {
    query_execution_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_token: Option<&'a str>,
    max_results: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetQueryResultsOutput {
    result_set: ResultSetOutput,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResultSetOutput {
    #[serde(default)]
    rows: Vec<RowOutput>,
    #[serde(default)]
    result_set_metadata: ResultSetMetadataOutput,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RowOutput {
    #[serde(default)]
    data: Vec<DatumOutput>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DatumOutput {
    #[serde(default)]
    var_char_value: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResultSetMetadataOutput {
    #[serde(default)]
    column_info: Vec<ColumnInfoOutput>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ColumnInfoOutput {
    name: String,
    #[serde(rename = "Type")]
    column_type: String,
}

#[derive(Debug, Deserialize)]
struct AthenaErrorResponse {
    #[serde(rename = "__type")]
    error_type: Option<String>,
    #[serde(alias = "Message")]
    message: Option<String>,
}
