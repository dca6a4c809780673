//! Execution lifecycle tests against the scripted query service.

use pretty_assertions::assert_eq;
use quarry::error::QuarryError;
use quarry::execution::{ExecutionStats, QueryExecutor, QueryState};
use quarry::service::{ScriptedExecution, ScriptedQueryService};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TICK: Duration = Duration::from_millis(5);

fn executor() -> (QueryExecutor, Arc<ScriptedQueryService>) {
    let service = Arc::new(ScriptedQueryService::new());
    let executor = QueryExecutor::new(
        service.clone(),
        "analytics",
        Some("s3://results/athena/".to_string()),
    );
    (executor, service)
}

#[tokio::test]
async fn test_succeeding_query_polls_to_completion() {
    let (executor, service) = executor();
    let stats = ExecutionStats::new(Duration::from_millis(2500), 10 * 1024 * 1024);
    service.push_execution(ScriptedExecution::succeeding().with_final_stats(stats));

    let execution = executor
        .run("SELECT 1", None, TICK, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(execution.state, QueryState::Succeeded);
    assert_eq!(execution.stats, stats);
    assert_eq!(execution.stats.scanned_mib(), 10);
    assert!(service.poll_count(&execution.id) >= 3);
    assert_eq!(service.stop_calls(&execution.id), 0);
    assert_eq!(
        execution.output_location.as_deref(),
        Some("s3://results/athena/query-1.csv")
    );
}

#[tokio::test]
async fn test_submission_carries_workgroup_and_database() {
    let (executor, service) = executor();
    executor
        .run("SELECT 1", Some("reporting"), TICK, CancellationToken::new())
        .await
        .unwrap();

    let started = service.started_queries();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].workgroup, "analytics");
    assert_eq!(started[0].database.as_deref(), Some("reporting"));
    assert_eq!(
        started[0].output_location.as_deref(),
        Some("s3://results/athena/")
    );
}

#[tokio::test]
async fn test_cancel_while_running() {
    let (executor, service) = executor();
    service.push_execution(ScriptedExecution::running_until_stopped());

    let handle = executor
        .submit("SELECT * FROM big", None, CancellationToken::new())
        .await
        .unwrap();
    let id = handle.id();

    let waiter = {
        let executor = executor.clone();
        let handle = handle.clone();
        tokio::spawn(async move { executor.await_completion(&handle, TICK).await })
    };

    let mut updates = handle.subscribe();
    updates
        .wait_for(|execution| execution.state == QueryState::Running)
        .await
        .unwrap();
    handle.cancel();

    let err = waiter.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.execution_id(), Some(id.as_str()));
    assert_eq!(service.stop_calls(&id), 1);
    assert_eq!(handle.snapshot().state, QueryState::Cancelled);
}

#[tokio::test]
async fn test_failed_query_is_not_cancelled() {
    let (executor, service) = executor();
    service.push_execution(ScriptedExecution::failing(
        "SYNTAX_ERROR: line 1:8: Column 'nope' cannot be resolved",
    ));

    let err = executor
        .run("SELECT nope", None, TICK, CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        QuarryError::QueryFailed {
            execution_id,
            reason,
        } => {
            assert_eq!(execution_id, "query-1");
            assert!(reason.contains("cannot be resolved"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(service.stop_calls("query-1"), 0);
}

#[tokio::test]
async fn test_cancel_query_twice_succeeds() {
    let (executor, service) = executor();
    service.push_execution(ScriptedExecution::running_until_stopped());

    let handle = executor
        .submit("SELECT * FROM big", None, CancellationToken::new())
        .await
        .unwrap();
    let id = handle.id();

    executor.cancel_query(&id).await.unwrap();
    executor.cancel_query(&id).await.unwrap();

    // The first poll after the stop settles the execution as cancelled.
    assert_eq!(service.stop_calls(&id), 1);
}
