//! Materialization ordering tests.

use async_trait::async_trait;
use futures::FutureExt;
use pretty_assertions::assert_eq;
use quarry::error::Result;
use quarry::execution::QueryExecutor;
use quarry::result::{
    Chunk, ChunkSource, DateFields, Materializer, PageChunks, Parallelism, RawChunk, Value,
};
use quarry::service::{ColumnMetadata, ResultPage, ScriptedExecution, ScriptedQueryService};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Chunks whose fetch sleeps for a random time before yielding `rows` rows.
struct RandomLatencyChunks {
    pending: VecDeque<(usize, usize)>,
}

impl RandomLatencyChunks {
    fn new(row_counts: &[usize]) -> Self {
        Self {
            pending: row_counts.iter().copied().enumerate().collect(),
        }
    }
}

#[async_trait]
impl ChunkSource for RandomLatencyChunks {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        let Some((index, rows)) = self.pending.pop_front() else {
            return Ok(None);
        };
        let delay = Duration::from_millis(fastrand::u64(0..25));
        let fetch = async move {
            tokio::time::sleep(delay).await;
            Ok(RawChunk::Page {
                page: ResultPage {
                    columns: vec![
                        ColumnMetadata::new("chunk", "integer"),
                        ColumnMetadata::new("row", "integer"),
                    ],
                    rows: (0..rows)
                        .map(|row| vec![Some(index.to_string()), Some(row.to_string())])
                        .collect(),
                    next_token: None,
                },
                header_row: false,
            })
        }
        .boxed();
        Ok(Some(Chunk { index, fetch }))
    }
}

fn positions(rows: &[Vec<Value>]) -> Vec<(i64, i64)> {
    rows.iter()
        .map(|row| match (&row[0], &row[1]) {
            (Value::Int(chunk), Value::Int(row)) => (*chunk, *row),
            other => panic!("unexpected row {other:?}"),
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_random_latency_keeps_sequence_order() {
    let row_counts: [usize; 12] = [3, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5, 8];
    let expected: Vec<(i64, i64)> = row_counts
        .iter()
        .enumerate()
        .flat_map(|(chunk, &rows)| (0..rows as i64).map(move |row| (chunk as i64, row)))
        .collect();

    for worker_count in [1, 2, 8] {
        let parallelism = Parallelism::from_worker_count(worker_count).unwrap();
        let table = Materializer::new("q", parallelism, DateFields::none())
            .materialize(RandomLatencyChunks::new(&row_counts))
            .await
            .unwrap();

        assert_eq!(
            positions(&table.rows),
            expected,
            "worker_count = {worker_count}"
        );
    }
}

#[tokio::test]
async fn test_three_pages_with_all_cores() {
    let service = Arc::new(ScriptedQueryService::new());
    let page = |names: &[&str]| ResultPage {
        columns: vec![ColumnMetadata::new("name", "varchar")],
        rows: names.iter().map(|n| vec![Some(n.to_string())]).collect(),
        next_token: None,
    };
    service.push_execution(ScriptedExecution::succeeding().with_pages(vec![
        page(&["name", "a", "b"]),
        page(&["c", "d"]),
        page(&["e"]),
    ]));

    let executor = QueryExecutor::new(service.clone(), "analytics", None);
    let execution = executor
        .run(
            "SELECT name FROM t",
            None,
            Duration::from_millis(1),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let chunks = PageChunks::new(
        service.clone(),
        &execution.id,
        1000,
        execution.statement_type,
    );
    let table = Materializer::new(
        &execution.id,
        Parallelism::from_worker_count(-1).unwrap(),
        DateFields::none(),
    )
    .materialize(chunks)
    .await
    .unwrap();

    let names: Vec<String> = table.rows.iter().map(|r| r[0].to_display_string()).collect();
    assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
    assert_eq!(
        service.page_requests(&execution.id),
        vec![None, Some("page-1".to_string()), Some("page-2".to_string())]
    );
}
