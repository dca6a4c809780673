//! End-to-end engine tests over the scripted service and in-memory storage.

use arrow::array::{ArrayRef, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use futures::TryStreamExt;
use parquet::arrow::ArrowWriter;
use pretty_assertions::assert_eq;
use quarry::config::ResultSource;
use quarry::error::QuarryError;
use quarry::execution::StatementType;
use quarry::result::{ResultBatch, Value};
use quarry::service::{ColumnMetadata, ResultPage, ScriptedExecution, ScriptedQueryService};
use quarry::storage::{ObjectStorage, S3Path};
use quarry::{CreateTableOptions, Engine, EngineConfig, QueryOptions, StatementOptions};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn config(result_source: ResultSource, worker_count: i64) -> EngineConfig {
    let mut config = EngineConfig::new("analytics", "s3://results/athena");
    config.poll_interval_secs = 0.001;
    config.result_source = result_source;
    config.worker_count = worker_count;
    config
}

fn engine(config: EngineConfig) -> (Engine, Arc<ScriptedQueryService>) {
    let service = Arc::new(ScriptedQueryService::new());
    let engine = Engine::new(config, service.clone(), ObjectStorage::in_memory("results")).unwrap();
    (engine, service)
}

fn parquet_object(names: &[&str], amounts: &[i64], dates: &[&str]) -> Bytes {
    let schema = Arc::new(Schema::new(vec![
        Field::new("name", DataType::Utf8, true),
        Field::new("amount", DataType::Int64, true),
        Field::new("report_date", DataType::Utf8, true),
    ]));
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(names.to_vec())),
        Arc::new(Int64Array::from(amounts.to_vec())),
        Arc::new(StringArray::from(dates.to_vec())),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns).unwrap();

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
    Bytes::from(buffer)
}

fn text_page(column: &str, values: &[&str]) -> ResultPage {
    ResultPage {
        columns: vec![ColumnMetadata::new(column, "varchar")],
        rows: values.iter().map(|v| vec![Some(v.to_string())]).collect(),
        next_token: None,
    }
}

#[tokio::test]
async fn test_created_table_objects_load_in_key_order() {
    let (engine, _service) = engine(config(ResultSource::Objects, 4));
    let storage = engine.storage();
    let prefix = S3Path::parse("s3://results/athena/analytics.sales").unwrap();

    storage
        .write(
            &prefix.join("part-00001"),
            parquet_object(&["carol"], &[30], &["2024-03-02"]),
        )
        .await
        .unwrap();
    storage
        .write(
            &prefix.join("part-00000"),
            parquet_object(&["alice", "bob"], &[10, 20], &["2024-03-01", "2024-03-01"]),
        )
        .await
        .unwrap();
    storage
        .write(&prefix.join("part-00002"), Bytes::new())
        .await
        .unwrap();

    let handle = engine
        .create_table("SELECT 1", CreateTableOptions::new().name("sales"))
        .await
        .unwrap();
    assert_eq!(handle.location, prefix);

    let table = engine.read_table(&handle, None).await.unwrap();

    let names: Vec<String> = table
        .column_values("name")
        .unwrap()
        .iter()
        .map(|v| v.to_display_string())
        .collect();
    assert_eq!(names, vec!["alice", "bob", "carol"]);
    assert_eq!(table.rows[2][1], Value::Int(30));
    assert!(matches!(table.rows[0][2], Value::Timestamp(_)));
}

#[tokio::test]
async fn test_overwrite_discards_previous_objects() {
    let (engine, service) = engine(config(ResultSource::Objects, 1));
    let prefix = S3Path::parse("s3://results/athena/analytics.sales").unwrap();
    engine
        .storage()
        .write(
            &prefix.join("stale"),
            parquet_object(&["old"], &[1], &["2020-01-01"]),
        )
        .await
        .unwrap();

    let handle = engine
        .create_table(
            "SELECT 1",
            CreateTableOptions::new().name("sales").overwrite(true),
        )
        .await
        .unwrap();

    let table = engine.read_table(&handle, None).await.unwrap();
    assert!(table.is_empty());
    assert_eq!(service.started_queries().len(), 2);
}

#[tokio::test]
async fn test_failed_query_carries_execution_id() {
    let (engine, service) = engine(config(ResultSource::Pages, 1));
    service.push_execution(ScriptedExecution::failing(
        "TABLE_NOT_FOUND: Table 'analytics.nope' does not exist",
    ));

    let err = engine
        .query("SELECT * FROM nope", QueryOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, QuarryError::QueryFailed { .. }));
    assert_eq!(err.execution_id(), Some("query-1"));
}

#[tokio::test]
async fn test_cancelled_token_cancels_query() {
    let (engine, service) = engine(config(ResultSource::Pages, 1));
    service.push_execution(ScriptedExecution::running_until_stopped());

    let token = CancellationToken::new();
    token.cancel();
    let err = engine
        .query("SELECT * FROM big", QueryOptions::new().cancel_token(token))
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(service.stop_calls("query-1"), 1);
    assert!(service.page_requests("query-1").is_empty());
}

#[tokio::test]
async fn test_result_page_failure_names_chunk() {
    let (engine, service) = engine(config(ResultSource::Pages, 2));
    service.push_execution(
        ScriptedExecution::succeeding()
            .with_pages(vec![
                text_page("v", &["v", "a"]),
                text_page("v", &["b"]),
                text_page("v", &["c"]),
            ])
            .with_failing_page(1),
    );

    let err = engine
        .query("SELECT v FROM t", QueryOptions::new())
        .await
        .unwrap_err();

    match err {
        QuarryError::ResultFetch {
            execution_id,
            chunk,
            ..
        } => {
            assert_eq!(execution_id, "query-1");
            assert_eq!(chunk, 1);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_statement_batches_restart_from_first_page() {
    let (engine, service) = engine(config(ResultSource::Pages, 1));
    service.push_execution(
        ScriptedExecution::succeeding()
            .with_statement_type(StatementType::Utility)
            .with_pages(vec![
                text_page("partition", &["day=2024-01-01"]),
                text_page("partition", &["day=2024-01-02"]),
            ]),
    );

    let batches = engine
        .execute_statement("SHOW PARTITIONS events", StatementOptions::new())
        .await
        .unwrap();
    let first: Vec<ResultBatch> = batches.try_collect().await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[1].index, 1);
    assert_eq!(first[1].rows, vec![vec![Value::from("day=2024-01-02")]]);

    let execution = quarry::QueryExecution {
        statement_type: Some(StatementType::Utility),
        ..quarry::QueryExecution::submitted("query-1", None)
    };
    let again: Vec<ResultBatch> = engine
        .statement_batches(&execution, 1000)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(again, first);
    assert_eq!(service.page_requests("query-1").len(), 4);
}
