//! Templating through the engine: query files, chained tables, local errors.

use pretty_assertions::assert_eq;
use quarry::config::ResultSource;
use quarry::error::QuarryError;
use quarry::service::ScriptedQueryService;
use quarry::storage::ObjectStorage;
use quarry::{
    CreateTableOptions, Engine, EngineConfig, QueryOptions, QuerySource, StatementOptions,
    TemplateValue,
};
use std::sync::Arc;

fn engine() -> (Engine, Arc<ScriptedQueryService>) {
    let mut config = EngineConfig::new("analytics", "s3://results/athena");
    config.poll_interval_secs = 0.001;
    config.result_source = ResultSource::Pages;
    let service = Arc::new(ScriptedQueryService::new());
    let engine = Engine::new(config, service.clone(), ObjectStorage::in_memory("results")).unwrap();
    (engine, service)
}

#[tokio::test]
async fn test_query_file_is_resolved_before_submission() {
    let (engine, service) = engine();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("adults.sql");
    std::fs::write(&path, "SELECT * FROM ${schema}.${table} WHERE age > ${age}").unwrap();

    engine
        .query(
            QuerySource::detect(path.to_str().unwrap()),
            QueryOptions::new()
                .param("schema", TemplateValue::schema("main"))
                .param("table", TemplateValue::table("users"))
                .param("age", 14),
        )
        .await
        .unwrap();

    assert_eq!(
        service.started_queries()[0].sql,
        "SELECT * FROM main.users WHERE age > 14"
    );
}

#[tokio::test]
async fn test_created_table_feeds_next_query() {
    let (engine, service) = engine();

    let handle = engine
        .create_table(
            "SELECT user_id FROM events WHERE kind IN ${kinds}",
            CreateTableOptions::new()
                .name("active_users")
                .param("kinds", TemplateValue::list(["login", "purchase"])),
        )
        .await
        .unwrap();

    engine
        .execute_statement(
            "SELECT count(*) FROM ${users}",
            StatementOptions::new().param("users", &handle),
        )
        .await
        .unwrap();

    let started = service.started_queries();
    assert_eq!(started.len(), 2);
    assert!(started[0]
        .sql
        .ends_with("SELECT user_id FROM events WHERE kind IN ('login', 'purchase')"));
    assert_eq!(started[1].sql, "SELECT count(*) FROM analytics.active_users");
}

#[tokio::test]
async fn test_template_errors_are_local() {
    let (engine, service) = engine();

    let err = engine
        .execute_statement(
            "DROP TABLE ${table}",
            StatementOptions::new().param("table", TemplateValue::table("users; --")),
        )
        .await
        .err()
        .unwrap();
    assert!(matches!(err, QuarryError::InvalidIdentifier { ref name, .. } if name == "table"));

    let err = engine
        .query("SELECT ${missing}", QueryOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, QuarryError::UnboundParameter { ref name } if name == "missing"));
    assert_eq!(err.execution_id(), None);

    let err = engine
        .query("SELECT ${ratio}", QueryOptions::new().param("ratio", f64::NAN))
        .await
        .unwrap_err();
    assert!(matches!(err, QuarryError::InvalidParameter { .. }));

    assert!(service.started_queries().is_empty());
}
