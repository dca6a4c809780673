//! The engine façade.
//!
//! [`Engine`] composes templating, execution, and materialization:
//! a query is resolved locally, submitted, polled to a terminal state, and its
//! output read back as a table or a stream of batches.

use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{EngineConfig, ResultSource, StorageBackend};
use crate::error::{QuarryError, Result};
use crate::execution::{QueryExecution, QueryExecutor};
use crate::progress::SharedObserver;
use crate::result::{
    DateFields, MaterializedTable, Materializer, ObjectChunks, PageChunks, Parallelism,
    ResultBatch,
};
use crate::service::{AthenaClient, AthenaConfig, QueryService};
use crate::storage::{ObjectStorage, S3Path};
use crate::template::{is_valid_identifier, QuerySource, QueryTemplate, TemplateValue};

/// Prefix of generated table names.
pub const DEFAULT_TABLE_PREFIX: &str = "tmp_";

/// Options for [`Engine::query`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub params: BTreeMap<String, TemplateValue>,
    /// Overrides the configured date fields.
    pub date_fields: Option<Vec<String>>,
    /// Overrides the configured poll interval.
    pub poll_interval: Option<Duration>,
    pub cancel: CancellationToken,
    pub progress: Option<SharedObserver>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<TemplateValue>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn date_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.date_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Cancelling `token` cancels the query.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Reports polling and loading progress to `observer`.
    pub fn progress(mut self, observer: SharedObserver) -> Self {
        self.progress = Some(observer);
        self
    }
}

/// Options for [`Engine::create_table`].
#[derive(Debug, Clone)]
pub struct CreateTableOptions {
    pub params: BTreeMap<String, TemplateValue>,
    /// Table name. Generated from `prefix` when absent.
    pub name: Option<String>,
    pub prefix: String,
    /// Drop the table and delete its objects first.
    pub overwrite: bool,
    pub poll_interval: Option<Duration>,
    pub cancel: CancellationToken,
    pub progress: Option<SharedObserver>,
}

impl Default for CreateTableOptions {
    fn default() -> Self {
        Self {
            params: BTreeMap::new(),
            name: None,
            prefix: DEFAULT_TABLE_PREFIX.to_string(),
            overwrite: false,
            poll_interval: None,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }
}

impl CreateTableOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<TemplateValue>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn progress(mut self, observer: SharedObserver) -> Self {
        self.progress = Some(observer);
        self
    }
}

/// Options for [`Engine::execute_statement`].
#[derive(Debug, Clone)]
pub struct StatementOptions {
    pub params: BTreeMap<String, TemplateValue>,
    /// Database the statement runs in. Defaults to the configured database.
    pub database: Option<String>,
    /// Rows per batch, at most 1000.
    pub batch_size: usize,
    pub poll_interval: Option<Duration>,
    pub cancel: CancellationToken,
    pub progress: Option<SharedObserver>,
}

impl Default for StatementOptions {
    fn default() -> Self {
        Self {
            params: BTreeMap::new(),
            database: None,
            batch_size: crate::service::MAX_PAGE_SIZE,
            poll_interval: None,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }
}

impl StatementOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<TemplateValue>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn progress(mut self, observer: SharedObserver) -> Self {
        self.progress = Some(observer);
        self
    }
}

/// A table persisted from a query's output.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedTableHandle {
    pub database: String,
    pub name: String,
    /// Where the table's objects live.
    pub location: S3Path,
    /// The execution that created the table.
    pub execution: QueryExecution,
}

impl CreatedTableHandle {
    /// `database.name`, usable as a `FROM` target.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.database, self.name)
    }
}

impl fmt::Display for CreatedTableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.name)
    }
}

impl From<&CreatedTableHandle> for TemplateValue {
    fn from(handle: &CreatedTableHandle) -> Self {
        TemplateValue::QualifiedName(vec![handle.database.clone(), handle.name.clone()])
    }
}

impl From<CreatedTableHandle> for TemplateValue {
    fn from(handle: CreatedTableHandle) -> Self {
        TemplateValue::QualifiedName(vec![handle.database, handle.name])
    }
}

/// Runs queries and materializes their results.
#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    executor: QueryExecutor,
    storage: ObjectStorage,
    output: S3Path,
    parallelism: Parallelism,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("workgroup", &self.config.workgroup)
            .field("output", &self.output)
            .field("parallelism", &self.parallelism)
            .finish()
    }
}

impl Engine {
    /// Creates an engine over the given service and storage. The config is
    /// validated first.
    pub fn new(
        config: EngineConfig,
        service: Arc<dyn QueryService>,
        storage: ObjectStorage,
    ) -> Result<Self> {
        config.validate()?;
        let output = config.output_path()?;
        let parallelism = config.parallelism()?;

        if output.bucket() != storage.bucket() {
            return Err(QuarryError::config(format!(
                "storage is bound to bucket '{}' but output_location is {}",
                storage.bucket(),
                output
            )));
        }

        let executor = QueryExecutor::new(
            service,
            config.workgroup.clone(),
            Some(output.as_directory()),
        );

        Ok(Self {
            config: Arc::new(config),
            executor,
            storage,
            output,
            parallelism,
        })
    }

    /// Creates an engine talking to Athena and the configured storage backend.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let output = config.output_path()?;

        let client = AthenaClient::new(AthenaConfig::new(config.endpoint_url())).map_err(|e| {
            QuarryError::Service {
                execution_id: None,
                source: e,
            }
        })?;

        let storage = match config.storage {
            StorageBackend::S3 => ObjectStorage::s3(output.bucket(), &config.region)?,
            StorageBackend::Local => {
                let root = config.storage_root.as_deref().ok_or_else(|| {
                    QuarryError::config("storage_root is required for the local storage backend")
                })?;
                ObjectStorage::local(root, output.bucket())?
            }
            StorageBackend::Memory => ObjectStorage::in_memory(output.bucket()),
        };

        Self::new(config, Arc::new(client), storage)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    pub fn storage(&self) -> &ObjectStorage {
        &self.storage
    }

    fn poll_interval(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or_else(|| self.config.poll_interval())
    }

    fn materializer(
        &self,
        execution_id: &str,
        date_fields: Option<&[String]>,
        progress: Option<SharedObserver>,
    ) -> Materializer {
        let date_fields = date_fields.map_or_else(|| self.config.date_fields(), DateFields::new);
        Materializer::new(execution_id, self.parallelism, date_fields).with_observer(progress)
    }

    /// Submits `sql`, hands the handle to the observer, and polls to a
    /// terminal state.
    async fn run(
        &self,
        sql: &str,
        database: &str,
        poll_interval: Duration,
        cancel: CancellationToken,
        progress: Option<&SharedObserver>,
    ) -> Result<QueryExecution> {
        let handle = self.executor.submit(sql, Some(database), cancel).await?;
        if let Some(observer) = progress {
            observer.submitted(&handle);
        }
        let execution = self.executor.await_completion(&handle, poll_interval).await?;
        self.log_cost(&execution);
        Ok(execution)
    }

    /// Runs a query and loads its full result set.
    pub async fn query(
        &self,
        source: impl Into<QuerySource>,
        options: QueryOptions,
    ) -> Result<MaterializedTable> {
        let template = load_template(source.into(), options.params)?;

        match self.config.result_source {
            ResultSource::Objects => {
                let create = CreateTableOptions {
                    params: BTreeMap::new(),
                    name: None,
                    prefix: DEFAULT_TABLE_PREFIX.to_string(),
                    overwrite: false,
                    poll_interval: options.poll_interval,
                    cancel: options.cancel,
                    progress: options.progress.clone(),
                };
                let handle = self.create_table_from(template, create).await?;
                info!("Load query results.");
                self.load_objects(&handle, options.date_fields.as_deref(), options.progress)
                    .await
            }
            ResultSource::Pages => {
                let sql = template.resolve()?;
                let execution = self
                    .run(
                        &sql,
                        self.config.database(),
                        self.poll_interval(options.poll_interval),
                        options.cancel,
                        options.progress.as_ref(),
                    )
                    .await?;

                info!("Load query results.");
                let chunks = PageChunks::new(
                    self.executor.service().clone(),
                    &execution.id,
                    self.config.page_size,
                    execution.statement_type,
                );
                self.materializer(&execution.id, options.date_fields.as_deref(), options.progress)
                    .materialize(chunks)
                    .await
            }
        }
    }

    /// Reads every object of a created table.
    pub async fn read_table(
        &self,
        handle: &CreatedTableHandle,
        date_fields: Option<&[String]>,
    ) -> Result<MaterializedTable> {
        self.load_objects(handle, date_fields, None).await
    }

    async fn load_objects(
        &self,
        handle: &CreatedTableHandle,
        date_fields: Option<&[String]>,
        progress: Option<SharedObserver>,
    ) -> Result<MaterializedTable> {
        let chunks = ObjectChunks::discover(self.storage.clone(), &handle.location)
            .await
            .map_err(|e| QuarryError::ResultFetch {
                execution_id: handle.execution.id.clone(),
                chunk: 0,
                message: e.to_string(),
            })?;
        self.materializer(&handle.execution.id, date_fields, progress)
            .materialize(chunks)
            .await
    }

    /// Persists a query's output as a table. No rows are read back.
    pub async fn create_table(
        &self,
        source: impl Into<QuerySource>,
        mut options: CreateTableOptions,
    ) -> Result<CreatedTableHandle> {
        let params = std::mem::take(&mut options.params);
        let template = load_template(source.into(), params)?;
        self.create_table_from(template, options).await
    }

    async fn create_table_from(
        &self,
        template: QueryTemplate,
        options: CreateTableOptions,
    ) -> Result<CreatedTableHandle> {
        let body = template.resolve()?;
        let name = table_name(options.name.as_deref(), &options.prefix)?;
        let database = self.config.database().to_string();
        let qualified = format!("{database}.{name}");
        let location = self.output.join(&qualified);
        let poll_interval = self.poll_interval(options.poll_interval);

        if options.overwrite {
            info!("Overwriting table: `{}` data...", qualified);
            let sql = format!("DROP TABLE IF EXISTS {qualified}");
            self.run(
                &sql,
                &database,
                poll_interval,
                options.cancel.clone(),
                options.progress.as_ref(),
            )
            .await?;
            self.storage.delete_prefix(&location).await?;
        }

        let sql = format!(
            "CREATE TABLE {qualified}\nWITH (\n  format = 'PARQUET',\n  external_location = '{}'\n)\nAS\n{body}",
            location.as_directory()
        );
        debug!("{}", sql);

        let execution = self
            .run(
                &sql,
                &database,
                poll_interval,
                options.cancel,
                options.progress.as_ref(),
            )
            .await?;

        Ok(CreatedTableHandle {
            database,
            name,
            location,
            execution,
        })
    }

    /// Runs a statement (DDL, SHOW, INSERT, ...) and returns its result set as
    /// a lazy stream of batches.
    pub async fn execute_statement(
        &self,
        source: impl Into<QuerySource>,
        options: StatementOptions,
    ) -> Result<BoxStream<'static, Result<ResultBatch>>> {
        let sql = load_template(source.into(), options.params)?.resolve()?;
        let database = options
            .database
            .unwrap_or_else(|| self.config.database().to_string());

        let execution = self
            .run(
                &sql,
                &database,
                self.poll_interval(options.poll_interval),
                options.cancel,
                options.progress.as_ref(),
            )
            .await?;

        let chunks = PageChunks::new(
            self.executor.service().clone(),
            &execution.id,
            options.batch_size,
            execution.statement_type,
        );
        Ok(self
            .materializer(&execution.id, None, options.progress)
            .batches(chunks))
    }

    /// Streams the result set of a SUCCEEDED execution. Each call starts from
    /// the first batch.
    pub fn statement_batches(
        &self,
        execution: &QueryExecution,
        batch_size: usize,
    ) -> BoxStream<'static, Result<ResultBatch>> {
        let chunks = PageChunks::new(
            self.executor.service().clone(),
            &execution.id,
            batch_size,
            execution.statement_type,
        );
        self.materializer(&execution.id, None, None).batches(chunks)
    }

    /// Cancels an execution by id. Idempotent.
    pub async fn cancel_query(&self, execution_id: &str) -> Result<()> {
        self.executor.cancel_query(execution_id).await
    }

    fn log_cost(&self, execution: &QueryExecution) {
        debug!(
            "Query `{}` estimated cost: ${:.4}",
            execution.id,
            execution.stats.estimated_cost(self.config.price_per_tib_usd)
        );
    }
}

fn load_template(
    source: QuerySource,
    params: BTreeMap<String, TemplateValue>,
) -> Result<QueryTemplate> {
    Ok(source.into_template()?.bind_all(params))
}

/// Uses `name` when given, otherwise `prefix` plus a random suffix.
fn table_name(name: Option<&str>, prefix: &str) -> Result<String> {
    let (candidate, param) = match name {
        Some(name) => (name.to_string(), "name"),
        None => (
            format!("{prefix}{}", uuid::Uuid::new_v4()).replace('-', "_"),
            "prefix",
        ),
    };

    if is_valid_identifier(&candidate) {
        Ok(candidate)
    } else {
        Err(QuarryError::InvalidIdentifier {
            name: param.to_string(),
            value: name.unwrap_or(prefix).to_string(),
        })
    }
}
