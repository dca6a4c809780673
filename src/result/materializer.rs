//! Concurrent, order-preserving result materialization.
//!
//! Chunks are handed to a pool bounded by a semaphore. Each task fetches its
//! chunk and parses it on the blocking pool. Fragments are merged by chunk
//! index, so row order never depends on scheduling.

use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinError, JoinSet};
use tracing::{debug, info};

use crate::error::{QuarryError, Result};
use crate::progress::SharedObserver;

use super::chunks::{Chunk, ChunkSource, RawChunk};
use super::parse::{parse_page, parse_parquet};
use super::types::{DateFields, MaterializedTable, ResultBatch, TableFragment};

/// How many chunks are processed at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parallelism {
    /// Fetch and parse on the calling task, one chunk at a time.
    Inline,
    /// Up to `n` chunks in flight, parsed on the blocking pool.
    Workers(usize),
}

impl Parallelism {
    /// Interprets a configured worker count: `1` is inline, `-1` uses every
    /// available execution unit, `n > 1` uses `n` workers.
    pub fn from_worker_count(worker_count: i64) -> Result<Self> {
        match worker_count {
            1 => Ok(Self::Inline),
            -1 => {
                let units = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                Ok(Self::Workers(units.max(1)))
            }
            n if n > 1 => usize::try_from(n)
                .map(Self::Workers)
                .map_err(|_| QuarryError::config(format!("worker_count {n} is too large"))),
            n => Err(QuarryError::config(format!(
                "worker_count must be 1, -1 or greater than 1, got {n}"
            ))),
        }
    }

    /// Number of chunks processed at once.
    pub fn workers(&self) -> usize {
        match self {
            Self::Inline => 1,
            Self::Workers(n) => *n,
        }
    }
}

/// Turns a [`ChunkSource`] into a table or a stream of batches.
#[derive(Debug, Clone)]
pub struct Materializer {
    execution_id: String,
    parallelism: Parallelism,
    date_fields: Arc<DateFields>,
    observer: Option<SharedObserver>,
}

impl Materializer {
    pub fn new(execution_id: impl Into<String>, parallelism: Parallelism, date_fields: DateFields) -> Self {
        Self {
            execution_id: execution_id.into(),
            parallelism,
            date_fields: Arc::new(date_fields),
            observer: None,
        }
    }

    /// Reports every parsed chunk to `observer`.
    pub fn with_observer(mut self, observer: Option<SharedObserver>) -> Self {
        self.observer = observer;
        self
    }

    fn loaded(&self, fragment: &TableFragment) {
        debug!("Parsed chunk {} ({} rows)", fragment.index, fragment.rows.len());
        if let Some(observer) = &self.observer {
            observer.chunk_loaded(fragment.index, fragment.rows.len());
        }
    }

    fn fetch_error(&self, chunk: usize, error: &QuarryError) -> QuarryError {
        QuarryError::ResultFetch {
            execution_id: self.execution_id.clone(),
            chunk,
            message: error.to_string(),
        }
    }

    /// Fetches and parses every chunk, returning them merged in chunk order.
    ///
    /// On the first failure all outstanding chunks are aborted and joined
    /// before the error is returned; no partial table is produced.
    pub async fn materialize<S>(&self, mut source: S) -> Result<MaterializedTable>
    where
        S: ChunkSource,
    {
        let started = Instant::now();
        let fragments = match self.parallelism {
            Parallelism::Inline => self.collect_inline(&mut source).await?,
            Parallelism::Workers(n) => self.collect_concurrent(&mut source, n).await?,
        };

        let table = merge(fragments);
        info!(
            "Loaded {} rows of query `{}` in {} sec",
            table.len(),
            self.execution_id,
            started.elapsed().as_secs_f64().round()
        );
        Ok(table)
    }

    async fn collect_inline<S: ChunkSource>(
        &self,
        source: &mut S,
    ) -> Result<BTreeMap<usize, TableFragment>> {
        let mut fragments = BTreeMap::new();
        let mut next = 0;
        loop {
            let chunk = match source.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => return Err(self.fetch_error(next, &e)),
            };
            let index = chunk.index;
            next = index + 1;

            let raw = chunk
                .fetch
                .await
                .map_err(|e| self.fetch_error(index, &e))?;
            let fragment =
                parse_chunk(index, raw, &self.date_fields).map_err(|e| self.fetch_error(index, &e))?;
            self.loaded(&fragment);
            fragments.insert(index, fragment);
        }
        Ok(fragments)
    }

    async fn collect_concurrent<S: ChunkSource>(
        &self,
        source: &mut S,
        workers: usize,
    ) -> Result<BTreeMap<usize, TableFragment>> {
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks: JoinSet<(usize, Result<TableFragment>)> = JoinSet::new();
        let mut task_chunks: HashMap<task::Id, usize> = HashMap::new();
        let mut fragments = BTreeMap::new();
        let mut next = 0;

        loop {
            // Fail fast on anything that already finished.
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = self.record(joined, &task_chunks, &mut fragments) {
                    tasks.shutdown().await;
                    return Err(e);
                }
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    tasks.shutdown().await;
                    return Err(QuarryError::internal("worker pool closed"));
                }
            };

            let chunk = match source.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    tasks.shutdown().await;
                    return Err(self.fetch_error(next, &e));
                }
            };
            next = chunk.index + 1;

            let date_fields = self.date_fields.clone();
            let Chunk { index, fetch } = chunk;
            let spawned = tasks.spawn(async move {
                let _permit = permit;
                (index, fetch_and_parse(index, fetch, date_fields).await)
            });
            task_chunks.insert(spawned.id(), index);
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = self.record(joined, &task_chunks, &mut fragments) {
                tasks.shutdown().await;
                return Err(e);
            }
        }
        Ok(fragments)
    }

    fn record(
        &self,
        joined: std::result::Result<(usize, Result<TableFragment>), JoinError>,
        task_chunks: &HashMap<task::Id, usize>,
        fragments: &mut BTreeMap<usize, TableFragment>,
    ) -> Result<()> {
        let (index, result) = joined.map_err(|e| {
            let chunk = task_chunks.get(&e.id()).copied().unwrap_or(usize::MAX);
            QuarryError::ResultFetch {
                execution_id: self.execution_id.clone(),
                chunk,
                message: format!("worker failed: {e}"),
            }
        })?;
        let fragment = result.map_err(|e| self.fetch_error(index, &e))?;
        self.loaded(&fragment);
        fragments.insert(index, fragment);
        Ok(())
    }

    /// Yields one batch per chunk, fetching lazily as the stream is polled.
    ///
    /// The stream is forward-only; create a new source to read again.
    pub fn batches<S>(&self, source: S) -> BoxStream<'static, Result<ResultBatch>>
    where
        S: ChunkSource + 'static,
    {
        let this = self.clone();
        stream::try_unfold((source, this, 0usize), |(mut source, this, next)| async move {
            let chunk = match source.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return Ok(None),
                Err(e) => return Err(this.fetch_error(next, &e)),
            };
            let Chunk { index, fetch } = chunk;
            let fragment = fetch_and_parse(index, fetch, this.date_fields.clone())
                .await
                .map_err(|e| this.fetch_error(index, &e))?;
            this.loaded(&fragment);
            Ok(Some((ResultBatch::from(fragment), (source, this, index + 1))))
        })
        .boxed()
    }
}

async fn fetch_and_parse(
    index: usize,
    fetch: futures::future::BoxFuture<'static, Result<RawChunk>>,
    date_fields: Arc<DateFields>,
) -> Result<TableFragment> {
    let raw = fetch.await?;
    tokio::task::spawn_blocking(move || parse_chunk(index, raw, &date_fields))
        .await
        .map_err(|e| QuarryError::internal(format!("parse task failed: {e}")))?
}

fn parse_chunk(index: usize, raw: RawChunk, date_fields: &DateFields) -> Result<TableFragment> {
    match raw {
        RawChunk::Page { page, header_row } => Ok(parse_page(index, page, date_fields, header_row)),
        RawChunk::Parquet(data) => parse_parquet(index, data, date_fields),
    }
}

/// Concatenates fragments in index order. The schema comes from the first
/// fragment that has one.
fn merge(fragments: BTreeMap<usize, TableFragment>) -> MaterializedTable {
    let mut table = MaterializedTable::default();
    for fragment in fragments.into_values() {
        if table.columns.is_empty() {
            table.columns = fragment.columns;
        }
        table.rows.extend(fragment.rows);
    }
    table
}
