//! Chunk discovery.
//!
//! A [`ChunkSource`] enumerates the units a result set is fetched in. Each
//! [`Chunk`] carries its position and a future producing its raw content.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::{QuarryError, Result};
use crate::execution::StatementType;
use crate::service::{QueryService, ResultPage, MAX_PAGE_SIZE};
use crate::storage::{ObjectStorage, S3Path};

/// Raw content of one chunk, before parsing.
#[derive(Debug, Clone)]
pub enum RawChunk {
    /// A result page. `header_row` is set when the first row may repeat the
    /// column names.
    Page { page: ResultPage, header_row: bool },
    /// A Parquet object.
    Parquet(Bytes),
}

/// One unit of work: a position in the result set plus the fetch of its
/// content.
pub struct Chunk {
    pub index: usize,
    pub fetch: BoxFuture<'static, Result<RawChunk>>,
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk").field("index", &self.index).finish()
    }
}

/// Enumerates the chunks of one result set, in order.
#[async_trait]
pub trait ChunkSource: Send {
    /// Returns the next chunk, or `None` once the result set is exhausted.
    ///
    /// Sources whose chunks are chained (each revealing the next) fetch inside
    /// this call, so chaining stays sequential; the returned future is then
    /// already complete.
    async fn next_chunk(&mut self) -> Result<Option<Chunk>>;
}

/// Token-chained result pages of an execution.
pub struct PageChunks {
    service: Arc<dyn QueryService>,
    execution_id: String,
    page_size: usize,
    header_row: bool,
    next_token: Option<String>,
    index: usize,
    exhausted: bool,
}

impl PageChunks {
    /// `page_size` is clamped to what the service allows. The header row is
    /// only expected for DML statements.
    pub fn new(
        service: Arc<dyn QueryService>,
        execution_id: impl Into<String>,
        page_size: usize,
        statement_type: Option<StatementType>,
    ) -> Self {
        Self {
            service,
            execution_id: execution_id.into(),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            header_row: statement_type == Some(StatementType::Dml),
            next_token: None,
            index: 0,
            exhausted: false,
        }
    }
}

#[async_trait]
impl ChunkSource for PageChunks {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.exhausted {
            return Ok(None);
        }

        let page = self
            .service
            .get_result_page(&self.execution_id, self.next_token.as_deref(), self.page_size)
            .await
            .map_err(|e| QuarryError::service(&self.execution_id, e))?;

        let index = self.index;
        debug!(
            "Fetched page {} of `{}` ({} rows)",
            index,
            self.execution_id,
            page.rows.len()
        );

        self.index += 1;
        self.next_token = page.next_token.clone();
        self.exhausted = self.next_token.is_none();

        let raw = RawChunk::Page {
            page,
            header_row: self.header_row && index == 0,
        };
        Ok(Some(Chunk {
            index,
            fetch: future::ready(Ok(raw)).boxed(),
        }))
    }
}

/// Persisted output objects under a prefix, enumerated up front.
pub struct ObjectChunks {
    storage: ObjectStorage,
    objects: VecDeque<S3Path>,
    index: usize,
}

impl ObjectChunks {
    /// Lists the objects under `prefix`. An empty listing yields no chunks.
    pub async fn discover(storage: ObjectStorage, prefix: &S3Path) -> Result<Self> {
        let objects = storage.list(prefix).await?;
        debug!("Found {} result objects under {}", objects.len(), prefix);
        Ok(Self {
            storage,
            objects: objects.into(),
            index: 0,
        })
    }

    /// Number of chunks not yet handed out.
    pub fn remaining(&self) -> usize {
        self.objects.len()
    }
}

#[async_trait]
impl ChunkSource for ObjectChunks {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        let Some(path) = self.objects.pop_front() else {
            return Ok(None);
        };

        let index = self.index;
        self.index += 1;

        let storage = self.storage.clone();
        let fetch = async move {
            debug!("Reading result object {}", path);
            storage.read(&path).await.map(RawChunk::Parquet)
        }
        .boxed();

        Ok(Some(Chunk { index, fetch }))
    }
}
