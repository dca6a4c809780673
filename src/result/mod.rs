//! Result materialization.
//!
//! Turns the output of a SUCCEEDED execution into a [`MaterializedTable`] or a
//! lazy stream of [`ResultBatch`]es. Where the chunks come from is abstracted
//! behind [`ChunkSource`]: token-chained service pages ([`PageChunks`]) or
//! persisted output objects ([`ObjectChunks`]).

mod chunks;
mod materializer;
mod parse;
mod types;

pub use chunks::{Chunk, ChunkSource, ObjectChunks, PageChunks, RawChunk};
pub use materializer::{Materializer, Parallelism};
pub use parse::{parse_cell, parse_timestamp};
pub use types::{
    json_row, Column, ColumnType, DateFields, MaterializedTable, ResultBatch, Row, TableFragment,
    Value,
};
