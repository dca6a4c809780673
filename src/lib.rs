//! Quarry - run templated SQL on Athena and load the results.
//!
//! The library is organised around three pieces: [`template`] resolves
//! `${name}` placeholders into final SQL, [`execution`] drives a submitted query
//! to a terminal state, and [`result`] loads its output concurrently while
//! keeping row order. [`Engine`] ties them together.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod logging;
pub mod progress;
pub mod result;
pub mod service;
pub mod storage;
pub mod template;

pub use config::EngineConfig;
pub use engine::{CreateTableOptions, CreatedTableHandle, Engine, QueryOptions, StatementOptions};
pub use error::{QuarryError, Result};
pub use execution::{QueryExecution, QueryState};
pub use result::{MaterializedTable, ResultBatch, Value};
pub use template::{QuerySource, QueryTemplate, TemplateValue};
