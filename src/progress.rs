//! Progress reporting for running queries and result loading.

use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::execution::{ExecutionHandle, QueryExecution};

/// Receives progress from the engine while a query runs and loads.
pub trait ProgressObserver: Send + Sync + fmt::Debug {
    /// Called once per submitted execution, before polling starts.
    /// Subscribe to the handle to see every poll.
    fn submitted(&self, _handle: &ExecutionHandle) {}

    /// Called after chunk `index` has been fetched and parsed.
    fn chunk_loaded(&self, _index: usize, _rows: usize) {}
}

/// Shared observer, as carried by the engine's option structs.
pub type SharedObserver = Arc<dyn ProgressObserver>;

/// One-line status of an execution: state, elapsed time and data scanned.
pub fn describe(execution: &QueryExecution) -> String {
    format!(
        "Query `{}` {} ({} sec, {} MiB scanned)",
        execution.id,
        execution.state,
        execution.stats.elapsed.as_secs(),
        execution.stats.scanned_mib()
    )
}

/// Spinner on stderr that follows the execution and counts loaded chunks.
#[derive(Clone)]
pub struct TerminalProgress {
    bar: ProgressBar,
    chunks: Arc<AtomicUsize>,
    rows: Arc<AtomicUsize>,
}

impl fmt::Debug for TerminalProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalProgress")
            .field("chunks", &self.chunks.load(Ordering::Relaxed))
            .field("rows", &self.rows.load(Ordering::Relaxed))
            .finish()
    }
}

impl TerminalProgress {
    /// Creates a spinner drawn on stderr. Nothing is drawn when stderr is not
    /// a terminal.
    pub fn stderr() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self::with_bar(bar)
    }

    /// Creates a reporter that never draws.
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden())
    }

    fn with_bar(bar: ProgressBar) -> Self {
        Self {
            bar,
            chunks: Arc::new(AtomicUsize::new(0)),
            rows: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Current status line.
    pub fn message(&self) -> String {
        self.bar.message()
    }

    /// Removes the spinner.
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressObserver for TerminalProgress {
    fn submitted(&self, handle: &ExecutionHandle) {
        let mut updates = handle.subscribe();
        let bar = self.bar.clone();
        tokio::spawn(async move {
            loop {
                let execution = updates.borrow_and_update().clone();
                bar.set_message(describe(&execution));
                if execution.is_terminal() || updates.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    fn chunk_loaded(&self, _index: usize, rows: usize) {
        let chunks = self.chunks.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.rows.fetch_add(rows, Ordering::Relaxed) + rows;
        self.bar
            .set_message(format!("Loaded {chunks} chunks ({total} rows)"));
        self.bar.tick();
    }
}
