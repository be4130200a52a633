//! Progress reporting for paginated writes.
//!
//! Decouples the pagination loop from whatever renders progress (log lines,
//! a job-instance counter, or nothing).

use std::sync::Arc;

/// Receives progress updates while a stage's pages are written.
pub trait ProgressCallback: Send + Sync {
    /// Records were accepted into the current page buffer.
    fn records(&self, delta: u64);

    /// A page was persisted.
    fn page_written(&self, page_number: usize, path: &str);

    /// Update the message displayed alongside the progress indicator.
    fn set_message(&self, msg: String);

    /// The stage's pagination finished with a final message.
    fn finish(&self, msg: String);
}

/// Ignores every progress update.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn records(&self, _delta: u64) {}
    fn page_written(&self, _page_number: usize, _path: &str) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
}

/// Reports progress through the `log` facade.
pub struct LogProgress {
    label: String,
}

impl LogProgress {
    /// Creates a reporter that prefixes every line with `label`.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl ProgressCallback for LogProgress {
    fn records(&self, delta: u64) {
        log::trace!("[{}] +{delta} records", self.label);
    }

    fn page_written(&self, page_number: usize, path: &str) {
        log::info!("[{}] page {page_number} -> {path}", self.label);
    }

    fn set_message(&self, msg: String) {
        log::info!("[{}] {msg}", self.label);
    }

    fn finish(&self, msg: String) {
        log::info!("[{}] done: {msg}", self.label);
    }
}

/// Returns a shared [`NullProgress`] instance for convenient use.
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
