//! Turns a stage's envelope stream into bounded output pages.
//!
//! Pages are written one at a time: the stream is only polled again once
//! the previous page is persisted. A [`Data::Failed`] envelope stops
//! pagination immediately. Records already buffered at that point are
//! still flushed, and the failure's resume snapshot is carried in the
//! [`StorageResult`].

use std::sync::Arc;

use etl_data::{Collector, Data, FetchError, IngestionFailure, StateMap};
use futures::{Stream, StreamExt as _};
use serde::Serialize;
use serde_json::Value;

use crate::progress::{ProgressCallback, null_progress};
use crate::{PageArtifact, PageStore, StorageError, page_path};

/// Output settings for one data type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageConfig {
    /// Output data type name; also the output directory.
    pub data_type: String,
    /// Maximum records per page.
    pub output_page_size: usize,
    /// Never write a page with zero records.
    pub skip_empty_results: bool,
    /// Prefix added to every file name so retried runs never overwrite
    /// earlier partial output.
    pub file_prefix: Option<String>,
    /// Number of the first page written. Non-zero when a stage resumes
    /// after earlier attempts already wrote pages.
    pub first_page: usize,
}

impl PageConfig {
    /// Creates a config that writes an empty page when nothing was fetched.
    #[must_use]
    pub fn new(data_type: impl Into<String>, output_page_size: usize) -> Self {
        Self {
            data_type: data_type.into(),
            output_page_size: output_page_size.max(1),
            skip_empty_results: false,
            file_prefix: None,
            first_page: 0,
        }
    }

    /// Continues page numbering at `page`.
    #[must_use]
    pub const fn with_first_page(mut self, page: usize) -> Self {
        self.first_page = page;
        self
    }

    /// Sets whether empty pages are skipped.
    #[must_use]
    pub const fn with_skip_empty_results(mut self, skip: bool) -> Self {
        self.skip_empty_results = skip;
        self
    }

    /// Prefixes file names with `<run_id>_`.
    #[must_use]
    pub fn with_unique_output_files(mut self, run_id: &str) -> Self {
        self.file_prefix = Some(format!("{run_id}_"));
        self
    }

    /// Relative path of a page.
    #[must_use]
    pub fn page_path(&self, page_number: Option<usize>) -> String {
        page_path(&self.data_type, self.file_prefix.as_deref(), page_number)
    }
}

/// Outcome of paginating one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageResult {
    /// Data type the pages were written for.
    pub data_type: String,
    /// Records written across all pages.
    pub records: usize,
    /// Written pages, in page-number order.
    pub pages: Vec<PageArtifact>,
    /// Non-fatal failures, including records that failed to serialize.
    pub ingestion_failures: Vec<IngestionFailure>,
    /// The fatal error that stopped pagination, if any.
    pub fatal_error: Option<FetchError>,
    /// Resume snapshot carried by the fatal envelope.
    pub intermediate_state: Option<StateMap>,
    /// Envelopes consumed from the stream, including the fatal one.
    pub envelopes_observed: usize,
    /// Number the next page of this stage would be written under.
    pub next_page: usize,
}

impl StorageResult {
    /// Whether pagination stopped on a fatal failure.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.fatal_error.is_some()
    }
}

/// Writes envelope streams as pages to a [`PageStore`].
pub struct PaginationStrategy {
    config: PageConfig,
    store: Arc<dyn PageStore>,
    progress: Arc<dyn ProgressCallback>,
}

impl PaginationStrategy {
    /// Creates a strategy writing to `store`.
    #[must_use]
    pub fn new(config: PageConfig, store: Arc<dyn PageStore>) -> Self {
        Self {
            config,
            store,
            progress: null_progress(),
        }
    }

    /// Reports progress to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Page settings in effect.
    #[must_use]
    pub const fn config(&self) -> &PageConfig {
        &self.config
    }

    /// Consumes `stream`, writing full pages as soon as they fill up.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if a page cannot be serialized or written.
    /// Fetch failures are not errors: they are reported in the result.
    pub async fn run<T, S>(&self, stream: S) -> Result<StorageResult, StorageError>
    where
        T: Serialize,
        S: Stream<Item = Data<T>>,
    {
        let mut stream = std::pin::pin!(stream);
        let mut collector = Collector::<Value>::new();
        let mut pending: Vec<Value> = Vec::new();
        let mut pages: Vec<PageArtifact> = Vec::new();
        let mut records = 0;
        let page_size = self.config.output_page_size;
        let first_page = self.config.first_page;

        self.progress.set_message(if first_page == 0 {
            format!("Writing {} pages", self.config.data_type)
        } else {
            format!(
                "Writing {} pages from page {first_page}",
                self.config.data_type
            )
        });

        while let Some(data) = stream.next().await {
            let flow = collector.accept(serialize_envelope(data));

            let taken = collector.take_records();
            self.progress.records(taken.len() as u64);
            pending.extend(taken);

            while pending.len() >= page_size {
                let page: Vec<Value> = pending.drain(..page_size).collect();
                records += page.len();
                pages.push(self.write(first_page + pages.len(), page).await?);
            }

            if flow.is_break() {
                break;
            }
        }

        if !pending.is_empty() {
            records += pending.len();
            pages.push(
                self.write(first_page + pages.len(), std::mem::take(&mut pending))
                    .await?,
            );
        }

        let result = collector.finish();

        if pages.is_empty()
            && first_page == 0
            && !self.config.skip_empty_results
            && !result.is_failed()
        {
            pages.push(self.write(0, Vec::new()).await?);
        }

        self.progress.finish(format!(
            "{} record(s) in {} page(s) for {}",
            records,
            pages.len(),
            self.config.data_type
        ));

        let next_page = first_page + pages.len();
        Ok(StorageResult {
            data_type: self.config.data_type.clone(),
            records,
            pages,
            ingestion_failures: result.ingestion_failures,
            fatal_error: result.error,
            intermediate_state: result.intermediate_state,
            envelopes_observed: result.envelopes_observed,
            next_page,
        })
    }

    /// Writes `value` as a single, unnumbered artifact.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the value cannot be serialized or
    /// written.
    pub async fn store_single<T: Serialize + Sync>(
        &self,
        value: &T,
    ) -> Result<PageArtifact, StorageError> {
        let path = self.config.page_path(None);
        let content = serde_json::to_vec(value)?;
        let artifact_id = self.store.write_page(&path, content).await?;
        Ok(PageArtifact {
            path,
            artifact_id,
            page_number: None,
            records: 1,
        })
    }

    async fn write(
        &self,
        page_number: usize,
        page: Vec<Value>,
    ) -> Result<PageArtifact, StorageError> {
        let path = self.config.page_path(Some(page_number));
        let count = page.len();
        let content = serde_json::to_vec(&serde_json::json!({ "records": page }))?;
        let artifact_id = self.store.write_page(&path, content).await?;
        self.progress.page_written(page_number, &path);
        Ok(PageArtifact {
            path,
            artifact_id,
            page_number: Some(page_number),
            records: count,
        })
    }
}

/// Serializes every record of an envelope, turning records that fail to
/// serialize into ingestion failures.
fn serialize_envelope<T: Serialize>(data: Data<T>) -> Data<Value> {
    match data {
        Data::Basic(payload) => match serde_json::to_value(payload) {
            Ok(value) => Data::Basic(value),
            Err(e) => Data::Ingestion {
                records: Vec::new(),
                failures: vec![serialization_failure(&e)],
            },
        },
        Data::Ingestion {
            records,
            mut failures,
        } => {
            let mut values = Vec::with_capacity(records.len());
            for record in records {
                match serde_json::to_value(record) {
                    Ok(value) => values.push(value),
                    Err(e) => failures.push(serialization_failure(&e)),
                }
            }
            Data::Ingestion {
                records: values,
                failures,
            }
        }
        Data::Failed {
            error,
            intermediate_state,
        } => Data::Failed {
            error,
            intermediate_state,
        },
    }
}

fn serialization_failure(error: &serde_json::Error) -> IngestionFailure {
    log::warn!("Dropping record that failed to serialize: {error}");
    IngestionFailure::error(format!("Failed to serialize record: {error}"))
}
