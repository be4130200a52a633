//! Folds a sequence of [`Data`] envelopes into an aggregate.
//!
//! The collector stops at the first [`Data::Failed`] envelope. [`collect`]
//! never polls the underlying stream again after that point, so a lazy
//! vendor stream makes no further requests once a fatal error is seen.

use std::ops::ControlFlow;

use futures::{Stream, StreamExt};

use crate::{Data, FetchError, IngestionFailure, StateMap};

/// Aggregate of a folded envelope sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorResult<T> {
    /// Records from every folded envelope, in sequence order.
    pub records: Vec<T>,
    /// Non-fatal failures from every folded envelope.
    pub ingestion_failures: Vec<IngestionFailure>,
    /// The fatal error, if the sequence ended with one.
    pub error: Option<FetchError>,
    /// Resume snapshot carried by the fatal envelope.
    pub intermediate_state: Option<StateMap>,
    /// Number of envelopes observed, including the fatal one.
    pub envelopes_observed: usize,
}

impl<T> CollectorResult<T> {
    /// Whether the sequence ended with a fatal failure.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Incremental envelope accumulator.
///
/// Callers that need to drain records as they arrive (e.g. to write output
/// pages) call [`Collector::take_records`] between envelopes.
#[derive(Debug)]
pub struct Collector<T> {
    records: Vec<T>,
    ingestion_failures: Vec<IngestionFailure>,
    error: Option<FetchError>,
    intermediate_state: Option<StateMap>,
    envelopes_observed: usize,
}

impl<T> Default for Collector<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            ingestion_failures: Vec::new(),
            error: None,
            intermediate_state: None,
            envelopes_observed: 0,
        }
    }
}

impl<T> Collector<T> {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one envelope.
    ///
    /// Returns [`ControlFlow::Break`] once a fatal envelope has been folded;
    /// any envelope offered after that is ignored.
    pub fn accept(&mut self, data: Data<T>) -> ControlFlow<()> {
        if self.error.is_some() {
            return ControlFlow::Break(());
        }

        self.envelopes_observed += 1;

        match data {
            Data::Basic(payload) => self.records.push(payload),
            Data::Ingestion { records, failures } => {
                self.records.extend(records);
                self.ingestion_failures.extend(failures);
            }
            Data::Failed {
                error,
                intermediate_state,
            } => {
                log::warn!(
                    "Fetch sequence failed after {} envelope(s): {error}",
                    self.envelopes_observed
                );
                self.error = Some(error);
                self.intermediate_state = intermediate_state;
                return ControlFlow::Break(());
            }
        }

        ControlFlow::Continue(())
    }

    /// Removes and returns the records folded so far.
    pub fn take_records(&mut self) -> Vec<T> {
        std::mem::take(&mut self.records)
    }

    /// Number of records currently buffered.
    #[must_use]
    pub const fn buffered(&self) -> usize {
        self.records.len()
    }

    /// Whether a fatal envelope has been folded.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Finishes folding.
    #[must_use]
    pub fn finish(self) -> CollectorResult<T> {
        CollectorResult {
            records: self.records,
            ingestion_failures: self.ingestion_failures,
            error: self.error,
            intermediate_state: self.intermediate_state,
            envelopes_observed: self.envelopes_observed,
        }
    }
}

/// Drains `stream` into a [`CollectorResult`], stopping at the first fatal
/// envelope without polling the stream any further.
pub async fn collect<T, S>(stream: S) -> CollectorResult<T>
where
    S: Stream<Item = Data<T>>,
{
    let mut stream = std::pin::pin!(stream);
    let mut collector = Collector::new();

    while let Some(data) = stream.next().await {
        if collector.accept(data).is_break() {
            break;
        }
    }

    collector.finish()
}
