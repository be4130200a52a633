#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Fetch envelopes and the collector that folds them.
//!
//! Every vendor fetch yields a lazy sequence of [`Data`] envelopes, one per
//! unit of work. An envelope either carries records (optionally alongside
//! per-record [`IngestionFailure`]s) or reports a fatal failure together with
//! a resumable state snapshot. A [`Data::Failed`] envelope ends the sequence:
//! consumers stop polling as soon as they see one.

pub mod collector;

pub use collector::{Collector, CollectorResult, collect};

use serde::{Deserialize, Serialize};

/// Generic string-keyed state map, as persisted on a job instance.
pub type StateMap = serde_json::Map<String, serde_json::Value>;

/// How bad a non-fatal ingestion failure is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// The record was fetched but some of its enrichment is missing.
    Warning,
    /// The record could not be fetched or parsed at all.
    Error,
}

/// A non-fatal, per-record extraction failure.
///
/// Recorded next to the successful records of the same unit of work; never
/// stops the stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionFailure {
    /// Human-readable description of what failed.
    pub message: String,
    /// Severity of the failure.
    pub severity: Severity,
    /// Vendor URL or entity key that failed, when known.
    pub url: Option<String>,
}

impl IngestionFailure {
    /// Creates an [`Severity::Error`] failure with the given message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Error,
            url: None,
        }
    }

    /// Creates a [`Severity::Warning`] failure with the given message.
    #[must_use]
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Warning,
            url: None,
        }
    }

    /// Attaches the failing URL or entity key.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// A fatal, stream-level fetch error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct FetchError {
    /// Description of the failure, including the vendor-side cause.
    pub message: String,
}

impl FetchError {
    /// Creates a fetch error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Wraps any error, prefixing it with `context`.
    #[must_use]
    pub fn caused_by(context: &str, error: &dyn std::error::Error) -> Self {
        Self::new(format!("{context}: {error}"))
    }
}

/// Outcome of one unit of fetch work.
#[derive(Debug, Clone, PartialEq)]
pub enum Data<T> {
    /// A single present payload.
    Basic(T),
    /// A batch of records with any per-record failures.
    Ingestion {
        /// Successfully fetched records.
        records: Vec<T>,
        /// Records that could not be fetched.
        failures: Vec<IngestionFailure>,
    },
    /// A fatal failure. Terminal for the current fetch sequence.
    Failed {
        /// What went wrong.
        error: FetchError,
        /// State snapshot with enough cursor information to resume
        /// mid-stage, if the fetcher could provide one.
        intermediate_state: Option<StateMap>,
    },
}

impl<T> Data<T> {
    /// Wraps a batch of records that had no failures.
    #[must_use]
    pub const fn records(records: Vec<T>) -> Self {
        Self::Ingestion {
            records,
            failures: Vec::new(),
        }
    }

    /// Creates a fatal failure carrying a resumable snapshot.
    #[must_use]
    pub fn failed(error: impl Into<String>, intermediate_state: Option<StateMap>) -> Self {
        Self::Failed {
            error: FetchError::new(error),
            intermediate_state,
        }
    }

    /// Whether this envelope terminates the sequence.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Maps the payload type, leaving failures untouched.
    #[must_use]
    pub fn map<U, F>(self, mut f: F) -> Data<U>
    where
        F: FnMut(T) -> U,
    {
        match self {
            Self::Basic(payload) => Data::Basic(f(payload)),
            Self::Ingestion { records, failures } => Data::Ingestion {
                records: records.into_iter().map(f).collect(),
                failures,
            },
            Self::Failed {
                error,
                intermediate_state,
            } => Data::Failed {
                error,
                intermediate_state,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_preserves_failures() {
        let data = Data::Ingestion {
            records: vec![1, 2],
            failures: vec![IngestionFailure::warning("missing logs")],
        };
        let mapped = data.map(|n| n * 10);
        assert_eq!(
            mapped,
            Data::Ingestion {
                records: vec![10, 20],
                failures: vec![IngestionFailure::warning("missing logs")],
            }
        );
    }

    #[test]
    fn map_keeps_failed_snapshot() {
        let mut snapshot = StateMap::new();
        snapshot.insert("resume_from_project".to_string(), "proj-42".into());
        let data: Data<i32> = Data::failed("boom", Some(snapshot.clone()));
        let mapped = data.map(|n| n.to_string());
        assert!(mapped.is_failed());
        match mapped {
            Data::Failed {
                error,
                intermediate_state,
            } => {
                assert_eq!(error.message, "boom");
                assert_eq!(intermediate_state, Some(snapshot));
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn failure_serializes_camel_case() {
        let failure = IngestionFailure::error("bad record").with_url("https://vendor/1");
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["severity"], "ERROR");
        assert_eq!(json["url"], "https://vendor/1");
    }
}
