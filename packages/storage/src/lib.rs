#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Paginated output pages and the stores that persist them.
//!
//! A [`pagination::PaginationStrategy`] turns a stream of fetch envelopes
//! into bounded JSON pages and hands each page to a [`PageStore`]. Stores
//! must tolerate the same page being written twice: a retried turn may
//! rewrite pages it already produced.

pub mod local;
pub mod memory;
pub mod pagination;
pub mod progress;
pub mod s3;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors that can occur while persisting output pages.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Missing required environment variable.
    #[error("Missing environment variable: {name}")]
    MissingEnv {
        /// Name of the missing environment variable.
        name: String,
    },

    /// Page content could not be serialized.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error writing a local page.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The page path would escape the store root.
    #[error("Invalid page path: {path}")]
    InvalidPath {
        /// Offending relative path.
        path: String,
    },

    /// S3 `PutObject` failed.
    #[error("Failed to upload s3://{bucket}/{key}: {source}")]
    Upload {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// S3 `HeadObject` failed.
    #[error("Failed to head s3://{bucket}/{key}: {source}")]
    Head {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Destination for output pages.
#[async_trait]
pub trait PageStore: Send + Sync {
    /// Persists `content` under `relative_path`, returning an artifact id.
    ///
    /// Writing identical content to the same path twice must succeed and
    /// leave one artifact.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the page cannot be persisted.
    async fn write_page(&self, relative_path: &str, content: Vec<u8>)
    -> Result<String, StorageError>;
}

/// One persisted output page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageArtifact {
    /// Path relative to the store root.
    pub path: String,
    /// Identifier returned by the store.
    pub artifact_id: String,
    /// Page number within the run, or `None` for single-artifact output.
    pub page_number: Option<usize>,
    /// Records on the page.
    pub records: usize,
}

/// Builds the deterministic relative path of an output page:
/// `<data_type>/<prefix><data_type>[.<page_number>].json`.
#[must_use]
pub fn page_path(data_type: &str, prefix: Option<&str>, page_number: Option<usize>) -> String {
    let prefix = prefix.unwrap_or_default();
    page_number.map_or_else(
        || format!("{data_type}/{prefix}{data_type}.json"),
        |number| format!("{data_type}/{prefix}{data_type}.{number}.json"),
    )
}

/// Rejects paths that are absolute or walk out of the store root.
fn validate_relative_path(relative_path: &str) -> Result<(), StorageError> {
    let path = std::path::Path::new(relative_path);
    let escapes = path.components().any(|component| {
        !matches!(component, std::path::Component::Normal(_))
    });
    if relative_path.is_empty() || escapes {
        return Err(StorageError::InvalidPath {
            path: relative_path.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_path_with_number() {
        assert_eq!(
            page_path("commits", None, Some(3)),
            "commits/commits.3.json"
        );
    }

    #[test]
    fn page_path_with_prefix_and_no_number() {
        assert_eq!(
            page_path("metadata", Some("run-1_"), None),
            "metadata/run-1_metadata.json"
        );
    }

    #[test]
    fn rejects_escaping_paths() {
        assert!(validate_relative_path("commits/commits.0.json").is_ok());
        assert!(validate_relative_path("../secrets.json").is_err());
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("").is_err());
    }
}
