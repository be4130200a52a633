//! Page store backed by an S3-compatible bucket.
//!
//! Uploads skip the `PutObject` when the remote object's `ETag` already
//! equals the MD5 of the page, so a retried turn that regenerates the same
//! pages costs one `HeadObject` per page.
//!
//! # Environment Variables
//!
//! | Variable | Required | Description |
//! |---|---|---|
//! | `ETL_S3_BUCKET` | Yes | Bucket receiving output pages |
//! | `ETL_S3_ENDPOINT` | Yes | S3-compatible endpoint URL |
//! | `ETL_S3_ACCESS_KEY_ID` | Yes | Access key |
//! | `ETL_S3_SECRET_ACCESS_KEY` | Yes | Secret key |
//! | `ETL_S3_PREFIX` | No | Key prefix prepended to every page path |

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::{Credentials, StalledStreamProtectionConfig};
use aws_sdk_s3::primitives::ByteStream;

use crate::{PageStore, StorageError, validate_relative_path};

/// Writes pages as objects in one bucket.
pub struct S3PageStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3PageStore {
    /// Creates a store from an existing client.
    #[must_use]
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: None,
        }
    }

    /// Prepends `prefix` to every object key.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Creates a store from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::MissingEnv`] if any required variable is
    /// unset.
    pub fn from_env() -> Result<Self, StorageError> {
        let bucket = require_env("ETL_S3_BUCKET")?;
        let endpoint = require_env("ETL_S3_ENDPOINT")?;
        let access_key = require_env("ETL_S3_ACCESS_KEY_ID")?;
        let secret_key = require_env("ETL_S3_SECRET_ACCESS_KEY")?;

        let creds = Credentials::new(&access_key, &secret_key, None, None, "etl-env");

        let config = aws_sdk_s3::Config::builder()
            .endpoint_url(&endpoint)
            .region(Region::new("auto"))
            .credentials_provider(creds)
            .force_path_style(true)
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled())
            .build();

        let store = Self::new(aws_sdk_s3::Client::from_conf(config), bucket);
        Ok(match std::env::var("ETL_S3_PREFIX") {
            Ok(prefix) if !prefix.is_empty() => store.with_prefix(prefix),
            _ => store,
        })
    }

    fn key_for(&self, relative_path: &str) -> String {
        object_key(self.prefix.as_deref(), relative_path)
    }

    /// Fetches the remote `ETag`, or `None` if the object does not exist.
    async fn head_etag(&self, key: &str) -> Result<Option<String>, StorageError> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => Ok(Some(output.e_tag().unwrap_or_default().to_string())),
            Err(err) => {
                let service_err = err.as_service_error();
                if service_err
                    .is_some_and(aws_sdk_s3::operation::head_object::HeadObjectError::is_not_found)
                {
                    return Ok(None);
                }
                Err(StorageError::Head {
                    bucket: self.bucket.clone(),
                    key: key.to_string(),
                    source: Box::new(err),
                })
            }
        }
    }
}

#[async_trait]
impl PageStore for S3PageStore {
    async fn write_page(
        &self,
        relative_path: &str,
        content: Vec<u8>,
    ) -> Result<String, StorageError> {
        validate_relative_path(relative_path)?;

        let key = self.key_for(relative_path);
        let artifact = format!("s3://{}/{key}", self.bucket);

        if let Some(etag) = self.head_etag(&key).await?
            && etag_matches(&etag, &content)
        {
            log::info!("  {artifact}: skipped (unchanged)");
            return Ok(artifact);
        }

        let size = content.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(content))
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StorageError::Upload {
                bucket: self.bucket.clone(),
                key: key.clone(),
                source: Box::new(e),
            })?;

        log::info!("  {artifact}: uploaded ({size} bytes)");
        Ok(artifact)
    }
}

fn object_key(prefix: Option<&str>, relative_path: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}/{relative_path}", prefix.trim_end_matches('/')),
        None => relative_path.to_string(),
    }
}

/// Whether a remote `ETag` is the MD5 of `content`.
///
/// Multipart `ETag`s (containing `-`) never match: pages are uploaded with
/// a single `PutObject`.
fn etag_matches(etag: &str, content: &[u8]) -> bool {
    let clean = etag.trim_matches('"');
    if clean.is_empty() || clean.contains('-') {
        return false;
    }
    let mut context = md5::Context::new();
    context.consume(content);
    format!("{:x}", context.finalize()) == clean
}

/// Reads a required environment variable.
fn require_env(name: &str) -> Result<String, StorageError> {
    std::env::var(name).map_err(|_| StorageError::MissingEnv {
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_md5_etag_matches() {
        // md5("hello")
        let etag = "\"5d41402abc4b2a76b9719d911017c592\"";
        assert!(etag_matches(etag, b"hello"));
        assert!(!etag_matches(etag, b"hello!"));
    }

    #[test]
    fn multipart_etag_never_matches() {
        assert!(!etag_matches("\"5d41402abc4b2a76b9719d911017c592-2\"", b"hello"));
        assert!(!etag_matches("", b""));
    }

    #[test]
    fn keys_join_prefix() {
        assert_eq!(object_key(None, "prs/prs.0.json"), "prs/prs.0.json");
        assert_eq!(
            object_key(Some("tenant-1/"), "prs/prs.0.json"),
            "tenant-1/prs/prs.0.json"
        );
    }
}
