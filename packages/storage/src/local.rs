//! Page store backed by a local directory.
//!
//! Pages are written to a temporary sibling file and renamed into place, so
//! a crashed write never leaves a truncated page behind and a retried write
//! simply replaces the previous copy.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::{PageStore, StorageError, validate_relative_path};

/// Environment variable naming the output root directory.
pub const OUTPUT_DIR_ENV: &str = "ETL_OUTPUT_DIR";

/// Writes pages below a root directory.
#[derive(Debug, Clone)]
pub struct LocalPageStore {
    root: PathBuf,
}

impl LocalPageStore {
    /// Creates a store rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates a store rooted at `$ETL_OUTPUT_DIR`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::MissingEnv`] if the variable is unset.
    pub fn from_env() -> Result<Self, StorageError> {
        std::env::var(OUTPUT_DIR_ENV)
            .map(Self::new)
            .map_err(|_| StorageError::MissingEnv {
                name: OUTPUT_DIR_ENV.to_string(),
            })
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl PageStore for LocalPageStore {
    async fn write_page(
        &self,
        relative_path: &str,
        content: Vec<u8>,
    ) -> Result<String, StorageError> {
        validate_relative_path(relative_path)?;

        let target = self.root.join(relative_path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = target.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &content).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        log::debug!("Wrote {} ({} bytes)", target.display(), content.len());
        Ok(target.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalPageStore::new(dir.path());

        let id = store
            .write_page("prs/prs.0.json", br#"{"records":[]}"#.to_vec())
            .await
            .unwrap();

        let written = dir.path().join("prs/prs.0.json");
        assert_eq!(id, written.display().to_string());
        assert_eq!(
            std::fs::read_to_string(&written).unwrap(),
            r#"{"records":[]}"#
        );
    }

    #[tokio::test]
    async fn rewrite_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalPageStore::new(dir.path());

        store
            .write_page("builds/builds.0.json", b"first".to_vec())
            .await
            .unwrap();
        store
            .write_page("builds/builds.0.json", b"second".to_vec())
            .await
            .unwrap();

        let entries = std::fs::read_dir(dir.path().join("builds")).unwrap().count();
        assert_eq!(entries, 1);
        assert_eq!(
            std::fs::read(dir.path().join("builds/builds.0.json")).unwrap(),
            b"second"
        );
    }

    #[tokio::test]
    async fn refuses_paths_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalPageStore::new(dir.path());
        let result = store.write_page("../escape.json", b"x".to_vec()).await;
        assert!(matches!(result, Err(StorageError::InvalidPath { .. })));
    }
}
