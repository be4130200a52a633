//! Persistence seams for job definitions and instances.
//!
//! The relational store behind these traits is external; the in-memory
//! implementation serves tests, dry runs and the operator CLI.

use std::collections::BTreeMap;

use async_trait::async_trait;
use etl_job_models::{JobDefinition, JobInstance, JobInstanceId, JobInstanceUpdate, JobStatus};
use tokio::sync::RwLock;
use uuid::Uuid;

/// A persistence failure. Always worth retrying.
#[derive(Debug, thiserror::Error)]
#[error("Job store error: {message}")]
pub struct StoreError {
    /// What went wrong.
    pub message: String,
}

impl StoreError {
    /// Creates a store error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Reads and updates job instances.
#[async_trait]
pub trait JobInstanceStore: Send + Sync {
    /// Loads one instance.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be reached.
    async fn get_instance(&self, id: JobInstanceId) -> Result<Option<JobInstance>, StoreError>;

    /// Applies `update` to one instance atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the instance does not exist or the store
    /// cannot be reached.
    async fn update_instance(
        &self,
        id: JobInstanceId,
        update: JobInstanceUpdate,
    ) -> Result<(), StoreError>;

    /// Loads the most recent run before `id` in the same definition that
    /// ended in [`JobStatus::Success`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be reached.
    async fn last_successful_instance(
        &self,
        id: JobInstanceId,
    ) -> Result<Option<JobInstance>, StoreError> {
        for instance_id in (0..id.instance_id).rev() {
            let instance = self
                .get_instance(JobInstanceId {
                    job_definition_id: id.job_definition_id,
                    instance_id,
                })
                .await?;
            if let Some(instance) = instance.filter(|i| i.status == JobStatus::Success) {
                return Ok(Some(instance));
            }
        }
        Ok(None)
    }
}

/// Reads job definitions.
#[async_trait]
pub trait JobDefinitionStore: Send + Sync {
    /// Loads one definition.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be reached.
    async fn get_definition(&self, id: Uuid) -> Result<Option<JobDefinition>, StoreError>;
}

/// Keeps definitions and instances in memory.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    definitions: RwLock<BTreeMap<Uuid, JobDefinition>>,
    instances: RwLock<BTreeMap<JobInstanceId, JobInstance>>,
    updates: RwLock<Vec<JobInstanceId>>,
}

impl InMemoryJobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a definition.
    pub async fn put_definition(&self, definition: JobDefinition) {
        self.definitions
            .write()
            .await
            .insert(definition.id, definition);
    }

    /// Adds or replaces an instance.
    pub async fn put_instance(&self, instance: JobInstance) {
        self.instances.write().await.insert(instance.id, instance);
    }

    /// Ids passed to [`JobInstanceStore::update_instance`], in call order.
    pub async fn update_log(&self) -> Vec<JobInstanceId> {
        self.updates.read().await.clone()
    }
}

#[async_trait]
impl JobInstanceStore for InMemoryJobStore {
    async fn get_instance(&self, id: JobInstanceId) -> Result<Option<JobInstance>, StoreError> {
        Ok(self.instances.read().await.get(&id).cloned())
    }

    async fn update_instance(
        &self,
        id: JobInstanceId,
        update: JobInstanceUpdate,
    ) -> Result<(), StoreError> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(&id)
            .ok_or_else(|| StoreError::new(format!("Job instance {id} not found")))?;
        instance.apply(update);
        self.updates.write().await.push(id);
        Ok(())
    }

    async fn last_successful_instance(
        &self,
        id: JobInstanceId,
    ) -> Result<Option<JobInstance>, StoreError> {
        let start = JobInstanceId {
            job_definition_id: id.job_definition_id,
            instance_id: 0,
        };
        Ok(self
            .instances
            .read()
            .await
            .range(start..id)
            .rev()
            .map(|(_, instance)| instance)
            .find(|instance| instance.status == JobStatus::Success)
            .cloned())
    }
}

#[async_trait]
impl JobDefinitionStore for InMemoryJobStore {
    async fn get_definition(&self, id: Uuid) -> Result<Option<JobDefinition>, StoreError> {
        Ok(self.definitions.read().await.get(&id).cloned())
    }
}
