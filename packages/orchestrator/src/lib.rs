#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Composition root for one turn of a job instance.
//!
//! A turn loads the instance and its definition, resolves the eligible
//! parameter suppliers, decides the scan mode on the first turn, advances
//! at most one extraction stage and persists the outcome with a single
//! instance update.

pub mod orchestrator;
pub mod store;

pub use orchestrator::{JobOrchestrator, TurnReport};
pub use store::{InMemoryJobStore, JobDefinitionStore, JobInstanceStore, StoreError};

use etl_job_models::{JobInstanceId, JobStatus};
use etl_supplier::SupplierError;

/// Errors that can end a turn.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The instance does not exist.
    #[error("Job instance {0} not found")]
    InstanceNotFound(JobInstanceId),

    /// The instance's definition does not exist.
    #[error("Job definition {0} not found")]
    DefinitionNotFound(uuid::Uuid),

    /// The instance already reached a terminal status.
    #[error("Job instance {id} is already {status}")]
    AlreadyTerminal {
        /// The instance.
        id: JobInstanceId,
        /// Its terminal status.
        status: JobStatus,
    },

    /// The definition is inactive.
    #[error("Job definition {0} is inactive")]
    Inactive(uuid::Uuid),

    /// No supplier can run the job. The instance was marked
    /// [`JobStatus::Unsupported`].
    #[error("Unsupported job: {0}")]
    Unsupported(#[source] SupplierError),

    /// The job definition is misconfigured.
    #[error(transparent)]
    Supplier(SupplierError),

    /// Running the stage failed before its outcome could be recorded.
    #[error(transparent)]
    Stage(#[from] etl_stage::StageError),

    /// Reading or writing the job store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The turn exceeded its time budget.
    #[error("Job instance {0} timed out")]
    TimedOut(JobInstanceId),
}

impl OrchestratorError {
    /// Whether running the same turn again may succeed.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Stage(_) | Self::Store(_) | Self::TimedOut(_))
    }
}

impl From<SupplierError> for OrchestratorError {
    fn from(error: SupplierError) -> Self {
        match error {
            SupplierError::NotImplemented { .. } | SupplierError::NoEligibleSupplier { .. } => {
                Self::Unsupported(error)
            }
            other => Self::Supplier(other),
        }
    }
}
