#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Resumable multi-stage extraction.
//!
//! A [`machine::StageMachine`] owns one [`fetcher::StageFetcher`] per stage
//! and advances exactly one stage per turn, in priority order, writing the
//! stage's records through the paginated storage strategy.

pub mod fetcher;
pub mod machine;
pub mod pool;

pub use fetcher::{FetchContext, ONBOARDING_IN_DAYS, StageFetcher};
pub use machine::{MachineState, OutputOptions, StageMachine, StageTurn, TurnOutcome};
pub use pool::{EnrichedFetcher, ForkJoinPool};

use etl_stage_models::Stage;

/// Errors that can occur while running a stage.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Writing an output page failed.
    #[error(transparent)]
    Storage(#[from] etl_storage::StorageError),

    /// The enrichment thread pool could not be built.
    #[error("Failed to build enrichment pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    /// A stage was selected without a registered fetcher.
    #[error("No fetcher registered for stage {stage}")]
    MissingFetcher {
        /// The stage.
        stage: Stage,
    },
}
