//! Drives a multi-stage extraction one stage per turn.
//!
//! A turn parses nothing and persists nothing itself: the caller hands in
//! the current [`IntermediateState`] and gets the next one back in the
//! [`StageTurn`], to be persisted in a single write.

use std::collections::BTreeMap;
use std::sync::Arc;

use etl_data::FetchError;
use etl_stage_models::{IntermediateState, Stage, StageSelection};
use etl_storage::PageStore;
use etl_storage::pagination::{PageConfig, PaginationStrategy, StorageResult};
use etl_storage::progress::{ProgressCallback, null_progress};
use serde_json::Value;

use crate::StageError;
use crate::fetcher::{FetchContext, StageFetcher};

/// Where a job lineage stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineState {
    /// No stage has completed or been started.
    NotStarted,
    /// `stage` is next; `cursor` holds its mid-stage resume point, if any.
    StageInProgress {
        /// Next stage to run.
        stage: Stage,
        /// Resume cursors from the last failed attempt.
        cursor: BTreeMap<String, Value>,
    },
    /// Every runnable stage has completed.
    AllStagesComplete,
}

/// Output options shared by every stage of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputOptions {
    /// Never write pages with zero records.
    pub skip_empty_results: bool,
    /// Prefix output files with this run id.
    pub unique_run_id: Option<String>,
}

impl OutputOptions {
    /// Page settings for `stage`.
    #[must_use]
    pub fn page_config(&self, stage: Stage) -> PageConfig {
        let config = PageConfig::new(stage.data_type(), stage.output_page_size())
            .with_skip_empty_results(self.skip_empty_results);
        match &self.unique_run_id {
            Some(run_id) => config.with_unique_output_files(run_id),
            None => config,
        }
    }
}

/// What one turn did.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Nothing left to run; no fetcher was called.
    AllStagesComplete,
    /// `stage` finished; `remaining` runnable stages are still pending.
    StageCompleted {
        /// Stage that completed.
        stage: Stage,
        /// Runnable stages still incomplete.
        remaining: usize,
    },
    /// `stage` hit a fatal fetch error and stays incomplete.
    StageFailed {
        /// Stage that failed.
        stage: Stage,
        /// The fatal error.
        error: FetchError,
    },
}

/// Result of [`StageMachine::run_turn`].
#[derive(Debug, Clone, PartialEq)]
pub struct StageTurn {
    /// State to persist.
    pub state: IntermediateState,
    /// What happened.
    pub outcome: TurnOutcome,
    /// Pages written by the stage that ran, if any.
    pub storage: Option<StorageResult>,
}

impl StageTurn {
    /// Whether no further turn is needed.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(
            self.outcome,
            TurnOutcome::AllStagesComplete | TurnOutcome::StageCompleted { remaining: 0, .. }
        )
    }
}

/// Ordered stage runner for one job configuration.
pub struct StageMachine {
    fetchers: BTreeMap<Stage, Arc<dyn StageFetcher>>,
    selection: StageSelection,
    output: OutputOptions,
    progress: Arc<dyn ProgressCallback>,
}

impl StageMachine {
    /// Creates a machine with no fetchers.
    #[must_use]
    pub fn new(selection: StageSelection) -> Self {
        Self {
            fetchers: BTreeMap::new(),
            selection,
            output: OutputOptions::default(),
            progress: null_progress(),
        }
    }

    /// Registers the fetcher for its stage, replacing any previous one.
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn StageFetcher>) -> Self {
        self.register(fetcher);
        self
    }

    /// Registers the fetcher for its stage, replacing any previous one.
    pub fn register(&mut self, fetcher: Arc<dyn StageFetcher>) {
        let stage = fetcher.stage();
        if self.fetchers.insert(stage, fetcher).is_some() {
            log::warn!("Replacing fetcher for stage {stage}");
        }
    }

    /// Sets the output options.
    #[must_use]
    pub fn with_output(mut self, output: OutputOptions) -> Self {
        self.output = output;
        self
    }

    /// Reports page progress to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Stage selection in effect.
    #[must_use]
    pub const fn selection(&self) -> &StageSelection {
        &self.selection
    }

    /// Whether `stage` is enabled and has a fetcher.
    #[must_use]
    pub fn is_runnable(&self, stage: Stage) -> bool {
        self.selection.is_enabled(stage) && self.fetchers.contains_key(&stage)
    }

    /// Runnable stages not completed in `state`, in priority order.
    #[must_use]
    pub fn pending_stages(&self, state: &IntermediateState) -> Vec<Stage> {
        Stage::all()
            .iter()
            .copied()
            .filter(|stage| self.is_runnable(*stage) && !state.is_completed(*stage))
            .collect()
    }

    /// First runnable stage not completed in `state`. Pure: asking twice
    /// for the same state gives the same answer.
    #[must_use]
    pub fn next_stage(&self, state: &IntermediateState) -> Option<Stage> {
        Stage::all()
            .iter()
            .copied()
            .find(|stage| self.is_runnable(*stage) && !state.is_completed(*stage))
    }

    /// Classifies `state`.
    #[must_use]
    pub fn machine_state(&self, state: &IntermediateState) -> MachineState {
        match self.next_stage(state) {
            None => MachineState::AllStagesComplete,
            Some(_) if state.completed_stages().is_empty() && !state.has_cursor() => {
                MachineState::NotStarted
            }
            Some(stage) => MachineState::StageInProgress {
                stage,
                cursor: state.cursors().clone(),
            },
        }
    }

    /// Runs exactly one stage, the first runnable incomplete one.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Storage`] if a page cannot be written. Fetch
    /// failures are not errors: they end the turn with
    /// [`TurnOutcome::StageFailed`] and the failure's resume cursors.
    pub async fn run_turn(
        &self,
        context: &FetchContext,
        state: IntermediateState,
        store: Arc<dyn PageStore>,
    ) -> Result<StageTurn, StageError> {
        let Some(stage) = self.next_stage(&state) else {
            log::info!("All stages complete for tenant {}", context.tenant_id);
            return Ok(StageTurn {
                state,
                outcome: TurnOutcome::AllStagesComplete,
                storage: None,
            });
        };

        let fetcher = self
            .fetchers
            .get(&stage)
            .ok_or(StageError::MissingFetcher { stage })?;

        if state.has_cursor() {
            log::info!("Resuming stage {stage} from {:?}", state.cursors());
        } else {
            log::info!("Starting stage {stage}");
        }

        let page_config = self
            .output
            .page_config(stage)
            .with_first_page(state.next_page());
        let strategy =
            PaginationStrategy::new(page_config, store).with_progress(self.progress.clone());
        let storage = strategy.run(fetcher.fetch(context, &state)).await?;

        log::info!(
            "Stage {stage}: {} record(s), {} page(s), {} ingestion failure(s)",
            storage.records,
            storage.pages.len(),
            storage.ingestion_failures.len()
        );

        let (state, outcome) = match &storage.fatal_error {
            Some(error) => {
                log::warn!("Stage {stage} failed, will resume: {error}");
                let state = match &storage.intermediate_state {
                    Some(snapshot) => state.absorb_snapshot(snapshot),
                    None => state,
                }
                .with_next_page(storage.next_page);
                (
                    state,
                    TurnOutcome::StageFailed {
                        stage,
                        error: error.clone(),
                    },
                )
            }
            None => {
                let state = state.mark_completed(stage);
                let remaining = self.pending_stages(&state).len();
                (state, TurnOutcome::StageCompleted { stage, remaining })
            }
        };

        Ok(StageTurn {
            state,
            outcome,
            storage: Some(storage),
        })
    }
}
