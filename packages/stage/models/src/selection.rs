//! Which stages a job run is allowed to execute.
//!
//! Stages are toggled by the integration's metadata and by per-run
//! ingestion flags, both keyed by [`Stage::toggle_key`]. A `false` in either
//! place disables the stage. Releases are opt-in: they only run when the
//! integration metadata explicitly enables them. Tags are only fetched on
//! onboarding scans.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::state::StateMap;
use crate::{JobCategory, Stage};

/// Set of stages enabled for one job configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSelection {
    category: Option<JobCategory>,
    disabled: BTreeSet<Stage>,
    onboarding: bool,
}

impl Default for StageSelection {
    fn default() -> Self {
        Self {
            category: None,
            disabled: BTreeSet::new(),
            onboarding: true,
        }
    }
}

impl StageSelection {
    /// Enables every stage.
    #[must_use]
    pub fn everything() -> Self {
        Self::default()
    }

    /// Builds the selection from integration metadata and ingestion flags.
    #[must_use]
    pub fn from_flags(
        metadata: &StateMap,
        flags: &StateMap,
        category: Option<JobCategory>,
        onboarding: bool,
    ) -> Self {
        let disabled = Stage::all()
            .iter()
            .copied()
            .filter(|stage| {
                let key = stage.toggle_key();
                let in_metadata = metadata.get(key).and_then(Value::as_bool);
                let in_flags = flags.get(key).and_then(Value::as_bool);

                let opted_out = in_metadata == Some(false) || in_flags == Some(false);
                let missing_opt_in = *stage == Stage::Releases && in_metadata != Some(true);
                opted_out || missing_opt_in
            })
            .collect();

        Self {
            category,
            disabled,
            onboarding,
        }
    }

    /// Restricts the selection to one category.
    #[must_use]
    pub const fn with_category(mut self, category: JobCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Sets whether this is an onboarding (full) scan.
    #[must_use]
    pub const fn with_onboarding(mut self, onboarding: bool) -> Self {
        self.onboarding = onboarding;
        self
    }

    /// Disables a single stage.
    #[must_use]
    pub fn without(mut self, stage: Stage) -> Self {
        self.disabled.insert(stage);
        self
    }

    /// Whether `stage` may run.
    #[must_use]
    pub fn is_enabled(&self, stage: Stage) -> bool {
        if self
            .category
            .is_some_and(|category| stage.category() != category)
        {
            return false;
        }
        if stage == Stage::Tags && !self.onboarding {
            return false;
        }
        !self.disabled.contains(&stage)
    }

    /// Enabled stages, in priority order.
    #[must_use]
    pub fn enabled_stages(&self) -> Vec<Stage> {
        Stage::all()
            .iter()
            .copied()
            .filter(|stage| self.is_enabled(*stage))
            .collect()
    }
}
