//! Resumable extraction checkpoint.
//!
//! Persisted on the job instance as a generic JSON map:
//!
//! ```json
//! {"completed_stages": ["commits", "prs"], "resume_from_project": "proj-42"}
//! ```
//!
//! Parsing of `completed_stages` is defensive: unknown stages and malformed
//! values are dropped with a warning instead of failing the job. Every other
//! key is a cursor and is kept verbatim, whatever its JSON type.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr as _;

use serde_json::Value;

use crate::Stage;

/// Generic string-keyed state map.
pub type StateMap = serde_json::Map<String, Value>;

/// Key holding the list of completed stages.
pub const COMPLETED_STAGES_KEY: &str = "completed_stages";
/// Cursor key naming the project to resume the current stage from.
pub const RESUME_FROM_PROJECT_KEY: &str = "resume_from_project";
/// Cursor key naming the organization to resume the current stage from.
pub const RESUME_FROM_ORGANIZATION_KEY: &str = "resume_from_organization";
/// Cursor key holding the next output page number of the stage in progress.
pub const NEXT_PAGE_KEY: &str = "next_page";

/// Completed stages plus the resume cursors of the stage in progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntermediateState {
    completed_stages: BTreeSet<Stage>,
    cursors: BTreeMap<String, Value>,
}

impl IntermediateState {
    /// Creates an empty state (nothing completed, no cursors).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a persisted state map.
    ///
    /// Never fails: anything that cannot be understood degrades to "not
    /// completed" or "no cursor".
    #[must_use]
    pub fn parse(map: &StateMap) -> Self {
        let mut state = Self::default();

        for (key, value) in map {
            if key == COMPLETED_STAGES_KEY {
                state.completed_stages = parse_completed_stages(value);
                continue;
            }

            state.cursors.insert(key.clone(), value.clone());
        }

        state
    }

    /// Serializes the state into its persisted map form.
    #[must_use]
    pub fn to_map(&self) -> StateMap {
        let mut map = StateMap::new();
        map.insert(
            COMPLETED_STAGES_KEY.to_string(),
            Value::Array(
                self.completed_stages
                    .iter()
                    .map(|stage| Value::String(stage.to_string()))
                    .collect(),
            ),
        );
        for (key, cursor) in &self.cursors {
            map.insert(key.clone(), cursor.clone());
        }
        map
    }

    /// Completed stages, in priority order.
    #[must_use]
    pub const fn completed_stages(&self) -> &BTreeSet<Stage> {
        &self.completed_stages
    }

    /// Whether `stage` has completed in this lineage.
    #[must_use]
    pub fn is_completed(&self, stage: Stage) -> bool {
        self.completed_stages.contains(&stage)
    }

    /// Marks `stage` complete and clears the cursors of the stage in
    /// progress.
    #[must_use]
    pub fn mark_completed(mut self, stage: Stage) -> Self {
        self.completed_stages.insert(stage);
        self.cursors.clear();
        self
    }

    /// Sets a resume cursor.
    #[must_use]
    pub fn with_cursor(mut self, key: impl Into<String>, cursor: impl Into<Value>) -> Self {
        self.cursors.insert(key.into(), cursor.into());
        self
    }

    /// Looks up a resume cursor.
    #[must_use]
    pub fn cursor(&self, key: &str) -> Option<&Value> {
        self.cursors.get(key)
    }

    /// Looks up a string resume cursor. Other JSON types read as `None`.
    #[must_use]
    pub fn cursor_str(&self, key: &str) -> Option<&str> {
        self.cursors.get(key).and_then(Value::as_str)
    }

    /// All resume cursors of the stage in progress.
    #[must_use]
    pub const fn cursors(&self) -> &BTreeMap<String, Value> {
        &self.cursors
    }

    /// Whether the stage in progress has a mid-stage resume point.
    #[must_use]
    pub fn has_cursor(&self) -> bool {
        !self.cursors.is_empty()
    }

    /// Project the stage in progress resumes from.
    #[must_use]
    pub fn resume_from_project(&self) -> Option<&str> {
        self.cursor_str(RESUME_FROM_PROJECT_KEY)
    }

    /// Organization the stage in progress resumes from.
    #[must_use]
    pub fn resume_from_organization(&self) -> Option<&str> {
        self.cursor_str(RESUME_FROM_ORGANIZATION_KEY)
    }

    /// Output page number the stage in progress continues from. Zero when
    /// the stage has not written any page yet.
    #[must_use]
    pub fn next_page(&self) -> usize {
        self.cursors
            .get(NEXT_PAGE_KEY)
            .and_then(Value::as_u64)
            .and_then(|page| usize::try_from(page).ok())
            .unwrap_or(0)
    }

    /// Records the output page number the stage in progress continues from.
    #[must_use]
    pub fn with_next_page(self, page: usize) -> Self {
        self.with_cursor(NEXT_PAGE_KEY, page)
    }

    /// Adopts the cursors of a failure snapshot.
    ///
    /// Completed stages are unioned, never dropped: a snapshot cannot undo
    /// a completion.
    #[must_use]
    pub fn absorb_snapshot(mut self, snapshot: &StateMap) -> Self {
        let snapshot = Self::parse(snapshot);
        self.completed_stages.extend(snapshot.completed_stages);
        self.cursors = snapshot.cursors;
        self
    }

    /// Forgets every completion and cursor. Operator-triggered full resync
    /// only.
    #[must_use]
    pub fn reset(self) -> Self {
        Self::default()
    }

    /// Forgets the completion of a single stage.
    #[must_use]
    pub fn reset_stage(mut self, stage: Stage) -> Self {
        self.completed_stages.remove(&stage);
        self
    }
}

fn parse_completed_stages(value: &Value) -> BTreeSet<Stage> {
    let Value::Array(items) = value else {
        if !value.is_null() {
            log::warn!("Ignoring malformed {COMPLETED_STAGES_KEY}: {value}");
        }
        return BTreeSet::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let parsed = item.as_str().and_then(|name| Stage::from_str(name).ok());
            if parsed.is_none() {
                log::warn!("Ignoring unknown completed stage {item}");
            }
            parsed
        })
        .collect()
}
