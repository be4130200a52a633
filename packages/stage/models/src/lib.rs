#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Extraction stages, job categories and the resumable intermediate state.
//!
//! A multi-stage integration is extracted one [`Stage`] at a time, in the
//! fixed priority order given by the enum declaration. Progress is tracked
//! in an [`IntermediateState`] persisted on the job instance between turns.

pub mod selection;
pub mod state;

pub use selection::StageSelection;
pub use state::IntermediateState;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Output page size used by data types without their own.
pub const DEFAULT_OUTPUT_PAGE_SIZE: usize = 10;

/// One phase of a multi-phase vendor extraction.
///
/// Declaration order is the priority order. `Ord` follows it, so a
/// `BTreeSet<Stage>` iterates in priority order too.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Stage {
    /// Git commits
    Commits,
    /// Pull requests
    #[serde(alias = "pull_requests")]
    #[strum(to_string = "prs", serialize = "pull_requests")]
    Prs,
    /// Git tags
    Tags,
    /// TFVC branches
    Branches,
    /// TFVC changesets
    #[serde(alias = "change_sets")]
    #[strum(to_string = "changesets", serialize = "change_sets")]
    Changesets,
    /// TFVC labels
    Labels,
    /// Pipeline runs
    Pipelines,
    /// Releases
    Releases,
    /// Builds
    Builds,
    /// Work item field definitions
    #[serde(alias = "work_item_fields")]
    #[strum(to_string = "workitem_fields", serialize = "work_item_fields")]
    WorkitemFields,
    /// Board metadata (states, types, priorities)
    Metadata,
    /// Work items
    #[serde(alias = "work_items")]
    #[strum(to_string = "workitems", serialize = "work_items")]
    Workitems,
    /// Teams
    Teams,
    /// Sprints / iterations
    Iterations,
    /// Work item change histories
    #[serde(alias = "work_item_histories")]
    #[strum(to_string = "workitem_histories", serialize = "work_item_histories")]
    WorkitemHistories,
}

impl Stage {
    /// All stages, in priority order.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Commits,
            Self::Prs,
            Self::Tags,
            Self::Branches,
            Self::Changesets,
            Self::Labels,
            Self::Pipelines,
            Self::Releases,
            Self::Builds,
            Self::WorkitemFields,
            Self::Metadata,
            Self::Workitems,
            Self::Teams,
            Self::Iterations,
            Self::WorkitemHistories,
        ]
    }

    /// Job category the stage belongs to.
    #[must_use]
    pub const fn category(self) -> JobCategory {
        match self {
            Self::Commits | Self::Prs | Self::Tags => JobCategory::ScmGit,
            Self::Branches | Self::Changesets | Self::Labels => JobCategory::ScmTfvc,
            Self::Pipelines | Self::Releases | Self::Builds => JobCategory::Cicd,
            Self::WorkitemFields | Self::Metadata | Self::Workitems | Self::Teams => {
                JobCategory::Boards1
            }
            Self::Iterations | Self::WorkitemHistories => JobCategory::Boards2,
        }
    }

    /// Name of the output data type written by this stage.
    #[must_use]
    pub const fn data_type(self) -> &'static str {
        match self {
            Self::Commits => "commits",
            Self::Prs => "pullrequests",
            Self::Tags => "tags",
            Self::Branches => "tfvc-branches",
            Self::Changesets => "changesets",
            Self::Labels => "tfvc-labels",
            Self::Pipelines => "pipelines",
            Self::Releases => "releases",
            Self::Builds => "builds",
            Self::WorkitemFields => "workitemsfields",
            Self::Metadata => "metadata",
            Self::Workitems => "workitems",
            Self::Teams => "teams",
            Self::Iterations => "iterations",
            Self::WorkitemHistories => "workitemshistories",
        }
    }

    /// Metadata / ingestion flag that toggles the stage.
    #[must_use]
    pub const fn toggle_key(self) -> &'static str {
        match self {
            Self::Commits => "fetch_commits",
            Self::Prs => "fetch_prs",
            Self::Tags => "fetch_tags",
            Self::Branches => "fetch_branches",
            Self::Changesets => "fetch_change_sets",
            Self::Labels => "fetch_labels",
            Self::Pipelines => "fetch_pipelines",
            Self::Releases => "fetch_releases",
            Self::Builds => "fetch_builds",
            Self::WorkitemFields => "fetch_workitem_fields",
            Self::Metadata => "fetch_metadata",
            Self::Workitems => "fetch_work_items",
            Self::Teams => "fetch_teams",
            Self::Iterations => "fetch_iterations",
            Self::WorkitemHistories => "fetch_workitem_histories",
        }
    }

    /// Number of fetched records stored per output page.
    ///
    /// Records of some stages are themselves batches (a pipeline record
    /// carries its runs), so their pages hold fewer records.
    #[must_use]
    pub const fn output_page_size(self) -> usize {
        match self {
            Self::Pipelines | Self::Releases => 1,
            Self::Workitems | Self::Iterations => 2,
            Self::WorkitemHistories => 3,
            Self::Prs => 5,
            Self::Builds => 6,
            Self::Commits | Self::Labels => 9,
            Self::Branches | Self::WorkitemFields => 10,
            Self::Teams | Self::Tags => 15,
            Self::Changesets => 20,
            Self::Metadata => DEFAULT_OUTPUT_PAGE_SIZE,
        }
    }
}

/// Group of stages that a job definition can be restricted to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[strum(ascii_case_insensitive)]
pub enum JobCategory {
    /// Git repositories
    #[serde(rename = "SCM_GIT")]
    #[strum(serialize = "SCM_GIT")]
    ScmGit,
    /// TFVC repositories
    #[serde(rename = "SCM_TFVC")]
    #[strum(serialize = "SCM_TFVC")]
    ScmTfvc,
    /// Pipelines, releases and builds
    #[serde(rename = "CICD")]
    #[strum(serialize = "CICD")]
    Cicd,
    /// Boards: fields, metadata, work items and teams
    #[serde(rename = "BOARDS_1")]
    #[strum(serialize = "BOARDS_1")]
    Boards1,
    /// Boards: iterations and work item histories
    #[serde(rename = "BOARDS_2")]
    #[strum(serialize = "BOARDS_2")]
    Boards2,
}

impl JobCategory {
    /// Stages in this category, in priority order.
    #[must_use]
    pub fn stages(self) -> Vec<Stage> {
        Stage::all()
            .iter()
            .copied()
            .filter(|stage| stage.category() == self)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use super::*;

    #[test]
    fn all_is_in_declaration_order() {
        let mut sorted = Stage::all().to_vec();
        sorted.sort();
        assert_eq!(sorted, Stage::all());
    }

    #[test]
    fn every_stage_has_a_category() {
        let covered: usize = [
            JobCategory::ScmGit,
            JobCategory::ScmTfvc,
            JobCategory::Cicd,
            JobCategory::Boards1,
            JobCategory::Boards2,
        ]
        .iter()
        .map(|category| category.stages().len())
        .sum();
        assert_eq!(covered, Stage::all().len());
    }

    #[test]
    fn stage_names_round_trip() {
        for stage in Stage::all() {
            let name = stage.to_string();
            assert_eq!(Stage::from_str(&name).unwrap(), *stage);
            let json = serde_json::to_value(stage).unwrap();
            assert_eq!(json, serde_json::Value::String(name));
        }
    }

    #[test]
    fn stage_parses_aliases_and_upper_case() {
        assert_eq!(Stage::from_str("pull_requests").unwrap(), Stage::Prs);
        assert_eq!(Stage::from_str("PRS").unwrap(), Stage::Prs);
        assert_eq!(
            Stage::from_str("WORKITEM_HISTORIES").unwrap(),
            Stage::WorkitemHistories
        );
        assert!(Stage::from_str("deployments").is_err());
    }

    #[test]
    fn page_sizes_are_positive() {
        for stage in Stage::all() {
            assert!(stage.output_page_size() > 0, "{stage}");
        }
    }

    #[test]
    fn category_wire_names() {
        assert_eq!(JobCategory::Boards1.to_string(), "BOARDS_1");
        assert_eq!(JobCategory::from_str("scm_git").unwrap(), JobCategory::ScmGit);
        assert_eq!(
            serde_json::to_value(JobCategory::ScmTfvc).unwrap(),
            serde_json::Value::String("SCM_TFVC".to_string())
        );
    }
}
