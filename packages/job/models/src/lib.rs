#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Job definition, job instance, job type and status types.
//!
//! A [`JobDefinition`] is the static configuration of a recurring extraction
//! job; a [`JobInstance`] is one run of it. Only the fields the scheduler
//! reads and writes are modelled here.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Generic string-keyed map stored on job definitions and instances.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Definition metadata key holding an explicit full-scan override.
pub const FORCE_FULL_KEY: &str = "force_full";

/// The kind of job a definition schedules. Determines which parameter
/// suppliers are candidates for it.
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
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum JobType {
    /// Tenant-scoped job with no integration.
    GenericTenantJob,
    /// Job scoped to one integration of one tenant.
    GenericIntegrationJob,
    /// Processes the output artifacts of a finished ingestion run.
    IngestionResultProcessingJob,
}

impl JobType {
    /// All job types.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::GenericTenantJob,
            Self::GenericIntegrationJob,
            Self::IngestionResultProcessingJob,
        ]
    }

    /// Whether jobs of this type are scoped to a single integration.
    #[must_use]
    pub const fn is_integration_scoped(self) -> bool {
        !matches!(self, Self::GenericTenantJob)
    }
}

/// External vendor system an integration connects to.
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
pub enum IntegrationType {
    /// GitHub cloud or enterprise
    Github,
    /// GitLab
    Gitlab,
    /// Bitbucket cloud
    Bitbucket,
    /// Bitbucket server
    BitbucketServer,
    /// Azure `DevOps` (repos, pipelines and boards)
    AzureDevops,
    /// Jira
    Jira,
    /// Jenkins
    Jenkins,
    /// `PagerDuty`
    Pagerduty,
    /// `SonarQube`
    Sonarqube,
    /// `CircleCI`
    Circleci,
    /// `TestRail`
    Testrail,
    /// Zendesk
    Zendesk,
}

/// Lifecycle status of a job instance.
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
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Created by the scheduler, not yet picked up.
    Scheduled,
    /// Picked up at least once; more turns are needed.
    Pending,
    /// A turn is executing.
    Running,
    /// Every stage completed.
    Success,
    /// Failed without a usable checkpoint.
    Failure,
    /// Failed mid-stage; the next turn resumes from the checkpoint.
    PartialSuccess,
    /// Aborted by an operator.
    Canceled,
    /// No supplier exists for the job's configuration. Retrying cannot
    /// succeed without a code or config change.
    Unsupported,
}

impl JobStatus {
    /// Whether the instance can no longer change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::Canceled | Self::Unsupported
        )
    }

    /// Whether the scheduler should run another turn of the instance.
    #[must_use]
    pub const fn should_resume(self) -> bool {
        matches!(
            self,
            Self::Scheduled | Self::Pending | Self::PartialSuccess
        )
    }
}

/// Recurring extraction job descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    /// Primary key.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// Integration the job is scoped to, for integration jobs.
    pub integration_id: Option<String>,
    /// Vendor of the integration, for integration jobs.
    pub integration_type: Option<IntegrationType>,
    /// What kind of job this is.
    pub job_type: JobType,
    /// Name of the processor that handles the job's output.
    pub processor_name: String,
    /// Inactive definitions are never scheduled.
    pub is_active: bool,
    /// Scheduler priority for new instances; lower runs first.
    #[serde(default)]
    pub default_priority: u32,
    /// Minutes between forced full scans, overriding the supplier default.
    pub full_frequency_in_minutes: Option<u32>,
    /// When the most recent full scan started.
    pub last_full_sync_started_at: Option<DateTime<Utc>>,
    /// Free-form scheduling metadata (stage toggles, overrides).
    #[serde(default)]
    pub metadata: JsonMap,
}

impl JobDefinition {
    /// Creates an active definition with no schedule overrides.
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, job_type: JobType) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            integration_id: None,
            integration_type: None,
            job_type,
            processor_name: String::new(),
            is_active: true,
            default_priority: 0,
            full_frequency_in_minutes: None,
            last_full_sync_started_at: None,
            metadata: JsonMap::new(),
        }
    }

    /// Scopes the definition to one integration.
    #[must_use]
    pub fn with_integration(
        mut self,
        integration_type: IntegrationType,
        integration_id: impl Into<String>,
    ) -> Self {
        self.integration_type = Some(integration_type);
        self.integration_id = Some(integration_id.into());
        self
    }

    /// Sets the processor name.
    #[must_use]
    pub fn with_processor(mut self, processor_name: impl Into<String>) -> Self {
        self.processor_name = processor_name.into();
        self
    }

    /// Explicit full-scan override from the definition metadata, if any.
    ///
    /// Only boolean values count; anything else is ignored.
    #[must_use]
    pub fn full_scan_override(&self) -> Option<bool> {
        self.metadata
            .get(FORCE_FULL_KEY)
            .and_then(serde_json::Value::as_bool)
    }

    /// Interval between full scans configured on the definition.
    #[must_use]
    pub fn full_resync_interval(&self) -> Option<chrono::Duration> {
        self.full_frequency_in_minutes
            .map(|minutes| chrono::Duration::minutes(i64::from(minutes)))
    }
}

/// Identifier of one run of a job definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInstanceId {
    /// Definition this run belongs to.
    pub job_definition_id: Uuid,
    /// Monotonic run number within the definition.
    pub instance_id: u32,
}

impl std::fmt::Display for JobInstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.job_definition_id, self.instance_id)
    }
}

/// One concrete execution of a [`JobDefinition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInstance {
    /// Primary key.
    pub id: JobInstanceId,
    /// Current status.
    pub status: JobStatus,
    /// Whether this run is a full scan.
    pub is_full: bool,
    /// When the scheduler wanted the run to start.
    pub scheduled_start_time: DateTime<Utc>,
    /// When the first turn started.
    pub start_time: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub end_time: Option<DateTime<Utc>>,
    /// Serialized extraction checkpoint.
    #[serde(default)]
    pub intermediate_state: JsonMap,
    /// Records written so far, per data type.
    #[serde(default)]
    pub progress: BTreeMap<String, u64>,
    /// Last error reported by a turn.
    pub error: Option<String>,
    /// Free-form run metadata (ingestion flags for this run).
    #[serde(default)]
    pub metadata: JsonMap,
}

impl JobInstance {
    /// Creates a freshly scheduled instance.
    #[must_use]
    pub fn scheduled(id: JobInstanceId, scheduled_start_time: DateTime<Utc>) -> Self {
        Self {
            id,
            status: JobStatus::Scheduled,
            is_full: false,
            scheduled_start_time,
            start_time: None,
            end_time: None,
            intermediate_state: JsonMap::new(),
            progress: BTreeMap::new(),
            error: None,
            metadata: JsonMap::new(),
        }
    }

    /// Applies an update in place.
    pub fn apply(&mut self, update: JobInstanceUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(is_full) = update.is_full {
            self.is_full = is_full;
        }
        if let Some(start_time) = update.start_time {
            self.start_time = Some(start_time);
        }
        if let Some(end_time) = update.end_time {
            self.end_time = Some(end_time);
        }
        if let Some(state) = update.intermediate_state {
            self.intermediate_state = state;
        }
        for (data_type, count) in update.progress {
            *self.progress.entry(data_type).or_default() += count;
        }
        if let Some(error) = update.error {
            self.error = error;
        }
    }
}

/// Partial update of a [`JobInstance`], written in one store call at the
/// end of a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInstanceUpdate {
    /// New status.
    pub status: Option<JobStatus>,
    /// Full-scan decision for the run.
    pub is_full: Option<bool>,
    /// First turn start time.
    pub start_time: Option<DateTime<Utc>>,
    /// Terminal time.
    pub end_time: Option<DateTime<Utc>>,
    /// Replacement checkpoint.
    pub intermediate_state: Option<JsonMap>,
    /// Records written in this turn, added to the existing counters.
    #[serde(default)]
    pub progress: BTreeMap<String, u64>,
    /// `Some(None)` clears the error, `Some(Some(..))` replaces it.
    pub error: Option<Option<String>>,
}
