//! Config-driven supplier definitions.
//!
//! Each TOML file holds one or more `[[supplier]]` tables:
//!
//! ```toml
//! [[supplier]]
//! processor_name = "github_commits_v2"
//! job_type = "GENERIC_INTEGRATION_JOB"
//! integration_type = "github"
//! scan_mode = "full_resync"
//! full_resync_interval_minutes = 10080
//!
//! [[supplier.integration_whitelist]]
//! tenant_id = "warriors"
//! integration_id = "1"
//!
//! [supplier.parameters]
//! fetch_commit_files = true
//! ```

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use etl_job_models::{IntegrationType, JobDefinition, JobInstance, JobType, JsonMap};
use etl_stage_models::JobCategory;
use serde::{Deserialize, Serialize};

use crate::policy::{ScanMode, ScanModePolicy};
use crate::{IntegrationWhitelistEntry, ParameterSupplier, SupplierError};

/// Which [`ScanModePolicy`] a configured supplier uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanModeKind {
    /// [`ScanModePolicy::FullResync`]
    #[default]
    FullResync,
    /// [`ScanModePolicy::AlwaysFull`]
    AlwaysFull,
    /// [`ScanModePolicy::NeverFull`]
    NeverFull,
}

/// One `[[supplier]]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplierConfig {
    /// Unique processor name.
    pub processor_name: String,
    /// Job type served.
    pub job_type: JobType,
    /// Integration type served; required for integration-scoped job types.
    #[serde(default)]
    pub integration_type: Option<IntegrationType>,
    /// Tenants the supplier is restricted to.
    #[serde(default)]
    pub tenant_whitelist: BTreeSet<String>,
    /// Single integrations the supplier is enabled for.
    #[serde(default)]
    pub integration_whitelist: BTreeSet<IntegrationWhitelistEntry>,
    /// Scan-mode policy.
    #[serde(default)]
    pub scan_mode: ScanModeKind,
    /// Default full-resync interval for [`ScanModeKind::FullResync`].
    #[serde(default)]
    pub full_resync_interval_minutes: Option<u32>,
    /// Stage category multi-stage runs are restricted to.
    #[serde(default)]
    pub category: Option<JobCategory>,
    /// Never write empty output pages.
    #[serde(default)]
    pub skip_empty_results: bool,
    /// Prefix output files with the run id.
    #[serde(default)]
    pub unique_output_files: bool,
    /// Static job parameters.
    #[serde(default)]
    pub parameters: JsonMap,
}

impl SupplierConfig {
    /// Creates an unrestricted full-resync supplier with no parameters.
    #[must_use]
    pub fn new(
        processor_name: impl Into<String>,
        job_type: JobType,
        integration_type: Option<IntegrationType>,
    ) -> Self {
        Self {
            processor_name: processor_name.into(),
            job_type,
            integration_type,
            tenant_whitelist: BTreeSet::new(),
            integration_whitelist: BTreeSet::new(),
            scan_mode: ScanModeKind::default(),
            full_resync_interval_minutes: None,
            category: None,
            skip_empty_results: false,
            unique_output_files: false,
            parameters: JsonMap::new(),
        }
    }

    /// Scan-mode policy described by the config.
    #[must_use]
    pub fn policy(&self) -> ScanModePolicy {
        match self.scan_mode {
            ScanModeKind::AlwaysFull => ScanModePolicy::AlwaysFull,
            ScanModeKind::NeverFull => ScanModePolicy::NeverFull,
            ScanModeKind::FullResync => ScanModePolicy::FullResync {
                interval: self
                    .full_resync_interval_minutes
                    .map(|minutes| Duration::minutes(i64::from(minutes))),
            },
        }
    }

    fn validate(&self, name: &str) -> Result<(), SupplierError> {
        let error = |message: String| SupplierError::Config {
            name: name.to_string(),
            message,
        };

        if self.processor_name.trim().is_empty() {
            return Err(error("processor_name is empty".to_string()));
        }
        match (self.job_type.is_integration_scoped(), self.integration_type) {
            (true, None) => Err(error(format!(
                "{}: {} requires an integration_type",
                self.processor_name, self.job_type
            ))),
            (false, Some(integration_type)) => Err(error(format!(
                "{}: {} cannot have integration_type {integration_type}",
                self.processor_name, self.job_type
            ))),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SupplierFile {
    #[serde(default)]
    supplier: Vec<SupplierConfig>,
}

/// Parses the `[[supplier]]` tables of one TOML document.
///
/// # Errors
///
/// Returns [`SupplierError::Config`] if the document is malformed or an
/// entry is inconsistent.
pub fn parse_supplier_toml(name: &str, toml_str: &str) -> Result<Vec<SupplierConfig>, SupplierError> {
    let file: SupplierFile = toml::de::from_str(toml_str).map_err(|e| SupplierError::Config {
        name: name.to_string(),
        message: e.to_string(),
    })?;

    for config in &file.supplier {
        config.validate(name)?;
    }

    Ok(file.supplier)
}

/// A [`ParameterSupplier`] backed by a [`SupplierConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConfiguredSupplier {
    config: SupplierConfig,
    policy: ScanModePolicy,
}

impl ConfiguredSupplier {
    /// Wraps a config.
    #[must_use]
    pub fn new(config: SupplierConfig) -> Self {
        let policy = config.policy();
        Self { config, policy }
    }

    /// The underlying config.
    #[must_use]
    pub const fn config(&self) -> &SupplierConfig {
        &self.config
    }
}

impl ParameterSupplier for ConfiguredSupplier {
    fn processor_name(&self) -> &str {
        &self.config.processor_name
    }

    fn job_type(&self) -> JobType {
        self.config.job_type
    }

    fn integration_type(&self) -> Option<IntegrationType> {
        self.config.integration_type
    }

    fn tenant_whitelist(&self) -> &BTreeSet<String> {
        &self.config.tenant_whitelist
    }

    fn integration_whitelist(&self) -> &BTreeSet<IntegrationWhitelistEntry> {
        &self.config.integration_whitelist
    }

    fn job_parameters(&self, definition: &JobDefinition) -> JsonMap {
        let mut parameters = self.config.parameters.clone();
        parameters.insert("tenant_id".to_string(), definition.tenant_id.clone().into());
        if let Some(integration_id) = &definition.integration_id {
            parameters.insert("integration_id".to_string(), integration_id.clone().into());
        }
        parameters.insert(
            "processor_name".to_string(),
            self.config.processor_name.clone().into(),
        );
        parameters
    }

    fn should_take_full(
        &self,
        previous: Option<&JobInstance>,
        definition: &JobDefinition,
        now: DateTime<Utc>,
    ) -> ScanMode {
        self.policy.decide(previous, definition, now)
    }

    fn stage_category(&self) -> Option<JobCategory> {
        self.config.category
    }

    fn skip_empty_results(&self) -> bool {
        self.config.skip_empty_results
    }

    fn unique_output_files(&self) -> bool {
        self.config.unique_output_files
    }
}
