#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Job parameter suppliers and the registry that resolves them.
//!
//! A [`ParameterSupplier`] produces the parameters of one kind of job and
//! decides whether its next run is full or incremental. Suppliers can be
//! restricted to tenants or to single integrations through two whitelists
//! that are OR'd together: see [`is_eligible`].

pub mod config;
pub mod policy;
pub mod registry;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use etl_job_models::{IntegrationType, JobDefinition, JobInstance, JobType, JsonMap};
use etl_stage_models::JobCategory;
use serde::{Deserialize, Serialize};

pub use config::{ConfiguredSupplier, SupplierConfig};
pub use policy::{ScanMode, ScanModePolicy, ScanReason};
pub use registry::SupplierRegistry;

/// Errors that can occur while resolving suppliers.
#[derive(Debug, thiserror::Error)]
pub enum SupplierError {
    /// No supplier handles this job configuration. Not retriable.
    #[error("No {job_type} supplier implemented for integration type {integration_type}")]
    NotImplemented {
        /// Requested job type.
        job_type: JobType,
        /// Requested integration type.
        integration_type: IntegrationType,
    },

    /// No registered supplier is eligible for the job's tenant or
    /// integration.
    #[error("No eligible {job_type} supplier for tenant {tenant_id}")]
    NoEligibleSupplier {
        /// Requested job type.
        job_type: JobType,
        /// Requesting tenant.
        tenant_id: String,
    },

    /// An integration-scoped job definition has no integration.
    #[error("Job definition {definition_id} of type {job_type} has no integration")]
    MissingIntegration {
        /// Offending definition.
        definition_id: String,
        /// Its job type.
        job_type: JobType,
    },

    /// A supplier config could not be parsed.
    #[error("Invalid supplier config {name}: {message}")]
    Config {
        /// Config file or entry name.
        name: String,
        /// Parse error.
        message: String,
    },

    /// I/O error reading a supplier config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A `(tenant, integration)` pair a supplier is enabled for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IntegrationWhitelistEntry {
    /// Tenant owning the integration.
    pub tenant_id: String,
    /// Integration within the tenant.
    pub integration_id: String,
}

impl IntegrationWhitelistEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, integration_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            integration_id: integration_id.into(),
        }
    }
}

/// Produces job parameters and scan-mode decisions for one kind of job.
pub trait ParameterSupplier: Send + Sync {
    /// Name of the processor handling the job's output. Unique per
    /// registry.
    fn processor_name(&self) -> &str;

    /// Job type this supplier serves.
    fn job_type(&self) -> JobType;

    /// Integration type this supplier serves; `None` for tenant jobs.
    fn integration_type(&self) -> Option<IntegrationType>;

    /// Tenants the supplier is restricted to. Empty means unrestricted.
    fn tenant_whitelist(&self) -> &BTreeSet<String>;

    /// Single integrations the supplier is enabled for.
    fn integration_whitelist(&self) -> &BTreeSet<IntegrationWhitelistEntry>;

    /// Parameters for the next run of `definition`.
    fn job_parameters(&self, definition: &JobDefinition) -> JsonMap;

    /// Whether the next run of `definition` is full. `previous` is the most
    /// recent successful earlier run, if any.
    fn should_take_full(
        &self,
        previous: Option<&JobInstance>,
        definition: &JobDefinition,
        now: DateTime<Utc>,
    ) -> ScanMode;

    /// Stage category a multi-stage run is restricted to.
    fn stage_category(&self) -> Option<JobCategory> {
        None
    }

    /// Whether empty output pages are skipped.
    fn skip_empty_results(&self) -> bool {
        false
    }

    /// Whether output file names carry a per-run prefix.
    fn unique_output_files(&self) -> bool {
        false
    }
}

/// Whether `supplier` may run for `tenant_id`, and for `integration_id`
/// when the job is integration-scoped.
///
/// Eligible when any of these hold:
/// 1. both whitelists are empty;
/// 2. the tenant whitelist contains `tenant_id`;
/// 3. the integration whitelist contains exactly
///    `(tenant_id, integration_id)`.
///
/// Tenant jobs only consult the tenant whitelist.
#[must_use]
pub fn is_eligible(
    supplier: &dyn ParameterSupplier,
    tenant_id: &str,
    integration_id: Option<&str>,
) -> bool {
    let tenants = supplier.tenant_whitelist();

    let Some(integration_id) = integration_id else {
        return tenants.is_empty() || tenants.contains(tenant_id);
    };

    let integrations = supplier.integration_whitelist();
    if tenants.is_empty() && integrations.is_empty() {
        return true;
    }
    if tenants.contains(tenant_id) {
        return true;
    }
    integrations
        .iter()
        .any(|entry| entry.tenant_id == tenant_id && entry.integration_id == integration_id)
}
