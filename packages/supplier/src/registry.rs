//! Supplier registry, built once from every registered supplier.
//!
//! Supplier configs are baked into the binary at compile time via
//! [`include_str!`]; custom files can be loaded at runtime with
//! [`SupplierRegistry::from_file`]. Registration order is the tie-break
//! order of every query result.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use etl_job_models::{IntegrationType, JobDefinition, JobType};

use crate::config::{ConfiguredSupplier, SupplierConfig, parse_supplier_toml};
use crate::{ParameterSupplier, SupplierError, is_eligible};

/// Environment variable restricting the registered processors.
pub const SUPPLIERS_ENV: &str = "ETL_SUPPLIERS";

/// TOML configs embedded at compile time.
const SUPPLIER_TOMLS: &[(&str, &str)] = &[
    // ── Tenant jobs ──────────────────────────────────────────────────
    (
        "user_id_consolidation",
        include_str!("../suppliers/user_id_consolidation.toml"),
    ),
    (
        "tenant_dev_productivity",
        include_str!("../suppliers/tenant_dev_productivity.toml"),
    ),
    // ── Integration jobs ─────────────────────────────────────────────
    ("github_commits", include_str!("../suppliers/github_commits.toml")),
    // ── Ingestion result processing ──────────────────────────────────
    ("azure_devops", include_str!("../suppliers/azure_devops.toml")),
    ("jira", include_str!("../suppliers/jira.toml")),
];

/// Total number of embedded suppliers (used in tests).
#[cfg(test)]
const EXPECTED_SUPPLIER_COUNT: usize = 6;

/// Returns every embedded supplier config, in registration order.
///
/// # Panics
///
/// Panics if any embedded TOML config is malformed.
#[must_use]
pub fn all_supplier_configs() -> Vec<SupplierConfig> {
    SUPPLIER_TOMLS
        .iter()
        .flat_map(|(name, toml)| {
            parse_supplier_toml(name, toml)
                .unwrap_or_else(|e| panic!("Failed to parse {name}.toml: {e}"))
        })
        .collect()
}

/// Returns the embedded suppliers to register, filtered by `cli_filter` or
/// the `ETL_SUPPLIERS` environment variable (comma-separated processor
/// names). If neither is set, every supplier is returned.
#[must_use]
pub fn enabled_supplier_configs(cli_filter: Option<String>) -> Vec<SupplierConfig> {
    let filter = cli_filter.or_else(|| std::env::var(SUPPLIERS_ENV).ok());

    let all = all_supplier_configs();

    let Some(filter_str) = filter else {
        return all;
    };

    let names: Vec<&str> = filter_str.split(',').map(str::trim).collect();

    let filtered: Vec<SupplierConfig> = all
        .iter()
        .filter(|c| names.contains(&c.processor_name.as_str()))
        .cloned()
        .collect();

    if filtered.is_empty() {
        log::warn!(
            "No matching suppliers found for filter {:?}. Available: {}",
            names,
            all.iter()
                .map(|c| c.processor_name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    filtered
}

/// Resolves which suppliers may run a job.
pub struct SupplierRegistry {
    suppliers: Vec<Arc<dyn ParameterSupplier>>,
    by_job_type: BTreeMap<JobType, Vec<usize>>,
}

impl SupplierRegistry {
    /// Indexes `suppliers` by job type, keeping registration order.
    #[must_use]
    pub fn new(suppliers: Vec<Arc<dyn ParameterSupplier>>) -> Self {
        let mut by_job_type: BTreeMap<JobType, Vec<usize>> = BTreeMap::new();
        for (index, supplier) in suppliers.iter().enumerate() {
            by_job_type
                .entry(supplier.job_type())
                .or_default()
                .push(index);
        }

        log::debug!("Registered {} supplier(s)", suppliers.len());

        Self {
            suppliers,
            by_job_type,
        }
    }

    /// Builds a registry from configs.
    #[must_use]
    pub fn from_configs(configs: Vec<SupplierConfig>) -> Self {
        Self::new(
            configs
                .into_iter()
                .map(|config| Arc::new(ConfiguredSupplier::new(config)) as Arc<dyn ParameterSupplier>)
                .collect(),
        )
    }

    /// Builds a registry from the embedded configs, honoring
    /// `ETL_SUPPLIERS`.
    #[must_use]
    pub fn default_registry() -> Self {
        Self::from_configs(enabled_supplier_configs(None))
    }

    /// Builds a registry from a TOML file of `[[supplier]]` tables.
    ///
    /// # Errors
    ///
    /// Returns [`SupplierError::Io`] if the file cannot be read and
    /// [`SupplierError::Config`] if it is malformed.
    pub fn from_file(path: &Path) -> Result<Self, SupplierError> {
        let contents = std::fs::read_to_string(path)?;
        let configs = parse_supplier_toml(&path.display().to_string(), &contents)?;
        Ok(Self::from_configs(configs))
    }

    /// Every supplier, in registration order.
    #[must_use]
    pub fn all(&self) -> &[Arc<dyn ParameterSupplier>] {
        &self.suppliers
    }

    /// Number of registered suppliers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.suppliers.len()
    }

    /// Whether no supplier is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.suppliers.is_empty()
    }

    /// Looks a supplier up by processor name.
    #[must_use]
    pub fn find(&self, processor_name: &str) -> Option<Arc<dyn ParameterSupplier>> {
        self.suppliers
            .iter()
            .find(|s| s.processor_name() == processor_name)
            .cloned()
    }

    fn of_type(&self, job_type: JobType) -> impl Iterator<Item = &Arc<dyn ParameterSupplier>> {
        self.by_job_type
            .get(&job_type)
            .into_iter()
            .flatten()
            .map(|index| &self.suppliers[*index])
    }

    /// Tenant-job suppliers enabled for `tenant_id`.
    #[must_use]
    pub fn generic_tenant_suppliers(&self, tenant_id: &str) -> Vec<Arc<dyn ParameterSupplier>> {
        self.of_type(JobType::GenericTenantJob)
            .filter(|&s| is_eligible(&**s, tenant_id, None))
            .cloned()
            .collect()
    }

    /// Integration-job suppliers for `integration_type` enabled for the
    /// given tenant and integration.
    #[must_use]
    pub fn generic_integration_suppliers(
        &self,
        integration_type: IntegrationType,
        tenant_id: &str,
        integration_id: &str,
    ) -> Vec<Arc<dyn ParameterSupplier>> {
        self.of_type(JobType::GenericIntegrationJob)
            .filter(|s| s.integration_type() == Some(integration_type))
            .filter(|&s| is_eligible(&**s, tenant_id, Some(integration_id)))
            .cloned()
            .collect()
    }

    /// The first ingestion-result supplier for `integration_type`.
    ///
    /// # Errors
    ///
    /// Returns [`SupplierError::NotImplemented`] if none is registered.
    pub fn ingestion_result_processing_supplier(
        &self,
        integration_type: IntegrationType,
    ) -> Result<Arc<dyn ParameterSupplier>, SupplierError> {
        self.of_type(JobType::IngestionResultProcessingJob)
            .find(|s| s.integration_type() == Some(integration_type))
            .cloned()
            .ok_or(SupplierError::NotImplemented {
                job_type: JobType::IngestionResultProcessingJob,
                integration_type,
            })
    }

    /// Suppliers applicable to `definition`, dispatched on its job type.
    ///
    /// When the definition names a processor, only that processor's
    /// supplier is kept.
    ///
    /// # Errors
    ///
    /// Returns [`SupplierError::MissingIntegration`] if an
    /// integration-scoped definition has no integration and
    /// [`SupplierError::NotImplemented`] for unsupported ingestion-result
    /// integrations.
    pub fn suppliers_for(
        &self,
        definition: &JobDefinition,
    ) -> Result<Vec<Arc<dyn ParameterSupplier>>, SupplierError> {
        let missing_integration = || SupplierError::MissingIntegration {
            definition_id: definition.id.to_string(),
            job_type: definition.job_type,
        };

        let suppliers = match definition.job_type {
            JobType::GenericTenantJob => self.generic_tenant_suppliers(&definition.tenant_id),
            JobType::GenericIntegrationJob => {
                let integration_type = definition.integration_type.ok_or_else(missing_integration)?;
                let integration_id = definition
                    .integration_id
                    .as_deref()
                    .ok_or_else(missing_integration)?;
                self.generic_integration_suppliers(
                    integration_type,
                    &definition.tenant_id,
                    integration_id,
                )
            }
            JobType::IngestionResultProcessingJob => {
                let integration_type = definition.integration_type.ok_or_else(missing_integration)?;
                vec![self.ingestion_result_processing_supplier(integration_type)?]
            }
        };

        if definition.processor_name.is_empty() {
            return Ok(suppliers);
        }

        Ok(suppliers
            .into_iter()
            .filter(|s| s.processor_name() == definition.processor_name)
            .collect())
    }
}
