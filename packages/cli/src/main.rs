#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Operator CLI for inspecting supplier registration, persisted stage state
//! and scan-mode decisions.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use etl_job_models::{
    FORCE_FULL_KEY, IntegrationType, JobDefinition, JobInstance, JobInstanceId, JobStatus,
    JobType,
};
use etl_stage_models::{IntermediateState, JobCategory, Stage, StageSelection};
use etl_supplier::registry::enabled_supplier_configs;
use etl_supplier::{ParameterSupplier, ScanMode, SupplierRegistry};

#[derive(Parser)]
#[command(name = "etl_cli", about = "ETL job resolution tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered suppliers in registration order
    Suppliers {
        /// Load suppliers from this TOML file instead of the embedded ones
        #[arg(long)]
        file: Option<PathBuf>,
        /// Comma-separated processor names (overrides `ETL_SUPPLIERS` env var)
        #[arg(long)]
        suppliers: Option<String>,
    },
    /// Show the suppliers eligible for a job
    Resolve {
        /// Job type (e.g. `GENERIC_INTEGRATION_JOB`)
        #[arg(long)]
        job_type: JobType,
        /// Tenant id
        #[arg(long)]
        tenant: String,
        /// Integration type (e.g. `github`)
        #[arg(long)]
        integration_type: Option<IntegrationType>,
        /// Integration id
        #[arg(long)]
        integration_id: Option<String>,
        /// Only consider this processor
        #[arg(long)]
        processor: Option<String>,
        /// Load suppliers from this TOML file instead of the embedded ones
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Inspect a persisted intermediate-state JSON file
    State {
        /// Path to the JSON file
        #[arg(long)]
        file: PathBuf,
        /// Restrict the next-stage lookup to one category (e.g. `SCM_GIT`)
        #[arg(long)]
        category: Option<JobCategory>,
        /// Treat the run as incremental, which skips onboarding-only stages
        #[arg(long)]
        incremental: bool,
    },
    /// Evaluate a supplier's full-vs-incremental decision
    ScanMode {
        /// Processor name of the supplier
        #[arg(long)]
        processor: String,
        /// When the last full scan started (RFC 3339)
        #[arg(long)]
        last_full: Option<DateTime<Utc>>,
        /// Minutes between full scans configured on the definition
        #[arg(long)]
        full_frequency: Option<u32>,
        /// Explicit full-scan override
        #[arg(long)]
        force_full: Option<bool>,
        /// Evaluate as the first run of the definition
        #[arg(long)]
        first_run: bool,
        /// Status of the previous run (e.g. `FAILURE`)
        #[arg(long, default_value = "SUCCESS")]
        previous_status: JobStatus,
        /// Evaluation time (RFC 3339, defaults to now)
        #[arg(long)]
        now: Option<DateTime<Utc>>,
        /// Load suppliers from this TOML file instead of the embedded ones
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Suppliers { file, suppliers } => {
            let registry = match file {
                Some(path) => SupplierRegistry::from_file(&path)?,
                None => SupplierRegistry::from_configs(enabled_supplier_configs(suppliers)),
            };
            println!(
                "{:<32} {:<32} {:<16} RESTRICTED",
                "PROCESSOR", "JOB TYPE", "INTEGRATION"
            );
            println!("{}", "-".repeat(92));
            for supplier in registry.all() {
                println!("{}", supplier_row(supplier.as_ref()));
            }
        }
        Commands::Resolve {
            job_type,
            tenant,
            integration_type,
            integration_id,
            processor,
            file,
        } => {
            let registry = load_registry(file.as_deref())?;
            let mut definition = JobDefinition::new(tenant, job_type);
            definition.integration_type = integration_type;
            definition.integration_id = integration_id;
            if let Some(processor) = processor {
                definition = definition.with_processor(processor);
            }

            let suppliers = registry.suppliers_for(&definition)?;
            if suppliers.is_empty() {
                println!("No eligible supplier");
            }
            for supplier in &suppliers {
                println!("{}", supplier.processor_name());
            }
        }
        Commands::State {
            file,
            category,
            incremental,
        } => {
            let state = read_state(&file)?;
            let mut selection = StageSelection::everything().with_onboarding(!incremental);
            if let Some(category) = category {
                selection = selection.with_category(category);
            }
            print!("{}", describe_state(&state, &selection));
        }
        Commands::ScanMode {
            processor,
            last_full,
            full_frequency,
            force_full,
            first_run,
            previous_status,
            now,
            file,
        } => {
            let registry = load_registry(file.as_deref())?;
            let supplier = registry
                .find(&processor)
                .ok_or_else(|| format!("Unknown processor: {processor}"))?;
            let now = now.unwrap_or_else(Utc::now);
            let previous = (!first_run).then_some(previous_status);
            let mode = evaluate_scan_mode(
                supplier.as_ref(),
                last_full,
                full_frequency,
                force_full,
                previous,
                now,
            );
            println!("{mode}");
        }
    }

    Ok(())
}

fn load_registry(file: Option<&Path>) -> Result<SupplierRegistry, Box<dyn std::error::Error>> {
    Ok(match file {
        Some(path) => SupplierRegistry::from_file(path)?,
        None => SupplierRegistry::default_registry(),
    })
}

fn supplier_row(supplier: &dyn ParameterSupplier) -> String {
    let integration = supplier
        .integration_type()
        .map_or_else(|| "-".to_string(), |t| t.to_string());
    let restricted = supplier
        .tenant_whitelist()
        .iter()
        .cloned()
        .chain(
            supplier
                .integration_whitelist()
                .iter()
                .map(|entry| format!("{}/{}", entry.tenant_id, entry.integration_id)),
        )
        .collect::<Vec<_>>();
    let restricted = if restricted.is_empty() {
        "-".to_string()
    } else {
        restricted.join(",")
    };

    format!(
        "{:<32} {:<32} {:<16} {restricted}",
        supplier.processor_name(),
        supplier.job_type(),
        integration
    )
}

/// Reads a state file. Anything that is not a JSON object is treated as an
/// empty state.
fn read_state(path: &Path) -> Result<IntermediateState, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let map = match serde_json::from_str::<serde_json::Value>(&contents) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(other) => {
            log::warn!("{} is not a JSON object ({other}), using empty state", path.display());
            serde_json::Map::new()
        }
        Err(e) => {
            log::warn!("{} is not valid JSON ({e}), using empty state", path.display());
            serde_json::Map::new()
        }
    };
    Ok(IntermediateState::parse(&map))
}

fn describe_state(state: &IntermediateState, selection: &StageSelection) -> String {
    let completed = state
        .completed_stages()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    let next = selection
        .enabled_stages()
        .into_iter()
        .find(|stage| !state.is_completed(*stage));

    let mut out = String::new();
    out.push_str(&format!(
        "completed: {}\n",
        if completed.is_empty() {
            "-".to_string()
        } else {
            completed.join(", ")
        }
    ));
    out.push_str(&format!(
        "next: {}\n",
        next.as_ref().map_or_else(|| "-".to_string(), Stage::to_string)
    ));
    for (key, cursor) in state.cursors() {
        let cursor = cursor
            .as_str()
            .map_or_else(|| cursor.to_string(), ToString::to_string);
        out.push_str(&format!("cursor: {key}={cursor}\n"));
    }
    out
}

fn evaluate_scan_mode(
    supplier: &dyn ParameterSupplier,
    last_full: Option<DateTime<Utc>>,
    full_frequency: Option<u32>,
    force_full: Option<bool>,
    previous_status: Option<JobStatus>,
    now: DateTime<Utc>,
) -> ScanMode {
    let mut definition = JobDefinition::new("cli", supplier.job_type())
        .with_processor(supplier.processor_name());
    definition.integration_type = supplier.integration_type();
    definition.last_full_sync_started_at = last_full;
    definition.full_frequency_in_minutes = full_frequency;
    if let Some(force_full) = force_full {
        definition
            .metadata
            .insert(FORCE_FULL_KEY.to_string(), force_full.into());
    }

    let previous = previous_status.map(|status| {
        let mut previous = JobInstance::scheduled(
            JobInstanceId {
                job_definition_id: definition.id,
                instance_id: 0,
            },
            last_full.unwrap_or(now),
        );
        previous.status = status;
        previous.start_time = Some(previous.scheduled_start_time);
        previous
    });

    supplier.should_take_full(previous.as_ref(), &definition, now)
}
