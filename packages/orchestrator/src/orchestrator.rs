//! One job turn, from instance lookup to the final instance update.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use etl_data::IngestionFailure;
use etl_job_models::{
    IntegrationType, JobDefinition, JobInstance, JobInstanceId, JobInstanceUpdate, JobStatus,
    JsonMap,
};
use etl_stage::{FetchContext, OutputOptions, StageFetcher, StageMachine, TurnOutcome};
use etl_stage_models::{IntermediateState, StageSelection};
use etl_storage::progress::LogProgress;
use etl_storage::{PageArtifact, PageStore};
use etl_supplier::{ParameterSupplier, ScanMode, SupplierError, SupplierRegistry};

use crate::OrchestratorError;
use crate::store::{JobDefinitionStore, JobInstanceStore};

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// What a turn did.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    /// The instance.
    pub instance_id: JobInstanceId,
    /// Status persisted at the end of the turn.
    pub status: JobStatus,
    /// Whether the run is full.
    pub is_full: bool,
    /// Scan-mode decision, when it was made in this turn.
    pub scan_mode: Option<ScanMode>,
    /// Processors of the eligible suppliers, in registration order.
    pub processors: Vec<String>,
    /// Stage outcome, for multi-stage jobs.
    pub stage_outcome: Option<TurnOutcome>,
    /// Records written in this turn.
    pub records: usize,
    /// Pages written in this turn, in page-number order.
    pub pages: Vec<PageArtifact>,
    /// Non-fatal per-record failures of this turn.
    pub ingestion_failures: Vec<IngestionFailure>,
    /// Set when this turn started a full scan; the scheduler records it as
    /// the definition's last full sync.
    pub full_sync_started_at: Option<DateTime<Utc>>,
}

/// Runs job turns against the registry, the stores and the page store.
pub struct JobOrchestrator {
    registry: Arc<SupplierRegistry>,
    definitions: Arc<dyn JobDefinitionStore>,
    instances: Arc<dyn JobInstanceStore>,
    page_store: Arc<dyn PageStore>,
    fetchers: BTreeMap<IntegrationType, Vec<Arc<dyn StageFetcher>>>,
    clock: Clock,
}

impl JobOrchestrator {
    /// Creates an orchestrator with no stage fetchers.
    #[must_use]
    pub fn new(
        registry: Arc<SupplierRegistry>,
        definitions: Arc<dyn JobDefinitionStore>,
        instances: Arc<dyn JobInstanceStore>,
        page_store: Arc<dyn PageStore>,
    ) -> Self {
        Self {
            registry,
            definitions,
            instances,
            page_store,
            fetchers: BTreeMap::new(),
            clock: Arc::new(Utc::now),
        }
    }

    /// Registers a stage fetcher for an integration type. Jobs of that
    /// integration type become multi-stage jobs.
    #[must_use]
    pub fn with_fetcher(
        mut self,
        integration_type: IntegrationType,
        fetcher: Arc<dyn StageFetcher>,
    ) -> Self {
        self.fetchers
            .entry(integration_type)
            .or_default()
            .push(fetcher);
        self
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Runs one turn of `id`, aborting after `budget`.
    ///
    /// Nothing from an aborted turn is persisted: the next turn resumes
    /// from the last persisted state.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::TimedOut`] when the budget is exceeded,
    /// otherwise as [`Self::run_turn`].
    pub async fn run_turn_with_timeout(
        &self,
        id: JobInstanceId,
        budget: Duration,
    ) -> Result<TurnReport, OrchestratorError> {
        tokio::time::timeout(budget, self.run_turn(id))
            .await
            .map_err(|_| {
                log::warn!("Job instance {id} timed out after {budget:?}");
                OrchestratorError::TimedOut(id)
            })?
    }

    /// Runs one turn of `id`.
    ///
    /// # Errors
    ///
    /// * [`OrchestratorError::Unsupported`] when no supplier can run the job
    ///   (the instance is marked [`JobStatus::Unsupported`] first);
    /// * [`OrchestratorError::Store`] and [`OrchestratorError::Stage`] for
    ///   retriable infrastructure failures, in which case nothing from the
    ///   turn is persisted;
    /// * the remaining variants for missing, inactive or finished jobs.
    pub async fn run_turn(&self, id: JobInstanceId) -> Result<TurnReport, OrchestratorError> {
        let instance = self
            .instances
            .get_instance(id)
            .await?
            .ok_or(OrchestratorError::InstanceNotFound(id))?;

        if instance.status.is_terminal() {
            return Err(OrchestratorError::AlreadyTerminal {
                id,
                status: instance.status,
            });
        }

        let definition = self
            .definitions
            .get_definition(id.job_definition_id)
            .await?
            .ok_or(OrchestratorError::DefinitionNotFound(id.job_definition_id))?;

        if !definition.is_active {
            return Err(OrchestratorError::Inactive(definition.id));
        }

        let now = (self.clock)();

        let suppliers = match self.resolve_suppliers(&definition) {
            Ok(suppliers) => suppliers,
            Err(error @ OrchestratorError::Unsupported(_)) => {
                log::warn!("Job instance {id}: {error}");
                self.instances
                    .update_instance(
                        id,
                        JobInstanceUpdate {
                            status: Some(JobStatus::Unsupported),
                            start_time: instance.start_time.is_none().then_some(now),
                            end_time: Some(now),
                            error: Some(Some(error.to_string())),
                            ..JobInstanceUpdate::default()
                        },
                    )
                    .await?;
                return Err(error);
            }
            Err(error) => return Err(error),
        };
        let primary = &suppliers[0];
        let processors: Vec<String> = suppliers
            .iter()
            .map(|s| s.processor_name().to_string())
            .collect();

        let last_success = self.instances.last_successful_instance(id).await?;
        // With no successful run, the policy sees the latest failed one.
        let previous = match (&last_success, id.instance_id.checked_sub(1)) {
            (None, Some(instance_id)) => {
                self.instances
                    .get_instance(JobInstanceId {
                        instance_id,
                        ..id
                    })
                    .await?
            }
            _ => last_success.clone(),
        };

        let first_turn = instance.start_time.is_none();
        let scan_mode =
            first_turn.then(|| primary.should_take_full(previous.as_ref(), &definition, now));
        let is_full = scan_mode.map_or(instance.is_full, |mode| mode.full);

        if let Some(mode) = scan_mode {
            log::info!("Job instance {id}: {mode} via {}", primary.processor_name());
        }

        let parameters = merge_parameters(&suppliers, &definition);

        let mut update = JobInstanceUpdate {
            is_full: Some(is_full),
            start_time: first_turn.then_some(now),
            ..JobInstanceUpdate::default()
        };

        let (status, stage_outcome, storage) = match definition
            .integration_type
            .and_then(|integration_type| self.fetchers.get(&integration_type))
        {
            Some(fetchers) if !fetchers.is_empty() => {
                let context = FetchContext::new(
                    definition.tenant_id.clone(),
                    is_full,
                    now,
                    last_success.as_ref().and_then(|p| p.start_time),
                )
                .with_parameters(parameters);
                let context = match &definition.integration_id {
                    Some(integration_id) => context.with_integration(integration_id.clone()),
                    None => context,
                };

                let machine = self.stage_machine(
                    &**primary,
                    fetchers,
                    &definition,
                    &instance,
                    is_full,
                    id,
                    now,
                );
                let state = IntermediateState::parse(&instance.intermediate_state);
                let turn = machine
                    .run_turn(&context, state, self.page_store.clone())
                    .await?;

                let status = match &turn.outcome {
                    TurnOutcome::AllStagesComplete
                    | TurnOutcome::StageCompleted { remaining: 0, .. } => JobStatus::Success,
                    TurnOutcome::StageCompleted { .. } => JobStatus::Pending,
                    TurnOutcome::StageFailed { .. } => JobStatus::PartialSuccess,
                };
                update.error = Some(match &turn.outcome {
                    TurnOutcome::StageFailed { stage, error } => {
                        Some(format!("Stage {stage} failed: {error}"))
                    }
                    _ => None,
                });
                update.intermediate_state = Some(turn.state.to_map());

                if let Some(storage) = &turn.storage {
                    update.progress.insert(
                        storage.data_type.clone(),
                        u64::try_from(storage.records).unwrap_or(u64::MAX),
                    );
                    if !storage.ingestion_failures.is_empty() {
                        log::warn!(
                            "Job instance {id}: {} ingestion failure(s) in {}",
                            storage.ingestion_failures.len(),
                            storage.data_type
                        );
                    }
                }

                (status, Some(turn.outcome), turn.storage)
            }
            _ => {
                log::info!(
                    "Job instance {id}: single-step job resolved to {}",
                    processors.join(", ")
                );
                update.error = Some(None);
                (JobStatus::Success, None, None)
            }
        };

        update.status = Some(status);
        update.end_time = status.is_terminal().then_some(now);

        self.instances.update_instance(id, update).await?;

        log::info!("Job instance {id}: {status}");

        Ok(TurnReport {
            instance_id: id,
            status,
            is_full,
            scan_mode,
            processors,
            stage_outcome,
            records: storage.as_ref().map_or(0, |storage| storage.records),
            pages: storage
                .as_ref()
                .map(|storage| storage.pages.clone())
                .unwrap_or_default(),
            ingestion_failures: storage
                .map(|storage| storage.ingestion_failures)
                .unwrap_or_default(),
            full_sync_started_at: scan_mode.filter(|mode| mode.full).map(|_| now),
        })
    }

    fn resolve_suppliers(
        &self,
        definition: &JobDefinition,
    ) -> Result<Vec<Arc<dyn ParameterSupplier>>, OrchestratorError> {
        let suppliers = self.registry.suppliers_for(definition)?;
        if suppliers.is_empty() {
            return Err(SupplierError::NoEligibleSupplier {
                job_type: definition.job_type,
                tenant_id: definition.tenant_id.clone(),
            }
            .into());
        }
        Ok(suppliers)
    }

    #[allow(clippy::too_many_arguments)]
    fn stage_machine(
        &self,
        primary: &dyn ParameterSupplier,
        fetchers: &[Arc<dyn StageFetcher>],
        definition: &JobDefinition,
        instance: &JobInstance,
        is_full: bool,
        id: JobInstanceId,
        now: DateTime<Utc>,
    ) -> StageMachine {
        let selection = StageSelection::from_flags(
            &definition.metadata,
            &instance.metadata,
            primary.stage_category(),
            is_full,
        );
        let output = OutputOptions {
            skip_empty_results: primary.skip_empty_results(),
            unique_run_id: primary
                .unique_output_files()
                .then(|| format!("{}-{}", id.instance_id, now.timestamp_millis())),
        };

        fetchers
            .iter()
            .cloned()
            .fold(
                StageMachine::new(selection)
                    .with_output(output)
                    .with_progress(Arc::new(LogProgress::new(id.to_string()))),
                |machine, fetcher| machine.with_fetcher(fetcher),
            )
    }
}

/// Merges the parameters of every eligible supplier; on key collisions the
/// earlier-registered supplier wins.
fn merge_parameters(
    suppliers: &[Arc<dyn ParameterSupplier>],
    definition: &JobDefinition,
) -> JsonMap {
    let mut merged = JsonMap::new();
    for supplier in suppliers {
        for (key, value) in supplier.job_parameters(definition) {
            merged.entry(key).or_insert(value);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use etl_data::{Data, IngestionFailure, StateMap};
    use etl_job_models::{FORCE_FULL_KEY, JobType};
    use etl_stage_models::Stage;
    use etl_stage_models::state::RESUME_FROM_PROJECT_KEY;
    use etl_storage::StorageError;
    use etl_storage::memory::MemoryPageStore;
    use etl_supplier::{IntegrationWhitelistEntry, ScanReason, SupplierConfig};
    use futures::StreamExt as _;
    use futures::stream::BoxStream;
    use serde_json::{Value, json};

    use super::*;
    use crate::store::InMemoryJobStore;

    struct ProjectFetcher {
        stage: Stage,
        projects: Vec<&'static str>,
        fail_at: Mutex<Option<&'static str>>,
        calls: AtomicUsize,
        fetched: Mutex<Vec<&'static str>>,
    }

    impl ProjectFetcher {
        fn new(stage: Stage, projects: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                stage,
                projects,
                fail_at: Mutex::new(None),
                calls: AtomicUsize::new(0),
                fetched: Mutex::new(Vec::new()),
            })
        }

        fn fail_at(&self, project: Option<&'static str>) {
            *self.fail_at.lock().unwrap() = project;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl StageFetcher for ProjectFetcher {
        fn stage(&self) -> Stage {
            self.stage
        }

        fn fetch<'a>(
            &'a self,
            context: &'a FetchContext,
            state: &'a IntermediateState,
        ) -> BoxStream<'a, Data<Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let start = state
                .resume_from_project()
                .and_then(|p| self.projects.iter().position(|x| *x == p))
                .unwrap_or(0);
            let fail_at = *self.fail_at.lock().unwrap();

            async_stream::stream! {
                for project in &self.projects[start..] {
                    if Some(*project) == fail_at {
                        let mut snapshot = StateMap::new();
                        snapshot.insert(RESUME_FROM_PROJECT_KEY.to_string(), json!(project));
                        yield Data::failed("429 Too Many Requests", Some(snapshot));
                        continue;
                    }
                    self.fetched.lock().unwrap().push(*project);
                    yield Data::records(vec![json!({
                        "project": project,
                        "tenant": context.tenant_id,
                    })]);
                }
            }
            .boxed()
        }
    }

    /// Yields one batch with a per-record failure.
    struct PartialFetcher;

    impl StageFetcher for PartialFetcher {
        fn stage(&self) -> Stage {
            Stage::Commits
        }

        fn fetch<'a>(
            &'a self,
            _context: &'a FetchContext,
            _state: &'a IntermediateState,
        ) -> BoxStream<'a, Data<Value>> {
            futures::stream::iter(vec![Data::Ingestion {
                records: vec![json!({"sha": "a1"}), json!({"sha": "b2"})],
                failures: vec![IngestionFailure::error("commit c3 unreadable")],
            }])
            .boxed()
        }
    }

    struct FailingPageStore;

    #[async_trait]
    impl PageStore for FailingPageStore {
        async fn write_page(
            &self,
            _relative_path: &str,
            _content: Vec<u8>,
        ) -> Result<String, StorageError> {
            Err(StorageError::Io(std::io::Error::other("disk full")))
        }
    }

    fn stored_projects(pages: &MemoryPageStore, dir: &str) -> Vec<String> {
        let mut projects: Vec<String> = pages
            .paths()
            .iter()
            .filter(|path| path.starts_with(dir))
            .filter_map(|path| pages.get_json(path))
            .flat_map(|page| page["records"].as_array().cloned().unwrap_or_default())
            .filter_map(|record| record["project"].as_str().map(ToString::to_string))
            .collect();
        projects.sort();
        projects
    }

    struct Harness {
        store: Arc<InMemoryJobStore>,
        pages: Arc<MemoryPageStore>,
        definition: JobDefinition,
    }

    impl Harness {
        async fn new(registry: SupplierRegistry, definition: JobDefinition) -> (Self, JobOrchestrator) {
            let pages = Arc::new(MemoryPageStore::new());
            Self::with_page_store(registry, definition, pages.clone(), pages).await
        }

        async fn with_page_store(
            registry: SupplierRegistry,
            definition: JobDefinition,
            pages: Arc<MemoryPageStore>,
            page_store: Arc<dyn PageStore>,
        ) -> (Self, JobOrchestrator) {
            let store = Arc::new(InMemoryJobStore::new());
            store.put_definition(definition.clone()).await;
            let orchestrator = JobOrchestrator::new(
                Arc::new(registry),
                store.clone(),
                store.clone(),
                page_store,
            )
            .with_clock(Arc::new(|| {
                DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
                    .unwrap()
                    .with_timezone(&Utc)
            }));
            (
                Self {
                    store,
                    pages,
                    definition,
                },
                orchestrator,
            )
        }

        async fn schedule(&self, instance_id: u32) -> JobInstanceId {
            let id = JobInstanceId {
                job_definition_id: self.definition.id,
                instance_id,
            };
            self.store
                .put_instance(JobInstance::scheduled(id, Utc::now()))
                .await;
            id
        }

        async fn finished(&self, instance_id: u32, status: JobStatus) {
            let mut instance = JobInstance::scheduled(
                JobInstanceId {
                    job_definition_id: self.definition.id,
                    instance_id,
                },
                Utc::now(),
            );
            instance.status = status;
            instance.start_time = Some(Utc::now());
            instance.end_time = Some(Utc::now());
            self.store.put_instance(instance).await;
        }

        async fn instance(&self, id: JobInstanceId) -> JobInstance {
            self.store.get_instance(id).await.unwrap().unwrap()
        }
    }

    fn azure_registry() -> SupplierRegistry {
        let mut config = SupplierConfig::new(
            "azure_devops_ingestion",
            JobType::IngestionResultProcessingJob,
            Some(IntegrationType::AzureDevops),
        );
        config.skip_empty_results = true;
        SupplierRegistry::from_configs(vec![config])
    }

    fn azure_definition() -> JobDefinition {
        JobDefinition::new("lakers", JobType::IngestionResultProcessingJob)
            .with_integration(IntegrationType::AzureDevops, "1")
    }

    #[tokio::test]
    async fn resumes_mid_stage_across_turns() {
        let (harness, orchestrator) = Harness::new(azure_registry(), azure_definition()).await;
        let a = ProjectFetcher::new(Stage::Commits, vec!["p1", "p2"]);
        let b = ProjectFetcher::new(Stage::Prs, vec!["p1", "p2", "p3"]);
        let c = ProjectFetcher::new(Stage::Builds, vec!["p1"]);
        b.fail_at(Some("p2"));
        let orchestrator = orchestrator
            .with_fetcher(IntegrationType::AzureDevops, a.clone())
            .with_fetcher(IntegrationType::AzureDevops, b.clone())
            .with_fetcher(IntegrationType::AzureDevops, c.clone());
        let id = harness.schedule(0).await;

        let report = orchestrator.run_turn(id).await.unwrap();
        assert_eq!(report.status, JobStatus::Pending);
        assert!(report.is_full);
        assert!(report.full_sync_started_at.is_some());
        assert_eq!(harness.instance(id).await.progress["commits"], 2);

        let report = orchestrator.run_turn(id).await.unwrap();
        assert_eq!(report.status, JobStatus::PartialSuccess);
        let instance = harness.instance(id).await;
        assert_eq!(instance.status, JobStatus::PartialSuccess);
        assert_eq!(
            instance.intermediate_state["resume_from_project"],
            json!("p2")
        );
        assert_eq!(instance.intermediate_state["completed_stages"], json!(["commits"]));
        assert!(instance.error.is_some());
        assert_eq!(c.calls(), 0);

        b.fail_at(None);
        let report = orchestrator.run_turn(id).await.unwrap();
        assert_eq!(report.status, JobStatus::Pending);
        assert_eq!(report.scan_mode, None);
        assert!(report.is_full);
        assert_eq!(*b.fetched.lock().unwrap(), vec!["p1", "p2", "p3"]);
        assert_eq!(a.calls(), 1);
        assert_eq!(c.calls(), 0);
        assert_eq!(harness.instance(id).await.error, None);

        let report = orchestrator.run_turn(id).await.unwrap();
        assert_eq!(report.status, JobStatus::Success);
        let instance = harness.instance(id).await;
        assert_eq!(instance.status, JobStatus::Success);
        assert!(instance.end_time.is_some());
        assert_eq!(
            instance.intermediate_state["completed_stages"],
            json!(["commits", "prs", "builds"])
        );
        assert_eq!((a.calls(), b.calls(), c.calls()), (1, 2, 1));

        assert!(matches!(
            orchestrator.run_turn(id).await,
            Err(OrchestratorError::AlreadyTerminal { .. })
        ));
    }

    #[tokio::test]
    async fn each_turn_persists_exactly_once() {
        let (harness, orchestrator) = Harness::new(azure_registry(), azure_definition()).await;
        let orchestrator = orchestrator.with_fetcher(
            IntegrationType::AzureDevops,
            ProjectFetcher::new(Stage::Builds, vec!["p1"]),
        );
        let id = harness.schedule(0).await;

        orchestrator.run_turn(id).await.unwrap();

        assert_eq!(harness.store.update_log().await, vec![id]);
        assert_eq!(harness.pages.paths(), vec!["builds/builds.0.json".to_string()]);
    }

    #[tokio::test]
    async fn unsupported_integration_marks_instance() {
        let definition = JobDefinition::new("lakers", JobType::IngestionResultProcessingJob)
            .with_integration(IntegrationType::Zendesk, "1");
        let (harness, orchestrator) = Harness::new(azure_registry(), definition).await;
        let id = harness.schedule(0).await;

        let error = orchestrator.run_turn(id).await.unwrap_err();

        assert!(matches!(error, OrchestratorError::Unsupported(_)));
        assert!(!error.is_retriable());
        let instance = harness.instance(id).await;
        assert_eq!(instance.status, JobStatus::Unsupported);
        assert!(instance.end_time.is_some());
        assert_eq!(harness.store.update_log().await.len(), 1);
    }

    #[tokio::test]
    async fn tenant_without_eligible_supplier_is_unsupported() {
        let mut config = SupplierConfig::new("s1", JobType::GenericTenantJob, None);
        config.tenant_whitelist.insert("lakers".to_string());
        let registry = SupplierRegistry::from_configs(vec![config]);
        let definition = JobDefinition::new("warriors", JobType::GenericTenantJob);
        let (harness, orchestrator) = Harness::new(registry, definition).await;
        let id = harness.schedule(0).await;

        let error = orchestrator.run_turn(id).await.unwrap_err();

        assert!(matches!(
            error,
            OrchestratorError::Unsupported(SupplierError::NoEligibleSupplier { .. })
        ));
        assert_eq!(harness.instance(id).await.status, JobStatus::Unsupported);
    }

    #[tokio::test]
    async fn single_step_integration_job_succeeds_with_incremental_scan() {
        let mut v1 = SupplierConfig::new(
            "github_commits_v1",
            JobType::GenericIntegrationJob,
            Some(IntegrationType::Github),
        );
        v1.scan_mode = etl_supplier::config::ScanModeKind::NeverFull;
        let mut v2 = v1.clone();
        v2.processor_name = "github_commits_v2".to_string();
        v2.integration_whitelist
            .insert(IntegrationWhitelistEntry::new("warriors", "1"));
        v2.tenant_whitelist.insert("celtics".to_string());
        let registry = SupplierRegistry::from_configs(vec![v1, v2]);
        let definition = JobDefinition::new("warriors", JobType::GenericIntegrationJob)
            .with_integration(IntegrationType::Github, "1");
        let (harness, orchestrator) = Harness::new(registry, definition).await;
        let id = harness.schedule(0).await;

        let report = orchestrator.run_turn(id).await.unwrap();

        assert_eq!(report.status, JobStatus::Success);
        assert_eq!(report.processors, vec!["github_commits_v1", "github_commits_v2"]);
        assert!(!report.is_full);
        assert_eq!(report.full_sync_started_at, None);
        assert_eq!(report.stage_outcome, None);
    }

    #[tokio::test]
    async fn force_full_override_reaches_the_instance() {
        let mut definition = azure_definition();
        definition
            .metadata
            .insert(FORCE_FULL_KEY.to_string(), false.into());
        let (harness, orchestrator) = Harness::new(azure_registry(), definition).await;
        let tags = ProjectFetcher::new(Stage::Tags, vec!["p1"]);
        let orchestrator = orchestrator
            .with_fetcher(IntegrationType::AzureDevops, tags.clone())
            .with_fetcher(
                IntegrationType::AzureDevops,
                ProjectFetcher::new(Stage::Teams, vec!["p1"]),
            );
        let id = harness.schedule(0).await;

        let report = orchestrator.run_turn(id).await.unwrap();

        assert!(!report.is_full);
        assert!(!harness.instance(id).await.is_full);
        // Tags only run on full scans.
        assert_eq!(tags.calls(), 0);
        assert_eq!(
            report.stage_outcome,
            Some(TurnOutcome::StageCompleted {
                stage: Stage::Teams,
                remaining: 0,
            })
        );
    }

    #[tokio::test]
    async fn missing_instance_is_reported() {
        let (harness, orchestrator) = Harness::new(azure_registry(), azure_definition()).await;
        let id = JobInstanceId {
            job_definition_id: harness.definition.id,
            instance_id: 42,
        };

        assert!(matches!(
            orchestrator.run_turn(id).await,
            Err(OrchestratorError::InstanceNotFound(_))
        ));
        assert!(harness.store.update_log().await.is_empty());
    }

    #[tokio::test]
    async fn timeout_leaves_state_untouched() {
        struct Stalled;

        impl StageFetcher for Stalled {
            fn stage(&self) -> Stage {
                Stage::Commits
            }

            fn fetch<'a>(
                &'a self,
                _context: &'a FetchContext,
                _state: &'a IntermediateState,
            ) -> BoxStream<'a, Data<Value>> {
                futures::stream::pending().boxed()
            }
        }

        let (harness, orchestrator) = Harness::new(azure_registry(), azure_definition()).await;
        let orchestrator =
            orchestrator.with_fetcher(IntegrationType::AzureDevops, Arc::new(Stalled));
        let id = harness.schedule(0).await;

        let error = orchestrator
            .run_turn_with_timeout(id, Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(matches!(error, OrchestratorError::TimedOut(_)));
        assert!(error.is_retriable());
        assert_eq!(harness.instance(id).await.status, JobStatus::Scheduled);
        assert!(harness.store.update_log().await.is_empty());
    }

    #[tokio::test]
    async fn resumed_turn_keeps_pages_of_failed_turn() {
        let (harness, orchestrator) = Harness::new(azure_registry(), azure_definition()).await;
        let prs = ProjectFetcher::new(Stage::Prs, vec!["p1", "p2", "p3"]);
        prs.fail_at(Some("p2"));
        let orchestrator = orchestrator.with_fetcher(IntegrationType::AzureDevops, prs.clone());
        let id = harness.schedule(0).await;

        let failed = orchestrator.run_turn(id).await.unwrap();
        assert_eq!(failed.status, JobStatus::PartialSuccess);
        assert_eq!(failed.pages.len(), 1);

        prs.fail_at(None);
        let resumed = orchestrator.run_turn(id).await.unwrap();

        assert_eq!(resumed.status, JobStatus::Success);
        assert_eq!(resumed.pages[0].page_number, Some(1));
        assert_eq!(
            harness.pages.paths(),
            vec![
                "pullrequests/pullrequests.0.json".to_string(),
                "pullrequests/pullrequests.1.json".to_string(),
            ]
        );
        assert_eq!(
            stored_projects(&harness.pages, "pullrequests/"),
            vec!["p1", "p2", "p3"]
        );
    }

    #[tokio::test]
    async fn ingestion_failures_reach_the_report() {
        let (harness, orchestrator) = Harness::new(azure_registry(), azure_definition()).await;
        let orchestrator =
            orchestrator.with_fetcher(IntegrationType::AzureDevops, Arc::new(PartialFetcher));
        let id = harness.schedule(0).await;

        let report = orchestrator.run_turn(id).await.unwrap();

        assert_eq!(report.status, JobStatus::Success);
        assert_eq!(report.records, 2);
        assert_eq!(
            report.ingestion_failures,
            vec![IngestionFailure::error("commit c3 unreadable")]
        );
        assert_eq!(report.pages.len(), 1);
        assert_eq!(report.pages[0].path, "commits/commits.0.json");
        assert_eq!(report.pages[0].records, 2);
    }

    #[tokio::test]
    async fn page_store_failure_leaves_instance_untouched() {
        let (harness, orchestrator) = Harness::with_page_store(
            azure_registry(),
            azure_definition(),
            Arc::new(MemoryPageStore::new()),
            Arc::new(FailingPageStore),
        )
        .await;
        let orchestrator = orchestrator.with_fetcher(
            IntegrationType::AzureDevops,
            ProjectFetcher::new(Stage::Commits, vec!["p1"]),
        );
        let id = harness.schedule(0).await;
        let before = harness.instance(id).await;

        let error = orchestrator.run_turn(id).await.unwrap_err();

        assert!(matches!(error, OrchestratorError::Stage(_)));
        assert!(error.is_retriable());
        assert!(harness.store.update_log().await.is_empty());
        let after = harness.instance(id).await;
        assert_eq!(after.status, JobStatus::Scheduled);
        assert_eq!(after.intermediate_state, before.intermediate_state);
        assert_eq!(after.start_time, None);
    }

    #[tokio::test]
    async fn failed_previous_run_forces_full_scan() {
        let mut definition = azure_definition();
        definition.last_full_sync_started_at = Some(
            DateTime::parse_from_rfc3339("2024-06-01T11:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        );
        definition.full_frequency_in_minutes = Some(10_080);
        let (harness, orchestrator) = Harness::new(azure_registry(), definition).await;
        let orchestrator = orchestrator.with_fetcher(
            IntegrationType::AzureDevops,
            ProjectFetcher::new(Stage::Teams, vec!["p1"]),
        );
        harness.finished(0, JobStatus::Success).await;
        harness.finished(1, JobStatus::Failure).await;
        let id = harness.schedule(2).await;

        let report = orchestrator.run_turn(id).await.unwrap();

        // The successful run 0 is within the interval.
        assert_eq!(
            report.scan_mode.map(|mode| mode.reason),
            Some(ScanReason::WithinInterval)
        );
        assert!(!report.is_full);

        let (harness, orchestrator) =
            Harness::new(azure_registry(), harness.definition.clone()).await;
        let orchestrator = orchestrator.with_fetcher(
            IntegrationType::AzureDevops,
            ProjectFetcher::new(Stage::Teams, vec!["p1"]),
        );
        harness.finished(0, JobStatus::Failure).await;
        let id = harness.schedule(1).await;

        let report = orchestrator.run_turn(id).await.unwrap();

        assert_eq!(
            report.scan_mode,
            Some(ScanMode::full(ScanReason::NoSuccessfulRun))
        );
        assert!(report.is_full);
        assert!(harness.instance(id).await.is_full);
    }
}
