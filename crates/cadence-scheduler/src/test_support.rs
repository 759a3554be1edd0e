//! Shared wiring for unit tests: every port backed by `cadence-store`.

use crate::config::SchedulerConfig;
use crate::context::{SchedulerContext, SchedulerContextBuilder};
use crate::scheduler::Scheduler;
use async_trait::async_trait;
use cadence_core::{Error, Result};
use cadence_core::agent::{Agent, AgentRuntimeInfo};
use cadence_core::config::{
    Approval, CruiseConfig, JobConfig, JobTimeout, PipelineConfig, StageConfig, Task,
};
use cadence_core::elastic::{ClusterProfile, ElasticProfile, ResolvedProperties};
use cadence_core::ids::{
    AgentId, JobId, JobIdentifier, PipelineId, PipelineIdentifier, StageIdentifier,
};
use cadence_core::job::JobPlan;
use cadence_core::ports::{
    AgentRepository, ConfigRepository, CreateAgentRequest, ElasticAgentPlugin, JobRepository,
    ShouldAssignWorkRequest,
};
use cadence_store::{
    FixedDiskSpace, ManualClock, MemoryConfigRepository, MemoryConsoleLog, MemoryHealthService,
    MemoryPluginRegistry, MemoryStore, ScriptedBuildCauseProducer, StaticPermissions,
    StaticSecretResolver,
};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

pub struct TestPorts {
    pub store: Arc<MemoryStore>,
    pub agents: Arc<dyn AgentRepository>,
    pub config: Arc<MemoryConfigRepository>,
    pub plugins: Arc<MemoryPluginRegistry>,
    pub secrets: Arc<StaticSecretResolver>,
    pub console: Arc<MemoryConsoleLog>,
    pub health: Arc<MemoryHealthService>,
    pub permissions: Arc<StaticPermissions>,
    pub disk: Arc<FixedDiskSpace>,
    pub build_causes: Arc<ScriptedBuildCauseProducer>,
    pub clock: Arc<ManualClock>,
    scheduler_config: SchedulerConfig,
    context: OnceLock<Arc<SchedulerContext>>,
}

impl TestPorts {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(scheduler_config: SchedulerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            agents: store.clone(),
            store,
            config: Arc::new(MemoryConfigRepository::default()),
            plugins: Arc::new(MemoryPluginRegistry::new()),
            secrets: Arc::new(StaticSecretResolver::new()),
            console: Arc::new(MemoryConsoleLog::new()),
            health: Arc::new(MemoryHealthService::new()),
            permissions: Arc::new(StaticPermissions::new()),
            disk: Arc::new(FixedDiskSpace::default()),
            build_causes: Arc::new(ScriptedBuildCauseProducer::new()),
            clock: Arc::new(ManualClock::new()),
            scheduler_config,
            context: OnceLock::new(),
        }
    }

    /// Replace the agent repository. Call before the context is built.
    pub fn with_agents(mut self, agents: Arc<dyn AgentRepository>) -> Self {
        self.agents = agents;
        self
    }

    /// The context every service of one test shares.
    pub fn context(&self) -> Arc<SchedulerContext> {
        self.context
            .get_or_init(|| {
                SchedulerContextBuilder::new(
                    self.agents.clone(),
                    self.store.clone(),
                    self.store.clone(),
                    self.store.clone(),
                    self.config.clone(),
                    self.plugins.clone(),
                    self.secrets.clone(),
                    self.console.clone(),
                    self.health.clone(),
                )
                .config(self.scheduler_config.clone())
                .permissions(self.permissions.clone())
                .disk(self.disk.clone())
                .build_causes(self.build_causes.clone())
                .clock(self.clock.clone())
                .build()
            })
            .clone()
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.context())
    }

    pub async fn set_config(&self, config: CruiseConfig) {
        self.config.set(config).await;
    }

    pub async fn set_pipelines(&self, pipelines: Vec<PipelineConfig>) {
        let mut config = self.config.current().await.as_ref().clone();
        config.version += 1;
        config.pipelines = pipelines;
        self.set_config(config).await;
    }
}

pub trait StoreExt {
    async fn plan_of(&self, job_id: JobId) -> JobPlan;
}

impl StoreExt for MemoryStore {
    async fn plan_of(&self, job_id: JobId) -> JobPlan {
        JobRepository::plan(self, job_id).await.unwrap().unwrap()
    }
}

pub fn job_plan(pipeline: &str, id: i64, resources: &[&str]) -> JobPlan {
    let stage = StageIdentifier::new(&PipelineIdentifier::new(pipeline, 1), "build", 1);
    JobPlan {
        identifier: JobIdentifier::new(stage, format!("job-{id}"), JobId::new(id)),
        pipeline_id: PipelineId::new(1),
        resources: resources.iter().map(|r| r.to_string()).collect(),
        elastic_profile: None,
        cluster_profile: None,
        artifact_plans: vec![],
        variables: vec![],
        agent_id: None,
        timeout: JobTimeout::Default,
        scheduled_at: DateTime::<Utc>::default(),
    }
}

/// One stage `build` with one job `compile`, in group `default`.
pub fn simple_pipeline(name: &str) -> PipelineConfig {
    PipelineConfig::new(name, "default").with_stage(
        StageConfig::new("build")
            .with_job(JobConfig::new("compile").with_task(Task::exec("make", &["all"]))),
    )
}

/// `build` followed by `test`, the second stage gated by `approval`.
pub fn two_stage_pipeline(name: &str, approval: Approval) -> PipelineConfig {
    simple_pipeline(name).with_stage(
        StageConfig::new("test")
            .with_approval(approval)
            .with_job(JobConfig::new("unit").with_task(Task::exec("make", &["test"]))),
    )
}

pub fn resource_pipeline(name: &str, resources: &[&str]) -> PipelineConfig {
    PipelineConfig::new(name, "default").with_stage(
        StageConfig::new("build").with_job(
            JobConfig::new("compile")
                .with_resources(resources.iter().copied())
                .with_task(Task::exec("make", &["all"])),
        ),
    )
}

/// A configuration whose only job runs on agents from `plugin_id`.
pub fn elastic_pipeline(name: &str, plugin_id: &str) -> CruiseConfig {
    CruiseConfig {
        version: 1,
        pipelines: vec![PipelineConfig::new(name, "default").with_stage(
            StageConfig::new("build")
                .with_job(JobConfig::new("compile").with_elastic_profile("builder")),
        )],
        elastic_profiles: vec![
            ElasticProfile::new("builder", plugin_id, "cluster").with_property("image", "rust:1"),
        ],
        cluster_profiles: vec![
            ClusterProfile::new("cluster", plugin_id).with_property("url", "unix:///var/run/docker.sock"),
        ],
        ..Default::default()
    }
}

/// Agent repository over a `MemoryStore` that refuses to save one agent.
pub struct FlakyAgentRepository {
    inner: MemoryStore,
    failing: std::sync::Mutex<Option<AgentId>>,
}

impl FlakyAgentRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            failing: std::sync::Mutex::new(None),
        })
    }

    pub fn fail_saves_for(&self, id: AgentId) {
        *self.failing.lock().unwrap() = Some(id);
    }
}

#[async_trait]
impl AgentRepository for FlakyAgentRepository {
    async fn save(&self, agent: &Agent) -> Result<()> {
        if *self.failing.lock().unwrap() == Some(agent.id) {
            return Err(Error::Persistence(format!("agent {} is read-only", agent.id)));
        }
        AgentRepository::save(&self.inner, agent).await
    }

    async fn get(&self, id: AgentId) -> Result<Option<Agent>> {
        AgentRepository::get(&self.inner, id).await
    }

    async fn list(&self) -> Result<Vec<Agent>> {
        self.inner.list().await
    }

    async fn soft_delete(&self, ids: &[AgentId]) -> Result<()> {
        self.inner.soft_delete(ids).await
    }
}

/// Register and approve a static agent with `resources`.
pub async fn approved_agent(scheduler: &Scheduler, resources: &[&str]) -> AgentId {
    let id = AgentId::new();
    let info = AgentRuntimeInfo::new(id, format!("host-{id}"), "10.0.0.1")
        .with_resources(resources.iter().copied());
    scheduler.registry.register(&info).await.unwrap();
    scheduler.registry.approve(id).await.unwrap();
    id
}

/// Elastic agent plugin that records every call and agrees to every
/// assignment.
pub struct RecordingPlugin {
    plugin_id: String,
    created: Mutex<Vec<CreateAgentRequest>>,
    pings: AtomicUsize,
}

impl RecordingPlugin {
    pub fn new(plugin_id: &str) -> Arc<Self> {
        Arc::new(Self {
            plugin_id: plugin_id.to_string(),
            created: Mutex::new(Vec::new()),
            pings: AtomicUsize::new(0),
        })
    }

    pub async fn created(&self) -> Vec<CreateAgentRequest> {
        self.created.lock().await.clone()
    }

    pub async fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ElasticAgentPlugin for RecordingPlugin {
    fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    async fn create_agent(&self, request: CreateAgentRequest) -> Result<()> {
        self.created.lock().await.push(request);
        Ok(())
    }

    async fn should_assign_work(&self, _request: ShouldAssignWorkRequest) -> Result<bool> {
        Ok(true)
    }

    async fn server_ping(&self, _cluster_profiles: Vec<ResolvedProperties>) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
