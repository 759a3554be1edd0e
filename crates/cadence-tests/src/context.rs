//! Test context providing access to a fully wired scheduler.

use anyhow::{Context, anyhow};
use cadence_core::agent::AgentRuntimeInfo;
use cadence_core::config::{CruiseConfig, PipelineConfig};
use cadence_core::ids::{AgentId, JobId, JobIdentifier, PipelineIdentifier};
use cadence_core::job::Work;
use cadence_core::material::BuildCause;
use cadence_core::run::{JobInstance, JobResult, JobState, StageInstance};
use cadence_scheduler::{Scheduler, SchedulerConfig, SchedulerContextBuilder};
use cadence_store::{
    FixedDiskSpace, ManualClock, MemoryConfigRepository, MemoryConsoleLog, MemoryHealthService,
    MemoryPluginRegistry, MemoryStore, ScriptedBuildCauseProducer, StaticPermissions,
    StaticSecretResolver,
};
use std::sync::Arc;

/// A started scheduler over in-memory adapters.
///
/// The clock is manual; nothing moves in time unless a test advances it.
pub struct TestContext {
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<MemoryStore>,
    pub config: Arc<MemoryConfigRepository>,
    pub plugins: Arc<MemoryPluginRegistry>,
    pub secrets: Arc<StaticSecretResolver>,
    pub console: Arc<MemoryConsoleLog>,
    pub health: Arc<MemoryHealthService>,
    pub permissions: Arc<StaticPermissions>,
    pub disk: Arc<FixedDiskSpace>,
    pub build_causes: Arc<ScriptedBuildCauseProducer>,
    pub clock: Arc<ManualClock>,
}

impl TestContext {
    /// Create a context with an empty configuration.
    pub async fn new() -> anyhow::Result<Self> {
        Self::build(SchedulerConfig::default(), CruiseConfig::default()).await
    }

    /// Create a context whose configuration holds only `pipelines`.
    pub async fn with_pipelines(pipelines: Vec<PipelineConfig>) -> anyhow::Result<Self> {
        Self::with_config(CruiseConfig {
            version: 1,
            pipelines,
            ..Default::default()
        })
        .await
    }

    pub async fn with_config(cruise: CruiseConfig) -> anyhow::Result<Self> {
        Self::build(SchedulerConfig::default(), cruise).await
    }

    /// Create and start a scheduler with every port in memory.
    pub async fn build(scheduler_config: SchedulerConfig, cruise: CruiseConfig) -> anyhow::Result<Self> {
        crate::init_test_logging();

        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(MemoryConfigRepository::new(cruise));
        let plugins = Arc::new(MemoryPluginRegistry::new());
        let secrets = Arc::new(StaticSecretResolver::new());
        let console = Arc::new(MemoryConsoleLog::new());
        let health = Arc::new(MemoryHealthService::new());
        let permissions = Arc::new(StaticPermissions::new());
        let disk = Arc::new(FixedDiskSpace::default());
        let build_causes = Arc::new(ScriptedBuildCauseProducer::new());
        let clock = Arc::new(ManualClock::new());

        let ctx = SchedulerContextBuilder::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            config.clone(),
            plugins.clone(),
            secrets.clone(),
            console.clone(),
            health.clone(),
        )
        .config(scheduler_config)
        .permissions(permissions.clone())
        .disk(disk.clone())
        .build_causes(build_causes.clone())
        .clock(clock.clone())
        .build();

        let scheduler = Arc::new(Scheduler::new(ctx));
        scheduler
            .start()
            .await
            .context("Failed to start scheduler")?;

        Ok(Self {
            scheduler,
            store,
            config,
            plugins,
            secrets,
            console,
            health,
            permissions,
            disk,
            build_causes,
            clock,
        })
    }

    pub async fn current_config(&self) -> Arc<CruiseConfig> {
        self.scheduler.ctx.config_repo.current().await
    }

    /// Publish a new configuration version derived from the current one.
    pub async fn update_config<F>(&self, edit: F)
    where
        F: FnOnce(&mut CruiseConfig),
    {
        let mut config = self.current_config().await.as_ref().clone();
        config.version += 1;
        edit(&mut config);
        self.config.set(config).await;
    }

    /// Force a new instance of `pipeline` and load its first stage into the
    /// pool.
    pub async fn trigger(&self, pipeline: &str) -> anyhow::Result<PipelineIdentifier> {
        let instance = self
            .scheduler
            .stages
            .schedule_pipeline(pipeline, BuildCause::forced_by("admin", vec![]))
            .await?
            .ok_or_else(|| anyhow!("Pipeline '{pipeline}' was not scheduled"))?;
        self.scheduler.pool.reload().await?;
        Ok(instance.identifier)
    }

    /// Register and approve a static agent offering `resources`.
    pub async fn agent(&self, resources: &[&str]) -> anyhow::Result<AgentId> {
        let id = AgentId::new();
        let info = AgentRuntimeInfo::new(id, format!("agent-{id}"), "10.0.0.2")
            .with_resources(resources.iter().copied());
        self.scheduler.registry.register(&info).await?;
        self.scheduler.registry.approve(id).await?;
        Ok(id)
    }

    pub async fn request_work(&self, agent: AgentId) -> anyhow::Result<Work> {
        Ok(self.scheduler.dispatcher.assign_work_to_agent(agent).await?)
    }

    pub async fn stage(
        &self,
        pipeline: &PipelineIdentifier,
        stage: &str,
    ) -> anyhow::Result<Option<StageInstance>> {
        Ok(self
            .scheduler
            .ctx
            .stages
            .latest(&pipeline.name, pipeline.counter, stage)
            .await?)
    }

    pub async fn job(&self, job_id: JobId) -> anyhow::Result<JobInstance> {
        self.scheduler
            .ctx
            .jobs
            .job(job_id)
            .await?
            .ok_or_else(|| anyhow!("Job {job_id} not found"))
    }

    /// Report the job through building and completion from the agent it
    /// was assigned to.
    pub async fn finish_job(
        &self,
        job: &JobIdentifier,
        agent: AgentId,
        result: JobResult,
    ) -> anyhow::Result<()> {
        let stages = &self.scheduler.stages;
        stages.update_job_status(job, JobState::Building, agent).await?;
        stages.job_completing(job, result, agent).await?;
        stages.update_job_status(job, JobState::Completed, agent).await?;
        Ok(())
    }

    /// Run every job of the latest `stage` run on throwaway agents, each
    /// ending with `result`.
    pub async fn complete_stage(
        &self,
        pipeline: &PipelineIdentifier,
        stage: &str,
        result: JobResult,
    ) -> anyhow::Result<()> {
        let instance = self
            .stage(pipeline, stage)
            .await?
            .ok_or_else(|| anyhow!("Stage {pipeline}/{stage} was never scheduled"))?;
        for job in instance.counted_jobs().filter(|j| j.is_active()) {
            let plan = self
                .scheduler
                .ctx
                .jobs
                .plan(job.identifier.build_id)
                .await?
                .ok_or_else(|| anyhow!("No plan for {}", job.identifier))?;
            let agent = AgentId::new();
            self.scheduler.stages.update_assigned_info(agent, &plan).await?;
            self.finish_job(&job.identifier, agent, result).await?;
        }
        self.scheduler.pool.reload().await?;
        Ok(())
    }
}
