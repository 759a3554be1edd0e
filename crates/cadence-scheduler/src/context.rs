//! Shared handles every scheduling service is built from.

use crate::config::SchedulerConfig;
use crate::events::EventHub;
use crate::locks::SchedulerLocks;
use cadence_core::events::Event;
use cadence_core::ids::JobIdentifier;
use cadence_core::ports::*;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

/// Ports plus the scheduler-owned shared state.
#[derive(Clone)]
pub struct SchedulerContext {
    pub config: SchedulerConfig,
    pub agents: Arc<dyn AgentRepository>,
    pub pipelines: Arc<dyn PipelineRepository>,
    pub stages: Arc<dyn StageRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub config_repo: Arc<dyn ConfigRepository>,
    pub plugins: Arc<dyn PluginRegistry>,
    pub secrets: Arc<dyn SecretResolver>,
    pub console: Arc<dyn ConsoleLog>,
    pub health: Arc<dyn HealthService>,
    pub permissions: Arc<dyn PermissionChecker>,
    pub disk: Arc<dyn DiskSpace>,
    pub build_causes: Arc<dyn BuildCauseProducer>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<EventHub>,
    pub locks: Arc<SchedulerLocks>,
}

impl SchedulerContext {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn publish(&self, event: Event) {
        self.events.publish(event).await;
    }

    /// Append to a job's console. Failures are logged and swallowed.
    pub async fn console_note(&self, job: &JobIdentifier, text: &str) {
        if let Err(e) = self.console.append(job, text).await {
            warn!(job = %job, error = %e, "Failed to write to console log");
        }
    }
}

/// Builder for [`SchedulerContext`], so tests can swap a single port.
pub struct SchedulerContextBuilder {
    config: SchedulerConfig,
    agents: Arc<dyn AgentRepository>,
    pipelines: Arc<dyn PipelineRepository>,
    stages: Arc<dyn StageRepository>,
    jobs: Arc<dyn JobRepository>,
    config_repo: Arc<dyn ConfigRepository>,
    plugins: Arc<dyn PluginRegistry>,
    secrets: Arc<dyn SecretResolver>,
    console: Arc<dyn ConsoleLog>,
    health: Arc<dyn HealthService>,
    permissions: Arc<dyn PermissionChecker>,
    disk: Arc<dyn DiskSpace>,
    build_causes: Arc<dyn BuildCauseProducer>,
    clock: Arc<dyn Clock>,
}

impl SchedulerContextBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agents: Arc<dyn AgentRepository>,
        pipelines: Arc<dyn PipelineRepository>,
        stages: Arc<dyn StageRepository>,
        jobs: Arc<dyn JobRepository>,
        config_repo: Arc<dyn ConfigRepository>,
        plugins: Arc<dyn PluginRegistry>,
        secrets: Arc<dyn SecretResolver>,
        console: Arc<dyn ConsoleLog>,
        health: Arc<dyn HealthService>,
    ) -> Self {
        Self {
            config: SchedulerConfig::default(),
            agents,
            pipelines,
            stages,
            jobs,
            config_repo,
            plugins,
            secrets,
            console,
            health,
            permissions: Arc::new(AllowAll),
            disk: Arc::new(UnlimitedDisk),
            build_causes: Arc::new(NoChanges),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn permissions(mut self, permissions: Arc<dyn PermissionChecker>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn disk(mut self, disk: Arc<dyn DiskSpace>) -> Self {
        self.disk = disk;
        self
    }

    pub fn build_causes(mut self, build_causes: Arc<dyn BuildCauseProducer>) -> Self {
        self.build_causes = build_causes;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Arc<SchedulerContext> {
        Arc::new(SchedulerContext {
            config: self.config,
            agents: self.agents,
            pipelines: self.pipelines,
            stages: self.stages,
            jobs: self.jobs,
            config_repo: self.config_repo,
            plugins: self.plugins,
            secrets: self.secrets,
            console: self.console,
            health: self.health,
            permissions: self.permissions,
            disk: self.disk,
            build_causes: self.build_causes,
            clock: self.clock,
            events: Arc::new(EventHub::new()),
            locks: Arc::new(SchedulerLocks::default()),
        })
    }
}

struct AllowAll;

#[async_trait::async_trait]
impl PermissionChecker for AllowAll {
    async fn can_operate_pipeline(&self, _user: &str, _pipeline: &str) -> bool {
        true
    }

    async fn can_operate_stage(&self, _user: &str, _pipeline: &str, _stage: &str) -> bool {
        true
    }
}

struct UnlimitedDisk;

#[async_trait::async_trait]
impl DiskSpace for UnlimitedDisk {
    async fn usable_space_bytes(&self) -> cadence_core::Result<u64> {
        Ok(u64::MAX)
    }
}

struct NoChanges;

#[async_trait::async_trait]
impl BuildCauseProducer for NoChanges {
    async fn produce(
        &self,
        _pipeline: &cadence_core::config::PipelineConfig,
        _previous: Option<&cadence_core::material::BuildCause>,
    ) -> cadence_core::Result<Option<cadence_core::material::BuildCause>> {
        Ok(None)
    }
}
