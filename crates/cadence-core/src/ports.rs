//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduling core and the
//! collaborators it depends on. `cadence-store` ships in-memory adapters.

use crate::agent::{Agent, ElasticAgentMetadata};
use crate::config::{CruiseConfig, PipelineConfig};
use crate::elastic::ResolvedProperties;
use crate::events::Event;
use crate::health::{HealthScope, HealthState};
use crate::ids::*;
use crate::job::JobPlan;
use crate::material::BuildCause;
use crate::run::{JobInstance, PipelineInstance, StageInstance};
use crate::secrets::{SecretParam, SecretUsage};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Repository for agent records.
#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Insert or replace an agent record.
    async fn save(&self, agent: &Agent) -> Result<()>;

    /// Get an agent by ID, including soft-deleted ones.
    async fn get(&self, id: AgentId) -> Result<Option<Agent>>;

    /// List agents that are not deleted.
    async fn list(&self) -> Result<Vec<Agent>>;

    /// Mark agents as deleted. History keeps referring to them.
    async fn soft_delete(&self, ids: &[AgentId]) -> Result<()>;
}

/// Pause and lock state of a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub pipeline: String,
    pub locked_by: Option<PipelineIdentifier>,
    pub paused: Option<PauseInfo>,
}

impl PipelineState {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            locked_by: None,
            paused: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseInfo {
    pub cause: Option<String>,
    pub paused_by: String,
    pub paused_at: DateTime<Utc>,
}

/// Repository for pipeline instances and their pause/lock state.
#[async_trait]
pub trait PipelineRepository: Send + Sync {
    /// Create the next instance of a pipeline, allocating id and counter.
    async fn create_instance(&self, name: &str, cause: &BuildCause) -> Result<PipelineInstance>;

    async fn get_instance(&self, name: &str, counter: u32) -> Result<Option<PipelineInstance>>;

    async fn instance_by_id(&self, id: PipelineId) -> Result<Option<PipelineInstance>>;

    async fn latest_instance(&self, name: &str) -> Result<Option<PipelineInstance>>;

    /// Current state; an unknown pipeline is unlocked and unpaused.
    async fn state(&self, name: &str) -> Result<PipelineState>;

    async fn save_state(&self, state: &PipelineState) -> Result<()>;
}

/// Repository for stage instances. Job instances live inside their stage.
#[async_trait]
pub trait StageRepository: Send + Sync {
    async fn next_stage_id(&self) -> Result<StageId>;

    /// Insert or replace a stage by id.
    async fn save(&self, stage: &StageInstance) -> Result<()>;

    async fn get(&self, id: StageId) -> Result<Option<StageInstance>>;

    /// Latest run of a stage within one pipeline instance.
    async fn latest(
        &self,
        pipeline: &str,
        pipeline_counter: u32,
        stage: &str,
    ) -> Result<Option<StageInstance>>;

    /// The passed latest run of a stage with the highest pipeline counter.
    async fn most_recent_passed(&self, pipeline: &str, stage: &str)
    -> Result<Option<StageInstance>>;

    /// Whether any run of the stage, in any pipeline instance, is active.
    async fn is_stage_active(&self, pipeline: &str, stage: &str) -> Result<bool>;

    /// The stage holding a job.
    async fn find_by_job(&self, job_id: JobId) -> Result<Option<StageInstance>>;
}

/// Repository for job plans and job assignment.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn next_job_id(&self) -> Result<JobId>;

    async fn save_plan(&self, plan: &JobPlan) -> Result<()>;

    async fn plan(&self, job_id: JobId) -> Result<Option<JobPlan>>;

    /// Scheduled but unassigned jobs, oldest first.
    async fn load_pending_job_plans(&self) -> Result<Vec<JobPlan>>;

    async fn job(&self, job_id: JobId) -> Result<Option<JobInstance>>;

    /// Record that a job was handed to an agent.
    async fn persist_assignment(&self, job_id: JobId, agent_id: AgentId) -> Result<()>;

    /// Jobs that are scheduled or held by an agent.
    async fn active_jobs(&self) -> Result<Vec<JobInstance>>;

    /// The active job most recently assigned to an agent.
    async fn latest_active_job_on_agent(&self, agent_id: AgentId) -> Result<Option<JobInstance>>;
}

/// Receives every new configuration snapshot.
#[async_trait]
pub trait ConfigChangeListener: Send + Sync {
    async fn on_config_change(&self, config: Arc<CruiseConfig>);
}

/// Source of configuration snapshots.
#[async_trait]
pub trait ConfigRepository: Send + Sync {
    /// The snapshot current at call time.
    async fn current(&self) -> Arc<CruiseConfig>;

    /// Register a listener called synchronously on every change.
    async fn register_listener(&self, listener: Arc<dyn ConfigChangeListener>);
}

/// Request to create one elastic agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateAgentRequest {
    pub job: JobIdentifier,
    pub environment: Option<String>,
    pub elastic_profile: ResolvedProperties,
    pub cluster_profile: ResolvedProperties,
}

/// Question asked before handing a job to an elastic agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShouldAssignWorkRequest {
    pub agent: ElasticAgentMetadata,
    pub job: JobIdentifier,
    pub environment: Option<String>,
    pub elastic_profile: ResolvedProperties,
    pub cluster_profile: ResolvedProperties,
}

/// Capability interface of an elastic agent plugin.
#[async_trait]
pub trait ElasticAgentPlugin: Send + Sync {
    fn plugin_id(&self) -> &str;

    async fn create_agent(&self, request: CreateAgentRequest) -> Result<()>;

    async fn should_assign_work(&self, request: ShouldAssignWorkRequest) -> Result<bool>;

    /// Periodic ping with every cluster profile owned by the plugin.
    async fn server_ping(&self, cluster_profiles: Vec<ResolvedProperties>) -> Result<()>;
}

/// Loaded plugins.
pub trait PluginRegistry: Send + Sync {
    fn elastic_plugin(&self, plugin_id: &str) -> Option<Arc<dyn ElasticAgentPlugin>>;

    fn elastic_plugin_ids(&self) -> Vec<String>;

    fn is_loaded(&self, plugin_id: &str) -> bool {
        self.elastic_plugin(plugin_id).is_some()
    }
}

/// Secrets backend.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Resolve every parameter or fail with `SecretResolution` or
    /// `RulesViolation`.
    async fn resolve(
        &self,
        usage: &SecretUsage,
        params: &[SecretParam],
    ) -> Result<BTreeMap<SecretParam, String>>;
}

/// Best-effort console output sink.
#[async_trait]
pub trait ConsoleLog: Send + Sync {
    async fn append(&self, job: &JobIdentifier, text: &str) -> Result<()>;
}

/// Server health reporting. Never fails.
#[async_trait]
pub trait HealthService: Send + Sync {
    async fn update(&self, state: HealthState);

    async fn remove_by_scope(&self, scope: &HealthScope);
}

/// Permission checks for user-initiated operations.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn can_operate_pipeline(&self, user: &str, pipeline: &str) -> bool;

    async fn can_operate_stage(&self, user: &str, pipeline: &str, stage: &str) -> bool;
}

/// Free space on the artifacts volume.
#[async_trait]
pub trait DiskSpace: Send + Sync {
    async fn usable_space_bytes(&self) -> Result<u64>;
}

/// Polls materials and decides whether a pipeline has something to build.
#[async_trait]
pub trait BuildCauseProducer: Send + Sync {
    /// `None` when nothing changed since `previous`.
    async fn produce(
        &self,
        pipeline: &PipelineConfig,
        previous: Option<&BuildCause>,
    ) -> Result<Option<BuildCause>>;
}

/// Receives domain events synchronously.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &Event) -> Result<()>;
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
