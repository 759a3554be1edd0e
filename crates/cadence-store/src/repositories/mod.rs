//! Persistence ports over a single in-memory state.

mod agent;
mod pipeline;
mod run;

use cadence_core::agent::Agent;
use cadence_core::ids::{AgentId, JobId, StageId};
use cadence_core::job::JobPlan;
use cadence_core::ports::{PauseInfo, PipelineState};
use cadence_core::run::{JobInstance, PipelineInstance, StageInstance};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    agents: HashMap<AgentId, Agent>,
    pipelines: Vec<PipelineInstance>,
    pipeline_states: HashMap<String, PipelineState>,
    stages: BTreeMap<StageId, StageInstance>,
    plans: BTreeMap<JobId, JobPlan>,
    next_pipeline_id: i64,
    next_stage_id: i64,
    next_job_id: i64,
}

impl State {
    fn jobs(&self) -> impl Iterator<Item = &JobInstance> {
        self.stages.values().flat_map(|s| s.jobs.iter())
    }

    fn job(&self, job_id: JobId) -> Option<&JobInstance> {
        self.jobs().find(|j| j.identifier.build_id == job_id)
    }
}

/// Implements the agent, pipeline, stage and job repositories.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store plans directly, bypassing stage creation.
    pub async fn seed_pending_plans(&self, plans: Vec<JobPlan>) {
        let mut state = self.state.write().await;
        for plan in plans {
            state.plans.insert(plan.job_id(), plan);
        }
    }

    /// Mark a pipeline as paused by `user`.
    pub async fn set_paused(&self, pipeline: &str, user: &str) {
        let mut state = self.state.write().await;
        let entry = state
            .pipeline_states
            .entry(pipeline.to_string())
            .or_insert_with(|| PipelineState::new(pipeline));
        entry.paused = Some(PauseInfo {
            cause: None,
            paused_by: user.to_string(),
            paused_at: chrono::Utc::now(),
        });
    }

    pub async fn stage_count(&self) -> usize {
        self.state.read().await.stages.len()
    }

    pub async fn pipeline_count(&self, pipeline: &str) -> usize {
        self.state
            .read()
            .await
            .pipelines
            .iter()
            .filter(|p| p.name() == pipeline)
            .count()
    }
}
