//! In-memory implementation of StageRepository and JobRepository.
//!
//! Job instances are never stored on their own: they are read out of the
//! stage that holds them.

use super::MemoryStore;
use async_trait::async_trait;
use cadence_core::ids::{AgentId, JobId, StageId};
use cadence_core::job::JobPlan;
use cadence_core::ports::{JobRepository, StageRepository};
use cadence_core::run::{JobInstance, JobState, StageInstance};
use cadence_core::{Error, Result};
use tracing::debug;

#[async_trait]
impl StageRepository for MemoryStore {
    async fn next_stage_id(&self) -> Result<StageId> {
        let mut state = self.state.write().await;
        state.next_stage_id += 1;
        Ok(StageId::new(state.next_stage_id))
    }

    async fn save(&self, stage: &StageInstance) -> Result<()> {
        self.state.write().await.stages.insert(stage.id, stage.clone());
        Ok(())
    }

    async fn get(&self, id: StageId) -> Result<Option<StageInstance>> {
        Ok(self.state.read().await.stages.get(&id).cloned())
    }

    async fn latest(
        &self,
        pipeline: &str,
        pipeline_counter: u32,
        stage: &str,
    ) -> Result<Option<StageInstance>> {
        Ok(self
            .state
            .read()
            .await
            .stages
            .values()
            .filter(|s| {
                s.identifier.pipeline_name == pipeline
                    && s.identifier.pipeline_counter == pipeline_counter
                    && s.identifier.stage_name == stage
            })
            .max_by_key(|s| s.identifier.stage_counter)
            .cloned())
    }

    async fn most_recent_passed(
        &self,
        pipeline: &str,
        stage: &str,
    ) -> Result<Option<StageInstance>> {
        Ok(self
            .state
            .read()
            .await
            .stages
            .values()
            .filter(|s| {
                s.identifier.pipeline_name == pipeline
                    && s.identifier.stage_name == stage
                    && s.latest_run
                    && s.passed()
            })
            .max_by_key(|s| s.identifier.pipeline_counter)
            .cloned())
    }

    async fn is_stage_active(&self, pipeline: &str, stage: &str) -> Result<bool> {
        Ok(self.state.read().await.stages.values().any(|s| {
            s.identifier.pipeline_name == pipeline
                && s.identifier.stage_name == stage
                && s.is_active()
        }))
    }

    async fn find_by_job(&self, job_id: JobId) -> Result<Option<StageInstance>> {
        Ok(self
            .state
            .read()
            .await
            .stages
            .values()
            .find(|s| s.jobs.iter().any(|j| j.identifier.build_id == job_id))
            .cloned())
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn next_job_id(&self) -> Result<JobId> {
        let mut state = self.state.write().await;
        state.next_job_id += 1;
        Ok(JobId::new(state.next_job_id))
    }

    async fn save_plan(&self, plan: &JobPlan) -> Result<()> {
        self.state.write().await.plans.insert(plan.job_id(), plan.clone());
        Ok(())
    }

    async fn plan(&self, job_id: JobId) -> Result<Option<JobPlan>> {
        Ok(self.state.read().await.plans.get(&job_id).cloned())
    }

    async fn load_pending_job_plans(&self) -> Result<Vec<JobPlan>> {
        let state = self.state.read().await;
        let mut plans: Vec<JobPlan> = state
            .plans
            .values()
            .filter(|plan| plan.agent_id.is_none())
            .filter(|plan| {
                state
                    .job(plan.job_id())
                    .is_none_or(|job| !job.ignored && job.state == JobState::Scheduled)
            })
            .cloned()
            .collect();
        plans.sort_by_key(|plan| (plan.scheduled_at, plan.job_id()));
        Ok(plans)
    }

    async fn job(&self, job_id: JobId) -> Result<Option<JobInstance>> {
        Ok(self.state.read().await.job(job_id).cloned())
    }

    async fn persist_assignment(&self, job_id: JobId, agent_id: AgentId) -> Result<()> {
        let mut state = self.state.write().await;
        let plan = state
            .plans
            .get_mut(&job_id)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        plan.agent_id = Some(agent_id);
        debug!(job_id = %job_id, agent_id = %agent_id, "Assignment persisted");
        Ok(())
    }

    async fn active_jobs(&self) -> Result<Vec<JobInstance>> {
        Ok(self
            .state
            .read()
            .await
            .jobs()
            .filter(|j| j.is_active())
            .cloned()
            .collect())
    }

    async fn latest_active_job_on_agent(&self, agent_id: AgentId) -> Result<Option<JobInstance>> {
        Ok(self
            .state
            .read()
            .await
            .jobs()
            .filter(|j| j.is_active() && j.is_assigned_to(agent_id))
            .max_by_key(|j| (j.assigned_at, j.identifier.build_id))
            .cloned())
    }
}
