//! Stage and pipeline scheduling.
//!
//! Creates pipeline and stage instances, applies job state changes, and on
//! every stage completion decides which stage runs next. The completion of
//! a stage and the evaluation of what it triggers happen in one call chain.
//!
//! Job mutations take the stage lock and then the job lock.

use crate::agents::AgentRegistry;
use crate::checkers::SchedulingCheckers;
use crate::context::SchedulerContext;
use crate::pause::PipelineStateService;
use crate::pool::JobPlanPool;
use crate::queue::PipelineScheduleQueue;
use cadence_core::config::{CruiseConfig, JobConfig, PipelineConfig, StageConfig};
use cadence_core::events::{
    Event, JobStatusChangedPayload, PipelineScheduledPayload, StageStatusChangedPayload,
};
use cadence_core::ids::*;
use cadence_core::job::JobPlan;
use cadence_core::material::BuildCause;
use cadence_core::run::{
    JobInstance, JobResult, JobState, PipelineInstance, StageInstance, StageResult, StageState,
};
use cadence_core::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

/// How a new stage run is populated.
enum StageRun<'a> {
    /// Every job scheduled afresh.
    Fresh,
    /// Only `rerun` jobs scheduled; the rest copied from `previous`.
    Partial {
        previous: &'a StageInstance,
        rerun: &'a [String],
    },
}

#[derive(Debug, Clone, Copy)]
enum Termination {
    Cancel,
    Fail,
}

/// A stage loaded under its lock and the lock of one of its jobs.
struct LockedJob {
    stage: StageInstance,
    _stage_guard: OwnedMutexGuard<()>,
    _job_guard: OwnedMutexGuard<()>,
}

pub struct StageScheduler {
    ctx: Arc<SchedulerContext>,
    registry: Arc<AgentRegistry>,
    pool: Arc<JobPlanPool>,
    pipeline_state: Arc<PipelineStateService>,
    checkers: Arc<SchedulingCheckers>,
    queue: Arc<PipelineScheduleQueue>,
}

impl StageScheduler {
    pub fn new(
        ctx: Arc<SchedulerContext>,
        registry: Arc<AgentRegistry>,
        pool: Arc<JobPlanPool>,
        pipeline_state: Arc<PipelineStateService>,
        checkers: Arc<SchedulingCheckers>,
        queue: Arc<PipelineScheduleQueue>,
    ) -> Self {
        Self {
            ctx,
            registry,
            pool,
            pipeline_state,
            checkers,
            queue,
        }
    }

    // ------------------------------------------------------------------
    // Pipelines
    // ------------------------------------------------------------------

    /// Create a new instance of `pipeline` and schedule its first stage.
    ///
    /// When the pipeline cannot be scheduled now, its queued cause is
    /// dropped; the next timer tick will look again.
    pub async fn schedule_pipeline(
        &self,
        pipeline: &str,
        cause: BuildCause,
    ) -> Result<Option<PipelineInstance>> {
        match self.try_schedule_pipeline(pipeline, &cause).await {
            Ok(Some(instance)) => {
                self.queue
                    .finish_schedule(pipeline, &cause, &instance.identifier)
                    .await;
                Ok(Some(instance))
            }
            Ok(None) => {
                self.queue.clear_pipeline(pipeline).await;
                Ok(None)
            }
            Err(e) => {
                self.queue.clear_pipeline(pipeline).await;
                error!(pipeline, error = %e, "Failed to schedule pipeline");
                Err(e)
            }
        }
    }

    async fn try_schedule_pipeline(
        &self,
        pipeline: &str,
        cause: &BuildCause,
    ) -> Result<Option<PipelineInstance>> {
        let config = self.ctx.config_repo.current().await;
        let pipeline_config = config.pipeline_or_err(pipeline)?;

        let verdict = self.checkers.can_auto_trigger_consumer(pipeline_config).await;
        if !verdict.can_continue() {
            info!(pipeline, reason = %verdict.message, "Skipping pipeline schedule");
            return Ok(None);
        }
        let first = pipeline_config.first_stage().ok_or_else(|| {
            Error::Validation(format!("Pipeline '{pipeline}' has no stages"))
        })?;

        let instance = self.ctx.pipelines.create_instance(pipeline, cause).await?;
        self.pipeline_state.lock_if_needed(&instance.identifier).await?;
        self.create_stage(
            &config,
            pipeline_config,
            &instance,
            first,
            1,
            &cause.approver,
            StageRun::Fresh,
        )
        .await?;

        info!(
            pipeline = %instance.identifier,
            cause = %cause.describe(),
            "Pipeline scheduled"
        );
        self.ctx
            .publish(Event::PipelineScheduled(PipelineScheduledPayload {
                pipeline: instance.identifier.clone(),
                cause: cause.describe(),
                timestamp: self.ctx.now(),
            }))
            .await;
        Ok(Some(instance))
    }

    /// Turn every queued build cause into a pipeline instance.
    pub async fn auto_schedule_pipelines_from_request_buffer(&self) -> Vec<PipelineIdentifier> {
        let verdict = self.checkers.can_schedule().await;
        if !verdict.can_continue() {
            warn!(reason = %verdict.message, "Scheduling is currently not possible");
            return Vec::new();
        }

        let mut scheduled = Vec::new();
        for (pipeline, cause) in self.queue.to_be_scheduled().await {
            if let Ok(Some(instance)) = self.schedule_pipeline(&pipeline, cause).await {
                scheduled.push(instance.identifier);
            }
        }
        scheduled
    }

    // ------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------

    /// Schedule `stage` in an existing pipeline instance on behalf of `user`.
    pub async fn schedule_stage(
        &self,
        pipeline: &PipelineIdentifier,
        stage: &str,
        user: &str,
    ) -> Result<StageInstance> {
        let config = self.ctx.config_repo.current().await;
        let pipeline_config = config.pipeline_or_err(&pipeline.name)?;
        let stage_config = config.stage_or_err(&pipeline.name, stage)?;
        let instance = self.pipeline_instance(pipeline).await?;

        self.checkers
            .can_schedule_stage(pipeline, stage, user)
            .await
            .into_result()?;
        self.schedule_stage_in(&config, pipeline_config, &instance, stage_config, user, StageRun::Fresh)
            .await
    }

    /// Run a stage again as a new stage counter.
    pub async fn rerun_stage(
        &self,
        pipeline: &PipelineIdentifier,
        stage: &str,
        user: &str,
    ) -> Result<StageInstance> {
        let config = self.ctx.config_repo.current().await;
        let pipeline_config = config.pipeline_or_err(&pipeline.name)?;
        let stage_config = config.stage_or_err(&pipeline.name, stage)?;
        let instance = self.pipeline_instance(pipeline).await?;
        if self
            .ctx
            .stages
            .latest(&pipeline.name, pipeline.counter, stage)
            .await?
            .is_none()
        {
            return Err(Error::StageNotFound(format!(
                "Stage '{stage}' has not run in pipeline {pipeline}"
            )));
        }

        self.checkers
            .can_rerun_stage(pipeline, stage, user)
            .await
            .into_result()?;
        let rerun = self
            .schedule_stage_in(&config, pipeline_config, &instance, stage_config, user, StageRun::Fresh)
            .await?;
        info!(stage = %rerun.identifier, user, "Stage rerun");
        Ok(rerun)
    }

    /// Run selected jobs of a completed stage again. Other jobs are copied
    /// into the new run with their results.
    pub async fn rerun_jobs(
        &self,
        stage_id: StageId,
        jobs: &[String],
        user: &str,
    ) -> Result<StageInstance> {
        if jobs.is_empty() {
            return Err(Error::Validation("No job was selected to re-run.".to_string()));
        }
        let previous = self.stage(stage_id).await?;
        let pipeline = previous.pipeline_identifier();
        let config = self.ctx.config_repo.current().await;
        let pipeline_config = config.pipeline_or_err(&pipeline.name)?;
        let stage_config = config.stage_or_err(&pipeline.name, previous.name())?;

        for name in jobs {
            if stage_config.job(name).is_none() || previous.job(name).is_none() {
                return Err(Error::JobNotFound(format!("{}/{name}", previous.identifier)));
            }
        }

        self.checkers
            .can_rerun_stage(&pipeline, previous.name(), user)
            .await
            .into_result()?;
        let instance = self.pipeline_instance(&pipeline).await?;
        let rerun = self
            .schedule_stage_in(
                &config,
                pipeline_config,
                &instance,
                stage_config,
                user,
                StageRun::Partial {
                    previous: &previous,
                    rerun: jobs,
                },
            )
            .await?;
        info!(stage = %rerun.identifier, user, jobs = ?jobs, "Jobs rerun");
        Ok(rerun)
    }

    /// Rerun the failed and cancelled jobs of a completed stage.
    pub async fn rerun_failed_jobs(&self, stage_id: StageId, user: &str) -> Result<StageInstance> {
        let stage = self.stage(stage_id).await?;
        if stage.is_active() {
            return Err(Error::Conflict(format!(
                "Stage {} is still in progress.",
                stage.identifier
            )));
        }
        let failed = stage.failed_job_names();
        if failed.is_empty() {
            return Err(Error::Validation(
                "There are no failed jobs in the stage that could be re-run".to_string(),
            ));
        }
        self.rerun_jobs(stage_id, &failed, user).await
    }

    /// Cancel every unfinished job of a stage, then evaluate what the
    /// completed stage triggers.
    pub async fn cancel_stage(&self, stage_id: StageId, user: &str) -> Result<()> {
        let stage = self.stage(stage_id).await?;
        if !self
            .ctx
            .permissions
            .can_operate_stage(user, &stage.identifier.pipeline_name, stage.name())
            .await
        {
            return Err(Error::Forbidden(format!(
                "User '{user}' does not have permission to cancel {}.",
                stage.identifier
            )));
        }

        let (stage, cancelled, completed) = {
            let _stage_guard = self
                .ctx
                .locks
                .stages
                .lock(&stage.identifier.lock_key())
                .await;
            let mut stage = self.stage(stage_id).await?;
            if !stage.is_active() {
                info!(stage = %stage.identifier, "Stage is not active. Cancellation ignored");
                return Ok(());
            }

            let now = self.ctx.now();
            let unfinished: Vec<JobId> = stage
                .counted_jobs()
                .filter(|j| !j.is_completed())
                .map(|j| j.identifier.build_id)
                .collect();
            let mut cancelled = Vec::new();
            for job_id in unfinished {
                let _job_guard = self.ctx.locks.jobs.lock(&job_id.to_string()).await;
                if let Some(job) = self
                    .terminate_in(&mut stage, job_id, Termination::Cancel, now)
                    .await
                {
                    cancelled.push(job);
                }
            }
            let completed = stage.update_result(now);
            self.ctx.stages.save(&stage).await?;
            (stage, cancelled, completed)
        };

        info!(stage = %stage.identifier, user, jobs = cancelled.len(), "Stage cancelled");
        for job in &cancelled {
            self.ctx
                .console_note(&job.identifier, &format!("Stage cancelled by {user}."))
                .await;
            self.publish_job(job).await;
        }
        if completed {
            self.stage_completed(&stage).await?;
        }
        Ok(())
    }

    /// Decide what runs after `stage` completed.
    ///
    /// Releases the pipeline lock when appropriate, then triggers the same
    /// stage in a newer pipeline instance that is waiting for it, then the
    /// next stage of this instance.
    pub async fn automatically_trigger_relevant_stages_following_completion_of(
        &self,
        stage: &StageInstance,
    ) -> Result<()> {
        if stage.is_active() {
            return Ok(());
        }
        let config = self.ctx.config_repo.current().await;
        let pipeline = stage.pipeline_identifier();
        let Some(pipeline_config) = config.pipeline(&pipeline.name) else {
            debug!(pipeline = %pipeline, "Pipeline no longer configured");
            return Ok(());
        };

        if should_unlock(pipeline_config, stage) {
            self.pipeline_state.unlock(&pipeline.name).await?;
        }
        if self.pipeline_state.is_paused(&pipeline.name).await? {
            info!(pipeline = %pipeline, "Pipeline is paused; not triggering further stages");
            return Ok(());
        }

        if let Some(newer) = self.newer_instance_to_trigger(pipeline_config, stage).await? {
            info!(
                stage = %stage.identifier,
                newer = %newer,
                "Triggering stage in newer pipeline instance"
            );
            self.trigger_stage(&newer, stage.name(), &stage.approved_by)
                .await?;
        }

        if stage.passed() {
            if let Some(next) = config.next_stage(&pipeline.name, stage.name()) {
                if next.requires_approval() {
                    debug!(stage = %next.name, "Next stage waits for manual approval");
                } else {
                    self.trigger_stage(&pipeline, &next.name, &stage.approved_by)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn trigger_stage(
        &self,
        pipeline: &PipelineIdentifier,
        stage: &str,
        approved_by: &str,
    ) -> Result<Option<StageInstance>> {
        let verdict = self.checkers.can_auto_schedule_stage(pipeline, stage).await;
        if !verdict.can_continue() {
            info!(pipeline = %pipeline, stage, reason = %verdict.message, "Not triggering stage");
            return Ok(None);
        }
        let config = self.ctx.config_repo.current().await;
        let pipeline_config = config.pipeline_or_err(&pipeline.name)?;
        let stage_config = config.stage_or_err(&pipeline.name, stage)?;
        let instance = self.pipeline_instance(pipeline).await?;
        self.schedule_stage_in(
            &config,
            pipeline_config,
            &instance,
            stage_config,
            approved_by,
            StageRun::Fresh,
        )
        .await
        .map(Some)
    }

    /// The newest later instance waiting for `stage`: the most recent passed
    /// run of the previous stage, when it is newer than `stage` and `stage`
    /// never ran in its instance.
    async fn newer_instance_to_trigger(
        &self,
        pipeline_config: &PipelineConfig,
        stage: &StageInstance,
    ) -> Result<Option<PipelineIdentifier>> {
        let Some(index) = pipeline_config.stage_index(stage.name()) else {
            return Ok(None);
        };
        if index == 0 || pipeline_config.stages[index].requires_approval() {
            return Ok(None);
        }
        let previous = &pipeline_config.stages[index - 1];

        let Some(passed) = self
            .ctx
            .stages
            .most_recent_passed(&pipeline_config.name, &previous.name)
            .await?
        else {
            return Ok(None);
        };
        if passed.identifier.pipeline_counter <= stage.identifier.pipeline_counter {
            return Ok(None);
        }

        let already_ran = self
            .ctx
            .stages
            .latest(
                &pipeline_config.name,
                passed.identifier.pipeline_counter,
                stage.name(),
            )
            .await?
            .is_some();
        Ok((!already_ran).then(|| passed.pipeline_identifier()))
    }

    async fn schedule_stage_in(
        &self,
        config: &CruiseConfig,
        pipeline_config: &PipelineConfig,
        instance: &PipelineInstance,
        stage_config: &StageConfig,
        approved_by: &str,
        run: StageRun<'_>,
    ) -> Result<StageInstance> {
        let counter = self
            .ctx
            .stages
            .latest(instance.name(), instance.counter(), &stage_config.name)
            .await?
            .map(|s| s.identifier.stage_counter + 1)
            .unwrap_or(1);
        self.pipeline_state.lock_if_needed(&instance.identifier).await?;
        let stage = self
            .create_stage(
                config,
                pipeline_config,
                instance,
                stage_config,
                counter,
                approved_by,
                run,
            )
            .await?;
        info!(stage = %stage.identifier, approved_by, "Stage scheduled");
        Ok(stage)
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_stage(
        &self,
        config: &CruiseConfig,
        pipeline_config: &PipelineConfig,
        instance: &PipelineInstance,
        stage_config: &StageConfig,
        counter: u32,
        approved_by: &str,
        run: StageRun<'_>,
    ) -> Result<StageInstance> {
        if stage_config.jobs.is_empty() {
            return Err(Error::Validation(format!(
                "Stage '{}' of pipeline '{}' has no jobs",
                stage_config.name, pipeline_config.name
            )));
        }
        let now = self.ctx.now();
        let identifier = StageIdentifier::new(&instance.identifier, &stage_config.name, counter);

        let mut jobs = Vec::new();
        let mut plans = Vec::new();
        for job_config in &stage_config.jobs {
            let job_id = self.ctx.jobs.next_job_id().await?;
            let job_identifier = JobIdentifier::new(identifier.clone(), &job_config.name, job_id);
            let copied = match &run {
                StageRun::Partial { previous, rerun } if !rerun.contains(&job_config.name) => {
                    previous.job(&job_config.name)
                }
                _ => None,
            };
            match copied {
                Some(previous_job) => {
                    let mut copy = previous_job.clone();
                    copy.identifier = job_identifier;
                    copy.copied = true;
                    jobs.push(copy);
                }
                None => {
                    plans.push(build_job_plan(
                        config,
                        pipeline_config,
                        stage_config,
                        job_config,
                        job_identifier.clone(),
                        instance.id,
                        now,
                    )?);
                    jobs.push(JobInstance::scheduled(job_identifier, now));
                }
            }
        }

        let mut stage = StageInstance {
            id: self.ctx.stages.next_stage_id().await?,
            pipeline_id: instance.id,
            identifier,
            order: pipeline_config.stage_index(&stage_config.name).unwrap_or(0),
            approval: stage_config.approval.kind,
            approved_by: approved_by.to_string(),
            jobs,
            state: StageState::Building,
            result: StageResult::Unknown,
            latest_run: true,
            created_at: now,
            completed_at: None,
        };
        stage.update_result(now);

        if counter > 1 {
            if let Some(mut previous) = self
                .ctx
                .stages
                .latest(instance.name(), instance.counter(), &stage_config.name)
                .await?
            {
                previous.latest_run = false;
                self.ctx.stages.save(&previous).await?;
            }
        }
        self.ctx.stages.save(&stage).await?;
        for plan in &plans {
            self.ctx.jobs.save_plan(plan).await?;
        }

        for job in stage.counted_jobs().filter(|j| !j.copied) {
            self.publish_job(job).await;
        }
        self.publish_stage(&stage).await;
        Ok(stage)
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// The agent reported the job's result and is uploading artifacts.
    pub async fn job_completing(
        &self,
        job: &JobIdentifier,
        result: JobResult,
        agent_id: AgentId,
    ) -> Result<()> {
        let instance = {
            let mut locked = self.lock_job(job.build_id).await?;
            let now = self.ctx.now();
            let Some(instance) = job_in(&mut locked.stage, job.build_id) else {
                return Err(Error::JobNotFound(job.to_string()));
            };
            if instance.ignored || instance.is_completed() {
                debug!(job = %job, "Ignoring completing report for finished job");
                return Ok(());
            }
            if !instance.is_assigned_to(agent_id) {
                return Err(Error::InvalidAgent {
                    agent: agent_id.to_string(),
                    job: job.to_string(),
                });
            }
            instance.result = result;
            instance.change_state(JobState::Completing, now);
            let instance = instance.clone();
            self.ctx.stages.save(&locked.stage).await?;
            instance
        };
        self.publish_job(&instance).await;
        Ok(())
    }

    /// Apply a state reported by the agent running the job.
    pub async fn update_job_status(
        &self,
        job: &JobIdentifier,
        state: JobState,
        agent_id: AgentId,
    ) -> Result<()> {
        let (instance, stage, completed) = {
            let mut locked = self.lock_job(job.build_id).await?;
            let now = self.ctx.now();
            let Some(instance) = job_in(&mut locked.stage, job.build_id) else {
                return Err(Error::JobNotFound(job.to_string()));
            };
            if instance.ignored || instance.is_completed() {
                debug!(job = %job, state = ?state, "Ignoring status update for finished job");
                return Ok(());
            }
            if !instance.is_assigned_to(agent_id) {
                return Err(Error::InvalidAgent {
                    agent: agent_id.to_string(),
                    job: job.to_string(),
                });
            }
            instance.change_state(state, now);
            let instance = instance.clone();
            let completed = locked.stage.update_result(now);
            self.ctx.stages.save(&locked.stage).await?;
            (instance, locked.stage, completed)
        };

        debug!(job = %job, state = ?state, "Job status updated");
        self.publish_job(&instance).await;
        if completed {
            self.stage_completed(&stage).await?;
        }
        Ok(())
    }

    /// Cancel one job. Returns false when it had already completed.
    pub async fn cancel_job(&self, job: &JobIdentifier) -> Result<bool> {
        self.terminate(job, Termination::Cancel).await
    }

    /// Fail one job. Returns false when it had already completed.
    pub async fn fail_job(&self, job: &JobIdentifier) -> Result<bool> {
        self.terminate(job, Termination::Fail).await
    }

    async fn terminate(&self, job: &JobIdentifier, termination: Termination) -> Result<bool> {
        let (instance, stage, completed) = {
            let mut locked = self.lock_job(job.build_id).await?;
            let now = self.ctx.now();
            let Some(instance) = self
                .terminate_in(&mut locked.stage, job.build_id, termination, now)
                .await
            else {
                return Ok(false);
            };
            let completed = locked.stage.update_result(now);
            self.ctx.stages.save(&locked.stage).await?;
            (instance, locked.stage, completed)
        };

        info!(job = %job, termination = ?termination, "Job terminated");
        self.publish_job(&instance).await;
        if completed {
            self.stage_completed(&stage).await?;
        }
        Ok(true)
    }

    /// Cancel or fail a job inside an already locked stage.
    async fn terminate_in(
        &self,
        stage: &mut StageInstance,
        job_id: JobId,
        termination: Termination,
        now: DateTime<Utc>,
    ) -> Option<JobInstance> {
        let instance = job_in(stage, job_id).filter(|j| !j.ignored)?;
        let agent = instance.agent_id;
        let changed = match termination {
            Termination::Cancel => instance.cancel(now),
            Termination::Fail => instance.fail(now),
        };
        if !changed {
            return None;
        }
        let instance = instance.clone();
        self.pool.remove(job_id).await;
        if let (Termination::Cancel, Some(agent)) = (termination, agent) {
            self.registry.job_cancelled(agent).await;
        }
        Some(instance)
    }

    /// Replace an unfinished job by a fresh scheduled copy.
    pub async fn reschedule_job(&self, job: &JobIdentifier) -> Result<()> {
        let (old, new) = {
            let mut locked = self.lock_job(job.build_id).await?;
            let now = self.ctx.now();
            let stage_identifier = locked.stage.identifier.clone();
            let Some(old) = job_in(&mut locked.stage, job.build_id).filter(|j| !j.ignored) else {
                return Ok(());
            };
            if old.is_completed() {
                debug!(job = %job, "Job already completed; not rescheduling");
                return Ok(());
            }
            old.reschedule(now);
            let old = old.clone();

            let plan = self
                .ctx
                .jobs
                .plan(job.build_id)
                .await?
                .ok_or_else(|| Error::JobNotFound(job.to_string()))?;
            let new_id = self.ctx.jobs.next_job_id().await?;
            let identifier = JobIdentifier::new(stage_identifier, old.name(), new_id);
            let new = JobInstance::scheduled(identifier.clone(), now);
            locked.stage.jobs.push(new.clone());
            self.ctx.stages.save(&locked.stage).await?;
            self.ctx
                .jobs
                .save_plan(&JobPlan {
                    identifier,
                    agent_id: None,
                    scheduled_at: now,
                    ..plan
                })
                .await?;
            self.pool.remove(job.build_id).await;
            (old, new)
        };

        info!(
            job = %job,
            new_job = %new.identifier,
            agent_id = ?old.agent_id,
            "Rescheduled job"
        );
        self.publish_job(&old).await;
        self.publish_job(&new).await;
        Ok(())
    }

    /// An agent asking for work cannot still be running a job; reschedule
    /// the job it abandoned.
    pub async fn reschedule_abandoned_build_if_necessary(&self, agent_id: AgentId) -> Result<()> {
        let Some(job) = self.ctx.jobs.latest_active_job_on_agent(agent_id).await? else {
            return Ok(());
        };
        if !job.state.is_on_agent() {
            return Ok(());
        }
        warn!(
            agent_id = %agent_id,
            job = %job.identifier,
            "Agent asked for work while still assigned a job; rescheduling it"
        );
        self.ctx
            .console_note(
                &job.identifier,
                "The agent running this job asked for new work. The job was rescheduled.",
            )
            .await;
        self.reschedule_job(&job.identifier).await
    }

    /// Reschedule jobs held by agents that are no longer alive.
    pub async fn reschedule_hung_jobs(&self) -> Result<Vec<JobIdentifier>> {
        let live: HashSet<AgentId> = self
            .registry
            .registered_agents()
            .await
            .into_iter()
            .filter(|a| !a.is_lost_contact())
            .map(|a| a.id())
            .collect();

        let hung: Vec<JobInstance> = self
            .ctx
            .jobs
            .active_jobs()
            .await?
            .into_iter()
            .filter(|j| j.state.is_on_agent())
            .filter(|j| j.agent_id.is_some_and(|a| !live.contains(&a)))
            .collect();

        let mut rescheduled = Vec::new();
        for job in hung {
            warn!(job = %job.identifier, agent_id = ?job.agent_id, "Rescheduling job held by a lost agent");
            match self.reschedule_job(&job.identifier).await {
                Ok(()) => rescheduled.push(job.identifier),
                Err(e) => error!(job = %job.identifier, error = %e, "Failed to reschedule hung job"),
            }
        }
        Ok(rescheduled)
    }

    /// Mark the job assigned to `agent_id`. Returns true when the job had
    /// already finished and must not be handed out.
    pub async fn update_assigned_info(&self, agent_id: AgentId, plan: &JobPlan) -> Result<bool> {
        let instance = {
            let mut locked = self.lock_job(plan.job_id()).await?;
            let now = self.ctx.now();
            let Some(instance) = job_in(&mut locked.stage, plan.job_id()) else {
                return Ok(true);
            };
            if instance.ignored || instance.is_completed() {
                return Ok(true);
            }
            instance.assign(agent_id, now);
            let instance = instance.clone();
            self.ctx.stages.save(&locked.stage).await?;
            self.ctx
                .jobs
                .persist_assignment(plan.job_id(), agent_id)
                .await?;
            instance
        };
        self.publish_job(&instance).await;
        Ok(false)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn stage_completed(&self, stage: &StageInstance) -> Result<()> {
        info!(stage = %stage.identifier, result = ?stage.result, "Stage completed");
        self.publish_stage(stage).await;
        self.automatically_trigger_relevant_stages_following_completion_of(stage)
            .await
    }

    async fn lock_job(&self, job_id: JobId) -> Result<LockedJob> {
        let stage = self.stage_for_job(job_id).await?;
        let stage_guard = self
            .ctx
            .locks
            .stages
            .lock(&stage.identifier.lock_key())
            .await;
        let job_guard = self.ctx.locks.jobs.lock(&job_id.to_string()).await;
        let stage = self.stage_for_job(job_id).await?;
        Ok(LockedJob {
            stage,
            _stage_guard: stage_guard,
            _job_guard: job_guard,
        })
    }

    async fn stage_for_job(&self, job_id: JobId) -> Result<StageInstance> {
        self.ctx
            .stages
            .find_by_job(job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))
    }

    async fn stage(&self, stage_id: StageId) -> Result<StageInstance> {
        self.ctx
            .stages
            .get(stage_id)
            .await?
            .ok_or_else(|| Error::StageNotFound(stage_id.to_string()))
    }

    async fn pipeline_instance(&self, pipeline: &PipelineIdentifier) -> Result<PipelineInstance> {
        self.ctx
            .pipelines
            .get_instance(&pipeline.name, pipeline.counter)
            .await?
            .ok_or_else(|| Error::PipelineNotFound(pipeline.to_string()))
    }

    async fn publish_job(&self, job: &JobInstance) {
        self.ctx
            .publish(Event::JobStatusChanged(JobStatusChangedPayload {
                job: job.identifier.clone(),
                state: job.state,
                result: job.result,
                agent_id: job.agent_id,
                timestamp: self.ctx.now(),
            }))
            .await;
    }

    async fn publish_stage(&self, stage: &StageInstance) {
        self.ctx
            .publish(Event::StageStatusChanged(StageStatusChangedPayload {
                stage: stage.identifier.clone(),
                state: stage.state,
                result: stage.result,
                timestamp: self.ctx.now(),
            }))
            .await;
    }
}

fn job_in(stage: &mut StageInstance, job_id: JobId) -> Option<&mut JobInstance> {
    stage
        .jobs
        .iter_mut()
        .find(|j| j.identifier.build_id == job_id)
}

/// Whether the completion of `stage` releases the pipeline lock.
fn should_unlock(pipeline_config: &PipelineConfig, stage: &StageInstance) -> bool {
    if !pipeline_config.is_lockable() {
        return false;
    }
    let Some(index) = pipeline_config.stage_index(stage.name()) else {
        return true;
    };
    let is_last = index + 1 == pipeline_config.stages.len();
    if pipeline_config.lock_behavior.is_unlockable_when_finished() {
        let next_is_manual = pipeline_config
            .stages
            .get(index + 1)
            .is_some_and(StageConfig::requires_approval);
        return is_last || !stage.passed() || next_is_manual;
    }
    is_last
}

/// The plan for one job of a new stage run.
fn build_job_plan(
    config: &CruiseConfig,
    pipeline_config: &PipelineConfig,
    stage_config: &StageConfig,
    job_config: &JobConfig,
    identifier: JobIdentifier,
    pipeline_id: PipelineId,
    now: DateTime<Utc>,
) -> Result<JobPlan> {
    let elastic_profile = match &job_config.elastic_profile_id {
        Some(id) => Some(config.elastic_profile(id).cloned().ok_or_else(|| {
            Error::NotFound(format!(
                "Elastic profile '{id}' used by job {identifier} does not exist"
            ))
        })?),
        None => None,
    };
    let cluster_profile = elastic_profile
        .as_ref()
        .and_then(|p| config.cluster_profile(&p.cluster_profile_id).cloned());

    let mut variables = pipeline_config.variables.clone();
    variables.extend(stage_config.variables.iter().cloned());
    variables.extend(job_config.variables.iter().cloned());

    Ok(JobPlan {
        identifier,
        pipeline_id,
        resources: job_config.resources.clone(),
        elastic_profile,
        cluster_profile,
        artifact_plans: job_config.artifacts.clone(),
        variables,
        agent_id: None,
        timeout: job_config.timeout,
        scheduled_at: now,
    })
}
