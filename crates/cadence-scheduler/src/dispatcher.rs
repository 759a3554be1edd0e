//! Hands pending jobs to agents asking for work.
//!
//! A plan is taken out of the pool before its assignment is built, so two
//! agents can never be given the same job. Everything between the
//! eligibility re-check and marking the agent busy runs under the
//! registry's assignment lock.

use crate::agents::{AgentInstance, AgentRegistry};
use crate::context::SchedulerContext;
use crate::elastic::ElasticAgentOrchestrator;
use crate::matcher;
use crate::pool::JobPlanPool;
use crate::stages::StageScheduler;
use async_trait::async_trait;
use cadence_core::config::{ArtifactStore, CruiseConfig, EnvironmentVariable, Task};
use cadence_core::ids::{AgentId, JobIdentifier};
use cadence_core::job::{BuildAssignment, Builder, EnvironmentContext, JobPlan, Work};
use cadence_core::ports::ConfigChangeListener;
use cadence_core::secrets::{ConfigValue, SecretParam, SecretUsage, collect_params};
use cadence_core::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct AssignmentDispatcher {
    ctx: Arc<SchedulerContext>,
    registry: Arc<AgentRegistry>,
    pool: Arc<JobPlanPool>,
    stages: Arc<StageScheduler>,
    elastic: Arc<ElasticAgentOrchestrator>,
}

impl AssignmentDispatcher {
    pub fn new(
        ctx: Arc<SchedulerContext>,
        registry: Arc<AgentRegistry>,
        pool: Arc<JobPlanPool>,
        stages: Arc<StageScheduler>,
        elastic: Arc<ElasticAgentOrchestrator>,
    ) -> Self {
        Self {
            ctx,
            registry,
            pool,
            stages,
            elastic,
        }
    }

    /// Find work for an agent.
    pub async fn assign_work_to_agent(&self, agent_id: AgentId) -> Result<Work> {
        match self.registry.find(agent_id).await {
            Some(agent) if agent.is_registered() => {
                if agent.is_disabled() {
                    return Ok(Work::DeniedAgentWork { agent_id });
                }
            }
            _ => return Ok(Work::UnregisteredAgentWork { agent_id }),
        }

        let lock = self.registry.assignment_lock();
        let _assignment = lock.lock().await;

        let Some(agent) = self.registry.find(agent_id).await else {
            return Ok(Work::UnregisteredAgentWork { agent_id });
        };
        if agent.is_disabled() {
            debug!(agent_id = %agent_id, "Agent disabled while asking for work");
            return Ok(Work::DeniedAgentWork { agent_id });
        }

        if let Err(e) = self
            .stages
            .reschedule_abandoned_build_if_necessary(agent_id)
            .await
        {
            error!(agent_id = %agent_id, error = %e, "Failed to reschedule abandoned build");
        }

        let config = self.ctx.config_repo.current().await;
        let Some(plan) = self.take_matching(&agent, &config).await else {
            return Ok(Work::NoWork);
        };

        let assignment = match self.build_assignment(&agent, &plan, &config).await {
            Ok(assignment) => assignment,
            Err(e) if e.is_job_failure() => {
                warn!(job = %plan.identifier, agent_id = %agent_id, error = %e, "Failing job");
                self.ctx
                    .console_note(&plan.identifier, &format!("Job failed before it could start: {e}"))
                    .await;
                self.stages.fail_job(&plan.identifier).await?;
                return Ok(Work::NoWork);
            }
            Err(e) if e.is_not_found() => {
                warn!(job = %plan.identifier, error = %e, "Job removed from configuration");
                self.job_removed(&plan.identifier).await;
                return Err(e);
            }
            Err(e) => {
                error!(job = %plan.identifier, error = %e, "Failed to build assignment");
                self.pool.restore(plan).await;
                return Err(e);
            }
        };

        match self.stages.update_assigned_info(agent_id, &plan).await {
            Ok(true) => {
                debug!(job = %plan.identifier, "Job already finished; not assigned");
                return Ok(Work::NoWork);
            }
            Ok(false) => {}
            Err(e) => {
                error!(job = %plan.identifier, error = %e, "Failed to record assignment");
                self.pool.restore(plan).await;
                return Err(e);
            }
        }
        self.registry.building(agent_id, &plan.identifier).await;

        info!(
            agent_id = %agent_id,
            hostname = %agent.agent().hostname,
            job = %plan.identifier,
            "Assigned job to agent"
        );
        Ok(Work::Build(Box::new(assignment)))
    }

    async fn take_matching(&self, agent: &AgentInstance, config: &CruiseConfig) -> Option<JobPlan> {
        if !agent.is_elastic() {
            return self
                .pool
                .take_first(|plan| {
                    matcher::environment_matches(plan, agent.agent(), config)
                        && matcher::static_assignment_matches(plan, agent.agent())
                })
                .await;
        }

        let snapshot = self.pool.job_plans().await;
        let candidates = matcher::filter_by_agent(&snapshot, agent.agent(), config);
        for plan in candidates.into_iter().filter(|p| p.requires_elastic_agent()) {
            match self.elastic.should_assign_work(agent, plan).await {
                Ok(true) => {
                    if let Some(taken) = self.pool.take(plan.job_id()).await {
                        return Some(taken);
                    }
                }
                Ok(false) => {}
                Err(e) if e.is_job_failure() => {
                    warn!(job = %plan.identifier, error = %e, "Failing elastic job");
                    self.ctx
                        .console_note(&plan.identifier, &format!("Job failed before it could start: {e}"))
                        .await;
                    if let Err(e) = self.stages.fail_job(&plan.identifier).await {
                        error!(job = %plan.identifier, error = %e, "Failed to fail job");
                    }
                }
                Err(e) => {
                    warn!(
                        agent_id = %agent.id(),
                        job = %plan.identifier,
                        error = %e,
                        "Plugin could not decide on elastic assignment"
                    );
                }
            }
        }
        None
    }

    async fn build_assignment(
        &self,
        agent: &AgentInstance,
        plan: &JobPlan,
        config: &CruiseConfig,
    ) -> Result<BuildAssignment> {
        let job = &plan.identifier;
        let pipeline_config = config.pipeline_or_err(job.pipeline_name())?;
        let tasks = config.tasks_for_job(job.pipeline_name(), job.stage_name(), &job.job_name)?;
        let instance = self
            .ctx
            .pipelines
            .instance_by_id(plan.pipeline_id)
            .await?
            .ok_or_else(|| Error::PipelineNotFound(job.stage.pipeline().to_string()))?;
        let environment = config.environment_for_pipeline(job.pipeline_name());

        let mut variables: Vec<&EnvironmentVariable> = Vec::new();
        if let Some(environment) = environment {
            variables.extend(environment.variables.iter());
        }
        variables.extend(plan.variables.iter());

        let mut params: Vec<SecretParam> = collect_params(variables.iter().map(|v| &v.value));
        params.extend(tasks.iter().flat_map(Task::secret_params));
        let secrets = self
            .resolve(&SecretUsage::PipelineGroup(pipeline_config.group.clone()), &params)
            .await?;

        let mut context = EnvironmentContext::new();
        context.set("CADENCE_PIPELINE_NAME", job.pipeline_name());
        context.set("CADENCE_PIPELINE_COUNTER", job.stage.pipeline_counter.to_string());
        context.set("CADENCE_PIPELINE_GROUP_NAME", pipeline_config.group.as_str());
        context.set("CADENCE_STAGE_NAME", job.stage_name());
        context.set("CADENCE_STAGE_COUNTER", job.stage.stage_counter.to_string());
        context.set("CADENCE_JOB_NAME", job.job_name.as_str());
        context.set("CADENCE_TRIGGER_USER", instance.build_cause.approver.as_str());
        context.set("CADENCE_AGENT_RESOURCES", agent.agent().resources_display());
        if let Some(environment) = environment {
            context.set("CADENCE_ENVIRONMENT_NAME", environment.name.as_str());
        }
        for variable in variables {
            let value = substitute(&variable.value, &secrets)?;
            if variable.secure || variable.value.has_secret_params() {
                context.set_secure(variable.name.as_str(), value);
            } else {
                context.set(variable.name.as_str(), value);
            }
        }

        let builders = tasks
            .into_iter()
            .map(|task| resolve_task(task, &secrets).map(Builder::from))
            .collect::<Result<Vec<_>>>()?;

        let mut artifact_stores: Vec<ArtifactStore> = Vec::new();
        for store_id in plan.artifact_plans.iter().filter_map(|a| a.store_id()) {
            if artifact_stores.iter().any(|s| s.id == store_id) {
                continue;
            }
            let Some(store) = config.artifact_store(store_id) else {
                warn!(job = %job, store_id, "Artifact store not configured");
                continue;
            };
            artifact_stores.push(self.resolve_store(store).await?);
        }

        Ok(BuildAssignment {
            job: job.clone(),
            build_cause: instance.build_cause,
            builders,
            working_directory: format!(
                "{}/{}",
                self.ctx.config.working_directory_root,
                job.pipeline_name()
            ),
            environment: context,
            artifact_plans: plan.artifact_plans.clone(),
            artifact_stores,
        })
    }

    async fn resolve_store(&self, store: &ArtifactStore) -> Result<ArtifactStore> {
        let params = collect_params(store.properties.values());
        let secrets = self
            .resolve(&SecretUsage::ArtifactStore(store.id.clone()), &params)
            .await?;
        let properties = store
            .properties
            .iter()
            .map(|(key, value)| Ok((key.clone(), ConfigValue::new(substitute(value, &secrets)?))))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(ArtifactStore {
            properties,
            ..store.clone()
        })
    }

    async fn resolve(
        &self,
        usage: &SecretUsage,
        params: &[SecretParam],
    ) -> Result<BTreeMap<SecretParam, String>> {
        if params.is_empty() {
            return Ok(BTreeMap::new());
        }
        self.ctx.secrets.resolve(usage, params).await
    }

    /// The job's pipeline, stage or job disappeared from configuration.
    async fn job_removed(&self, job: &JobIdentifier) {
        self.ctx
            .console_note(job, "This job was cancelled because it was removed from the configuration.")
            .await;
        if let Err(e) = self.stages.cancel_job(job).await {
            error!(job = %job, error = %e, "Failed to cancel removed job");
        }
    }

    /// Drop pooled plans whose job no longer exists in `config`, cancelling
    /// those jobs.
    pub async fn remove_jobs_not_in(&self, config: &CruiseConfig) -> Vec<JobIdentifier> {
        let removed = self
            .pool
            .drain_where(|plan| !config.has_job(&plan.identifier))
            .await;
        let mut cancelled = Vec::with_capacity(removed.len());
        for plan in removed {
            info!(job = %plan.identifier, "Removing job no longer in configuration");
            self.job_removed(&plan.identifier).await;
            cancelled.push(plan.identifier);
        }
        cancelled
    }

    /// Reload the pool and let the orchestrator request elastic agents for
    /// what changed.
    pub async fn on_timer(&self) {
        match self.pool.reload().await {
            Ok(reload) => {
                self.elastic
                    .create_agents_for(&reload.previous, &reload.current)
                    .await;
            }
            Err(e) => error!(error = %e, "Failed to reload job plan pool"),
        }
    }
}

#[async_trait]
impl ConfigChangeListener for AssignmentDispatcher {
    async fn on_config_change(&self, config: Arc<CruiseConfig>) {
        let removed = self.remove_jobs_not_in(&config).await;
        if !removed.is_empty() {
            info!(removed = removed.len(), version = config.version, "Pruned job plan pool");
        }
    }
}

fn substitute(value: &ConfigValue, secrets: &BTreeMap<SecretParam, String>) -> Result<String> {
    value.resolve(secrets).map_err(|param| {
        Error::SecretResolution(format!(
            "Secret '{}' could not be resolved",
            param.placeholder()
        ))
    })
}

fn resolve_task(task: Task, secrets: &BTreeMap<SecretParam, String>) -> Result<Task> {
    match task {
        Task::Plugin {
            plugin_id,
            configuration,
        } => {
            let configuration = configuration
                .iter()
                .map(|(key, value)| Ok((key.clone(), ConfigValue::new(substitute(value, secrets)?))))
                .collect::<Result<BTreeMap<_, _>>>()?;
            Ok(Task::Plugin {
                plugin_id,
                configuration,
            })
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestPorts, approved_agent, resource_pipeline, simple_pipeline};
    use cadence_core::config::EnvironmentConfig;
    use cadence_core::material::BuildCause;
    use cadence_core::ports::ConfigRepository;
    use cadence_core::run::{JobResult, JobState};

    async fn schedule(scheduler: &crate::Scheduler, pipeline: &str) {
        scheduler
            .stages
            .schedule_pipeline(pipeline, BuildCause::forced_by("alice", vec![]))
            .await
            .unwrap();
        scheduler.pool.reload().await.unwrap();
    }

    #[tokio::test]
    async fn test_unregistered_agent_gets_no_work() {
        let ports = TestPorts::new();
        let scheduler = ports.scheduler();
        let agent = AgentId::new();
        let work = scheduler.dispatcher.assign_work_to_agent(agent).await.unwrap();
        assert_eq!(work, Work::UnregisteredAgentWork { agent_id: agent });
    }

    #[tokio::test]
    async fn test_disabled_agent_is_denied_and_pool_untouched() {
        let ports = TestPorts::new();
        ports.set_pipelines(vec![simple_pipeline("app")]).await;
        let scheduler = ports.scheduler();
        schedule(&scheduler, "app").await;
        let agent = approved_agent(&scheduler, &[]).await;
        scheduler.registry.disable(&[agent]).await.unwrap();

        let work = scheduler.dispatcher.assign_work_to_agent(agent).await.unwrap();

        assert_eq!(work, Work::DeniedAgentWork { agent_id: agent });
        assert_eq!(scheduler.pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_assignment_carries_context_and_marks_agent_building() {
        let ports = TestPorts::new();
        ports
            .set_pipelines(vec![
                simple_pipeline("app").with_variable("TARGET", "x86_64"),
            ])
            .await;
        let scheduler = ports.scheduler();
        schedule(&scheduler, "app").await;
        let agent = approved_agent(&scheduler, &["linux"]).await;

        let work = scheduler.dispatcher.assign_work_to_agent(agent).await.unwrap();
        let assignment = work.assignment().unwrap();

        assert_eq!(assignment.job.to_string(), "app/1/build/1/compile");
        assert_eq!(assignment.environment.get("CADENCE_PIPELINE_NAME"), Some("app"));
        assert_eq!(assignment.environment.get("CADENCE_PIPELINE_GROUP_NAME"), Some("default"));
        assert_eq!(assignment.environment.get("CADENCE_AGENT_RESOURCES"), Some("linux"));
        assert_eq!(assignment.environment.get("CADENCE_TRIGGER_USER"), Some("alice"));
        assert_eq!(assignment.environment.get("TARGET"), Some("x86_64"));
        assert_eq!(assignment.working_directory, "pipelines/app");
        assert!(scheduler.pool.is_empty().await);
        assert!(scheduler.registry.find(agent).await.unwrap().is_building());

        let job = ports
            .context()
            .jobs
            .job(assignment.job.build_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.state, JobState::Assigned);
        assert_eq!(job.agent_id, Some(agent));
    }

    #[tokio::test]
    async fn test_agent_without_resources_gets_no_work() {
        let ports = TestPorts::new();
        ports
            .set_pipelines(vec![resource_pipeline("app", &["gpu"])])
            .await;
        let scheduler = ports.scheduler();
        schedule(&scheduler, "app").await;
        let agent = approved_agent(&scheduler, &["linux"]).await;

        let work = scheduler.dispatcher.assign_work_to_agent(agent).await.unwrap();
        assert!(work.is_no_work());
        assert_eq!(scheduler.pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_environment_isolation() {
        let ports = TestPorts::new();
        let mut config = ports.config.current().await.as_ref().clone();
        config.pipelines = vec![simple_pipeline("app")];
        config.environments = vec![EnvironmentConfig::new("prod").with_pipeline("app")];
        ports.set_config(config).await;
        let scheduler = ports.scheduler();
        schedule(&scheduler, "app").await;

        let outsider = approved_agent(&scheduler, &["linux"]).await;
        assert!(scheduler
            .dispatcher
            .assign_work_to_agent(outsider)
            .await
            .unwrap()
            .is_no_work());

        let insider = approved_agent(&scheduler, &["linux"]).await;
        scheduler
            .registry
            .update_environment_association("prod", &[insider])
            .await
            .unwrap();
        let work = scheduler.dispatcher.assign_work_to_agent(insider).await.unwrap();
        assert_eq!(
            work.assignment().unwrap().environment.get("CADENCE_ENVIRONMENT_NAME"),
            Some("prod")
        );
    }

    #[tokio::test]
    async fn test_unresolvable_secret_fails_job() {
        let ports = TestPorts::new();
        ports
            .set_pipelines(vec![
                simple_pipeline("app").with_variable("TOKEN", "{{SECRET:[vault][token]}}"),
            ])
            .await;
        let scheduler = ports.scheduler();
        schedule(&scheduler, "app").await;
        let job = scheduler.pool.job_plans().await[0].identifier.clone();
        let agent = approved_agent(&scheduler, &[]).await;

        let work = scheduler.dispatcher.assign_work_to_agent(agent).await.unwrap();

        assert!(work.is_no_work());
        let instance = ports.context().jobs.job(job.build_id).await.unwrap().unwrap();
        assert_eq!(instance.result, JobResult::Failed);
        assert!(ports.console.contains(&job, "Job failed before it could start").await);
        assert!(scheduler.pool.is_empty().await);
    }

    #[tokio::test]
    async fn test_resolved_secret_is_masked() {
        let ports = TestPorts::new();
        ports.secrets.insert("vault", "token", "s3cr3t");
        ports
            .set_pipelines(vec![
                simple_pipeline("app").with_variable("TOKEN", "{{SECRET:[vault][token]}}"),
            ])
            .await;
        let scheduler = ports.scheduler();
        schedule(&scheduler, "app").await;
        let agent = approved_agent(&scheduler, &[]).await;

        let work = scheduler.dispatcher.assign_work_to_agent(agent).await.unwrap();
        let environment = &work.assignment().unwrap().environment;
        assert_eq!(environment.get("TOKEN"), Some("s3cr3t"));
        assert!(environment.is_secure("TOKEN"));
    }

    #[tokio::test]
    async fn test_removed_pipeline_cancels_job_and_reraises() {
        let ports = TestPorts::new();
        ports.set_pipelines(vec![simple_pipeline("app")]).await;
        let scheduler = ports.scheduler();
        schedule(&scheduler, "app").await;
        let job = scheduler.pool.job_plans().await[0].identifier.clone();
        let agent = approved_agent(&scheduler, &[]).await;

        // Swap the config without notifying listeners.
        ports.config.replace_silently(Default::default());
        let err = scheduler.dispatcher.assign_work_to_agent(agent).await.unwrap_err();

        assert!(matches!(err, Error::PipelineNotFound(_)));
        let instance = ports.context().jobs.job(job.build_id).await.unwrap().unwrap();
        assert_eq!(instance.result, JobResult::Cancelled);
    }

    #[tokio::test]
    async fn test_config_change_prunes_pool() {
        let ports = TestPorts::new();
        ports
            .set_pipelines(vec![simple_pipeline("app"), simple_pipeline("lib")])
            .await;
        let scheduler = ports.scheduler();
        scheduler.start().await.unwrap();
        schedule(&scheduler, "app").await;
        schedule(&scheduler, "lib").await;
        assert_eq!(scheduler.pool.len().await, 2);

        ports.set_pipelines(vec![simple_pipeline("lib")]).await;

        let remaining = scheduler.pool.job_plans().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].pipeline_name(), "lib");
    }

    #[tokio::test]
    async fn test_concurrent_requests_assign_job_once() {
        let ports = TestPorts::new();
        ports.set_pipelines(vec![simple_pipeline("app")]).await;
        let scheduler = Arc::new(ports.scheduler());
        schedule(&scheduler, "app").await;

        let mut agents = Vec::new();
        for _ in 0..8 {
            agents.push(approved_agent(&scheduler, &[]).await);
        }
        let mut handles = Vec::new();
        for agent in agents {
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move {
                scheduler.dispatcher.assign_work_to_agent(agent).await.unwrap()
            }));
        }
        let mut builds = 0;
        for handle in handles {
            if handle.await.unwrap().assignment().is_some() {
                builds += 1;
            }
        }
        assert_eq!(builds, 1);
    }
}
