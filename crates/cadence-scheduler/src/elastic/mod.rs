//! Elastic agent orchestration.
//!
//! Jobs that need an on-demand agent get a create request posted to the
//! owning plugin when they first show up in the pool, and again each time
//! they have waited a full starvation threshold without being picked up.

mod queue;

pub use queue::{ElasticAgentQueue, ElasticMessage};

use crate::agents::{AgentInstance, AgentRegistry};
use crate::context::SchedulerContext;
use crate::pool::JobPlanPool;
use crate::stages::StageScheduler;
use cadence_core::config::CruiseConfig;
use cadence_core::elastic::{ClusterProfile, ElasticProfile, ResolvedProperties};
use cadence_core::health::{HealthScope, HealthState};
use cadence_core::ids::JobId;
use cadence_core::job::JobPlan;
use cadence_core::ports::{CreateAgentRequest, ShouldAssignWorkRequest};
use cadence_core::secrets::{ConfigValue, SecretUsage};
use cadence_core::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub struct ElasticAgentOrchestrator {
    ctx: Arc<SchedulerContext>,
    registry: Arc<AgentRegistry>,
    stages: Arc<StageScheduler>,
    pool: Arc<JobPlanPool>,
    queue: Arc<ElasticAgentQueue>,
    /// When a create request was last posted, per pending elastic job.
    requested: Mutex<HashMap<JobId, DateTime<Utc>>>,
}

impl ElasticAgentOrchestrator {
    pub fn new(
        ctx: Arc<SchedulerContext>,
        registry: Arc<AgentRegistry>,
        stages: Arc<StageScheduler>,
        pool: Arc<JobPlanPool>,
        queue: Arc<ElasticAgentQueue>,
    ) -> Self {
        Self {
            ctx,
            registry,
            stages,
            pool,
            queue,
            requested: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue(&self) -> Arc<ElasticAgentQueue> {
        self.queue.clone()
    }

    /// Request agents for elastic jobs that are new in the pool or have been
    /// starving for a full threshold.
    pub async fn create_agents_for(&self, previous: &[JobPlan], current: &[JobPlan]) {
        let now = self.ctx.now();
        let threshold = self.ctx.config.starvation_threshold();
        let pending: HashSet<JobId> = current.iter().map(JobPlan::job_id).collect();
        let previously_pooled: HashSet<JobId> = previous.iter().map(JobPlan::job_id).collect();

        let due: Vec<(&JobPlan, bool)> = {
            let mut requested = self.requested.lock().await;
            requested.retain(|job_id, _| pending.contains(job_id));
            current
                .iter()
                .filter(|plan| plan.requires_elastic_agent())
                .filter_map(|plan| match requested.get(&plan.job_id()) {
                    None => Some((plan, false)),
                    Some(at) if now - *at >= threshold => Some((plan, true)),
                    Some(_) => None,
                })
                .collect()
        };
        if due.is_empty() {
            return;
        }

        let config = self.ctx.config_repo.current().await;
        for (plan, starving) in due {
            if starving && previously_pooled.contains(&plan.job_id()) {
                info!(job = %plan.identifier, "Elastic job starving; requesting another agent");
            }
            if let Some(at) = self.request_agent(&config, plan).await {
                self.requested.lock().await.insert(plan.job_id(), at);
            }
        }
    }

    /// Post one create request. Returns the request time when posted.
    async fn request_agent(&self, config: &CruiseConfig, plan: &JobPlan) -> Option<DateTime<Utc>> {
        let Some(elastic_profile) = &plan.elastic_profile else {
            return None;
        };

        let cluster = match config.cluster_profile(&elastic_profile.cluster_profile_id) {
            Some(cluster) if cluster.plugin_id == elastic_profile.plugin_id => cluster,
            found => {
                let reason = match found {
                    Some(cluster) => format!(
                        "Cluster profile '{}' belongs to plugin '{}' but elastic profile '{}' uses plugin '{}'.",
                        cluster.id, cluster.plugin_id, elastic_profile.id, elastic_profile.plugin_id
                    ),
                    None => format!(
                        "Cluster profile '{}' referenced by elastic profile '{}' does not exist.",
                        elastic_profile.cluster_profile_id, elastic_profile.id
                    ),
                };
                self.cancel_unservable(plan, &reason).await;
                return None;
            }
        };

        if !self.ctx.plugins.is_loaded(&elastic_profile.plugin_id) {
            warn!(
                plugin_id = %elastic_profile.plugin_id,
                job = %plan.identifier,
                "Elastic agent plugin not loaded; job left pending"
            );
            self.ctx
                .health
                .update(HealthState::warning(
                    HealthScope::ElasticAgentCreation(elastic_profile.plugin_id.clone()),
                    format!(
                        "Unable to find plugin '{}' to create an elastic agent",
                        elastic_profile.plugin_id
                    ),
                    format!(
                        "Job {} is waiting for an elastic agent. Make sure the plugin is installed.",
                        plan.identifier
                    ),
                ))
                .await;
            return None;
        }

        let request = match self.create_request(config, plan, elastic_profile, cluster).await {
            Ok(request) => request,
            Err(e) if e.is_job_failure() => {
                warn!(job = %plan.identifier, error = %e, "Failing elastic job");
                self.ctx
                    .console_note(&plan.identifier, &format!("Failed to create an elastic agent: {e}"))
                    .await;
                if let Err(e) = self.stages.fail_job(&plan.identifier).await {
                    error!(job = %plan.identifier, error = %e, "Failed to fail job");
                }
                return None;
            }
            Err(e) => {
                error!(job = %plan.identifier, error = %e, "Failed to build elastic agent request");
                return None;
            }
        };

        debug!(
            plugin_id = %elastic_profile.plugin_id,
            job = %plan.identifier,
            "Posting create agent request"
        );
        self.queue.post(
            ElasticMessage::CreateAgent {
                plugin_id: elastic_profile.plugin_id.clone(),
                request,
            },
            self.ctx.config.create_agent_message_ttl(),
        );
        Some(self.ctx.now())
    }

    async fn cancel_unservable(&self, plan: &JobPlan, reason: &str) {
        warn!(job = %plan.identifier, reason, "Cancelling elastic job");
        self.ctx
            .console_note(
                &plan.identifier,
                &format!("This job was cancelled because no elastic agent can be created for it. {reason}"),
            )
            .await;
        if let Err(e) = self.stages.cancel_job(&plan.identifier).await {
            error!(job = %plan.identifier, error = %e, "Failed to cancel job");
        }
        self.pool.remove(plan.job_id()).await;
        self.requested.lock().await.remove(&plan.job_id());
    }

    async fn create_request(
        &self,
        config: &CruiseConfig,
        plan: &JobPlan,
        elastic_profile: &ElasticProfile,
        cluster: &ClusterProfile,
    ) -> Result<CreateAgentRequest> {
        Ok(CreateAgentRequest {
            job: plan.identifier.clone(),
            environment: environment_name(config, plan),
            elastic_profile: self.resolve_elastic_profile(elastic_profile).await?,
            cluster_profile: self.resolve_cluster_profile(cluster).await?,
        })
    }

    /// Whether the elastic agent may run the plan, as decided by the plugin
    /// that owns both.
    pub async fn should_assign_work(&self, agent: &AgentInstance, plan: &JobPlan) -> Result<bool> {
        let (Some(metadata), Some(elastic_profile)) = (&agent.agent().elastic, &plan.elastic_profile)
        else {
            return Ok(false);
        };
        if metadata.plugin_id != elastic_profile.plugin_id {
            return Ok(false);
        }
        let Some(plugin) = self.ctx.plugins.elastic_plugin(&metadata.plugin_id) else {
            debug!(plugin_id = %metadata.plugin_id, "Plugin not loaded; no work for elastic agent");
            return Ok(false);
        };

        let config = self.ctx.config_repo.current().await;
        let cluster = match config.cluster_profile(&elastic_profile.cluster_profile_id) {
            Some(cluster) => self.resolve_cluster_profile(cluster).await?,
            None => ResolvedProperties::new(),
        };
        let request = ShouldAssignWorkRequest {
            agent: metadata.clone(),
            job: plan.identifier.clone(),
            environment: environment_name(&config, plan),
            elastic_profile: self.resolve_elastic_profile(elastic_profile).await?,
            cluster_profile: cluster,
        };
        plugin.should_assign_work(request).await
    }

    /// Ping every loaded plugin with its cluster profiles and flag elastic
    /// agents whose plugin is gone.
    pub async fn heartbeat(&self) {
        let config = self.ctx.config_repo.current().await;
        let by_plugin = config.cluster_profiles_by_plugin();

        for plugin_id in self.ctx.plugins.elastic_plugin_ids() {
            let mut cluster_profiles = Vec::new();
            for cluster in by_plugin.get(&plugin_id).into_iter().flatten() {
                match self.resolve_cluster_profile(cluster).await {
                    Ok(resolved) => cluster_profiles.push(resolved),
                    Err(e) => warn!(
                        plugin_id,
                        cluster_profile = %cluster.id,
                        error = %e,
                        "Skipping cluster profile in plugin ping"
                    ),
                }
            }
            self.queue.post(
                ElasticMessage::ServerPing {
                    plugin_id,
                    cluster_profiles,
                },
                self.ctx.config.server_ping_message_ttl(),
            );
        }

        for agent in self.registry.elastic_agents().await {
            let Some(metadata) = &agent.agent().elastic else {
                continue;
            };
            let scope = HealthScope::OrphanedElasticAgent(agent.id().to_string());
            if self.ctx.plugins.is_loaded(&metadata.plugin_id) {
                self.ctx.health.remove_by_scope(&scope).await;
            } else {
                warn!(
                    agent_id = %agent.id(),
                    plugin_id = %metadata.plugin_id,
                    "Elastic agent has no plugin"
                );
                self.ctx
                    .health
                    .update(HealthState::warning(
                        scope,
                        format!("Elastic agent '{}' is orphaned", agent.agent().hostname),
                        format!(
                            "Plugin '{}' that created elastic agent '{}' is not loaded.",
                            metadata.plugin_id, metadata.elastic_agent_id
                        ),
                    ))
                    .await;
            }
        }
    }

    /// Jobs with an outstanding create request.
    pub async fn requested_jobs(&self) -> Vec<JobId> {
        self.requested.lock().await.keys().copied().collect()
    }

    async fn resolve_elastic_profile(&self, profile: &ElasticProfile) -> Result<ResolvedProperties> {
        self.resolve(
            &profile.properties,
            &SecretUsage::ElasticProfile(profile.id.clone()),
        )
        .await
    }

    async fn resolve_cluster_profile(&self, profile: &ClusterProfile) -> Result<ResolvedProperties> {
        self.resolve(
            &profile.properties,
            &SecretUsage::ClusterProfile(profile.id.clone()),
        )
        .await
    }

    async fn resolve(
        &self,
        properties: &BTreeMap<String, ConfigValue>,
        usage: &SecretUsage,
    ) -> Result<ResolvedProperties> {
        let params = cadence_core::secrets::collect_params(properties.values());
        let secrets = if params.is_empty() {
            BTreeMap::new()
        } else {
            self.ctx.secrets.resolve(usage, &params).await?
        };
        properties
            .iter()
            .map(|(key, value)| {
                value
                    .resolve(&secrets)
                    .map(|resolved| (key.clone(), resolved))
                    .map_err(|param| {
                        Error::SecretResolution(format!(
                            "Secret '{}' used by {usage} could not be resolved",
                            param.placeholder()
                        ))
                    })
            })
            .collect()
    }
}

fn environment_name(config: &CruiseConfig, plan: &JobPlan) -> Option<String> {
    config
        .environment_for_pipeline(plan.pipeline_name())
        .map(|e| e.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingPlugin, TestPorts, elastic_pipeline};
    use cadence_core::agent::AgentRuntimeInfo;
    use cadence_core::ids::AgentId;
    use cadence_core::ports::ConfigRepository;

    async fn pending(scheduler: &crate::Scheduler, pipeline: &str) -> JobPlan {
        scheduler
            .stages
            .schedule_pipeline(pipeline, cadence_core::material::BuildCause::from_modifications(vec![]))
            .await
            .unwrap();
        let reload = scheduler.pool.reload().await.unwrap();
        reload.current.into_iter().next().unwrap()
    }

    #[tokio::test]
    async fn test_new_elastic_job_gets_one_request_per_threshold() {
        let ports = TestPorts::new();
        let plugin = RecordingPlugin::new("docker");
        ports.plugins.register(plugin.clone());
        ports.set_config(elastic_pipeline("app", "docker")).await;
        let scheduler = ports.scheduler();
        let plan = pending(&scheduler, "app").await;
        let current = vec![plan.clone()];

        scheduler.elastic.create_agents_for(&[], &current).await;
        scheduler.elastic.create_agents_for(&current, &current).await;
        scheduler.elastic.queue().drain().await;
        assert_eq!(plugin.created().await.len(), 1);

        ports.clock.advance(ports.context().config.starvation_threshold());
        scheduler.elastic.create_agents_for(&current, &current).await;
        scheduler.elastic.queue().drain().await;
        assert_eq!(plugin.created().await.len(), 2);
    }

    #[tokio::test]
    async fn test_tracking_pruned_when_job_leaves_pool() {
        let ports = TestPorts::new();
        ports.plugins.register(RecordingPlugin::new("docker"));
        ports.set_config(elastic_pipeline("app", "docker")).await;
        let scheduler = ports.scheduler();
        let plan = pending(&scheduler, "app").await;

        scheduler.elastic.create_agents_for(&[], &[plan.clone()]).await;
        assert_eq!(scheduler.elastic.requested_jobs().await, vec![plan.job_id()]);

        scheduler.elastic.create_agents_for(&[plan], &[]).await;
        assert!(scheduler.elastic.requested_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_cluster_profile_cancels_job() {
        let ports = TestPorts::new();
        ports.plugins.register(RecordingPlugin::new("docker"));
        ports.set_config(elastic_pipeline("app", "docker")).await;
        let scheduler = ports.scheduler();
        let plan = pending(&scheduler, "app").await;

        let mut config = (*ports.config.current().await).clone();
        config.cluster_profiles.clear();
        ports.set_config(config).await;

        scheduler.elastic.create_agents_for(&[], &[plan.clone()]).await;

        assert!(!scheduler.pool.contains(plan.job_id()).await);
        assert!(ports.console.contains(&plan.identifier, "does not exist").await);
        let job = ports.context().jobs.job(plan.job_id()).await.unwrap().unwrap();
        assert_eq!(job.result, cadence_core::run::JobResult::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_plugin_leaves_job_pending() {
        let ports = TestPorts::new();
        ports.set_config(elastic_pipeline("app", "docker")).await;
        let scheduler = ports.scheduler();
        let plan = pending(&scheduler, "app").await;

        scheduler.elastic.create_agents_for(&[], &[plan.clone()]).await;

        assert!(scheduler.pool.contains(plan.job_id()).await);
        assert!(ports
            .health
            .has_scope(&HealthScope::ElasticAgentCreation("docker".to_string()))
            .await);
        assert!(scheduler.elastic.requested_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_expired_request_is_not_delivered() {
        let ports = TestPorts::new();
        let plugin = RecordingPlugin::new("docker");
        ports.plugins.register(plugin.clone());
        ports.set_config(elastic_pipeline("app", "docker")).await;
        let scheduler = ports.scheduler();
        let plan = pending(&scheduler, "app").await;

        scheduler.elastic.create_agents_for(&[], &[plan]).await;
        ports.clock.advance(ports.context().config.create_agent_message_ttl());
        assert_eq!(scheduler.elastic.queue().drain().await, 1);
        assert!(plugin.created().await.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_flags_orphaned_agents() {
        let ports = TestPorts::new();
        let plugin = RecordingPlugin::new("docker");
        ports.plugins.register(plugin.clone());
        ports.set_config(elastic_pipeline("app", "docker")).await;
        let scheduler = ports.scheduler();

        let agent = AgentId::new();
        scheduler
            .registry
            .register(&AgentRuntimeInfo::new(agent, "k8s-1", "10.0.0.9").with_elastic("kubernetes", "pod-1"))
            .await
            .unwrap();

        scheduler.elastic.heartbeat().await;
        scheduler.elastic.queue().drain().await;

        assert_eq!(plugin.pings().await, 1);
        assert!(ports
            .health
            .has_scope(&HealthScope::OrphanedElasticAgent(agent.to_string()))
            .await);
    }
}
