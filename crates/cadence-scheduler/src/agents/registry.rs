//! Authoritative in-memory registry of agents.

use super::instance::AgentInstance;
use crate::context::SchedulerContext;
use cadence_core::agent::{
    Agent, AgentAttributesUpdate, AgentBulkUpdate, AgentRuntimeInfo, TriState,
};
use cadence_core::events::{AgentChangedPayload, AgentDeletedPayload, Event};
use cadence_core::health::{HealthScope, HealthState};
use cadence_core::ids::{AgentId, JobIdentifier};
use cadence_core::{Error, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Holds every known agent and its live status.
///
/// Mutations that change whether an agent may receive work run under the
/// assignment lock shared with the dispatcher.
pub struct AgentRegistry {
    ctx: Arc<SchedulerContext>,
    agents: RwLock<HashMap<AgentId, AgentInstance>>,
    assignment: Arc<Mutex<()>>,
}

impl AgentRegistry {
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        Self {
            ctx,
            agents: RwLock::new(HashMap::new()),
            assignment: Arc::new(Mutex::new(())),
        }
    }

    /// The lock serializing assignment against eligibility changes.
    pub fn assignment_lock(&self) -> Arc<Mutex<()>> {
        self.assignment.clone()
    }

    /// Load persisted agents.
    pub async fn initialize(&self) -> Result<()> {
        let records = self.ctx.agents.list().await?;
        let mut agents = self.agents.write().await;
        for agent in records {
            agents
                .entry(agent.id)
                .or_insert_with(|| AgentInstance::from_record(agent));
        }
        info!(agents = agents.len(), "Agent registry initialized");
        Ok(())
    }

    /// Handle a registration request from an agent.
    pub async fn register(&self, info: &AgentRuntimeInfo) -> Result<AgentInstance> {
        if let Some(existing) = self.find(info.id).await {
            return Ok(existing);
        }

        let auto_approve = info.elastic.is_some() || self.ctx.config.auto_register_agents;
        let instance = {
            let _assignment = self.assignment.lock().await;
            let mut agents = self.agents.write().await;
            let instance = agents
                .entry(info.id)
                .or_insert_with(|| {
                    AgentInstance::pending(Agent::from_runtime_info(info), self.ctx.now())
                });
            if auto_approve && instance.is_pending() {
                instance.approve(new_cookie());
                self.ctx.agents.save(instance.agent()).await?;
            }
            instance.clone()
        };

        info!(
            agent_id = %info.id,
            hostname = %info.hostname,
            status = ?instance.status(),
            elastic = info.elastic.is_some(),
            "Agent registration requested"
        );
        self.publish_changed(&instance).await;
        Ok(instance)
    }

    /// Approve a pending agent, issuing its cookie. Returns the cookie.
    pub async fn approve(&self, id: AgentId) -> Result<String> {
        let instance = {
            let _assignment = self.assignment.lock().await;
            let mut agents = self.agents.write().await;
            let instance = agents
                .get_mut(&id)
                .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;
            instance.approve(new_cookie());
            self.ctx.agents.save(instance.agent()).await?;
            instance.clone()
        };

        info!(agent_id = %id, "Agent approved");
        self.publish_changed(&instance).await;
        instance
            .agent()
            .cookie
            .clone()
            .ok_or_else(|| Error::Internal(format!("agent {id} has no cookie after approval")))
    }

    /// Apply a heartbeat from an agent.
    pub async fn update_runtime_info(&self, info: &AgentRuntimeInfo) -> Result<()> {
        let Some(cookie) = info.cookie.as_deref() else {
            warn!(agent_id = %info.id, "Agent heartbeat without cookie");
            return Err(Error::MissingCookie(info.id.to_string()));
        };

        let now = self.ctx.now();
        let (instance, previous_status, previous_ip) = {
            let mut agents = self.agents.write().await;
            let instance = agents
                .get_mut(&info.id)
                .ok_or_else(|| Error::AgentNotFound(info.id.to_string()))?;

            if instance.agent().cookie.as_deref() != Some(cookie) {
                drop(agents);
                let message = format!(
                    "Found agent [{}] with duplicate uuid. Please check the agent installation.",
                    info.hostname
                );
                warn!(agent_id = %info.id, hostname = %info.hostname, "{message}");
                self.ctx
                    .health
                    .update(HealthState::warning(
                        HealthScope::Agent(info.id.to_string()),
                        message,
                        format!("Agent {} presented a cookie that does not match", info.id),
                    ))
                    .await;
                return Err(Error::DuplicateCookie(info.id.to_string()));
            }

            let previous_status = instance.status();
            let previous_ip = instance.update_runtime_info(info, now);
            if previous_ip.is_some() {
                self.ctx.agents.save(instance.agent()).await?;
            }
            (instance.clone(), previous_status, previous_ip)
        };

        if let Some(old_ip) = previous_ip {
            warn!(
                agent_id = %info.id,
                hostname = %info.hostname,
                old_ip = %old_ip,
                new_ip = %info.ip_address,
                "Agent IP address changed"
            );
        }

        let scope = HealthScope::StuckInCancel(info.id.to_string());
        if instance.is_stuck_in_cancel(now, self.ctx.config.stuck_in_cancel_timeout()) {
            let since = instance
                .cancelled_at()
                .map(|at| at.to_rfc3339())
                .unwrap_or_default();
            warn!(agent_id = %info.id, since = %since, "Agent is stuck in cancel");
            self.ctx
                .health
                .update(HealthState::warning(
                    scope,
                    format!("Agent {} is stuck in cancel", info.hostname),
                    format!("Agent has been cancelling its job since {since}. Restart the agent."),
                ))
                .await;
        } else {
            self.ctx.health.remove_by_scope(&scope).await;
        }

        if previous_status != instance.status() {
            debug!(
                agent_id = %info.id,
                from = ?previous_status,
                to = ?instance.status(),
                "Agent status changed"
            );
            self.publish_changed(&instance).await;
        }
        Ok(())
    }

    pub async fn enable(&self, ids: &[AgentId]) -> Result<()> {
        self.change_state(ids, TriState::Enable).await
    }

    pub async fn disable(&self, ids: &[AgentId]) -> Result<()> {
        self.change_state(ids, TriState::Disable).await
    }

    async fn change_state(&self, ids: &[AgentId], state: TriState) -> Result<()> {
        let changed = {
            let _assignment = self.assignment.lock().await;
            let mut agents = self.agents.write().await;
            ensure_known(&agents, ids)?;
            let mut changed = Vec::new();
            for id in ids {
                if let Some(instance) = agents.get_mut(id) {
                    apply_state(instance, state);
                    self.ctx.agents.save(instance.agent()).await?;
                    changed.push(instance.clone());
                }
            }
            changed
        };

        info!(agents = changed.len(), state = ?state, "Agent state updated");
        for instance in &changed {
            self.publish_changed(instance).await;
        }
        Ok(())
    }

    /// Update hostname, resources, environments and state of one agent.
    pub async fn update_agent_attributes(
        &self,
        id: AgentId,
        update: &AgentAttributesUpdate,
    ) -> Result<AgentInstance> {
        if update.is_noop() {
            return Err(Error::Validation(
                "Bad Request. No operation is specified in the request to be performed."
                    .to_string(),
            ));
        }
        if let Some(resources) = &update.resources {
            validate_resources(resources)?;
        }

        let instance = {
            let _assignment = self.assignment.lock().await;
            let mut agents = self.agents.write().await;
            let instance = agents
                .get_mut(&id)
                .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;
            if update.resources.is_some() && instance.is_elastic() {
                return Err(Error::Validation(
                    "Resources on elastic agents cannot be updated.".to_string(),
                ));
            }

            let agent = instance.agent_mut();
            if let Some(hostname) = &update.hostname {
                agent.hostname = hostname.clone();
            }
            if let Some(resources) = &update.resources {
                agent.resources = resources.clone();
            }
            if let Some(environments) = &update.environments {
                agent.environments = environments.clone();
            }
            apply_state(instance, update.state);
            self.ctx.agents.save(instance.agent()).await?;
            instance.clone()
        };

        info!(agent_id = %id, "Agent attributes updated");
        self.publish_changed(&instance).await;
        Ok(instance)
    }

    /// Apply one admin change to a set of agents, all or nothing.
    pub async fn bulk_update_attributes(&self, update: &AgentBulkUpdate) -> Result<()> {
        if update.agents.is_empty() {
            return Err(Error::Validation("No agents were specified.".to_string()));
        }
        if update.is_noop() {
            return Err(Error::Validation(
                "Bad Request. No operation is specified in the request to be performed."
                    .to_string(),
            ));
        }
        validate_resources(&update.resources_to_add)?;
        let changes_resources =
            !update.resources_to_add.is_empty() || !update.resources_to_remove.is_empty();

        let changed = {
            let _assignment = self.assignment.lock().await;
            let mut agents = self.agents.write().await;
            ensure_known(&agents, &update.agents)?;

            if changes_resources {
                if let Some(elastic) = update
                    .agents
                    .iter()
                    .filter_map(|id| agents.get(id))
                    .find(|a| a.is_elastic())
                {
                    return Err(Error::Validation(format!(
                        "Resources on elastic agent [{}] cannot be updated.",
                        elastic.id()
                    )));
                }
            }
            if update.state == TriState::Unset
                && let Some(pending) = update
                    .agents
                    .iter()
                    .filter_map(|id| agents.get(id))
                    .find(|a| a.is_pending())
            {
                return Err(Error::Validation(format!(
                    "Pending agent [{}] must be explicitly enabled or disabled when performing any operation on it.",
                    pending.id()
                )));
            }

            let mut staged = Vec::new();
            for id in &update.agents {
                let Some(instance) = agents.get(id) else {
                    continue;
                };
                let mut instance = instance.clone();
                let agent = instance.agent_mut();
                agent.resources.extend(update.resources_to_add.iter().cloned());
                agent
                    .resources
                    .retain(|r| !update.resources_to_remove.contains(r));
                agent
                    .environments
                    .extend(update.environments_to_add.iter().cloned());
                agent
                    .environments
                    .retain(|e| !update.environments_to_remove.contains(e));
                apply_state(&mut instance, update.state);
                staged.push(instance);
            }

            let mut saved: Vec<AgentId> = Vec::new();
            for instance in &staged {
                if let Err(e) = self.ctx.agents.save(instance.agent()).await {
                    warn!(agent_id = %instance.id(), error = %e, "Bulk agent update failed; reverting");
                    for original in saved.iter().filter_map(|id| agents.get(id)) {
                        if let Err(revert) = self.ctx.agents.save(original.agent()).await {
                            error!(agent_id = %original.id(), error = %revert, "Failed to revert agent");
                        }
                    }
                    return Err(e);
                }
                saved.push(instance.id());
            }
            for instance in &staged {
                agents.insert(instance.id(), instance.clone());
            }
            staged
        };

        info!(agents = changed.len(), "Bulk agent update applied");
        for instance in &changed {
            self.publish_changed(instance).await;
        }
        Ok(())
    }

    /// Make `ids` exactly the agents associated with `environment`.
    pub async fn update_environment_association(
        &self,
        environment: &str,
        ids: &[AgentId],
    ) -> Result<()> {
        let wanted: BTreeSet<AgentId> = ids.iter().copied().collect();
        let changed = {
            let _assignment = self.assignment.lock().await;
            let mut agents = self.agents.write().await;
            ensure_known(&agents, ids)?;

            let mut changed = Vec::new();
            for instance in agents.values_mut() {
                let has = instance.agent().environments.contains(environment);
                let should = wanted.contains(&instance.id());
                if has == should {
                    continue;
                }
                let environments = &mut instance.agent_mut().environments;
                if should {
                    environments.insert(environment.to_string());
                } else {
                    environments.remove(environment);
                }
                self.ctx.agents.save(instance.agent()).await?;
                changed.push(instance.clone());
            }
            changed
        };

        info!(
            environment,
            agents = ids.len(),
            changed = changed.len(),
            "Environment association updated"
        );
        for instance in &changed {
            self.publish_changed(instance).await;
        }
        Ok(())
    }

    /// Soft-delete disabled, idle agents.
    pub async fn delete_agents(&self, ids: &[AgentId]) -> Result<()> {
        {
            let _assignment = self.assignment.lock().await;
            let mut agents = self.agents.write().await;
            ensure_known(&agents, ids)?;
            if ids
                .iter()
                .filter_map(|id| agents.get(id))
                .any(|a| !a.can_be_deleted())
            {
                return Err(Error::Validation(
                    "Failed to delete an agent, as it is not in a disabled state or is still building."
                        .to_string(),
                ));
            }
            self.ctx.agents.soft_delete(ids).await?;
            for id in ids {
                agents.remove(id);
            }
        }

        let now = self.ctx.now();
        for id in ids {
            info!(agent_id = %id, "Agent deleted");
            self.ctx
                .publish(Event::AgentDeleted(AgentDeletedPayload {
                    agent_id: *id,
                    timestamp: now,
                }))
                .await;
        }
        Ok(())
    }

    /// Record that an agent took a job.
    pub async fn building(&self, id: AgentId, job: &JobIdentifier) {
        let instance = {
            let mut agents = self.agents.write().await;
            let Some(instance) = agents.get_mut(&id) else {
                return;
            };
            instance.start_building(job.clone());
            instance.clone()
        };
        self.publish_changed(&instance).await;
    }

    /// Record that the job on an agent was cancelled.
    pub async fn job_cancelled(&self, id: AgentId) {
        let now = self.ctx.now();
        let instance = {
            let mut agents = self.agents.write().await;
            let Some(instance) = agents.get_mut(&id) else {
                return;
            };
            instance.cancel(now);
            instance.clone()
        };
        debug!(agent_id = %id, "Agent told to cancel its job");
        self.publish_changed(&instance).await;
    }

    /// Mark silent agents as lost. Returns the agents that changed.
    pub async fn refresh(&self) -> Vec<AgentId> {
        let now = self.ctx.now();
        let timeout = self.ctx.config.lost_contact_timeout();
        let lost: Vec<AgentInstance> = {
            let mut agents = self.agents.write().await;
            agents
                .values_mut()
                .filter_map(|a| a.refresh(now, timeout).then(|| a.clone()))
                .collect()
        };
        for instance in &lost {
            warn!(
                agent_id = %instance.id(),
                hostname = %instance.agent().hostname,
                "Lost contact with agent"
            );
            self.publish_changed(instance).await;
        }
        lost.iter().map(AgentInstance::id).collect()
    }

    pub async fn find(&self, id: AgentId) -> Option<AgentInstance> {
        self.agents.read().await.get(&id).cloned()
    }

    pub async fn all(&self) -> Vec<AgentInstance> {
        let mut all: Vec<_> = self.agents.read().await.values().cloned().collect();
        all.sort_by_key(|a| a.id());
        all
    }

    pub async fn registered_agents(&self) -> Vec<AgentInstance> {
        let mut registered: Vec<_> = self
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.is_registered())
            .cloned()
            .collect();
        registered.sort_by_key(|a| a.id());
        registered
    }

    pub async fn elastic_agents(&self) -> Vec<AgentInstance> {
        self.registered_agents()
            .await
            .into_iter()
            .filter(AgentInstance::is_elastic)
            .collect()
    }

    async fn publish_changed(&self, instance: &AgentInstance) {
        self.ctx
            .publish(Event::AgentChanged(AgentChangedPayload {
                agent_id: instance.id(),
                status: instance.status(),
                timestamp: self.ctx.now(),
            }))
            .await;
    }
}

fn new_cookie() -> String {
    Uuid::new_v4().to_string()
}

fn ensure_known(agents: &HashMap<AgentId, AgentInstance>, ids: &[AgentId]) -> Result<()> {
    let unknown: Vec<String> = ids
        .iter()
        .filter(|id| !agents.contains_key(id))
        .map(ToString::to_string)
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(Error::AgentNotFound(unknown.join(", ")))
    }
}

fn apply_state(instance: &mut AgentInstance, state: TriState) {
    match state {
        TriState::Enable => {
            if instance.is_pending() {
                instance.approve(new_cookie());
            }
            instance.enable();
        }
        TriState::Disable => {
            if instance.is_pending() {
                instance.approve(new_cookie());
            }
            instance.disable();
        }
        TriState::Unset => {}
    }
}

fn validate_resources(resources: &BTreeSet<String>) -> Result<()> {
    for resource in resources {
        let valid = !resource.trim().is_empty()
            && resource
                .chars()
                .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '|' | ' '));
        if !valid {
            return Err(Error::Validation(format!(
                "Resource name '{resource}' is not valid. Valid names may contain letters, numbers, hyphens, underscores, periods, pipes and spaces."
            )));
        }
    }
    Ok(())
}
