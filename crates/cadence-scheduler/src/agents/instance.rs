//! Runtime state of one agent.

use cadence_core::agent::{Agent, AgentRuntimeInfo, AgentRuntimeStatus, AgentStatus};
use cadence_core::ids::{AgentId, JobIdentifier};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// An agent record plus what the server knows about it right now.
///
/// Status moves through `Idle -> Building -> (Cancelled) -> Idle` for
/// every build. Agents that stop sending heartbeats become `LostContact`.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInstance {
    agent: Agent,
    status: AgentStatus,
    building: Option<JobIdentifier>,
    cancelled_at: Option<DateTime<Utc>>,
    last_heard_at: Option<DateTime<Utc>>,
    location: Option<String>,
    usable_space_bytes: Option<u64>,
}

impl AgentInstance {
    /// A newly seen agent waiting for approval.
    pub fn pending(agent: Agent, now: DateTime<Utc>) -> Self {
        Self {
            agent,
            status: AgentStatus::Pending,
            building: None,
            cancelled_at: None,
            last_heard_at: Some(now),
            location: None,
            usable_space_bytes: None,
        }
    }

    /// An agent loaded from persistence, not yet heard from.
    pub fn from_record(agent: Agent) -> Self {
        let status = if agent.has_cookie() {
            AgentStatus::Unknown
        } else {
            AgentStatus::Pending
        };
        Self {
            agent,
            status,
            building: None,
            cancelled_at: None,
            last_heard_at: None,
            location: None,
            usable_space_bytes: None,
        }
    }

    pub fn id(&self) -> AgentId {
        self.agent.id
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn agent_mut(&mut self) -> &mut Agent {
        &mut self.agent
    }

    /// Effective status: a disabled agent shows as disabled once it is no
    /// longer busy.
    pub fn status(&self) -> AgentStatus {
        if self.agent.disabled && !self.status.is_busy() && self.status != AgentStatus::Pending {
            AgentStatus::Disabled
        } else {
            self.status
        }
    }

    pub fn building(&self) -> Option<&JobIdentifier> {
        self.building.as_ref()
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    pub fn last_heard_at(&self) -> Option<DateTime<Utc>> {
        self.last_heard_at
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn usable_space_bytes(&self) -> Option<u64> {
        self.usable_space_bytes
    }

    /// Approved and not removed.
    pub fn is_registered(&self) -> bool {
        self.agent.has_cookie() && !self.agent.deleted && self.status != AgentStatus::Pending
    }

    pub fn is_pending(&self) -> bool {
        self.status == AgentStatus::Pending
    }

    pub fn is_disabled(&self) -> bool {
        self.agent.disabled
    }

    pub fn is_elastic(&self) -> bool {
        self.agent.is_elastic()
    }

    pub fn is_building(&self) -> bool {
        self.status.is_busy()
    }

    pub fn is_lost_contact(&self) -> bool {
        self.status == AgentStatus::LostContact
    }

    /// Only disabled agents with no job may be removed.
    pub fn can_be_deleted(&self) -> bool {
        self.agent.disabled && !self.status.is_busy()
    }

    pub fn approve(&mut self, cookie: String) {
        if self.agent.cookie.is_none() {
            self.agent.cookie = Some(cookie);
        }
        if self.status == AgentStatus::Pending {
            self.status = AgentStatus::Idle;
        }
    }

    pub fn enable(&mut self) {
        self.agent.disabled = false;
    }

    pub fn disable(&mut self) {
        self.agent.disabled = true;
    }

    /// Apply a heartbeat. Returns the previous IP when it changed.
    pub fn update_runtime_info(
        &mut self,
        info: &AgentRuntimeInfo,
        now: DateTime<Utc>,
    ) -> Option<String> {
        self.last_heard_at = Some(now);
        self.location = info.location.clone();
        self.usable_space_bytes = info.usable_space_bytes;

        let previous_ip = if self.agent.ip_address != info.ip_address {
            Some(std::mem::replace(
                &mut self.agent.ip_address,
                info.ip_address.clone(),
            ))
        } else {
            None
        };
        self.agent.hostname = info.hostname.clone();

        if self.status == AgentStatus::Pending {
            return previous_ip;
        }

        match info.status {
            AgentRuntimeStatus::Idle => {
                self.status = AgentStatus::Idle;
                self.building = None;
                self.cancelled_at = None;
            }
            // Still building after a cancel: stay cancelled until the agent
            // reports idle.
            AgentRuntimeStatus::Building if self.status == AgentStatus::Cancelled => {}
            AgentRuntimeStatus::Building => {
                self.status = AgentStatus::Building;
                if info.building.is_some() {
                    self.building = info.building.clone();
                }
                self.cancelled_at = None;
            }
            AgentRuntimeStatus::Cancelled => self.cancel(now),
            AgentRuntimeStatus::Unknown => self.status = AgentStatus::Unknown,
        }
        previous_ip
    }

    /// The agent took a job.
    pub fn start_building(&mut self, job: JobIdentifier) {
        self.status = AgentStatus::Building;
        self.building = Some(job);
        self.cancelled_at = None;
    }

    /// The agent was told to cancel its job.
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        if self.status != AgentStatus::Cancelled {
            self.cancelled_at = Some(now);
        }
        self.status = AgentStatus::Cancelled;
    }

    /// Mark registered agents that stopped reporting as lost.
    /// Returns true when the status changed.
    pub fn refresh(&mut self, now: DateTime<Utc>, lost_contact_timeout: Duration) -> bool {
        if !self.is_registered() || self.status == AgentStatus::LostContact {
            return false;
        }
        let silent = match self.last_heard_at {
            Some(at) => now - at > lost_contact_timeout,
            None => false,
        };
        if silent {
            self.status = AgentStatus::LostContact;
        }
        silent
    }

    pub fn is_stuck_in_cancel(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.status == AgentStatus::Cancelled
            && self.cancelled_at.is_some_and(|at| now - at > timeout)
    }
}
