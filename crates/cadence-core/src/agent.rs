//! Agent types.

use crate::ids::{AgentId, JobIdentifier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The persisted agent record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub hostname: String,
    pub ip_address: String,
    pub resources: BTreeSet<String>,
    pub environments: BTreeSet<String>,
    pub disabled: bool,
    pub elastic: Option<ElasticAgentMetadata>,
    pub cookie: Option<String>,
    pub deleted: bool,
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    /// Build a fresh, not yet approved record from a registration request.
    pub fn from_runtime_info(info: &AgentRuntimeInfo) -> Self {
        Self {
            id: info.id,
            hostname: info.hostname.clone(),
            ip_address: info.ip_address.clone(),
            resources: info.resources.clone(),
            environments: info.environments.clone(),
            disabled: false,
            elastic: info.elastic.clone(),
            cookie: None,
            deleted: false,
            registered_at: Utc::now(),
        }
    }

    pub fn is_elastic(&self) -> bool {
        self.elastic.is_some()
    }

    pub fn has_cookie(&self) -> bool {
        self.cookie.is_some()
    }

    pub fn resources_display(&self) -> String {
        self.resources.iter().cloned().collect::<Vec<_>>().join(",")
    }
}

/// Identity of an agent provisioned by an elastic agent plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElasticAgentMetadata {
    pub plugin_id: String,
    pub elastic_agent_id: String,
}

/// Status as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Idle,
    Building,
    Cancelled,
    LostContact,
    Disabled,
    Unknown,
}

impl AgentStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, AgentStatus::Idle)
    }

    /// Statuses that may carry a job.
    pub fn is_busy(&self) -> bool {
        matches!(self, AgentStatus::Building | AgentStatus::Cancelled)
    }
}

/// Status an agent reports about itself in a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRuntimeStatus {
    Idle,
    Building,
    Cancelled,
    Unknown,
}

/// Payload of a registration request or a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRuntimeInfo {
    pub id: AgentId,
    pub hostname: String,
    pub ip_address: String,
    pub cookie: Option<String>,
    pub status: AgentRuntimeStatus,
    pub building: Option<JobIdentifier>,
    pub location: Option<String>,
    pub usable_space_bytes: Option<u64>,
    /// Resources and environments requested at auto-registration.
    #[serde(default)]
    pub resources: BTreeSet<String>,
    #[serde(default)]
    pub environments: BTreeSet<String>,
    pub elastic: Option<ElasticAgentMetadata>,
}

impl AgentRuntimeInfo {
    pub fn new(id: AgentId, hostname: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            id,
            hostname: hostname.into(),
            ip_address: ip_address.into(),
            cookie: None,
            status: AgentRuntimeStatus::Idle,
            building: None,
            location: None,
            usable_space_bytes: None,
            resources: BTreeSet::new(),
            environments: BTreeSet::new(),
            elastic: None,
        }
    }

    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = Some(cookie.into());
        self
    }

    pub fn with_status(mut self, status: AgentRuntimeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_environments<I, S>(mut self, environments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.environments = environments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_elastic(mut self, plugin_id: impl Into<String>, elastic_agent_id: impl Into<String>) -> Self {
        self.elastic = Some(ElasticAgentMetadata {
            plugin_id: plugin_id.into(),
            elastic_agent_id: elastic_agent_id.into(),
        });
        self
    }
}

/// Requested enable/disable change in a bulk update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriState {
    Enable,
    Disable,
    #[default]
    Unset,
}

/// Admin request mutating the attributes of a set of agents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentBulkUpdate {
    pub agents: Vec<AgentId>,
    #[serde(default)]
    pub resources_to_add: BTreeSet<String>,
    #[serde(default)]
    pub resources_to_remove: BTreeSet<String>,
    #[serde(default)]
    pub environments_to_add: BTreeSet<String>,
    #[serde(default)]
    pub environments_to_remove: BTreeSet<String>,
    #[serde(default)]
    pub state: TriState,
}

impl AgentBulkUpdate {
    /// True when the request names no change at all.
    pub fn is_noop(&self) -> bool {
        self.resources_to_add.is_empty()
            && self.resources_to_remove.is_empty()
            && self.environments_to_add.is_empty()
            && self.environments_to_remove.is_empty()
            && self.state == TriState::Unset
    }
}

/// Admin request mutating a single agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentAttributesUpdate {
    pub hostname: Option<String>,
    pub resources: Option<BTreeSet<String>>,
    pub environments: Option<BTreeSet<String>>,
    #[serde(default)]
    pub state: TriState,
}

impl AgentAttributesUpdate {
    pub fn is_noop(&self) -> bool {
        self.hostname.is_none()
            && self.resources.is_none()
            && self.environments.is_none()
            && self.state == TriState::Unset
    }
}
