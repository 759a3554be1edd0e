//! Server health messages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What a health message is about. Updating a scope replaces any earlier
/// message for the same scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum HealthScope {
    Global,
    Pipeline(String),
    Agent(String),
    Job(String),
    Plugin(String),
    ElasticAgentCreation(String),
    OrphanedElasticAgent(String),
    StuckInCancel(String),
    DiskSpace,
}

impl fmt::Display for HealthScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthScope::Global => write!(f, "global"),
            HealthScope::Pipeline(name) => write!(f, "pipeline:{name}"),
            HealthScope::Agent(id) => write!(f, "agent:{id}"),
            HealthScope::Job(id) => write!(f, "job:{id}"),
            HealthScope::Plugin(id) => write!(f, "plugin:{id}"),
            HealthScope::ElasticAgentCreation(id) => write!(f, "elastic-agent-creation:{id}"),
            HealthScope::OrphanedElasticAgent(id) => write!(f, "orphaned-elastic-agent:{id}"),
            HealthScope::StuckInCancel(id) => write!(f, "stuck-in-cancel:{id}"),
            HealthScope::DiskSpace => write!(f, "disk-space"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthState {
    pub scope: HealthScope,
    pub level: HealthLevel,
    pub message: String,
    pub description: String,
}

impl HealthState {
    pub fn success(scope: HealthScope) -> Self {
        Self {
            scope,
            level: HealthLevel::Success,
            message: String::new(),
            description: String::new(),
        }
    }

    pub fn warning(
        scope: HealthScope,
        message: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            scope,
            level: HealthLevel::Warning,
            message: message.into(),
            description: description.into(),
        }
    }

    pub fn error(
        scope: HealthScope,
        message: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            scope,
            level: HealthLevel::Error,
            message: message.into(),
            description: description.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.level == HealthLevel::Success
    }
}
