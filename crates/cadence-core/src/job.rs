//! Job plans waiting for agents, and the payload handed to an agent.

use crate::config::{ArtifactPlan, ArtifactStore, EnvironmentVariable, JobTimeout, Task};
use crate::elastic::{ClusterProfile, ElasticProfile};
use crate::ids::{AgentId, JobId, JobIdentifier, PipelineId};
use crate::material::BuildCause;
use crate::secrets::SecretParam;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A scheduled job waiting for a compatible agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPlan {
    pub identifier: JobIdentifier,
    pub pipeline_id: PipelineId,
    pub resources: BTreeSet<String>,
    pub elastic_profile: Option<ElasticProfile>,
    pub cluster_profile: Option<ClusterProfile>,
    #[serde(default)]
    pub artifact_plans: Vec<ArtifactPlan>,
    #[serde(default)]
    pub variables: Vec<EnvironmentVariable>,
    pub agent_id: Option<AgentId>,
    #[serde(default)]
    pub timeout: JobTimeout,
    pub scheduled_at: DateTime<Utc>,
}

impl JobPlan {
    pub fn job_id(&self) -> JobId {
        self.identifier.build_id
    }

    pub fn pipeline_name(&self) -> &str {
        self.identifier.pipeline_name()
    }

    pub fn requires_elastic_agent(&self) -> bool {
        self.elastic_profile.is_some()
    }

    /// Secrets referenced by the elastic and cluster profile of this plan.
    pub fn profile_secret_params(&self) -> Vec<SecretParam> {
        let mut params = Vec::new();
        if let Some(profile) = &self.elastic_profile {
            params.extend(profile.secret_params());
        }
        if let Some(cluster) = &self.cluster_profile {
            params.extend(cluster.secret_params());
        }
        params.sort();
        params.dedup();
        params
    }
}

/// One build step, in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Builder {
    pub description: String,
    pub task: Task,
}

impl From<Task> for Builder {
    fn from(task: Task) -> Self {
        Self {
            description: task.describe(),
            task,
        }
    }
}

/// Environment variables a job runs with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentContext {
    variables: BTreeMap<String, String>,
    secure: BTreeSet<String>,
}

impl EnvironmentContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.secure.remove(&name);
        self.variables.insert(name, value.into());
    }

    pub fn set_secure(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.secure.insert(name.clone());
        self.variables.insert(name, value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn is_secure(&self, name: &str) -> bool {
        self.secure.contains(name)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Rendering suitable for console output.
    pub fn masked(&self) -> Vec<String> {
        self.variables
            .iter()
            .map(|(name, value)| {
                if self.secure.contains(name) {
                    format!("{name}=******")
                } else {
                    format!("{name}={value}")
                }
            })
            .collect()
    }
}

/// Everything an agent needs to run one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildAssignment {
    pub job: JobIdentifier,
    pub build_cause: BuildCause,
    pub builders: Vec<Builder>,
    pub working_directory: String,
    pub environment: EnvironmentContext,
    pub artifact_plans: Vec<ArtifactPlan>,
    pub artifact_stores: Vec<ArtifactStore>,
}

/// Answer to an agent asking for work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Work {
    Build(Box<BuildAssignment>),
    NoWork,
    DeniedAgentWork { agent_id: AgentId },
    UnregisteredAgentWork { agent_id: AgentId },
}

impl Work {
    pub fn assignment(&self) -> Option<&BuildAssignment> {
        match self {
            Work::Build(assignment) => Some(assignment),
            Work::NoWork | Work::DeniedAgentWork { .. } | Work::UnregisteredAgentWork { .. } => {
                None
            }
        }
    }

    pub fn is_no_work(&self) -> bool {
        matches!(self, Work::NoWork)
    }
}
