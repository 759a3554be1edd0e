//! Immutable configuration snapshot.
//!
//! The scheduler never edits configuration. A new [`CruiseConfig`] is built
//! by the configuration collaborator and published as a whole; readers hold
//! an `Arc` to whichever version was current when they started.

use crate::elastic::{ClusterProfile, ElasticProfile};
use crate::error::{Error, Result};
use crate::ids::JobIdentifier;
use crate::material::MaterialKind;
use crate::secrets::{ConfigValue, SecretParam};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One version of the whole configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CruiseConfig {
    pub version: u64,
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
    #[serde(default)]
    pub elastic_profiles: Vec<ElasticProfile>,
    #[serde(default)]
    pub cluster_profiles: Vec<ClusterProfile>,
    #[serde(default)]
    pub artifact_stores: Vec<ArtifactStore>,
}

impl CruiseConfig {
    pub fn pipeline(&self, name: &str) -> Option<&PipelineConfig> {
        self.pipelines.iter().find(|p| p.name == name)
    }

    pub fn pipeline_or_err(&self, name: &str) -> Result<&PipelineConfig> {
        self.pipeline(name)
            .ok_or_else(|| Error::PipelineNotFound(name.to_string()))
    }

    pub fn has_pipeline(&self, name: &str) -> bool {
        self.pipeline(name).is_some()
    }

    pub fn stage(&self, pipeline: &str, stage: &str) -> Option<&StageConfig> {
        self.pipeline(pipeline).and_then(|p| p.stage(stage))
    }

    pub fn stage_or_err(&self, pipeline: &str, stage: &str) -> Result<&StageConfig> {
        self.pipeline_or_err(pipeline)?
            .stage(stage)
            .ok_or_else(|| Error::StageNotFound(format!("{pipeline}/{stage}")))
    }

    pub fn job(&self, pipeline: &str, stage: &str, job: &str) -> Option<&JobConfig> {
        self.stage(pipeline, stage).and_then(|s| s.job(job))
    }

    /// Whether the job a plan refers to still exists.
    pub fn has_job(&self, identifier: &JobIdentifier) -> bool {
        self.job(
            identifier.pipeline_name(),
            identifier.stage_name(),
            &identifier.job_name,
        )
        .is_some()
    }

    pub fn tasks_for_job(&self, pipeline: &str, stage: &str, job: &str) -> Result<Vec<Task>> {
        let stage_config = self.stage_or_err(pipeline, stage)?;
        stage_config
            .job(job)
            .map(|j| j.tasks.clone())
            .ok_or_else(|| Error::JobNotFound(format!("{pipeline}/{stage}/{job}")))
    }

    pub fn next_stage(&self, pipeline: &str, stage: &str) -> Option<&StageConfig> {
        let config = self.pipeline(pipeline)?;
        let index = config.stage_index(stage)?;
        config.stages.get(index + 1)
    }

    pub fn previous_stage(&self, pipeline: &str, stage: &str) -> Option<&StageConfig> {
        let config = self.pipeline(pipeline)?;
        let index = config.stage_index(stage)?;
        index.checked_sub(1).and_then(|i| config.stages.get(i))
    }

    pub fn is_first_stage(&self, pipeline: &str, stage: &str) -> bool {
        self.pipeline(pipeline)
            .and_then(|p| p.stages.first())
            .is_some_and(|s| s.name == stage)
    }

    pub fn is_last_stage(&self, pipeline: &str, stage: &str) -> bool {
        self.pipeline(pipeline)
            .and_then(|p| p.stages.last())
            .is_some_and(|s| s.name == stage)
    }

    /// The environment a pipeline belongs to, if any.
    pub fn environment_for_pipeline(&self, pipeline: &str) -> Option<&EnvironmentConfig> {
        self.environments
            .iter()
            .find(|e| e.pipelines.contains(pipeline))
    }

    pub fn environment(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.environments.iter().find(|e| e.name == name)
    }

    pub fn elastic_profile(&self, id: &str) -> Option<&ElasticProfile> {
        self.elastic_profiles.iter().find(|p| p.id == id)
    }

    pub fn cluster_profile(&self, id: &str) -> Option<&ClusterProfile> {
        self.cluster_profiles.iter().find(|p| p.id == id)
    }

    /// Cluster profiles grouped by the plugin that owns them.
    pub fn cluster_profiles_by_plugin(&self) -> BTreeMap<String, Vec<ClusterProfile>> {
        let mut grouped: BTreeMap<String, Vec<ClusterProfile>> = BTreeMap::new();
        for profile in &self.cluster_profiles {
            grouped
                .entry(profile.plugin_id.clone())
                .or_default()
                .push(profile.clone());
        }
        grouped
    }

    pub fn artifact_store(&self, id: &str) -> Option<&ArtifactStore> {
        self.artifact_stores.iter().find(|s| s.id == id)
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        self.pipelines.iter().map(|p| p.name.clone()).collect()
    }
}

/// Lock behavior of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockBehavior {
    #[default]
    None,
    LockOnFailure,
    UnlockWhenFinished,
}

impl LockBehavior {
    pub fn is_lockable(&self) -> bool {
        !matches!(self, LockBehavior::None)
    }

    pub fn is_unlockable_when_finished(&self) -> bool {
        matches!(self, LockBehavior::UnlockWhenFinished)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub group: String,
    #[serde(default)]
    pub lock_behavior: LockBehavior,
    #[serde(default)]
    pub materials: Vec<MaterialKind>,
    #[serde(default)]
    pub variables: Vec<EnvironmentVariable>,
    pub stages: Vec<StageConfig>,
}

impl PipelineConfig {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            lock_behavior: LockBehavior::None,
            materials: Vec::new(),
            variables: Vec::new(),
            stages: Vec::new(),
        }
    }

    pub fn with_stage(mut self, stage: StageConfig) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_lock_behavior(mut self, lock_behavior: LockBehavior) -> Self {
        self.lock_behavior = lock_behavior;
        self
    }

    pub fn with_material(mut self, material: MaterialKind) -> Self {
        self.materials.push(material);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.push(EnvironmentVariable::plain(name, value));
        self
    }

    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    pub fn first_stage(&self) -> Option<&StageConfig> {
        self.stages.first()
    }

    pub fn is_lockable(&self) -> bool {
        self.lock_behavior.is_lockable()
    }
}

/// Approval gate in front of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    #[default]
    Success,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Approval {
    #[serde(default)]
    pub kind: ApprovalKind,
    /// Only allow the stage once the previous stage passed.
    #[serde(default)]
    pub allow_only_on_success: bool,
}

impl Approval {
    pub fn automatic() -> Self {
        Self::default()
    }

    pub fn manual() -> Self {
        Self {
            kind: ApprovalKind::Manual,
            allow_only_on_success: false,
        }
    }

    pub fn is_manual(&self) -> bool {
        self.kind == ApprovalKind::Manual
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    #[serde(default)]
    pub approval: Approval,
    #[serde(default)]
    pub variables: Vec<EnvironmentVariable>,
    pub jobs: Vec<JobConfig>,
}

impl StageConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            approval: Approval::automatic(),
            variables: Vec::new(),
            jobs: Vec::new(),
        }
    }

    pub fn with_job(mut self, job: JobConfig) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn with_approval(mut self, approval: Approval) -> Self {
        self.approval = approval;
        self
    }

    pub fn requires_approval(&self) -> bool {
        self.approval.is_manual()
    }

    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

/// How long a job may stay silent before it is considered hung.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTimeout {
    Never,
    #[default]
    Default,
    Minutes(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(default)]
    pub resources: BTreeSet<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    pub elastic_profile_id: Option<String>,
    #[serde(default)]
    pub timeout: JobTimeout,
    #[serde(default)]
    pub variables: Vec<EnvironmentVariable>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactPlan>,
}

impl JobConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resources: BTreeSet::new(),
            tasks: Vec::new(),
            elastic_profile_id: None,
            timeout: JobTimeout::Default,
            variables: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_elastic_profile(mut self, profile_id: impl Into<String>) -> Self {
        self.elastic_profile_id = Some(profile_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: JobTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.push(EnvironmentVariable::plain(name, value));
        self
    }

    pub fn with_artifact(mut self, artifact: ArtifactPlan) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

/// A unit of work inside a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    Exec {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        working_directory: Option<String>,
    },
    Fetch {
        pipeline: Option<String>,
        stage: String,
        job: String,
        source: String,
        destination: Option<String>,
    },
    Plugin {
        plugin_id: String,
        #[serde(default)]
        configuration: BTreeMap<String, ConfigValue>,
    },
}

impl Task {
    pub fn exec(command: impl Into<String>, args: &[&str]) -> Self {
        Task::Exec {
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_directory: None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Task::Exec { command, args, .. } => {
                if args.is_empty() {
                    command.clone()
                } else {
                    format!("{} {}", command, args.join(" "))
                }
            }
            Task::Fetch { stage, job, source, .. } => format!("fetch {stage}/{job}/{source}"),
            Task::Plugin { plugin_id, .. } => format!("plugin {plugin_id}"),
        }
    }

    pub fn secret_params(&self) -> Vec<SecretParam> {
        match self {
            Task::Plugin { configuration, .. } => {
                crate::secrets::collect_params(configuration.values())
            }
            Task::Exec { .. } | Task::Fetch { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: ConfigValue,
    #[serde(default)]
    pub secure: bool,
}

impl EnvironmentVariable {
    pub fn plain(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: ConfigValue::new(value),
            secure: false,
        }
    }

    pub fn secure(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: ConfigValue::new(value),
            secure: true,
        }
    }
}

/// A named set of pipelines and shared variables. Agents join
/// environments through their own record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    #[serde(default)]
    pub pipelines: BTreeSet<String>,
    #[serde(default)]
    pub variables: Vec<EnvironmentVariable>,
}

impl EnvironmentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pipelines: BTreeSet::new(),
            variables: Vec::new(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.pipelines.insert(pipeline.into());
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.push(EnvironmentVariable::plain(name, value));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactStore {
    pub id: String,
    pub plugin_id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, ConfigValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArtifactPlan {
    Build {
        source: String,
        destination: Option<String>,
    },
    Test {
        source: String,
        destination: Option<String>,
    },
    External {
        id: String,
        store_id: String,
    },
}

impl ArtifactPlan {
    pub fn store_id(&self) -> Option<&str> {
        match self {
            ArtifactPlan::External { store_id, .. } => Some(store_id),
            ArtifactPlan::Build { .. } | ArtifactPlan::Test { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config() -> CruiseConfig {
        CruiseConfig {
            version: 1,
            pipelines: vec![
                PipelineConfig::new("app", "web")
                    .with_stage(StageConfig::new("build").with_job(JobConfig::new("compile")))
                    .with_stage(
                        StageConfig::new("deploy")
                            .with_approval(Approval::manual())
                            .with_job(JobConfig::new("ship")),
                    ),
            ],
            environments: vec![EnvironmentConfig::new("prod").with_pipeline("app")],
            ..Default::default()
        }
    }

    #[test]
    fn test_stage_navigation() {
        let config = config();
        assert_eq!(config.next_stage("app", "build").map(|s| s.name.as_str()), Some("deploy"));
        assert!(config.next_stage("app", "deploy").is_none());
        assert_eq!(config.previous_stage("app", "deploy").map(|s| s.name.as_str()), Some("build"));
        assert!(config.previous_stage("app", "build").is_none());
        assert!(config.is_first_stage("app", "build"));
        assert!(config.is_last_stage("app", "deploy"));
    }

    #[test]
    fn test_tasks_for_missing_pipeline() {
        let config = config();
        let err = config.tasks_for_job("gone", "build", "compile").unwrap_err();
        assert!(matches!(err, Error::PipelineNotFound(_)));
        let err = config.tasks_for_job("app", "build", "gone").unwrap_err();
        assert!(matches!(err, Error::JobNotFound(_)));
    }

    #[test]
    fn test_environment_for_pipeline() {
        let config = config();
        assert_eq!(
            config.environment_for_pipeline("app").map(|e| e.name.as_str()),
            Some("prod")
        );
        assert!(config.environment_for_pipeline("other").is_none());
    }
}
