//! Server configuration.
//!
//! Layered with the `config` crate: built-in defaults, then the optional
//! file given by `--config`, then `CADENCE__*` environment variables
//! (`CADENCE__SCHEDULER__AUTO_REGISTER_AGENTS=true`).

use anyhow::{Context, Result};
use cadence_core::config::CruiseConfig;
use cadence_scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Intervals and thresholds for the scheduling loops.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// YAML file holding the pipeline configuration.
    #[serde(default)]
    pub pipelines_file: Option<PathBuf>,
    /// Free bytes reported for the artifacts volume.
    #[serde(default)]
    pub artifacts_free_bytes: Option<u64>,
    /// Secret values by secret config id, then key.
    #[serde(default)]
    pub secrets: BTreeMap<String, BTreeMap<String, String>>,
}

impl ServerConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix("CADENCE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read server configuration")?
            .try_deserialize()
            .context("Invalid server configuration")
    }

    /// The pipeline configuration, or an empty one when no file is set.
    pub fn cruise_config(&self) -> Result<CruiseConfig> {
        match &self.pipelines_file {
            Some(path) => load_cruise_config(path),
            None => Ok(CruiseConfig::default()),
        }
    }
}

pub fn load_cruise_config(path: &Path) -> Result<CruiseConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_yaml::from_str(&contents).with_context(|| format!("Invalid pipelines in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "cadence.yaml",
            "scheduler:\n  auto_register_agents: true\n  elastic_starvation_threshold_secs: 120\n",
        );

        let config = ServerConfig::load(Some(&path)).unwrap();
        assert!(config.scheduler.auto_register_agents);
        assert_eq!(config.scheduler.elastic_starvation_threshold_secs, 120);
        assert_eq!(
            config.scheduler.job_plan_reload_interval_ms,
            SchedulerConfig::default().job_plan_reload_interval_ms
        );
        assert!(config.pipelines_file.is_none());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ServerConfig::load(Some(&dir.path().join("absent.yaml"))).is_err());
    }

    #[test]
    fn test_pipelines_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let pipelines = write_file(
            &dir,
            "pipelines.yaml",
            r#"
version: 3
pipelines:
  - name: app
    group: web
    stages:
      - name: build
        jobs:
          - name: compile
            resources: [linux]
            tasks:
              - type: exec
                command: make
                args: [all]
      - name: deploy
        approval:
          kind: manual
        jobs:
          - name: ship
environments:
  - name: prod
    pipelines: [app]
"#,
        );
        let config = ServerConfig {
            pipelines_file: Some(pipelines),
            ..Default::default()
        };

        let cruise = config.cruise_config().unwrap();
        assert_eq!(cruise.version, 3);
        assert!(cruise.stage("app", "deploy").unwrap().requires_approval());
        assert!(cruise.job("app", "build", "compile").unwrap().resources.contains("linux"));
        assert_eq!(cruise.environment_for_pipeline("app").unwrap().name, "prod");
    }
}
