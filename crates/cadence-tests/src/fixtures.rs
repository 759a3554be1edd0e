//! Test fixtures for creating sample configuration.

use cadence_core::config::{
    Approval, CruiseConfig, EnvironmentConfig, JobConfig, PipelineConfig, StageConfig, Task,
};
use cadence_core::elastic::{ClusterProfile, ElasticProfile};

/// Factory for creating test pipelines.
pub struct PipelineFixture;

impl PipelineFixture {
    /// One stage `build` with one job `compile`.
    pub fn simple(name: &str) -> PipelineConfig {
        Self::with_resources(name, &[])
    }

    /// Like [`PipelineFixture::simple`], with `compile` needing `resources`.
    pub fn with_resources(name: &str, resources: &[&str]) -> PipelineConfig {
        PipelineConfig::new(name, "default").with_stage(
            StageConfig::new("build").with_job(
                JobConfig::new("compile")
                    .with_resources(resources.iter().copied())
                    .with_task(Task::exec("make", &["all"])),
            ),
        )
    }

    /// `build` then `test`, the second stage gated by `approval`.
    pub fn two_stage(name: &str, approval: Approval) -> PipelineConfig {
        Self::simple(name).with_stage(
            StageConfig::new("test")
                .with_approval(approval)
                .with_job(JobConfig::new("unit").with_task(Task::exec("make", &["test"])))
                .with_job(JobConfig::new("lint").with_task(Task::exec("make", &["lint"]))),
        )
    }

    /// One stage whose only job runs on agents created from `profile`.
    pub fn elastic(name: &str, profile: &str) -> PipelineConfig {
        PipelineConfig::new(name, "default").with_stage(
            StageConfig::new("build")
                .with_job(JobConfig::new("compile").with_elastic_profile(profile)),
        )
    }
}

/// Factory for whole configuration versions.
pub struct ConfigFixture;

impl ConfigFixture {
    pub fn pipelines(pipelines: Vec<PipelineConfig>) -> CruiseConfig {
        CruiseConfig {
            version: 1,
            pipelines,
            ..Default::default()
        }
    }

    /// `pipeline` placed in `environment`.
    pub fn in_environment(pipeline: PipelineConfig, environment: &str) -> CruiseConfig {
        let name = pipeline.name.clone();
        CruiseConfig {
            environments: vec![EnvironmentConfig::new(environment).with_pipeline(name)],
            ..Self::pipelines(vec![pipeline])
        }
    }

    /// An elastic pipeline with profile `builder` on cluster `cluster`,
    /// both owned by `plugin_id`.
    pub fn elastic(pipeline: &str, plugin_id: &str) -> CruiseConfig {
        CruiseConfig {
            elastic_profiles: vec![
                ElasticProfile::new("builder", plugin_id, "cluster").with_property("image", "rust:1"),
            ],
            cluster_profiles: vec![
                ClusterProfile::new("cluster", plugin_id).with_property("namespace", "ci"),
            ],
            ..Self::pipelines(vec![PipelineFixture::elastic(pipeline, "builder")])
        }
    }
}
