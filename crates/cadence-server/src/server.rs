//! Wires the in-memory adapters and the scheduler together.

use crate::config::ServerConfig;
use async_trait::async_trait;
use cadence_core::Result;
use cadence_core::config::CruiseConfig;
use cadence_core::ids::JobIdentifier;
use cadence_core::ports::ConsoleLog;
use cadence_scheduler::{Scheduler, SchedulerContextBuilder};
use cadence_store::{
    FixedDiskSpace, MemoryConfigRepository, MemoryHealthService, MemoryPluginRegistry,
    MemoryStore, StaticSecretResolver,
};
use std::sync::Arc;
use tracing::info;

/// Console output goes to the server log, one event per line.
struct TracingConsoleLog;

#[async_trait]
impl ConsoleLog for TracingConsoleLog {
    async fn append(&self, job: &JobIdentifier, text: &str) -> Result<()> {
        info!(target: "cadence::console", job = %job, "{text}");
        Ok(())
    }
}

pub fn build_scheduler(config: &ServerConfig, cruise: CruiseConfig) -> Scheduler {
    let store = Arc::new(MemoryStore::new());
    let secrets = Arc::new(StaticSecretResolver::new());
    for (config_id, values) in &config.secrets {
        for (key, value) in values {
            secrets.insert(config_id, key, value);
        }
    }
    let disk = FixedDiskSpace::new(config.artifacts_free_bytes.unwrap_or(u64::MAX));

    let ctx = SchedulerContextBuilder::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store,
        Arc::new(MemoryConfigRepository::new(cruise)),
        Arc::new(MemoryPluginRegistry::new()),
        secrets,
        Arc::new(TracingConsoleLog),
        Arc::new(MemoryHealthService::new()),
    )
    .config(config.scheduler.clone())
    .disk(Arc::new(disk))
    .build();

    Scheduler::new(ctx)
}

/// Problems that would stop jobs from ever being scheduled.
pub fn configuration_problems(cruise: &CruiseConfig) -> Vec<String> {
    let mut problems = Vec::new();
    for pipeline in &cruise.pipelines {
        if pipeline.stages.is_empty() {
            problems.push(format!("Pipeline '{}' has no stages", pipeline.name));
        }
        for stage in &pipeline.stages {
            if stage.jobs.is_empty() {
                problems.push(format!(
                    "Stage '{}/{}' has no jobs",
                    pipeline.name, stage.name
                ));
            }
            for job in &stage.jobs {
                let Some(profile_id) = &job.elastic_profile_id else {
                    continue;
                };
                match cruise.elastic_profile(profile_id) {
                    None => problems.push(format!(
                        "Job '{}/{}/{}' refers to missing elastic profile '{profile_id}'",
                        pipeline.name, stage.name, job.name
                    )),
                    Some(profile) if cruise.cluster_profile(&profile.cluster_profile_id).is_none() => {
                        problems.push(format!(
                            "Elastic profile '{profile_id}' refers to missing cluster profile '{}'",
                            profile.cluster_profile_id
                        ))
                    }
                    Some(_) => {}
                }
            }
        }
    }
    for environment in &cruise.environments {
        for pipeline in &environment.pipelines {
            if !cruise.has_pipeline(pipeline) {
                problems.push(format!(
                    "Environment '{}' refers to missing pipeline '{pipeline}'",
                    environment.name
                ));
            }
        }
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::config::{JobConfig, PipelineConfig, StageConfig};
    use cadence_core::elastic::ElasticProfile;
    use cadence_core::material::BuildCause;

    fn app() -> PipelineConfig {
        PipelineConfig::new("app", "web")
            .with_stage(StageConfig::new("build").with_job(JobConfig::new("compile")))
    }

    #[tokio::test]
    async fn test_scheduler_runs_on_memory_store() {
        let cruise = CruiseConfig {
            version: 1,
            pipelines: vec![app()],
            ..Default::default()
        };
        let scheduler = build_scheduler(&ServerConfig::default(), cruise);
        scheduler.start().await.unwrap();

        scheduler
            .stages
            .schedule_pipeline("app", BuildCause::forced_by("admin", vec![]))
            .await
            .unwrap();
        let reload = scheduler.pool.reload().await.unwrap();
        assert_eq!(reload.current.len(), 1);
        assert_eq!(reload.current[0].identifier.to_string(), "app/1/build/1/compile");
    }

    #[test]
    fn test_reports_dangling_profiles() {
        let mut pipeline = app();
        pipeline.stages[0].jobs[0] = JobConfig::new("compile").with_elastic_profile("gone");
        let cruise = CruiseConfig {
            version: 1,
            pipelines: vec![pipeline],
            elastic_profiles: vec![ElasticProfile::new("builder", "docker", "missing")],
            ..Default::default()
        };

        let problems = configuration_problems(&cruise);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("missing elastic profile 'gone'"));
    }

    #[test]
    fn test_clean_configuration() {
        let cruise = CruiseConfig {
            version: 1,
            pipelines: vec![app()],
            ..Default::default()
        };
        assert!(configuration_problems(&cruise).is_empty());
    }
}
