//! Work assignment from the pending pool to agents.
//!
//! Run with: `cargo test -p cadence-tests --test assignment_tests`

use cadence_core::config::{EnvironmentConfig, JobConfig, PipelineConfig, StageConfig};
use cadence_core::job::Work;
use cadence_core::run::{JobResult, JobState, StageResult};
use cadence_tests::{ConfigFixture, PipelineFixture, TestContext};
use futures::future::join_all;
use std::collections::HashSet;

#[tokio::test]
async fn test_idle_agent_receives_matching_job() {
    let ctx = TestContext::with_pipelines(vec![PipelineFixture::with_resources("app", &["linux"])])
        .await
        .expect("Failed to create context");
    let pipeline = ctx.trigger("app").await.unwrap();
    let agent = ctx.agent(&["linux", "docker"]).await.unwrap();

    let work = ctx.request_work(agent).await.unwrap();

    let assignment = work.assignment().expect("Expected a build assignment");
    assert_eq!(assignment.job.to_string(), format!("{pipeline}/build/1/compile"));
    assert!(ctx
        .scheduler
        .pool
        .job_plans()
        .await
        .iter()
        .all(|plan| plan.identifier != assignment.job));

    let job = ctx.job(assignment.job.build_id).await.unwrap();
    assert_eq!(job.state, JobState::Assigned);
    assert_eq!(job.agent_id, Some(agent));
}

#[tokio::test]
async fn test_disabled_agent_is_denied() {
    let ctx = TestContext::with_pipelines(vec![PipelineFixture::simple("app")])
        .await
        .expect("Failed to create context");
    ctx.trigger("app").await.unwrap();
    let agent = ctx.agent(&[]).await.unwrap();
    ctx.scheduler.registry.disable(&[agent]).await.unwrap();
    let before = ctx.scheduler.pool.job_plans().await;

    let work = ctx.request_work(agent).await.unwrap();

    assert_eq!(work, Work::DeniedAgentWork { agent_id: agent });
    assert_eq!(ctx.scheduler.pool.job_plans().await, before);
}

#[tokio::test]
async fn test_each_job_is_assigned_at_most_once() {
    let ctx = TestContext::with_pipelines(vec![
        PipelineFixture::simple("app"),
        PipelineFixture::simple("lib"),
        PipelineFixture::simple("docs"),
    ])
    .await
    .expect("Failed to create context");
    for pipeline in ["app", "lib", "docs"] {
        ctx.trigger(pipeline).await.unwrap();
    }
    let mut agents = Vec::new();
    for _ in 0..10 {
        agents.push(ctx.agent(&[]).await.unwrap());
    }

    let results = join_all(agents.iter().map(|agent| {
        let scheduler = ctx.scheduler.clone();
        let agent = *agent;
        async move { scheduler.dispatcher.assign_work_to_agent(agent).await }
    }))
    .await;

    let assigned: Vec<_> = results
        .into_iter()
        .filter_map(|work| work.unwrap().assignment().map(|a| a.job.build_id))
        .collect();
    let distinct: HashSet<_> = assigned.iter().copied().collect();
    assert_eq!(assigned.len(), 3);
    assert_eq!(distinct.len(), 3);
    assert!(ctx.scheduler.pool.is_empty().await);
}

#[tokio::test]
async fn test_job_needs_subset_of_agent_resources() {
    let ctx = TestContext::with_pipelines(vec![PipelineFixture::with_resources(
        "app",
        &["linux", "gpu"],
    )])
    .await
    .expect("Failed to create context");
    ctx.trigger("app").await.unwrap();

    let partial = ctx.agent(&["linux"]).await.unwrap();
    assert!(ctx.request_work(partial).await.unwrap().is_no_work());
    assert_eq!(ctx.scheduler.pool.len().await, 1);

    let superset = ctx.agent(&["linux", "gpu", "docker"]).await.unwrap();
    assert!(ctx.request_work(superset).await.unwrap().assignment().is_some());
}

#[tokio::test]
async fn test_environments_isolate_agents() {
    let mut config = ConfigFixture::in_environment(PipelineFixture::simple("prod-app"), "prod");
    config.pipelines.push(PipelineFixture::simple("free-app"));
    config.environments.push(EnvironmentConfig::new("staging"));
    let ctx = TestContext::with_config(config)
        .await
        .expect("Failed to create context");
    ctx.trigger("prod-app").await.unwrap();

    let staging = ctx.agent(&[]).await.unwrap();
    ctx.scheduler
        .registry
        .update_environment_association("staging", &[staging])
        .await
        .unwrap();
    let unassociated = ctx.agent(&[]).await.unwrap();

    assert!(ctx.request_work(staging).await.unwrap().is_no_work());
    assert!(ctx.request_work(unassociated).await.unwrap().is_no_work());

    // A job outside every environment never reaches an agent inside one.
    ctx.trigger("free-app").await.unwrap();
    assert!(ctx.request_work(staging).await.unwrap().is_no_work());
    let work = ctx.request_work(unassociated).await.unwrap();
    assert_eq!(work.assignment().unwrap().job.pipeline_name(), "free-app");

    let prod = ctx.agent(&[]).await.unwrap();
    ctx.scheduler
        .registry
        .update_environment_association("prod", &[prod])
        .await
        .unwrap();
    let work = ctx.request_work(prod).await.unwrap();
    let assignment = work.assignment().unwrap();
    assert_eq!(assignment.job.pipeline_name(), "prod-app");
    assert_eq!(assignment.environment.get("CADENCE_ENVIRONMENT_NAME"), Some("prod"));
}

#[tokio::test]
async fn test_agent_reports_job_through_to_completion() {
    let ctx = TestContext::with_pipelines(vec![PipelineFixture::simple("app")])
        .await
        .expect("Failed to create context");
    let pipeline = ctx.trigger("app").await.unwrap();
    let agent = ctx.agent(&[]).await.unwrap();
    let work = ctx.request_work(agent).await.unwrap();
    let job = work.assignment().unwrap().job.clone();

    ctx.finish_job(&job, agent, JobResult::Passed).await.unwrap();

    let stage = ctx.stage(&pipeline, "build").await.unwrap().unwrap();
    assert_eq!(stage.result, StageResult::Passed);
    assert_eq!(ctx.job(job.build_id).await.unwrap().state, JobState::Completed);

    // The agent is free again and there is nothing left to do.
    assert!(ctx.request_work(agent).await.unwrap().is_no_work());
}

#[tokio::test]
async fn test_missing_secret_fails_job_instead_of_scheduling() {
    let pipeline = PipelineConfig::new("app", "default").with_stage(
        StageConfig::new("deploy")
            .with_job(JobConfig::new("ship").with_variable("TOKEN", "{{SECRET:[vault][token]}}")),
    );
    let ctx = TestContext::with_pipelines(vec![pipeline])
        .await
        .expect("Failed to create context");
    let pipeline = ctx.trigger("app").await.unwrap();
    let job = ctx.scheduler.pool.job_plans().await[0].identifier.clone();
    let agent = ctx.agent(&[]).await.unwrap();

    let work = ctx.request_work(agent).await.unwrap();

    assert!(work.is_no_work());
    assert_eq!(ctx.job(job.build_id).await.unwrap().result, JobResult::Failed);
    assert!(ctx.console.contains(&job, "Job failed before it could start").await);
    let stage = ctx.stage(&pipeline, "deploy").await.unwrap().unwrap();
    assert_eq!(stage.result, StageResult::Failed);
    assert!(ctx.scheduler.pool.is_empty().await);
}

#[tokio::test]
async fn test_secret_values_reach_the_agent_masked() {
    let pipeline = PipelineFixture::simple("app").with_variable("TOKEN", "{{SECRET:[vault][token]}}");
    let ctx = TestContext::with_pipelines(vec![pipeline])
        .await
        .expect("Failed to create context");
    ctx.secrets.insert("vault", "token", "hunter2");
    ctx.trigger("app").await.unwrap();
    let agent = ctx.agent(&[]).await.unwrap();

    let work = ctx.request_work(agent).await.unwrap();

    let environment = &work.assignment().unwrap().environment;
    assert_eq!(environment.get("TOKEN"), Some("hunter2"));
    assert!(environment.is_secure("TOKEN"));
}
