//! Stage ordering, approvals, reruns and cancellation.
//!
//! Run with: `cargo test -p cadence-tests --test stage_tests`

use cadence_core::config::{Approval, JobConfig, LockBehavior, StageConfig};
use cadence_core::run::{JobResult, JobState, StageResult};
use cadence_tests::{PipelineFixture, TestContext};

fn success_only() -> Approval {
    Approval {
        allow_only_on_success: true,
        ..Approval::manual()
    }
}

#[tokio::test]
async fn test_passing_stage_triggers_next_stage() {
    let ctx = TestContext::with_pipelines(vec![PipelineFixture::two_stage(
        "app",
        Approval::automatic(),
    )])
    .await
    .expect("Failed to create context");
    let pipeline = ctx.trigger("app").await.unwrap();
    assert!(ctx.stage(&pipeline, "test").await.unwrap().is_none());

    ctx.complete_stage(&pipeline, "build", JobResult::Passed)
        .await
        .unwrap();

    let test = ctx.stage(&pipeline, "test").await.unwrap().unwrap();
    assert!(test.is_active());
    assert_eq!(test.identifier.to_string(), format!("{pipeline}/test/1"));
    let mut pending: Vec<_> = ctx
        .scheduler
        .pool
        .job_plans()
        .await
        .into_iter()
        .map(|plan| plan.identifier.job_name)
        .collect();
    pending.sort();
    assert_eq!(pending, vec!["lint".to_string(), "unit".to_string()]);
}

#[tokio::test]
async fn test_failed_stage_does_not_trigger_next_stage() {
    let ctx = TestContext::with_pipelines(vec![PipelineFixture::two_stage(
        "app",
        Approval::automatic(),
    )])
    .await
    .expect("Failed to create context");
    let pipeline = ctx.trigger("app").await.unwrap();

    ctx.complete_stage(&pipeline, "build", JobResult::Failed)
        .await
        .unwrap();

    let build = ctx.stage(&pipeline, "build").await.unwrap().unwrap();
    assert_eq!(build.result, StageResult::Failed);
    assert!(ctx.stage(&pipeline, "test").await.unwrap().is_none());
    assert!(ctx.scheduler.pool.is_empty().await);
}

#[tokio::test]
async fn test_manual_stage_waits_for_previous_stage_to_pass() {
    let ctx = TestContext::with_pipelines(vec![PipelineFixture::two_stage("app", success_only())])
        .await
        .expect("Failed to create context");
    let pipeline = ctx.trigger("app").await.unwrap();
    ctx.complete_stage(&pipeline, "build", JobResult::Failed)
        .await
        .unwrap();

    assert!(ctx
        .scheduler
        .stages
        .schedule_stage(&pipeline, "test", "alice")
        .await
        .is_err());
    assert!(ctx.stage(&pipeline, "test").await.unwrap().is_none());

    let rerun = ctx
        .scheduler
        .stages
        .rerun_stage(&pipeline, "build", "alice")
        .await
        .unwrap();
    assert_eq!(rerun.identifier.stage_counter, 2);
    ctx.scheduler.pool.reload().await.unwrap();
    ctx.complete_stage(&pipeline, "build", JobResult::Passed)
        .await
        .unwrap();

    // Manual approval: passing alone does not schedule it.
    assert!(ctx.stage(&pipeline, "test").await.unwrap().is_none());
    let test = ctx
        .scheduler
        .stages
        .schedule_stage(&pipeline, "test", "alice")
        .await
        .unwrap();
    assert_eq!(test.approved_by, "alice");
    assert!(test.is_active());
}

#[tokio::test]
async fn test_stage_needs_previous_stage_to_have_run() {
    let pipeline = PipelineFixture::two_stage("app", Approval::manual()).with_stage(
        StageConfig::new("deploy")
            .with_approval(Approval::manual())
            .with_job(JobConfig::new("ship")),
    );
    let ctx = TestContext::with_pipelines(vec![pipeline])
        .await
        .expect("Failed to create context");
    let pipeline = ctx.trigger("app").await.unwrap();
    ctx.complete_stage(&pipeline, "build", JobResult::Passed)
        .await
        .unwrap();

    assert!(ctx
        .scheduler
        .stages
        .schedule_stage(&pipeline, "deploy", "alice")
        .await
        .is_err());
    assert!(ctx.stage(&pipeline, "deploy").await.unwrap().is_none());

    ctx.scheduler
        .stages
        .schedule_stage(&pipeline, "test", "alice")
        .await
        .unwrap();
    ctx.scheduler.pool.reload().await.unwrap();
    ctx.complete_stage(&pipeline, "test", JobResult::Passed)
        .await
        .unwrap();
    assert!(ctx
        .scheduler
        .stages
        .schedule_stage(&pipeline, "deploy", "alice")
        .await
        .is_ok());
}

#[tokio::test]
async fn test_rerun_failed_jobs_keeps_passed_results() {
    let ctx = TestContext::with_pipelines(vec![PipelineFixture::two_stage(
        "app",
        Approval::automatic(),
    )])
    .await
    .expect("Failed to create context");
    let pipeline = ctx.trigger("app").await.unwrap();
    ctx.complete_stage(&pipeline, "build", JobResult::Passed)
        .await
        .unwrap();

    for _ in 0..2 {
        let agent = ctx.agent(&[]).await.unwrap();
        let work = ctx.request_work(agent).await.unwrap();
        let job = work.assignment().unwrap().job.clone();
        let result = if job.job_name == "unit" {
            JobResult::Failed
        } else {
            JobResult::Passed
        };
        ctx.finish_job(&job, agent, result).await.unwrap();
    }
    let failed = ctx.stage(&pipeline, "test").await.unwrap().unwrap();
    assert_eq!(failed.result, StageResult::Failed);

    let rerun = ctx
        .scheduler
        .stages
        .rerun_failed_jobs(failed.id, "alice")
        .await
        .unwrap();

    assert_eq!(rerun.identifier.stage_counter, 2);
    let unit = rerun.job("unit").unwrap();
    assert_eq!(unit.state, JobState::Scheduled);
    assert!(!unit.copied);
    let lint = rerun.job("lint").unwrap();
    assert!(lint.copied);
    assert_eq!(lint.result, JobResult::Passed);

    let reload = ctx.scheduler.pool.reload().await.unwrap();
    assert_eq!(reload.current.len(), 1);
    assert_eq!(reload.current[0].identifier.job_name, "unit");
}

#[tokio::test]
async fn test_cancel_stage_cancels_unfinished_jobs() {
    let ctx = TestContext::with_pipelines(vec![PipelineFixture::two_stage(
        "app",
        Approval::automatic(),
    )])
    .await
    .expect("Failed to create context");
    let pipeline = ctx.trigger("app").await.unwrap();
    let build = ctx.stage(&pipeline, "build").await.unwrap().unwrap();

    ctx.scheduler
        .stages
        .cancel_stage(build.id, "alice")
        .await
        .unwrap();

    let build = ctx.stage(&pipeline, "build").await.unwrap().unwrap();
    assert_eq!(build.result, StageResult::Cancelled);
    let job = build.job("compile").unwrap();
    assert_eq!(job.result, JobResult::Cancelled);
    assert!(ctx.console.contains(&job.identifier, "Stage cancelled by alice.").await);
    assert!(ctx.scheduler.pool.is_empty().await);
    assert!(ctx.stage(&pipeline, "test").await.unwrap().is_none());

    // Cancelling a completed stage is a no-op.
    ctx.scheduler
        .stages
        .cancel_stage(build.id, "alice")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_failed_last_stage_releases_pipeline_lock() {
    let ctx = TestContext::with_pipelines(vec![
        PipelineFixture::simple("app").with_lock_behavior(LockBehavior::LockOnFailure),
    ])
    .await
    .expect("Failed to create context");
    let pipeline = ctx.trigger("app").await.unwrap();
    assert!(ctx.scheduler.pipeline_state.is_locked("app").await.unwrap());

    ctx.complete_stage(&pipeline, "build", JobResult::Failed)
        .await
        .unwrap();

    let build = ctx.stage(&pipeline, "build").await.unwrap().unwrap();
    assert_eq!(build.result, StageResult::Failed);
    assert!(!ctx.scheduler.pipeline_state.is_locked("app").await.unwrap());
    let next = ctx.trigger("app").await.unwrap();
    assert_eq!(next.counter, pipeline.counter + 1);
}

#[tokio::test]
async fn test_completed_stage_triggers_newest_waiting_instance() {
    let ctx = TestContext::with_pipelines(vec![PipelineFixture::two_stage(
        "app",
        Approval::automatic(),
    )])
    .await
    .expect("Failed to create context");

    let first = ctx.trigger("app").await.unwrap();
    ctx.complete_stage(&first, "build", JobResult::Passed)
        .await
        .unwrap();
    assert!(ctx.stage(&first, "test").await.unwrap().unwrap().is_active());

    let second = ctx.trigger("app").await.unwrap();
    ctx.complete_stage(&second, "build", JobResult::Passed)
        .await
        .unwrap();
    assert!(ctx.stage(&second, "test").await.unwrap().is_none());

    let third = ctx.trigger("app").await.unwrap();
    assert!(ctx.stage(&third, "build").await.unwrap().unwrap().is_active());

    ctx.complete_stage(&first, "test", JobResult::Passed)
        .await
        .unwrap();

    let test = ctx.stage(&second, "test").await.unwrap().unwrap();
    assert!(test.is_active());
    assert!(ctx.stage(&third, "test").await.unwrap().is_none());
}
