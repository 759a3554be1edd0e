//! Pipeline triggering, pausing and the timer-driven schedule loop.
//!
//! Run with: `cargo test -p cadence-tests --test scheduling_tests`

use cadence_core::config::Approval;
use cadence_core::health::HealthScope;
use cadence_core::material::BuildCause;
use cadence_core::result::OperationStatus;
use cadence_core::run::JobResult;
use cadence_scheduler::SchedulerConfig;
use cadence_scheduler::queue::ScheduleCheckState;
use cadence_tests::{ConfigFixture, PipelineFixture, TestContext, wait_for};
use std::time::Duration;
use tokio::sync::watch;

fn fast_timers() -> SchedulerConfig {
    SchedulerConfig {
        job_plan_reload_interval_ms: 10,
        auto_schedule_interval_ms: 10,
        schedule_check_interval_ms: 10,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_timers_skip_paused_pipeline() {
    let config = ConfigFixture::pipelines(vec![
        PipelineFixture::simple("release"),
        PipelineFixture::simple("app"),
    ]);
    let ctx = TestContext::build(fast_timers(), config)
        .await
        .expect("Failed to create context");
    let paused = ctx
        .scheduler
        .pipeline_state
        .pause("release", Some("code freeze"), "alice")
        .await;
    assert_eq!(paused.status, OperationStatus::Ok);
    ctx.build_causes.push_changes("release", "r1");
    ctx.build_causes.push_changes("app", "a1");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let timers = ctx.scheduler.spawn_timers(shutdown_rx);

    let pipelines = ctx.scheduler.ctx.pipelines.clone();
    let scheduled = wait_for(Duration::from_secs(5), Duration::from_millis(10), || {
        let pipelines = pipelines.clone();
        async move { matches!(pipelines.latest_instance("app").await, Ok(Some(_))) }
    })
    .await;
    // Give the loops a few more rounds at the paused pipeline.
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).unwrap();
    timers.join().await;

    assert!(scheduled, "app was never scheduled by the timers");
    assert!(pipelines.latest_instance("release").await.unwrap().is_none());
    assert_eq!(ctx.build_causes.pending("release"), 1);
    assert_eq!(ctx.scheduler.pool.len().await, 1);
}

#[tokio::test]
async fn test_schedule_check_marks_pipeline_busy_until_done() {
    let ctx = TestContext::with_pipelines(vec![PipelineFixture::simple("app")])
        .await
        .expect("Failed to create context");
    let trigger = &ctx.scheduler.trigger;

    assert_eq!(trigger.check_for_changes().await, vec!["app".to_string()]);
    assert_eq!(trigger.states().state("app").await, ScheduleCheckState::Busy);
    assert!(trigger.check_for_changes().await.is_empty());

    trigger.process_pending().await;
    assert_eq!(trigger.states().state("app").await, ScheduleCheckState::Idle);
}

#[tokio::test]
async fn test_manual_trigger_becomes_pipeline_instance() {
    let ctx = TestContext::with_pipelines(vec![PipelineFixture::simple("app")])
        .await
        .expect("Failed to create context");
    let trigger = &ctx.scheduler.trigger;

    assert_eq!(
        trigger.manual_trigger("app", "alice").await.status,
        OperationStatus::Accepted
    );
    assert_eq!(
        trigger.manual_trigger("app", "bob").await.status,
        OperationStatus::Conflict
    );

    let scheduled = ctx
        .scheduler
        .stages
        .auto_schedule_pipelines_from_request_buffer()
        .await;
    assert_eq!(scheduled.len(), 1);
    let instance = ctx
        .scheduler
        .ctx
        .pipelines
        .latest_instance("app")
        .await
        .unwrap()
        .unwrap();
    assert!(instance.build_cause.forced);
    assert_eq!(instance.build_cause.approver, "alice");

    // Triggering again waits until the first stage is no longer running.
    assert_eq!(
        trigger.manual_trigger("app", "bob").await.status,
        OperationStatus::Conflict
    );
    ctx.complete_stage(&instance.identifier, "build", JobResult::Passed)
        .await
        .unwrap();
    assert_eq!(
        trigger.manual_trigger("app", "bob").await.status,
        OperationStatus::Accepted
    );
}

#[tokio::test]
async fn test_manual_trigger_checks_permission() {
    let ctx = TestContext::with_pipelines(vec![PipelineFixture::simple("app")])
        .await
        .expect("Failed to create context");
    ctx.permissions.deny("mallory");

    let result = ctx.scheduler.trigger.manual_trigger("app", "mallory").await;

    assert_eq!(result.status, OperationStatus::Forbidden);
    assert!(!ctx.scheduler.schedule_queue.is_queued("app").await);
}

#[tokio::test]
async fn test_low_disk_space_stops_scheduling() {
    let ctx = TestContext::with_pipelines(vec![PipelineFixture::simple("app")])
        .await
        .expect("Failed to create context");
    ctx.disk.set(1024);
    ctx.scheduler
        .schedule_queue
        .schedule("app", BuildCause::forced_by("alice", vec![]))
        .await;

    let scheduled = ctx
        .scheduler
        .stages
        .auto_schedule_pipelines_from_request_buffer()
        .await;

    assert!(scheduled.is_empty());
    assert!(ctx.health.has_scope(&HealthScope::DiskSpace).await);
    assert!(ctx.scheduler.schedule_queue.is_queued("app").await);

    ctx.disk.set(u64::MAX);
    let scheduled = ctx
        .scheduler
        .stages
        .auto_schedule_pipelines_from_request_buffer()
        .await;
    assert_eq!(scheduled.len(), 1);
    assert!(!ctx.health.has_scope(&HealthScope::DiskSpace).await);
}

#[tokio::test]
async fn test_pause_is_not_reentrant() {
    let ctx = TestContext::with_pipelines(vec![PipelineFixture::simple("release")])
        .await
        .expect("Failed to create context");
    let state = &ctx.scheduler.pipeline_state;

    assert_eq!(
        state.unpause("release", "alice").await.status,
        OperationStatus::Conflict
    );
    assert_eq!(
        state.pause("release", Some("freeze"), "alice").await.status,
        OperationStatus::Ok
    );
    let before = state.pause_info("release").await.unwrap().unwrap();

    ctx.clock.advance(chrono::Duration::minutes(10));
    let again = state.pause("release", Some("different"), "bob").await;
    assert_eq!(again.status, OperationStatus::Conflict);
    assert_eq!(state.pause_info("release").await.unwrap().unwrap(), before);

    assert_eq!(
        state.unpause("release", "alice").await.status,
        OperationStatus::Ok
    );
    assert!(!state.is_paused("release").await.unwrap());
}

#[tokio::test]
async fn test_simultaneous_pauses_have_one_winner() {
    let ctx = TestContext::with_pipelines(vec![PipelineFixture::simple("p1")])
        .await
        .expect("Failed to create context");

    let first = tokio::spawn({
        let scheduler = ctx.scheduler.clone();
        async move { scheduler.pipeline_state.pause("p1", Some("one"), "alice").await }
    });
    let second = tokio::spawn({
        let scheduler = ctx.scheduler.clone();
        async move { scheduler.pipeline_state.pause("p1", Some("two"), "bob").await }
    });
    let results = [first.await.unwrap(), second.await.unwrap()];

    let winners: Vec<_> = results
        .iter()
        .filter(|r| r.status == OperationStatus::Ok)
        .collect();
    assert_eq!(winners.len(), 1);
    assert!(winners[0].message.contains("paused successfully"));
    assert_eq!(
        results
            .iter()
            .filter(|r| r.status == OperationStatus::Conflict)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_paused_pipeline_does_not_continue_to_next_stage() {
    let ctx = TestContext::with_pipelines(vec![PipelineFixture::two_stage(
        "app",
        Approval::automatic(),
    )])
    .await
    .expect("Failed to create context");
    let pipeline = ctx.trigger("app").await.unwrap();
    ctx.scheduler
        .pipeline_state
        .pause("app", None, "alice")
        .await;

    ctx.complete_stage(&pipeline, "build", JobResult::Passed)
        .await
        .unwrap();

    assert!(ctx.stage(&pipeline, "test").await.unwrap().is_none());
}
