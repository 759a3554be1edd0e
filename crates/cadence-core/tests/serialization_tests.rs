//! Serialization tests for cadence-core types.

use cadence_core::config::*;
use cadence_core::events::*;
use cadence_core::ids::*;
use cadence_core::job::Work;
use cadence_core::run::*;
use chrono::Utc;
use pretty_assertions::assert_eq;

fn job_identifier() -> JobIdentifier {
    let pipeline = PipelineIdentifier::new("app", 3);
    JobIdentifier::new(StageIdentifier::new(&pipeline, "build", 1), "compile", JobId::new(9))
}

#[test]
fn test_job_status_event_is_tagged() {
    let event = Event::JobStatusChanged(JobStatusChangedPayload {
        job: job_identifier(),
        state: JobState::Assigned,
        result: JobResult::Unknown,
        agent_id: None,
        timestamp: Utc::now(),
    });

    let json = serde_json::to_value(&event).expect("serialize");
    assert_eq!(json["type"], "job_status_changed");
    assert_eq!(json["state"], "assigned");

    let parsed: Event = serde_json::from_value(json).expect("deserialize");
    assert_eq!(parsed, event);
    assert_eq!(event.subject(), "job.assigned.app/3/build/1/compile");
}

#[test]
fn test_pipeline_config_defaults() {
    let json = r#"{
        "name": "app",
        "group": "web",
        "stages": [
            {
                "name": "build",
                "jobs": [{ "name": "compile", "resources": ["linux"] }]
            },
            {
                "name": "deploy",
                "approval": { "kind": "manual" },
                "jobs": [{ "name": "ship", "timeout": { "minutes": 15 } }]
            }
        ]
    }"#;

    let config: PipelineConfig = serde_json::from_str(json).expect("deserialize");
    assert_eq!(config.lock_behavior, LockBehavior::None);
    assert!(!config.stages[0].requires_approval());
    assert!(config.stages[1].requires_approval());
    assert_eq!(config.stages[0].jobs[0].timeout, JobTimeout::Default);
    assert_eq!(config.stages[1].jobs[0].timeout, JobTimeout::Minutes(15));
    assert!(config.stages[0].jobs[0].resources.contains("linux"));
}

#[test]
fn test_work_sentinels_serialize() {
    let agent_id = AgentId::new();
    let json = serde_json::to_value(Work::DeniedAgentWork { agent_id }).expect("serialize");
    assert_eq!(json["type"], "denied_agent_work");

    let json = serde_json::to_value(Work::NoWork).expect("serialize");
    assert_eq!(json["type"], "no_work");
}
