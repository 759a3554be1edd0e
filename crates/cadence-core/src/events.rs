//! Domain events published by the scheduler.

use crate::agent::AgentStatus;
use crate::ids::*;
use crate::run::{JobResult, JobState, StageResult, StageState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All events in the Cadence scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Job and stage lifecycle
    JobStatusChanged(JobStatusChangedPayload),
    StageStatusChanged(StageStatusChangedPayload),
    PipelineScheduled(PipelineScheduledPayload),

    // Agents
    AgentChanged(AgentChangedPayload),
    AgentDeleted(AgentDeletedPayload),

    // Pipeline pause and lock
    PipelinePaused(PipelinePausePayload),
    PipelineUnpaused(PipelinePausePayload),
    PipelineLocked(PipelineLockPayload),
    PipelineUnlocked(PipelineLockPayload),
}

impl Event {
    /// Dotted subject listeners can filter on.
    pub fn subject(&self) -> String {
        match self {
            Event::JobStatusChanged(p) => format!("job.{:?}.{}", p.state, p.job).to_lowercase(),
            Event::StageStatusChanged(p) => {
                format!("stage.{:?}.{}", p.state, p.stage).to_lowercase()
            }
            Event::PipelineScheduled(p) => format!("pipeline.scheduled.{}", p.pipeline),
            Event::AgentChanged(p) => format!("agent.changed.{}", p.agent_id),
            Event::AgentDeleted(p) => format!("agent.deleted.{}", p.agent_id),
            Event::PipelinePaused(p) => format!("pipeline.paused.{}", p.pipeline),
            Event::PipelineUnpaused(p) => format!("pipeline.unpaused.{}", p.pipeline),
            Event::PipelineLocked(p) => format!("pipeline.locked.{}", p.pipeline),
            Event::PipelineUnlocked(p) => format!("pipeline.unlocked.{}", p.pipeline),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusChangedPayload {
    pub job: JobIdentifier,
    pub state: JobState,
    pub result: JobResult,
    pub agent_id: Option<AgentId>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStatusChangedPayload {
    pub stage: StageIdentifier,
    pub state: StageState,
    pub result: StageResult,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineScheduledPayload {
    pub pipeline: PipelineIdentifier,
    pub cause: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentChangedPayload {
    pub agent_id: AgentId,
    pub status: AgentStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDeletedPayload {
    pub agent_id: AgentId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePausePayload {
    pub pipeline: String,
    pub by: String,
    pub cause: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineLockPayload {
    pub pipeline: PipelineIdentifier,
    pub timestamp: DateTime<Utc>,
}
