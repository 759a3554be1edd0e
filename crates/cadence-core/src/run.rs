//! Pipeline, stage and job instances.

use crate::config::ApprovalKind;
use crate::ids::{AgentId, JobIdentifier, PipelineId, PipelineIdentifier, StageId, StageIdentifier};
use crate::material::BuildCause;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Assigned,
    Preparing,
    Building,
    Completing,
    Completed,
    Rescheduled,
}

impl JobState {
    pub fn is_active(&self) -> bool {
        !matches!(self, JobState::Completed | JobState::Rescheduled)
    }

    /// States in which an agent holds the job.
    pub fn is_on_agent(&self) -> bool {
        matches!(
            self,
            JobState::Assigned | JobState::Preparing | JobState::Building | JobState::Completing
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobResult {
    Unknown,
    Passed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstance {
    pub identifier: JobIdentifier,
    pub state: JobState,
    pub result: JobResult,
    pub agent_id: Option<AgentId>,
    /// Rescheduled copies are kept for history but no longer count.
    pub ignored: bool,
    /// Carried over unchanged from a previous run of the stage.
    pub copied: bool,
    pub scheduled_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobInstance {
    pub fn scheduled(identifier: JobIdentifier, now: DateTime<Utc>) -> Self {
        Self {
            identifier,
            state: JobState::Scheduled,
            result: JobResult::Unknown,
            agent_id: None,
            ignored: false,
            copied: false,
            scheduled_at: now,
            assigned_at: None,
            completed_at: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.identifier.job_name
    }

    pub fn is_completed(&self) -> bool {
        self.state == JobState::Completed
    }

    pub fn is_active(&self) -> bool {
        !self.ignored && self.state.is_active()
    }

    pub fn is_assigned_to(&self, agent_id: AgentId) -> bool {
        self.agent_id == Some(agent_id)
    }

    pub fn assign(&mut self, agent_id: AgentId, now: DateTime<Utc>) {
        self.agent_id = Some(agent_id);
        self.state = JobState::Assigned;
        self.assigned_at = Some(now);
    }

    pub fn change_state(&mut self, state: JobState, now: DateTime<Utc>) {
        self.state = state;
        if state == JobState::Completed {
            self.completed_at = Some(now);
            if self.result == JobResult::Unknown {
                self.result = JobResult::Passed;
            }
        }
    }

    pub fn complete(&mut self, result: JobResult, now: DateTime<Utc>) {
        self.result = result;
        self.state = JobState::Completed;
        self.completed_at = Some(now);
    }

    /// Returns false when the job had already completed.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_completed() {
            return false;
        }
        self.complete(JobResult::Cancelled, now);
        true
    }

    /// Returns false when the job had already completed.
    pub fn fail(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_completed() {
            return false;
        }
        self.complete(JobResult::Failed, now);
        true
    }

    pub fn reschedule(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Rescheduled;
        self.ignored = true;
        self.completed_at = Some(now);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageResult {
    Unknown,
    Passed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Building,
    Passed,
    Failed,
    Cancelled,
}

impl StageState {
    pub fn is_active(&self) -> bool {
        matches!(self, StageState::Building)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInstance {
    pub id: StageId,
    pub pipeline_id: PipelineId,
    pub identifier: StageIdentifier,
    pub order: usize,
    pub approval: ApprovalKind,
    pub approved_by: String,
    pub jobs: Vec<JobInstance>,
    pub state: StageState,
    pub result: StageResult,
    /// False once the stage has been rerun.
    pub latest_run: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageInstance {
    pub fn name(&self) -> &str {
        &self.identifier.stage_name
    }

    pub fn pipeline_identifier(&self) -> PipelineIdentifier {
        self.identifier.pipeline()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_completed(&self) -> bool {
        !self.is_active()
    }

    pub fn passed(&self) -> bool {
        self.result == StageResult::Passed
    }

    pub fn counted_jobs(&self) -> impl Iterator<Item = &JobInstance> {
        self.jobs.iter().filter(|j| !j.ignored)
    }

    pub fn job(&self, name: &str) -> Option<&JobInstance> {
        self.counted_jobs().find(|j| j.name() == name)
    }

    pub fn job_mut(&mut self, name: &str) -> Option<&mut JobInstance> {
        self.jobs.iter_mut().find(|j| !j.ignored && j.name() == name)
    }

    /// Result derived from the jobs that still count.
    pub fn calculate_result(&self) -> StageResult {
        let mut any_failed = false;
        let mut any_cancelled = false;
        for job in self.counted_jobs() {
            if !job.is_completed() {
                return StageResult::Unknown;
            }
            match job.result {
                JobResult::Failed => any_failed = true,
                JobResult::Cancelled => any_cancelled = true,
                JobResult::Passed | JobResult::Unknown => {}
            }
        }
        if any_failed {
            StageResult::Failed
        } else if any_cancelled {
            StageResult::Cancelled
        } else {
            StageResult::Passed
        }
    }

    /// Recompute result and state. Returns true when the stage just completed.
    pub fn update_result(&mut self, now: DateTime<Utc>) -> bool {
        let was_active = self.is_active();
        self.result = self.calculate_result();
        self.state = match self.result {
            StageResult::Unknown => StageState::Building,
            StageResult::Passed => StageState::Passed,
            StageResult::Failed => StageState::Failed,
            StageResult::Cancelled => StageState::Cancelled,
        };
        if was_active && !self.is_active() {
            self.completed_at = Some(now);
            return true;
        }
        false
    }

    pub fn failed_job_names(&self) -> Vec<String> {
        self.counted_jobs()
            .filter(|j| matches!(j.result, JobResult::Failed | JobResult::Cancelled))
            .map(|j| j.name().to_string())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineInstance {
    pub id: PipelineId,
    pub identifier: PipelineIdentifier,
    pub build_cause: BuildCause,
    pub created_at: DateTime<Utc>,
}

impl PipelineInstance {
    pub fn name(&self) -> &str {
        &self.identifier.name
    }

    pub fn counter(&self) -> u32 {
        self.identifier.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::JobId;
    use pretty_assertions::assert_eq;

    fn stage_with_jobs(names: &[&str]) -> StageInstance {
        let now = Utc::now();
        let pipeline = PipelineIdentifier::new("app", 1);
        let identifier = StageIdentifier::new(&pipeline, "build", 1);
        let jobs = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                JobInstance::scheduled(
                    JobIdentifier::new(identifier.clone(), *name, JobId::new(i as i64 + 1)),
                    now,
                )
            })
            .collect();
        StageInstance {
            id: StageId::new(1),
            pipeline_id: PipelineId::new(1),
            identifier,
            order: 0,
            approval: ApprovalKind::Success,
            approved_by: "changes".to_string(),
            jobs,
            state: StageState::Building,
            result: StageResult::Unknown,
            latest_run: true,
            created_at: now,
            completed_at: None,
        }
    }

    #[test]
    fn test_stage_result_waits_for_all_jobs() {
        let now = Utc::now();
        let mut stage = stage_with_jobs(&["a", "b"]);
        stage.job_mut("a").unwrap().complete(JobResult::Passed, now);

        assert!(!stage.update_result(now));
        assert_eq!(stage.result, StageResult::Unknown);
        assert!(stage.is_active());

        stage.job_mut("b").unwrap().complete(JobResult::Passed, now);
        assert!(stage.update_result(now));
        assert_eq!(stage.result, StageResult::Passed);
        assert_eq!(stage.state, StageState::Passed);
    }

    #[test]
    fn test_failed_beats_cancelled() {
        let now = Utc::now();
        let mut stage = stage_with_jobs(&["a", "b"]);
        stage.job_mut("a").unwrap().cancel(now);
        stage.job_mut("b").unwrap().fail(now);
        stage.update_result(now);

        assert_eq!(stage.result, StageResult::Failed);
        assert_eq!(stage.failed_job_names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_rescheduled_jobs_are_ignored() {
        let now = Utc::now();
        let mut stage = stage_with_jobs(&["a"]);
        stage.jobs[0].reschedule(now);

        assert!(stage.job("a").is_none());
        assert!(!stage.jobs[0].is_active());
        assert!(stage.update_result(now));
        assert_eq!(stage.result, StageResult::Passed);
    }

    #[test]
    fn test_cancel_completed_job_is_noop() {
        let now = Utc::now();
        let mut stage = stage_with_jobs(&["a"]);
        let job = stage.job_mut("a").unwrap();
        job.complete(JobResult::Passed, now);

        assert!(!job.cancel(now));
        assert_eq!(job.result, JobResult::Passed);
    }
}
