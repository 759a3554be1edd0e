//! Watchdog for jobs that stopped producing console output and for jobs
//! waiting too long for an agent.
//!
//! Both tracking maps are driven by job status events, so a completed job
//! never stays tracked.

use crate::context::SchedulerContext;
use crate::stages::StageScheduler;
use async_trait::async_trait;
use cadence_core::Result;
use cadence_core::config::JobTimeout;
use cadence_core::events::Event;
use cadence_core::health::{HealthScope, HealthState};
use cadence_core::ids::JobIdentifier;
use cadence_core::ports::EventListener;
use cadence_core::run::{JobInstance, JobState};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub struct HangMonitor {
    ctx: Arc<SchedulerContext>,
    stages: Arc<StageScheduler>,
    /// Last console activity per job running on an agent.
    activity: Mutex<HashMap<JobIdentifier, DateTime<Utc>>>,
    /// Scheduled time per job waiting for an agent.
    waiting: Mutex<HashMap<JobIdentifier, DateTime<Utc>>>,
}

impl HangMonitor {
    pub fn new(ctx: Arc<SchedulerContext>, stages: Arc<StageScheduler>) -> Self {
        Self {
            ctx,
            stages,
            activity: Mutex::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
        }
    }

    /// Start tracking every job that is active right now.
    pub async fn initialize(&self) -> Result<()> {
        let jobs = self.ctx.jobs.active_jobs().await?;
        self.populate_from(&jobs).await;
        Ok(())
    }

    pub async fn populate_from(&self, jobs: &[JobInstance]) {
        let now = self.ctx.now();
        let mut activity = self.activity.lock().await;
        let mut waiting = self.waiting.lock().await;
        for job in jobs.iter().filter(|j| j.is_active()) {
            if job.state.is_on_agent() {
                activity.insert(job.identifier.clone(), now);
            } else {
                waiting.insert(job.identifier.clone(), job.scheduled_at);
            }
        }
        debug!(
            building = activity.len(),
            waiting = waiting.len(),
            "Hang monitor populated"
        );
    }

    /// The agent wrote console output for `job`.
    pub async fn console_updated_for(&self, job: &JobIdentifier) {
        let now = self.ctx.now();
        if let Some(last) = self.activity.lock().await.get_mut(job) {
            *last = now;
        }
    }

    pub async fn tracked_building(&self) -> Vec<JobIdentifier> {
        self.activity.lock().await.keys().cloned().collect()
    }

    pub async fn tracked_waiting(&self) -> Vec<JobIdentifier> {
        self.waiting.lock().await.keys().cloned().collect()
    }

    /// Warn about quiet jobs and cancel the ones past their timeout.
    /// Returns the jobs cancelled.
    pub async fn cancel_unresponsive_jobs(&self) -> Vec<JobIdentifier> {
        let now = self.ctx.now();
        let config = self.ctx.config_repo.current().await;
        let warning = self.ctx.config.unresponsive_job_warning();
        let building: Vec<(JobIdentifier, DateTime<Utc>)> = self
            .activity
            .lock()
            .await
            .iter()
            .map(|(job, at)| (job.clone(), *at))
            .collect();

        let mut cancelled = Vec::new();
        for (job, last) in building {
            let quiet = now - last;
            let timeout = config
                .job(job.pipeline_name(), job.stage_name(), &job.job_name)
                .map(|j| j.timeout)
                .unwrap_or_default();
            let scope = HealthScope::Job(job.to_string());

            match self.timeout_for(timeout) {
                Some(limit) if quiet >= limit => {
                    info!(job = %job, quiet_minutes = quiet.num_minutes(), "Cancelling hung job");
                    match self.stages.cancel_job(&job).await {
                        Ok(true) => {
                            self.ctx
                                .console_note(
                                    &job,
                                    &format!(
                                        "Job was cancelled because it produced no console output for {} minutes.",
                                        limit.num_minutes()
                                    ),
                                )
                                .await;
                            cancelled.push(job.clone());
                        }
                        Ok(false) => debug!(job = %job, "Hung job had already completed"),
                        Err(e) if e.is_not_found() => {
                            warn!(job = %job, error = %e, "Hung job no longer exists; untracking");
                        }
                        Err(e) => {
                            error!(job = %job, error = %e, "Failed to cancel hung job");
                            continue;
                        }
                    }
                    self.activity.lock().await.remove(&job);
                    self.ctx.health.remove_by_scope(&scope).await;
                }
                _ if quiet >= warning => {
                    warn!(job = %job, quiet_minutes = quiet.num_minutes(), "Job looks hung");
                    self.ctx
                        .health
                        .update(HealthState::warning(
                            scope,
                            format!("Job '{job}' is not responding"),
                            format!(
                                "Job '{job}' has produced no console output for {} minutes.",
                                quiet.num_minutes()
                            ),
                        ))
                        .await;
                }
                _ => self.ctx.health.remove_by_scope(&scope).await,
            }
        }

        self.warn_waiting_jobs(now).await;
        cancelled
    }

    fn timeout_for(&self, timeout: JobTimeout) -> Option<Duration> {
        let minutes = match timeout {
            JobTimeout::Never => None,
            JobTimeout::Minutes(minutes) => Some(u64::from(minutes)),
            JobTimeout::Default => self.ctx.config.default_job_timeout_minutes,
        }?;
        i64::try_from(minutes).ok().map(Duration::minutes)
    }

    async fn warn_waiting_jobs(&self, now: DateTime<Utc>) {
        let threshold = self.ctx.config.scheduled_job_warning();
        let waiting: Vec<(JobIdentifier, DateTime<Utc>)> = self
            .waiting
            .lock()
            .await
            .iter()
            .map(|(job, at)| (job.clone(), *at))
            .collect();
        for (job, scheduled_at) in waiting {
            let waited = now - scheduled_at;
            if waited < threshold {
                continue;
            }
            self.ctx
                .health
                .update(HealthState::warning(
                    HealthScope::Job(job.to_string()),
                    format!("Job '{job}' is waiting for an agent"),
                    format!(
                        "Job '{job}' has been scheduled for {} minutes without a matching agent.",
                        waited.num_minutes()
                    ),
                ))
                .await;
        }
    }

    async fn track(&self, job: &JobIdentifier, state: JobState, at: DateTime<Utc>) {
        match state {
            JobState::Scheduled => {
                self.waiting.lock().await.insert(job.clone(), at);
            }
            JobState::Assigned
            | JobState::Preparing
            | JobState::Building
            | JobState::Completing => {
                self.waiting.lock().await.remove(job);
                self.activity.lock().await.entry(job.clone()).or_insert(at);
                self.ctx
                    .health
                    .remove_by_scope(&HealthScope::Job(job.to_string()))
                    .await;
            }
            JobState::Completed | JobState::Rescheduled => {
                self.waiting.lock().await.remove(job);
                self.activity.lock().await.remove(job);
                self.ctx
                    .health
                    .remove_by_scope(&HealthScope::Job(job.to_string()))
                    .await;
            }
        }
    }
}

#[async_trait]
impl EventListener for HangMonitor {
    async fn on_event(&self, event: &Event) -> Result<()> {
        if let Event::JobStatusChanged(payload) = event {
            self.track(&payload.job, payload.state, payload.timestamp).await;
        }
        Ok(())
    }
}
