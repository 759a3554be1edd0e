//! Pipeline schedule queue and the auto-trigger loop feeding it.
//!
//! The timer posts every IDLE pipeline to the schedule-check channel and
//! flips it to BUSY. A worker asks the [`BuildCauseProducer`] whether the
//! pipeline has something new to build, queues the cause, and posts a
//! completion that flips the pipeline back to IDLE.
//!
//! [`BuildCauseProducer`]: cadence_core::ports::BuildCauseProducer

use crate::checkers::SchedulingCheckers;
use crate::context::SchedulerContext;
use cadence_core::Result;
use cadence_core::ids::PipelineIdentifier;
use cadence_core::material::BuildCause;
use cadence_core::result::OperationResult;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info, warn};

/// Pipelines a user has asked to trigger that are not scheduled yet.
#[derive(Debug, Default)]
pub struct TriggerMonitor {
    triggered: Mutex<HashSet<String>>,
}

impl TriggerMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the pipeline was already marked.
    pub async fn mark_triggered(&self, pipeline: &str) -> bool {
        self.triggered.lock().await.insert(pipeline.to_string())
    }

    pub async fn is_already_triggered(&self, pipeline: &str) -> bool {
        self.triggered.lock().await.contains(pipeline)
    }

    pub async fn clear(&self, pipeline: &str) {
        self.triggered.lock().await.remove(pipeline);
    }
}

/// Build causes waiting to become pipeline instances.
pub struct PipelineScheduleQueue {
    to_be_scheduled: Mutex<BTreeMap<String, BuildCause>>,
    most_recent: Mutex<HashMap<String, BuildCause>>,
    trigger_monitor: Arc<TriggerMonitor>,
}

impl PipelineScheduleQueue {
    pub fn new(trigger_monitor: Arc<TriggerMonitor>) -> Self {
        Self {
            to_be_scheduled: Mutex::new(BTreeMap::new()),
            most_recent: Mutex::new(HashMap::new()),
            trigger_monitor,
        }
    }

    /// Queue a cause. A forced cause replaces a queued one; otherwise the
    /// first cause queued wins.
    pub async fn schedule(&self, pipeline: &str, cause: BuildCause) {
        let mut queue = self.to_be_scheduled.lock().await;
        if cause.forced || !queue.contains_key(pipeline) {
            debug!(pipeline, forced = cause.forced, "Build cause queued");
            queue.insert(pipeline.to_string(), cause);
        }
    }

    /// Snapshot of queued causes, by pipeline name.
    pub async fn to_be_scheduled(&self) -> Vec<(String, BuildCause)> {
        self.to_be_scheduled
            .lock()
            .await
            .iter()
            .map(|(name, cause)| (name.clone(), cause.clone()))
            .collect()
    }

    pub async fn is_queued(&self, pipeline: &str) -> bool {
        self.to_be_scheduled.lock().await.contains_key(pipeline)
    }

    /// Drop the queued cause without scheduling it.
    pub async fn clear_pipeline(&self, pipeline: &str) {
        self.to_be_scheduled.lock().await.remove(pipeline);
        self.trigger_monitor.clear(pipeline).await;
    }

    /// Record that `cause` became `instance`.
    pub async fn finish_schedule(
        &self,
        pipeline: &str,
        cause: &BuildCause,
        instance: &PipelineIdentifier,
    ) {
        self.to_be_scheduled.lock().await.remove(pipeline);
        self.most_recent
            .lock()
            .await
            .insert(pipeline.to_string(), cause.clone());
        self.trigger_monitor.clear(pipeline).await;
        debug!(pipeline = %instance, "Build cause scheduled");
    }

    pub async fn most_recent_scheduled(&self, pipeline: &str) -> Option<BuildCause> {
        self.most_recent.lock().await.get(pipeline).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleCheckState {
    Idle,
    Busy,
}

/// IDLE/BUSY flag per pipeline.
#[derive(Debug, Default)]
pub struct ScheduleCheckStates {
    states: Mutex<HashMap<String, ScheduleCheckState>>,
}

impl ScheduleCheckStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip an IDLE pipeline to BUSY. Returns false when it was BUSY.
    pub async fn try_mark_busy(&self, pipeline: &str) -> bool {
        let mut states = self.states.lock().await;
        let state = states
            .entry(pipeline.to_string())
            .or_insert(ScheduleCheckState::Idle);
        if *state == ScheduleCheckState::Busy {
            return false;
        }
        *state = ScheduleCheckState::Busy;
        true
    }

    pub async fn mark_idle(&self, pipeline: &str) {
        self.states
            .lock()
            .await
            .insert(pipeline.to_string(), ScheduleCheckState::Idle);
    }

    /// Forget pipelines that are no longer configured.
    pub async fn retain_configured(&self, pipelines: &[String]) {
        self.states
            .lock()
            .await
            .retain(|name, _| pipelines.contains(name));
    }

    /// Pipelines with a recorded state, sorted.
    pub async fn tracked(&self) -> Vec<String> {
        let mut names: Vec<String> = self.states.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn state(&self, pipeline: &str) -> ScheduleCheckState {
        self.states
            .lock()
            .await
            .get(pipeline)
            .copied()
            .unwrap_or(ScheduleCheckState::Idle)
    }
}

/// Looks for new build causes and accepts manual triggers.
pub struct PipelineTriggerService {
    ctx: Arc<SchedulerContext>,
    queue: Arc<PipelineScheduleQueue>,
    states: Arc<ScheduleCheckStates>,
    checkers: Arc<SchedulingCheckers>,
    trigger_monitor: Arc<TriggerMonitor>,
    requests_tx: mpsc::UnboundedSender<String>,
    requests_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    completions_tx: mpsc::UnboundedSender<String>,
    completions_rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl PipelineTriggerService {
    pub fn new(
        ctx: Arc<SchedulerContext>,
        queue: Arc<PipelineScheduleQueue>,
        checkers: Arc<SchedulingCheckers>,
        trigger_monitor: Arc<TriggerMonitor>,
    ) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            queue,
            states: Arc::new(ScheduleCheckStates::new()),
            checkers,
            trigger_monitor,
            requests_tx,
            requests_rx: Mutex::new(requests_rx),
            completions_tx,
            completions_rx: Mutex::new(completions_rx),
        }
    }

    pub fn states(&self) -> Arc<ScheduleCheckStates> {
        self.states.clone()
    }

    /// Post every IDLE pipeline for a schedule check. Returns the pipelines
    /// posted.
    pub async fn check_for_changes(&self) -> Vec<String> {
        let config = self.ctx.config_repo.current().await;
        let names = config.pipeline_names();
        self.states.retain_configured(&names).await;
        let mut posted = Vec::new();
        for name in names {
            if !self.states.try_mark_busy(&name).await {
                debug!(pipeline = %name, "Schedule check still in progress");
                continue;
            }
            if self.requests_tx.send(name.clone()).is_err() {
                self.states.mark_idle(&name).await;
                warn!(pipeline = %name, "Schedule check channel closed");
                continue;
            }
            posted.push(name);
        }
        posted
    }

    /// Evaluate one pipeline for a new build cause and queue it.
    pub async fn check_pipeline(&self, pipeline: &str) -> Result<Option<BuildCause>> {
        let config = self.ctx.config_repo.current().await;
        let pipeline_config = config.pipeline_or_err(pipeline)?;

        let verdict = self.checkers.can_auto_trigger_consumer(pipeline_config).await;
        if !verdict.can_continue() {
            debug!(pipeline, reason = %verdict.message, "Skipping schedule check");
            return Ok(None);
        }

        let previous = self.queue.most_recent_scheduled(pipeline).await;
        let cause = self
            .ctx
            .build_causes
            .produce(pipeline_config, previous.as_ref())
            .await?;
        if let Some(cause) = &cause {
            info!(pipeline, cause = %cause.describe(), "Found changes for pipeline");
            self.queue.schedule(pipeline, cause.clone()).await;
        }
        Ok(cause)
    }

    /// Handle at most the requests queued right now. Used by the worker and
    /// by callers that drive the loop by hand.
    pub async fn process_pending(&self) -> usize {
        let mut requests = Vec::new();
        {
            let mut rx = self.requests_rx.lock().await;
            while let Ok(name) = rx.try_recv() {
                requests.push(name);
            }
        }
        for name in &requests {
            self.process(name).await;
        }
        self.drain_completions().await;
        requests.len()
    }

    async fn process(&self, pipeline: &str) {
        if let Err(e) = self.check_pipeline(pipeline).await {
            error!(pipeline, error = %e, "Schedule check failed");
        }
        if self.completions_tx.send(pipeline.to_string()).is_err() {
            self.states.mark_idle(pipeline).await;
        }
    }

    async fn drain_completions(&self) {
        let mut rx = self.completions_rx.lock().await;
        while let Ok(name) = rx.try_recv() {
            self.states.mark_idle(&name).await;
        }
    }

    /// Run the schedule-check worker until shutdown.
    pub async fn run_worker(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting schedule check worker");
        let mut rx = self.requests_rx.lock().await;
        loop {
            tokio::select! {
                request = rx.recv() => {
                    match request {
                        Some(name) => self.process(&name).await,
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Schedule check worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Mark pipelines IDLE as their checks complete, until shutdown.
    pub async fn run_completion_listener(&self, mut shutdown: watch::Receiver<bool>) {
        let mut rx = self.completions_rx.lock().await;
        loop {
            tokio::select! {
                completed = rx.recv() => {
                    match completed {
                        Some(name) => self.states.mark_idle(&name).await,
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Queue a forced build cause for `pipeline` on behalf of `user`.
    pub async fn manual_trigger(&self, pipeline: &str, user: &str) -> OperationResult {
        let mut result = OperationResult::new();
        let config = self.ctx.config_repo.current().await;
        let Some(pipeline_config) = config.pipeline(pipeline) else {
            result.not_found(format!("Pipeline '{pipeline}' not found."));
            return result;
        };

        let verdict = self.checkers.can_manually_trigger(pipeline_config, user).await;
        if !verdict.can_continue() {
            return verdict;
        }
        if !self.trigger_monitor.mark_triggered(pipeline).await {
            result.conflict(format!(
                "Failed to trigger pipeline: {pipeline}. It is already triggered."
            ));
            return result;
        }

        let previous = self.queue.most_recent_scheduled(pipeline).await;
        let revisions = match self
            .ctx
            .build_causes
            .produce(pipeline_config, previous.as_ref())
            .await
        {
            Ok(Some(cause)) => cause.revisions,
            Ok(None) => previous.map(|c| c.revisions).unwrap_or_default(),
            Err(e) => {
                self.trigger_monitor.clear(pipeline).await;
                error!(pipeline, error = %e, "Failed to update materials for manual trigger");
                result.internal_error(format!(
                    "Failed to trigger pipeline: {pipeline}. Could not update materials: {e}"
                ));
                return result;
            }
        };

        self.queue
            .schedule(pipeline, BuildCause::forced_by(user, revisions))
            .await;
        info!(pipeline, user, "Pipeline manually triggered");
        result.accepted(format!("Request to schedule pipeline {pipeline} accepted"));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pause::PipelineStateService;
    use crate::test_support::{TestPorts, simple_pipeline};
    use cadence_core::result::OperationStatus;

    fn service(ports: &TestPorts) -> (PipelineTriggerService, Arc<PipelineScheduleQueue>) {
        let ctx = ports.context();
        let monitor = Arc::new(TriggerMonitor::new());
        let queue = Arc::new(PipelineScheduleQueue::new(monitor.clone()));
        let checkers = Arc::new(SchedulingCheckers::new(
            ctx.clone(),
            Arc::new(PipelineStateService::new(ctx.clone())),
            monitor.clone(),
        ));
        (
            PipelineTriggerService::new(ctx, queue.clone(), checkers, monitor),
            queue,
        )
    }

    #[tokio::test]
    async fn test_busy_pipeline_is_not_posted_twice() {
        let ports = TestPorts::new();
        ports.set_pipelines(vec![simple_pipeline("app")]).await;
        let (service, _) = service(&ports);

        assert_eq!(service.check_for_changes().await, vec!["app".to_string()]);
        assert!(service.check_for_changes().await.is_empty());
        assert_eq!(service.states().state("app").await, ScheduleCheckState::Busy);

        assert_eq!(service.process_pending().await, 1);
        assert_eq!(service.states().state("app").await, ScheduleCheckState::Idle);
        assert_eq!(service.check_for_changes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_removed_pipeline_state_is_forgotten() {
        let ports = TestPorts::new();
        ports
            .set_pipelines(vec![simple_pipeline("app"), simple_pipeline("lib")])
            .await;
        let (service, _) = service(&ports);
        service.check_for_changes().await;
        service.process_pending().await;
        assert_eq!(service.states().tracked().await, vec!["app", "lib"]);

        ports.set_pipelines(vec![simple_pipeline("app")]).await;
        assert_eq!(service.check_for_changes().await, vec!["app".to_string()]);

        assert_eq!(service.states().tracked().await, vec!["app"]);
    }

    #[tokio::test]
    async fn test_changes_are_queued() {
        let ports = TestPorts::new();
        ports.set_pipelines(vec![simple_pipeline("app")]).await;
        ports.build_causes.push_changes("app", "rev-1");
        let (service, queue) = service(&ports);

        service.check_for_changes().await;
        service.process_pending().await;

        let queued = queue.to_be_scheduled().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].0, "app");
        assert!(!queued[0].1.forced);
    }

    #[tokio::test]
    async fn test_paused_pipeline_is_not_checked() {
        let ports = TestPorts::new();
        ports.set_pipelines(vec![simple_pipeline("release")]).await;
        ports.build_causes.push_changes("release", "rev-1");
        ports.store.set_paused("release", "alice").await;
        let (service, queue) = service(&ports);

        assert!(service.check_pipeline("release").await.unwrap().is_none());
        assert!(!queue.is_queued("release").await);
    }

    #[tokio::test]
    async fn test_manual_trigger_dedupes() {
        let ports = TestPorts::new();
        ports.set_pipelines(vec![simple_pipeline("app")]).await;
        let (service, queue) = service(&ports);

        let first = service.manual_trigger("app", "alice").await;
        assert_eq!(first.status, OperationStatus::Accepted);
        let second = service.manual_trigger("app", "alice").await;
        assert_eq!(second.status, OperationStatus::Conflict);

        let queued = queue.to_be_scheduled().await;
        assert!(queued[0].1.forced);
        assert_eq!(queued[0].1.approver, "alice");

        queue.clear_pipeline("app").await;
        assert_eq!(
            service.manual_trigger("app", "alice").await.status,
            OperationStatus::Accepted
        );
    }

    #[tokio::test]
    async fn test_forced_cause_replaces_queued_cause() {
        let queue = PipelineScheduleQueue::new(Arc::new(TriggerMonitor::new()));
        queue.schedule("app", BuildCause::from_modifications(vec![])).await;
        queue.schedule("app", BuildCause::from_modifications(vec![])).await;
        queue.schedule("app", BuildCause::forced_by("bob", vec![])).await;

        let queued = queue.to_be_scheduled().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].1.approver, "bob");
    }
}
