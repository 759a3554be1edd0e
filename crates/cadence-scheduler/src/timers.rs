//! Background loops driving the scheduler.

use crate::scheduler::Scheduler;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{debug, error, info};

/// Handles of the spawned loops. All of them stop once the shutdown
/// channel flips to `true`.
pub struct SchedulerTimers {
    handles: Vec<JoinHandle<()>>,
}

impl SchedulerTimers {
    pub fn spawn(scheduler: Arc<Scheduler>, shutdown: watch::Receiver<bool>) -> Self {
        let config = scheduler.ctx.config.clone();
        let mut handles = Vec::new();

        handles.push(every(
            "job-plan-reload",
            config.job_plan_reload_interval(),
            shutdown.clone(),
            {
                let scheduler = scheduler.clone();
                move || {
                    let scheduler = scheduler.clone();
                    async move { scheduler.dispatcher.on_timer().await }
                }
            },
        ));

        handles.push(every(
            "auto-schedule",
            config.auto_schedule_interval(),
            shutdown.clone(),
            {
                let scheduler = scheduler.clone();
                move || {
                    let scheduler = scheduler.clone();
                    async move {
                        let scheduled = scheduler
                            .stages
                            .auto_schedule_pipelines_from_request_buffer()
                            .await;
                        if !scheduled.is_empty() {
                            debug!(count = scheduled.len(), "Scheduled pipelines from buffer");
                        }
                    }
                }
            },
        ));

        handles.push(every(
            "schedule-check",
            config.schedule_check_interval(),
            shutdown.clone(),
            {
                let scheduler = scheduler.clone();
                move || {
                    let scheduler = scheduler.clone();
                    async move {
                        scheduler.trigger.check_for_changes().await;
                    }
                }
            },
        ));

        handles.push(tokio::spawn({
            let scheduler = scheduler.clone();
            let shutdown = shutdown.clone();
            async move { scheduler.trigger.run_worker(shutdown).await }
        }));
        handles.push(tokio::spawn({
            let scheduler = scheduler.clone();
            let shutdown = shutdown.clone();
            async move { scheduler.trigger.run_completion_listener(shutdown).await }
        }));
        handles.push(tokio::spawn({
            let queue = scheduler.elastic.queue();
            let shutdown = shutdown.clone();
            async move { queue.run(shutdown).await }
        }));

        handles.push(every(
            "elastic-heartbeat",
            config.elastic_heartbeat_interval(),
            shutdown.clone(),
            {
                let scheduler = scheduler.clone();
                move || {
                    let scheduler = scheduler.clone();
                    async move { scheduler.elastic.heartbeat().await }
                }
            },
        ));

        handles.push(every(
            "hang-check",
            config.hang_check_interval(),
            shutdown.clone(),
            {
                let scheduler = scheduler.clone();
                move || {
                    let scheduler = scheduler.clone();
                    async move {
                        scheduler.hang.cancel_unresponsive_jobs().await;
                    }
                }
            },
        ));

        handles.push(every(
            "hung-jobs",
            config.hung_job_check_interval(),
            shutdown,
            move || {
                let scheduler = scheduler.clone();
                async move {
                    scheduler.registry.refresh().await;
                    if let Err(e) = scheduler.stages.reschedule_hung_jobs().await {
                        error!(error = %e, "Failed to reschedule hung jobs");
                    }
                }
            },
        ));

        info!(loops = handles.len(), "Scheduler timers started");
        Self { handles }
    }

    /// Wait for every loop to finish.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduler loop panicked");
            }
        }
    }
}

fn every<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(timer = name, period_ms = period.as_millis() as u64, "Starting timer");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(timer = name, "Timer shutting down");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestPorts, simple_pipeline};

    #[tokio::test]
    async fn test_timers_stop_on_shutdown() {
        let ports = TestPorts::new();
        ports.set_pipelines(vec![simple_pipeline("app")]).await;
        let scheduler = Arc::new(ports.scheduler());
        scheduler.start().await.unwrap();

        let (tx, rx) = watch::channel(false);
        let timers = SchedulerTimers::spawn(scheduler, rx);
        tokio::task::yield_now().await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), timers.join())
            .await
            .unwrap();
    }
}
