//! The scheduler service graph.

use crate::agents::AgentRegistry;
use crate::checkers::SchedulingCheckers;
use crate::context::SchedulerContext;
use crate::dispatcher::AssignmentDispatcher;
use crate::elastic::{ElasticAgentOrchestrator, ElasticAgentQueue};
use crate::hang::HangMonitor;
use crate::pause::PipelineStateService;
use crate::pool::JobPlanPool;
use crate::queue::{PipelineScheduleQueue, PipelineTriggerService, TriggerMonitor};
use crate::stages::StageScheduler;
use crate::timers::SchedulerTimers;
use cadence_core::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Every scheduling service, wired over one [`SchedulerContext`].
pub struct Scheduler {
    pub ctx: Arc<SchedulerContext>,
    pub registry: Arc<AgentRegistry>,
    pub pool: Arc<JobPlanPool>,
    pub pipeline_state: Arc<PipelineStateService>,
    pub trigger_monitor: Arc<TriggerMonitor>,
    pub checkers: Arc<SchedulingCheckers>,
    pub schedule_queue: Arc<PipelineScheduleQueue>,
    pub trigger: Arc<PipelineTriggerService>,
    pub stages: Arc<StageScheduler>,
    pub elastic: Arc<ElasticAgentOrchestrator>,
    pub dispatcher: Arc<AssignmentDispatcher>,
    pub hang: Arc<HangMonitor>,
}

impl Scheduler {
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        let registry = Arc::new(AgentRegistry::new(ctx.clone()));
        let pool = Arc::new(JobPlanPool::new(ctx.jobs.clone()));
        let pipeline_state = Arc::new(PipelineStateService::new(ctx.clone()));
        let trigger_monitor = Arc::new(TriggerMonitor::new());
        let checkers = Arc::new(SchedulingCheckers::new(
            ctx.clone(),
            pipeline_state.clone(),
            trigger_monitor.clone(),
        ));
        let schedule_queue = Arc::new(PipelineScheduleQueue::new(trigger_monitor.clone()));
        let trigger = Arc::new(PipelineTriggerService::new(
            ctx.clone(),
            schedule_queue.clone(),
            checkers.clone(),
            trigger_monitor.clone(),
        ));
        let stages = Arc::new(StageScheduler::new(
            ctx.clone(),
            registry.clone(),
            pool.clone(),
            pipeline_state.clone(),
            checkers.clone(),
            schedule_queue.clone(),
        ));
        let elastic_queue = Arc::new(ElasticAgentQueue::new(ctx.clone(), stages.clone()));
        let elastic = Arc::new(ElasticAgentOrchestrator::new(
            ctx.clone(),
            registry.clone(),
            stages.clone(),
            pool.clone(),
            elastic_queue,
        ));
        let dispatcher = Arc::new(AssignmentDispatcher::new(
            ctx.clone(),
            registry.clone(),
            pool.clone(),
            stages.clone(),
            elastic.clone(),
        ));
        let hang = Arc::new(HangMonitor::new(ctx.clone(), stages.clone()));

        Self {
            ctx,
            registry,
            pool,
            pipeline_state,
            trigger_monitor,
            checkers,
            schedule_queue,
            trigger,
            stages,
            elastic,
            dispatcher,
            hang,
        }
    }

    /// Load persisted state and register listeners. Call once before
    /// serving agents.
    pub async fn start(&self) -> Result<()> {
        self.registry.initialize().await?;
        self.hang.initialize().await?;
        self.ctx.events.subscribe(self.hang.clone()).await;
        self.ctx
            .config_repo
            .register_listener(self.dispatcher.clone())
            .await;
        let reload = self.pool.reload().await?;
        info!(
            agents = self.registry.all().await.len(),
            pending_jobs = reload.current.len(),
            "Scheduler started"
        );
        Ok(())
    }

    /// Spawn the timer loops. They run until `shutdown` flips to `true`.
    pub fn spawn_timers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> SchedulerTimers {
        SchedulerTimers::spawn(self.clone(), shutdown)
    }
}
