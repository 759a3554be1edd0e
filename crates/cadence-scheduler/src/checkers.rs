//! Precondition checks run before any scheduling operation.
//!
//! A chain is an ordered list of [`SchedulingCheck`]s. Each check writes its
//! verdict into a shared [`OperationResult`]; the chain stops at the first
//! check that does not let the operation continue.

use crate::context::SchedulerContext;
use crate::pause::PipelineStateService;
use crate::queue::TriggerMonitor;
use cadence_core::Result;
use cadence_core::config::PipelineConfig;
use cadence_core::health::{HealthScope, HealthState};
use cadence_core::ids::PipelineIdentifier;
use cadence_core::result::{OperationResult, ScheduleStageResult};
use std::sync::Arc;
use tracing::{debug, warn};

/// One precondition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulingCheck {
    /// Artifact volume has at least the configured free space.
    DiskSpace,
    PipelinePaused { pipeline: String },
    /// No instance of the pipeline holds its lock.
    PipelineLocked { pipeline: String },
    /// The lock, if held, belongs to this instance.
    PipelineLockedForStage { pipeline: PipelineIdentifier },
    /// No run of the stage is active in any instance.
    StageActive { pipeline: String, stage: String },
    PipelineAuthorization { pipeline: String, user: String },
    StageAuthorization { pipeline: String, stage: String, user: String },
    /// No manual trigger of the pipeline is already in flight.
    AboutToBeTriggered { pipeline: String },
    /// The previous stage ran, and passed when success is required.
    ManualTriggerEligibility { pipeline: PipelineIdentifier, stage: String },
}

pub struct SchedulingCheckers {
    ctx: Arc<SchedulerContext>,
    pipeline_state: Arc<PipelineStateService>,
    trigger_monitor: Arc<TriggerMonitor>,
}

impl SchedulingCheckers {
    pub fn new(
        ctx: Arc<SchedulerContext>,
        pipeline_state: Arc<PipelineStateService>,
        trigger_monitor: Arc<TriggerMonitor>,
    ) -> Self {
        Self {
            ctx,
            pipeline_state,
            trigger_monitor,
        }
    }

    /// Run `checks` in order, stopping at the first failure.
    pub async fn run_chain(&self, checks: &[SchedulingCheck]) -> OperationResult {
        let mut result = OperationResult::new();
        for check in checks {
            self.check(check, &mut result).await;
            if !result.can_continue() {
                debug!(check = ?check, message = %result.message, "Scheduling check failed");
                break;
            }
        }
        result
    }

    /// Gates for a timer-driven trigger of a pipeline.
    pub async fn can_auto_trigger_consumer(&self, pipeline: &PipelineConfig) -> OperationResult {
        let mut checks = vec![
            SchedulingCheck::PipelinePaused {
                pipeline: pipeline.name.clone(),
            },
            SchedulingCheck::PipelineLocked {
                pipeline: pipeline.name.clone(),
            },
        ];
        if let Some(first) = pipeline.first_stage() {
            checks.push(SchedulingCheck::StageActive {
                pipeline: pipeline.name.clone(),
                stage: first.name.clone(),
            });
        }
        checks.push(SchedulingCheck::DiskSpace);
        self.run_chain(&checks).await
    }

    /// Gates for a user forcing a new pipeline instance.
    pub async fn can_manually_trigger(
        &self,
        pipeline: &PipelineConfig,
        user: &str,
    ) -> OperationResult {
        let mut checks = vec![SchedulingCheck::PipelineAuthorization {
            pipeline: pipeline.name.clone(),
            user: user.to_string(),
        }];
        if let Some(first) = pipeline.first_stage() {
            checks.push(SchedulingCheck::StageAuthorization {
                pipeline: pipeline.name.clone(),
                stage: first.name.clone(),
                user: user.to_string(),
            });
        }
        checks.push(SchedulingCheck::AboutToBeTriggered {
            pipeline: pipeline.name.clone(),
        });
        checks.push(SchedulingCheck::PipelinePaused {
            pipeline: pipeline.name.clone(),
        });
        checks.push(SchedulingCheck::PipelineLocked {
            pipeline: pipeline.name.clone(),
        });
        if let Some(first) = pipeline.first_stage() {
            checks.push(SchedulingCheck::StageActive {
                pipeline: pipeline.name.clone(),
                stage: first.name.clone(),
            });
        }
        checks.push(SchedulingCheck::DiskSpace);
        self.run_chain(&checks).await
    }

    /// Gates for scheduling a stage inside an existing pipeline instance.
    pub async fn can_schedule_stage(
        &self,
        pipeline: &PipelineIdentifier,
        stage: &str,
        user: &str,
    ) -> OperationResult {
        self.run_chain(&[
            SchedulingCheck::StageAuthorization {
                pipeline: pipeline.name.clone(),
                stage: stage.to_string(),
                user: user.to_string(),
            },
            SchedulingCheck::PipelinePaused {
                pipeline: pipeline.name.clone(),
            },
            SchedulingCheck::PipelineLockedForStage {
                pipeline: pipeline.clone(),
            },
            SchedulingCheck::StageActive {
                pipeline: pipeline.name.clone(),
                stage: stage.to_string(),
            },
            SchedulingCheck::ManualTriggerEligibility {
                pipeline: pipeline.clone(),
                stage: stage.to_string(),
            },
            SchedulingCheck::DiskSpace,
        ])
        .await
    }

    /// Gates for a stage triggered by the completion of another stage.
    pub async fn can_auto_schedule_stage(
        &self,
        pipeline: &PipelineIdentifier,
        stage: &str,
    ) -> OperationResult {
        self.run_chain(&[
            SchedulingCheck::PipelinePaused {
                pipeline: pipeline.name.clone(),
            },
            SchedulingCheck::PipelineLockedForStage {
                pipeline: pipeline.clone(),
            },
            SchedulingCheck::StageActive {
                pipeline: pipeline.name.clone(),
                stage: stage.to_string(),
            },
            SchedulingCheck::ManualTriggerEligibility {
                pipeline: pipeline.clone(),
                stage: stage.to_string(),
            },
            SchedulingCheck::DiskSpace,
        ])
        .await
    }

    /// Gates for running a stage, or some of its jobs, again.
    pub async fn can_rerun_stage(
        &self,
        pipeline: &PipelineIdentifier,
        stage: &str,
        user: &str,
    ) -> OperationResult {
        self.run_chain(&[
            SchedulingCheck::StageAuthorization {
                pipeline: pipeline.name.clone(),
                stage: stage.to_string(),
                user: user.to_string(),
            },
            SchedulingCheck::PipelineLockedForStage {
                pipeline: pipeline.clone(),
            },
            SchedulingCheck::StageActive {
                pipeline: pipeline.name.clone(),
                stage: stage.to_string(),
            },
            SchedulingCheck::ManualTriggerEligibility {
                pipeline: pipeline.clone(),
                stage: stage.to_string(),
            },
            SchedulingCheck::DiskSpace,
        ])
        .await
    }

    /// Whether anything may be scheduled at all.
    pub async fn can_schedule(&self) -> OperationResult {
        self.run_chain(&[SchedulingCheck::DiskSpace]).await
    }

    /// Whether `stage` may run in `pipeline` given its predecessor.
    pub async fn should_allow_scheduling_stage(
        &self,
        pipeline: &PipelineIdentifier,
        stage: &str,
    ) -> Result<ScheduleStageResult> {
        let config = self.ctx.config_repo.current().await;
        let Some(pipeline_config) = config.pipeline(&pipeline.name) else {
            return Ok(ScheduleStageResult::PipelineNotFound);
        };
        let Some(index) = pipeline_config.stage_index(stage) else {
            return Ok(ScheduleStageResult::PipelineNotFound);
        };
        if index == 0 {
            return Ok(ScheduleStageResult::CanSchedule);
        }

        let previous = &pipeline_config.stages[index - 1];
        let previous_run = self
            .ctx
            .stages
            .latest(&pipeline.name, pipeline.counter, &previous.name)
            .await?;
        let Some(previous_run) = previous_run else {
            return Ok(ScheduleStageResult::PreviousStageNotRan);
        };

        let approval = &pipeline_config.stages[index].approval;
        if approval.allow_only_on_success && !previous_run.passed() {
            return Ok(ScheduleStageResult::PreviousStageNotPassed);
        }
        Ok(ScheduleStageResult::CanSchedule)
    }

    async fn check(&self, check: &SchedulingCheck, result: &mut OperationResult) {
        if let Err(e) = self.evaluate(check, result).await {
            warn!(check = ?check, error = %e, "Scheduling check could not be evaluated");
            result.internal_error(format!("Could not evaluate scheduling check: {e}"));
        }
    }

    async fn evaluate(&self, check: &SchedulingCheck, result: &mut OperationResult) -> Result<()> {
        match check {
            SchedulingCheck::DiskSpace => {
                let usable = self.ctx.disk.usable_space_bytes().await?;
                let required = self.ctx.config.minimum_free_disk_bytes;
                if usable < required {
                    let message = format!(
                        "Cadence has less than {} MB of disk space available. Scheduling has stopped.",
                        required / (1024 * 1024)
                    );
                    self.ctx
                        .health
                        .update(HealthState::error(
                            HealthScope::DiskSpace,
                            message.clone(),
                            format!("{usable} bytes available on the artifacts volume."),
                        ))
                        .await;
                    result.unavailable(message);
                } else {
                    self.ctx.health.remove_by_scope(&HealthScope::DiskSpace).await;
                }
            }
            SchedulingCheck::PipelinePaused { pipeline } => {
                if let Some(info) = self.pipeline_state.pause_info(pipeline).await? {
                    let cause = info.cause.unwrap_or_default();
                    result.conflict(format!(
                        "Failed to trigger pipeline [{pipeline}]. Pipeline is paused by {}: {cause}",
                        info.paused_by
                    ));
                }
            }
            SchedulingCheck::PipelineLocked { pipeline } => {
                if let Some(holder) = self.pipeline_state.locked_by(pipeline).await? {
                    result.conflict(format!(
                        "Pipeline {pipeline} cannot be scheduled. It is locked by instance {holder}."
                    ));
                }
            }
            SchedulingCheck::PipelineLockedForStage { pipeline } => {
                if !self.pipeline_state.can_schedule(pipeline).await? {
                    result.conflict(format!(
                        "Stages of {pipeline} cannot be scheduled. Another instance holds the pipeline lock."
                    ));
                }
            }
            SchedulingCheck::StageActive { pipeline, stage } => {
                if self.ctx.stages.is_stage_active(pipeline, stage).await? {
                    result.conflict(format!(
                        "Failed to trigger pipeline [{pipeline}]. Stage [{stage}] is still in progress."
                    ));
                }
            }
            SchedulingCheck::PipelineAuthorization { pipeline, user } => {
                if !self.ctx.permissions.can_operate_pipeline(user, pipeline).await {
                    result.forbidden(format!(
                        "User '{user}' does not have permission to operate pipeline '{pipeline}'."
                    ));
                }
            }
            SchedulingCheck::StageAuthorization {
                pipeline,
                stage,
                user,
            } => {
                if !self
                    .ctx
                    .permissions
                    .can_operate_stage(user, pipeline, stage)
                    .await
                {
                    result.forbidden(format!(
                        "User '{user}' does not have permission to schedule {pipeline}/{stage}."
                    ));
                }
            }
            SchedulingCheck::AboutToBeTriggered { pipeline } => {
                if self.trigger_monitor.is_already_triggered(pipeline).await {
                    result.conflict(format!(
                        "Failed to trigger pipeline: {pipeline}. It is already triggered."
                    ));
                }
            }
            SchedulingCheck::ManualTriggerEligibility { pipeline, stage } => {
                let verdict = self.should_allow_scheduling_stage(pipeline, stage).await?;
                if !verdict.can_schedule() {
                    let config = self.ctx.config_repo.current().await;
                    let previous = config
                        .previous_stage(&pipeline.name, stage)
                        .map(|s| s.name.clone())
                        .unwrap_or_default();
                    let message = verdict.reason(&pipeline.name, stage, &previous);
                    match verdict {
                        ScheduleStageResult::PipelineNotFound => result.not_found(message),
                        _ => result.bad_request(message),
                    }
                }
            }
        }
        Ok(())
    }
}
