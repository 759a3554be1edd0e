//! Pipeline pause and lock state.
//!
//! Every read-modify-write of a pipeline's state runs under that pipeline's
//! keyed lock so a pause cannot race a lock or unlock.

use crate::context::SchedulerContext;
use cadence_core::Result;
use cadence_core::events::{Event, PipelineLockPayload, PipelinePausePayload};
use cadence_core::ids::PipelineIdentifier;
use cadence_core::ports::{PauseInfo, PipelineState};
use cadence_core::result::OperationResult;
use std::sync::Arc;
use tracing::{debug, info};

pub struct PipelineStateService {
    ctx: Arc<SchedulerContext>,
}

impl PipelineStateService {
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        Self { ctx }
    }

    /// Pause a pipeline. Pausing an already paused pipeline is a conflict
    /// and leaves the existing pause untouched.
    pub async fn pause(&self, pipeline: &str, cause: Option<&str>, user: &str) -> OperationResult {
        let mut result = OperationResult::new();
        if !self.precheck(pipeline, user, "pause", &mut result).await {
            return result;
        }

        let _guard = self.ctx.locks.pipelines.lock(pipeline).await;
        let mut state = match self.ctx.pipelines.state(pipeline).await {
            Ok(state) => state,
            Err(e) => {
                result.internal_error(format!("Failed to pause pipeline '{pipeline}': {e}"));
                return result;
            }
        };
        if state.is_paused() {
            result.conflict(format!(
                "Failed to pause pipeline '{pipeline}'. Pipeline '{pipeline}' is already paused."
            ));
            return result;
        }

        let cause = cause
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        let now = self.ctx.now();
        state.paused = Some(PauseInfo {
            cause: cause.clone(),
            paused_by: user.to_string(),
            paused_at: now,
        });
        if let Err(e) = self.ctx.pipelines.save_state(&state).await {
            result.internal_error(format!("Failed to pause pipeline '{pipeline}': {e}"));
            return result;
        }

        info!(pipeline, user, cause = ?cause, "Pipeline paused");
        self.ctx
            .publish(Event::PipelinePaused(PipelinePausePayload {
                pipeline: pipeline.to_string(),
                by: user.to_string(),
                cause,
                timestamp: now,
            }))
            .await;
        result.success(format!("Pipeline '{pipeline}' paused successfully."));
        result
    }

    /// Unpause a pipeline. Unpausing a running pipeline is a conflict.
    pub async fn unpause(&self, pipeline: &str, user: &str) -> OperationResult {
        let mut result = OperationResult::new();
        if !self.precheck(pipeline, user, "unpause", &mut result).await {
            return result;
        }

        let _guard = self.ctx.locks.pipelines.lock(pipeline).await;
        let mut state = match self.ctx.pipelines.state(pipeline).await {
            Ok(state) => state,
            Err(e) => {
                result.internal_error(format!("Failed to unpause pipeline '{pipeline}': {e}"));
                return result;
            }
        };
        if !state.is_paused() {
            result.conflict(format!(
                "Failed to unpause pipeline '{pipeline}'. Pipeline '{pipeline}' is already unpaused."
            ));
            return result;
        }

        state.paused = None;
        if let Err(e) = self.ctx.pipelines.save_state(&state).await {
            result.internal_error(format!("Failed to unpause pipeline '{pipeline}': {e}"));
            return result;
        }

        info!(pipeline, user, "Pipeline unpaused");
        self.ctx
            .publish(Event::PipelineUnpaused(PipelinePausePayload {
                pipeline: pipeline.to_string(),
                by: user.to_string(),
                cause: None,
                timestamp: self.ctx.now(),
            }))
            .await;
        result.success(format!("Pipeline '{pipeline}' unpaused successfully."));
        result
    }

    async fn precheck(
        &self,
        pipeline: &str,
        user: &str,
        action: &str,
        result: &mut OperationResult,
    ) -> bool {
        if !self.ctx.config_repo.current().await.has_pipeline(pipeline) {
            result.not_found(format!(
                "Failed to {action} pipeline '{pipeline}'. Pipeline '{pipeline}' not found."
            ));
            return false;
        }
        if !self.ctx.permissions.can_operate_pipeline(user, pipeline).await {
            result.forbidden(format!(
                "Failed to {action} pipeline '{pipeline}'. User '{user}' does not have permission to {action} it."
            ));
            return false;
        }
        true
    }

    pub async fn is_paused(&self, pipeline: &str) -> Result<bool> {
        Ok(self.ctx.pipelines.state(pipeline).await?.is_paused())
    }

    pub async fn pause_info(&self, pipeline: &str) -> Result<Option<PauseInfo>> {
        Ok(self.ctx.pipelines.state(pipeline).await?.paused)
    }

    /// Lock the pipeline for this instance if it is configured lockable and
    /// not locked yet.
    pub async fn lock_if_needed(&self, instance: &PipelineIdentifier) -> Result<()> {
        let config = self.ctx.config_repo.current().await;
        let lockable = config
            .pipeline(&instance.name)
            .is_some_and(|p| p.is_lockable());
        if !lockable {
            return Ok(());
        }

        let _guard = self.ctx.locks.pipelines.lock(&instance.name).await;
        let mut state = self.ctx.pipelines.state(&instance.name).await?;
        if state.is_locked() {
            return Ok(());
        }
        state.locked_by = Some(instance.clone());
        self.ctx.pipelines.save_state(&state).await?;

        info!(pipeline = %instance, "Pipeline locked");
        self.ctx
            .publish(Event::PipelineLocked(PipelineLockPayload {
                pipeline: instance.clone(),
                timestamp: self.ctx.now(),
            }))
            .await;
        Ok(())
    }

    /// Release the pipeline lock, if held.
    pub async fn unlock(&self, pipeline: &str) -> Result<()> {
        let _guard = self.ctx.locks.pipelines.lock(pipeline).await;
        let mut state = self.ctx.pipelines.state(pipeline).await?;
        let Some(holder) = state.locked_by.take() else {
            debug!(pipeline, "Pipeline already unlocked");
            return Ok(());
        };
        self.ctx.pipelines.save_state(&state).await?;

        info!(pipeline = %holder, "Pipeline unlocked");
        self.ctx
            .publish(Event::PipelineUnlocked(PipelineLockPayload {
                pipeline: holder,
                timestamp: self.ctx.now(),
            }))
            .await;
        Ok(())
    }

    pub async fn is_locked(&self, pipeline: &str) -> Result<bool> {
        Ok(self.ctx.pipelines.state(pipeline).await?.is_locked())
    }

    pub async fn locked_by(&self, pipeline: &str) -> Result<Option<PipelineIdentifier>> {
        Ok(self.ctx.pipelines.state(pipeline).await?.locked_by)
    }

    /// Whether a stage of `instance` may be scheduled. A locked pipeline only
    /// accepts stages of the instance holding the lock.
    pub async fn can_schedule(&self, instance: &PipelineIdentifier) -> Result<bool> {
        let state: PipelineState = self.ctx.pipelines.state(&instance.name).await?;
        Ok(match &state.locked_by {
            None => true,
            Some(holder) => holder == instance,
        })
    }
}
