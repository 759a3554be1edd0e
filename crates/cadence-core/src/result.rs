//! Structured operation outcomes.
//!
//! Precondition checks write their verdict into an [`OperationResult`]
//! and the outermost operation turns it into a [`crate::Result`].

use crate::error::Error;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Ok,
    Accepted,
    NotFound,
    Forbidden,
    Conflict,
    BadRequest,
    Unavailable,
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub status: OperationStatus,
    pub message: String,
}

impl Default for OperationResult {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationResult {
    pub fn new() -> Self {
        Self {
            status: OperationStatus::Ok,
            message: String::new(),
        }
    }

    /// Whether every check so far let the operation through.
    pub fn can_continue(&self) -> bool {
        matches!(self.status, OperationStatus::Ok | OperationStatus::Accepted)
    }

    pub fn is_success(&self) -> bool {
        self.can_continue()
    }

    pub fn success(&mut self, message: impl Into<String>) {
        self.set(OperationStatus::Ok, message);
    }

    pub fn accepted(&mut self, message: impl Into<String>) {
        self.set(OperationStatus::Accepted, message);
    }

    pub fn not_found(&mut self, message: impl Into<String>) {
        self.set(OperationStatus::NotFound, message);
    }

    pub fn forbidden(&mut self, message: impl Into<String>) {
        self.set(OperationStatus::Forbidden, message);
    }

    pub fn conflict(&mut self, message: impl Into<String>) {
        self.set(OperationStatus::Conflict, message);
    }

    pub fn bad_request(&mut self, message: impl Into<String>) {
        self.set(OperationStatus::BadRequest, message);
    }

    pub fn unavailable(&mut self, message: impl Into<String>) {
        self.set(OperationStatus::Unavailable, message);
    }

    pub fn internal_error(&mut self, message: impl Into<String>) {
        self.set(OperationStatus::InternalError, message);
    }

    fn set(&mut self, status: OperationStatus, message: impl Into<String>) {
        self.status = status;
        self.message = message.into();
    }

    /// Convert into a `Result`, keeping the success message.
    pub fn into_result(self) -> crate::Result<String> {
        match self.status {
            OperationStatus::Ok | OperationStatus::Accepted => Ok(self.message),
            OperationStatus::NotFound => Err(Error::NotFound(self.message)),
            OperationStatus::Forbidden => Err(Error::Forbidden(self.message)),
            OperationStatus::Conflict => Err(Error::Conflict(self.message)),
            OperationStatus::BadRequest => Err(Error::Validation(self.message)),
            OperationStatus::Unavailable | OperationStatus::InternalError => {
                Err(Error::Internal(self.message))
            }
        }
    }
}

/// Whether a stage may be scheduled with respect to its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStageResult {
    CanSchedule,
    PipelineNotFound,
    PreviousStageNotRan,
    PreviousStageNotPassed,
}

impl ScheduleStageResult {
    pub fn can_schedule(&self) -> bool {
        matches!(self, ScheduleStageResult::CanSchedule)
    }

    pub fn reason(&self, pipeline: &str, stage: &str, previous: &str) -> String {
        match self {
            ScheduleStageResult::CanSchedule => String::new(),
            ScheduleStageResult::PipelineNotFound => {
                format!("Pipeline '{pipeline}' does not exist")
            }
            ScheduleStageResult::PreviousStageNotRan => format!(
                "Cannot schedule {stage} as the previous stage {previous} has not run in pipeline {pipeline}"
            ),
            ScheduleStageResult::PreviousStageNotPassed => format!(
                "Cannot schedule {stage} as the previous stage {previous} has not passed in pipeline {pipeline}"
            ),
        }
    }
}
