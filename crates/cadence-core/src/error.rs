//! Error types for Cadence.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Lookup errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Stage not found: {0}")]
    StageNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    // Permission errors
    #[error("Forbidden: {0}")]
    Forbidden(String),

    // State conflicts
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    // Agent identity errors
    #[error("Agent {0} has a duplicate cookie")]
    DuplicateCookie(String),

    #[error("Agent {0} did not present a cookie")]
    MissingCookie(String),

    #[error("Agent {agent} is not the agent assigned to job {job}")]
    InvalidAgent { agent: String, job: String },

    // Assignment errors
    #[error("Secret resolution failed: {0}")]
    SecretResolution(String),

    #[error("Rules violation: {0}")]
    RulesViolation(String),

    #[error("Cannot schedule {pipeline}/{stage}: {reason}")]
    CannotSchedule {
        pipeline: String,
        stage: String,
        reason: String,
    },

    // Plugin errors
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Plugin call failed: {0}")]
    Plugin(String),

    // Infrastructure errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors that a job must absorb as a failure instead of a retry.
    pub fn is_job_failure(&self) -> bool {
        matches!(self, Error::SecretResolution(_) | Error::RulesViolation(_))
    }

    /// True for the not-found family.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::PipelineNotFound(_)
                | Error::StageNotFound(_)
                | Error::JobNotFound(_)
                | Error::AgentNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
