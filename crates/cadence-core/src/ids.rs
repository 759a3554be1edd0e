//! Strongly-typed identifiers for domain entities.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let uuid_str = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(uuid_str)?))
            }
        }
    };
}

/// Row identifiers handed out by the persistence layer.
macro_rules! define_row_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub fn new(value: i64) -> Self {
                Self(value)
            }

            pub fn value(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }
    };
}

define_id!(AgentId, "agt");
define_row_id!(PipelineId, "pip");
define_row_id!(StageId, "stg");
define_row_id!(JobId, "job");

/// Locates one pipeline instance: `name/counter`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineIdentifier {
    pub name: String,
    pub counter: u32,
}

impl PipelineIdentifier {
    pub fn new(name: impl Into<String>, counter: u32) -> Self {
        Self {
            name: name.into(),
            counter,
        }
    }
}

impl fmt::Display for PipelineIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.counter)
    }
}

/// Locates one stage run: `pipeline/counter/stage/counter`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageIdentifier {
    pub pipeline_name: String,
    pub pipeline_counter: u32,
    pub stage_name: String,
    pub stage_counter: u32,
}

impl StageIdentifier {
    pub fn new(
        pipeline: &PipelineIdentifier,
        stage_name: impl Into<String>,
        stage_counter: u32,
    ) -> Self {
        Self {
            pipeline_name: pipeline.name.clone(),
            pipeline_counter: pipeline.counter,
            stage_name: stage_name.into(),
            stage_counter,
        }
    }

    pub fn pipeline(&self) -> PipelineIdentifier {
        PipelineIdentifier::new(self.pipeline_name.clone(), self.pipeline_counter)
    }

    /// Key used by the per-stage lock, shared by every run of the stage
    /// within one pipeline instance.
    pub fn lock_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.pipeline_name, self.pipeline_counter, self.stage_name
        )
    }
}

impl fmt::Display for StageIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.pipeline_name, self.pipeline_counter, self.stage_name, self.stage_counter
        )
    }
}

/// Locates one job run: `pipeline/counter/stage/counter/job` plus its row id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobIdentifier {
    pub stage: StageIdentifier,
    pub job_name: String,
    pub build_id: JobId,
}

impl JobIdentifier {
    pub fn new(stage: StageIdentifier, job_name: impl Into<String>, build_id: JobId) -> Self {
        Self {
            stage,
            job_name: job_name.into(),
            build_id,
        }
    }

    pub fn pipeline_name(&self) -> &str {
        &self.stage.pipeline_name
    }

    pub fn stage_name(&self) -> &str {
        &self.stage.stage_name
    }

    /// Key used by the per-job lock.
    pub fn lock_key(&self) -> String {
        format!("{}/{}", self.stage, self.job_name)
    }
}

impl fmt::Display for JobIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stage, self.job_name)
    }
}
