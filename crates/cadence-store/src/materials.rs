//! Build cause producer fed by hand instead of polling materials.

use crate::lock;
use async_trait::async_trait;
use cadence_core::Result;
use cadence_core::config::PipelineConfig;
use cadence_core::material::{BuildCause, MaterialKind, MaterialRevision};
use cadence_core::ports::BuildCauseProducer;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::debug;

/// Hands out queued build causes per pipeline, oldest first. A pipeline
/// with nothing queued has no changes.
#[derive(Default)]
pub struct ScriptedBuildCauseProducer {
    queued: Mutex<HashMap<String, VecDeque<String>>>,
}

impl ScriptedBuildCauseProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a change of the pipeline's first material to `revision`.
    pub fn push_changes(&self, pipeline: &str, revision: &str) {
        lock(&self.queued)
            .entry(pipeline.to_string())
            .or_default()
            .push_back(revision.to_string());
    }

    pub fn pending(&self, pipeline: &str) -> usize {
        lock(&self.queued).get(pipeline).map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl BuildCauseProducer for ScriptedBuildCauseProducer {
    async fn produce(
        &self,
        pipeline: &PipelineConfig,
        _previous: Option<&BuildCause>,
    ) -> Result<Option<BuildCause>> {
        let Some(revision) = lock(&self.queued)
            .get_mut(&pipeline.name)
            .and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };
        let material = pipeline
            .materials
            .first()
            .cloned()
            .unwrap_or_else(|| MaterialKind::Scm {
                url: format!("https://git.example.com/{}.git", pipeline.name),
                branch: None,
            });
        debug!(pipeline = %pipeline.name, revision = %revision, "Producing scripted build cause");
        Ok(Some(BuildCause::from_modifications(vec![MaterialRevision {
            material,
            revision,
            changed: true,
            modified_at: Some(Utc::now()),
        }])))
    }
}
