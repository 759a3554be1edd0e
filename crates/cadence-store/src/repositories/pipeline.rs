//! In-memory implementation of PipelineRepository.

use super::MemoryStore;
use async_trait::async_trait;
use cadence_core::Result;
use cadence_core::ids::{PipelineId, PipelineIdentifier};
use cadence_core::material::BuildCause;
use cadence_core::ports::{PipelineRepository, PipelineState};
use cadence_core::run::PipelineInstance;
use chrono::Utc;
use tracing::debug;

#[async_trait]
impl PipelineRepository for MemoryStore {
    async fn create_instance(&self, name: &str, cause: &BuildCause) -> Result<PipelineInstance> {
        let mut state = self.state.write().await;
        let counter = state
            .pipelines
            .iter()
            .filter(|p| p.name() == name)
            .map(|p| p.counter())
            .max()
            .unwrap_or(0)
            + 1;
        state.next_pipeline_id += 1;
        let instance = PipelineInstance {
            id: PipelineId::new(state.next_pipeline_id),
            identifier: PipelineIdentifier::new(name, counter),
            build_cause: cause.clone(),
            created_at: Utc::now(),
        };
        state.pipelines.push(instance.clone());
        debug!(pipeline = %instance.identifier, "Pipeline instance created");
        Ok(instance)
    }

    async fn get_instance(&self, name: &str, counter: u32) -> Result<Option<PipelineInstance>> {
        Ok(self
            .state
            .read()
            .await
            .pipelines
            .iter()
            .find(|p| p.name() == name && p.counter() == counter)
            .cloned())
    }

    async fn instance_by_id(&self, id: PipelineId) -> Result<Option<PipelineInstance>> {
        Ok(self
            .state
            .read()
            .await
            .pipelines
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn latest_instance(&self, name: &str) -> Result<Option<PipelineInstance>> {
        Ok(self
            .state
            .read()
            .await
            .pipelines
            .iter()
            .filter(|p| p.name() == name)
            .max_by_key(|p| p.counter())
            .cloned())
    }

    async fn state(&self, name: &str) -> Result<PipelineState> {
        Ok(self
            .state
            .read()
            .await
            .pipeline_states
            .get(name)
            .cloned()
            .unwrap_or_else(|| PipelineState::new(name)))
    }

    async fn save_state(&self, pipeline_state: &PipelineState) -> Result<()> {
        self.state
            .write()
            .await
            .pipeline_states
            .insert(pipeline_state.pipeline.clone(), pipeline_state.clone());
        Ok(())
    }
}
