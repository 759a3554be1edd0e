//! In-memory implementation of AgentRepository.

use super::MemoryStore;
use async_trait::async_trait;
use cadence_core::Result;
use cadence_core::agent::Agent;
use cadence_core::ids::AgentId;
use cadence_core::ports::AgentRepository;
use tracing::debug;

#[async_trait]
impl AgentRepository for MemoryStore {
    async fn save(&self, agent: &Agent) -> Result<()> {
        self.state.write().await.agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn get(&self, id: AgentId) -> Result<Option<Agent>> {
        Ok(self.state.read().await.agents.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Agent>> {
        let state = self.state.read().await;
        let mut agents: Vec<Agent> = state
            .agents
            .values()
            .filter(|a| !a.deleted)
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.id);
        Ok(agents)
    }

    async fn soft_delete(&self, ids: &[AgentId]) -> Result<()> {
        let mut state = self.state.write().await;
        for id in ids {
            if let Some(agent) = state.agents.get_mut(id) {
                agent.deleted = true;
                debug!(agent_id = %id, "Agent soft-deleted");
            }
        }
        Ok(())
    }
}
