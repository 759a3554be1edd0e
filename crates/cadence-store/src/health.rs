use async_trait::async_trait;
use cadence_core::health::{HealthScope, HealthState};
use cadence_core::ports::HealthService;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Current health messages, one per scope. A success state clears its
/// scope.
#[derive(Default)]
pub struct MemoryHealthService {
    states: RwLock<BTreeMap<HealthScope, HealthState>>,
}

impl MemoryHealthService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn states(&self) -> Vec<HealthState> {
        self.states.read().await.values().cloned().collect()
    }

    pub async fn has_scope(&self, scope: &HealthScope) -> bool {
        self.states.read().await.contains_key(scope)
    }

    pub async fn get(&self, scope: &HealthScope) -> Option<HealthState> {
        self.states.read().await.get(scope).cloned()
    }
}

#[async_trait]
impl HealthService for MemoryHealthService {
    async fn update(&self, state: HealthState) {
        let mut states = self.states.write().await;
        if state.is_success() {
            states.remove(&state.scope);
            return;
        }
        warn!(scope = %state.scope, level = ?state.level, message = %state.message, "Server health message");
        states.insert(state.scope.clone(), state);
    }

    async fn remove_by_scope(&self, scope: &HealthScope) {
        if self.states.write().await.remove(scope).is_some() {
            debug!(scope = %scope, "Server health message cleared");
        }
    }
}
