//! Configuration repository holding the current snapshot.

use crate::{read, write};
use async_trait::async_trait;
use cadence_core::config::CruiseConfig;
use cadence_core::ports::{ConfigChangeListener, ConfigRepository};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Keeps one [`CruiseConfig`] and notifies listeners whenever it is
/// replaced through [`MemoryConfigRepository::set`].
pub struct MemoryConfigRepository {
    current: RwLock<Arc<CruiseConfig>>,
    listeners: tokio::sync::RwLock<Vec<Arc<dyn ConfigChangeListener>>>,
}

impl MemoryConfigRepository {
    pub fn new(config: CruiseConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
            listeners: tokio::sync::RwLock::new(Vec::new()),
        }
    }

    /// Publish a new snapshot and call every listener with it.
    pub async fn set(&self, config: CruiseConfig) {
        let config = Arc::new(config);
        *write(&self.current) = config.clone();
        let listeners = self.listeners.read().await.clone();
        info!(
            version = config.version,
            pipelines = config.pipelines.len(),
            listeners = listeners.len(),
            "Configuration updated"
        );
        for listener in listeners {
            listener.on_config_change(config.clone()).await;
        }
    }

    /// Replace the snapshot without notifying listeners, as a config reload
    /// racing with a reader would look.
    pub fn replace_silently(&self, config: CruiseConfig) {
        *write(&self.current) = Arc::new(config);
    }
}

impl Default for MemoryConfigRepository {
    fn default() -> Self {
        Self::new(CruiseConfig::default())
    }
}

#[async_trait]
impl ConfigRepository for MemoryConfigRepository {
    async fn current(&self) -> Arc<CruiseConfig> {
        read(&self.current).clone()
    }

    async fn register_listener(&self, listener: Arc<dyn ConfigChangeListener>) {
        self.listeners.write().await.push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct Versions(AtomicU64);

    #[async_trait]
    impl ConfigChangeListener for Versions {
        async fn on_config_change(&self, config: Arc<CruiseConfig>) {
            self.0.store(config.version, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_set_notifies_but_silent_replace_does_not() {
        let repo = MemoryConfigRepository::default();
        let listener = Arc::new(Versions::default());
        repo.register_listener(listener.clone()).await;

        repo.set(CruiseConfig {
            version: 2,
            ..Default::default()
        })
        .await;
        assert_eq!(listener.0.load(Ordering::SeqCst), 2);

        repo.replace_silently(CruiseConfig {
            version: 3,
            ..Default::default()
        });
        assert_eq!(listener.0.load(Ordering::SeqCst), 2);
        assert_eq!(repo.current().await.version, 3);
    }
}
