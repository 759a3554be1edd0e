//! Mutexes keyed by name.
//!
//! Pipelines, stages and jobs each get a lock scoped to their identifier.
//! When both a stage and one of its jobs are locked, the stage lock is taken
//! first.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A family of async mutexes, one per key, created on demand.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    name: &'static str,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for the lock of `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().await;
            // Drop entries nobody holds or waits on.
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        tracing::trace!(family = self.name, key, "Acquiring keyed lock");
        mutex.lock_owned().await
    }

    /// Number of keys currently tracked.
    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// The lock families the scheduler shares between its services.
#[derive(Debug)]
pub struct SchedulerLocks {
    pub pipelines: KeyedLocks,
    pub stages: KeyedLocks,
    pub jobs: KeyedLocks,
}

impl Default for SchedulerLocks {
    fn default() -> Self {
        Self {
            pipelines: KeyedLocks::new("pipeline"),
            stages: KeyedLocks::new("stage"),
            jobs: KeyedLocks::new("job"),
        }
    }
}
