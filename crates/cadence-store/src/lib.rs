//! In-memory adapters for the Cadence scheduler ports.
//!
//! [`MemoryStore`] implements every persistence port over one shared state,
//! so a job saved through the stage repository is immediately visible to
//! the job repository. The remaining adapters cover configuration, console
//! output, health, secrets, plugins and the small environment ports.

pub mod repositories;

mod clock;
mod config;
mod console;
mod health;
mod materials;
mod permissions;
mod plugins;
mod secrets;

pub use clock::ManualClock;
pub use config::MemoryConfigRepository;
pub use console::MemoryConsoleLog;
pub use health::MemoryHealthService;
pub use materials::ScriptedBuildCauseProducer;
pub use permissions::{FixedDiskSpace, StaticPermissions};
pub use plugins::MemoryPluginRegistry;
pub use repositories::MemoryStore;
pub use secrets::StaticSecretResolver;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// Adapters that expose synchronous setters guard their state with std locks.
// A poisoned lock still holds consistent data for these simple maps.

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
