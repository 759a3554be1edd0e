use crate::lock;
use async_trait::async_trait;
use cadence_core::Result;
use cadence_core::ports::{DiskSpace, PermissionChecker};
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Allows every user except the ones explicitly denied.
#[derive(Default)]
pub struct StaticPermissions {
    denied: Mutex<BTreeSet<String>>,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&self, user: &str) {
        lock(&self.denied).insert(user.to_string());
    }

    pub fn allow(&self, user: &str) {
        lock(&self.denied).remove(user);
    }

    fn allowed(&self, user: &str) -> bool {
        !lock(&self.denied).contains(user)
    }
}

#[async_trait]
impl PermissionChecker for StaticPermissions {
    async fn can_operate_pipeline(&self, user: &str, _pipeline: &str) -> bool {
        self.allowed(user)
    }

    async fn can_operate_stage(&self, user: &str, _pipeline: &str, _stage: &str) -> bool {
        self.allowed(user)
    }
}

/// Reports whatever free space it was last told.
pub struct FixedDiskSpace {
    bytes: AtomicU64,
}

impl FixedDiskSpace {
    pub fn new(bytes: u64) -> Self {
        Self {
            bytes: AtomicU64::new(bytes),
        }
    }

    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::SeqCst);
    }
}

impl Default for FixedDiskSpace {
    fn default() -> Self {
        Self::new(u64::MAX)
    }
}

#[async_trait]
impl DiskSpace for FixedDiskSpace {
    async fn usable_space_bytes(&self) -> Result<u64> {
        Ok(self.bytes.load(Ordering::SeqCst))
    }
}
