//! Test helper functions and utilities.

use async_trait::async_trait;
use cadence_core::Result;
use cadence_core::elastic::ResolvedProperties;
use cadence_core::ports::{CreateAgentRequest, ElasticAgentPlugin, ShouldAssignWorkRequest};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Elastic agent plugin that records what it is asked to do.
pub struct FakeElasticPlugin {
    plugin_id: String,
    accept_work: AtomicBool,
    created: Mutex<Vec<CreateAgentRequest>>,
    assign_requests: Mutex<Vec<ShouldAssignWorkRequest>>,
    pings: AtomicUsize,
}

impl FakeElasticPlugin {
    pub fn new(plugin_id: &str) -> Arc<Self> {
        Arc::new(Self {
            plugin_id: plugin_id.to_string(),
            accept_work: AtomicBool::new(true),
            created: Mutex::new(Vec::new()),
            assign_requests: Mutex::new(Vec::new()),
            pings: AtomicUsize::new(0),
        })
    }

    /// Make `should_assign_work` answer `accept`.
    pub fn accept_work(&self, accept: bool) {
        self.accept_work.store(accept, Ordering::SeqCst);
    }

    pub async fn created(&self) -> Vec<CreateAgentRequest> {
        self.created.lock().await.clone()
    }

    pub async fn assign_requests(&self) -> usize {
        self.assign_requests.lock().await.len()
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ElasticAgentPlugin for FakeElasticPlugin {
    fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    async fn create_agent(&self, request: CreateAgentRequest) -> Result<()> {
        self.created.lock().await.push(request);
        Ok(())
    }

    async fn should_assign_work(&self, request: ShouldAssignWorkRequest) -> Result<bool> {
        self.assign_requests.lock().await.push(request);
        Ok(self.accept_work.load(Ordering::SeqCst))
    }

    async fn server_ping(&self, _cluster_profiles: Vec<ResolvedProperties>) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Wait for a condition with timeout.
pub async fn wait_for<F, Fut>(
    timeout: std::time::Duration,
    interval: std::time::Duration,
    mut condition: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}
