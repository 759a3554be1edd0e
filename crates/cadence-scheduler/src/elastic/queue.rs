//! Message queue between the orchestrator and elastic agent plugins.
//!
//! Every message carries an expiry. A message still queued past its expiry
//! is dropped instead of delivered, so a create request that could not be
//! served in time is superseded by the next starvation check rather than
//! duplicated.

use crate::context::SchedulerContext;
use crate::stages::StageScheduler;
use cadence_core::elastic::ResolvedProperties;
use cadence_core::health::{HealthScope, HealthState};
use cadence_core::ports::CreateAgentRequest;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub enum ElasticMessage {
    CreateAgent {
        plugin_id: String,
        request: CreateAgentRequest,
    },
    ServerPing {
        plugin_id: String,
        cluster_profiles: Vec<ResolvedProperties>,
    },
}

impl ElasticMessage {
    pub fn plugin_id(&self) -> &str {
        match self {
            ElasticMessage::CreateAgent { plugin_id, .. }
            | ElasticMessage::ServerPing { plugin_id, .. } => plugin_id,
        }
    }
}

#[derive(Debug, Clone)]
struct Envelope {
    message: ElasticMessage,
    expires_at: DateTime<Utc>,
}

pub struct ElasticAgentQueue {
    ctx: Arc<SchedulerContext>,
    stages: Arc<StageScheduler>,
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Mutex<mpsc::UnboundedReceiver<Envelope>>,
}

impl ElasticAgentQueue {
    pub fn new(ctx: Arc<SchedulerContext>, stages: Arc<StageScheduler>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            stages,
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Queue a message that is discarded if not delivered within `ttl`.
    pub fn post(&self, message: ElasticMessage, ttl: Duration) {
        let expires_at = self.ctx.now() + ttl;
        if self.tx.send(Envelope { message, expires_at }).is_err() {
            warn!("Elastic agent queue is closed; message dropped");
        }
    }

    /// Deliver messages until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting elastic agent queue");
        let mut rx = self.rx.lock().await;
        loop {
            tokio::select! {
                envelope = rx.recv() => {
                    match envelope {
                        Some(envelope) => self.deliver(envelope).await,
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Elastic agent queue shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Deliver everything queued right now. Returns the number of messages
    /// taken off the queue, expired ones included.
    pub async fn drain(&self) -> usize {
        let mut taken = Vec::new();
        {
            let mut rx = self.rx.lock().await;
            while let Ok(envelope) = rx.try_recv() {
                taken.push(envelope);
            }
        }
        let count = taken.len();
        for envelope in taken {
            self.deliver(envelope).await;
        }
        count
    }

    async fn deliver(&self, envelope: Envelope) {
        let plugin_id = envelope.message.plugin_id().to_string();
        if self.ctx.now() >= envelope.expires_at {
            debug!(plugin_id = %plugin_id, "Dropping expired elastic agent message");
            return;
        }
        let Some(plugin) = self.ctx.plugins.elastic_plugin(&plugin_id) else {
            warn!(plugin_id = %plugin_id, "Elastic agent plugin is not loaded; message dropped");
            return;
        };

        match envelope.message {
            ElasticMessage::CreateAgent { request, .. } => {
                let job = request.job.clone();
                match plugin.create_agent(request).await {
                    Ok(()) => {
                        debug!(plugin_id = %plugin_id, job = %job, "Requested elastic agent");
                        self.ctx
                            .health
                            .remove_by_scope(&HealthScope::ElasticAgentCreation(plugin_id))
                            .await;
                    }
                    Err(e) if e.is_job_failure() => {
                        warn!(plugin_id = %plugin_id, job = %job, error = %e, "Elastic agent request failed the job");
                        self.ctx
                            .console_note(&job, &format!("Failed to create an elastic agent: {e}"))
                            .await;
                        if let Err(e) = self.stages.fail_job(&job).await {
                            error!(job = %job, error = %e, "Failed to fail job");
                        }
                    }
                    Err(e) => {
                        error!(plugin_id = %plugin_id, job = %job, error = %e, "Failed to create elastic agent");
                        self.ctx
                            .health
                            .update(HealthState::warning(
                                HealthScope::ElasticAgentCreation(plugin_id.clone()),
                                format!("Plugin '{plugin_id}' failed to create an elastic agent"),
                                e.to_string(),
                            ))
                            .await;
                    }
                }
            }
            ElasticMessage::ServerPing {
                cluster_profiles, ..
            } => {
                if let Err(e) = plugin.server_ping(cluster_profiles).await {
                    warn!(plugin_id = %plugin_id, error = %e, "Elastic agent plugin ping failed");
                }
            }
        }
    }
}
