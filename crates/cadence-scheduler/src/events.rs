//! In-process event hub.
//!
//! Listeners are called one after another, in registration order, before
//! `publish` returns. A failing listener is logged and the remaining
//! listeners still run.

use cadence_core::events::Event;
use cadence_core::ports::EventListener;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

#[derive(Default)]
pub struct EventHub {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().await.push(listener);
    }

    pub async fn publish(&self, event: Event) {
        let listeners = self.listeners.read().await.clone();
        let subject = event.subject();
        debug!(subject = %subject, listeners = listeners.len(), "Publishing event");

        for listener in listeners {
            if let Err(e) = listener.on_event(&event).await {
                error!(subject = %subject, error = %e, "Event listener failed");
            }
        }
    }
}
