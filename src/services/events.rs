use std::sync::Arc;

use crate::models::event::SubscriptionEvent;

pub trait EventListener: Send + Sync {
    fn handle(&self, event: &SubscriptionEvent);
}

/// Fan-out of subscription events to listeners registered at startup.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: Arc<dyn EventListener>) {
        self.listeners.push(listener);
    }

    pub fn publish(&self, event: &SubscriptionEvent) {
        for listener in &self.listeners {
            listener.handle(event);
        }
    }
}

pub struct LoggingListener;

impl EventListener for LoggingListener {
    fn handle(&self, event: &SubscriptionEvent) {
        match serde_json::to_string(event) {
            Ok(payload) => log::info!("subscription #{} {}: {}", event.subscription_id(), event.name(), payload),
            Err(e) => log::warn!("Could not serialize {} event: {}", event.name(), e),
        }
    }
}
