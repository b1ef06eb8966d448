//! Capabilities announcement / acknowledgement (§6). Capabilities
//! negotiation text itself is an external collaborator whose format is
//! fixed elsewhere (§1 Out-of-scope) — this module only carries the
//! opaque payload across the `capabilities` / `capabilities-ack` topics,
//! the way the directive/event topics carry their own opaque payloads.

use crate::framing::JsonMessage;
use serde_json::Value;
use std::sync::Arc;

/// Notified once the service acknowledges a capabilities announcement.
pub trait CapabilitiesObserver: Send + Sync {
    fn on_capabilities_ack(&self, payload: &Value);
}

/// Default observer that just logs, matching `LoggingCriticalFailureHook`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCapabilitiesObserver;

impl CapabilitiesObserver for LoggingCapabilitiesObserver {
    fn on_capabilities_ack(&self, payload: &Value) {
        tracing::debug!(%payload, "capabilities acknowledged");
    }
}

pub struct CapabilitiesManager {
    /// Opaque capabilities document, supplied by the platform at startup.
    announcement: Value,
    observer: Arc<dyn CapabilitiesObserver>,
}

impl CapabilitiesManager {
    pub fn new(announcement: Value, observer: Arc<dyn CapabilitiesObserver>) -> Self {
        CapabilitiesManager { announcement, observer }
    }

    /// Builds the single message to publish on the `capabilities` topic.
    pub fn announce(&self) -> JsonMessage {
        JsonMessage {
            name: "Capabilities".to_string(),
            message_id: None,
            payload: self.announcement.clone(),
        }
    }

    /// Handles one message delivered on the `capabilities-ack` topic.
    pub fn handle_ack(&self, msg: &JsonMessage) {
        self.observer.on_capabilities_ack(&msg.payload);
    }
}
