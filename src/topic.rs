//! The closed topic enumeration and per-topic wire characteristics.

use std::fmt;

/// Logical channel between client and service. Each variant owns its own
/// sequence-number space, key schedule, and wire kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Directive,
    Event,
    Capabilities,
    CapabilitiesAck,
    Microphone,
    Speaker,
    ConnectionFromService,
    ConnectionFromClient,
}

/// The shape a topic's decrypted payload takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// `{"<arrayName>":[<msg>, ...]}`
    JsonArray,
    /// Concatenated length-prefixed entries.
    Binary,
}

impl Topic {
    pub const ALL: [Topic; 8] = [
        Topic::Directive,
        Topic::Event,
        Topic::Capabilities,
        Topic::CapabilitiesAck,
        Topic::Microphone,
        Topic::Speaker,
        Topic::ConnectionFromService,
        Topic::ConnectionFromClient,
    ];

    /// Wire name used in `<device-root><topic-name>`.
    pub fn wire_name(self) -> &'static str {
        match self {
            Topic::Directive => "directive",
            Topic::Event => "event",
            Topic::Capabilities => "capabilities",
            Topic::CapabilitiesAck => "capabilities-ack",
            Topic::Microphone => "microphone",
            Topic::Speaker => "speaker",
            Topic::ConnectionFromService => "connection-from-service",
            Topic::ConnectionFromClient => "connection-from-client",
        }
    }

    pub fn kind(self) -> TopicKind {
        match self {
            Topic::Directive | Topic::Capabilities | Topic::CapabilitiesAck => TopicKind::JsonArray,
            Topic::Event | Topic::ConnectionFromService | Topic::ConnectionFromClient => TopicKind::JsonArray,
            Topic::Microphone | Topic::Speaker => TopicKind::Binary,
        }
    }

    /// `true` for topics the client publishes to.
    pub fn is_outbound(self) -> bool {
        matches!(
            self,
            Topic::Event | Topic::Microphone | Topic::Capabilities | Topic::ConnectionFromClient
        )
    }

    /// `true` for topics the client subscribes to.
    pub fn is_inbound(self) -> bool {
        matches!(
            self,
            Topic::Directive | Topic::Speaker | Topic::CapabilitiesAck | Topic::ConnectionFromService
        )
    }

    /// JSON array wrapper key name for JSON-array topics.
    pub fn array_name(self) -> Option<&'static str> {
        match self {
            Topic::Directive => Some("directives"),
            Topic::Event => Some("events"),
            Topic::Capabilities => Some("capabilities"),
            Topic::CapabilitiesAck => Some("capabilitiesAck"),
            Topic::ConnectionFromService => Some("connection"),
            Topic::ConnectionFromClient => Some("connection"),
            Topic::Microphone | Topic::Speaker => None,
        }
    }

    /// Full publish/subscribe topic string: `<device-root><topic-name>`.
    pub fn wire_topic(self, device_topic_root: &str) -> String {
        format!("{device_topic_root}{}", self.wire_name())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}
