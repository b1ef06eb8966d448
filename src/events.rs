//! Outbound event taxonomy (§6 "Events emitted"). Each variant carries its
//! own payload shape; `to_json_message` wraps it into the generic
//! `{"name","messageId"?,"payload"}` envelope the way `api.rs` wraps its
//! own response structs with `#[derive(Serialize)]`.

use crate::framing::JsonMessage;
use crate::topic::Topic;
use serde::Serialize;
use serde_json::json;

/// Speaker data-stream-buffer fill state (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BufferState {
    None,
    UnderrunWarning,
    Underrun,
    OverrunWarning,
    Overrun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InitiatorKind {
    Hold,
    Tap,
    Wakeword,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Initiator {
    #[serde(rename = "type")]
    pub kind: InitiatorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// One emitted engine event. Not `#[serde(tag = "name")]`-derived — the
/// name and payload are split explicitly so both can be folded into the
/// shared `{"name","messageId"?,"payload"}` envelope.
#[derive(Debug, Clone)]
pub enum Event {
    SetAlertSucceeded { token: String },
    SetAlertFailed { token: String },
    DeleteAlertSucceeded { token: String },
    DeleteAlertFailed { token: String },
    AlertVolumeChanged { volume: u8 },
    SpeakerOpened { offset: u64 },
    SpeakerClosed { offset: u64 },
    BufferStateChanged {
        topic: Topic,
        sequence_number: u32,
        state: BufferState,
    },
    SpeakerMarkerEncountered { marker: u32 },
    VolumeChanged { volume: u8, offset: Option<u64> },
    MicrophoneOpened {
        profile: String,
        offset: u64,
        initiator: Option<Initiator>,
    },
    MicrophoneClosed { offset: u64 },
    OpenMicrophoneTimedOut,
    SynchronizeClock,
    ExceptionEncountered {
        topic: Topic,
        sequence_number: u32,
        index: Option<usize>,
        message: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::SetAlertSucceeded { .. } => "SetAlertSucceeded",
            Event::SetAlertFailed { .. } => "SetAlertFailed",
            Event::DeleteAlertSucceeded { .. } => "DeleteAlertSucceeded",
            Event::DeleteAlertFailed { .. } => "DeleteAlertFailed",
            Event::AlertVolumeChanged { .. } => "AlertVolumeChanged",
            Event::SpeakerOpened { .. } => "SpeakerOpened",
            Event::SpeakerClosed { .. } => "SpeakerClosed",
            Event::BufferStateChanged { .. } => "BufferStateChanged",
            Event::SpeakerMarkerEncountered { .. } => "SpeakerMarkerEncountered",
            Event::VolumeChanged { .. } => "VolumeChanged",
            Event::MicrophoneOpened { .. } => "MicrophoneOpened",
            Event::MicrophoneClosed { .. } => "MicrophoneClosed",
            Event::OpenMicrophoneTimedOut => "OpenMicrophoneTimedOut",
            Event::SynchronizeClock => "SynchronizeClock",
            Event::ExceptionEncountered { .. } => "ExceptionEncountered",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            Event::SetAlertSucceeded { token } => json!({ "token": token }),
            Event::SetAlertFailed { token } => json!({ "token": token }),
            Event::DeleteAlertSucceeded { token } => json!({ "token": token }),
            Event::DeleteAlertFailed { token } => json!({ "token": token }),
            Event::AlertVolumeChanged { volume } => json!({ "volume": volume }),
            Event::SpeakerOpened { offset } => json!({ "offset": offset }),
            Event::SpeakerClosed { offset } => json!({ "offset": offset }),
            Event::BufferStateChanged {
                topic,
                sequence_number,
                state,
            } => json!({
                "message": { "topic": topic.wire_name(), "sequenceNumber": sequence_number },
                "state": state,
            }),
            Event::SpeakerMarkerEncountered { marker } => json!({ "marker": marker }),
            Event::VolumeChanged { volume, offset } => json!({ "volume": volume, "offset": offset }),
            Event::MicrophoneOpened {
                profile,
                offset,
                initiator,
            } => json!({ "profile": profile, "offset": offset, "initiator": initiator }),
            Event::MicrophoneClosed { offset } => json!({ "offset": offset }),
            Event::OpenMicrophoneTimedOut => json!({}),
            Event::SynchronizeClock => json!({}),
            Event::ExceptionEncountered {
                topic,
                sequence_number,
                index,
                message,
            } => json!({
                "message": { "topic": topic.wire_name(), "sequenceNumber": sequence_number, "index": index },
                "reason": message,
            }),
        }
    }

    pub fn to_json_message(&self, message_id: Option<String>) -> JsonMessage {
        JsonMessage {
            name: self.name().to_string(),
            message_id,
            payload: self.payload(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_changed_with_offset_serializes_both_fields() {
        let event = Event::VolumeChanged {
            volume: 75,
            offset: Some(4),
        };
        let msg = event.to_json_message(None);
        assert_eq!(msg.name, "VolumeChanged");
        assert_eq!(msg.payload["volume"], 75);
        assert_eq!(msg.payload["offset"], 4);
    }

    #[test]
    fn buffer_state_changed_nests_message_fields() {
        let event = Event::BufferStateChanged {
            topic: Topic::Speaker,
            sequence_number: 42,
            state: BufferState::Overrun,
        };
        let msg = event.to_json_message(None);
        assert_eq!(msg.payload["message"]["topic"], "speaker");
        assert_eq!(msg.payload["message"]["sequenceNumber"], 42);
        assert_eq!(msg.payload["state"], "overrun");
    }

    #[test]
    fn zero_payload_events_serialize_to_empty_object() {
        let event = Event::SynchronizeClock;
        let msg = event.to_json_message(None);
        assert!(msg.payload.as_object().unwrap().is_empty());
    }
}
