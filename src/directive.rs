//! Directive parsing for the *directive* topic (§4.2, §4.4-§4.7). Each
//! `JsonMessage` delivered by the sequencer is matched by `name` into a
//! closed `Directive` enum — unknown names or malformed payloads are a
//! `MalformedMessage`, never a silently-ignored default arm, per the
//! "duck-typed dispatch -> tagged variants" design note.

use crate::error::EngineError;
use crate::events::{Initiator, InitiatorKind};
use crate::framing::JsonMessage;
use crate::topic::Topic;
use crate::ux::AttentionState;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    OpenSpeaker {
        offset: u64,
    },
    CloseSpeaker {
        offset: Option<u64>,
    },
    SetVolume {
        volume: u8,
        offset: Option<u64>,
    },
    OpenMicrophone {
        timeout_ms: u64,
        initiator: Option<Initiator>,
    },
    CloseMicrophone,
    SetAttentionState {
        state: AttentionState,
        offset: Option<u64>,
    },
    SetAlert {
        token: [u8; 8],
        scheduled_time_s: u64,
        duration_ms: u32,
        kind: u8,
    },
    DeleteAlert {
        token: [u8; 8],
    },
    SetAlertVolume {
        volume: u8,
    },
}

fn field<'a>(payload: &'a Value, name: &str) -> Result<&'a Value, EngineError> {
    payload
        .get(name)
        .ok_or_else(|| EngineError::malformed(Topic::Directive, format!("missing \"{name}\"")))
}

fn u64_field(payload: &Value, name: &str) -> Result<u64, EngineError> {
    field(payload, name)?
        .as_u64()
        .ok_or_else(|| EngineError::malformed(Topic::Directive, format!("\"{name}\" must be a non-negative integer")))
}

fn u8_field(payload: &Value, name: &str) -> Result<u8, EngineError> {
    let v = u64_field(payload, name)?;
    u8::try_from(v).map_err(|_| EngineError::malformed(Topic::Directive, format!("\"{name}\" out of range")))
}

fn u32_field(payload: &Value, name: &str) -> Result<u32, EngineError> {
    let v = u64_field(payload, name)?;
    u32::try_from(v).map_err(|_| EngineError::malformed(Topic::Directive, format!("\"{name}\" out of range")))
}

fn optional_u64_field(payload: &Value, name: &str) -> Result<Option<u64>, EngineError> {
    match payload.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| EngineError::malformed(Topic::Directive, format!("\"{name}\" must be a non-negative integer"))),
    }
}

fn string_field(payload: &Value, name: &str) -> Result<String, EngineError> {
    field(payload, name)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| EngineError::malformed(Topic::Directive, format!("\"{name}\" must be a string")))
}

pub fn token_from_hex(s: &str) -> Result<[u8; 8], EngineError> {
    if s.len() != 16 {
        return Err(EngineError::malformed(Topic::Directive, "token must be 16 hex characters"));
    }
    let mut out = [0u8; 8];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let byte_str = std::str::from_utf8(chunk).unwrap();
        out[i] = u8::from_str_radix(byte_str, 16)
            .map_err(|_| EngineError::malformed(Topic::Directive, "token is not valid hex"))?;
    }
    Ok(out)
}

fn token_field(payload: &Value, name: &str) -> Result<[u8; 8], EngineError> {
    token_from_hex(&string_field(payload, name)?)
}

fn parse_initiator(payload: &Value) -> Result<Option<Initiator>, EngineError> {
    match payload.get("initiator") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let kind = match v.get("type").and_then(Value::as_str) {
                Some("hold") => InitiatorKind::Hold,
                Some("tap") => InitiatorKind::Tap,
                Some("wakeword") => InitiatorKind::Wakeword,
                _ => return Err(EngineError::malformed(Topic::Directive, "unknown initiator type")),
            };
            Ok(Some(Initiator {
                kind,
                payload: v.get("payload").cloned(),
            }))
        }
    }
}

fn parse_attention_state(s: &str) -> Result<AttentionState, EngineError> {
    match s {
        "idle" => Ok(AttentionState::Idle),
        "thinking" => Ok(AttentionState::Thinking),
        "speaking" => Ok(AttentionState::Speaking),
        "alerting" => Ok(AttentionState::Alerting),
        "notification-available" => Ok(AttentionState::NotificationAvailable),
        "do-not-disturb" => Ok(AttentionState::DoNotDisturb),
        _ => Err(EngineError::malformed(Topic::Directive, format!("unknown attention state \"{s}\""))),
    }
}

/// Parse one directive message. `msg.name` selects the variant; unknown
/// names are a `MalformedMessage`, matching the closed-set dispatch rule.
pub fn parse(msg: &JsonMessage) -> Result<Directive, EngineError> {
    let p = &msg.payload;
    match msg.name.as_str() {
        "OpenSpeaker" => Ok(Directive::OpenSpeaker {
            offset: u64_field(p, "offset")?,
        }),
        "CloseSpeaker" => Ok(Directive::CloseSpeaker {
            offset: optional_u64_field(p, "offset")?,
        }),
        "SetVolume" => Ok(Directive::SetVolume {
            volume: u8_field(p, "volume")?,
            offset: optional_u64_field(p, "offset")?,
        }),
        "OpenMicrophone" => Ok(Directive::OpenMicrophone {
            timeout_ms: u64_field(p, "timeoutInMilliseconds")?,
            initiator: parse_initiator(p)?,
        }),
        "CloseMicrophone" => Ok(Directive::CloseMicrophone),
        "SetAttentionState" => Ok(Directive::SetAttentionState {
            state: parse_attention_state(&string_field(p, "state")?)?,
            offset: optional_u64_field(p, "offset")?,
        }),
        "SetAlert" => Ok(Directive::SetAlert {
            token: token_field(p, "token")?,
            scheduled_time_s: u64_field(p, "scheduledTime")?,
            duration_ms: u32_field(p, "duration")?,
            kind: u8_field(p, "type")?,
        }),
        "DeleteAlert" => Ok(Directive::DeleteAlert {
            token: token_field(p, "token")?,
        }),
        "SetAlertVolume" => Ok(Directive::SetAlertVolume {
            volume: u8_field(p, "volume")?,
        }),
        other => Err(EngineError::malformed(Topic::Directive, format!("unknown directive \"{other}\""))),
    }
}
