//! Bit-exact wire framing: the common header, JSON-array message envelopes,
//! and binary topic entries (§3, §6).

use crate::error::EngineError;
use crate::topic::Topic;

/// `u32 LE sequence | 12 bytes IV | 16 bytes MAC`.
pub const HEADER_LEN: usize = 4 + 12 + 16;
pub const IV_LEN: usize = 12;
pub const MAC_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub sequence: u32,
    pub iv: [u8; IV_LEN],
    pub mac: [u8; MAC_LEN],
}

impl CommonHeader {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.mac);
    }

    pub fn decode(buf: &[u8]) -> Option<(Self, &[u8])> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let sequence = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&buf[4..4 + IV_LEN]);
        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(&buf[4 + IV_LEN..HEADER_LEN]);
        Some((CommonHeader { sequence, iv, mac }, &buf[HEADER_LEN..]))
    }
}

/// Binary entry types on the speaker topic.
pub const ENTRY_SPEAKER_CONTENT: u8 = 0x01;
pub const ENTRY_SPEAKER_MARKER: u8 = 0x02;
/// Binary entry type on the microphone topic.
pub const ENTRY_MICROPHONE_CONTENT: u8 = 0x10;

pub const ENTRY_HEADER_LEN: usize = 4 + 1 + 1 + 2;

/// A parsed binary-topic entry: `length:u32 | type:u8 | count:u8 | reserved:2 | data[length]`.
#[derive(Debug, Clone)]
pub struct BinaryEntry<'a> {
    pub entry_type: u8,
    /// Zero-indexed item count; the wire value is `count + 1` items.
    pub count: u8,
    pub data: &'a [u8],
}

impl<'a> BinaryEntry<'a> {
    /// Number of items this entry actually carries (`count + 1`).
    pub fn item_count(&self) -> usize {
        self.count as usize + 1
    }

    /// Parse every entry out of a decrypted binary-topic payload.
    pub fn parse_all(mut buf: &'a [u8], topic: Topic) -> Result<Vec<BinaryEntry<'a>>, EngineError> {
        let mut entries = Vec::new();
        while !buf.is_empty() {
            if buf.len() < ENTRY_HEADER_LEN {
                return Err(EngineError::malformed(topic, "truncated entry header"));
            }
            let length = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
            let entry_type = buf[4];
            let count = buf[5];
            // buf[6..8] reserved, ignored.
            let data_start = ENTRY_HEADER_LEN;
            let data_end = data_start
                .checked_add(length)
                .ok_or_else(|| EngineError::malformed(topic, "entry length overflow"))?;
            if data_end > buf.len() {
                return Err(EngineError::malformed(topic, "entry length exceeds payload"));
            }
            entries.push(BinaryEntry {
                entry_type,
                count,
                data: &buf[data_start..data_end],
            });
            buf = &buf[data_end..];
        }
        Ok(entries)
    }

    /// Encode one entry into `out`.
    pub fn encode_into(entry_type: u8, count: u8, data: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.push(entry_type);
        out.push(count);
        out.extend_from_slice(&[0u8; 2]);
        out.extend_from_slice(data);
    }
}

/// Parsed `speaker-content` entry data: `u64 LE offset | count+1 equal-size frames`.
pub struct SpeakerContent<'a> {
    pub offset: u64,
    pub frames: Vec<&'a [u8]>,
    pub frame_size: usize,
}

impl<'a> SpeakerContent<'a> {
    pub fn parse(entry: &BinaryEntry<'a>, topic: Topic) -> Result<Self, EngineError> {
        if entry.data.len() < 8 {
            return Err(EngineError::malformed(topic, "speaker-content missing offset"));
        }
        let offset = u64::from_le_bytes(entry.data[0..8].try_into().unwrap());
        let audio = &entry.data[8..];
        let n = entry.item_count();
        if n == 0 || audio.len() % n != 0 {
            return Err(EngineError::malformed(topic, "speaker-content frames not equal-size"));
        }
        let frame_size = audio.len() / n;
        let frames = audio.chunks(frame_size).collect();
        Ok(SpeakerContent {
            offset,
            frames,
            frame_size,
        })
    }

    pub fn total_audio_bytes(&self) -> usize {
        self.frames.len() * self.frame_size
    }
}

/// Parsed `speaker-marker` entry data: `count+1 x u32 LE marker`.
pub fn parse_speaker_markers(entry: &BinaryEntry<'_>, topic: Topic) -> Result<Vec<u32>, EngineError> {
    let n = entry.item_count();
    if entry.data.len() != n * 4 {
        return Err(EngineError::malformed(topic, "speaker-marker size mismatch"));
    }
    Ok(entry
        .data
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

/// Parsed `microphone-content` entry data: `u64 LE offset | samples`.
pub struct MicrophoneContent<'a> {
    pub offset: u64,
    pub samples: &'a [u8],
}

impl<'a> MicrophoneContent<'a> {
    pub fn parse(entry: &BinaryEntry<'a>, topic: Topic) -> Result<Self, EngineError> {
        if entry.data.len() < 8 {
            return Err(EngineError::malformed(topic, "microphone-content missing offset"));
        }
        let offset = u64::from_le_bytes(entry.data[0..8].try_into().unwrap());
        Ok(MicrophoneContent {
            offset,
            samples: &entry.data[8..],
        })
    }

    pub fn build(offset: u64, samples: &[u8]) -> Vec<u8> {
        let mut data = Vec::with_capacity(8 + samples.len());
        data.extend_from_slice(&offset.to_le_bytes());
        data.extend_from_slice(samples);
        data
    }
}

/// One message inside a JSON-array topic body:
/// `{"name":"...","messageId":"..."?,"payload":{...}}`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JsonMessage {
    pub name: String,
    #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub payload: serde_json::Value,
}

/// Parse `{"<arrayName>":[<msg>, ...]}`, returning the messages in wire order.
pub fn parse_json_array_body(
    body: &[u8],
    topic: Topic,
) -> Result<Vec<JsonMessage>, EngineError> {
    let array_name = topic
        .array_name()
        .ok_or_else(|| EngineError::Internal(format!("{topic} is not a JSON-array topic")))?;
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| EngineError::malformed(topic, format!("invalid JSON: {e}")))?;
    let arr = value
        .get(array_name)
        .and_then(|v| v.as_array())
        .ok_or_else(|| EngineError::malformed(topic, format!("missing \"{array_name}\" array")))?;
    arr.iter()
        .map(|m| {
            serde_json::from_value(m.clone())
                .map_err(|e| EngineError::malformed(topic, format!("invalid message: {e}")))
        })
        .collect()
}

/// Build `{"<arrayName>":[<msg1>,<msg2>,...]}` from pre-serialized chunk bytes.
pub fn build_json_array_body(array_name: &str, chunks: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = chunks.iter().map(|c| c.len()).sum();
    let mut out = Vec::with_capacity(total + array_name.len() + 8 + chunks.len());
    out.extend_from_slice(b"{\"");
    out.extend_from_slice(array_name.as_bytes());
    out.extend_from_slice(b"\":[");
    for (i, chunk) in chunks.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        out.extend_from_slice(chunk);
    }
    out.extend_from_slice(b"]}");
    out
}

/// Serializes one `JsonMessage` into the chunk bytes a regulator expects
/// for a JSON-array topic; `build_json_array_body` stitches the chunks
/// of one flush into the final `{"<arrayName>":[...]}` wire body.
pub fn encode_json_message_chunk(msg: &JsonMessage) -> Vec<u8> {
    serde_json::to_vec(msg).expect("JsonMessage always serializes")
}
