//! Inbound decrypt-verify-dispatch glue: broker bytes → `CommonHeader`
//! decode → AEAD decrypt → witness check → per-topic `Sequencer`.

use crate::error::EngineError;
use crate::framing::CommonHeader;
use crate::secret::SecretManager;
use crate::sequencer::{Sequencer, SequenceHandler, WriteOutcome};
use crate::stats::Stats;
use crate::topic::Topic;
use std::sync::Arc;
use std::time::Duration;

/// A decrypted, witness-verified inbound message, stripped of header and
/// AEAD framing.
pub struct DecodedMessage {
    pub sequence: u32,
    pub body: Vec<u8>,
}

/// Decode one raw broker payload for `topic`: split the common header,
/// decrypt with the topic's key, and check the 4-byte witness against the
/// header sequence.
pub fn decrypt_inbound(
    topic: Topic,
    raw: &[u8],
    secret: &dyn SecretManager,
    stats: &Stats,
) -> Result<DecodedMessage, EngineError> {
    let (header, ciphertext) =
        CommonHeader::decode(raw).ok_or_else(|| EngineError::malformed(topic, "truncated header"))?;

    let plaintext = secret
        .decrypt(topic, header.sequence, &header.iv, &header.mac, ciphertext)
        .map_err(|e| {
            stats.record_decrypt_failure();
            EngineError::malformed(topic, format!("decrypt/authentication failed: {e}"))
        })?;

    if plaintext.len() < 4 {
        stats.record_malformed();
        return Err(EngineError::malformed(topic, "missing sequence witness"));
    }
    let witness = u32::from_le_bytes(plaintext[0..4].try_into().unwrap());
    if witness != header.sequence {
        stats.record_malformed();
        return Err(EngineError::malformed(topic, "sequence witness mismatch"));
    }

    Ok(DecodedMessage {
        sequence: header.sequence,
        body: plaintext[4..].to_vec(),
    })
}

/// Owns one topic's sequencer end-to-end: decrypt raw broker bytes, feed
/// the sequencer, and let it deliver in-order bodies to `handler`.
/// Per §4.1's Rust realization, this pump is owned exclusively by the task
/// that drives the topic's inbound dispatch — the sequencer is never
/// shared behind a second lock, and the missing-message timer is a
/// `tokio::time::Sleep` the owning task holds in its own select loop.
pub struct InboundTopicPump<H: SequenceHandler<Message = Vec<u8>>> {
    topic: Topic,
    sequencer: Sequencer<Vec<u8>>,
    handler: H,
    secret: Arc<dyn SecretManager>,
    stats: Arc<Stats>,
}

impl<H: SequenceHandler<Message = Vec<u8>>> InboundTopicPump<H> {
    pub fn new(
        topic: Topic,
        initial_expected: u32,
        max_slots: usize,
        sequence_timeout: Duration,
        handler: H,
        secret: Arc<dyn SecretManager>,
        stats: Arc<Stats>,
    ) -> Self {
        InboundTopicPump {
            topic,
            sequencer: Sequencer::new(initial_expected, max_slots, sequence_timeout),
            handler,
            secret,
            stats,
        }
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Decode and dispatch one raw broker message.
    pub fn handle_raw(&mut self, raw: &[u8]) {
        self.stats.record_mqtt_received();
        match decrypt_inbound(self.topic, raw, self.secret.as_ref(), &self.stats) {
            Ok(msg) => {
                match self.sequencer.write(msg.sequence, msg.body, &mut self.handler) {
                    WriteOutcome::Old => self.stats.record_sequencer_old(),
                    WriteOutcome::Dropped => self.stats.record_sequencer_dropped(),
                    WriteOutcome::Delivered | WriteOutcome::Buffered => {}
                }
            }
            Err(e) => tracing::debug!(topic = %self.topic, error = %e, "inbound decode failed"),
        }
    }

    /// Demand a redrive from `new_expected`, e.g. after a speaker-buffer
    /// overrun.
    pub fn reset_sequence_number(&mut self, new_expected: u32) {
        self.sequencer.reset_sequence_number(new_expected);
    }

    pub fn should_arm_timer(&self) -> bool {
        self.sequencer.should_arm_timer()
    }

    pub fn timeout_duration(&self) -> Duration {
        self.sequencer.timeout_duration()
    }

    pub fn on_timer_expired(&mut self) {
        self.stats.record_sequencer_timeout();
        self.sequencer.on_timer_expired(&mut self.handler);
    }
}
