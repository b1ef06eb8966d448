//! Outbound per-topic message assembly, encryption and publish (§4.2).
//! One emitter per topic; exactly one message is ever in flight from its
//! perspective, the regulator above it serializes calls into `emit`.

use crate::error::EngineError;
use crate::framing::{self, CommonHeader};
use crate::secret::SecretManager;
use crate::stats::Stats;
use crate::topic::{Topic, TopicKind};
use rumqttc::{AsyncClient, QoS};
use std::sync::Arc;

pub struct Emitter {
    topic: Topic,
    device_topic_root: String,
    client: AsyncClient,
    secret: Arc<dyn SecretManager>,
    stats: Arc<Stats>,
    max_message_bytes: usize,
    next_sequence: u32,
    pending: Vec<Vec<u8>>,
    pending_bytes: usize,
}

impl Emitter {
    pub fn new(
        topic: Topic,
        device_topic_root: String,
        client: AsyncClient,
        secret: Arc<dyn SecretManager>,
        stats: Arc<Stats>,
        max_message_bytes: usize,
    ) -> Self {
        Emitter {
            topic,
            device_topic_root,
            client,
            secret,
            stats,
            max_message_bytes,
            next_sequence: 0,
            pending: Vec::new(),
            pending_bytes: 0,
        }
    }

    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    /// Accepts one chunk of the message currently being assembled.
    /// `remaining_bytes == 0` signals end-of-message and triggers assembly,
    /// encryption and publish.
    pub async fn emit(
        &mut self,
        chunk: Vec<u8>,
        remaining_bytes: usize,
        _remaining_chunks: usize,
    ) -> Result<(), EngineError> {
        if self.pending_bytes + chunk.len() > self.max_message_bytes {
            tracing::warn!(topic = %self.topic, "outbound message exceeds max_message_bytes, dropping");
            self.reset_pending();
            return Err(EngineError::malformed(self.topic, "outbound message too large"));
        }
        self.pending_bytes += chunk.len();
        self.pending.push(chunk);

        if remaining_bytes != 0 {
            return Ok(());
        }
        self.finalize().await
    }

    fn reset_pending(&mut self) {
        self.pending.clear();
        self.pending_bytes = 0;
    }

    async fn finalize(&mut self) -> Result<(), EngineError> {
        let body = match self.topic.kind() {
            TopicKind::JsonArray => {
                let array_name = self
                    .topic
                    .array_name()
                    .expect("json-array topic always has an array name");
                framing::build_json_array_body(array_name, &self.pending)
            }
            TopicKind::Binary => {
                let mut out = Vec::with_capacity(self.pending_bytes);
                for chunk in &self.pending {
                    out.extend_from_slice(chunk);
                }
                out
            }
        };
        self.reset_pending();

        let sequence = self.next_sequence;
        let mut plaintext = Vec::with_capacity(4 + body.len());
        plaintext.extend_from_slice(&sequence.to_le_bytes());
        plaintext.extend_from_slice(&body);

        let (iv, mac, ciphertext) = self
            .secret
            .encrypt(self.topic, sequence, &plaintext)
            .map_err(|e| EngineError::fatal(format!("encrypt failed for {}: {e}", self.topic)))?;

        let mut out = Vec::with_capacity(framing::HEADER_LEN + ciphertext.len());
        CommonHeader { sequence, iv, mac }.encode_into(&mut out);
        out.extend_from_slice(&ciphertext);

        let wire_topic = self.topic.wire_topic(&self.device_topic_root);
        match self.client.publish(&wire_topic, QoS::AtMostOnce, false, out).await {
            Ok(()) => self.stats.record_mqtt_publish(),
            Err(e) => {
                self.stats.record_mqtt_publish_error();
                tracing::debug!(error = %e, topic = %self.topic, "mqtt publish error");
            }
        }
        self.next_sequence = self.next_sequence.wrapping_add(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::ChaChaSecretManager;
    use std::collections::HashMap;

    fn test_client() -> AsyncClient {
        let opts = rumqttc::MqttOptions::new("test", "localhost", 1883);
        let (client, _eventloop) = AsyncClient::new(opts, 16);
        client
    }

    fn secret_manager() -> Arc<dyn SecretManager> {
        let mut keys = HashMap::new();
        keys.insert(Topic::Event, [1u8; 32]);
        Arc::new(ChaChaSecretManager::new(keys))
    }

    #[tokio::test]
    async fn oversized_message_is_dropped_and_reported() {
        let mut emitter = Emitter::new(
            Topic::Event,
            "device/abc/".to_string(),
            test_client(),
            secret_manager(),
            Stats::new(),
            8,
        );
        let result = emitter.emit(vec![0u8; 16], 0, 0).await;
        assert!(result.is_err());
        assert_eq!(emitter.pending_bytes, 0);
    }

    #[tokio::test]
    async fn sequence_advances_after_each_finalized_message() {
        let mut emitter = Emitter::new(
            Topic::Event,
            "device/abc/".to_string(),
            test_client(),
            secret_manager(),
            Stats::new(),
            1024,
        );
        assert_eq!(emitter.next_sequence(), 0);
        let chunk = br#"{"name":"Test","payload":{}}"#.to_vec();
        let _ = emitter.emit(chunk, 0, 0).await;
        assert_eq!(emitter.next_sequence(), 1);
    }
}
