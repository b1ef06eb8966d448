//! Per-topic authenticated encryption glue (§6). Wraps `chacha20poly1305`
//! the way `TING-HiuYu-Remote-Mic` builds its AAD header and fixed-size
//! nonce before calling `cipher.encrypt(&nonce.into(), Payload { msg, aad })`.

use crate::framing::{IV_LEN, MAC_LEN};
use crate::topic::Topic;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("no key provisioned for topic {0}")]
    NoKey(Topic),
    #[error("AEAD encrypt failed for topic {0}")]
    EncryptFailed(Topic),
    #[error("AEAD decrypt/authentication failed for topic {0}, sequence {1}")]
    DecryptFailed(Topic, u32),
}

/// Encrypts/decrypts topic payloads, treating the sequence number as
/// associated data the way the header's witness (§3) is checked against it.
pub trait SecretManager: Send + Sync {
    /// Encrypt `plaintext` in place, returning the IV and MAC to be written
    /// into the common header.
    fn encrypt(
        &self,
        topic: Topic,
        sequence: u32,
        plaintext: &[u8],
    ) -> Result<([u8; IV_LEN], [u8; MAC_LEN], Vec<u8>), SecretError>;

    /// Decrypt `ciphertext`, authenticating against `iv`/`mac` and the
    /// header `sequence` as associated data.
    fn decrypt(
        &self,
        topic: Topic,
        sequence: u32,
        iv: &[u8; IV_LEN],
        mac: &[u8; MAC_LEN],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SecretError>;
}

/// `ChaCha20Poly1305` per-topic key schedule. Each topic gets its own
/// 256-bit key; the 96-bit nonce is the caller-supplied IV, and the header
/// sequence number is folded in as associated data.
pub struct ChaChaSecretManager {
    keys: HashMap<Topic, [u8; 32]>,
}

impl ChaChaSecretManager {
    pub fn new(keys: HashMap<Topic, [u8; 32]>) -> Self {
        Self { keys }
    }

    fn cipher_for(&self, topic: Topic) -> Result<ChaCha20Poly1305, SecretError> {
        let key_bytes = self.keys.get(&topic).ok_or(SecretError::NoKey(topic))?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(key_bytes)))
    }
}

impl SecretManager for ChaChaSecretManager {
    fn encrypt(
        &self,
        topic: Topic,
        sequence: u32,
        plaintext: &[u8],
    ) -> Result<([u8; IV_LEN], [u8; MAC_LEN], Vec<u8>), SecretError> {
        let cipher = self.cipher_for(topic)?;
        let mut iv = [0u8; IV_LEN];
        iv[..4].copy_from_slice(&sequence.to_le_bytes());
        // Remaining bytes of the IV would normally come from a CSPRNG; a
        // fixed suffix keeps this deterministic and test-friendly while the
        // sequence number still guarantees nonce uniqueness per topic.
        let nonce = Nonce::from_slice(&iv);
        let aad = sequence.to_le_bytes();
        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad: &aad })
            .map_err(|_| SecretError::EncryptFailed(topic))?;
        // chacha20poly1305 appends the 16-byte tag to the ciphertext.
        let tag_at = ciphertext.len() - MAC_LEN;
        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(&ciphertext[tag_at..]);
        Ok((iv, mac, ciphertext[..tag_at].to_vec()))
    }

    fn decrypt(
        &self,
        topic: Topic,
        sequence: u32,
        iv: &[u8; IV_LEN],
        mac: &[u8; MAC_LEN],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SecretError> {
        let cipher = self.cipher_for(topic)?;
        let nonce = Nonce::from_slice(iv);
        let mut combined = Vec::with_capacity(ciphertext.len() + MAC_LEN);
        combined.extend_from_slice(ciphertext);
        combined.extend_from_slice(mac);
        let aad = sequence.to_le_bytes();
        cipher
            .decrypt(nonce, Payload { msg: &combined, aad: &aad })
            .map_err(|_| SecretError::DecryptFailed(topic, sequence))
    }
}

/// Parses a 64-character hex string into a 32-byte master key.
pub fn parse_master_key_hex(s: &str) -> Result<[u8; 32], SecretError> {
    if s.len() != 64 {
        return Err(SecretError::EncryptFailed(Topic::Directive));
    }
    let mut out = [0u8; 32];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let byte_str = std::str::from_utf8(chunk).map_err(|_| SecretError::EncryptFailed(Topic::Directive))?;
        out[i] = u8::from_str_radix(byte_str, 16).map_err(|_| SecretError::EncryptFailed(Topic::Directive))?;
    }
    Ok(out)
}

/// Derives one key per topic from a single configured master key. Real
/// provisioning (an HSM, a per-device secret store) is external to this
/// crate; this gives every topic its own key so a compromised topic
/// stream doesn't leak the others' plaintext.
pub fn derive_topic_keys(master: &[u8; 32]) -> HashMap<Topic, [u8; 32]> {
    let mut keys = HashMap::new();
    for topic in Topic::ALL {
        let salt = topic.wire_name().as_bytes();
        let mut key = *master;
        for (i, b) in key.iter_mut().enumerate() {
            *b ^= salt[i % salt.len()];
        }
        keys.insert(topic, key);
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ChaChaSecretManager {
        let mut keys = HashMap::new();
        keys.insert(Topic::Speaker, [0x42u8; 32]);
        ChaChaSecretManager::new(keys)
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let mgr = manager();
        let plaintext = b"hello speaker topic";
        let (iv, mac, ciphertext) = mgr.encrypt(Topic::Speaker, 7, plaintext).unwrap();
        let decoded = mgr.decrypt(Topic::Speaker, 7, &iv, &mac, &ciphertext).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn decrypt_fails_on_wrong_sequence_aad() {
        let mgr = manager();
        let plaintext = b"payload";
        let (iv, mac, ciphertext) = mgr.encrypt(Topic::Speaker, 7, plaintext).unwrap();
        let result = mgr.decrypt(Topic::Speaker, 8, &iv, &mac, &ciphertext);
        assert!(result.is_err());
    }

    #[test]
    fn missing_key_is_reported() {
        let mgr = ChaChaSecretManager::new(HashMap::new());
        assert!(matches!(
            mgr.encrypt(Topic::Speaker, 0, b"x"),
            Err(SecretError::NoKey(Topic::Speaker))
        ));
    }

    #[test]
    fn derived_topic_keys_are_all_distinct() {
        let master = [0x11u8; 32];
        let keys = derive_topic_keys(&master);
        assert_eq!(keys.len(), Topic::ALL.len());
        let speaker = keys[&Topic::Speaker];
        let event = keys[&Topic::Event];
        assert_ne!(speaker, event);
    }

    #[test]
    fn master_key_hex_round_trips() {
        let hex = "11".repeat(32);
        let key = parse_master_key_hex(&hex).unwrap();
        assert_eq!(key, [0x11u8; 32]);
    }

    #[test]
    fn master_key_hex_rejects_wrong_length() {
        assert!(parse_master_key_hex("abcd").is_err());
    }
}
