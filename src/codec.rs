//! Symmetric payload obfuscation for the live channel.
//!
//! Message bodies are sealed with XChaCha20-Poly1305 under a shared key and
//! carried as base64 text. A baked-in fallback key is used when no session
//! key is supplied, so this is transport obfuscation only: anyone holding
//! the crate holds the default key. It is not authentication and must not
//! be presented as end-to-end security.
//!
//! Decode never fails outward: wrong key, truncation, or corruption all
//! degrade to the [`UNREADABLE_PLACEHOLDER`] sentinel so a single bad
//! payload can never take down the merge pipeline.

use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

use crate::protocol::ChatError;

/// Sentinel substituted for payloads the codec cannot reverse.
pub const UNREADABLE_PLACEHOLDER: &str = "[unreadable message]";

/// Fallback key used when no session key is supplied.
const DEFAULT_KEY: [u8; 32] = *b"portal-chat-default-transport-k1";

const NONCE_LEN: usize = 24;

/// Symmetric encoder/decoder for message content.
#[derive(Clone)]
pub struct MessageCodec {
    cipher: XChaCha20Poly1305,
}

impl MessageCodec {
    /// Codec over the baked-in fallback key.
    pub fn new() -> Self {
        Self::with_key(DEFAULT_KEY)
    }

    /// Codec over a caller-supplied session key.
    pub fn with_key(key: [u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    /// Seal plaintext for transport: random nonce ‖ ciphertext, base64.
    pub fn encode(&self, plaintext: &str) -> String {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = XNonce::from_slice(&nonce_bytes);
        match self.cipher.encrypt(nonce, plaintext.as_bytes()) {
            Ok(ciphertext) => {
                let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
                framed.extend_from_slice(&nonce_bytes);
                framed.extend_from_slice(&ciphertext);
                base64::engine::general_purpose::STANDARD.encode(framed)
            }
            Err(_) => {
                // Sealing a short UTF-8 string cannot overflow the cipher;
                // pass the payload through rather than lose the message.
                log::warn!("codec: encrypt failed, sending payload unsealed");
                plaintext.to_string()
            }
        }
    }

    /// Reverse [`encode`](Self::encode); degrades to the sentinel on any failure.
    pub fn decode(&self, sealed: &str) -> String {
        match self.try_decode(sealed) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                log::warn!("codec: {e}");
                UNREADABLE_PLACEHOLDER.to_string()
            }
        }
    }

    fn try_decode(&self, sealed: &str) -> Result<String, ChatError> {
        let framed = base64::engine::general_purpose::STANDARD
            .decode(sealed)
            .map_err(|e| ChatError::DecodeFailure(format!("base64: {e}")))?;
        if framed.len() <= NONCE_LEN {
            return Err(ChatError::DecodeFailure("payload shorter than nonce".to_string()));
        }
        let (nonce_bytes, ciphertext) = framed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| ChatError::DecodeFailure("authentication failed".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|e| ChatError::DecodeFailure(format!("not utf-8: {e}")))
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}
