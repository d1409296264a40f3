//! Encryption provider seam.
//!
//! The engine treats the cipher as a black box behind [`EncryptionProvider`].
//! [`ChaChaPolyProvider`] is the reference implementation.
//!
//! # Algorithm
//!
//! - **Encryption**: ChaCha20-Poly1305 (authenticated encryption)
//! - **Nonce**: 4 zero bytes followed by the 8-byte big-endian message counter
//! - **AAD**: the 8-byte big-endian counter, so the host can check ordering

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};

use crate::error::ProtocolError;
use crate::session::{CounterValue, SessionKey};

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// ChaCha20-Poly1305 auth tag length (16 bytes)
pub const AUTH_TAG_LEN: usize = 16;

/// Output of one encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub aad: Vec<u8>,
}

/// Symmetric encryption under the session key.
pub trait EncryptionProvider: Send + Sync {
    /// Encrypt `plaintext`. Consumes the counter so it cannot be reused.
    fn encrypt(
        &self,
        key: &SessionKey,
        plaintext: &[u8],
        counter: CounterValue,
    ) -> Result<SealedPayload, ProtocolError>;

    /// Decrypt and authenticate a payload.
    fn decrypt(&self, key: &SessionKey, payload: &SealedPayload) -> Result<Vec<u8>, ProtocolError>;
}

/// ChaCha20-Poly1305 with a counter-derived nonce.
///
/// The nonce is the big-endian counter behind four zero bytes, so its
/// uniqueness rests entirely on counter uniqueness under the key. Both
/// directions of a session share one key: the client counts up from the
/// session's initial value, and a host replying under the same key must
/// draw its counters from a disjoint range (for example from 2^40). A
/// counter value used by both sides reuses a nonce and breaks the cipher.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChaChaPolyProvider;

impl ChaChaPolyProvider {
    pub fn new() -> Self {
        Self
    }

    fn nonce_for(counter: u64) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }
}

impl EncryptionProvider for ChaChaPolyProvider {
    fn encrypt(
        &self,
        key: &SessionKey,
        plaintext: &[u8],
        counter: CounterValue,
    ) -> Result<SealedPayload, ProtocolError> {
        let counter = counter.consume();
        let nonce = Self::nonce_for(counter);
        let aad = counter.to_be_bytes().to_vec();

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| ProtocolError::EncryptionFailed(format!("Encryption failed: {e}")))?;

        Ok(SealedPayload {
            ciphertext,
            nonce: nonce.to_vec(),
            aad,
        })
    }

    fn decrypt(&self, key: &SessionKey, payload: &SealedPayload) -> Result<Vec<u8>, ProtocolError> {
        if payload.nonce.len() != NONCE_LEN {
            return Err(ProtocolError::EncryptionFailed(format!(
                "Invalid nonce length: expected {}, got {}",
                NONCE_LEN,
                payload.nonce.len()
            )));
        }
        if payload.ciphertext.len() < AUTH_TAG_LEN {
            return Err(ProtocolError::EncryptionFailed(
                "Ciphertext shorter than auth tag".into(),
            ));
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        cipher
            .decrypt(
                Nonce::from_slice(&payload.nonce),
                Payload {
                    msg: &payload.ciphertext,
                    aad: &payload.aad,
                },
            )
            .map_err(|_| ProtocolError::EncryptionFailed("Authentication failed (tampered payload?)".into()))
    }
}
