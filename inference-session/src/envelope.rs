//! Outer wire envelope and the codec binding it to the encryption provider.
//!
//! # Wire format
//!
//! ```text
//! outbound: { "type": "encrypted_message", "session_id", "id",
//!             "payload": { "ciphertextHex", "nonceHex", "aadHex" } }
//! inbound:  { "type": "encrypted_response", "session_id", "id"?, "payload" }
//!           { "type": "error", "message", "id"? }
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::{EncryptionProvider, SealedPayload};
use crate::error::ProtocolError;
use crate::session::Session;

/// Hex-encoded ciphertext triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePayload {
    #[serde(rename = "ciphertextHex")]
    pub ciphertext_hex: String,
    #[serde(rename = "nonceHex")]
    pub nonce_hex: String,
    #[serde(rename = "aadHex")]
    pub aad_hex: String,
}

impl From<&SealedPayload> for WirePayload {
    fn from(sealed: &SealedPayload) -> Self {
        Self {
            ciphertext_hex: hex::encode(&sealed.ciphertext),
            nonce_hex: hex::encode(&sealed.nonce),
            aad_hex: hex::encode(&sealed.aad),
        }
    }
}

impl WirePayload {
    pub fn to_sealed(&self) -> Result<SealedPayload, ProtocolError> {
        let unhex = |name: &str, value: &str| {
            hex::decode(value)
                .map_err(|e| ProtocolError::EncryptionFailed(format!("Invalid {name} hex: {e}")))
        };
        Ok(SealedPayload {
            ciphertext: unhex("ciphertext", &self.ciphertext_hex)?,
            nonce: unhex("nonce", &self.nonce_hex)?,
            aad: unhex("aad", &self.aad_hex)?,
        })
    }
}

/// Envelope sent to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub session_id: String,
    pub id: String,
    pub payload: WirePayload,
}

impl OutboundEnvelope {
    pub const KIND: &'static str = "encrypted_message";

    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self)
            .map_err(|e| ProtocolError::EncryptionFailed(format!("Failed to encode envelope: {e}")))
    }
}

/// Envelope received from the host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEnvelope {
    EncryptedResponse {
        session_id: String,
        #[serde(default)]
        id: Option<String>,
        payload: WirePayload,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        id: Option<String>,
    },
}

impl InboundEnvelope {
    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame)
            .map_err(|e| ProtocolError::EncryptionFailed(format!("Malformed envelope: {e}")))
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::EncryptedResponse { id, .. } | Self::Error { id, .. } => id.as_deref(),
        }
    }
}

/// Encrypts outbound payloads and decrypts inbound ones for a session.
#[derive(Clone)]
pub struct EnvelopeCodec {
    provider: Arc<dyn EncryptionProvider>,
}

impl EnvelopeCodec {
    pub fn new(provider: Arc<dyn EncryptionProvider>) -> Self {
        Self { provider }
    }

    /// Seal `plaintext` under the next counter value.
    ///
    /// The counter advances before encryption, so a failed encrypt or send
    /// never leaves a value available for reuse.
    pub fn encode(
        &self,
        session: &Session,
        request_id: &str,
        plaintext: &[u8],
    ) -> Result<OutboundEnvelope, ProtocolError> {
        let counter = session.next_counter();
        debug!(
            session_id = %session.session_id(),
            request_id = %request_id,
            counter = counter.get(),
            "Encoding envelope"
        );

        let sealed = self.provider.encrypt(session.key(), plaintext, counter)?;

        Ok(OutboundEnvelope {
            kind: OutboundEnvelope::KIND.to_string(),
            session_id: session.session_id().to_string(),
            id: request_id.to_string(),
            payload: WirePayload::from(&sealed),
        })
    }

    /// Decrypt an inbound payload.
    pub fn decode(&self, session: &Session, payload: &WirePayload) -> Result<Vec<u8>, ProtocolError> {
        let sealed = payload.to_sealed()?;
        self.provider.decrypt(session.key(), &sealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ChaChaPolyProvider;
    use crate::session::SessionKey;

    fn session() -> Session {
        Session::new("sess-1", SessionKey::new([5u8; 32]), 84532)
    }

    fn codec() -> EnvelopeCodec {
        EnvelopeCodec::new(Arc::new(ChaChaPolyProvider::new()))
    }

    #[test]
    fn test_encode_shape() {
        let session = session();
        let envelope = codec().encode(&session, "req-1", b"{}").unwrap();
        let json: serde_json::Value = serde_json::from_str(&envelope.to_frame().unwrap()).unwrap();

        assert_eq!(json["type"], "encrypted_message");
        assert_eq!(json["session_id"], "sess-1");
        assert_eq!(json["id"], "req-1");
        assert!(json["payload"]["ciphertextHex"].is_string());
        assert!(json["payload"]["nonceHex"].is_string());
        assert!(json["payload"]["aadHex"].is_string());
    }

    #[test]
    fn test_counter_advances_per_encode() {
        let session = session();
        let codec = codec();
        for _ in 0..5 {
            codec.encode(&session, "r", b"x").unwrap();
        }
        assert_eq!(session.message_counter(), 5);
    }

    #[test]
    fn test_decode_own_payload() {
        let session = session();
        let codec = codec();
        let envelope = codec.encode(&session, "r", b"ping").unwrap();
        assert_eq!(codec.decode(&session, &envelope.payload).unwrap(), b"ping");
    }

    #[test]
    fn test_decode_tampered() {
        let session = session();
        let codec = codec();
        let mut envelope = codec.encode(&session, "r", b"ping").unwrap();
        let mut bytes = hex::decode(&envelope.payload.ciphertext_hex).unwrap();
        bytes[0] ^= 0x01;
        envelope.payload.ciphertext_hex = hex::encode(bytes);

        let err = codec.decode(&session, &envelope.payload).unwrap_err();
        assert!(matches!(err, ProtocolError::EncryptionFailed(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_decode_bad_hex() {
        let payload = WirePayload {
            ciphertext_hex: "zz".into(),
            nonce_hex: "00".into(),
            aad_hex: "".into(),
        };
        assert!(codec().decode(&session(), &payload).is_err());
    }

    #[test]
    fn test_parse_inbound() {
        let frame = r#"{"type":"error","message":"host overloaded"}"#;
        assert_eq!(
            InboundEnvelope::parse(frame).unwrap(),
            InboundEnvelope::Error {
                message: Some("host overloaded".into()),
                id: None
            }
        );
        assert!(InboundEnvelope::parse(r#"{"type":"mystery"}"#).is_err());
    }
}
