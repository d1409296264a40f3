//! Scripted host shared by the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use inference_session::envelope::{OutboundEnvelope, WirePayload};
use inference_session::{
    ChaChaPolyProvider, EncryptionProvider, EngineConfig, MemoryTransport, MessageCounter,
    ProtocolEngine, Session, SessionKey,
};
use serde_json::{json, Value};

pub const SESSION_ID: &str = "sess-test";
pub const CHAIN_ID: u64 = 84532;
pub const KEY: [u8; 32] = [42u8; 32];

/// Plays the remote side of a session.
pub struct ScriptedHost {
    key: SessionKey,
    // Replies share the client key, so they draw from a disjoint counter
    // range; see `ChaChaPolyProvider`.
    counter: MessageCounter,
    echo_ids: bool,
    received: Mutex<Vec<Value>>,
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self {
            key: SessionKey::new(KEY),
            counter: MessageCounter::starting_at(1 << 40),
            echo_ids: true,
            received: Mutex::new(Vec::new()),
        }
    }

    /// Reply without echoing request ids.
    pub fn without_ids(mut self) -> Self {
        self.echo_ids = false;
        self
    }

    /// Decrypt an outbound frame into its envelope id and inner request.
    pub fn open(&self, frame: &str) -> (String, Value) {
        let envelope: OutboundEnvelope = serde_json::from_str(frame).unwrap();
        assert_eq!(envelope.kind, "encrypted_message");
        assert_eq!(envelope.session_id, SESSION_ID);

        let sealed = envelope.payload.to_sealed().unwrap();
        let plain = ChaChaPolyProvider::new().decrypt(&self.key, &sealed).unwrap();
        let inner: Value = serde_json::from_slice(&plain).unwrap();
        self.received.lock().unwrap().push(inner.clone());
        (envelope.id, inner)
    }

    /// Encrypt an inner frame into an inbound envelope.
    pub fn reply(&self, request_id: Option<&str>, inner: Value) -> String {
        let sealed = ChaChaPolyProvider::new()
            .encrypt(&self.key, inner.to_string().as_bytes(), self.counter.next())
            .unwrap();
        let mut frame = json!({
            "type": "encrypted_response",
            "session_id": SESSION_ID,
            "payload": WirePayload::from(&sealed),
        });
        if let (true, Some(id)) = (self.echo_ids, request_id) {
            frame["id"] = json!(id);
        }
        frame.to_string()
    }

    /// Inner requests seen so far.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }
}

/// Transport whose host answers each request with `script(request)`.
pub fn scripted_transport(
    host: Arc<ScriptedHost>,
    script: impl Fn(&Value) -> Vec<Value> + Send + Sync + 'static,
) -> Arc<MemoryTransport> {
    Arc::new(MemoryTransport::new().with_responder(move |frame| {
        let (id, request) = host.open(frame);
        script(&request)
            .into_iter()
            .map(|inner| host.reply(Some(&id), inner))
            .collect()
    }))
}

pub fn session() -> Session {
    Session::new(SESSION_ID, SessionKey::new(KEY), CHAIN_ID)
}

pub fn open_engine(transport: Arc<MemoryTransport>, config: EngineConfig) -> Arc<ProtocolEngine> {
    ProtocolEngine::open(session(), transport, Arc::new(ChaChaPolyProvider::new()), config)
}

/// Terminal result frame for whatever kind `request` is.
pub fn success_for(request: &Value) -> Value {
    match request["action"].as_str() {
        Some("prompt") => json!({ "type": "stream_end", "tokens_used": 3 }),
        Some("image_generation") => json!({
            "type": "result",
            "image": "aW1hZ2U=",
            "size": request["size"],
            "seed": 7,
            "billing": { "generationUnits": 1.0 }
        }),
        Some("vector_search") => json!({
            "type": "result",
            "matches": [{ "id": "doc-1", "score": 0.93 }]
        }),
        Some("vector_upload") => json!({ "type": "result", "uploaded": request["vectors"].as_array().map_or(0, |v| v.len()) }),
        other => panic!("unexpected action {other:?}"),
    }
}
