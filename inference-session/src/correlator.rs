//! Correlator & streaming aggregator.
//!
//! Tracks in-flight requests on one session, routes decrypted inbound frames
//! to them, accumulates streamed output and settles each request exactly
//! once.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──mark_sent──▶ Sent ──chunk──▶ Streaming ──┐
//!    │                    │                           │
//!    └────────────────────┴──── result / error / timeout / cancel / close
//!                                          │
//!                                          ▼
//!                                       Settled (removed from table)
//! ```
//!
//! Removing the entry from the pending table is the settlement transition.
//! Whoever removes it owns the [`SettlementSlot`] and consumes it; everyone
//! else finds nothing and does nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::envelope::{EnvelopeCodec, InboundEnvelope};
use crate::error::ProtocolError;
use crate::payload::{parse_result, InnerFrame};
use crate::session::Session;
use crate::transport::TransportEvent;
use crate::types::{ExchangeKind, GenerationResult};

/// Result of one logical exchange.
pub type Outcome = Result<GenerationResult, ProtocolError>;

/// Invoked with each streamed piece, in arrival order.
pub type TokenCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Invoked with generation progress updates.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Host-reported progress of a long generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub step: u32,
    pub total: u32,
}

/// Observable state of an unsettled request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Sent,
    Streaming,
}

/// Single-use handle that resolves a request's future.
#[derive(Debug)]
pub struct SettlementSlot(oneshot::Sender<Outcome>);

impl SettlementSlot {
    /// Consume the slot. Returns false if nobody is waiting any more.
    pub fn settle(self, outcome: Outcome) -> bool {
        self.0.send(outcome).is_ok()
    }
}

/// Cooperative cancellation for one or more submits.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`CancelHandle::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so wait_for cannot observe a closed channel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Callbacks attached to a pending request.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_token: Option<TokenCallback>,
    pub on_progress: Option<ProgressCallback>,
}

struct PendingRequest {
    kind: ExchangeKind,
    seq: u64,
    created_at: DateTime<Utc>,
    state: RequestState,
    buffer: String,
    callbacks: Callbacks,
    slot: SettlementSlot,
}

/// Snapshot of a pending request for diagnostics.
#[derive(Debug, Clone)]
pub struct PendingInfo {
    pub request_id: String,
    pub kind: ExchangeKind,
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
    pub buffered: usize,
}

/// Registration returned by [`Correlator::register`].
#[derive(Debug)]
pub struct Registration {
    pub request_id: String,
    pub receiver: oneshot::Receiver<Outcome>,
}

/// Routes inbound frames for one session to pending requests.
pub struct Correlator {
    session: Arc<Session>,
    codec: EnvelopeCodec,
    pending: DashMap<String, PendingRequest>,
    seq: AtomicU64,
}

impl Correlator {
    pub fn new(session: Arc<Session>, codec: EnvelopeCodec) -> Self {
        Self {
            session,
            codec,
            pending: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Register a new pending request before anything is sent.
    pub fn register(&self, kind: ExchangeKind, callbacks: Callbacks) -> Registration {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        self.pending.insert(
            request_id.clone(),
            PendingRequest {
                kind,
                seq: self.seq.fetch_add(1, Ordering::SeqCst),
                created_at: Utc::now(),
                state: RequestState::Created,
                buffer: String::new(),
                callbacks,
                slot: SettlementSlot(tx),
            },
        );

        debug!(request_id = %request_id, ?kind, "Registered pending request");
        Registration {
            request_id,
            receiver: rx,
        }
    }

    /// Guard that settles `request_id` as cancelled on drop.
    pub fn guard<'a>(&'a self, request_id: &'a str) -> PendingGuard<'a> {
        PendingGuard {
            correlator: self,
            request_id,
        }
    }

    pub fn mark_sent(&self, request_id: &str) {
        if let Some(mut entry) = self.pending.get_mut(request_id) {
            if entry.state == RequestState::Created {
                entry.state = RequestState::Sent;
            }
        }
    }

    /// Settle a request. Returns false if it was already settled.
    pub fn settle(&self, request_id: &str, outcome: Outcome) -> bool {
        match self.pending.remove(request_id) {
            Some((_, entry)) => {
                debug!(
                    request_id = %request_id,
                    kind = ?entry.kind,
                    ok = outcome.is_ok(),
                    "Settling request"
                );
                if !entry.slot.settle(outcome) {
                    debug!(request_id = %request_id, "Settled with no waiter");
                }
                true
            }
            None => false,
        }
    }

    /// Settle every pending request with the same failure.
    pub fn fail_all(&self, reason: &str) -> usize {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        ids.iter()
            .filter(|id| self.settle(id, Err(ProtocolError::generation(reason))))
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    pub fn state(&self, request_id: &str) -> Option<RequestState> {
        self.pending.get(request_id).map(|e| e.state)
    }

    /// Partial output streamed so far.
    pub fn partial_output(&self, request_id: &str) -> Option<String> {
        self.pending.get(request_id).map(|e| e.buffer.clone())
    }

    pub fn pending(&self) -> Vec<PendingInfo> {
        let mut infos: Vec<(u64, PendingInfo)> = self
            .pending
            .iter()
            .map(|e| {
                (
                    e.seq,
                    PendingInfo {
                        request_id: e.key().clone(),
                        kind: e.kind,
                        state: e.state,
                        created_at: e.created_at,
                        buffered: e.buffer.len(),
                    },
                )
            })
            .collect();
        infos.sort_by_key(|(seq, _)| *seq);
        infos.into_iter().map(|(_, info)| info).collect()
    }

    /// Wait for settlement, racing the timeout and optional cancellation.
    ///
    /// Timeout and cancel go through [`Correlator::settle`] like any frame,
    /// so if a terminal frame won the race its outcome is what comes back.
    pub async fn wait(
        &self,
        registration: Registration,
        timeout: Duration,
        cancel: Option<&CancelHandle>,
    ) -> Outcome {
        let Registration {
            request_id,
            mut receiver,
        } = registration;
        let _guard = self.guard(&request_id);

        let cancelled = async {
            match cancel {
                Some(handle) => handle.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            outcome = &mut receiver => {
                return outcome.unwrap_or_else(|_| Err(ProtocolError::generation("settlement dropped")));
            }
            _ = tokio::time::sleep(timeout) => {
                if self.settle(&request_id, Err(ProtocolError::Timeout { after: timeout })) {
                    warn!(request_id = %request_id, ?timeout, "Request timed out");
                }
            }
            _ = cancelled => {
                if self.settle(&request_id, Err(ProtocolError::Cancelled)) {
                    debug!(request_id = %request_id, "Request cancelled");
                }
            }
        }

        receiver
            .await
            .unwrap_or_else(|_| Err(ProtocolError::generation("settlement dropped")))
    }

    /// Transport subscription entry point.
    pub fn handle_event(&self, event: &TransportEvent) {
        match event {
            TransportEvent::Frame(frame) => self.handle_frame(frame),
            TransportEvent::Closed(reason) => {
                let reason = reason.as_deref().unwrap_or("no reason given");
                let failed = self.fail_all(&format!("transport closed: {reason}"));
                if failed > 0 {
                    warn!(failed, "Transport closed with requests in flight");
                }
            }
        }
    }

    /// Route one raw inbound frame.
    pub fn handle_frame(&self, frame: &str) {
        let envelope = match InboundEnvelope::parse(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping unroutable frame: {}", e);
                return;
            }
        };

        match envelope {
            InboundEnvelope::Error { message, id } => {
                let message = message.unwrap_or_else(|| "host reported an error".to_string());
                match id {
                    Some(id) => {
                        if !self.settle(&id, Err(ProtocolError::generation(message))) {
                            debug!(request_id = %id, "Error frame for settled request");
                        }
                    }
                    None => {
                        warn!(error = %message, "Session-level error from host");
                        self.fail_all(&message);
                    }
                }
            }
            InboundEnvelope::EncryptedResponse {
                session_id,
                id,
                payload,
            } => {
                if session_id != self.session.session_id() {
                    debug!(session_id = %session_id, "Ignoring frame for another session");
                    return;
                }

                let inner = self
                    .codec
                    .decode(&self.session, &payload)
                    .and_then(|plaintext| InnerFrame::parse(&plaintext));

                match inner {
                    Ok(inner) => self.route(id, inner),
                    Err(err) => {
                        let target = id.or_else(|| self.oldest_pending(|_| true));
                        match target {
                            Some(target) => {
                                warn!(request_id = %target, error = %err, "Undecodable frame");
                                self.settle(&target, Err(err));
                            }
                            None => warn!(error = %err, "Undecodable frame with nothing pending"),
                        }
                    }
                }
            }
        }
    }

    fn oldest_pending(&self, accepts: impl Fn(ExchangeKind) -> bool) -> Option<String> {
        self.pending
            .iter()
            .filter(|e| accepts(e.kind))
            .min_by_key(|e| e.seq)
            .map(|e| e.key().clone())
    }

    fn route(&self, outer_id: Option<String>, frame: InnerFrame) {
        let target = outer_id
            .or_else(|| frame.request_id().map(String::from))
            .or_else(|| self.oldest_pending(|kind| frame.accepted_by(kind)));

        let Some(request_id) = target else {
            debug!("Frame matched no pending request");
            return;
        };

        match frame {
            InnerFrame::StreamChunk { content, .. } => {
                let callback = {
                    let Some(mut entry) = self.pending.get_mut(&request_id) else {
                        debug!(request_id = %request_id, "Late chunk dropped");
                        return;
                    };
                    if !entry.kind.is_streaming() {
                        return;
                    }
                    entry.buffer.push_str(&content);
                    entry.state = RequestState::Streaming;
                    entry.callbacks.on_token.clone()
                };
                // Invoked with no table lock held so the callback may re-enter.
                if let Some(on_token) = callback {
                    on_token(&content);
                }
            }
            InnerFrame::Progress { step, total, .. } => {
                let callback = self
                    .pending
                    .get(&request_id)
                    .and_then(|e| e.callbacks.on_progress.clone());
                if let Some(on_progress) = callback {
                    on_progress(Progress { step, total });
                }
            }
            InnerFrame::StreamEnd { body, .. } | InnerFrame::Result { body, .. } => {
                let Some((_, entry)) = self.pending.remove(&request_id) else {
                    debug!(request_id = %request_id, "Duplicate terminal frame dropped");
                    return;
                };
                let outcome = parse_result(entry.kind, &request_id, &body, &entry.buffer);
                debug!(request_id = %request_id, ok = outcome.is_ok(), "Terminal frame");
                entry.slot.settle(outcome);
            }
            error @ InnerFrame::Error { .. } => {
                let err = error
                    .into_error()
                    .unwrap_or_else(|| ProtocolError::generation("remote error"));
                if !self.settle(&request_id, Err(err)) {
                    debug!(request_id = %request_id, "Error frame for settled request");
                }
            }
        }
    }
}

/// Settles a request as cancelled when dropped, unless it already settled.
///
/// Held by whoever owns the request between registration and settlement, so
/// dropping that future at any await point leaves nothing in the table.
#[must_use = "the request is settled as soon as the guard is dropped"]
pub struct PendingGuard<'a> {
    correlator: &'a Correlator,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator
            .settle(self.request_id, Err(ProtocolError::Cancelled));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ChaChaPolyProvider, EncryptionProvider};
    use crate::envelope::WirePayload;
    use crate::session::{MessageCounter, SessionKey};
    use serde_json::json;
    use std::sync::Mutex;

    const KEY: [u8; 32] = [9u8; 32];

    fn correlator() -> Correlator {
        let session = Arc::new(Session::new("sess", SessionKey::new(KEY), 1));
        Correlator::new(session, EnvelopeCodec::new(Arc::new(ChaChaPolyProvider::new())))
    }

    /// Encrypt a frame the way the host would.
    fn host_frame(inner: serde_json::Value, id: Option<&str>) -> String {
        static HOST_COUNTER: std::sync::OnceLock<MessageCounter> = std::sync::OnceLock::new();
        let counter = HOST_COUNTER.get_or_init(|| MessageCounter::starting_at(1 << 32));
        let sealed = ChaChaPolyProvider::new()
            .encrypt(
                &SessionKey::new(KEY),
                inner.to_string().as_bytes(),
                counter.next(),
            )
            .unwrap();
        let mut frame = json!({
            "type": "encrypted_response",
            "session_id": "sess",
            "payload": WirePayload::from(&sealed),
        });
        if let Some(id) = id {
            frame["id"] = json!(id);
        }
        frame.to_string()
    }

    #[tokio::test]
    async fn test_stream_then_end() {
        let c = correlator();
        let tokens = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&tokens);
        let reg = c.register(
            ExchangeKind::ChatStream,
            Callbacks {
                on_token: Some(Arc::new(move |t: &str| sink.lock().unwrap().push(t.to_string()))),
                on_progress: None,
            },
        );
        let id = reg.request_id.clone();
        c.mark_sent(&id);

        c.handle_frame(&host_frame(json!({"type": "stream_chunk", "content": "Hel"}), None));
        assert_eq!(c.state(&id), Some(RequestState::Streaming));
        c.handle_frame(&host_frame(json!({"type": "stream_chunk", "content": "lo"}), None));
        assert_eq!(c.partial_output(&id).as_deref(), Some("Hello"));
        c.handle_frame(&host_frame(json!({"type": "stream_end", "tokens_used": 2}), None));

        let outcome = c.wait(reg, Duration::from_secs(5), None).await.unwrap();
        assert_eq!(outcome.text(), Some("Hello"));
        assert_eq!(outcome.billing.unwrap().tokens_used, 2);
        assert_eq!(*tokens.lock().unwrap(), vec!["Hel", "lo"]);
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_routes_by_id() {
        let c = correlator();
        let first = c.register(ExchangeKind::ImageGeneration, Callbacks::default());
        let second = c.register(ExchangeKind::ImageGeneration, Callbacks::default());

        c.handle_frame(&host_frame(
            json!({"type": "result", "image": "second"}),
            Some(&second.request_id),
        ));
        assert!(c.is_pending(&first.request_id));
        assert!(!c.is_pending(&second.request_id));

        // Inner id works too
        c.handle_frame(&host_frame(
            json!({"type": "result", "id": first.request_id, "image": "first"}),
            None,
        ));
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fifo_routing_without_id() {
        let c = correlator();
        let progress = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&progress);
        let chat = c.register(ExchangeKind::ChatStream, Callbacks::default());
        let image = c.register(
            ExchangeKind::ImageGeneration,
            Callbacks {
                on_token: None,
                on_progress: Some(Arc::new(move |p| sink.lock().unwrap().push(p))),
            },
        );

        // A progress frame can only belong to the image request
        c.handle_frame(&host_frame(json!({"type": "progress", "step": 1, "total": 4}), None));
        assert_eq!(*progress.lock().unwrap(), vec![Progress { step: 1, total: 4 }]);
        assert!(c.is_pending(&image.request_id));

        // An id-less result goes to the oldest request
        c.handle_frame(&host_frame(json!({"type": "result", "content": "hi"}), None));
        assert!(!c.is_pending(&chat.request_id));
        assert!(c.is_pending(&image.request_id));
    }

    #[tokio::test]
    async fn test_duplicate_terminal_is_noop() {
        let c = correlator();
        let reg = c.register(ExchangeKind::VectorUpload, Callbacks::default());
        let id = reg.request_id.clone();

        let frame = host_frame(json!({"type": "result", "uploaded": 3}), Some(&id));
        c.handle_frame(&frame);
        c.handle_frame(&host_frame(json!({"type": "error", "error_code": "GENERATION_FAILED"}), Some(&id)));
        assert!(!c.settle(&id, Err(ProtocolError::Cancelled)));

        let outcome = c.wait(reg, Duration::from_secs(1), None).await;
        assert!(outcome.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_frame() {
        let c = correlator();
        let reg = c.register(ExchangeKind::ImageGeneration, Callbacks::default());
        let id = reg.request_id.clone();

        let start = tokio::time::Instant::now();
        let outcome = c.wait(reg, Duration::from_millis(500), None).await;
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(matches!(outcome, Err(ProtocolError::Timeout { .. })));

        // Late result has nowhere to go
        c.handle_frame(&host_frame(json!({"type": "result", "image": "late"}), Some(&id)));
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel() {
        let c = correlator();
        let reg = c.register(ExchangeKind::ChatStream, Callbacks::default());
        let cancel = CancelHandle::new();
        cancel.cancel();

        let outcome = c.wait(reg, Duration::from_secs(60), Some(&cancel)).await;
        assert_eq!(outcome, Err(ProtocolError::Cancelled));
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_mapped() {
        let c = correlator();
        let reg = c.register(ExchangeKind::ImageGeneration, Callbacks::default());
        c.handle_frame(&host_frame(
            json!({"type": "error", "error_code": "NSFW_CONTENT", "error": "blocked"}),
            None,
        ));

        let outcome = c.wait(reg, Duration::from_secs(1), None).await;
        assert!(matches!(outcome, Err(ProtocolError::PromptBlocked { .. })));
    }

    #[tokio::test]
    async fn test_tampered_frame_settles_encryption_failed() {
        let c = correlator();
        let reg = c.register(ExchangeKind::VectorSearch, Callbacks::default());
        let mut frame: serde_json::Value =
            serde_json::from_str(&host_frame(json!({"type": "result", "matches": []}), None)).unwrap();
        frame["payload"]["aadHex"] = json!("00");
        c.handle_frame(&frame.to_string());

        let outcome = c.wait(reg, Duration::from_secs(1), None).await;
        assert!(matches!(outcome, Err(ProtocolError::EncryptionFailed(_))));
    }

    #[tokio::test]
    async fn test_outer_error_without_id_fails_all() {
        let c = correlator();
        let a = c.register(ExchangeKind::ChatStream, Callbacks::default());
        let b = c.register(ExchangeKind::VectorSearch, Callbacks::default());
        c.handle_frame(r#"{"type":"error","message":"session expired"}"#);

        assert!(c.wait(a, Duration::from_secs(1), None).await.is_err());
        let err = c.wait(b, Duration::from_secs(1), None).await.unwrap_err();
        assert!(err.to_string().contains("session expired"));
    }

    #[tokio::test]
    async fn test_transport_closed_fails_all() {
        let c = correlator();
        let reg = c.register(ExchangeKind::ImageGeneration, Callbacks::default());
        c.handle_event(&TransportEvent::Closed(Some("reset".into())));

        let err = c.wait(reg, Duration::from_secs(1), None).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_foreign_session_ignored() {
        let c = correlator();
        let reg = c.register(ExchangeKind::ImageGeneration, Callbacks::default());
        let frame = host_frame(json!({"type": "result", "image": "x"}), None)
            .replace("\"sess\"", "\"other\"");
        c.handle_frame(&frame);
        assert!(c.is_pending(&reg.request_id));
    }

    #[tokio::test]
    async fn test_dropped_waiter_cleans_up() {
        let c = correlator();
        let reg = c.register(ExchangeKind::ChatStream, Callbacks::default());
        let id = reg.request_id.clone();
        {
            let wait = c.wait(reg, Duration::from_secs(60), None);
            tokio::pin!(wait);
            let _ = futures::poll!(wait.as_mut());
        }
        assert!(!c.is_pending(&id));
    }
}
