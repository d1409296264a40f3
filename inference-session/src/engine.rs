//! ProtocolEngine - main entry point for submitting work to a host.
//!
//! One engine per session. It owns the validator, rate limiter and
//! correlator, subscribes to the transport, and exposes one `submit` per
//! binding.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::{ChargePolicy, EngineConfig};
use crate::correlator::{
    CancelHandle, Callbacks, Correlator, Outcome, PendingInfo, Progress, ProgressCallback,
    TokenCallback,
};
use crate::crypto::EncryptionProvider;
use crate::envelope::EnvelopeCodec;
use crate::error::ProtocolError;
use crate::http::{HttpBinding, HttpOptions};
use crate::ledger::{Channel, LedgerEntry, UsageLedger};
use crate::payload::{build_request, RequestContext};
use crate::rate_limit::RateLimiter;
use crate::session::Session;
use crate::stream::TokenStream;
use crate::transport::{Subscription, Transport, TransportError, TransportEvent};
use crate::types::{ChatRequest, RequestSpec};
use crate::validator::Validator;

/// Per-call options for the encrypted channel.
#[derive(Clone, Default)]
pub struct SubmitOptions {
    /// Called with each streamed token
    pub on_token: Option<TokenCallback>,
    /// Called with generation progress
    pub on_progress: Option<ProgressCallback>,
    /// Overrides the configured timeout for this kind
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelHandle>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_token(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_token = Some(Arc::new(callback));
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Client-side protocol engine for one session.
pub struct ProtocolEngine {
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    codec: EnvelopeCodec,
    correlator: Arc<Correlator>,
    config: Arc<EngineConfig>,
    validator: Arc<Validator>,
    limiter: Arc<RateLimiter>,
    http: OnceCell<HttpBinding>,
    ledger: UsageLedger,
    subscription: Mutex<Option<Subscription>>,
    closed: AtomicBool,
}

impl ProtocolEngine {
    /// Bind an engine to an established session and start routing frames.
    pub fn open(
        session: Session,
        transport: Arc<dyn Transport>,
        provider: Arc<dyn EncryptionProvider>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let session = Arc::new(session);
        let codec = EnvelopeCodec::new(provider);
        let correlator = Arc::new(Correlator::new(Arc::clone(&session), codec.clone()));

        let router = Arc::clone(&correlator);
        let subscription = transport.on_frame(Arc::new(move |event: &TransportEvent| {
            router.handle_event(event)
        }));

        info!(
            session_id = %session.session_id(),
            chain_id = session.chain_id(),
            counter = session.message_counter(),
            "Protocol engine opened"
        );

        let ledger = UsageLedger::new(config.ledger.max_entries);
        let limiter = Arc::new(RateLimiter::new(&config.rate_limits));
        let validator = Arc::new(Validator::new(config.clone()));

        Arc::new(Self {
            session,
            transport,
            codec,
            correlator,
            config: Arc::new(config),
            validator,
            limiter,
            http: OnceCell::new(),
            ledger,
            subscription: Mutex::new(Some(subscription)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The counter value the next outbound message will use.
    pub fn message_counter(&self) -> u64 {
        self.session.message_counter()
    }

    pub fn pending_count(&self) -> usize {
        self.correlator.pending_count()
    }

    pub fn pending(&self) -> Vec<PendingInfo> {
        self.correlator.pending()
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Submit over the encrypted channel and wait for settlement.
    pub async fn submit(&self, request: impl Into<RequestSpec>, options: SubmitOptions) -> Outcome {
        let request = request.into();
        let kind = request.kind();

        if self.is_closed() {
            return Err(ProtocolError::generation("session closed"));
        }

        self.validator.validate(&request)?;

        let category = kind.rate_category();
        self.limiter.check(category)?;
        let charge = self.limiter.charge_policy();

        let requested_at = Utc::now();
        let registration = self.correlator.register(
            kind,
            Callbacks {
                on_token: options.on_token,
                on_progress: options.on_progress,
            },
        );
        let request_id = registration.request_id.clone();
        // Covers the send as well as the wait.
        let _pending = self.correlator.guard(&request_id);

        if charge == ChargePolicy::OnSend {
            self.limiter.record_admission(category);
        }

        if self.is_closed() {
            // Lost a race with close()
            self.correlator
                .settle(&request_id, Err(ProtocolError::generation("session closed")));
        } else {
            match self.send_request(&request, &request_id).await {
                Ok(()) => self.correlator.mark_sent(&request_id),
                Err(err) => {
                    warn!(request_id = %request_id, ?kind, "Send failed: {}", err);
                    self.correlator.settle(&request_id, Err(err));
                }
            }
        }

        let timeout = options
            .timeout
            .unwrap_or_else(|| self.config.timeouts.for_kind(kind));
        let outcome = self
            .correlator
            .wait(registration, timeout, options.cancel.as_ref())
            .await;

        if outcome.is_ok() && charge == ChargePolicy::OnSuccess {
            self.limiter.record_admission(category);
        }

        match &outcome {
            Ok(_) => info!(request_id = %request_id, ?kind, "Request settled"),
            Err(err) => info!(
                request_id = %request_id,
                ?kind,
                code = err.category().code(),
                "Request failed: {}",
                err
            ),
        }

        self.ledger
            .record(LedgerEntry::new(
                &request_id,
                kind,
                Channel::Encrypted,
                requested_at,
                &outcome,
            ))
            .await;

        outcome
    }

    async fn send_request(&self, request: &RequestSpec, request_id: &str) -> Result<(), ProtocolError> {
        let body = build_request(
            request,
            &RequestContext {
                request_id,
                chain_id: self.session.chain_id(),
                default_steps: self.config.channels.encrypted_default_steps,
                image: &self.config.image,
            },
        )?;
        let plaintext = serde_json::to_vec(&body)
            .map_err(|e| ProtocolError::EncryptionFailed(format!("Failed to encode request: {e}")))?;

        let frame = self
            .codec
            .encode(&self.session, request_id, &plaintext)?
            .to_frame()?;

        self.transport.send(frame).await.map_err(|e| match e {
            TransportError::Closed => ProtocolError::generation("transport closed"),
            other => ProtocolError::GenerationFailed {
                code: Some("TRANSPORT_ERROR".into()),
                message: other.to_string(),
                retry_after: None,
            },
        })
    }

    /// Stream a chat exchange. The final chunk carries the outcome.
    pub fn stream_chat(self: &Arc<Self>, request: ChatRequest, options: SubmitOptions) -> TokenStream {
        let (sender, stream) = TokenStream::channel();

        let mut options = options;
        let feed = sender.callback();
        let caller = options.on_token.take();
        options.on_token = Some(Arc::new(move |token: &str| {
            if let Some(caller) = &caller {
                caller(token);
            }
            feed(token);
        }));

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = engine.submit(request, options).await;
            if sender.finish(outcome).is_err() {
                debug!("Token stream dropped before completion");
            }
        });

        stream
    }

    /// Submit over the plain HTTP fallback.
    pub async fn submit_http(&self, request: impl Into<RequestSpec>, options: HttpOptions) -> Outcome {
        let request = request.into();
        let http = self
            .http
            .get_or_try_init(|| async {
                HttpBinding::new(
                    Arc::clone(&self.config),
                    Arc::clone(&self.validator),
                    Arc::clone(&self.limiter),
                    self.session.chain_id(),
                )
            })
            .await?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let requested_at = Utc::now();
        let outcome = http.submit_as(&request_id, &request, &options).await;

        self.ledger
            .record(LedgerEntry::new(
                request_id,
                request.kind(),
                Channel::Http,
                requested_at,
                &outcome,
            ))
            .await;

        outcome
    }

    /// Settle everything in flight and stop routing frames.
    ///
    /// Later submits fail without touching the counter.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }

        let failed = self.correlator.fail_all("session closed");
        info!(
            session_id = %self.session.session_id(),
            failed,
            "Protocol engine closed"
        );
    }
}
