//! Inference Session - encrypted client protocol for pay-per-token hosts
//!
//! Submits chat, image and vector work to a remote inference host over one
//! persistent, encrypted session:
//! - Local validation and per-category rate limiting before anything is sent
//! - ChaCha20-Poly1305 envelopes keyed by a strictly monotonic counter
//! - Correlation of streamed and terminal frames back to their request
//! - Exactly-once settlement with timeout and cancellation
//! - Plain HTTP fallback sharing the same validation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            ProtocolEngine               │
//! │   (submit / submit_http / close)        │
//! └────────────────┬────────────────────────┘
//!                  │
//!      ┌───────────┼───────────────┐
//!      ▼           ▼               ▼
//! ┌──────────┐ ┌──────────┐  ┌─────────────┐
//! │Validator │ │  Rate    │  │ HttpBinding │
//! │          │ │ Limiter  │  │  (reqwest)  │
//! └──────────┘ └──────────┘  └─────────────┘
//!                  │
//!                  ▼
//! ┌─────────────┐       ┌─────────────┐
//! │ Envelope    │──────▶│ Transport   │
//! │ Codec       │       │ (WS/memory) │
//! └─────────────┘       └──────┬──────┘
//!        ▲                     │ frames
//!        │              ┌──────▼──────┐
//!        └──────────────│ Correlator  │
//!                       └─────────────┘
//! ```

pub mod config;
pub mod correlator;
pub mod crypto;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod http;
pub mod ledger;
pub mod payload;
pub mod rate_limit;
pub mod retry;
pub mod session;
pub mod stream;
pub mod transport;
pub mod types;
pub mod validator;

// Re-export main types for convenience
pub use config::{ChargePolicy, ConfigError, EngineConfig};
pub use correlator::{CancelHandle, Outcome, Progress};
pub use crypto::{ChaChaPolyProvider, EncryptionProvider, SealedPayload};
pub use engine::{ProtocolEngine, SubmitOptions};
pub use error::{ErrorCategory, ProtocolError, RemoteErrorCode};
pub use http::{HttpBinding, HttpOptions};
pub use ledger::{LedgerSummary, UsageLedger};
pub use retry::{with_retry, RetryPolicy};
pub use session::{CounterValue, MessageCounter, Session, SessionKey};
pub use stream::TokenStream;
pub use transport::{MemoryTransport, Transport, TransportError, TransportEvent, WsTransport};
pub use types::*;
