//! Transport abstraction layer.
//!
//! The engine only needs two things from a socket: send a text frame, and
//! deliver inbound frames in the order they arrived. Implementations:
//! - [`MemoryTransport`] for tests and in-process loopback
//! - [`WsTransport`] over WebSocket

pub mod memory;
pub mod ws;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;

pub use memory::MemoryTransport;
pub use ws::WsTransport;

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection is closed
    #[error("Transport closed")]
    Closed,

    /// Frame could not be sent
    #[error("Send failed: {0}")]
    Send(String),

    /// Connection could not be established
    #[error("Connect failed: {0}")]
    Connect(String),
}

/// Something the transport delivers to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An inbound text frame
    Frame(String),
    /// The connection closed, with an optional reason
    Closed(Option<String>),
}

/// Subscriber callback. Runs synchronously on the dispatching task and must
/// not block; spawn for anything asynchronous.
pub type FrameHandler = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// Persistent connection to a host.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame. Delivery is not guaranteed.
    async fn send(&self, frame: String) -> Result<(), TransportError>;

    /// Register a handler for inbound events.
    fn on_frame(&self, handler: FrameHandler) -> Subscription;

    /// Whether the connection is believed to be open.
    fn is_open(&self) -> bool {
        true
    }
}

/// Handle to a handler registration. Unsubscribes on drop.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to undo.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[derive(Default)]
struct DispatcherInner {
    handlers: Mutex<Vec<(u64, FrameHandler)>>,
    next_id: AtomicU64,
    // Serializes dispatch so event N's handlers return before event N+1's run.
    turn: Mutex<()>,
}

/// Shared dispatch point for transport implementations.
///
/// Handlers are snapshotted before invocation, so a handler may subscribe
/// or unsubscribe (including itself) without deadlocking.
#[derive(Clone, Default)]
pub struct FrameDispatcher {
    inner: Arc<DispatcherInner>,
}

impl FrameDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: FrameHandler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));

        let weak: Weak<DispatcherInner> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .handlers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(h, _)| *h != id);
            }
        })
    }

    /// Deliver one event to every current handler.
    pub fn dispatch(&self, event: &TransportEvent) {
        let _turn = self.inner.turn.lock().unwrap_or_else(PoisonError::into_inner);
        let handlers: Vec<FrameHandler> = self
            .inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();

        for handler in handlers {
            handler(event);
        }
    }

    pub fn handler_count(&self) -> usize {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
