//! In-process transport for testing.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::{FrameDispatcher, FrameHandler, Subscription, Transport, TransportError, TransportEvent};

/// Produces reply frames for a sent frame.
pub type Responder = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

/// Mock transport for testing.
///
/// Records sent frames, lets tests inject inbound frames, and can play a
/// scripted host through a [`Responder`].
pub struct MemoryTransport {
    dispatcher: FrameDispatcher,
    sent: Mutex<Vec<String>>,
    send_count: AtomicU32,
    fail_sends: AtomicBool,
    open: AtomicBool,
    responder: Mutex<Option<Responder>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            dispatcher: FrameDispatcher::new(),
            sent: Mutex::new(Vec::new()),
            send_count: AtomicU32::new(0),
            fail_sends: AtomicBool::new(false),
            open: AtomicBool::new(true),
            responder: Mutex::new(None),
        }
    }

    /// Reply to every sent frame with the responder's output.
    ///
    /// Replies are delivered from a spawned task, after `send` returns.
    pub fn with_responder(self, responder: impl Fn(&str) -> Vec<String> + Send + Sync + 'static) -> Self {
        *self.responder.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(responder));
        self
    }

    /// Make subsequent sends fail.
    pub fn with_failing_sends(self, fail: bool) -> Self {
        self.fail_sends.store(fail, Ordering::SeqCst);
        self
    }

    pub fn set_failing_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Number of times `send` was called, including failed sends.
    pub fn send_count(&self) -> u32 {
        self.send_count.load(Ordering::SeqCst)
    }

    /// Frames successfully sent so far.
    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Inject an inbound frame.
    pub fn deliver(&self, frame: impl Into<String>) {
        self.dispatcher.dispatch(&TransportEvent::Frame(frame.into()));
    }

    /// Close the connection and notify subscribers.
    pub fn close(&self, reason: Option<&str>) {
        self.open.store(false, Ordering::SeqCst);
        self.dispatcher
            .dispatch(&TransportEvent::Closed(reason.map(String::from)));
    }

    pub fn subscriber_count(&self) -> usize {
        self.dispatcher.handler_count()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        self.send_count.fetch_add(1, Ordering::SeqCst);

        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send("Mock transport send failure".to_string()));
        }

        let responder = self
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let replies = responder.map(|r| r(&frame)).unwrap_or_default();

        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);

        if !replies.is_empty() {
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                for reply in replies {
                    dispatcher.dispatch(&TransportEvent::Frame(reply));
                    tokio::task::yield_now().await;
                }
            });
        }

        Ok(())
    }

    fn on_frame(&self, handler: FrameHandler) -> Subscription {
        self.dispatcher.subscribe(handler)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
