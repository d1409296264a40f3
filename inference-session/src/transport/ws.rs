//! WebSocket transport.
//!
//! One persistent connection to the host. A reader task dispatches inbound
//! text frames in arrival order; sends go through a shared sink. There is no
//! reconnection: a new connection means a new session, and with it a new key
//! and counter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::{FrameDispatcher, FrameHandler, Subscription, Transport, TransportError, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// WebSocket connection to an inference host.
pub struct WsTransport {
    url: String,
    sink: Arc<Mutex<WsSink>>,
    dispatcher: FrameDispatcher,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl WsTransport {
    /// Connect and start the reader task.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        info!("Connecting to host at {}", url);

        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(format!("WebSocket connect failed: {e}")))?;
        let (sink, stream) = ws.split();

        let sink = Arc::new(Mutex::new(sink));
        let dispatcher = FrameDispatcher::new();
        let open = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_loop(stream, dispatcher.clone(), Arc::clone(&open)));

        info!("Connected to host at {}", url);

        Ok(Self {
            url: url.to_string(),
            sink,
            dispatcher,
            open,
            reader,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send a close frame and stop reading.
    pub async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.send(Message::Close(None)).await {
                debug!("Close frame not sent: {}", e);
            }
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(frame))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn on_frame(&self, handler: FrameHandler) -> Subscription {
        self.dispatcher.subscribe(handler)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Dispatch inbound frames until the socket closes.
///
/// Pings are answered by tungstenite itself on the next read or write.
async fn read_loop(
    mut stream: SplitStream<WsStream>,
    dispatcher: FrameDispatcher,
    open: Arc<AtomicBool>,
) {
    let mut reason = None;

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                dispatcher.dispatch(&TransportEvent::Frame(text));
            }
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => dispatcher.dispatch(&TransportEvent::Frame(text)),
                Err(_) => warn!("Dropping non-UTF-8 binary frame"),
            },
            Ok(Message::Close(frame)) => {
                info!("Host closed connection: {:?}", frame);
                reason = frame.map(|f| f.reason.to_string());
                break;
            }
            Err(e) => {
                error!("Host WebSocket error: {}", e);
                reason = Some(e.to_string());
                break;
            }
            _ => {}
        }
    }

    open.store(false, Ordering::SeqCst);
    dispatcher.dispatch(&TransportEvent::Closed(reason));
}
