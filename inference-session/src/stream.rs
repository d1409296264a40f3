//! Streaming response support.
//!
//! Turns the per-token callback of a chat exchange into a [`Stream`] of
//! chunks, ending with a final chunk that carries the settled outcome.

use futures::Stream;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::correlator::{Outcome, TokenCallback};
use crate::error::ProtocolError;

/// A chunk of streamed response.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    /// Token content
    pub content: String,
    /// Whether this is the final chunk
    pub is_final: bool,
    /// Settled outcome (only on final chunk)
    pub outcome: Option<Outcome>,
}

impl StreamChunk {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_final: false,
            outcome: None,
        }
    }

    pub fn final_chunk(outcome: Outcome) -> Self {
        Self {
            content: String::new(),
            is_final: true,
            outcome: Some(outcome),
        }
    }
}

pin_project! {
    /// Stream of tokens from a chat exchange.
    pub struct TokenStream {
        #[pin]
        receiver: mpsc::UnboundedReceiver<StreamChunk>,
        accumulated: String,
        complete: bool,
        outcome: Option<Outcome>,
    }
}

impl TokenStream {
    pub fn new(receiver: mpsc::UnboundedReceiver<StreamChunk>) -> Self {
        Self {
            receiver,
            accumulated: String::new(),
            complete: false,
            outcome: None,
        }
    }

    /// Create a sender/receiver pair.
    ///
    /// Unbounded because tokens are pushed from synchronous frame callbacks.
    pub fn channel() -> (TokenStreamSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TokenStreamSender { sender: tx }, Self::new(rx))
    }

    /// Content received so far.
    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Outcome, once the final chunk has been read.
    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    /// Drain the stream and return the settled outcome.
    pub async fn collect(mut self) -> Outcome {
        use futures::StreamExt;

        while self.next().await.is_some() {}

        self.outcome
            .take()
            .unwrap_or_else(|| Err(ProtocolError::generation("stream ended without a result")))
    }
}

impl Stream for TokenStream {
    type Item = StreamChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.complete {
            return Poll::Ready(None);
        }

        match this.receiver.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                this.accumulated.push_str(&chunk.content);

                if chunk.is_final {
                    *this.complete = true;
                    *this.outcome = chunk.outcome.clone();
                }

                Poll::Ready(Some(chunk))
            }
            Poll::Ready(None) => {
                *this.complete = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Sender for a token stream.
#[derive(Clone)]
pub struct TokenStreamSender {
    sender: mpsc::UnboundedSender<StreamChunk>,
}

impl TokenStreamSender {
    pub fn send(&self, content: impl Into<String>) -> Result<(), StreamError> {
        self.sender
            .send(StreamChunk::content(content))
            .map_err(|_| StreamError::Closed)
    }

    /// Send the final chunk.
    pub fn finish(self, outcome: Outcome) -> Result<(), StreamError> {
        self.sender
            .send(StreamChunk::final_chunk(outcome))
            .map_err(|_| StreamError::Closed)
    }

    /// A token callback feeding this stream. Tokens sent after the reader
    /// is gone are dropped.
    pub fn callback(&self) -> TokenCallback {
        let sender = self.clone();
        Arc::new(move |token: &str| {
            let _ = sender.send(token);
        })
    }
}

/// Error during streaming.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Stream was closed
    #[error("Stream closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExchangeKind, GenerationResult, ResultContent};
    use futures::StreamExt;

    fn chat_result(text: &str) -> GenerationResult {
        GenerationResult {
            request_id: "r1".into(),
            kind: ExchangeKind::ChatStream,
            content: ResultContent::Text { text: text.into() },
            safety: None,
            billing: None,
            provider: None,
        }
    }

    #[tokio::test]
    async fn test_token_stream() {
        let (sender, mut stream) = TokenStream::channel();

        let on_token = sender.callback();
        on_token("Hello");
        on_token(", ");
        on_token("world");
        sender.finish(Ok(chat_result("Hello, world"))).unwrap();

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk);
        }

        assert_eq!(chunks.len(), 4);
        assert!(chunks[3].is_final);
        assert_eq!(stream.accumulated(), "Hello, world");
        assert!(stream.is_complete());
        assert!(stream.outcome().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_collect_error() {
        let (sender, stream) = TokenStream::channel();
        sender.send("partial").unwrap();
        sender.finish(Err(ProtocolError::Cancelled)).unwrap();

        assert_eq!(stream.collect().await, Err(ProtocolError::Cancelled));
    }

    #[tokio::test]
    async fn test_sender_dropped_without_finish() {
        let (sender, stream) = TokenStream::channel();
        sender.send("x").unwrap();
        drop(sender);

        assert!(stream.collect().await.is_err());
    }
}
