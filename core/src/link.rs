//! Links: the transport-agnostic view of one bidirectional connection
//!
//! Every transport the relay or a client touches (a warp WebSocket, a
//! tungstenite WebSocket, an in-memory channel pair) is adapted into a [`Link`]:
//! a sink of outbound [`Frame`]s plus a stream of inbound ones.

use futures::channel::mpsc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use thiserror::Error;
use tracing::debug;

// ============================================================================
// FRAMES
// ============================================================================

/// One message carried by a link. The frame kind survives a pipe unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Frame::Text(text.into())
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Frame::Binary(data.into())
    }

    /// Raw payload bytes regardless of frame kind
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Frame::Text(text) => text.as_bytes(),
            Frame::Binary(data) => data,
        }
    }

    /// Text payload, if this is a text frame
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(text) => Some(text),
            Frame::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<&str> for Frame {
    fn from(text: &str) -> Self {
        Frame::Text(text.to_string())
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Frame::Text(text)
    }
}

impl From<Vec<u8>> for Frame {
    fn from(data: Vec<u8>) -> Self {
        Frame::Binary(data)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Text(text) => write!(f, "{}", text),
            Frame::Binary(data) => write!(f, "<{} bytes>", data.len()),
        }
    }
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("Link closed")]
    Closed,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connect timed out")]
    Timeout,
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for LinkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match err {
            Error::ConnectionClosed | Error::AlreadyClosed => LinkError::Closed,
            other => LinkError::Transport(other.to_string()),
        }
    }
}

// ============================================================================
// LINK
// ============================================================================

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = LinkError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, LinkError>> + Send>>;

/// A bidirectional frame transport.
///
/// Dropping a link (or closing its sink) ends the remote side's stream, which
/// is how close propagates through the relay.
pub struct Link {
    sink: FrameSink,
    stream: FrameStream,
}

impl Link {
    /// Build a link from any frame sink and stream
    pub fn from_parts<S, T>(sink: S, stream: T) -> Self
    where
        S: Sink<Frame, Error = LinkError> + Send + 'static,
        T: Stream<Item = Result<Frame, LinkError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    /// Create two connected in-memory links: frames sent on one are received
    /// on the other.
    pub fn pair() -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::unbounded::<Frame>();
        let (b_tx, b_rx) = mpsc::unbounded::<Frame>();

        let a = Link::from_parts(a_tx.sink_map_err(|_| LinkError::Closed), b_rx.map(Ok));
        let b = Link::from_parts(b_tx.sink_map_err(|_| LinkError::Closed), a_rx.map(Ok));
        (a, b)
    }

    pub async fn send(&mut self, frame: Frame) -> Result<(), LinkError> {
        self.sink.send(frame).await
    }

    /// Receive the next frame; `None` once the remote side has closed
    pub async fn recv(&mut self) -> Option<Result<Frame, LinkError>> {
        self.stream.next().await
    }

    /// Close the outbound half. Errors are irrelevant at this point.
    pub async fn close(&mut self) {
        let _ = self.sink.close().await;
    }

    pub fn split(self) -> (FrameSink, FrameStream) {
        (self.sink, self.stream)
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

// ============================================================================
// PIPE
// ============================================================================

/// Forward frames in both directions until either side closes, then close
/// both.
pub async fn splice(a: Link, b: Link) {
    let (mut a_tx, mut a_rx) = a.split();
    let (mut b_tx, mut b_rx) = b.split();

    {
        let a_to_b = forward(&mut a_rx, &mut b_tx);
        let b_to_a = forward(&mut b_rx, &mut a_tx);
        tokio::select! {
            count = a_to_b => debug!("Pipe closed by first side after {} frames", count),
            count = b_to_a => debug!("Pipe closed by second side after {} frames", count),
        }
    }

    let _ = a_tx.close().await;
    let _ = b_tx.close().await;
}

async fn forward(from: &mut FrameStream, to: &mut FrameSink) -> u64 {
    let mut count = 0u64;
    while let Some(Ok(frame)) = from.next().await {
        if to.send(frame).await.is_err() {
            break;
        }
        count += 1;
    }
    count
}
