//! Connectors: how a client session reaches the relay's two endpoints

use crate::link::{Frame, Link, LinkError};
use crate::protocol::{PeerId, TopicId};
use crate::server::RelayServer;
use async_trait::async_trait;
use futures::future::ready;
use futures::{SinkExt, StreamExt};
use percent_encoding::percent_decode_str;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

/// One of the relay's two logical endpoints
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `introduction/{peer}`: control messages only
    Introduction { peer: PeerId },
    /// `connection/{requester}/{target}/{topic}`: opaque payload once paired
    Connection {
        requester: PeerId,
        target: PeerId,
        topic: TopicId,
    },
}

impl Endpoint {
    pub fn introduction(peer: impl Into<PeerId>) -> Self {
        Endpoint::Introduction { peer: peer.into() }
    }

    pub fn connection(
        requester: impl Into<PeerId>,
        target: impl Into<PeerId>,
        topic: impl Into<TopicId>,
    ) -> Self {
        Endpoint::Connection {
            requester: requester.into(),
            target: target.into(),
            topic: topic.into(),
        }
    }

    /// Unencoded path segments, identifiers kept whole
    pub fn path_segments(&self) -> Vec<&str> {
        match self {
            Endpoint::Introduction { peer } => vec!["introduction", peer.as_str()],
            Endpoint::Connection {
                requester,
                target,
                topic,
            } => vec!["connection", requester.as_str(), target.as_str(), topic.as_str()],
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path_segments().join("/"))
    }
}

/// Decode one percent-encoded path segment back into an identifier
pub fn decode_segment(segment: &str) -> String {
    percent_decode_str(segment).decode_utf8_lossy().into_owned()
}

/// Opens links to relay endpoints
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn dial(&self, endpoint: &Endpoint) -> Result<Link, LinkError>;
}

// ============================================================================
// WEBSOCKET
// ============================================================================

/// Dials the relay over WebSockets
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    base: Url,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// `base` is the relay's root, e.g. `ws://relay.example:8080/`
    pub fn new(base: &str) -> Result<Self, LinkError> {
        let base = Url::parse(base).map_err(|e| LinkError::InvalidUrl(format!("{}: {}", base, e)))?;
        if !matches!(base.scheme(), "ws" | "wss") || base.cannot_be_a_base() {
            return Err(LinkError::InvalidUrl(format!(
                "{}: expected a ws:// or wss:// URL",
                base
            )));
        }
        Ok(Self {
            base,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Full URL for an endpoint; each identifier becomes one encoded segment
    pub fn url_for(&self, endpoint: &Endpoint) -> Result<Url, LinkError> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| LinkError::InvalidUrl(self.base.to_string()))?;
            segments.pop_if_empty();
            for segment in endpoint.path_segments() {
                segments.push(segment);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn dial(&self, endpoint: &Endpoint) -> Result<Link, LinkError> {
        let url = self.url_for(endpoint)?;
        debug!("Dialing {}", url);

        let (socket, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await
                .map_err(|_| LinkError::Timeout)?
                .map_err(|e| LinkError::ConnectionFailed(e.to_string()))?;

        let (sink, stream) = socket.split();
        let sink = sink.sink_map_err(LinkError::from).with(|frame: Frame| {
            ready(Ok::<Message, LinkError>(match frame {
                Frame::Text(text) => Message::Text(text),
                Frame::Binary(data) => Message::Binary(data),
            }))
        });
        let stream = stream
            .map(|message| message.map_err(LinkError::from))
            .take_while(|message| ready(!matches!(message, Ok(Message::Close(_)))))
            .filter_map(|message| {
                ready(match message {
                    Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
                    Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(data))),
                    // Ping/pong are answered by tungstenite itself
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                })
            });

        Ok(Link::from_parts(sink, stream))
    }
}

// ============================================================================
// IN-PROCESS
// ============================================================================

/// Connects straight into an in-process [`RelayServer`] over [`Link::pair`].
///
/// Can simulate an unreachable relay and a dropped introduction link, which
/// makes it the connector of choice for exercising client sessions.
pub struct LocalConnector {
    server: Arc<RelayServer>,
    reachable: AtomicBool,
    sever_epoch: watch::Sender<u64>,
    introduction_dials: AtomicU64,
}

impl LocalConnector {
    pub fn new(server: Arc<RelayServer>) -> Self {
        let (sever_epoch, _) = watch::channel(0);
        Self {
            server,
            reachable: AtomicBool::new(true),
            sever_epoch,
            introduction_dials: AtomicU64::new(0),
        }
    }

    /// While unreachable, every dial fails
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// End every introduction link handed out so far, as a network drop would
    pub fn sever_introductions(&self) {
        self.sever_epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Introduction dials attempted, successful or not
    pub fn introduction_dials(&self) -> u64 {
        self.introduction_dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn dial(&self, endpoint: &Endpoint) -> Result<Link, LinkError> {
        if matches!(endpoint, Endpoint::Introduction { .. }) {
            self.introduction_dials.fetch_add(1, Ordering::SeqCst);
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(LinkError::ConnectionFailed(format!("{}: relay unreachable", endpoint)));
        }

        let (client, relay_side) = Link::pair();
        match endpoint.clone() {
            Endpoint::Introduction { peer } => {
                tokio::spawn(Arc::clone(&self.server).serve_introduction(peer, relay_side));

                let mut severed = self.sever_epoch.subscribe();
                let (sink, stream) = client.split();
                let stream = stream.take_until(async move {
                    let _ = severed.changed().await;
                });
                Ok(Link::from_parts(sink, stream))
            }
            Endpoint::Connection {
                requester,
                target,
                topic,
            } => {
                self.server.serve_connection(requester, target, topic, relay_side);
                Ok(client)
            }
        }
    }
}
