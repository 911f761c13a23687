//! Relay Server: introduction endpoint plus rendezvous endpoint
//!
//! Transport binding (HTTP routes, WebSocket upgrade) is done by the caller,
//! which hands every accepted connection over as a [`Link`].

use crate::broker::{BrokerConfig, RendezvousBroker, RendezvousKey, RendezvousOutcome};
use crate::link::{Frame, Link};
use crate::protocol::{
    Codec, ControlMessage, JsonCodec, PeerId, ProtocolError, TopicId, MAX_CONTROL_FRAME,
};
use crate::registry::{InterestRegistry, Introduction};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Relay server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayServerConfig {
    /// Limits for holding connection requests
    pub broker: BrokerConfig,
    /// Capacity of the server event channel; slow subscribers lag past it
    pub event_capacity: usize,
    /// Control messages queued per introduction link. A peer that lets its
    /// queue fill up is disconnected.
    pub outbox_capacity: usize,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            event_capacity: 256,
            outbox_capacity: 1024,
        }
    }
}

/// Things observers of a relay may want to know about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    PeerRegistered { peer: PeerId },
    PeerUnregistered { peer: PeerId },
    Introduced { to: PeerId, about: PeerId, topics: Vec<TopicId> },
    /// A control frame that could not be decoded; the sender stays connected
    MalformedMessage { peer: PeerId, payload: Frame, reason: String },
    /// A well-formed message a client should not send, or an unknown type
    UnexpectedMessage { peer: PeerId, message_type: String },
    /// A peer stopped draining its introduction link and was dropped
    OutboxOverflowed { peer: PeerId },
    Paired { key: RendezvousKey },
    Abandoned { key: RendezvousKey },
    Overflowed { key: RendezvousKey },
}

/// Statistics about relay server operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayServerStats {
    /// Peers with an open introduction link
    pub peers_connected: usize,
    /// Connection requests waiting for their reciprocal
    pub pending_rendezvous: usize,
    pub pairs_formed: u64,
    pub abandoned: u64,
    pub introductions_sent: u64,
}

/// An open introduction link. Dropping it ends the link: the writer sees its
/// outbox close and the reader sees `retire` go away.
struct PeerSession {
    id: u64,
    outbox: mpsc::Sender<ControlMessage>,
    _retire: oneshot::Sender<()>,
}

pub struct RelayServer {
    codec: Arc<dyn Codec>,
    registry: Mutex<InterestRegistry>,
    broker: Arc<RendezvousBroker>,
    sessions: Mutex<HashMap<PeerId, PeerSession>>,
    outbox_capacity: usize,
    next_session: AtomicU64,
    introductions_sent: AtomicU64,
    events: broadcast::Sender<ServerEvent>,
}

impl RelayServer {
    /// Create a new relay server with default configuration
    pub fn new() -> Arc<Self> {
        Self::with_config(RelayServerConfig::default())
    }

    /// Create a new relay server with custom configuration
    pub fn with_config(config: RelayServerConfig) -> Arc<Self> {
        Self::with_codec(config, Arc::new(JsonCodec))
    }

    pub fn with_codec(config: RelayServerConfig, codec: Arc<dyn Codec>) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Arc::new(Self {
            codec,
            registry: Mutex::new(InterestRegistry::new()),
            broker: RendezvousBroker::with_events(config.broker, events.clone()),
            sessions: Mutex::new(HashMap::new()),
            outbox_capacity: config.outbox_capacity.max(1),
            next_session: AtomicU64::new(1),
            introductions_sent: AtomicU64::new(0),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Serve an `introduction/{peer}` link until it closes.
    ///
    /// A newer link for the same peer replaces this one; the older link then
    /// stops reading, is closed, and its teardown leaves the newer
    /// registration alone.
    pub async fn serve_introduction(self: Arc<Self>, peer: PeerId, link: Link) {
        let (mut sink, mut stream) = link.split();
        let (outbox, mut outgoing) = mpsc::channel::<ControlMessage>(self.outbox_capacity);
        let (retire, mut retired) = oneshot::channel::<()>();
        let guard = SessionGuard {
            server: Arc::clone(&self),
            peer: peer.clone(),
            id: self.open_session(&peer, outbox, retire),
        };

        let codec = Arc::clone(&self.codec);
        let writer_peer = peer.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing.recv().await {
                let frame = match codec.encode(&message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Failed to encode {} for {}: {}", message.message_type(), writer_peer, e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(frame).await {
                    debug!("Introduction link to {} failed: {}", writer_peer, e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        loop {
            tokio::select! {
                biased;
                _ = &mut retired => {
                    debug!("Introduction link from {} retired", peer);
                    break;
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(frame)) => self.handle_control_frame(&peer, frame),
                    Some(Err(e)) => {
                        debug!("Introduction link from {} errored: {}", peer, e);
                        break;
                    }
                    None => break,
                },
            }
        }

        drop(guard);
        writer.abort();
    }

    /// Hand a `connection/{requester}/{target}/{topic}` link to the broker.
    pub fn serve_connection(
        &self,
        requester: PeerId,
        target: PeerId,
        topic: TopicId,
        link: Link,
    ) -> RendezvousOutcome {
        self.broker
            .request_connection(RendezvousKey::new(requester, target, topic), link)
    }

    fn open_session(
        &self,
        peer: &str,
        outbox: mpsc::Sender<ControlMessage>,
        retire: oneshot::Sender<()>,
    ) -> u64 {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let previous = {
            let mut sessions = self.sessions.lock();
            let previous = sessions.insert(
                peer.to_string(),
                PeerSession {
                    id,
                    outbox,
                    _retire: retire,
                },
            );
            self.registry.lock().register(peer);
            previous
        };

        if previous.is_some() {
            info!("Peer {} reconnected; replacing its previous introduction link", peer);
        } else {
            info!("Peer {} connected", peer);
        }
        drop(previous);
        let _ = self.events.send(ServerEvent::PeerRegistered {
            peer: peer.to_string(),
        });
        id
    }

    fn close_session(&self, peer: &str, id: u64) {
        {
            let mut sessions = self.sessions.lock();
            if !sessions.get(peer).is_some_and(|session| session.id == id) {
                return;
            }
            sessions.remove(peer);
            // Still under the sessions lock so a newer link cannot register
            // in between and lose its interests
            self.registry.lock().disconnect(peer);
        }
        info!("Peer {} disconnected", peer);
        let _ = self.events.send(ServerEvent::PeerUnregistered {
            peer: peer.to_string(),
        });
    }

    fn handle_control_frame(&self, peer: &str, frame: Frame) {
        match self.codec.decode(&frame) {
            Ok(ControlMessage::Join { topics }) => {
                debug!("{} joined {} topics", peer, topics.len());
                let introductions = self.registry.lock().join(peer, topics);
                self.deliver(introductions);
            }
            Ok(ControlMessage::Leave { topics }) => {
                debug!("{} left {:?}", peer, topics);
                self.registry.lock().leave(peer, &topics);
            }
            Ok(ControlMessage::Heartbeat) => trace!("Heartbeat from {}", peer),
            Ok(other) => {
                warn!("Ignoring {} message from client {}", other.message_type(), peer);
                let _ = self.events.send(ServerEvent::UnexpectedMessage {
                    peer: peer.to_string(),
                    message_type: other.message_type().to_string(),
                });
            }
            Err(ProtocolError::UnknownType(tag)) => {
                warn!("Ignoring unknown message type {:?} from {}", tag, peer);
                let _ = self.events.send(ServerEvent::UnexpectedMessage {
                    peer: peer.to_string(),
                    message_type: tag,
                });
            }
            Err(e) => {
                warn!("Malformed control message from {}: {}", peer, e);
                let _ = self.events.send(ServerEvent::MalformedMessage {
                    peer: peer.to_string(),
                    payload: frame,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Queue introductions on the addressed peers' links. Large topic lists
    /// go out as several `Introduction` messages for the same peer.
    fn deliver(&self, introductions: Vec<Introduction>) {
        let mut sessions = self.sessions.lock();
        for intro in introductions {
            let Some(session) = sessions.get(&intro.to) else {
                continue;
            };
            let message = ControlMessage::Introduction {
                peer_id: intro.about.clone(),
                topics: intro.topics.clone(),
            };
            let queued = message
                .split_to_fit(MAX_CONTROL_FRAME)
                .into_iter()
                .try_for_each(|chunk| session.outbox.try_send(chunk));

            match queued {
                Ok(()) => {
                    self.introductions_sent.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Introduced {} to {} for {} topics",
                        intro.about,
                        intro.to,
                        intro.topics.len()
                    );
                    let _ = self.events.send(ServerEvent::Introduced {
                        to: intro.to,
                        about: intro.about,
                        topics: intro.topics,
                    });
                }
                // Link is closing; its teardown is already under way
                Err(TrySendError::Closed(_)) => continue,
                Err(TrySendError::Full(_)) => {
                    warn!("Introduction outbox for {} is full; dropping its link", intro.to);
                    sessions.remove(&intro.to);
                    self.registry.lock().disconnect(&intro.to);
                    let _ = self.events.send(ServerEvent::OutboxOverflowed {
                        peer: intro.to.clone(),
                    });
                    let _ = self.events.send(ServerEvent::PeerUnregistered { peer: intro.to });
                }
            }
        }
    }

    /// Check if a peer has an open introduction link
    pub fn is_peer_connected(&self, peer: &str) -> bool {
        self.sessions.lock().contains_key(peer)
    }

    pub fn topics_of(&self, peer: &str) -> Vec<TopicId> {
        self.registry.lock().topics_of(peer)
    }

    /// Get current server statistics
    pub fn get_stats(&self) -> RelayServerStats {
        let broker = self.broker.stats();
        RelayServerStats {
            peers_connected: self.sessions.lock().len(),
            pending_rendezvous: self.broker.pending_count(),
            pairs_formed: broker.pairs_formed,
            abandoned: broker.abandoned,
            introductions_sent: self.introductions_sent.load(Ordering::Relaxed),
        }
    }
}

/// Unregisters an introduction session however its serving future ends,
/// including being dropped mid-flight.
struct SessionGuard {
    server: Arc<RelayServer>,
    peer: PeerId,
    id: u64,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.server.close_session(&self.peer, self.id);
    }
}

// ============================================================================
// TESTS
// ============================================================================
