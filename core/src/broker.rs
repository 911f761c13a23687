//! Rendezvous broker: pairs reciprocal connection requests into pipes
//!
//! A request for `(requester, target, topic)` waits ("holds") until the
//! reciprocal `(target, requester, topic)` arrives. While holding, everything
//! the requester sends is buffered; on pairing the buffer is flushed to the
//! other side in receipt order before live forwarding starts.

use crate::link::{splice, Frame, Link};
use crate::protocol::{PeerId, TopicId};
use crate::server::ServerEvent;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

/// Ordered `(requester, target, topic)` triple identifying one half of a
/// rendezvous.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RendezvousKey {
    pub requester: PeerId,
    pub target: PeerId,
    pub topic: TopicId,
}

impl RendezvousKey {
    pub fn new(
        requester: impl Into<PeerId>,
        target: impl Into<PeerId>,
        topic: impl Into<TopicId>,
    ) -> Self {
        Self {
            requester: requester.into(),
            target: target.into(),
            topic: topic.into(),
        }
    }

    /// The key the other side of this rendezvous will present
    pub fn reciprocal(&self) -> Self {
        Self {
            requester: self.target.clone(),
            target: self.requester.clone(),
            topic: self.topic.clone(),
        }
    }
}

impl fmt::Display for RendezvousKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} [{}]", self.requester, self.target, self.topic)
    }
}

/// Bounds on what a holding request may buffer. Exceeding either bound
/// abandons the request and closes its link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub max_pending_frames: usize,
    pub max_pending_bytes: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: 1024,
            max_pending_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Rendezvous completed
    pub pairs_formed: u64,
    /// Holding requests whose link closed before a match arrived
    pub abandoned: u64,
    /// Holding requests dropped for exceeding the buffer bounds
    pub overflowed: u64,
}

/// What happened to a connection request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousOutcome {
    /// No reciprocal yet; the request is holding
    Holding,
    /// Matched with a holding reciprocal; the pipe is running
    Paired,
}

/// A holding request. The link and its buffer belong to the holding task;
/// the map only keeps the channel used to hand it the matching link.
struct PendingEntry {
    generation: u64,
    handoff: oneshot::Sender<Link>,
}

pub struct RendezvousBroker {
    config: BrokerConfig,
    pending: Mutex<HashMap<RendezvousKey, PendingEntry>>,
    next_generation: AtomicU64,
    stats: RwLock<BrokerStats>,
    events: broadcast::Sender<ServerEvent>,
}

impl RendezvousBroker {
    /// Create a broker with its own event channel
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Self::with_events(config, events)
    }

    /// Create a broker that publishes onto an existing event channel
    pub fn with_events(config: BrokerConfig, events: broadcast::Sender<ServerEvent>) -> Arc<Self> {
        Arc::new(Self {
            config,
            pending: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            stats: RwLock::new(BrokerStats::default()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Submit one side of a rendezvous.
    ///
    /// Must be called from within a tokio runtime: a holding request, and
    /// later its pipe, run on a spawned task.
    pub fn request_connection(self: &Arc<Self>, key: RendezvousKey, link: Link) -> RendezvousOutcome {
        let reciprocal = key.reciprocal();
        let mut link = link;

        loop {
            let mut pending = self.pending.lock();
            let Some(waiting) = pending.remove(&reciprocal) else {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let (handoff, paired) = oneshot::channel();
                if pending
                    .insert(key.clone(), PendingEntry { generation, handoff })
                    .is_some()
                {
                    debug!("Superseded an earlier holding request for {}", key);
                }
                drop(pending);

                debug!("Holding connection request {}", key);
                tokio::spawn(Arc::clone(self).hold(key, generation, link, paired));
                return RendezvousOutcome::Holding;
            };
            drop(pending);

            match waiting.handoff.send(link) {
                Ok(()) => {
                    self.stats.write().pairs_formed += 1;
                    info!("Rendezvous complete: {}", key);
                    let _ = self.events.send(ServerEvent::Paired { key });
                    return RendezvousOutcome::Paired;
                }
                // The holding task is gone; its cleanup raced us. Try again,
                // which registers this request as holding.
                Err(returned) => link = returned,
            }
        }
    }

    async fn hold(
        self: Arc<Self>,
        key: RendezvousKey,
        generation: u64,
        mut link: Link,
        mut paired: oneshot::Receiver<Link>,
    ) {
        let mut buffer: VecDeque<Frame> = VecDeque::new();
        let mut buffered_bytes = 0usize;

        loop {
            tokio::select! {
                biased;

                handoff = &mut paired => {
                    match handoff {
                        Ok(peer) => self.flush_and_splice(&key, link, buffer, peer).await,
                        Err(_) => {
                            // Replaced by a newer request under the same key
                            link.close().await;
                        }
                    }
                    return;
                }

                inbound = link.recv() => match inbound {
                    Some(Ok(frame)) => {
                        buffered_bytes += frame.len();
                        buffer.push_back(frame);
                        if buffer.len() <= self.config.max_pending_frames
                            && buffered_bytes <= self.config.max_pending_bytes
                        {
                            continue;
                        }
                        if self.remove_if_current(&key, generation) {
                            self.stats.write().overflowed += 1;
                            warn!(
                                "Dropping holding request {}: {} frames / {} bytes buffered",
                                key,
                                buffer.len(),
                                buffered_bytes
                            );
                            let _ = self.events.send(ServerEvent::Overflowed { key });
                            link.close().await;
                            return;
                        }
                        // Already claimed by the reciprocal; the handoff is in flight
                    }
                    Some(Err(_)) | None => {
                        if self.remove_if_current(&key, generation) {
                            self.stats.write().abandoned += 1;
                            debug!("Holding request {} abandoned", key);
                            let _ = self.events.send(ServerEvent::Abandoned { key });
                            return;
                        }
                        // Claimed just as it closed: deliver what was buffered,
                        // then close the other side too.
                        if let Ok(mut peer) = paired.await {
                            for frame in buffer {
                                if peer.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            peer.close().await;
                        }
                        return;
                    }
                },
            }
        }
    }

    async fn flush_and_splice(
        &self,
        key: &RendezvousKey,
        mut held: Link,
        buffer: VecDeque<Frame>,
        mut peer: Link,
    ) {
        let flushed = buffer.len();
        for frame in buffer {
            if peer.send(frame).await.is_err() {
                held.close().await;
                return;
            }
        }
        debug!("Flushed {} buffered frames for {}", flushed, key);
        splice(held, peer).await;
    }

    fn remove_if_current(&self, key: &RendezvousKey, generation: u64) -> bool {
        let mut pending = self.pending.lock();
        if pending.get(key).is_some_and(|entry| entry.generation == generation) {
            pending.remove(key);
            true
        } else {
            false
        }
    }

    pub fn is_holding(&self, key: &RendezvousKey) -> bool {
        self.pending.lock().contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn stats(&self) -> BrokerStats {
        self.stats.read().clone()
    }
}

// ============================================================================
// TESTS
// ============================================================================
