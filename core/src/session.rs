//! Client Session: keeps one peer attached to the relay
//!
//! The session owns the introduction link, reconnects with backoff when it
//! drops, and opens one connection link per (peer, topic) the relay
//! introduces. All of its state lives in a single actor task; the
//! [`ClientSession`] handle talks to it over a command channel.

use crate::backoff::{Backoff, BackoffConfig, BackoffError};
use crate::connector::{Connector, Endpoint};
use crate::link::{Frame, Link, LinkError};
use crate::protocol::{Codec, ControlMessage, JsonCodec, PeerId, TopicId, MAX_CONTROL_FRAME};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session has shut down")]
    Closed,
    #[error("No open connection to {peer} for topic {topic}")]
    NoSuchPeer { peer: PeerId, topic: TopicId },
    #[error("Invalid session config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Backoff(#[from] BackoffError),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub peer_id: PeerId,
    /// Topics held from the start
    pub topics: Vec<TopicId>,
    pub backoff: BackoffConfig,
    pub heartbeat_interval: Duration,
    pub event_capacity: usize,
}

impl SessionConfig {
    pub fn new(peer_id: impl Into<PeerId>) -> Self {
        Self {
            peer_id: peer_id.into(),
            topics: Vec::new(),
            backoff: BackoffConfig::default(),
            heartbeat_interval: Duration::from_secs(30),
            event_capacity: 256,
        }
    }

    pub fn with_topics<I, T>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TopicId>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Dialing the introduction endpoint
    Connecting,
    /// Introduction link up
    Open,
    /// Link lost; a reconnect is scheduled
    Closed,
    /// Deliberate shutdown; no reconnect will follow
    Disconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ServerConnected,
    ServerDisconnected { retry_in: Duration },
    PeerConnected { peer: PeerId, topic: TopicId },
    PeerDisconnected { peer: PeerId, topic: TopicId },
    PeerMessage { peer: PeerId, topic: TopicId, frame: Frame },
    /// The relay sent something a client must never receive
    ProtocolViolation { detail: String },
    Shutdown,
}

enum Command {
    Join(TopicId),
    Leave(TopicId),
    Send {
        peer: PeerId,
        topic: TopicId,
        frame: Frame,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<(PeerId, TopicId)>>,
    },
    Shutdown,
}

/// Reports from per-peer link tasks back to the actor
enum PeerSignal {
    Opened { id: u64, peer: PeerId, topic: TopicId },
    Message { id: u64, peer: PeerId, topic: TopicId, frame: Frame },
    Closed { id: u64, peer: PeerId, topic: TopicId },
    DialFailed { id: u64, peer: PeerId, topic: TopicId, error: LinkError },
}

/// One (peer, topic) connection. Until `open` it is a placeholder that keeps
/// a second introduction from dialing again.
struct PeerSlot {
    id: u64,
    outbound: mpsc::UnboundedSender<Frame>,
    open: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

enum Dialed {
    Connected(Link),
    Failed,
    Shutdown,
}

/// Handle to a running client session
pub struct ClientSession {
    peer_id: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Receiver<SessionState>,
    actor: Mutex<Option<SessionActor>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientSession {
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>) -> Result<Self, SessionError> {
        Self::with_codec(config, connector, Arc::new(JsonCodec))
    }

    pub fn with_codec(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn Codec>,
    ) -> Result<Self, SessionError> {
        if config.heartbeat_interval.is_zero() {
            return Err(SessionError::InvalidConfig(
                "heartbeat interval must be non-zero".to_string(),
            ));
        }
        let backoff = Backoff::new(config.backoff.clone())?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (state_tx, state) = watch::channel(SessionState::Connecting);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let actor = SessionActor {
            peer_id: config.peer_id.clone(),
            codec,
            connector,
            topics: config.topics.into_iter().collect(),
            outbox: VecDeque::new(),
            peers: HashMap::new(),
            next_slot: 1,
            backoff,
            heartbeat_interval: config.heartbeat_interval,
            commands: command_rx,
            signal_tx,
            signals: signal_rx,
            events: events.clone(),
            state: state_tx,
        };

        Ok(Self {
            peer_id: config.peer_id,
            commands,
            events,
            state,
            actor: Mutex::new(Some(actor)),
            task: Mutex::new(None),
        })
    }

    /// Spawn the session task. Subscribe first to see its earliest events.
    pub fn start(&self) {
        let Some(actor) = self.actor.lock().take() else {
            debug!("Session {} already started", self.peer_id);
            return;
        };
        *self.task.lock() = Some(tokio::spawn(actor.run()));
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Hold a topic; announced now if connected, otherwise on connect
    pub fn join(&self, topic: impl Into<TopicId>) -> Result<(), SessionError> {
        self.command(Command::Join(topic.into()))
    }

    /// Drop a topic and close every peer connection made for it
    pub fn leave(&self, topic: impl Into<TopicId>) -> Result<(), SessionError> {
        self.command(Command::Leave(topic.into()))
    }

    /// Write an application frame to the open connection for (peer, topic)
    pub async fn send(
        &self,
        peer: impl Into<PeerId>,
        topic: impl Into<TopicId>,
        frame: impl Into<Frame>,
    ) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Send {
            peer: peer.into(),
            topic: topic.into(),
            frame: frame.into(),
            reply,
        })?;
        response.await.map_err(|_| SessionError::Closed)?
    }

    /// Open (peer, topic) connections, sorted
    pub async fn connected_peers(&self) -> Result<Vec<(PeerId, TopicId)>, SessionError> {
        let (reply, response) = oneshot::channel();
        self.command(Command::ConnectedPeers { reply })?;
        response.await.map_err(|_| SessionError::Closed)
    }

    /// Stop for good: cancels any pending reconnect and closes every link
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let unstarted = self.actor.lock().take();
        if let Some(mut actor) = unstarted {
            debug!("Session {} shut down before it started", self.peer_id);
            actor.finish();
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Session {} task ended abnormally: {}", self.peer_id, e);
            }
        }
    }

    fn command(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }
}

// ============================================================================
// ACTOR
// ============================================================================

struct SessionActor {
    peer_id: PeerId,
    codec: Arc<dyn Codec>,
    connector: Arc<dyn Connector>,
    topics: BTreeSet<TopicId>,
    /// Control messages not yet written to the relay, oldest first
    outbox: VecDeque<ControlMessage>,
    peers: HashMap<PeerId, HashMap<TopicId, PeerSlot>>,
    next_slot: u64,
    backoff: Backoff,
    heartbeat_interval: Duration,
    commands: mpsc::UnboundedReceiver<Command>,
    signal_tx: mpsc::UnboundedSender<PeerSignal>,
    signals: mpsc::UnboundedReceiver<PeerSignal>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Sender<SessionState>,
}

impl SessionActor {
    async fn run(mut self) {
        info!("Session {} starting", self.peer_id);
        loop {
            self.set_state(SessionState::Connecting);
            match self.connect().await {
                Dialed::Connected(link) => {
                    if self.serve(link).await == Flow::Shutdown {
                        break;
                    }
                }
                Dialed::Failed => {}
                Dialed::Shutdown => break,
            }

            self.set_state(SessionState::Closed);
            let retry_in = self.backoff.next_delay();
            info!("Session {} reconnecting in {:?}", self.peer_id, retry_in);
            self.emit(SessionEvent::ServerDisconnected { retry_in });
            if self.wait_to_retry(retry_in).await == Flow::Shutdown {
                break;
            }
        }
        self.finish();
    }

    /// Dial the introduction endpoint while still serving commands
    async fn connect(&mut self) -> Dialed {
        let connector = Arc::clone(&self.connector);
        let endpoint = Endpoint::introduction(self.peer_id.clone());
        let dial = async move { connector.dial(&endpoint).await };
        tokio::pin!(dial);

        loop {
            tokio::select! {
                result = &mut dial => {
                    return match result {
                        Ok(link) => Dialed::Connected(link),
                        Err(e) => {
                            warn!("Session {} could not reach relay: {}", self.peer_id, e);
                            Dialed::Failed
                        }
                    };
                }
                command = self.commands.recv() => {
                    if self.handle_command(command) == Flow::Shutdown {
                        return Dialed::Shutdown;
                    }
                }
                Some(signal) = self.signals.recv() => self.handle_peer_signal(signal),
            }
        }
    }

    async fn serve(&mut self, mut link: Link) -> Flow {
        self.backoff.reset();
        self.set_state(SessionState::Open);
        if !self.topics.is_empty() {
            let join = ControlMessage::Join {
                topics: self.topics.iter().cloned().collect(),
            };
            self.enqueue(join);
        }
        if !self.flush(&mut link).await {
            return Flow::Continue;
        }
        info!("Session {} connected to relay", self.peer_id);
        self.emit(SessionEvent::ServerConnected);

        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                inbound = link.recv() => match inbound {
                    Some(Ok(frame)) => self.handle_server_frame(frame),
                    Some(Err(e)) => {
                        warn!("Session {} lost relay link: {}", self.peer_id, e);
                        return Flow::Continue;
                    }
                    None => {
                        info!("Session {} relay link closed", self.peer_id);
                        return Flow::Continue;
                    }
                },
                command = self.commands.recv() => {
                    if self.handle_command(command) == Flow::Shutdown {
                        link.close().await;
                        return Flow::Shutdown;
                    }
                }
                Some(signal) = self.signals.recv() => self.handle_peer_signal(signal),
                _ = heartbeat.tick() => self.outbox.push_back(ControlMessage::Heartbeat),
            }

            if !self.flush(&mut link).await {
                return Flow::Continue;
            }
        }
    }

    async fn wait_to_retry(&mut self, delay: Duration) -> Flow {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Flow::Continue,
                command = self.commands.recv() => {
                    if self.handle_command(command) == Flow::Shutdown {
                        return Flow::Shutdown;
                    }
                }
                Some(signal) = self.signals.recv() => self.handle_peer_signal(signal),
            }
        }
    }

    /// Write the outbox in order. On failure the unsent message goes back
    /// to the front and `false` is returned.
    async fn flush(&mut self, link: &mut Link) -> bool {
        while let Some(message) = self.outbox.pop_front() {
            let frame = match self.codec.encode(&message) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Dropping unencodable {}: {}", message.message_type(), e);
                    continue;
                }
            };
            if let Err(e) = link.send(frame).await {
                warn!(
                    "Session {} failed to send {}: {}",
                    self.peer_id,
                    message.message_type(),
                    e
                );
                if message != ControlMessage::Heartbeat {
                    self.outbox.push_front(message);
                }
                return false;
            }
            debug!("Session {} sent {}", self.peer_id, message.message_type());
        }
        true
    }

    /// Queue a control message, split so every frame stays decodable
    fn enqueue(&mut self, message: ControlMessage) {
        self.outbox.extend(message.split_to_fit(MAX_CONTROL_FRAME));
    }

    fn handle_command(&mut self, command: Option<Command>) -> Flow {
        let Some(command) = command else {
            // Every handle is gone
            return Flow::Shutdown;
        };

        match command {
            Command::Join(topic) => {
                self.topics.insert(topic.clone());
                self.enqueue(ControlMessage::Join { topics: vec![topic] });
            }
            Command::Leave(topic) => {
                self.topics.remove(&topic);
                self.close_topic(&topic);
                self.enqueue(ControlMessage::Leave { topics: vec![topic] });
            }
            Command::Send {
                peer,
                topic,
                frame,
                reply,
            } => {
                let slot = self
                    .peers
                    .get(&peer)
                    .and_then(|slots| slots.get(&topic))
                    .filter(|slot| slot.open);
                let sent = match slot {
                    Some(slot) => slot
                        .outbound
                        .send(frame)
                        .map_err(|_| SessionError::NoSuchPeer { peer, topic }),
                    None => Err(SessionError::NoSuchPeer { peer, topic }),
                };
                let _ = reply.send(sent);
            }
            Command::ConnectedPeers { reply } => {
                let mut open: Vec<(PeerId, TopicId)> = self
                    .peers
                    .iter()
                    .flat_map(|(peer, slots)| {
                        slots
                            .iter()
                            .filter(|(_, slot)| slot.open)
                            .map(move |(topic, _)| (peer.clone(), topic.clone()))
                    })
                    .collect();
                open.sort();
                let _ = reply.send(open);
            }
            Command::Shutdown => return Flow::Shutdown,
        }
        Flow::Continue
    }

    fn handle_server_frame(&mut self, frame: Frame) {
        match self.codec.decode(&frame) {
            Ok(ControlMessage::Introduction { peer_id, topics }) => self.introduced(peer_id, topics),
            Ok(other) => self.protocol_violation(format!(
                "relay sent client-only message {}",
                other.message_type()
            )),
            Err(e) => self.protocol_violation(format!("relay sent {:?}: {}", frame.to_string(), e)),
        }
    }

    fn protocol_violation(&self, detail: String) {
        error!("Session {}: protocol violation: {}", self.peer_id, detail);
        self.emit(SessionEvent::ProtocolViolation { detail });
    }

    fn introduced(&mut self, peer: PeerId, topics: Vec<TopicId>) {
        if peer == self.peer_id {
            warn!("Session {} ignoring introduction to itself", self.peer_id);
            return;
        }

        for topic in topics {
            if !self.topics.contains(&topic) {
                debug!("Ignoring introduction to {} for dropped topic {}", peer, topic);
                continue;
            }
            let slots = self.peers.entry(peer.clone()).or_default();
            if slots.contains_key(&topic) {
                continue;
            }

            let id = self.next_slot;
            self.next_slot += 1;
            let (outbound, outbound_rx) = mpsc::unbounded_channel();
            slots.insert(
                topic.clone(),
                PeerSlot {
                    id,
                    outbound,
                    open: false,
                },
            );

            debug!("Session {} dialing {} for {}", self.peer_id, peer, topic);
            tokio::spawn(run_peer_link(
                Arc::clone(&self.connector),
                Endpoint::connection(self.peer_id.clone(), peer.clone(), topic.clone()),
                id,
                peer.clone(),
                topic,
                outbound_rx,
                self.signal_tx.clone(),
            ));
        }
    }

    fn handle_peer_signal(&mut self, signal: PeerSignal) {
        match signal {
            PeerSignal::Opened { id, peer, topic } => {
                let Some(slot) = self.slot_mut(&peer, &topic, id) else {
                    return;
                };
                slot.open = true;
                info!("Session {} connected to {} for {}", self.peer_id, peer, topic);
                self.emit(SessionEvent::PeerConnected { peer, topic });
            }
            PeerSignal::Message {
                id,
                peer,
                topic,
                frame,
            } => {
                if self.slot_mut(&peer, &topic, id).is_some() {
                    self.emit(SessionEvent::PeerMessage { peer, topic, frame });
                }
            }
            PeerSignal::Closed { id, peer, topic } => {
                if let Some(slot) = self.remove_slot(&peer, &topic, id) {
                    info!("Session {} disconnected from {} for {}", self.peer_id, peer, topic);
                    if slot.open {
                        self.emit(SessionEvent::PeerDisconnected { peer, topic });
                    }
                }
            }
            PeerSignal::DialFailed {
                id,
                peer,
                topic,
                error,
            } => {
                if self.remove_slot(&peer, &topic, id).is_some() {
                    warn!("Session {} could not dial {} for {}: {}", self.peer_id, peer, topic, error);
                }
            }
        }
    }

    /// The slot for (peer, topic), if it is still the one with this id
    fn slot_mut(&mut self, peer: &str, topic: &str, id: u64) -> Option<&mut PeerSlot> {
        self.peers
            .get_mut(peer)
            .and_then(|slots| slots.get_mut(topic))
            .filter(|slot| slot.id == id)
    }

    fn remove_slot(&mut self, peer: &str, topic: &str, id: u64) -> Option<PeerSlot> {
        let slots = self.peers.get_mut(peer)?;
        if slots.get(topic).map(|slot| slot.id) != Some(id) {
            return None;
        }
        let slot = slots.remove(topic);
        if slots.is_empty() {
            self.peers.remove(peer);
        }
        slot
    }

    /// Drop every slot for a topic; dropping a slot closes its link
    fn close_topic(&mut self, topic: &str) {
        let mut closed = Vec::new();
        self.peers.retain(|peer, slots| {
            if let Some(slot) = slots.remove(topic) {
                if slot.open {
                    closed.push(peer.clone());
                }
            }
            !slots.is_empty()
        });
        for peer in closed {
            info!("Session {} closed link to {} for {}", self.peer_id, peer, topic);
            self.emit(SessionEvent::PeerDisconnected {
                peer,
                topic: topic.to_string(),
            });
        }
    }

    fn finish(&mut self) {
        self.set_state(SessionState::Disconnecting);
        for (peer, slots) in self.peers.drain() {
            for (topic, slot) in slots {
                if slot.open {
                    let _ = self.events.send(SessionEvent::PeerDisconnected {
                        peer: peer.clone(),
                        topic,
                    });
                }
            }
        }
        info!("Session {} shut down", self.peer_id);
        self.emit(SessionEvent::Shutdown);
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Drive one (peer, topic) connection until either side closes it
async fn run_peer_link(
    connector: Arc<dyn Connector>,
    endpoint: Endpoint,
    id: u64,
    peer: PeerId,
    topic: TopicId,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    signals: mpsc::UnboundedSender<PeerSignal>,
) {
    let link = match connector.dial(&endpoint).await {
        Ok(link) => link,
        Err(error) => {
            let _ = signals.send(PeerSignal::DialFailed {
                id,
                peer,
                topic,
                error,
            });
            return;
        }
    };
    let _ = signals.send(PeerSignal::Opened {
        id,
        peer: peer.clone(),
        topic: topic.clone(),
    });

    let (mut sink, mut stream) = link.split();
    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(frame)) => {
                    let _ = signals.send(PeerSignal::Message {
                        id,
                        peer: peer.clone(),
                        topic: topic.clone(),
                        frame,
                    });
                }
                Some(Err(e)) => {
                    debug!("Link to {} for {} failed: {}", peer, topic, e);
                    break;
                }
                None => break,
            },
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        debug!("Send to {} for {} failed: {}", peer, topic, e);
                        break;
                    }
                }
                // Slot dropped by leave or shutdown
                None => break,
            },
        }
    }

    let _ = sink.close().await;
    let _ = signals.send(PeerSignal::Closed { id, peer, topic });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::LocalConnector;
    use crate::server::RelayServer;

    struct ScriptedConnector {
        relay: Mutex<Option<Link>>,
    }

    #[async_trait::async_trait]
    impl Connector for ScriptedConnector {
        async fn dial(&self, endpoint: &Endpoint) -> Result<Link, LinkError> {
            match endpoint {
                Endpoint::Introduction { .. } => self.relay.lock().take().ok_or(LinkError::Closed),
                Endpoint::Connection { .. } => Err(LinkError::ConnectionFailed("scripted".into())),
            }
        }
    }

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            min_delay_ms: 10,
            max_delay_ms: 40,
            factor: 2.0,
            jitter: 0.0,
        }
    }

    async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("event channel closed")
    }

    #[test]
    fn test_zero_heartbeat_rejected() {
        let connector = Arc::new(LocalConnector::new(RelayServer::new()));
        let config = SessionConfig::new("alice").with_heartbeat_interval(Duration::ZERO);
        assert!(matches!(
            ClientSession::new(config, connector),
            Err(SessionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let connector = Arc::new(LocalConnector::new(RelayServer::new()));
        let mut backoff = fast_backoff();
        backoff.min_delay_ms = 0;
        let config = SessionConfig::new("alice").with_backoff(backoff);
        assert!(matches!(
            ClientSession::new(config, connector),
            Err(SessionError::Backoff(BackoffError::ZeroMinimum))
        ));
    }

    #[tokio::test]
    async fn test_announces_topics_on_connect() {
        let (client_side, mut relay) = Link::pair();
        let connector = Arc::new(ScriptedConnector {
            relay: Mutex::new(Some(client_side)),
        });
        let config = SessionConfig::new("alice")
            .with_topics(["doc-2", "doc-1"])
            .with_backoff(fast_backoff());
        let session = ClientSession::new(config, connector).unwrap();
        let mut events = session.subscribe();
        session.start();

        assert_eq!(next_event(&mut events).await, SessionEvent::ServerConnected);
        assert_eq!(session.state(), SessionState::Open);
        let frame = relay.recv().await.unwrap().unwrap();
        assert_eq!(
            JsonCodec.decode(&frame).unwrap(),
            ControlMessage::Join {
                topics: vec!["doc-1".to_string(), "doc-2".to_string()]
            }
        );

        session.shutdown().await;
        assert_eq!(session.state(), SessionState::Disconnecting);
    }

    #[tokio::test]
    async fn test_large_topic_set_is_announced_in_pieces() {
        let (client_side, mut relay) = Link::pair();
        let connector = Arc::new(ScriptedConnector {
            relay: Mutex::new(Some(client_side)),
        });
        let topics: Vec<String> = (0..3000).map(|i| format!("shared-workspace-topic-{i:08}")).collect();
        let config = SessionConfig::new("alice")
            .with_topics(topics.clone())
            .with_backoff(fast_backoff());
        let session = ClientSession::new(config, connector).unwrap();
        let mut events = session.subscribe();
        session.start();
        assert_eq!(next_event(&mut events).await, SessionEvent::ServerConnected);

        let mut announced = Vec::new();
        let mut frames = 0;
        while announced.len() < topics.len() {
            let frame = tokio::time::timeout(Duration::from_millis(300), relay.recv())
                .await
                .expect("relay received no Join")
                .unwrap()
                .unwrap();
            assert!(frame.as_bytes().len() <= MAX_CONTROL_FRAME);
            match JsonCodec.decode(&frame).unwrap() {
                ControlMessage::Join { topics } => announced.extend(topics),
                other => panic!("unexpected {:?}", other),
            }
            frames += 1;
        }
        assert!(frames > 1);
        assert_eq!(announced, topics);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_before_start_ends_disconnecting() {
        let connector = Arc::new(LocalConnector::new(RelayServer::new()));
        let session =
            ClientSession::new(SessionConfig::new("alice").with_backoff(fast_backoff()), connector)
                .unwrap();
        assert_eq!(session.peer_id(), "alice");
        let state = session.state_watch();
        let mut events = session.subscribe();
        assert_eq!(*state.borrow(), SessionState::Connecting);

        session.shutdown().await;
        assert_eq!(*state.borrow(), SessionState::Disconnecting);
        assert_eq!(session.state(), SessionState::Disconnecting);
        assert_eq!(next_event(&mut events).await, SessionEvent::Shutdown);

        // Starting afterwards is a no-op
        session.start();
        assert_eq!(session.join("t"), Err(SessionError::Closed));
    }

    #[tokio::test]
    async fn test_unexpected_server_messages_are_violations() {
        let (client_side, mut relay) = Link::pair();
        let connector = Arc::new(ScriptedConnector {
            relay: Mutex::new(Some(client_side)),
        });
        let session =
            ClientSession::new(SessionConfig::new("alice").with_backoff(fast_backoff()), connector)
                .unwrap();
        let mut events = session.subscribe();
        session.start();
        assert_eq!(next_event(&mut events).await, SessionEvent::ServerConnected);

        relay
            .send(Frame::text(r#"{"type":"Subscribe","topics":[]}"#))
            .await
            .unwrap();
        relay.send(Frame::text(r#"{"type":"Heartbeat"}"#)).await.unwrap();

        for _ in 0..2 {
            assert!(matches!(
                next_event(&mut events).await,
                SessionEvent::ProtocolViolation { .. }
            ));
        }
        assert_eq!(session.state(), SessionState::Open);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_peer_dial_frees_placeholder() {
        let (client_side, mut relay) = Link::pair();
        let connector = Arc::new(ScriptedConnector {
            relay: Mutex::new(Some(client_side)),
        });
        let config = SessionConfig::new("alice")
            .with_topics(["t"])
            .with_backoff(fast_backoff());
        let session = ClientSession::new(config, connector).unwrap();
        let mut events = session.subscribe();
        session.start();
        assert_eq!(next_event(&mut events).await, SessionEvent::ServerConnected);
        relay.recv().await.unwrap().unwrap();

        let intro = JsonCodec
            .encode(&ControlMessage::Introduction {
                peer_id: "bob".to_string(),
                topics: vec!["t".to_string()],
            })
            .unwrap();
        relay.send(intro).await.unwrap();

        // The dial fails, so no connection ever shows up
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.connected_peers().await.unwrap().is_empty());
        assert_eq!(
            session.send("bob", "t", "hello").await,
            Err(SessionError::NoSuchPeer {
                peer: "bob".to_string(),
                topic: "t".to_string()
            })
        );
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_commands_after_shutdown_fail() {
        let connector = Arc::new(LocalConnector::new(RelayServer::new()));
        let session =
            ClientSession::new(SessionConfig::new("alice").with_backoff(fast_backoff()), connector)
                .unwrap();
        session.start();
        session.shutdown().await;

        assert_eq!(session.join("t"), Err(SessionError::Closed));
        assert_eq!(session.send("bob", "t", "x").await, Err(SessionError::Closed));
    }
}
