// Peerlink Core: Introductions and Rendezvous
//
// Peers that cannot reach each other declare topics to a relay. The relay
// introduces peers with overlapping topics, then pairs the two connection
// requests they open and pipes them together.

pub mod backoff;
pub mod broker;
pub mod connector;
pub mod link;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use backoff::{Backoff, BackoffConfig, BackoffError};
pub use broker::{BrokerConfig, BrokerStats, RendezvousBroker, RendezvousKey, RendezvousOutcome};
pub use connector::{decode_segment, Connector, Endpoint, LocalConnector, WebSocketConnector};
pub use link::{splice, Frame, FrameSink, FrameStream, Link, LinkError};
pub use protocol::{Codec, ControlMessage, JsonCodec, PeerId, ProtocolError, TopicId, MAX_CONTROL_FRAME};
pub use registry::{InterestRegistry, Introduction};
pub use server::{RelayServer, RelayServerConfig, RelayServerStats, ServerEvent};
pub use session::{ClientSession, SessionConfig, SessionError, SessionEvent, SessionState};
