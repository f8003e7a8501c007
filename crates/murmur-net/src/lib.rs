// Transport adapter, envelope delivery tracker and the libp2p network layer.

pub mod behaviour;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod gossip;
pub mod memory;
pub mod monitor;
pub mod swarm;
pub mod transport;

pub use envelope::{
    DeliveryMode, Envelope, EnvelopeError, EnvelopeErrorCode, EnvelopeEvent, EnvelopeEventKind,
    EnvelopeHash, OutgoingEnvelope,
};
pub use error::TransportError;
pub use gossip::GossipTransport;
pub use memory::{MemoryHub, MemoryTransport};
pub use monitor::{DeliveryUpdate, EnvelopeState, EnvelopesMonitor, MonitorConfig, TrackedPost};
pub use swarm::{keypair_from_identity, spawn_swarm, SwarmCommand, SwarmConfig, SwarmNotification};
pub use transport::{PostedEnvelope, Transport};
