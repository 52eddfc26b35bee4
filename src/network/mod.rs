//! Network layer
//!
//! Wire encoding, the frame codec, peer connections with their handshake,
//! and the scheduler that runs all connections concurrently.

pub mod codec;
pub mod encoding;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod scheduler;
pub mod transport;

pub use codec::MessageCodec;
pub use error::DecodeError;
pub use peer::{
    DisconnectReason, HandshakeState, NullHandler, Outbox, PeerConfig, PeerHandle, PeerHandler,
    PeerId,
};
pub use protocol::{
    InventoryItem, NetworkMagic, ProtocolMessage, ProtocolParser, RejectCode, RejectMessage,
    VersionMessage,
};
pub use scheduler::{NetworkScheduler, SchedulerConfig};
