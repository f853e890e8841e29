//! Best-effort gossip transport.
//!
//! Maintains a dynamic peer set over plain TCP, delivers opaque broadcast
//! payloads with at-most-once semantics per `(origin, message_id)`, and
//! detects failed peers through missed heartbeats. Payload bytes are never
//! interpreted here; replication semantics belong to the layer above.

use thiserror::Error;

mod codec;
mod config;
mod message;
mod peer;
mod transport;

pub use codec::{Message, MessageCodec, MAX_MESSAGE_SIZE};
pub use config::GossipConfig;
pub use message::{Envelope, Payload};
pub use peer::{PeerInfo, PeerState};
pub use transport::{Broadcast, GossipNode, RequestHandler};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GossipError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the maximum message size")]
    FrameTooLarge(usize),

    #[error("malformed envelope: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("peer {0} closed the stream mid-exchange")]
    PeerClosed(std::net::SocketAddr),

    #[error("transport is shut down")]
    Terminated,
}
