//! Gossip envelopes.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use snapmesh_primitives::NodeId;

/// Everything that travels between peers.
///
/// `message_id` is unique per origin; the pair `(origin, message_id)`
/// drives at-most-once broadcast delivery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: NodeId,
    pub message_id: u64,
    #[serde(flatten)]
    pub payload: Payload,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Payload {
    /// Membership handshake; carries the joiner's listen address.
    Join { listen_addr: SocketAddr },
    /// Response to a join, and piggybacked on membership changes.
    PeerList { peers: Vec<SocketAddr> },
    Heartbeat { listen_addr: SocketAddr },
    /// Announcement that a peer missed too many heartbeats.
    PeerFailed { addr: SocketAddr },
    /// Opaque application payload, relayed with bounded fanout.
    Broadcast { data: Vec<u8> },
    /// Opaque request expecting a single response on the same stream.
    Request { data: Vec<u8> },
    Response { data: Vec<u8> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_form_is_tagged() {
        let envelope = Envelope {
            origin: NodeId::new("n1").unwrap(),
            message_id: 42,
            payload: Payload::Broadcast {
                data: vec![1, 2, 3],
            },
        };

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["origin"], "n1");
        assert_eq!(json["message_id"], 42);
        assert_eq!(json["type"], "broadcast");

        let parsed: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn unknown_payload_type_is_rejected() {
        let raw = serde_json::json!({
            "origin": "n1",
            "message_id": 1,
            "type": "teleport",
            "body": {},
        });

        assert!(serde_json::from_value::<Envelope>(raw).is_err());
    }
}
