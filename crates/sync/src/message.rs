//! Anti-entropy wire messages, carried opaquely by the gossip transport.

use serde::{Deserialize, Serialize};
use snapmesh_catalog::{CatalogState, Delta, VectorClock};
use snapmesh_primitives::Hash;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum SyncRequest {
    /// Ask for the peer's `(vector clock, catalog root)` pair.
    Digest,
    /// Ask for every delta the peer has seen past our clock.
    DeltasSince { vc: VectorClock },
    /// Hand the peer deltas it asked us about implicitly (both directions
    /// of a reconciliation round).
    PushDeltas { deltas: Vec<Delta> },
    /// Ask for the peer's complete state tables.
    FullState,
    /// Hand the peer our complete state tables.
    PushState { state: CatalogState },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum SyncResponse {
    Digest { root: Hash, vc: VectorClock },
    Deltas { deltas: Vec<Delta> },
    State { state: CatalogState },
    Ack { applied: usize },
    /// The peer could not make sense of the request.
    Rejected { reason: String },
}

/// Batch of locally produced deltas pushed over the broadcast channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeltaBatch {
    pub deltas: Vec<Delta>,
}
