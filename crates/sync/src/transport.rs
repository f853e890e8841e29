//! Transport seam between the engine and the gossip mesh.
//!
//! The engine only speaks [`SyncTransport`]; production wires it to a
//! [`GossipNode`], tests plug in an in-memory implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use snapmesh_catalog::{Catalog, Delta};
use snapmesh_gossip::{Broadcast, GossipNode, RequestHandler};
use snapmesh_primitives::NodeId;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::message::{DeltaBatch, SyncRequest, SyncResponse};
use crate::SyncError;

/// Request/response and broadcast access to the rest of the fleet.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Current set of addressable peers.
    fn peers(&self) -> Vec<SocketAddr>;

    /// One request/response exchange against a single peer.
    async fn exchange(
        &self,
        peer: SocketAddr,
        request: SyncRequest,
    ) -> Result<SyncResponse, SyncError>;

    /// Fans locally produced deltas out to random peers.
    async fn publish(&self, deltas: Vec<Delta>) -> Result<(), SyncError>;

    /// Removes a peer that keeps failing rounds.
    fn drop_peer(&self, peer: SocketAddr);
}

/// Production transport over the gossip mesh.
#[derive(Clone, Debug)]
pub struct GossipSyncTransport {
    node: GossipNode,
}

impl GossipSyncTransport {
    /// Wires a catalog to a gossip node: installs the request handler,
    /// spawns the broadcast listener, and returns the engine-facing
    /// transport.
    pub fn wire(
        catalog: Arc<Catalog>,
        node: GossipNode,
        broadcasts: mpsc::Receiver<Broadcast>,
    ) -> Self {
        node.set_request_handler(Arc::new(CatalogRequestHandler {
            catalog: Arc::clone(&catalog),
        }));

        let _listener = tokio::spawn(delta_listener(catalog, broadcasts));

        Self { node }
    }
}

#[async_trait]
impl SyncTransport for GossipSyncTransport {
    fn peers(&self) -> Vec<SocketAddr> {
        self.node.peer_addrs()
    }

    async fn exchange(
        &self,
        peer: SocketAddr,
        request: SyncRequest,
    ) -> Result<SyncResponse, SyncError> {
        let request = serde_json::to_vec(&request)?;
        let response = self.node.request(peer, request).await?;

        Ok(serde_json::from_slice(&response)?)
    }

    async fn publish(&self, deltas: Vec<Delta>) -> Result<(), SyncError> {
        let batch = serde_json::to_vec(&DeltaBatch { deltas })?;
        let _reached = self.node.broadcast(batch).await?;

        Ok(())
    }

    fn drop_peer(&self, peer: SocketAddr) {
        let _removed = self.node.remove_peer(&peer);
    }
}

/// Answers inbound sync requests out of the local catalog.
struct CatalogRequestHandler {
    catalog: Arc<Catalog>,
}

#[async_trait]
impl RequestHandler for CatalogRequestHandler {
    async fn handle(&self, origin: &NodeId, data: Vec<u8>) -> Vec<u8> {
        let response = match serde_json::from_slice::<SyncRequest>(&data) {
            Ok(request) => answer(&self.catalog, request),
            Err(err) => {
                warn!(%origin, %err, "malformed sync request");
                SyncResponse::Rejected {
                    reason: err.to_string(),
                }
            }
        };

        serde_json::to_vec(&response).unwrap_or_default()
    }
}

pub(crate) fn answer(catalog: &Catalog, request: SyncRequest) -> SyncResponse {
    match request {
        SyncRequest::Digest => SyncResponse::Digest {
            root: catalog.root(),
            vc: catalog.vector_clock(),
        },

        SyncRequest::DeltasSince { vc } => SyncResponse::Deltas {
            deltas: catalog.deltas_since(&vc),
        },

        SyncRequest::PushDeltas { deltas } => {
            let applied = apply_deltas(catalog, &deltas);
            SyncResponse::Ack { applied }
        }

        SyncRequest::FullState => SyncResponse::State {
            state: catalog.full_state(),
        },

        SyncRequest::PushState { state } => match catalog.merge_full_state(&state) {
            Ok(()) => SyncResponse::Ack { applied: 1 },
            Err(err) => SyncResponse::Rejected {
                reason: err.to_string(),
            },
        },
    }
}

/// Applies a batch in order, tolerating per-delta rejections.
pub(crate) fn apply_deltas(catalog: &Catalog, deltas: &[Delta]) -> usize {
    let mut applied = 0;

    for delta in deltas {
        match catalog.merge(delta) {
            Ok(true) => applied += 1,
            Ok(false) => {}
            Err(err) => {
                warn!(origin = %delta.origin, %err, "rejected foreign delta");
            }
        }
    }

    applied
}

/// Merges delta batches arriving over the broadcast channel.
async fn delta_listener(catalog: Arc<Catalog>, mut broadcasts: mpsc::Receiver<Broadcast>) {
    while let Some(broadcast) = broadcasts.recv().await {
        match serde_json::from_slice::<DeltaBatch>(&broadcast.data) {
            Ok(batch) => {
                let applied = apply_deltas(&catalog, &batch.deltas);
                debug!(origin = %broadcast.origin, applied, "merged gossiped deltas");
            }
            Err(err) => {
                warn!(origin = %broadcast.origin, %err, "undecodable delta batch");
            }
        }
    }
}
