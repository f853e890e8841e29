//! Anti-entropy engine.
//!
//! Two independent cadences keep every catalog replica converging:
//!
//! - a short-period **push**: locally produced deltas are fanned out over
//!   the gossip broadcast channel;
//! - a long-period **pull**: one random peer is asked for its
//!   `(vector clock, catalog root)` digest; mismatched roots trigger a
//!   bidirectional delta exchange, and a still-divergent root after that
//!   falls back to full-state transfer.
//!
//! Rounds are bounded by a timeout; peers that keep failing rounds are
//! marked suspect and eventually evicted from the active set.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use snapmesh_catalog::{Catalog, CatalogError, VectorClock};
use snapmesh_gossip::GossipError;
use snapmesh_primitives::Hash;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

mod message;
mod transport;

pub use message::{DeltaBatch, SyncRequest, SyncResponse};
pub use transport::{GossipSyncTransport, SyncTransport};

use transport::apply_deltas;

pub const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_ANTI_ENTROPY_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_ROUND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    #[error("transport failure: {0}")]
    Transport(#[from] GossipError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("malformed sync message: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("peer sent an unexpected response")]
    UnexpectedResponse,

    #[error("sync round timed out")]
    Timeout,
}

#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub struct AntiEntropyConfig {
    pub gossip_interval: Duration,
    pub anti_entropy_interval: Duration,
    pub round_timeout: Duration,
    /// Consecutive round failures before a peer is logged as suspect.
    pub suspect_after: u32,
    /// Consecutive round failures before a peer is evicted.
    pub evict_after: u32,
}

impl Default for AntiEntropyConfig {
    fn default() -> Self {
        Self {
            gossip_interval: DEFAULT_GOSSIP_INTERVAL,
            anti_entropy_interval: DEFAULT_ANTI_ENTROPY_INTERVAL,
            round_timeout: DEFAULT_ROUND_TIMEOUT,
            suspect_after: 3,
            evict_after: 5,
        }
    }
}

/// How a forced or scheduled round ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundOutcome {
    /// No peers to talk to.
    NoPeers,
    /// Roots matched; nothing to do.
    InSync,
    /// Delta exchange closed the divergence.
    Reconciled,
    /// Delta exchange was not enough; full state travelled.
    FullSync,
}

#[derive(Clone, Debug)]
pub struct SyncStatus {
    pub root: Hash,
    pub vc: VectorClock,
    pub peer_count: usize,
    pub last_sync_at: Option<SystemTime>,
}

/// The periodic reconciliation driver for one node.
#[derive(Debug)]
pub struct AntiEntropyEngine<T> {
    catalog: Arc<Catalog>,
    transport: Arc<T>,
    config: AntiEntropyConfig,
    /// Our own operation counter up to which deltas have been pushed.
    push_cursor: Mutex<u64>,
    last_sync_at: Mutex<Option<SystemTime>>,
    failures: Mutex<HashMap<SocketAddr, u32>>,
    cancel: CancellationToken,
}

impl<T: SyncTransport + 'static> AntiEntropyEngine<T> {
    pub fn new(catalog: Arc<Catalog>, transport: Arc<T>, config: AntiEntropyConfig) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            transport,
            config,
            push_cursor: Mutex::new(0),
            last_sync_at: Mutex::new(None),
            failures: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Starts the push and pull loops in the background.
    pub fn start(self: &Arc<Self>) {
        let push = Arc::clone(self);
        let _push_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(push.config.gossip_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = push.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(err) = push.push_round().await {
                    debug!(%err, "delta push failed");
                }
            }
        });

        let pull = Arc::clone(self);
        let _pull_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pull.config.anti_entropy_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = pull.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(err) = pull.sync().await {
                    debug!(%err, "anti-entropy round failed");
                }
            }
        });
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Publishes every delta this node has produced since the last push.
    pub async fn push_round(&self) -> Result<usize, SyncError> {
        let own = self.catalog.node_id().clone();

        let cursor_value = *self.push_cursor.lock();
        let mut cursor = VectorClock::new();
        cursor.advance(&own, cursor_value);

        let deltas: Vec<_> = self
            .catalog
            .deltas_since(&cursor)
            .into_iter()
            .filter(|delta| delta.origin == own)
            .collect();

        if deltas.is_empty() {
            return Ok(0);
        }

        let count = deltas.len();
        let high_water = deltas
            .iter()
            .map(snapmesh_catalog::Delta::sequence)
            .max()
            .unwrap_or(cursor_value);

        self.transport.publish(deltas).await?;
        *self.push_cursor.lock() = high_water;

        debug!(count, "pushed local deltas");

        Ok(count)
    }

    /// Forces one anti-entropy round against a random peer.
    pub async fn sync(&self) -> Result<RoundOutcome, SyncError> {
        let peers = self.transport.peers();
        let Some(peer) = peers.choose(&mut rand::thread_rng()).copied() else {
            return Ok(RoundOutcome::NoPeers);
        };

        let outcome = tokio::time::timeout(self.config.round_timeout, self.sync_with(peer))
            .await
            .map_err(|_| SyncError::Timeout)
            .and_then(|result| result);

        match outcome {
            Ok(outcome) => {
                let _previous = self.failures.lock().remove(&peer);
                *self.last_sync_at.lock() = Some(SystemTime::now());
                Ok(outcome)
            }
            Err(err) => {
                self.record_failure(peer);
                Err(err)
            }
        }
    }

    async fn sync_with(&self, peer: SocketAddr) -> Result<RoundOutcome, SyncError> {
        let SyncResponse::Digest {
            root: peer_root,
            vc: peer_vc,
        } = self.transport.exchange(peer, SyncRequest::Digest).await?
        else {
            return Err(SyncError::UnexpectedResponse);
        };

        if peer_root == self.catalog.root() {
            return Ok(RoundOutcome::InSync);
        }

        // Pull their surplus, push ours.
        let SyncResponse::Deltas { deltas } = self
            .transport
            .exchange(
                peer,
                SyncRequest::DeltasSince {
                    vc: self.catalog.vector_clock(),
                },
            )
            .await?
        else {
            return Err(SyncError::UnexpectedResponse);
        };
        let _applied = apply_deltas(&self.catalog, &deltas);

        let outbound = self.catalog.deltas_since(&peer_vc);
        let SyncResponse::Ack { .. } = self
            .transport
            .exchange(peer, SyncRequest::PushDeltas { deltas: outbound })
            .await?
        else {
            return Err(SyncError::UnexpectedResponse);
        };

        // Re-compare; checkpointed-away history shows up here as a root
        // that still differs.
        let SyncResponse::Digest {
            root: peer_root, ..
        } = self.transport.exchange(peer, SyncRequest::Digest).await?
        else {
            return Err(SyncError::UnexpectedResponse);
        };

        if peer_root == self.catalog.root() {
            return Ok(RoundOutcome::Reconciled);
        }

        debug!(%peer, "delta exchange insufficient, transferring full state");

        let SyncResponse::State { state } = self
            .transport
            .exchange(peer, SyncRequest::FullState)
            .await?
        else {
            return Err(SyncError::UnexpectedResponse);
        };
        self.catalog.merge_full_state(&state)?;

        let SyncResponse::Ack { .. } = self
            .transport
            .exchange(
                peer,
                SyncRequest::PushState {
                    state: self.catalog.full_state(),
                },
            )
            .await?
        else {
            return Err(SyncError::UnexpectedResponse);
        };

        Ok(RoundOutcome::FullSync)
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            root: self.catalog.root(),
            vc: self.catalog.vector_clock(),
            peer_count: self.transport.peers().len(),
            last_sync_at: *self.last_sync_at.lock(),
        }
    }

    fn record_failure(&self, peer: SocketAddr) {
        let mut failures = self.failures.lock();
        let count = failures.entry(peer).or_insert(0);
        *count += 1;

        if *count >= self.config.evict_after {
            warn!(%peer, failures = *count, "evicting peer from active set");
            let _previous = failures.remove(&peer);
            drop(failures);
            self.transport.drop_peer(peer);
        } else if *count >= self.config.suspect_after {
            warn!(%peer, failures = *count, "peer is suspect");
        }
    }
}
