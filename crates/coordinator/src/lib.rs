//! Snapshot coordinator.
//!
//! Orchestrates the end-to-end flows across the chunk store, the catalog
//! and the consensus ledger: create (chunk → upload → manifest → register
//! → anchor), restore (lookup → verified fetch → reassemble) and
//! tombstone. This is the only place that maps lower-level errors onto
//! snapshot state transitions; no other component owns snapshot state.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use futures_util::StreamExt;
use snapmesh_catalog::{Catalog, CatalogError};
use snapmesh_chunkstore::{Chunk, ChunkError, ChunkStore, Chunker};
use snapmesh_crypto::ValidatorSigner;
use snapmesh_ledger::{LedgerError, LedgerReplica, Transaction, TxBody, TxKind, TxProof};
use snapmesh_merkle::MerkleTree;
use snapmesh_primitives::{record::fields, Hash, Namespace};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

mod state;

pub use state::SnapshotState;

pub const DEFAULT_UPLOAD_PARALLELISM: usize = 8;
pub const DEFAULT_CHUNK_RETRIES: u32 = 3;
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(30);

const COMMIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoordinatorError {
    #[error("snapshot {0} not found")]
    NotFound(String),

    /// A chunk failed integrity verification during restore; the index
    /// pinpoints which one.
    #[error("chunk {index} ({hash}) failed integrity verification")]
    ChunkIntegrity { index: usize, hash: Hash },

    #[error("manifest does not hash to the recorded root")]
    ManifestMismatch,

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CoordinatorConfig {
    /// Recorded in every snapshot's `cluster` field.
    pub cluster: String,
    pub encrypt_chunks: bool,
    pub upload_parallelism: usize,
    /// Retries per chunk on transient failures; integrity failures are
    /// never retried.
    pub chunk_retries: u32,
    pub retry_backoff: Duration,
    pub chunk_timeout: Duration,
    pub commit_timeout: Duration,
    /// Verify each chunk's Merkle inclusion against the manifest root on
    /// restore, on top of the content-address check.
    pub verify_proofs: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            cluster: "default".to_owned(),
            encrypt_chunks: false,
            upload_parallelism: DEFAULT_UPLOAD_PARALLELISM,
            chunk_retries: DEFAULT_CHUNK_RETRIES,
            retry_backoff: Duration::from_millis(50),
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
            verify_proofs: true,
        }
    }
}

/// Orchestrates snapshot lifecycles over the three subsystems.
#[derive(Debug)]
pub struct Coordinator {
    catalog: Arc<Catalog>,
    chunks: Arc<ChunkStore>,
    ledger: Arc<LedgerReplica>,
    signer: ValidatorSigner,
    chunker: Chunker,
    config: CoordinatorConfig,
    states: DashMap<String, SnapshotState>,
    op_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Coordinator {
    #[must_use]
    pub fn new(
        catalog: Arc<Catalog>,
        chunks: Arc<ChunkStore>,
        ledger: Arc<LedgerReplica>,
        signer: ValidatorSigner,
        chunker: Chunker,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            catalog,
            chunks,
            ledger,
            signer,
            chunker,
            config,
            states: DashMap::new(),
            op_locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn status(&self, id: &str) -> Option<SnapshotState> {
        self.states.get(id).map(|state| *state)
    }

    /// Creates a snapshot from `source` and drives it to `COMMITTED`.
    ///
    /// Identical source bytes always produce the identical manifest root,
    /// and anchoring the same `(id, root)` twice dedups at the ledger, so
    /// re-running a create is safe.
    pub async fn create<R>(
        &self,
        id: &str,
        source: R,
    ) -> Result<SnapshotState, CoordinatorError>
    where
        R: AsyncRead + Unpin,
    {
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;

        match self.run_create(id, source).await {
            Ok(state) => Ok(state),
            Err(err) => {
                error!(%id, %err, "snapshot create failed");
                self.set_state(id, SnapshotState::Failed);
                Err(err)
            }
        }
    }

    async fn run_create<R>(
        &self,
        id: &str,
        source: R,
    ) -> Result<SnapshotState, CoordinatorError>
    where
        R: AsyncRead + Unpin,
    {
        self.set_state(id, SnapshotState::Chunking);

        let mut stream = std::pin::pin!(self.chunker.split(source));
        let semaphore = Arc::new(Semaphore::new(self.config.upload_parallelism));
        let mut uploads = tokio::task::JoinSet::new();
        let mut ordered_hashes = Vec::new();
        let mut size_bytes = 0;

        self.set_state(id, SnapshotState::Uploading);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            ordered_hashes.push(chunk.hash);
            size_bytes += chunk.data.len() as u64;

            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            let store = Arc::clone(&self.chunks);
            let encrypt = self.config.encrypt_chunks;
            let retries = self.config.chunk_retries;
            let backoff = self.config.retry_backoff;
            let timeout = self.config.chunk_timeout;

            let _handle = uploads.spawn(async move {
                let _permit = permit;
                upload_with_retry(&store, chunk, encrypt, retries, backoff, timeout).await
            });
        }

        while let Some(joined) = uploads.join_next().await {
            joined.expect("upload task never panics")?;
        }

        let manifest_root = MerkleTree::root_of(&ordered_hashes);
        self.set_state(id, SnapshotState::ManifestBuilt);

        for hash in &ordered_hashes {
            self.chunks.pin(hash);
        }

        self.set_state(id, SnapshotState::Registering);
        self.register_in_catalog(id, &ordered_hashes, manifest_root, size_bytes)?;

        self.set_state(id, SnapshotState::Anchoring);
        let proof = self
            .anchor(TxKind::SnapshotRegister, id, manifest_root)
            .await?;

        debug!(
            %id,
            root = %manifest_root,
            height = proof.header.height,
            "snapshot anchored"
        );

        self.set_state(id, SnapshotState::Committed);
        Ok(SnapshotState::Committed)
    }

    fn register_in_catalog(
        &self,
        id: &str,
        hashes: &[Hash],
        manifest_root: Hash,
        size_bytes: u64,
    ) -> Result<(), CoordinatorError> {
        let ns = Namespace::Snapshots;
        let manifest: Vec<String> = hashes.iter().map(Hash::to_string).collect();
        let manifest_json =
            serde_json::to_string(&manifest).expect("string list always serializes");

        let _delta = self.catalog.add(ns, id)?;
        let _delta = self
            .catalog
            .set_field(ns, id, fields::SIZE_BYTES, &size_bytes.to_string())?;
        let _delta =
            self.catalog
                .set_field(ns, id, fields::CHUNK_COUNT, &hashes.len().to_string())?;
        let _delta =
            self.catalog
                .set_field(ns, id, fields::CREATED_AT, &now_secs().to_string())?;
        let _delta = self
            .catalog
            .set_field(ns, id, fields::CLUSTER, &self.config.cluster)?;
        let _delta = self.catalog.set_field(ns, id, fields::MANIFEST, &manifest_json)?;
        let _delta = self.catalog.set_field(
            ns,
            id,
            fields::MANIFEST_ROOT,
            &manifest_root.to_string(),
        )?;
        let _delta = self.catalog.set_field(ns, id, fields::STATUS, "completed")?;

        Ok(())
    }

    /// Submits a registration transaction and waits for its commit proof.
    async fn anchor(
        &self,
        kind: TxKind,
        id: &str,
        manifest_root: Hash,
    ) -> Result<TxProof, CoordinatorError> {
        let tx = Transaction::new_signed(
            kind,
            TxBody {
                entity_id: id.to_owned(),
                manifest_root,
            },
            self.catalog.node_id().clone(),
            &self.signer,
        );
        let tx_id = tx.tx_id;

        let accepted = self.ledger.submit_tx(tx)?;
        if !accepted {
            debug!(%tx_id, "transaction already known, awaiting existing anchor");
        }

        // A single-validator set commits locally; otherwise the consensus
        // round driver moves the chain and we watch for inclusion.
        let single_validator = self.ledger.validators().len() == 1;

        let deadline = tokio::time::Instant::now() + self.config.commit_timeout;
        loop {
            if self.ledger.contains_tx(&tx_id) {
                return Ok(self.ledger.get_proof(&tx_id)?);
            }

            if single_validator && self.ledger.pending_count() > 0 {
                // Concurrent creates may race each other's local round;
                // the loser finds its transaction committed on re-check.
                match self.ledger.propose().and_then(|block| self.ledger.commit(block)) {
                    Ok(()) => continue,
                    Err(err) => debug!(%err, "local commit round lost a race"),
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(CoordinatorError::Timeout("block commit wait"));
            }

            tokio::time::sleep(COMMIT_POLL_INTERVAL).await;
        }
    }

    /// Restores a snapshot into `sink`, verifying every chunk against its
    /// content address and its position under the manifest root.
    pub async fn restore<W>(&self, id: &str, sink: &mut W) -> Result<u64, CoordinatorError>
    where
        W: AsyncWrite + Unpin,
    {
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;

        let record = self.catalog.get(Namespace::Snapshots, id);
        if !record.present {
            return Err(CoordinatorError::NotFound(id.to_owned()));
        }

        let manifest_root: Hash = record
            .fields
            .get(fields::MANIFEST_ROOT)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| CoordinatorError::NotFound(id.to_owned()))?;

        let manifest: Vec<Hash> = record
            .fields
            .get(fields::MANIFEST)
            .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
            .map(|hashes| {
                hashes
                    .iter()
                    .map(|h| h.parse())
                    .collect::<Result<Vec<Hash>, _>>()
            })
            .transpose()
            .ok()
            .flatten()
            .ok_or_else(|| CoordinatorError::NotFound(id.to_owned()))?;

        // The manifest itself is signed against the anchored root.
        if MerkleTree::root_of(&manifest) != manifest_root {
            return Err(CoordinatorError::ManifestMismatch);
        }

        let tree = MerkleTree::build(&manifest);
        let mut restored = 0;

        for (index, hash) in manifest.iter().enumerate() {
            let data = match self.chunks.get(hash).await {
                Ok(data) => data,
                Err(ChunkError::Integrity { .. }) => {
                    return Err(CoordinatorError::ChunkIntegrity {
                        index,
                        hash: *hash,
                    });
                }
                Err(err) => return Err(err.into()),
            };

            if self.config.verify_proofs {
                let proof = tree
                    .prove(index)
                    .map_err(|_| CoordinatorError::ManifestMismatch)?;
                if !proof.verify(&manifest_root, hash, index, manifest.len()) {
                    return Err(CoordinatorError::ChunkIntegrity {
                        index,
                        hash: *hash,
                    });
                }
            }

            sink.write_all(&data).await.map_err(ChunkError::from)?;
            restored += data.len() as u64;
        }

        sink.flush().await.map_err(ChunkError::from)?;

        Ok(restored)
    }

    /// Tombstones a snapshot in the catalog and anchors the removal.
    pub async fn tombstone(&self, id: &str) -> Result<SnapshotState, CoordinatorError> {
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;

        let record = self.catalog.get(Namespace::Snapshots, id);
        if !record.present {
            return Err(CoordinatorError::NotFound(id.to_owned()));
        }

        let manifest_root = record
            .fields
            .get(fields::MANIFEST_ROOT)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(Hash::ZERO);

        let _delta = self.catalog.remove(Namespace::Snapshots, id)?;
        let _delta = self
            .catalog
            .set_field(Namespace::Snapshots, id, fields::STATUS, "tombstoned")?;

        if let Some(hashes) = record
            .fields
            .get(fields::MANIFEST)
            .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
        {
            for hash in hashes.iter().filter_map(|h| h.parse::<Hash>().ok()) {
                self.chunks.unpin(&hash);
            }
        }

        let _proof = self
            .anchor(TxKind::SnapshotTombstone, id, manifest_root)
            .await?;

        self.set_state(id, SnapshotState::Tombstoned);
        Ok(SnapshotState::Tombstoned)
    }

    /// Registers an image record: the sibling namespace shares the same
    /// catalog-plus-anchor path without a chunk upload.
    pub async fn register_image(
        &self,
        id: &str,
        manifest_root: Hash,
    ) -> Result<TxProof, CoordinatorError> {
        let ns = Namespace::Images;

        let _delta = self.catalog.add(ns, id)?;
        let _delta =
            self.catalog
                .set_field(ns, id, fields::CREATED_AT, &now_secs().to_string())?;
        let _delta = self.catalog.set_field(
            ns,
            id,
            fields::MANIFEST_ROOT,
            &manifest_root.to_string(),
        )?;

        self.anchor(TxKind::ImageRegister, id, manifest_root).await
    }

    fn set_state(&self, id: &str, state: SnapshotState) {
        debug!(%id, %state, "snapshot state transition");
        let _previous = self.states.insert(id.to_owned(), state);
    }

    fn op_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.op_locks
            .entry(id.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Uploads one chunk, retrying transient failures with exponential
/// backoff. Integrity failures propagate immediately.
async fn upload_with_retry(
    store: &ChunkStore,
    chunk: Chunk,
    encrypt: bool,
    retries: u32,
    backoff: Duration,
    timeout: Duration,
) -> Result<(), CoordinatorError> {
    let mut attempt = 0;

    loop {
        let result = tokio::time::timeout(timeout, store.put(chunk.data.clone(), encrypt)).await;

        let err = match result {
            Ok(Ok(_hash)) => return Ok(()),
            Ok(Err(err)) if err.is_transient() && attempt < retries => err.into(),
            Ok(Err(err)) => return Err(err.into()),
            Err(_elapsed) => {
                if attempt >= retries {
                    return Err(CoordinatorError::Timeout("chunk upload"));
                }
                CoordinatorError::Timeout("chunk upload")
            }
        };

        attempt += 1;
        let delay = backoff * 2u32.saturating_pow(attempt - 1);
        warn!(hash = %chunk.hash, attempt, %err, "retrying chunk upload");
        tokio::time::sleep(delay).await;
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
