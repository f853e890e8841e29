//! The per-node ledger replica.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use camino::Utf8Path;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use snapmesh_crypto::{ValidatorSigner, ValidatorVerifier};
use snapmesh_merkle::{MerkleTree, Proof};
use snapmesh_primitives::{Hash, NodeId};
use tracing::{debug, warn};

use crate::block::{Block, BlockHeader, BlockSignature};
use crate::pool::{TxPool, DEFAULT_POOL_MAX};
use crate::store::LedgerStore;
use crate::transaction::Transaction;
use crate::LedgerError;

const BLACKLIST_AFTER: u32 = 3;

/// One entry in the fixed validator roster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    pub id: NodeId,
    #[serde(with = "serde_pubkey")]
    pub public_key: [u8; 32],
}

/// The fixed validator set, sorted by id for deterministic rotation.
#[derive(Clone, Debug)]
pub struct ValidatorSet {
    validators: Vec<ValidatorInfo>,
}

impl ValidatorSet {
    pub fn new(mut validators: Vec<ValidatorInfo>) -> Result<Self, LedgerError> {
        if validators.is_empty() {
            return Err(LedgerError::Protocol("empty validator set".to_owned()));
        }

        validators.sort_by(|a, b| a.id.cmp(&b.id));

        let distinct: HashSet<_> = validators.iter().map(|v| &v.id).collect();
        if distinct.len() != validators.len() {
            return Err(LedgerError::Protocol(
                "duplicate validator id in set".to_owned(),
            ));
        }

        Ok(Self { validators })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Byzantine quorum: strictly more than two thirds of the set.
    #[must_use]
    pub fn quorum(&self) -> usize {
        (2 * self.validators.len()) / 3 + 1
    }

    /// Round-robin proposer for a block at `height`.
    #[must_use]
    pub fn proposer_for(&self, height: u64) -> &NodeId {
        let index = ((height.saturating_sub(1)) as usize) % self.validators.len();
        &self.validators[index].id
    }

    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.validators.iter().any(|v| &v.id == id)
    }

    pub fn verifier(&self, id: &NodeId) -> Result<ValidatorVerifier, LedgerError> {
        let info = self
            .validators
            .iter()
            .find(|v| &v.id == id)
            .ok_or_else(|| LedgerError::UnknownValidator(id.to_string()))?;

        ValidatorVerifier::new(info.public_key)
            .map_err(|_| LedgerError::UnknownValidator(id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidatorInfo> {
        self.validators.iter()
    }
}

/// Merkle inclusion proof for one committed transaction.
///
/// Self-contained: a third party holding the transaction and the
/// validator roster can check it without trusting the replica that
/// produced it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxProof {
    pub header: BlockHeader,
    pub signatures: Vec<BlockSignature>,
    pub leaf_index: usize,
    pub leaf_count: usize,
    pub proof: Proof,
}

impl TxProof {
    #[must_use]
    pub fn block_hash(&self) -> Hash {
        self.header.hash()
    }

    /// Checks the Merkle path and the signature quorum.
    #[must_use]
    pub fn verify(&self, tx: &Transaction, validators: &ValidatorSet) -> bool {
        if !self.proof.verify(
            &self.header.tx_merkle_root,
            &tx.leaf_hash(),
            self.leaf_index,
            self.leaf_count,
        ) {
            return false;
        }

        count_valid_signatures(&self.header.hash(), &self.signatures, validators)
            >= validators.quorum()
    }
}

fn count_valid_signatures(
    block_hash: &Hash,
    signatures: &[BlockSignature],
    validators: &ValidatorSet,
) -> usize {
    let mut signers = HashSet::new();

    for entry in signatures {
        if signers.contains(&entry.validator) {
            continue;
        }

        let Ok(verifier) = validators.verifier(&entry.validator) else {
            continue;
        };

        if verifier.verify(block_hash.as_bytes(), &entry.signature).is_ok() {
            let _inserted = signers.insert(entry.validator.clone());
        }
    }

    signers.len()
}

#[derive(Debug)]
struct ReplicaInner {
    chain: Vec<Block>,
    chain_tx_ids: HashSet<Hash>,
    pool: TxPool,
    store: LedgerStore,
    offenses: HashMap<NodeId, u32>,
}

impl ReplicaInner {
    fn tip(&self) -> (u64, Hash) {
        self.chain
            .last()
            .map_or((0, Hash::ZERO), |block| (block.height, block.hash()))
    }
}

/// A validator's view of the ledger.
#[derive(Debug)]
pub struct LedgerReplica {
    validators: ValidatorSet,
    self_id: NodeId,
    signer: ValidatorSigner,
    inner: Mutex<ReplicaInner>,
}

impl LedgerReplica {
    pub fn open(
        dir: impl AsRef<Utf8Path>,
        validators: ValidatorSet,
        self_id: NodeId,
        signer: ValidatorSigner,
    ) -> Result<Self, LedgerError> {
        Self::open_with_pool_max(dir, validators, self_id, signer, DEFAULT_POOL_MAX)
    }

    pub fn open_with_pool_max(
        dir: impl AsRef<Utf8Path>,
        validators: ValidatorSet,
        self_id: NodeId,
        signer: ValidatorSigner,
        tx_pool_max: usize,
    ) -> Result<Self, LedgerError> {
        if !validators.contains(&self_id) {
            return Err(LedgerError::UnknownValidator(self_id.to_string()));
        }

        let dir = dir.as_ref();
        let chain = LedgerStore::read_chain(dir)?;

        // Local recovery trusts the store's content but not its shape.
        let mut prev = (0, Hash::ZERO);
        let mut chain_tx_ids = HashSet::new();
        for block in &chain {
            if block.height != prev.0 + 1 || block.prev_block_hash != prev.1 {
                return Err(LedgerError::Corrupt(format!(
                    "broken chain linkage at height {}",
                    block.height
                )));
            }
            prev = (block.height, block.hash());
            chain_tx_ids.extend(block.transactions.iter().map(|tx| tx.tx_id));
        }

        let store = LedgerStore::open(dir)?;

        Ok(Self {
            validators,
            self_id,
            signer,
            inner: Mutex::new(ReplicaInner {
                chain,
                chain_tx_ids,
                pool: TxPool::new(tx_pool_max),
                store,
                offenses: HashMap::new(),
            }),
        })
    }

    #[must_use]
    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    #[must_use]
    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    /// Validates and pools a transaction.
    ///
    /// Returns `Ok(false)` when the id is already pooled or committed:
    /// resubmission is a no-op, never a second registration.
    pub fn submit_tx(&self, tx: Transaction) -> Result<bool, LedgerError> {
        let verifier = self.validators.verifier(&tx.origin)?;
        tx.verify(&verifier)?;

        let mut inner = self.inner.lock();

        if inner.chain_tx_ids.contains(&tx.tx_id) || inner.pool.contains(&tx.tx_id) {
            debug!(tx_id = %tx.tx_id, "duplicate transaction ignored");
            return Ok(false);
        }

        inner.pool.submit(tx)
    }

    #[must_use]
    pub fn tip(&self) -> (u64, Hash) {
        self.inner.lock().tip()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pool.len()
    }

    /// Whether this replica proposes the next block under rotation.
    #[must_use]
    pub fn is_next_proposer(&self) -> bool {
        let next_height = self.tip().0 + 1;
        self.validators.proposer_for(next_height) == &self.self_id
    }

    /// Builds the next block over the pooled transactions, self-signed.
    ///
    /// The pool is left untouched: entries only leave it when a block
    /// commits, so a failed round loses nothing.
    pub fn propose(&self) -> Result<Block, LedgerError> {
        let inner = self.inner.lock();

        let transactions = inner.pool.snapshot();
        if transactions.is_empty() {
            return Err(LedgerError::Protocol(
                "nothing to propose: transaction pool is empty".to_owned(),
            ));
        }

        let (tip_height, tip_hash) = inner.tip();
        drop(inner);

        let tx_merkle_root = Block::compute_tx_root(&transactions);
        let mut block = Block {
            height: tip_height + 1,
            prev_block_hash: tip_hash,
            transactions,
            tx_merkle_root,
            proposer_id: self.self_id.clone(),
            timestamp: now_nanos(),
            signatures: Vec::new(),
        };

        block.signatures.push(BlockSignature {
            validator: self.self_id.clone(),
            signature: self.signer.sign(block.hash().as_bytes()).to_vec(),
        });

        Ok(block)
    }

    /// Independently validates a circulating proposal and countersigns it.
    pub fn sign_block(&self, block: &Block) -> Result<BlockSignature, LedgerError> {
        self.validate_content(block)?;

        Ok(BlockSignature {
            validator: self.self_id.clone(),
            signature: self.signer.sign(block.hash().as_bytes()).to_vec(),
        })
    }

    /// Commits a fully signed block.
    ///
    /// The block must extend the local tip, its root must recompute, every
    /// transaction must validate, and a Byzantine quorum of distinct valid
    /// validator signatures must cover its hash. The append is fsynced
    /// before this returns.
    pub fn commit(&self, block: Block) -> Result<(), LedgerError> {
        self.validate_content(&block)?;

        let valid = count_valid_signatures(&block.hash(), &block.signatures, &self.validators);
        let need = self.validators.quorum();
        if valid < need {
            return Err(LedgerError::QuorumNotReached { got: valid, need });
        }

        let mut inner = self.inner.lock();

        // Tip may have moved while signatures were gathered.
        let (tip_height, tip_hash) = inner.tip();
        if block.height != tip_height + 1 || block.prev_block_hash != tip_hash {
            return Err(LedgerError::ChainMismatch {
                expected: tip_height + 1,
                got: block.height,
            });
        }

        inner.store.append(&block)?;

        let committed: HashSet<_> = block.transactions.iter().map(|tx| tx.tx_id).collect();
        inner.chain_tx_ids.extend(committed.iter().copied());
        inner.pool.retain_uncommitted(&committed);

        debug!(
            height = block.height,
            txs = block.transactions.len(),
            "block committed"
        );
        inner.chain.push(block);

        Ok(())
    }

    #[must_use]
    pub fn get_block(&self, height: u64) -> Option<Block> {
        if height == 0 {
            return None;
        }
        self.inner.lock().chain.get((height - 1) as usize).cloned()
    }

    /// Inclusion proof for a committed transaction.
    pub fn get_proof(&self, tx_id: &Hash) -> Result<TxProof, LedgerError> {
        let inner = self.inner.lock();

        for block in &inner.chain {
            let Some(leaf_index) = block
                .transactions
                .iter()
                .position(|tx| &tx.tx_id == tx_id)
            else {
                continue;
            };

            let leaves: Vec<_> = block
                .transactions
                .iter()
                .map(Transaction::leaf_hash)
                .collect();
            let tree = MerkleTree::build(&leaves);
            let proof = tree
                .prove(leaf_index)
                .map_err(|err| LedgerError::Corrupt(err.to_string()))?;

            return Ok(TxProof {
                header: block.header(),
                signatures: block.signatures.clone(),
                leaf_index,
                leaf_count: leaves.len(),
                proof,
            });
        }

        Err(LedgerError::TxNotFound(*tx_id))
    }

    #[must_use]
    pub fn contains_tx(&self, tx_id: &Hash) -> bool {
        self.inner.lock().chain_tx_ids.contains(tx_id)
    }

    /// Notes a protocol offense against a peer; repeated offenders are
    /// reported as blacklisted to the layer that owns connectivity.
    pub fn note_offense(&self, peer: &NodeId) -> u32 {
        let mut inner = self.inner.lock();
        let count = inner.offenses.entry(peer.clone()).or_insert(0);
        *count += 1;

        if *count >= BLACKLIST_AFTER {
            warn!(%peer, offenses = *count, "peer crossed the blacklist threshold");
        }

        *count
    }

    #[must_use]
    pub fn is_blacklisted(&self, peer: &NodeId) -> bool {
        self.inner
            .lock()
            .offenses
            .get(peer)
            .is_some_and(|count| *count >= BLACKLIST_AFTER)
    }

    /// Structural validation shared by signing and committing.
    fn validate_content(&self, block: &Block) -> Result<(), LedgerError> {
        let (tip_height, tip_hash) = self.tip();

        if block.height != tip_height + 1 {
            return Err(LedgerError::ChainMismatch {
                expected: tip_height + 1,
                got: block.height,
            });
        }

        if block.prev_block_hash != tip_hash {
            return Err(LedgerError::Protocol(
                "previous block hash does not match the local tip".to_owned(),
            ));
        }

        if !self.validators.contains(&block.proposer_id) {
            return Err(LedgerError::UnknownValidator(block.proposer_id.to_string()));
        }

        if block.transactions.is_empty() {
            return Err(LedgerError::Protocol("block carries no transactions".to_owned()));
        }

        if block.tx_merkle_root != Block::compute_tx_root(&block.transactions) {
            return Err(LedgerError::Protocol(
                "transaction merkle root does not recompute".to_owned(),
            ));
        }

        let mut seen = HashSet::new();
        let inner = self.inner.lock();
        for tx in &block.transactions {
            if !seen.insert(tx.tx_id) {
                return Err(LedgerError::Protocol(format!(
                    "duplicate transaction {} within block",
                    tx.tx_id
                )));
            }
            if inner.chain_tx_ids.contains(&tx.tx_id) {
                return Err(LedgerError::Protocol(format!(
                    "transaction {} already committed",
                    tx.tx_id
                )));
            }

            let verifier = self.validators.verifier(&tx.origin)?;
            tx.verify(&verifier)?;
        }

        Ok(())
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

mod serde_pubkey {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}
