//! Signed registration transactions.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snapmesh_crypto::{ValidatorSigner, ValidatorVerifier};
use snapmesh_primitives::{Hash, NodeId};

use crate::{serde_base64, LedgerError};

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    BorshSerialize,
    BorshDeserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    SnapshotRegister,
    SnapshotTombstone,
    ImageRegister,
}

impl TxKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SnapshotRegister => "snapshot_register",
            Self::SnapshotTombstone => "snapshot_tombstone",
            Self::ImageRegister => "image_register",
        }
    }
}

/// What every transaction witnesses: an entity id and the manifest root
/// that global consensus observed for it.
#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct TxBody {
    pub entity_id: String,
    pub manifest_root: Hash,
}

/// A signed transaction.
///
/// `tx_id` is derived from `(kind, body)` alone, so re-registering the
/// same `(id, manifest_root)` produces the same id and dedups to a no-op
/// anywhere in the fleet.
#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct Transaction {
    pub tx_id: Hash,
    pub kind: TxKind,
    pub body: TxBody,
    pub origin: NodeId,
    #[serde(with = "serde_base64")]
    pub signature: Vec<u8>,
}

impl Transaction {
    pub fn new_signed(
        kind: TxKind,
        body: TxBody,
        origin: NodeId,
        signer: &ValidatorSigner,
    ) -> Self {
        let tx_id = Self::derive_tx_id(kind, &body);
        let signature = signer.sign(&Self::signing_bytes(kind, &body, &origin)).to_vec();

        Self {
            tx_id,
            kind,
            body,
            origin,
            signature,
        }
    }

    /// Deterministic id over the witnessed content.
    #[must_use]
    pub fn derive_tx_id(kind: TxKind, body: &TxBody) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update([0x1f]);
        hasher.update((body.entity_id.len() as u32).to_le_bytes());
        hasher.update(body.entity_id.as_bytes());
        hasher.update(body.manifest_root.as_bytes());
        Hash::from_bytes(hasher.finalize().into())
    }

    /// Canonical preimage for the origin signature.
    #[must_use]
    pub fn signing_bytes(kind: TxKind, body: &TxBody, origin: &NodeId) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(kind.as_str().as_bytes());
        bytes.push(0x1f);
        bytes.extend_from_slice(&(body.entity_id.len() as u32).to_le_bytes());
        bytes.extend_from_slice(body.entity_id.as_bytes());
        bytes.extend_from_slice(body.manifest_root.as_bytes());
        bytes.push(0x1f);
        bytes.extend_from_slice(origin.as_bytes());
        bytes
    }

    /// Hash this transaction contributes as a Merkle leaf.
    #[must_use]
    pub fn leaf_hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.tx_id.as_bytes());
        hasher.update(Self::signing_bytes(self.kind, &self.body, &self.origin));
        hasher.update(&self.signature);
        Hash::from_bytes(hasher.finalize().into())
    }

    /// Shape rules every transaction must satisfy before inclusion.
    pub fn validate_shape(&self) -> Result<(), LedgerError> {
        if self.body.entity_id.is_empty() {
            return Err(LedgerError::Protocol(
                "transaction carries an empty entity id".to_owned(),
            ));
        }

        if self.tx_id != Self::derive_tx_id(self.kind, &self.body) {
            return Err(LedgerError::Protocol(
                "transaction id does not match its content".to_owned(),
            ));
        }

        Ok(())
    }

    /// Full validation: shape plus origin signature.
    pub fn verify(&self, verifier: &ValidatorVerifier) -> Result<(), LedgerError> {
        self.validate_shape()?;

        verifier
            .verify(
                &Self::signing_bytes(self.kind, &self.body, &self.origin),
                &self.signature,
            )
            .map_err(|_| LedgerError::InvalidSignature(format!("tx {}", self.tx_id)))
    }
}
