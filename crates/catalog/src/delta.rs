//! Replication deltas: the minimum information to replay one catalog
//! operation on another replica.

use std::collections::BTreeSet;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use snapmesh_primitives::{Namespace, NodeId};

use crate::clock::VectorClock;
use crate::orset::Tag;
use crate::CatalogError;

/// The operation a delta carries, tagged on the wire as
/// `{"type": ..., "payload": {...}}`.
#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DeltaOp {
    OrsetAdd {
        tag: Tag,
    },
    OrsetRemove {
        tags: BTreeSet<Tag>,
    },
    LwwSet {
        field: String,
        value: String,
        timestamp_nanos: u64,
    },
}

/// One replicated catalog operation.
///
/// `vc` is the origin's full vector clock at issue time; in particular
/// `vc[origin]` is the operation's sequence number in the origin's stream,
/// which both the dominance check and `deltas_since` key off.
#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct Delta {
    pub origin: NodeId,
    #[serde(flatten)]
    pub op: DeltaOp,
    pub ns: Namespace,
    pub key: String,
    pub vc: VectorClock,
}

impl Delta {
    /// Structural validation beyond what deserialization enforces.
    ///
    /// A delta that fails here is rejected before any state is touched.
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.key.is_empty() {
            return Err(CatalogError::Protocol("empty entity key".to_owned()));
        }

        if self.vc.get(&self.origin) == 0 {
            return Err(CatalogError::Protocol(format!(
                "vector clock carries no entry for origin {}",
                self.origin
            )));
        }

        match &self.op {
            DeltaOp::OrsetAdd { tag } => {
                if tag.node != self.origin {
                    return Err(CatalogError::Protocol(format!(
                        "add tag issued by {} but delta originates from {}",
                        tag.node, self.origin
                    )));
                }
                if tag.counter == 0 {
                    return Err(CatalogError::Protocol("zero add tag counter".to_owned()));
                }
            }
            DeltaOp::OrsetRemove { tags } => {
                if tags.iter().any(|tag| tag.counter == 0) {
                    return Err(CatalogError::Protocol("zero remove tag counter".to_owned()));
                }
            }
            DeltaOp::LwwSet {
                field,
                timestamp_nanos,
                ..
            } => {
                if field.is_empty() {
                    return Err(CatalogError::Protocol("empty field name".to_owned()));
                }
                if *timestamp_nanos == 0 {
                    return Err(CatalogError::Protocol("zero write timestamp".to_owned()));
                }
            }
        }

        Ok(())
    }

    /// Origin-stream sequence number of this delta.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.vc.get(&self.origin)
    }
}
