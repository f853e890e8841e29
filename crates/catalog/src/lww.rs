//! Last-write-wins registers.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use snapmesh_primitives::NodeId;

/// A value stamped with `(timestamp, origin)`.
///
/// Merging keeps the greater stamp; the origin id breaks exact-timestamp
/// ties, so two nodes can never produce indistinguishable writes.
#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct LwwRegister {
    pub value: String,
    pub timestamp_nanos: u64,
    pub origin: NodeId,
}

impl LwwRegister {
    #[must_use]
    pub fn new(value: impl Into<String>, timestamp_nanos: u64, origin: NodeId) -> Self {
        Self {
            value: value.into(),
            timestamp_nanos,
            origin,
        }
    }

    /// Whether `other` would overwrite `self` under the merge rule.
    #[must_use]
    pub fn would_update(&self, other: &Self) -> bool {
        (other.timestamp_nanos, &other.origin) > (self.timestamp_nanos, &self.origin)
    }

    pub fn merge(&mut self, other: &Self) {
        if self.would_update(other) {
            *self = other.clone();
        }
    }
}
