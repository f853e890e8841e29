//! Vector clocks and the per-node monotonic timestamp source.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use borsh::{BorshDeserialize, BorshSerialize};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use snapmesh_primitives::NodeId;

/// Causal relationship between two vector clocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Causality {
    Equal,
    /// Self happened strictly before other.
    Before,
    /// Self happened strictly after other.
    After,
    Concurrent,
}

/// Per-origin operation counters.
///
/// Ordering is pointwise: `a ≤ b` iff every entry of `a` is ≤ the matching
/// entry of `b`, with missing entries read as zero.
#[derive(
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    BorshSerialize,
    BorshDeserialize,
)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<NodeId, u64>);

impl VectorClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, node: &NodeId) -> u64 {
        self.0.get(node).copied().unwrap_or(0)
    }

    /// Bumps `node`'s counter by one and returns the new value.
    pub fn increment(&mut self, node: &NodeId) -> u64 {
        let counter = self.0.entry(node.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Raises `node`'s entry to at least `counter`.
    pub fn advance(&mut self, node: &NodeId, counter: u64) {
        let entry = self.0.entry(node.clone()).or_insert(0);
        *entry = (*entry).max(counter);
    }

    /// Pointwise maximum.
    pub fn merge(&mut self, other: &Self) {
        for (node, counter) in &other.0 {
            self.advance(node, *counter);
        }
    }

    /// Whether every entry of `other` is covered by `self`.
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        other
            .0
            .iter()
            .all(|(node, counter)| self.get(node) >= *counter)
    }

    #[must_use]
    pub fn compare(&self, other: &Self) -> Causality {
        let self_covers = self.dominates(other);
        let other_covers = other.dominates(self);

        match (self_covers, other_covers) {
            (true, true) => Causality::Equal,
            (true, false) => Causality::After,
            (false, true) => Causality::Before,
            (false, false) => Causality::Concurrent,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, u64)> {
        self.0.iter().map(|(node, counter)| (node, *counter))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Wall-clock nanoseconds, strictly increasing per node.
///
/// If the clock stalls or steps backwards the next reading is the previous
/// one plus one, so no two timestamps from one node ever collide.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Mutex<u64>,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_nanos(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);

        let mut last = self.last.lock();
        *last = if wall > *last { wall } else { *last + 1 };
        *last
    }
}
