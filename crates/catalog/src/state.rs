//! In-memory catalog state: the pure data the lock guards.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use snapmesh_primitives::{Namespace, NodeId};

use crate::clock::VectorClock;
use crate::delta::{Delta, DeltaOp};
use crate::lww::LwwRegister;
use crate::orset::OrSet;

/// One namespace: membership plus per-id field registers.
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
pub struct NamespaceState {
    pub set: OrSet,
    pub fields: BTreeMap<String, BTreeMap<String, LwwRegister>>,
}

impl NamespaceState {
    pub(crate) fn set_field(&mut self, id: &str, register: LwwRegister, field: &str) {
        let registers = self.fields.entry(id.to_owned()).or_default();

        match registers.get_mut(field) {
            Some(existing) => existing.merge(&register),
            None => {
                let _previous = registers.insert(field.to_owned(), register);
            }
        }
    }

    pub(crate) fn merge(&mut self, other: &Self) {
        self.set.merge(&other.set);

        for (id, registers) in &other.fields {
            for (field, register) in registers {
                self.set_field(id, register.clone(), field);
            }
        }
    }
}

/// Full replicated state; the checkpoint and full-sync transfer unit.
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
pub struct CatalogState {
    pub namespaces: BTreeMap<Namespace, NamespaceState>,
    pub vc: VectorClock,
}

impl CatalogState {
    pub(crate) fn namespace(&self, ns: Namespace) -> Option<&NamespaceState> {
        self.namespaces.get(&ns)
    }

    pub(crate) fn namespace_mut(&mut self, ns: Namespace) -> &mut NamespaceState {
        self.namespaces.entry(ns).or_default()
    }

    /// Applies a validated delta's operation and advances the clock at the
    /// origin coordinate. Assumes the caller already ruled out dominated
    /// deltas; re-application is harmless either way.
    pub(crate) fn apply(&mut self, delta: &Delta) {
        let sequence = delta.sequence();
        let namespace = self.namespace_mut(delta.ns);

        match &delta.op {
            DeltaOp::OrsetAdd { tag } => namespace.set.add_tag(&delta.key, tag.clone()),
            DeltaOp::OrsetRemove { tags } => {
                namespace.set.remove_tags(&delta.key, tags.iter().cloned());
            }
            DeltaOp::LwwSet {
                field,
                value,
                timestamp_nanos,
            } => {
                let register =
                    LwwRegister::new(value.clone(), *timestamp_nanos, delta.origin.clone());
                namespace.set_field(&delta.key, register, field);
            }
        }

        self.vc.advance(&delta.origin, sequence);
    }

    /// Merges a peer's full state: tag-table unions, register merges, and
    /// a pointwise clock merge. The fallback path when delta exchange
    /// cannot close a divergence.
    pub(crate) fn merge(&mut self, other: &Self) {
        for (ns, other_ns) in &other.namespaces {
            self.namespaces.entry(*ns).or_default().merge(other_ns);
        }

        self.vc.merge(&other.vc);
    }

    pub(crate) fn registers(&self, ns: Namespace, id: &str) -> BTreeMap<String, String> {
        self.namespace(ns)
            .and_then(|namespace| namespace.fields.get(id))
            .map(|registers| {
                registers
                    .iter()
                    .map(|(field, register)| (field.clone(), register.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn next_origin_clock(&self, origin: &NodeId) -> (u64, VectorClock) {
        let mut vc = self.vc.clone();
        let counter = vc.increment(origin);
        (counter, vc)
    }
}
