//! The catalog handle: the one entry point to replicated state.
//!
//! All maps and the vector clock live behind a single reader-writer lock,
//! so every `(vc, operation)` pair is atomic and readers always see a
//! consistent snapshot. Nothing outside this module touches the maps
//! directly.

use std::collections::BTreeMap;

use camino::Utf8Path;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use snapmesh_primitives::{Hash, Namespace, NodeId};
use tracing::debug;

use crate::clock::{MonotonicClock, VectorClock};
use crate::delta::{Delta, DeltaOp};
use crate::orset::Tag;
use crate::root::catalog_root;
use crate::state::CatalogState;
use crate::wal::DeltaLog;
use crate::CatalogError;

pub const DEFAULT_CHECKPOINT_EVERY: usize = 1024;

/// Read view of one entity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub present: bool,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug)]
struct Inner {
    state: CatalogState,
    /// Deltas observed since the last checkpoint, in application order.
    history: Vec<Delta>,
    log: DeltaLog,
    appended: usize,
}

/// A node's replica of the catalog.
#[derive(Debug)]
pub struct Catalog {
    node_id: NodeId,
    clock: MonotonicClock,
    checkpoint_every: usize,
    inner: RwLock<Inner>,
}

impl Catalog {
    /// Opens (or recovers) the catalog stored under `dir`.
    ///
    /// Recovery loads the latest checkpoint and replays the intact log
    /// tail on top of it.
    pub fn open(dir: impl AsRef<Utf8Path>, node_id: NodeId) -> Result<Self, CatalogError> {
        Self::open_with_checkpoint_every(dir, node_id, DEFAULT_CHECKPOINT_EVERY)
    }

    /// As [`Catalog::open`], with an explicit checkpoint threshold: a
    /// checkpoint is cut after this many appended deltas.
    pub fn open_with_checkpoint_every(
        dir: impl AsRef<Utf8Path>,
        node_id: NodeId,
        checkpoint_every: usize,
    ) -> Result<Self, CatalogError> {
        let dir = dir.as_ref();

        let mut state = DeltaLog::load_checkpoint(dir)?.unwrap_or_default();
        let history = DeltaLog::read_log(dir)?;
        for delta in &history {
            state.apply(delta);
        }

        let appended = history.len();
        let log = DeltaLog::open(dir)?;

        Ok(Self {
            node_id,
            clock: MonotonicClock::new(),
            checkpoint_every,
            inner: RwLock::new(Inner {
                state,
                history,
                log,
                appended,
            }),
        })
    }

    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Adds `id` to the namespace under a fresh tag.
    pub fn add(&self, ns: Namespace, id: &str) -> Result<Delta, CatalogError> {
        let mut inner = self.inner.write();

        let (counter, vc) = inner.state.next_origin_clock(&self.node_id);
        let delta = Delta {
            origin: self.node_id.clone(),
            op: DeltaOp::OrsetAdd {
                tag: Tag {
                    node: self.node_id.clone(),
                    counter,
                },
            },
            ns,
            key: id.to_owned(),
            vc,
        };

        self.commit_local(&mut inner, delta)
    }

    /// Tombstones `id` by removing every add tag observed so far.
    ///
    /// Only observed tags travel in the delta, so a concurrent re-add with
    /// a fresh tag survives this remove on every replica.
    pub fn remove(&self, ns: Namespace, id: &str) -> Result<Delta, CatalogError> {
        let mut inner = self.inner.write();

        let present = inner
            .state
            .namespace(ns)
            .is_some_and(|namespace| namespace.set.contains(id));
        if !present {
            return Err(CatalogError::NotFound {
                ns,
                id: id.to_owned(),
            });
        }

        let observed = inner
            .state
            .namespace(ns)
            .map(|namespace| namespace.set.observed_tags(id))
            .unwrap_or_default();

        let (_counter, vc) = inner.state.next_origin_clock(&self.node_id);
        let delta = Delta {
            origin: self.node_id.clone(),
            op: DeltaOp::OrsetRemove { tags: observed },
            ns,
            key: id.to_owned(),
            vc,
        };

        self.commit_local(&mut inner, delta)
    }

    /// Writes a field register stamped with this node's monotonic clock.
    pub fn set_field(
        &self,
        ns: Namespace,
        id: &str,
        field: &str,
        value: &str,
    ) -> Result<Delta, CatalogError> {
        let timestamp_nanos = self.clock.now_nanos();
        let mut inner = self.inner.write();

        let (_counter, vc) = inner.state.next_origin_clock(&self.node_id);
        let delta = Delta {
            origin: self.node_id.clone(),
            op: DeltaOp::LwwSet {
                field: field.to_owned(),
                value: value.to_owned(),
                timestamp_nanos,
            },
            ns,
            key: id.to_owned(),
            vc,
        };

        self.commit_local(&mut inner, delta)
    }

    #[must_use]
    pub fn get(&self, ns: Namespace, id: &str) -> Record {
        let inner = self.inner.read();

        Record {
            present: inner
                .state
                .namespace(ns)
                .is_some_and(|namespace| namespace.set.contains(id)),
            fields: inner.state.registers(ns, id),
        }
    }

    /// Present entities in ascending id order.
    #[must_use]
    pub fn list(&self, ns: Namespace) -> Vec<(String, Record)> {
        self.list_where(ns, |_, _| true)
    }

    #[must_use]
    pub fn list_where<F>(&self, ns: Namespace, predicate: F) -> Vec<(String, Record)>
    where
        F: Fn(&str, &Record) -> bool,
    {
        let inner = self.inner.read();

        let Some(namespace) = inner.state.namespace(ns) else {
            return Vec::new();
        };

        namespace
            .set
            .elements()
            .map(|id| {
                let record = Record {
                    present: true,
                    fields: inner.state.registers(ns, id),
                };
                (id.to_owned(), record)
            })
            .filter(|(id, record)| predicate(id, record))
            .collect()
    }

    /// Applies a foreign delta.
    ///
    /// Returns `Ok(false)` when the delta's clock is already dominated by
    /// this replica's; re-delivery is idempotent. Malformed deltas fail
    /// without touching state; a log failure leaves memory untouched so
    /// observable state never runs ahead of what is durable.
    pub fn merge(&self, delta: &Delta) -> Result<bool, CatalogError> {
        delta.validate()?;

        let mut inner = self.inner.write();

        if inner.state.vc.dominates(&delta.vc) {
            debug!(origin = %delta.origin, seq = delta.sequence(), "dropping dominated delta");
            return Ok(false);
        }

        inner.log.append(delta)?;
        inner.state.apply(delta);
        inner.history.push(delta.clone());
        inner.appended += 1;

        self.maybe_checkpoint(&mut inner)?;

        Ok(true)
    }

    /// Every observed delta whose origin sequence exceeds the caller's
    /// clock entry for that origin, in application order.
    ///
    /// History only reaches back to the last checkpoint; a caller that is
    /// further behind is closed over by full-state transfer instead.
    #[must_use]
    pub fn deltas_since(&self, vc: &VectorClock) -> Vec<Delta> {
        let inner = self.inner.read();

        inner
            .history
            .iter()
            .filter(|delta| delta.sequence() > vc.get(&delta.origin))
            .cloned()
            .collect()
    }

    /// Canonical root over present membership and current registers.
    #[must_use]
    pub fn root(&self) -> Hash {
        catalog_root(&self.inner.read().state)
    }

    #[must_use]
    pub fn vector_clock(&self) -> VectorClock {
        self.inner.read().state.vc.clone()
    }

    #[must_use]
    pub fn full_state(&self) -> CatalogState {
        self.inner.read().state.clone()
    }

    /// Merges a peer's full state and checkpoints immediately: the merged
    /// information has no per-delta log records, so the checkpoint is what
    /// makes it durable.
    pub fn merge_full_state(&self, other: &CatalogState) -> Result<(), CatalogError> {
        let mut inner = self.inner.write();

        inner.state.merge(other);

        let Inner {
            ref mut log,
            ref state,
            ..
        } = *inner;
        log.checkpoint(state)?;
        inner.history.clear();
        inner.appended = 0;

        Ok(())
    }

    /// Forces a checkpoint regardless of the append counter.
    pub fn checkpoint_now(&self) -> Result<(), CatalogError> {
        let mut inner = self.inner.write();

        let Inner {
            ref mut log,
            ref state,
            ..
        } = *inner;
        log.checkpoint(state)?;
        inner.history.clear();
        inner.appended = 0;

        Ok(())
    }

    fn commit_local(&self, inner: &mut Inner, delta: Delta) -> Result<Delta, CatalogError> {
        delta.validate()?;

        inner.log.append(&delta)?;
        inner.state.apply(&delta);
        inner.history.push(delta.clone());
        inner.appended += 1;

        self.maybe_checkpoint(inner)?;

        Ok(delta)
    }

    fn maybe_checkpoint(&self, inner: &mut Inner) -> Result<(), CatalogError> {
        if inner.appended < self.checkpoint_every {
            return Ok(());
        }

        debug!(deltas = inner.appended, "checkpointing catalog");

        let Inner {
            ref mut log,
            ref state,
            ..
        } = *inner;
        log.checkpoint(state)?;
        inner.history.clear();
        inner.appended = 0;

        Ok(())
    }
}
