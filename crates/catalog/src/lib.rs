//! Replicated snapshot catalog.
//!
//! Every node carries a full copy of the catalog: per-namespace OR-Sets of
//! entity ids plus per-`(id, field)` last-write-wins registers, all under a
//! vector clock. Local operations emit [`Delta`]s for the gossip layer;
//! foreign deltas arrive through [`Catalog::merge`], the single inbound
//! serialization point. Convergence is checked by comparing canonical
//! Merkle roots over the present state.
//!
//! Durability: every delta is appended to a write-ahead log before the
//! in-memory state mutates, so persisted state never trails what callers
//! have observed. Periodic checkpoints bound recovery time.

use thiserror::Error;

use snapmesh_primitives::Namespace;

mod catalog;
mod clock;
mod delta;
mod lww;
mod orset;
mod root;
mod state;
mod wal;

pub use catalog::{Catalog, Record};
pub use clock::{Causality, MonotonicClock, VectorClock};
pub use delta::{Delta, DeltaOp};
pub use lww::LwwRegister;
pub use orset::{OrSet, Tag};
pub use state::{CatalogState, NamespaceState};

#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CatalogError {
    #[error("entity {id:?} not present in {ns}")]
    NotFound { ns: Namespace, id: String },

    /// Malformed delta or state. Rejected without mutating anything.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt catalog store: {0}")]
    Corrupt(String),
}
