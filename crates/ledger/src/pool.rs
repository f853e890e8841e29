//! Pending transaction pool.

use std::collections::HashSet;

use snapmesh_primitives::Hash;

use crate::transaction::Transaction;
use crate::LedgerError;

pub(crate) const DEFAULT_POOL_MAX: usize = 4096;

/// Validated transactions awaiting inclusion, in submission order.
///
/// A failed block proposal leaves the pool untouched; entries only leave
/// when a block containing them commits.
#[derive(Debug)]
pub(crate) struct TxPool {
    pending: Vec<Transaction>,
    ids: HashSet<Hash>,
    max: usize,
}

impl TxPool {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            pending: Vec::new(),
            ids: HashSet::new(),
            max,
        }
    }

    /// Returns `false` for an id already pooled.
    pub(crate) fn submit(&mut self, tx: Transaction) -> Result<bool, LedgerError> {
        if self.ids.contains(&tx.tx_id) {
            return Ok(false);
        }

        if self.pending.len() >= self.max {
            return Err(LedgerError::PoolFull);
        }

        let _inserted = self.ids.insert(tx.tx_id);
        self.pending.push(tx);

        Ok(true)
    }

    pub(crate) fn contains(&self, tx_id: &Hash) -> bool {
        self.ids.contains(tx_id)
    }

    /// The current pool contents, for the proposer to snapshot.
    pub(crate) fn snapshot(&self) -> Vec<Transaction> {
        self.pending.clone()
    }

    /// Drops every transaction a committed block carried.
    pub(crate) fn retain_uncommitted(&mut self, committed: &HashSet<Hash>) {
        self.pending.retain(|tx| !committed.contains(&tx.tx_id));
        self.ids.retain(|id| !committed.contains(id));
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}
