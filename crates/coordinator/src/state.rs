//! Per-snapshot lifecycle states.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Lifecycle of one snapshot id on this node.
///
/// `Committed`, `Failed` and `Tombstoned` are terminal. Transitions are
/// linearizable per id: the coordinator holds the id's operation lock for
/// the whole create/restore/tombstone sequence.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotState {
    Chunking,
    Uploading,
    ManifestBuilt,
    Registering,
    Anchoring,
    Committed,
    Failed,
    Tombstoned,
}

impl SnapshotState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Failed | Self::Tombstoned)
    }
}
