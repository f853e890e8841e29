//! Catalog namespaces and well-known record fields.

use core::fmt::{self, Display, Formatter};
use core::str::FromStr;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The two replicated entity namespaces.
///
/// [`Namespace::ALL`] fixes the enumeration order used by the canonical
/// catalog root; changing it changes every node's root.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    BorshSerialize,
    BorshDeserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Snapshots,
    Images,
}

impl Namespace {
    pub const ALL: [Self; 2] = [Self::Snapshots, Self::Images];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Snapshots => "snapshots",
            Self::Images => "images",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown namespace: {0}")]
pub struct UnknownNamespace(String);

impl FromStr for Namespace {
    type Err = UnknownNamespace;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "snapshots" => Ok(Self::Snapshots),
            "images" => Ok(Self::Images),
            other => Err(UnknownNamespace(other.to_owned())),
        }
    }
}

impl Display for Namespace {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known metadata field names on snapshot and image records.
///
/// Free-form tag fields may exist alongside these.
pub mod fields {
    pub const SIZE_BYTES: &str = "size_bytes";
    pub const CHUNK_COUNT: &str = "chunk_count";
    pub const CREATED_AT: &str = "created_at";
    pub const CLUSTER: &str = "cluster";
    pub const STATUS: &str = "status";
    pub const MANIFEST: &str = "manifest";
    pub const MANIFEST_ROOT: &str = "manifest_root";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_order_is_snapshots_then_images() {
        assert_eq!(Namespace::ALL, [Namespace::Snapshots, Namespace::Images]);
    }

    #[test]
    fn namespace_round_trips() {
        for ns in Namespace::ALL {
            assert_eq!(ns.as_str().parse::<Namespace>().unwrap(), ns);
        }
        assert!("volumes".parse::<Namespace>().is_err());
    }
}
