//! Node identities.

use core::fmt::{self, Display, Formatter};
use core::str::FromStr;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable identifier of a fabric node.
///
/// Ordering is plain byte-wise comparison of the underlying string; that
/// order breaks last-write-wins ties, so it must be total and identical on
/// every node.
#[derive(
    Clone,
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
#[serde(transparent)]
pub struct NodeId(String);

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InvalidNodeId {
    #[error("node id must not be empty")]
    Empty,
    #[error("node id must not contain whitespace")]
    Whitespace,
}

impl NodeId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidNodeId> {
        let id = id.into();

        if id.is_empty() {
            return Err(InvalidNodeId::Empty);
        }
        if id.chars().any(char::is_whitespace) {
            return Err(InvalidNodeId::Whitespace);
        }

        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl FromStr for NodeId {
    type Err = InvalidNodeId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}
