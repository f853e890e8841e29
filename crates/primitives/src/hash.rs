//! Content addresses.
//!
//! A [`Hash`] is the SHA-256 digest of some byte sequence, serialized
//! everywhere as 64 lowercase hex characters. It identifies chunks,
//! Merkle nodes, transactions and blocks alike.

use core::fmt::{self, Debug, Display, Formatter};
use core::ops::Deref;
use core::str::FromStr;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A 32-byte SHA-256 content address.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize,
)]
pub struct Hash([u8; 32]);

impl Hash {
    /// The all-zero sentinel, used as the root of an empty Merkle tree.
    pub const ZERO: Self = Self([0; 32]);

    /// Hashes `data` with SHA-256.
    #[must_use]
    pub fn digest(data: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data.as_ref());
        Self(hasher.finalize().into())
    }

    /// Combines two hashes into their parent: SHA-256 over the raw 32-byte
    /// digests, left then right. Hex forms never enter the preimage.
    #[must_use]
    pub fn combine(left: &Self, right: &Self) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(left.0);
        hasher.update(right.0);
        Self(hasher.finalize().into())
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseHashError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected 32 bytes, got {0}")]
    Length(usize),
}

impl FromStr for Hash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| ParseHashError::Length(b.len()))?;
        Ok(Self(bytes))
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({self})")
    }
}

impl Deref for Hash {
    type Target = [u8; 32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HashVisitor;

        impl Visitor<'_> for HashVisitor {
            type Value = Hash;

            fn expecting(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
                formatter.write_str("a 64-character lowercase hex string")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                value.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(HashVisitor)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{from_value as from_json_value, json, to_string as to_json_string};

    use super::*;

    #[test]
    fn digest_matches_known_vector() {
        let hash = Hash::digest(b"hello world");

        assert_eq!(
            hash.to_string(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn empty_digest_is_not_zero() {
        let hash = Hash::digest(b"");

        assert_eq!(
            hash.to_string(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(!hash.is_zero());
        assert!(Hash::ZERO.is_zero());
    }

    #[test]
    fn round_trips_through_hex() {
        let hash = Hash::digest(b"round trip");
        let parsed: Hash = hash.to_string().parse().unwrap();

        assert_eq!(parsed, hash);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!("zz".parse::<Hash>().is_err());
        assert!("deadbeef".parse::<Hash>().is_err());
    }

    #[test]
    fn serde_round_trip() {
        let hash = Hash::digest(b"serde");

        assert_eq!(
            to_json_string(&hash).unwrap(),
            format!("\"{hash}\""),
        );
        assert_eq!(
            from_json_value::<Hash>(json!(hash.to_string())).unwrap(),
            hash
        );
    }

    #[test]
    fn combine_is_order_sensitive() {
        let a = Hash::digest(b"a");
        let b = Hash::digest(b"b");

        assert_ne!(Hash::combine(&a, &b), Hash::combine(&b, &a));
    }
}
