//! Observed-remove sets.

use std::collections::{BTreeMap, BTreeSet};

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use snapmesh_primitives::NodeId;

/// Unique witness of a single add: the issuing node plus its operation
/// counter at issue time.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    BorshSerialize,
    BorshDeserialize,
)]
pub struct Tag {
    pub node: NodeId,
    pub counter: u64,
}

/// OR-Set over string element ids.
///
/// An element is present iff it has at least one add tag that no replica
/// has observed-removed. Removes only ever carry tags their issuer had
/// seen, so a concurrent re-add (fresh tag) survives an older remove.
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
pub struct OrSet {
    adds: BTreeMap<String, BTreeSet<Tag>>,
    removes: BTreeMap<String, BTreeSet<Tag>>,
}

impl OrSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tag(&mut self, element: &str, tag: Tag) {
        let _inserted = self
            .adds
            .entry(element.to_owned())
            .or_default()
            .insert(tag);
    }

    pub fn remove_tags(&mut self, element: &str, tags: impl IntoIterator<Item = Tag>) {
        self.removes
            .entry(element.to_owned())
            .or_default()
            .extend(tags);
    }

    /// Every add tag currently recorded for `element`, observed or not yet
    /// removed alike. This is what a remove operation must carry.
    #[must_use]
    pub fn observed_tags(&self, element: &str) -> BTreeSet<Tag> {
        self.adds.get(element).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn contains(&self, element: &str) -> bool {
        let Some(adds) = self.adds.get(element) else {
            return false;
        };

        match self.removes.get(element) {
            Some(removes) => adds.difference(removes).next().is_some(),
            None => !adds.is_empty(),
        }
    }

    /// Present elements in ascending lexicographic order.
    pub fn elements(&self) -> impl Iterator<Item = &str> {
        self.adds
            .keys()
            .filter(|element| self.contains(element))
            .map(String::as_str)
    }

    /// Union of both tag tables; the merge CRDTs converge by.
    pub fn merge(&mut self, other: &Self) {
        for (element, tags) in &other.adds {
            self.adds
                .entry(element.clone())
                .or_default()
                .extend(tags.iter().cloned());
        }
        for (element, tags) in &other.removes {
            self.removes
                .entry(element.clone())
                .or_default()
                .extend(tags.iter().cloned());
        }
    }
}
