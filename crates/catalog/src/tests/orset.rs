//! Observed-remove set semantics.

use super::node;
use crate::orset::{OrSet, Tag};

fn tag(n: &str, counter: u64) -> Tag {
    Tag {
        node: node(n),
        counter,
    }
}

#[test]
fn added_element_is_present() {
    let mut set = OrSet::new();
    set.add_tag("snap1", tag("n1", 1));

    assert!(set.contains("snap1"));
    assert!(!set.contains("snap2"));
}

#[test]
fn removing_observed_tags_removes_element() {
    let mut set = OrSet::new();
    set.add_tag("snap1", tag("n1", 1));

    let observed = set.observed_tags("snap1");
    set.remove_tags("snap1", observed);

    assert!(!set.contains("snap1"));
}

#[test]
fn fresh_add_survives_old_remove() {
    let mut set = OrSet::new();
    set.add_tag("snap1", tag("n1", 1));

    let observed = set.observed_tags("snap1");
    set.remove_tags("snap1", observed);

    // Re-add under a new tag; the old remove does not cover it.
    set.add_tag("snap1", tag("n1", 2));

    assert!(set.contains("snap1"));
}

#[test]
fn concurrent_add_and_remove_preserve_the_add() {
    // n1 and n2 both add; n2 removes having only observed its own add.
    let mut n1 = OrSet::new();
    let mut n2 = OrSet::new();

    n1.add_tag("snap1", tag("n1", 1));

    n2.add_tag("snap1", tag("n2", 1));
    let observed = n2.observed_tags("snap1");
    n2.remove_tags("snap1", observed);

    n1.merge(&n2);
    n2.merge(&n1);

    // n1's tag was never observed by the remove, so both sides keep it.
    assert!(n1.contains("snap1"));
    assert!(n2.contains("snap1"));
}

#[test]
fn merge_is_commutative_and_idempotent() {
    let mut a = OrSet::new();
    let mut b = OrSet::new();

    a.add_tag("x", tag("n1", 1));
    a.add_tag("y", tag("n1", 2));
    b.add_tag("y", tag("n2", 1));
    b.remove_tags("x", [tag("n1", 1)]);

    let mut ab = a.clone();
    ab.merge(&b);

    let mut ba = b.clone();
    ba.merge(&a);

    assert_eq!(ab, ba);

    let mut twice = ab.clone();
    twice.merge(&b);
    assert_eq!(twice, ab);
}

#[test]
fn any_permutation_of_operations_converges() {
    let operations: Vec<Box<dyn Fn(&mut OrSet)>> = vec![
        Box::new(|s| s.add_tag("a", tag("n1", 1))),
        Box::new(|s| s.add_tag("a", tag("n2", 1))),
        Box::new(|s| s.remove_tags("a", [tag("n1", 1)])),
        Box::new(|s| s.add_tag("b", tag("n1", 2))),
        Box::new(|s| s.remove_tags("b", [tag("n3", 9)])),
    ];

    let apply_order = |order: &[usize]| {
        let mut set = OrSet::new();
        for &i in order {
            operations[i](&mut set);
        }
        set
    };

    let reference = apply_order(&[0, 1, 2, 3, 4]);

    for order in [
        [4, 3, 2, 1, 0],
        [2, 0, 1, 4, 3],
        [1, 4, 0, 3, 2],
        [3, 2, 4, 0, 1],
    ] {
        assert_eq!(apply_order(&order), reference);
    }
}

#[test]
fn elements_are_sorted() {
    let mut set = OrSet::new();
    set.add_tag("zeta", tag("n1", 1));
    set.add_tag("alpha", tag("n1", 2));
    set.add_tag("mid", tag("n1", 3));

    let elements: Vec<_> = set.elements().collect();
    assert_eq!(elements, ["alpha", "mid", "zeta"]);
}
