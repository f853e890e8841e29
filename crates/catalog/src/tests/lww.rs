//! Last-write-wins register semantics.

use super::node;
use crate::lww::LwwRegister;

#[test]
fn later_timestamp_wins() {
    let mut reg = LwwRegister::new("completed", 1000, node("n1"));
    let newer = LwwRegister::new("failed", 2000, node("n2"));

    reg.merge(&newer);

    assert_eq!(reg.value, "failed");
    assert_eq!(reg.timestamp_nanos, 2000);
}

#[test]
fn earlier_timestamp_loses() {
    let mut reg = LwwRegister::new("completed", 2000, node("n1"));
    let older = LwwRegister::new("failed", 1000, node("n2"));

    reg.merge(&older);

    assert_eq!(reg.value, "completed");
}

#[test]
fn tie_breaks_toward_greater_origin() {
    let mut reg = LwwRegister::new("from-n1", 1000, node("n1"));
    let tied = LwwRegister::new("from-n2", 1000, node("n2"));

    reg.merge(&tied);
    assert_eq!(reg.value, "from-n2");

    // The other direction keeps n2 as well.
    let mut reg = LwwRegister::new("from-n2", 1000, node("n2"));
    let tied = LwwRegister::new("from-n1", 1000, node("n1"));

    reg.merge(&tied);
    assert_eq!(reg.value, "from-n2");
}

#[test]
fn merge_is_idempotent() {
    let mut reg = LwwRegister::new("value", 1000, node("n1"));
    let same = reg.clone();

    reg.merge(&same);
    reg.merge(&same);

    assert_eq!(reg, same);
}

#[test]
fn final_value_depends_only_on_maximum_stamp() {
    let writes = [
        LwwRegister::new("a", 1500, node("n2")),
        LwwRegister::new("b", 3000, node("n1")),
        LwwRegister::new("c", 1500, node("n3")),
        LwwRegister::new("d", 2999, node("n9")),
    ];

    let merged_in = |order: &[usize]| {
        let mut reg = LwwRegister::new("initial", 1, node("n0"));
        for &i in order {
            reg.merge(&writes[i]);
        }
        reg
    };

    let reference = merged_in(&[0, 1, 2, 3]);
    assert_eq!(reference.value, "b");

    for order in [[3, 2, 1, 0], [1, 0, 3, 2], [2, 3, 0, 1]] {
        assert_eq!(merged_in(&order), reference);
    }
}
