#![allow(unused_results)] // Test code doesn't need to check all return values

mod lww;
mod orset;

use camino::Utf8PathBuf;
use snapmesh_primitives::NodeId;

use crate::Catalog;

pub(crate) fn node(id: &str) -> NodeId {
    NodeId::new(id).unwrap()
}

pub(crate) fn temp_catalog(id: &str) -> (tempfile::TempDir, Catalog) {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let catalog = Catalog::open(path, node(id)).unwrap();

    (dir, catalog)
}

/// Ships every delta the receiver has not seen, in application order.
pub(crate) fn exchange(from: &Catalog, to: &Catalog) {
    for delta in from.deltas_since(&to.vector_clock()) {
        to.merge(&delta).unwrap();
    }
}
