//! The machine map: id → live machine cell.
//!
//! Shared by both backends. Iteration is in `(generation, value)` order so
//! fingerprints and diagnostics are deterministic.

use crate::machine::MachineCell;
use crate::types::MachineId;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

type MachineKey = (u64, u64);

fn key(id: &MachineId) -> MachineKey {
    (id.generation(), id.value())
}

/// Concurrent map of live machines.
#[derive(Debug, Default)]
pub(crate) struct MachineMap {
    cells: RwLock<BTreeMap<MachineKey, Arc<MachineCell>>>,
}

impl MachineMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Inserts a cell. Returns false if the id was already mapped.
    pub(crate) fn insert(&self, cell: Arc<MachineCell>) -> bool {
        let mut cells = self.cells.write();
        let id = key(&cell.id);
        if cells.contains_key(&id) {
            return false;
        }
        cells.insert(id, cell);
        true
    }

    /// Looks up a live machine.
    pub(crate) fn get(&self, id: &MachineId) -> Option<Arc<MachineCell>> {
        self.cells.read().get(&key(id)).cloned()
    }

    /// Removes a halted machine from the map.
    pub(crate) fn remove(&self, id: &MachineId) -> Option<Arc<MachineCell>> {
        self.cells.write().remove(&key(id))
    }

    /// Snapshot of live cells in deterministic order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<MachineCell>> {
        self.cells.read().values().cloned().collect()
    }

    /// Number of live machines.
    pub(crate) fn len(&self) -> usize {
        self.cells.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::core::{DynMachine, MachineCore};
    use crate::machine::decl::MachineDecl;
    use crate::machine::{DeclBuilder, MachineLogic};
    use crate::types::MachineKind;

    #[derive(Default)]
    struct Stub;

    impl MachineLogic for Stub {
        const NAME: &'static str = "Stub";

        fn configure(decl: &mut DeclBuilder<Self>) {
            decl.state("S").start();
        }
    }

    fn stub_cell(value: u64) -> Arc<MachineCell> {
        let decl = std::sync::Arc::new(MachineDecl::<Stub>::build().unwrap());
        let id = MachineId::new_for_test(value, Stub::NAME);
        let core: Box<dyn DynMachine> = Box::new(MachineCore::new(id.clone(), decl, Stub));
        Arc::new(MachineCell::new(id, MachineKind::Regular, core))
    }

    #[test]
    fn insert_get_remove_round_trip() {
        let map = MachineMap::new();
        let cell = stub_cell(1);
        assert!(map.insert(cell.clone()));
        assert!(!map.insert(cell.clone()), "duplicate insert rejected");

        assert!(map.get(&cell.id).is_some());
        assert!(map.remove(&cell.id).is_some());
        assert!(map.get(&cell.id).is_none());
    }

    #[test]
    fn snapshot_is_ordered_by_value() {
        let map = MachineMap::new();
        map.insert(stub_cell(3));
        map.insert(stub_cell(1));
        map.insert(stub_cell(2));
        let order: Vec<u64> = map.snapshot().iter().map(|c| c.id.value()).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }
}
