//! Device registries
//!
//! `shared` owns every device of the adapter. `discovered` and `connected`
//! only hold identities that are resolved through `shared` at use time, so an
//! identity left behind after removal resolves to nothing.

use std::sync::Arc;

use rawbt_core::BdAddressAndType;

use crate::cow::CowList;
use crate::device::BtDevice;

#[derive(Default)]
pub(crate) struct DeviceRegistry {
    shared: CowList<Arc<BtDevice>>,
    discovered: CowList<BdAddressAndType>,
    connected: CowList<BdAddressAndType>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Shared
    // ------------------------------------------------------------------------

    pub fn find_shared(&self, id: &BdAddressAndType) -> Option<Arc<BtDevice>> {
        self.shared.find(|d| d.address_and_type() == *id)
    }

    pub fn add_shared(&self, device: Arc<BtDevice>) -> bool {
        self.shared
            .push_unique(device, |a, b| a.address_and_type() == b.address_and_type())
    }

    /// Drop ownership, together with any discovered or connected entry
    pub fn remove_shared(&self, id: &BdAddressAndType) -> Option<Arc<BtDevice>> {
        let removed = self.shared.remove_first(|d| d.address_and_type() == *id)?;
        self.discovered.remove_all(|e| e == id);
        self.connected.remove_all(|e| e == id);
        Some(removed)
    }

    pub fn shared_devices(&self) -> Vec<Arc<BtDevice>> {
        self.shared.snapshot().as_ref().clone()
    }

    pub fn clear_shared(&self) -> usize {
        self.discovered.clear();
        self.connected.clear();
        self.shared.clear()
    }

    // ------------------------------------------------------------------------
    // Discovered
    // ------------------------------------------------------------------------

    /// Only devices present in `shared` can be listed
    pub fn add_discovered(&self, id: &BdAddressAndType) -> bool {
        if self.find_shared(id).is_none() {
            return false;
        }
        self.discovered.push_unique(*id, |a, b| a == b)
    }

    pub fn remove_discovered(&self, id: &BdAddressAndType) -> bool {
        self.discovered.remove_first(|e| e == id).is_some()
    }

    pub fn find_discovered(&self, id: &BdAddressAndType) -> Option<Arc<BtDevice>> {
        if !self.discovered.contains(|e| e == id) {
            return None;
        }
        self.find_shared(id)
    }

    pub fn discovered_devices(&self) -> Vec<Arc<BtDevice>> {
        self.resolve(&self.discovered)
    }

    pub fn clear_discovered(&self) -> usize {
        self.discovered.clear()
    }

    // ------------------------------------------------------------------------
    // Connected
    // ------------------------------------------------------------------------

    pub fn add_connected(&self, id: &BdAddressAndType) -> bool {
        if self.find_shared(id).is_none() {
            return false;
        }
        self.connected.push_unique(*id, |a, b| a == b)
    }

    pub fn remove_connected(&self, id: &BdAddressAndType) -> bool {
        self.connected.remove_first(|e| e == id).is_some()
    }

    pub fn is_connected(&self, id: &BdAddressAndType) -> bool {
        self.connected.contains(|e| e == id)
    }

    pub fn connected_devices(&self) -> Vec<Arc<BtDevice>> {
        self.resolve(&self.connected)
    }

    pub fn find_connected_by_handle(&self, handle: u16) -> Option<Arc<BtDevice>> {
        if handle == 0 {
            return None;
        }
        self.connected_devices()
            .into_iter()
            .find(|d| d.connection_handle() == handle)
    }

    fn resolve(&self, ids: &CowList<BdAddressAndType>) -> Vec<Arc<BtDevice>> {
        let shared = self.shared.snapshot();
        ids.snapshot()
            .iter()
            .filter_map(|id| {
                shared
                    .iter()
                    .find(|d| d.address_and_type() == *id)
                    .cloned()
            })
            .collect()
    }
}
