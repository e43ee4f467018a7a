//! Listener capability sets
//!
//! Every callback carries the monotonic millisecond timestamp of the event
//! that caused it. Callbacks run on the adapter's event worker and should
//! return quickly, except [`AdapterStatusListener::device_ready`] which is
//! delivered from its own task and may block.

use std::sync::Arc;

use rawbt_core::protocol::EirDataType;
use rawbt_core::smp::{PairingMode, SmpPairingState};
use rawbt_core::{AdapterSetting, DiscoveryPolicy, HciStatusCode, ScanType};

use crate::adapter::BtAdapter;
use crate::device::BtDevice;

/// Adapter and device lifecycle notifications
#[allow(unused_variables)]
pub trait AdapterStatusListener: Send + Sync {
    /// Restrict device callbacks to matching devices
    fn match_device(&self, device: &BtDevice) -> bool {
        true
    }

    fn adapter_settings_changed(
        &self,
        adapter: &BtAdapter,
        old: AdapterSetting,
        new: AdapterSetting,
        changed: AdapterSetting,
        timestamp: u64,
    ) {
    }

    fn discovering_changed(
        &self,
        adapter: &BtAdapter,
        current_meta: ScanType,
        changed_type: ScanType,
        changed_enabled: bool,
        policy: DiscoveryPolicy,
        timestamp: u64,
    ) {
    }

    /// Return `true` to keep the device
    fn device_found(&self, device: &Arc<BtDevice>, timestamp: u64) -> bool {
        false
    }

    fn device_updated(&self, device: &Arc<BtDevice>, changed: EirDataType, timestamp: u64) {}

    fn device_connected(&self, device: &Arc<BtDevice>, handle: u16, timestamp: u64) {}

    fn device_pairing_state(
        &self,
        device: &Arc<BtDevice>,
        state: SmpPairingState,
        mode: PairingMode,
        timestamp: u64,
    ) {
    }

    fn device_ready(&self, device: &Arc<BtDevice>, timestamp: u64) {}

    fn device_disconnected(
        &self,
        device: &Arc<BtDevice>,
        reason: HciStatusCode,
        handle: u16,
        timestamp: u64,
    ) {
    }
}

/// Adapter hot-plug notifications from [`crate::BtManager`]
#[allow(unused_variables)]
pub trait ChangedAdapterSetListener: Send + Sync {
    fn adapter_added(&self, adapter: &Arc<BtAdapter>) {}

    fn adapter_removed(&self, adapter: &Arc<BtAdapter>) {}
}

pub type StatusListenerRef = Arc<dyn AdapterStatusListener>;
