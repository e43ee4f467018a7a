//! Remote device state machine
//!
//! A [`BtDevice`] is owned by its adapter's shared registry and only holds a
//! weak reference back to the adapter. Transitions are driven by the adapter
//! worker reacting to events; the public operations here only issue commands
//! and record intent.

mod pairing;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rawbt_core::protocol::{EInfoReport, EirDataType, LeConnParams};
use rawbt_core::smp::{
    BtSecurityLevel, PairingData, PairingMode, SmpIoCapability, SmpKeyBin, SmpPairingState,
};
use rawbt_core::{
    monotonic_millis, BdAddress, BdAddressAndType, BdAddressType, BtRole, HciStatusCode,
    LeFeatures,
};
use rawbt_hci::{L2capChannel, MgmtEventData, MgmtEventKind};
use tracing::{debug, info, warn};

use crate::adapter::{BtAdapter, ConnectWait};
use crate::gatt::{GattService, GattSession};
use crate::smp::{seed_pairing_data, SmpSession};

/// Own address type used for LE Create Connection
const OWN_ADDRESS_PUBLIC: u8 = 0x00;

// ----------------------------------------------------------------------------
// State
// ----------------------------------------------------------------------------

/// Lifecycle of one remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceState {
    #[default]
    Discovered,
    Connecting,
    Connected,
    Pairing,
    Paired,
    Ready,
    Disconnected,
}

impl DeviceState {
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Pairing | Self::Paired | Self::Ready
        )
    }
}

enum DisconnectStep {
    Nothing,
    CancelConnect,
    Terminate(u16),
}

/// Progress of automatic security negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AutoSecurity {
    pub io_cap: SmpIoCapability,
    pub tier: usize,
    /// A failed tier is being retried on a fresh connection
    pub retrying: bool,
}

pub(crate) struct DeviceInner {
    pub state: DeviceState,
    pub ts_creation: u64,
    pub ts_last_discovery: u64,
    pub ts_last_update: u64,
    pub eir: EInfoReport,
    pub le_features: LeFeatures,

    pub handle: u16,
    /// Remote role on the link
    pub role: BtRole,
    pub conn_interval: u16,
    pub conn_latency: u16,
    pub supervision_timeout: u16,

    pub pairing: PairingData,
    pub smp: Option<SmpSession>,
    /// LE Enable Encryption issued with stored keys
    pub reencrypting: bool,
    pub gatt: Option<GattSession>,
    pub att: Option<L2capChannel>,

    pub disconnect_requested: bool,
    pub ready_scheduled: bool,
    pub auto_security: Option<AutoSecurity>,
    pub removed: bool,
}

impl DeviceInner {
    fn new(now: u64) -> Self {
        Self {
            state: DeviceState::Discovered,
            ts_creation: now,
            ts_last_discovery: now,
            ts_last_update: now,
            eir: EInfoReport::default(),
            le_features: LeFeatures::empty(),
            handle: 0,
            role: BtRole::None,
            conn_interval: 0,
            conn_latency: 0,
            supervision_timeout: 0,
            pairing: PairingData::default(),
            smp: None,
            reencrypting: false,
            gatt: None,
            att: None,
            disconnect_requested: false,
            ready_scheduled: false,
            auto_security: None,
            removed: false,
        }
    }

    fn auto_retrying(&self) -> bool {
        self.auto_security.map(|a| a.retrying).unwrap_or(false)
    }
}

// ----------------------------------------------------------------------------
// Device
// ----------------------------------------------------------------------------

pub struct BtDevice {
    adapter: Weak<BtAdapter>,
    id: BdAddressAndType,
    pub(crate) inner: Mutex<DeviceInner>,
}

impl std::fmt::Debug for BtDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BtDevice")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("handle", &inner.handle)
            .finish()
    }
}

impl BtDevice {
    pub(crate) fn new(adapter: Weak<BtAdapter>, id: BdAddressAndType) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            id,
            inner: Mutex::new(DeviceInner::new(monotonic_millis())),
        })
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn address_and_type(&self) -> BdAddressAndType {
        self.id
    }

    pub fn address(&self) -> BdAddress {
        self.id.address
    }

    pub fn address_type(&self) -> BdAddressType {
        self.id.address_type
    }

    /// `None` once the adapter is gone
    pub fn adapter(&self) -> Option<Arc<BtAdapter>> {
        self.adapter.upgrade()
    }

    pub fn state(&self) -> DeviceState {
        self.inner.lock().state
    }

    /// Non-zero exactly while connected
    pub fn connection_handle(&self) -> u16 {
        self.inner.lock().handle
    }

    pub fn is_connected(&self) -> bool {
        self.connection_handle() != 0
    }

    /// Remote role on the current link
    pub fn role(&self) -> BtRole {
        self.inner.lock().role
    }

    /// Complete name if advertised, otherwise the shortened one
    pub fn name(&self) -> String {
        let inner = self.inner.lock();
        inner
            .eir
            .name
            .clone()
            .or_else(|| inner.eir.name_short.clone())
            .unwrap_or_default()
    }

    pub fn rssi(&self) -> i8 {
        self.inner.lock().eir.rssi
    }

    pub fn tx_power(&self) -> Option<i8> {
        self.inner.lock().eir.tx_power
    }

    /// Accumulated advertising data
    pub fn eir(&self) -> EInfoReport {
        self.inner.lock().eir.clone()
    }

    pub fn le_features(&self) -> LeFeatures {
        self.inner.lock().le_features
    }

    /// Interval, latency and supervision timeout of the current link
    pub fn connection_parameters(&self) -> (u16, u16, u16) {
        let inner = self.inner.lock();
        (inner.conn_interval, inner.conn_latency, inner.supervision_timeout)
    }

    pub fn creation_timestamp(&self) -> u64 {
        self.inner.lock().ts_creation
    }

    pub fn last_discovery_timestamp(&self) -> u64 {
        self.inner.lock().ts_last_discovery
    }

    pub fn last_update_timestamp(&self) -> u64 {
        self.inner.lock().ts_last_update
    }

    pub fn pairing_state(&self) -> SmpPairingState {
        self.inner.lock().pairing.state
    }

    pub fn pairing_mode(&self) -> PairingMode {
        self.inner.lock().pairing.mode
    }

    pub fn conn_security_level(&self) -> BtSecurityLevel {
        self.inner.lock().pairing.sec_level_conn
    }

    pub fn conn_io_capability(&self) -> SmpIoCapability {
        self.inner.lock().pairing.io_cap_conn
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.lock().pairing.encrypted
    }

    /// Snapshot of the security state and key material
    pub fn pairing_data(&self) -> PairingData {
        self.inner.lock().pairing.clone()
    }

    pub fn gatt_session(&self) -> Option<GattSession> {
        self.inner.lock().gatt.clone()
    }

    /// Services reported by the GATT collaborator, empty before ready
    pub fn gatt_services(&self) -> Vec<GattService> {
        match self.adapter() {
            Some(adapter) => adapter.gatt().gatt_services(self),
            None => Vec::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Security Request
    // ------------------------------------------------------------------------

    /// Security for the next connection, refused while connecting or connected
    pub fn set_conn_security(&self, level: BtSecurityLevel, io_cap: SmpIoCapability) -> bool {
        let mut inner = self.inner.lock();
        if inner.handle != 0 || inner.state == DeviceState::Connecting {
            return false;
        }
        inner.pairing.sec_level_user = level;
        inner.pairing.io_cap_user = io_cap;
        inner.auto_security = None;
        true
    }

    /// Negotiate from the strongest configured tier down on the next connection
    pub fn set_conn_security_auto(&self, io_cap: SmpIoCapability) -> bool {
        let adapter = match self.adapter() {
            Some(adapter) => adapter,
            None => return false,
        };
        let first = match adapter.config().smp.security_auto_tiers.first() {
            Some(tier) => *tier,
            None => return false,
        };
        let mut inner = self.inner.lock();
        if inner.handle != 0 || inner.state == DeviceState::Connecting {
            return false;
        }
        inner.pairing.sec_level_user = first.level;
        inner.pairing.io_cap_user = first.io_cap.unwrap_or(io_cap);
        inner.auto_security = Some(AutoSecurity {
            io_cap,
            tier: 0,
            retrying: false,
        });
        true
    }

    pub fn is_conn_security_auto_enabled(&self) -> bool {
        self.inner.lock().auto_security.is_some()
    }

    // ------------------------------------------------------------------------
    // Key Bins
    // ------------------------------------------------------------------------

    /// Key bin of the current pairing state, check [`SmpKeyBin::is_valid`]
    pub fn create_key_bin(&self) -> SmpKeyBin {
        SmpKeyBin::create(self.id, &self.inner.lock().pairing)
    }

    /// Pre-seed keys so the next connection re-encrypts instead of pairing
    pub fn apply_key_bin(&self, bin: &SmpKeyBin) -> HciStatusCode {
        if bin.addr != self.id || !bin.is_valid() {
            return HciStatusCode::InvalidHciCommandParameters;
        }
        let mut inner = self.inner.lock();
        if inner.handle != 0 || inner.state == DeviceState::Connecting {
            return HciStatusCode::ConnectionAlreadyExists;
        }
        seed_pairing_data(bin, &mut inner.pairing);
        inner.auto_security = None;
        debug!("{}: applied stored keys", self.id);
        HciStatusCode::Success
    }

    /// Load stored keys when nothing is held yet
    fn seed_stored_keys(&self, adapter: &BtAdapter) {
        if !adapter.keystore().is_enabled() {
            return;
        }
        {
            let inner = self.inner.lock();
            if inner.pairing.encryption_ltk().is_some() || inner.auto_security.is_some() {
                return;
            }
        }
        if let Some(bin) = adapter.keystore().load(&self.id) {
            if bin.is_valid() {
                seed_pairing_data(&bin, &mut self.inner.lock().pairing);
                debug!("{}: using stored keys", self.id);
            } else {
                warn!("{}: stored keys invalid, removing", self.id);
                adapter.keystore().remove(&self.id);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Connect with the configured parameters, blocking on a busy connect slot
    pub async fn connect_le(self: &Arc<Self>) -> HciStatusCode {
        self.connect_le_with(None, ConnectWait::Block).await
    }

    pub async fn connect_le_with(
        self: &Arc<Self>,
        params: Option<LeConnParams>,
        wait: ConnectWait,
    ) -> HciStatusCode {
        let adapter = match self.adapter() {
            Some(adapter) => adapter,
            None => return HciStatusCode::InternalFailure,
        };
        if self.inner.lock().removed {
            return HciStatusCode::CommandDisallowed;
        }
        let hci = match adapter.powered_hci() {
            Some(hci) => hci,
            None => return HciStatusCode::CommandDisallowed,
        };
        if !self.id.is_le() {
            return HciStatusCode::UnsupportedFeatureOrParamValue;
        }
        let params = params.unwrap_or_else(|| adapter.config().connection.le.clone());
        if let Err(status) = params.validate() {
            return status;
        }

        // Claim the attempt before the first await, a second caller sees Connecting
        let previous = {
            let mut inner = self.inner.lock();
            if inner.handle != 0 || inner.state == DeviceState::Connecting {
                return HciStatusCode::ConnectionAlreadyExists;
            }
            let previous = inner.state;
            inner.state = DeviceState::Connecting;
            inner.disconnect_requested = false;
            previous
        };
        self.seed_stored_keys(&adapter);

        let wait = match wait {
            ConnectWait::Block => Some(adapter.config().connection.connect_lock_timeout),
            ConnectWait::FailFast => None,
        };
        if !adapter.connect_lock.acquire(&self.id, wait).await {
            self.abandon_connect(previous);
            return HciStatusCode::ControllerBusy;
        }
        if self.inner.lock().state != DeviceState::Connecting {
            // Cancelled or powered off while waiting for the slot
            adapter.connect_lock.release(&self.id);
            return HciStatusCode::UnknownConnectionIdentifier;
        }
        adapter.pause_discovery_for_connect().await;

        adapter.registry.add_shared(self.clone());
        info!("{}: connecting", self.id);
        let status = hci
            .le_create_conn(&self.id, OWN_ADDRESS_PUBLIC, &params, false)
            .await;
        if !status.is_success() {
            warn!("{}: LE Create Connection rejected: {}", self.id, status);
            adapter.connect_lock.release(&self.id);
            self.inner.lock().state = DeviceState::Disconnected;
            adapter.report_connect_failed(self.id, status);
        }
        status
    }

    /// Undo the Connecting claim of an attempt that never reached the controller
    fn abandon_connect(&self, previous: DeviceState) {
        let mut inner = self.inner.lock();
        if inner.state == DeviceState::Connecting && inner.handle == 0 {
            inner.state = previous;
        }
    }

    /// Terminate the link, a no-op returning success when not connected
    pub async fn disconnect(&self, reason: HciStatusCode) -> HciStatusCode {
        let adapter = match self.adapter() {
            Some(adapter) => adapter,
            None => return HciStatusCode::Success,
        };
        let hci = match adapter.hci() {
            Some(hci) => hci,
            None => return HciStatusCode::Success,
        };
        let step = {
            let mut inner = self.inner.lock();
            if inner.handle == 0 {
                if inner.state == DeviceState::Connecting {
                    DisconnectStep::CancelConnect
                } else {
                    DisconnectStep::Nothing
                }
            } else if inner.disconnect_requested {
                DisconnectStep::Nothing
            } else {
                inner.disconnect_requested = true;
                if let Some(att) = inner.att.as_ref() {
                    att.interrupt();
                }
                DisconnectStep::Terminate(inner.handle)
            }
        };
        let handle = match step {
            DisconnectStep::Nothing => return HciStatusCode::Success,
            DisconnectStep::CancelConnect => {
                debug!("{}: cancelling pending connection", self.id);
                return hci.le_create_conn_cancel().await;
            }
            DisconnectStep::Terminate(handle) => handle,
        };
        info!("{}: disconnecting 0x{:04x} ({})", self.id, handle, reason);
        let status = hci.disconnect(handle, reason).await;
        match status {
            HciStatusCode::Success => status,
            HciStatusCode::UnknownConnectionIdentifier => {
                // The controller already dropped the link
                hci.inject_event(MgmtEventData::DeviceDisconnected {
                    peer: Some(self.id),
                    handle,
                    reason: HciStatusCode::ConnectionTerminatedByLocalHost,
                });
                HciStatusCode::Success
            }
            other => {
                warn!("{}: disconnect failed: {}", self.id, other);
                self.inner.lock().disconnect_requested = false;
                other
            }
        }
    }

    /// Disconnect if needed and drop the device from every adapter registry, once
    pub async fn remove(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.removed {
                return;
            }
            inner.removed = true;
        }
        let adapter = match self.adapter() {
            Some(adapter) => adapter,
            None => return,
        };
        let handle = self.connection_handle();
        match adapter.hci() {
            Some(hci) if handle != 0 => {
                let waiter = hci.event_waiter(MgmtEventKind::DeviceDisconnected, move |ev| {
                    matches!(ev.data, MgmtEventData::DeviceDisconnected { handle: h, .. } if h == handle)
                });
                let status = self
                    .disconnect(HciStatusCode::RemoteUserTerminatedConnection)
                    .await;
                if status.is_success() {
                    let timeout = hci.config().command_status_timeout;
                    if hci.wait_for(waiter, timeout).await.is_none() {
                        warn!("{}: no disconnect event within {:?}", self.id, timeout);
                    }
                } else {
                    hci.cancel_waiter(waiter);
                }
            }
            Some(_) if self.state() == DeviceState::Connecting => {
                self.disconnect(HciStatusCode::RemoteUserTerminatedConnection)
                    .await;
            }
            _ => {}
        }
        adapter.remove_device(self.id).await;
        debug!("{}: removed", self.id);
    }

    /// Forget all keys, locally and in the key store, disconnecting first
    pub async fn unpair(&self) -> HciStatusCode {
        let status = self
            .disconnect(HciStatusCode::RemoteUserTerminatedConnection)
            .await;
        {
            let mut inner = self.inner.lock();
            inner.pairing.clear_keys();
            inner.pairing.reset_transient();
            inner.smp = None;
        }
        if let Some(adapter) = self.adapter() {
            adapter.keystore().remove(&self.id);
        }
        info!("{}: unpaired", self.id);
        status
    }

    // ------------------------------------------------------------------------
    // Event Driven Transitions
    // ------------------------------------------------------------------------

    /// Merge an advertising report, returning the changed fields
    pub(crate) fn update_from_eir(&self, eir: &EInfoReport, timestamp: u64) -> EirDataType {
        let mut inner = self.inner.lock();
        let changed = inner.eir.merge(eir);
        inner.ts_last_discovery = timestamp;
        if !changed.is_empty() {
            inner.ts_last_update = timestamp;
        }
        changed
    }

    pub(crate) fn set_le_features(&self, features: LeFeatures, timestamp: u64) {
        let mut inner = self.inner.lock();
        inner.le_features = features;
        inner.ts_last_update = timestamp;
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn notify_connected(
        &self,
        handle: u16,
        local_role: BtRole,
        interval: u16,
        latency: u16,
        supervision_timeout: u16,
        att: Option<L2capChannel>,
        default_io_cap: SmpIoCapability,
        timestamp: u64,
    ) {
        let mut inner = self.inner.lock();
        inner.state = DeviceState::Connected;
        inner.handle = handle;
        inner.role = local_role.opposite();
        inner.conn_interval = interval;
        inner.conn_latency = latency;
        inner.supervision_timeout = supervision_timeout;
        inner.att = att;
        inner.gatt = None;
        inner.smp = None;
        inner.reencrypting = false;
        inner.disconnect_requested = false;
        inner.ready_scheduled = false;
        inner.ts_last_update = timestamp;

        let pd = &mut inner.pairing;
        pd.reset_transient();
        pd.sec_level_conn = match pd.sec_level_user {
            BtSecurityLevel::Unset => BtSecurityLevel::None,
            level => level,
        };
        pd.io_cap_conn = match pd.io_cap_user {
            SmpIoCapability::Unset => default_io_cap,
            cap => cap,
        };
        debug!("{}: connected as 0x{:04x}", self.id, handle);
    }

    /// Tear down link state, returning the handle the link had
    pub(crate) fn notify_disconnected(&self, timestamp: u64) -> u16 {
        let mut inner = self.inner.lock();
        let handle = inner.handle;
        inner.state = DeviceState::Disconnected;
        inner.handle = 0;
        inner.smp = None;
        inner.reencrypting = false;
        inner.gatt = None;
        inner.disconnect_requested = false;
        inner.ready_scheduled = false;
        if let Some(att) = inner.att.take() {
            att.close();
        }
        inner.pairing.reset_transient();
        inner.ts_last_update = timestamp;
        debug!("{}: disconnected from 0x{:04x}", self.id, handle);
        handle
    }

    pub(crate) fn notify_connect_failed(&self) {
        let mut inner = self.inner.lock();
        if inner.handle == 0 {
            inner.state = DeviceState::Disconnected;
        }
    }

    /// Mark ready scheduling once per connection
    pub(crate) fn claim_ready(&self) -> Option<Option<L2capChannel>> {
        let mut inner = self.inner.lock();
        if inner.handle == 0 || inner.ready_scheduled {
            return None;
        }
        inner.ready_scheduled = true;
        Some(inner.att.clone())
    }

    /// ATT channel accepted in the peripheral role
    pub(crate) fn attach_att(&self, channel: L2capChannel) -> bool {
        let mut inner = self.inner.lock();
        if inner.handle != channel.handle() || inner.att.is_some() {
            return false;
        }
        inner.att = Some(channel);
        true
    }

    pub(crate) fn notify_ready(&self, session: GattSession, timestamp: u64) {
        let mut inner = self.inner.lock();
        inner.gatt = Some(session);
        inner.state = DeviceState::Ready;
        inner.ts_last_update = timestamp;
    }

    pub(crate) fn auto_retrying(&self) -> bool {
        self.inner.lock().auto_retrying()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rawbt_core::smp::{LtkProperties, SmpKeyType, SmpLongTermKey};

    fn device() -> Arc<BtDevice> {
        BtDevice::new(
            Weak::new(),
            BdAddressAndType::new(BdAddress::new([9; 6]), BdAddressType::BdAddrLePublic),
        )
    }

    fn bin_for(dev: &BtDevice) -> SmpKeyBin {
        let pd = PairingData {
            state: SmpPairingState::Completed,
            sec_level_conn: BtSecurityLevel::EncOnly,
            io_cap_conn: SmpIoCapability::NoInputNoOutput,
            keys_resp_has: SmpKeyType::ENC_KEY,
            ltk_resp: SmpLongTermKey {
                properties: LtkProperties::RESPONDER,
                enc_size: 16,
                ediv: 1,
                rand: 2,
                ltk: [3; 16],
            },
            ..PairingData::default()
        };
        SmpKeyBin::create(dev.address_and_type(), &pd)
    }

    #[test]
    fn connect_and_disconnect_track_handle() {
        let dev = device();
        dev.notify_connected(
            0x40,
            BtRole::Master,
            24,
            0,
            500,
            None,
            SmpIoCapability::NoInputNoOutput,
            1,
        );
        assert_eq!(dev.connection_handle(), 0x40);
        assert_eq!(dev.role(), BtRole::Slave);
        assert_eq!(dev.state(), DeviceState::Connected);
        assert_eq!(dev.conn_security_level(), BtSecurityLevel::None);

        assert_eq!(dev.notify_disconnected(2), 0x40);
        assert_eq!(dev.connection_handle(), 0);
        assert_eq!(dev.state(), DeviceState::Disconnected);
    }

    #[test]
    fn security_request_refused_while_connected() {
        let dev = device();
        assert!(dev.set_conn_security(BtSecurityLevel::EncAuth, SmpIoCapability::DisplayYesNo));
        dev.notify_connected(1, BtRole::Master, 0, 0, 0, None, SmpIoCapability::Unset, 1);
        assert_eq!(dev.conn_security_level(), BtSecurityLevel::EncAuth);
        assert_eq!(dev.conn_io_capability(), SmpIoCapability::DisplayYesNo);
        assert!(!dev.set_conn_security(BtSecurityLevel::None, SmpIoCapability::Unset));
    }

    #[test]
    fn key_bin_applies_only_while_disconnected() {
        let dev = device();
        let bin = bin_for(&dev);
        assert!(bin.is_valid());
        assert_eq!(dev.apply_key_bin(&bin), HciStatusCode::Success);
        assert_eq!(dev.pairing_mode(), PairingMode::PrePaired);
        assert_eq!(dev.pairing_data().sec_level_user, BtSecurityLevel::EncOnly);

        dev.notify_connected(1, BtRole::Master, 0, 0, 0, None, SmpIoCapability::Unset, 1);
        assert_eq!(
            dev.apply_key_bin(&bin),
            HciStatusCode::ConnectionAlreadyExists
        );
    }

    #[test]
    fn foreign_key_bin_is_rejected() {
        let dev = device();
        let other = BtDevice::new(
            Weak::new(),
            BdAddressAndType::new(BdAddress::new([1; 6]), BdAddressType::BdAddrLePublic),
        );
        assert_eq!(
            dev.apply_key_bin(&bin_for(&other)),
            HciStatusCode::InvalidHciCommandParameters
        );
    }

    #[test]
    fn ready_is_claimed_once_per_connection() {
        let dev = device();
        assert!(dev.claim_ready().is_none());
        dev.notify_connected(1, BtRole::Master, 0, 0, 0, None, SmpIoCapability::Unset, 1);
        assert!(dev.claim_ready().is_some());
        assert!(dev.claim_ready().is_none());
        dev.notify_disconnected(2);
        dev.notify_connected(2, BtRole::Master, 0, 0, 0, None, SmpIoCapability::Unset, 3);
        assert!(dev.claim_ready().is_some());
    }
}
