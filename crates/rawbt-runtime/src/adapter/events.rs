//! Management event handlers
//!
//! Each handler does the registry bookkeeping for its event, hands the event
//! to the device it concerns and then fans the outcome out to listeners. All
//! of them run on the adapter worker.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use rawbt_core::protocol::{EInfoReport, EirDataType};
use rawbt_core::smp::{PairingMode, SmpPairingState};
use rawbt_core::{
    AdapterSetting, BdAddressAndType, BdAddressType, BtRole, DiscoveryPolicy, HciStatusCode,
    HciWhitelistConnectType, ScanType,
};
use rawbt_hci::{L2capChannel, MgmtEvent, MgmtEventData};
use tracing::{debug, error, info, warn};

use super::discovery::PauseRelease;
use super::worker::Job;
use super::{BtAdapter, ConnectWait};
use crate::device::{BtDevice, DeviceState};
use crate::gatt::{GattError, GattSession};
use crate::listener::AdapterStatusListener;

// ----------------------------------------------------------------------------
// Listener Fan-out
// ----------------------------------------------------------------------------

impl BtAdapter {
    fn each_listener<F>(&self, what: &str, f: F)
    where
        F: Fn(&dyn AdapterStatusListener),
    {
        for listener in self.listeners.snapshot().iter() {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                error!("hci{}: listener panicked in {}", self.dev_id(), what);
            }
        }
    }

    /// Fan out to listeners whose device filter matches
    fn each_device_listener<F>(&self, device: &BtDevice, what: &str, f: F)
    where
        F: Fn(&dyn AdapterStatusListener),
    {
        self.each_listener(what, |l| {
            if l.match_device(device) {
                f(l)
            }
        })
    }

    pub(crate) fn notify_settings(&self, old: AdapterSetting, new: AdapterSetting, timestamp: u64) {
        let changed = old ^ new;
        if changed.is_empty() {
            return;
        }
        debug!("hci{}: settings {:?} -> {:?}", self.dev_id(), old, new);
        self.each_listener("adapter_settings_changed", |l| {
            l.adapter_settings_changed(self, old, new, changed, timestamp)
        });
    }

    pub(crate) fn notify_discovering(
        &self,
        meta: ScanType,
        changed_type: ScanType,
        enabled: bool,
        policy: DiscoveryPolicy,
        timestamp: u64,
    ) {
        self.each_listener("discovering_changed", |l| {
            l.discovering_changed(self, meta, changed_type, enabled, policy, timestamp)
        });
    }

    pub(crate) fn notify_device_disconnected(
        &self,
        device: &Arc<BtDevice>,
        reason: HciStatusCode,
        handle: u16,
        timestamp: u64,
    ) {
        self.each_device_listener(device, "device_disconnected", |l| {
            l.device_disconnected(device, reason, handle, timestamp)
        });
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    pub(crate) async fn handle_event(&self, event: MgmtEvent) {
        let ts = event.timestamp;
        match event.data {
            MgmtEventData::DeviceFound(report) => self.on_device_found(*report, ts).await,
            MgmtEventData::DeviceConnected {
                peer,
                handle,
                role,
                interval,
                latency,
                supervision_timeout,
            } => {
                self.on_device_connected(peer, handle, role, interval, latency, supervision_timeout, ts)
                    .await
            }
            MgmtEventData::ConnectFailed { peer, status } => {
                self.on_connect_failed(peer, status, ts).await
            }
            MgmtEventData::DeviceDisconnected {
                peer,
                handle,
                reason,
            } => self.on_device_disconnected(peer, handle, reason, ts).await,
            MgmtEventData::Discovering { scan_type, enabled } => {
                self.on_native_discovering(scan_type, enabled).await
            }
            MgmtEventData::Advertising { enabled } => self.on_advertising(enabled, ts),
            MgmtEventData::EncryptionChanged {
                handle,
                status,
                enabled,
            } => self.on_encryption(handle, status, enabled).await,
            MgmtEventData::EncryptionKeyRefresh { handle, status } => {
                self.on_encryption(handle, status, status.is_success()).await
            }
            MgmtEventData::LeRemoteFeatures {
                handle,
                status,
                features,
            } => {
                let device = match self.registry.find_connected_by_handle(handle) {
                    Some(device) => device,
                    None => return,
                };
                if !status.is_success() {
                    debug!("{}: remote features unavailable: {}", device.address_and_type(), status);
                    return;
                }
                device.set_le_features(features, ts);
                self.each_device_listener(&device, "device_updated", |l| {
                    l.device_updated(&device, EirDataType::empty(), ts)
                });
            }
            MgmtEventData::LeLtkRequest { handle, rand, ediv } => {
                let hci = match self.hci() {
                    Some(hci) => hci,
                    None => return,
                };
                match self.registry.find_connected_by_handle(handle) {
                    Some(device) => device.on_ltk_request(&hci, rand, ediv).await,
                    None => {
                        let _ = hci.le_ltk_neg_reply(handle).await;
                    }
                }
            }
            MgmtEventData::LocalP256PublicKey { status, .. } => {
                debug!("hci{}: local P-256 key event ({})", self.dev_id(), status)
            }
            MgmtEventData::DhKeyGenerated { status, dhkey } => {
                let hci = match self.hci() {
                    Some(hci) => hci,
                    None => return,
                };
                let waiting = self
                    .registry
                    .connected_devices()
                    .into_iter()
                    .find(|d| d.awaits_dhkey());
                match waiting {
                    Some(device) => device.on_dhkey(self, &hci, status, dhkey).await,
                    None => debug!("hci{}: DHKey without a waiting pairing", self.dev_id()),
                }
            }
            MgmtEventData::NewLongTermKey { peer, ltk } => {
                if let Some(device) = self.registry.find_shared(&peer) {
                    device.store_long_term_key(ltk);
                    debug!("{}: new long term key", peer);
                }
            }
            MgmtEventData::SmpMessage { handle, pdu } => {
                let hci = match self.hci() {
                    Some(hci) => hci,
                    None => return,
                };
                match self.registry.find_connected_by_handle(handle) {
                    Some(device) => device.on_smp_pdu(self, &hci, pdu).await,
                    None => debug!("hci{}: SMP for unknown handle 0x{:04x}", self.dev_id(), handle),
                }
            }
            MgmtEventData::HardwareError { code } => {
                error!("hci{}: controller hardware error 0x{:02x}", self.dev_id(), code)
            }
            MgmtEventData::TransportClosed { reason } => {
                error!("hci{}: transport lost: {}", self.dev_id(), reason);
                if let Some(adapter) = self.arc() {
                    tokio::spawn(async move {
                        adapter.power_off(true).await;
                    });
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Discovery Reports
    // ------------------------------------------------------------------------

    async fn on_device_found(&self, report: EInfoReport, ts: u64) {
        let id = BdAddressAndType::new(
            report.address,
            report.address_type.unwrap_or(BdAddressType::BdAddrLePublic),
        );

        if let Some(device) = self.registry.find_discovered(&id) {
            let changed = device.update_from_eir(&report, ts);
            if !changed.is_empty() {
                self.each_device_listener(&device, "device_updated", |l| {
                    l.device_updated(&device, changed, ts)
                });
            }
            self.whitelist_auto_connect(&device);
            return;
        }

        if let Some(device) = self.registry.find_shared(&id) {
            device.update_from_eir(&report, ts);
            self.registry.add_discovered(&id);
            self.device_found(&device, ts);
            self.whitelist_auto_connect(&device);
            return;
        }

        let device = BtDevice::new(self.self_ref.clone(), id);
        device.update_from_eir(&report, ts);
        self.registry.add_shared(device.clone());
        self.registry.add_discovered(&id);
        if !self.device_found(&device, ts) {
            debug!("{}: not wanted by any listener", id);
            if !self.is_whitelisted(&id) {
                self.registry.remove_shared(&id);
                return;
            }
        }
        self.whitelist_auto_connect(&device);
    }

    /// Ask every matching listener, keeping the device if any wants it
    fn device_found(&self, device: &Arc<BtDevice>, ts: u64) -> bool {
        let mut keep = false;
        for listener in self.listeners.snapshot().iter() {
            if !listener.match_device(device) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| listener.device_found(device, ts))) {
                Ok(wanted) => keep |= wanted,
                Err(_) => error!("hci{}: listener panicked in device_found", self.dev_id()),
            }
        }
        keep
    }

    fn whitelist_auto_connect(&self, device: &Arc<BtDevice>) {
        let id = device.address_and_type();
        let auto = match self.whitelist_entry(&id) {
            Some(HciWhitelistConnectType::AutoConnectAlways) => true,
            Some(HciWhitelistConnectType::AutoConnectDirect) => self.is_discovering(),
            _ => false,
        };
        let idle = matches!(device.state(), DeviceState::Discovered | DeviceState::Disconnected);
        if !auto || !idle || self.connect_lock.is_locked() {
            return;
        }
        info!("{}: whitelisted, connecting", id);
        let device = device.clone();
        tokio::spawn(async move {
            let status = device.connect_le_with(None, ConnectWait::FailFast).await;
            if !status.is_success() {
                debug!("{}: auto-connect not issued: {}", device.address_and_type(), status);
            }
        });
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn on_device_connected(
        &self,
        peer: BdAddressAndType,
        handle: u16,
        role: BtRole,
        interval: u16,
        latency: u16,
        supervision_timeout: u16,
        ts: u64,
    ) {
        let hci = match self.hci() {
            Some(hci) => hci,
            None => return,
        };
        let device = match self.registry.find_shared(&peer) {
            Some(device) => device,
            None => {
                let device = BtDevice::new(self.self_ref.clone(), peer);
                self.registry.add_shared(device.clone());
                device
            }
        };
        // Peripheral ATT channels arrive through the accept task
        let att = match role {
            BtRole::Slave => None,
            _ => hci.att_channel(handle),
        };
        device.notify_connected(
            handle,
            role,
            interval,
            latency,
            supervision_timeout,
            att,
            self.config().smp.default_io_capability,
            ts,
        );
        self.registry.add_connected(&peer);
        self.discovery_on_connected(&peer);
        self.connect_lock.release(&peer);
        info!("{}: connected 0x{:04x} as {:?}", peer, handle, role);

        let suppressed = {
            let mut inner = device.inner.lock();
            match inner.auto_security.as_mut() {
                Some(auto) if auto.retrying => {
                    auto.retrying = false;
                    true
                }
                _ => false,
            }
        };
        if !suppressed {
            self.each_device_listener(&device, "device_connected", |l| {
                l.device_connected(&device, handle, ts)
            });
        }
        self.resume_discovery().await;

        let status = hci.le_read_remote_features(handle).await;
        if !status.is_success() {
            debug!("{}: LE Read Remote Features: {}", peer, status);
        }

        if role == BtRole::Master && device.start_security(self, &hci).await {
            return;
        }
        self.schedule_ready(&device);
    }

    pub(crate) async fn on_connect_failed(
        &self,
        id: BdAddressAndType,
        status: HciStatusCode,
        ts: u64,
    ) {
        self.connect_lock.release(&id);
        let device = match self.registry.find_shared(&id) {
            Some(device) => device,
            None => {
                debug!("{}: connect failed for unknown device: {}", id, status);
                self.resume_discovery().await;
                return;
            }
        };
        warn!("{}: connect failed: {}", id, status);
        device.notify_connect_failed();
        {
            let mut inner = device.inner.lock();
            if inner.auto_security.map(|a| a.retrying).unwrap_or(false) {
                inner.auto_security = None;
            }
        }
        self.notify_device_disconnected(&device, status, 0, ts);
        self.resume_discovery().await;
    }

    async fn on_device_disconnected(
        &self,
        peer: Option<BdAddressAndType>,
        handle: u16,
        reason: HciStatusCode,
        ts: u64,
    ) {
        let device = peer
            .and_then(|id| self.registry.find_shared(&id))
            .filter(|d| d.connection_handle() == handle)
            .or_else(|| self.registry.find_connected_by_handle(handle));
        let device = match device {
            Some(device) => device,
            None => {
                debug!("hci{}: disconnect of untracked handle 0x{:04x}", self.dev_id(), handle);
                if let Some(id) = peer {
                    self.connect_lock.release(&id);
                }
                return;
            }
        };
        let id = device.address_and_type();
        self.connect_lock.release(&id);

        let mode = device.pairing_mode();
        let old_handle = device.notify_disconnected(ts);
        self.registry.remove_connected(&id);
        self.remove_from_pausing(&id);
        info!("{}: disconnected 0x{:04x} ({})", id, old_handle, reason);

        let key_rejected = matches!(
            reason,
            HciStatusCode::AuthenticationFailure
                | HciStatusCode::PinOrKeyMissing
                | HciStatusCode::ConnectionTerminatedMicFailure
        );
        if mode == PairingMode::PrePaired && key_rejected {
            warn!("{}: stored keys rejected by peer ({}), removing", id, reason);
            device.inner.lock().pairing.clear_keys();
            self.keystore().remove(&id);
        }

        if device.auto_retrying() {
            debug!("{}: reconnecting for the next security tier", id);
            let device = device.clone();
            tokio::spawn(async move {
                let status = device.connect_le_with(None, ConnectWait::Block).await;
                if !status.is_success() {
                    warn!("{}: security tier reconnect failed: {}", device.address_and_type(), status);
                }
            });
        } else {
            self.notify_device_disconnected(&device, reason, old_handle, ts);
        }
        self.resume_discovery().await;
    }

    async fn on_encryption(&self, handle: u16, status: HciStatusCode, enabled: bool) {
        let hci = match self.hci() {
            Some(hci) => hci,
            None => return,
        };
        match self.registry.find_connected_by_handle(handle) {
            Some(device) => device.on_encryption_changed(self, &hci, status, enabled).await,
            None => debug!("hci{}: encryption event for unknown handle 0x{:04x}", self.dev_id(), handle),
        }
    }

    fn on_advertising(&self, enabled: bool, ts: u64) {
        let (old, new) = {
            let mut settings = self.settings.lock();
            let old = *settings;
            settings.set(AdapterSetting::ADVERTISING, enabled);
            (old, *settings)
        };
        if old != new {
            info!("hci{}: advertising {}", self.dev_id(), if enabled { "on" } else { "off" });
        }
        self.notify_settings(old, new, ts);
    }

    /// ATT channel of a peripheral-role connection
    pub(crate) fn on_att_accepted(&self, channel: L2capChannel) {
        let handle = channel.handle();
        match self.registry.find_connected_by_handle(handle) {
            Some(device) if device.attach_att(channel) => {
                debug!("{}: ATT channel accepted", device.address_and_type())
            }
            _ => debug!("hci{}: ATT channel for 0x{:04x} not attached", self.dev_id(), handle),
        }
    }

    // ------------------------------------------------------------------------
    // Pairing and Readiness
    // ------------------------------------------------------------------------

    /// Pairing state reported by a device's security manager
    pub(crate) async fn on_pairing_state(
        &self,
        device: &Arc<BtDevice>,
        state: SmpPairingState,
        mode: PairingMode,
        ts: u64,
    ) {
        let id = device.address_and_type();
        debug!("{}: pairing {:?} ({:?})", id, state, mode);
        {
            let mut inner = device.inner.lock();
            if state.is_in_progress() {
                inner.state = DeviceState::Pairing;
            } else if state == SmpPairingState::Completed {
                inner.state = DeviceState::Paired;
            }
        }

        match state {
            SmpPairingState::Completed => {
                if mode != PairingMode::PrePaired && self.keystore().store(&id, &device.pairing_data()) {
                    debug!("{}: keys stored", id);
                }
                device.inner.lock().auto_security = None;
                self.notify_pairing_state(device, state, mode, ts);
                self.unpause_discovery(&id, PauseRelease::Paired).await;
                self.schedule_ready(device);
            }
            SmpPairingState::Failed => {
                if self.advance_security_tier(device) {
                    info!("{}: pairing failed, retrying with the next security tier", id);
                    let device = device.clone();
                    tokio::spawn(async move {
                        device
                            .disconnect(HciStatusCode::RemoteUserTerminatedConnection)
                            .await;
                    });
                    return;
                }
                warn!("{}: pairing failed", id);
                self.notify_pairing_state(device, state, mode, ts);
            }
            _ => self.notify_pairing_state(device, state, mode, ts),
        }
    }

    /// Step auto security to its next tier, `false` when none is left
    fn advance_security_tier(&self, device: &BtDevice) -> bool {
        let tiers = &self.config().smp.security_auto_tiers;
        let mut inner = device.inner.lock();
        let mut auto = match inner.auto_security {
            Some(auto) => auto,
            None => return false,
        };
        let next = auto.tier + 1;
        let tier = match tiers.get(next) {
            Some(tier) => *tier,
            None => {
                inner.auto_security = None;
                return false;
            }
        };
        auto.tier = next;
        auto.retrying = true;
        inner.pairing.sec_level_user = tier.level;
        inner.pairing.io_cap_user = tier.io_cap.unwrap_or(auto.io_cap);
        inner.auto_security = Some(auto);
        debug!(
            "{}: security tier {} ({:?}, {:?})",
            device.address_and_type(),
            next,
            tier.level,
            inner.pairing.io_cap_user
        );
        true
    }

    fn notify_pairing_state(
        &self,
        device: &Arc<BtDevice>,
        state: SmpPairingState,
        mode: PairingMode,
        ts: u64,
    ) {
        self.each_device_listener(device, "device_pairing_state", |l| {
            l.device_pairing_state(device, state, mode, ts)
        });
    }

    /// Run GATT setup off the worker, once per connection
    pub(crate) fn schedule_ready(&self, device: &Arc<BtDevice>) {
        let att = match device.claim_ready() {
            Some(att) => att,
            None => return,
        };
        let jobs = match self.job_sender() {
            Some(jobs) => jobs,
            None => return,
        };
        let gatt = self.gatt().clone();
        let device = device.clone();
        let id = device.address_and_type();
        let handle = device.connection_handle();
        tokio::spawn(async move {
            // Only a central runs the GATT client
            let result = if device.role() == BtRole::Slave {
                gatt.connect_gatt(&device, att).await
            } else {
                Ok(GattSession::default())
            };
            let _ = jobs.send(Job::DeviceReady { id, handle, result });
        });
    }

    pub(crate) async fn on_device_ready(
        &self,
        id: BdAddressAndType,
        handle: u16,
        result: Result<GattSession, GattError>,
    ) {
        let device = match self.registry.find_shared(&id) {
            Some(device) if device.connection_handle() == handle => device,
            _ => {
                debug!("{}: link 0x{:04x} gone before ready", id, handle);
                return;
            }
        };
        let session = match result {
            Ok(session) => session,
            Err(e) => {
                warn!("{}: GATT setup failed: {}", id, e);
                tokio::spawn(async move {
                    device
                        .disconnect(HciStatusCode::RemoteUserTerminatedConnection)
                        .await;
                });
                return;
            }
        };
        let ts = rawbt_core::monotonic_millis();
        device.notify_ready(session, ts);
        info!("{}: ready", id);
        self.unpause_discovery(&id, PauseRelease::Ready).await;

        // device_ready may block, keep it off the worker
        let listeners = self.listeners.snapshot();
        let dev_id = self.dev_id();
        tokio::task::spawn_blocking(move || {
            for listener in listeners.iter() {
                if !listener.match_device(&device) {
                    continue;
                }
                if catch_unwind(AssertUnwindSafe(|| listener.device_ready(&device, ts))).is_err() {
                    error!("hci{}: listener panicked in device_ready", dev_id);
                }
            }
        });
    }

    /// Final step of [`BtDevice::remove`]
    pub(crate) async fn drop_device(&self, id: &BdAddressAndType) {
        if let Some(device) = self.registry.remove_shared(id) {
            // The disconnect event never came, the link is forgotten locally
            if device.connection_handle() != 0 {
                let handle = device.notify_disconnected(rawbt_core::monotonic_millis());
                debug!("{}: dropped with live handle 0x{:04x}", id, handle);
            } else if device.state() == DeviceState::Connecting {
                device.notify_connect_failed();
            }
        }
        self.connect_lock.release(id);
        if self.remove_from_pausing(id) {
            self.resume_discovery().await;
        }
    }
}
