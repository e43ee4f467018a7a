//! Adapter orchestrator
//!
//! One [`BtAdapter`] per local controller. It owns the device registries, the
//! discovery and advertising state, the listener list and, while powered, the
//! HCI handler plus the worker and service tasks that react to its events.

mod connect_lock;
mod discovery;
mod events;
mod registry;
pub(crate) mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rawbt_core::protocol::{AdvertisingParams, EInfoReport, EirDataType};
use rawbt_core::smp::SmpCrypto;
use rawbt_core::{
    monotonic_millis, AdapterSetting, BdAddressAndType, BdAddressType, BtMode, BtRole,
    HciStatusCode, HciWhitelistConnectType, StackConfig,
};
use rawbt_hci::{CallbackId, HciError, HciHandler, LocalInfo, MgmtEvent, MgmtEventKind};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

pub use connect_lock::ConnectWait;

pub(crate) use connect_lock::ConnectLock;
pub(crate) use registry::DeviceRegistry;

use self::discovery::{run_discovery_service, DiscoveryState};
use self::worker::{run_att_acceptor, run_worker, AdapterTasks, Job};
use crate::cow::CowList;
use crate::device::{BtDevice, DeviceState};
use crate::gatt::GattConnector;
use crate::listener::StatusListenerRef;
use crate::manager::StackContext;
use crate::smp::watchdog::run_pairing_watchdog;
use crate::smp::KeyStore;

// ----------------------------------------------------------------------------
// Adapter
// ----------------------------------------------------------------------------

pub struct BtAdapter {
    dev_id: u16,
    ctx: Arc<StackContext>,
    self_ref: Weak<BtAdapter>,
    hci: RwLock<Option<Arc<HciHandler>>>,
    local: RwLock<LocalInfo>,
    settings: Mutex<AdapterSetting>,
    role: Mutex<BtRole>,
    valid: AtomicBool,

    pub(crate) registry: DeviceRegistry,
    listeners: CowList<StatusListenerRef>,

    discovery: Mutex<DiscoveryState>,
    /// Devices holding native scanning paused
    pausing: CowList<BdAddressAndType>,
    /// Serialises scan enable/disable sequences
    discovery_op: tokio::sync::Mutex<()>,
    pub(crate) connect_lock: ConnectLock,

    whitelist: Mutex<Vec<(BdAddressAndType, HciWhitelistConnectType)>>,
    keystore: KeyStore,

    tasks: Mutex<Option<AdapterTasks>>,
    callbacks: Mutex<Vec<(MgmtEventKind, CallbackId)>>,
    /// Serialises power transitions
    power_op: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for BtAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtAdapter")
            .field("dev_id", &self.dev_id)
            .field("settings", &self.settings())
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl BtAdapter {
    pub(crate) fn new(dev_id: u16, ctx: Arc<StackContext>) -> Arc<Self> {
        let scan = ctx.config.discovery.scan.clone();
        let keystore = KeyStore::new(&ctx.config.keystore);
        Arc::new_cyclic(|self_ref| Self {
            dev_id,
            ctx,
            self_ref: self_ref.clone(),
            hci: RwLock::new(None),
            local: RwLock::new(LocalInfo::default()),
            settings: Mutex::new(AdapterSetting::empty()),
            role: Mutex::new(BtRole::None),
            valid: AtomicBool::new(true),
            registry: DeviceRegistry::new(),
            listeners: CowList::new(),
            discovery: Mutex::new(DiscoveryState::new(scan)),
            pausing: CowList::new(),
            discovery_op: tokio::sync::Mutex::new(()),
            connect_lock: ConnectLock::new(),
            whitelist: Mutex::new(Vec::new()),
            keystore,
            tasks: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
            power_op: tokio::sync::Mutex::new(()),
        })
    }

    // ------------------------------------------------------------------------
    // Power
    // ------------------------------------------------------------------------

    /// Open the controller, bring it up and start the adapter tasks
    pub async fn initialize(&self) -> HciStatusCode {
        let _op = self.power_op.lock().await;
        if !self.is_valid() {
            return HciStatusCode::CommandDisallowed;
        }
        if self.hci().is_some() {
            return HciStatusCode::Success;
        }
        let config = &self.ctx.config;
        let transport = match self.ctx.provider.open(self.dev_id, &config.hci) {
            Ok(transport) => transport,
            Err(e) => {
                warn!("hci{}: cannot open controller: {}", self.dev_id, e);
                return HciStatusCode::InternalFailure;
            }
        };
        let hci = match HciHandler::open(transport, config.hci.clone()) {
            Ok(hci) => hci,
            Err(e) => {
                warn!("hci{}: cannot start HCI handler: {}", self.dev_id, e);
                return HciStatusCode::InternalFailure;
            }
        };

        // Subscribe before initialising so no event is missed
        let (jobs, rx) = mpsc::unbounded_channel();
        let mut ids = Vec::with_capacity(MgmtEventKind::COUNT);
        for kind in MgmtEventKind::ALL {
            let jobs = jobs.clone();
            let id = hci.add_mgmt_event_callback(
                kind,
                Arc::new(move |ev: &MgmtEvent| {
                    let _ = jobs.send(Job::Event(ev.clone()));
                }),
            );
            ids.push((kind, id));
        }

        let local = match hci.initialize().await {
            Ok(local) => local,
            Err(e) => {
                warn!("hci{}: controller initialisation failed: {}", self.dev_id, e);
                hci.clear_all_callbacks();
                hci.close().await;
                return match e {
                    HciError::InitFailed { status, .. } => status,
                    _ => HciStatusCode::InternalFailure,
                };
            }
        };
        let secure = local.secure_connections();
        info!(
            "hci{}: powered on as {} ({}), secure connections {}",
            self.dev_id, local.address, local.name, secure
        );
        *self.local.write() = local;
        *self.callbacks.lock() = ids;

        let (stop, stop_rx) = watch::channel(false);
        let mut tasks = AdapterTasks::new(jobs.clone(), stop);
        tasks.push(
            "worker",
            tokio::spawn(run_worker(self.self_ref.clone(), rx, stop_rx)),
        );
        tasks.push(
            "discovery service",
            tokio::spawn(run_discovery_service(
                jobs.clone(),
                config.discovery.service_interval,
                tasks.stop_signal(),
            )),
        );
        tasks.push(
            "pairing watchdog",
            tokio::spawn(run_pairing_watchdog(
                jobs.clone(),
                config.smp.watchdog_interval,
                tasks.stop_signal(),
            )),
        );
        tasks.push(
            "ATT acceptor",
            tokio::spawn(run_att_acceptor(
                hci.l2cap_listen(),
                jobs,
                config.hci.reader_poll_timeout,
                tasks.stop_signal(),
            )),
        );
        *self.tasks.lock() = Some(tasks);
        *self.hci.write() = Some(hci);

        let mut powered = AdapterSetting::POWERED
            | AdapterSetting::LE
            | AdapterSetting::BONDABLE
            | AdapterSetting::CONNECTABLE;
        if secure {
            powered |= AdapterSetting::SECURE_CONN;
        }
        let (old, new) = {
            let mut settings = self.settings.lock();
            let old = *settings;
            *settings = powered;
            (old, powered)
        };
        self.notify_settings(old, new, monotonic_millis());
        HciStatusCode::Success
    }

    pub async fn set_powered(&self, powered: bool) -> HciStatusCode {
        if powered {
            return self.initialize().await;
        }
        self.power_off(false).await;
        HciStatusCode::Success
    }

    /// Tear everything down, marking live links disconnected locally
    pub(crate) async fn power_off(&self, transport_lost: bool) {
        let _op = self.power_op.lock().await;
        let hci = self.hci.write().take();
        let tasks = self.tasks.lock().take();
        if hci.is_none() && tasks.is_none() {
            return;
        }
        info!("hci{}: powering off", self.dev_id);
        self.reset_discovery();
        self.connect_lock.clear();

        if let Some(hci) = hci {
            let ids = std::mem::take(&mut *self.callbacks.lock());
            for (kind, id) in ids {
                hci.remove_mgmt_event_callback(kind, id);
            }
            hci.close().await;
        }
        if let Some(tasks) = tasks {
            tasks
                .shutdown(self.dev_id, self.ctx.config.hci.shutdown_timeout)
                .await;
        }

        let reason = if transport_lost {
            HciStatusCode::InternalFailure
        } else {
            HciStatusCode::ConnectionTerminatedByLocalHost
        };
        let ts = monotonic_millis();
        for device in self.registry.shared_devices() {
            let id = device.address_and_type();
            if self.registry.remove_connected(&id) {
                let handle = device.notify_disconnected(ts);
                self.notify_device_disconnected(&device, reason, handle, ts);
            } else if device.state() == DeviceState::Connecting {
                device.notify_connect_failed();
            }
        }

        *self.role.lock() = BtRole::None;
        let old = std::mem::take(&mut *self.settings.lock());
        self.notify_settings(old, AdapterSetting::empty(), ts);
    }

    /// Power off and invalidate, the adapter is unusable afterwards
    pub async fn close(&self) {
        self.power_off(false).await;
        if self.valid.swap(false, Ordering::SeqCst) {
            self.listeners.clear();
            self.registry.clear_shared();
            self.whitelist.lock().clear();
            info!("hci{}: closed", self.dev_id);
        }
    }

    // ------------------------------------------------------------------------
    // Advertising
    // ------------------------------------------------------------------------

    /// Advertise `eir`, fields in `adv_mask` go into AD data and `scan_rsp_mask` into the scan response
    pub async fn start_advertising(
        &self,
        params: AdvertisingParams,
        eir: &EInfoReport,
        adv_mask: EirDataType,
        scan_rsp_mask: EirDataType,
    ) -> HciStatusCode {
        let hci = match self.powered_hci() {
            Some(hci) => hci,
            None => return HciStatusCode::CommandDisallowed,
        };
        if self.is_discovering() {
            debug!("hci{}: advertising refused while discovering", self.dev_id);
            return HciStatusCode::CommandDisallowed;
        }
        if let Err(status) = params.validate() {
            return status;
        }
        let adv = eir.write_ad_data(adv_mask);
        let scan_rsp = eir.write_ad_data(scan_rsp_mask);
        let status = hci.le_start_advertising(&params, &adv, &scan_rsp).await;
        if !status.is_success() {
            warn!("hci{}: start advertising failed: {}", self.dev_id, status);
            return status;
        }
        *self.role.lock() = BtRole::Slave;
        self.set_setting(AdapterSetting::ADVERTISING, true);
        info!("hci{}: advertising", self.dev_id);
        status
    }

    pub async fn stop_advertising(&self) -> HciStatusCode {
        let hci = match self.powered_hci() {
            Some(hci) => hci,
            None => return HciStatusCode::CommandDisallowed,
        };
        let status = hci.le_stop_advertising().await;
        if status.is_success() {
            self.set_setting(AdapterSetting::ADVERTISING, false);
        }
        status
    }

    pub fn is_advertising(&self) -> bool {
        self.settings().contains(AdapterSetting::ADVERTISING)
            || self.hci().map(|h| h.is_advertising()).unwrap_or(false)
    }

    fn set_setting(&self, bit: AdapterSetting, on: bool) {
        let (old, new) = {
            let mut settings = self.settings.lock();
            let old = *settings;
            settings.set(bit, on);
            (old, *settings)
        };
        self.notify_settings(old, new, monotonic_millis());
    }

    // ------------------------------------------------------------------------
    // Whitelist
    // ------------------------------------------------------------------------

    pub async fn add_device_to_whitelist(
        &self,
        id: BdAddressAndType,
        connect_type: HciWhitelistConnectType,
    ) -> HciStatusCode {
        let hci = match self.powered_hci() {
            Some(hci) => hci,
            None => return HciStatusCode::CommandDisallowed,
        };
        if let Some(entry) = self.whitelist.lock().iter_mut().find(|(e, _)| *e == id) {
            entry.1 = connect_type;
            return HciStatusCode::Success;
        }
        let status = hci.le_add_to_white_list(&id).await;
        if status.is_success() {
            self.whitelist.lock().push((id, connect_type));
            debug!("hci{}: whitelisted {} ({:?})", self.dev_id, id, connect_type);
        }
        status
    }

    pub async fn remove_device_from_whitelist(&self, id: &BdAddressAndType) -> HciStatusCode {
        let known = self.whitelist.lock().iter().any(|(e, _)| e == id);
        if !known {
            return HciStatusCode::UnknownConnectionIdentifier;
        }
        let hci = match self.powered_hci() {
            Some(hci) => hci,
            None => return HciStatusCode::CommandDisallowed,
        };
        let status = hci.le_del_from_white_list(id).await;
        if status.is_success() {
            self.whitelist.lock().retain(|(e, _)| e != id);
        }
        status
    }

    pub async fn remove_all_devices_from_whitelist(&self) -> HciStatusCode {
        let hci = match self.powered_hci() {
            Some(hci) => hci,
            None => return HciStatusCode::CommandDisallowed,
        };
        let status = hci.le_clear_white_list().await;
        if status.is_success() {
            self.whitelist.lock().clear();
        }
        status
    }

    pub fn whitelist(&self) -> Vec<(BdAddressAndType, HciWhitelistConnectType)> {
        self.whitelist.lock().clone()
    }

    pub(crate) fn whitelist_entry(&self, id: &BdAddressAndType) -> Option<HciWhitelistConnectType> {
        self.whitelist
            .lock()
            .iter()
            .find(|(e, _)| e == id)
            .map(|(_, t)| *t)
    }

    pub(crate) fn is_whitelisted(&self, id: &BdAddressAndType) -> bool {
        self.whitelist_entry(id).is_some()
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    /// Register a listener, replaying the current settings to it
    pub fn add_status_listener(&self, listener: StatusListenerRef) -> bool {
        if !self.listeners.push_unique(listener.clone(), |a, b| Arc::ptr_eq(a, b)) {
            return false;
        }
        let settings = self.settings();
        if !settings.is_empty() {
            listener.adapter_settings_changed(
                self,
                AdapterSetting::empty(),
                settings,
                settings,
                monotonic_millis(),
            );
        }
        true
    }

    pub fn remove_status_listener(&self, listener: &StatusListenerRef) -> bool {
        self.listeners
            .remove_first(|l| Arc::ptr_eq(l, listener))
            .is_some()
    }

    pub fn remove_all_status_listeners(&self) -> usize {
        self.listeners.clear()
    }

    pub fn status_listener_count(&self) -> usize {
        self.listeners.len()
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn dev_id(&self) -> u16 {
        self.dev_id
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub fn is_powered(&self) -> bool {
        self.is_valid()
            && self.hci().map(|h| h.is_open()).unwrap_or(false)
            && self.settings().contains(AdapterSetting::POWERED)
    }

    pub fn address_and_type(&self) -> BdAddressAndType {
        BdAddressAndType::new(self.local.read().address, BdAddressType::BdAddrLePublic)
    }

    pub fn name(&self) -> String {
        self.local.read().name.clone()
    }

    pub fn local_info(&self) -> LocalInfo {
        self.local.read().clone()
    }

    pub fn settings(&self) -> AdapterSetting {
        *self.settings.lock()
    }

    pub fn bt_mode(&self) -> BtMode {
        self.settings().bt_mode()
    }

    pub fn role(&self) -> BtRole {
        *self.role.lock()
    }

    pub fn discovered_devices(&self) -> Vec<Arc<BtDevice>> {
        self.registry.discovered_devices()
    }

    pub fn connected_devices(&self) -> Vec<Arc<BtDevice>> {
        self.registry.connected_devices()
    }

    pub fn shared_devices(&self) -> Vec<Arc<BtDevice>> {
        self.registry.shared_devices()
    }

    pub fn find_discovered_device(&self, id: &BdAddressAndType) -> Option<Arc<BtDevice>> {
        self.registry.find_discovered(id)
    }

    pub fn find_shared_device(&self, id: &BdAddressAndType) -> Option<Arc<BtDevice>> {
        self.registry.find_shared(id)
    }

    /// Known device for `id`, or a fresh one held in the shared set
    pub fn find_or_create_device(&self, id: BdAddressAndType) -> Arc<BtDevice> {
        if let Some(device) = self.registry.find_shared(&id) {
            return device;
        }
        let device = BtDevice::new(self.self_ref.clone(), id);
        if self.registry.add_shared(device.clone()) {
            device
        } else {
            self.registry.find_shared(&id).unwrap_or(device)
        }
    }

    /// Forget all discovered devices, which stay shared while otherwise in use
    pub fn remove_discovered_devices(&self) -> usize {
        self.registry.clear_discovered()
    }

    // ------------------------------------------------------------------------
    // Crate Internals
    // ------------------------------------------------------------------------

    pub(crate) fn arc(&self) -> Option<Arc<BtAdapter>> {
        self.self_ref.upgrade()
    }

    pub(crate) fn config(&self) -> &StackConfig {
        &self.ctx.config
    }

    pub(crate) fn gatt(&self) -> &Arc<dyn GattConnector> {
        &self.ctx.gatt
    }

    pub(crate) fn crypto(&self) -> Arc<dyn SmpCrypto> {
        self.ctx.crypto.clone()
    }

    pub(crate) fn keystore(&self) -> &KeyStore {
        &self.keystore
    }

    pub(crate) fn hci(&self) -> Option<Arc<HciHandler>> {
        self.hci.read().clone()
    }

    /// Handler of a powered adapter
    pub(crate) fn powered_hci(&self) -> Option<Arc<HciHandler>> {
        if !self.is_powered() {
            return None;
        }
        self.hci()
    }

    pub(crate) fn job_sender(&self) -> Option<mpsc::UnboundedSender<Job>> {
        self.tasks.lock().as_ref().map(|t| t.jobs.clone())
    }

    /// Route a refused LE Create Connection through the worker
    pub(crate) fn report_connect_failed(&self, id: BdAddressAndType, status: HciStatusCode) {
        let job = Job::ConnectFailed {
            id,
            status,
            timestamp: monotonic_millis(),
        };
        match self.job_sender() {
            Some(jobs) if jobs.send(job).is_ok() => {}
            _ => debug!("{}: connect failure {} after power-off", id, status),
        }
    }

    /// Drop a device from every registry, in order with the events before it
    pub(crate) async fn remove_device(&self, id: BdAddressAndType) {
        if let Some(jobs) = self.job_sender() {
            let (done, wait) = oneshot::channel();
            if jobs.send(Job::RemoveDevice { id, done }).is_ok() && wait.await.is_ok() {
                return;
            }
        }
        self.drop_device(&id).await;
    }
}
