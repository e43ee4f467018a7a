//! Shared fixtures: a recording listener, a steerable GATT stub and a powered stack

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rawbt_core::protocol::{EirDataType, ScanParams};
use rawbt_core::smp::{PairingMode, SmpPairingState};
use rawbt_core::{
    AdapterSetting, BdAddress, BdAddressAndType, BdAddressType, DiscoveryConfig, DiscoveryPolicy,
    HciConfig, HciStatusCode, ScanType, SmpConfig, StackConfig,
};
use rawbt_harness::{FakeSmpCrypto, MockController, MockControllerConfig, MockControllers};
use rawbt_hci::L2capChannel;
use rawbt_runtime::{
    AdapterStatusListener, BtAdapter, BtDevice, BtManager, GattConnector, GattError, GattSession,
};
use tokio::sync::watch;

pub const WAIT: Duration = Duration::from_secs(3);

// ----------------------------------------------------------------------------
// Recording Listener
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ev {
    Settings(AdapterSetting),
    Discovering { meta: ScanType, enabled: bool },
    Found(BdAddressAndType),
    Updated(BdAddressAndType),
    Connected(BdAddressAndType, u16),
    Pairing(BdAddressAndType, SmpPairingState, PairingMode),
    Ready(BdAddressAndType),
    Disconnected(BdAddressAndType, HciStatusCode, u16),
}

#[derive(Debug)]
pub struct RecordingListener {
    events: Mutex<Vec<Ev>>,
    keep_devices: AtomicBool,
    only: Mutex<Option<BdAddressAndType>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            keep_devices: AtomicBool::new(true),
            only: Mutex::new(None),
        })
    }

    /// Only hear about `id`
    pub fn for_device(id: BdAddressAndType) -> Arc<Self> {
        let listener = Self::new();
        *listener.only.lock() = Some(id);
        listener
    }

    pub fn set_keep_devices(&self, keep: bool) {
        self.keep_devices.store(keep, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Ev> {
        self.events.lock().clone()
    }

    pub fn count<F: Fn(&Ev) -> bool>(&self, f: F) -> usize {
        self.events.lock().iter().filter(|e| f(e)).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub async fn wait_for<F: Fn(&Ev) -> bool>(&self, f: F) -> bool {
        eventually(|| self.count(&f) > 0).await
    }

    fn push(&self, ev: Ev) {
        self.events.lock().push(ev);
    }
}

impl AdapterStatusListener for RecordingListener {
    fn match_device(&self, device: &BtDevice) -> bool {
        match *self.only.lock() {
            Some(id) => device.address_and_type() == id,
            None => true,
        }
    }

    fn adapter_settings_changed(
        &self,
        _adapter: &BtAdapter,
        _old: AdapterSetting,
        new: AdapterSetting,
        _changed: AdapterSetting,
        _timestamp: u64,
    ) {
        self.push(Ev::Settings(new));
    }

    fn discovering_changed(
        &self,
        _adapter: &BtAdapter,
        meta: ScanType,
        _changed_type: ScanType,
        enabled: bool,
        _policy: DiscoveryPolicy,
        _timestamp: u64,
    ) {
        self.push(Ev::Discovering { meta, enabled });
    }

    fn device_found(&self, device: &Arc<BtDevice>, _timestamp: u64) -> bool {
        self.push(Ev::Found(device.address_and_type()));
        self.keep_devices.load(Ordering::SeqCst)
    }

    fn device_updated(&self, device: &Arc<BtDevice>, _changed: EirDataType, _timestamp: u64) {
        self.push(Ev::Updated(device.address_and_type()));
    }

    fn device_connected(&self, device: &Arc<BtDevice>, handle: u16, _timestamp: u64) {
        self.push(Ev::Connected(device.address_and_type(), handle));
    }

    fn device_pairing_state(
        &self,
        device: &Arc<BtDevice>,
        state: SmpPairingState,
        mode: PairingMode,
        _timestamp: u64,
    ) {
        self.push(Ev::Pairing(device.address_and_type(), state, mode));
    }

    fn device_ready(&self, device: &Arc<BtDevice>, _timestamp: u64) {
        self.push(Ev::Ready(device.address_and_type()));
    }

    fn device_disconnected(
        &self,
        device: &Arc<BtDevice>,
        reason: HciStatusCode,
        handle: u16,
        _timestamp: u64,
    ) {
        self.push(Ev::Disconnected(device.address_and_type(), reason, handle));
    }
}

// ----------------------------------------------------------------------------
// GATT Stub
// ----------------------------------------------------------------------------

/// GATT connector that can be held open and made to fail
#[derive(Debug)]
pub struct StubGatt {
    calls: AtomicUsize,
    fail: AtomicBool,
    gate: watch::Sender<bool>,
}

impl StubGatt {
    pub fn open() -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            gate,
        })
    }

    /// Setup blocks until [`StubGatt::release`]
    pub fn gated() -> Arc<Self> {
        let gatt = Self::open();
        gatt.gate.send_replace(false);
        gatt
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GattConnector for StubGatt {
    async fn connect_gatt(
        &self,
        _device: &Arc<BtDevice>,
        _att: Option<L2capChannel>,
    ) -> Result<GattSession, GattError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(GattError::Setup("stub refused".into()));
        }
        Ok(GattSession {
            mtu: 185,
            services: Vec::new(),
        })
    }
}

// ----------------------------------------------------------------------------
// Stack Setup
// ----------------------------------------------------------------------------

pub fn fast_config() -> StackConfig {
    StackConfig::new()
        .with_hci(
            HciConfig::default()
                .with_reader_poll_timeout(Duration::from_millis(20))
                .with_command_timeouts(Duration::from_millis(500), Duration::from_millis(500)),
        )
        .with_discovery(DiscoveryConfig {
            scan: ScanParams::default(),
            service_interval: Duration::from_millis(50),
            max_retries: 3,
        })
        .with_smp(SmpConfig::default().with_watchdog_interval(Duration::from_millis(50)))
}

pub fn peer(n: u8) -> BdAddressAndType {
    BdAddressAndType::new(
        BdAddress::new([n, 0x11, 0x22, 0x33, 0x44, 0xC5]),
        BdAddressType::BdAddrLePublic,
    )
}

/// Flags plus a complete local name
pub fn ad_named(name: &str) -> Vec<u8> {
    let mut ad = vec![0x02, 0x01, 0x06, (name.len() + 1) as u8, 0x09];
    ad.extend_from_slice(name.as_bytes());
    ad
}

pub struct Stack {
    pub provider: Arc<MockControllers>,
    pub manager: Arc<BtManager>,
    pub adapter: Arc<BtAdapter>,
    pub ctrl: Arc<MockController>,
    pub listener: Arc<RecordingListener>,
    pub gatt: Arc<StubGatt>,
}

impl Stack {
    pub async fn shutdown(self) {
        self.manager.shutdown().await;
    }
}

pub async fn stack(config: StackConfig, ctrl_config: MockControllerConfig, gatt: Arc<StubGatt>) -> Stack {
    rawbt_harness::init_tracing();
    let provider = MockControllers::new();
    let ctrl = MockController::new(ctrl_config);
    provider.insert(ctrl.clone());
    let manager = BtManager::open(
        provider.clone(),
        config,
        Arc::new(FakeSmpCrypto),
        gatt.clone(),
    )
    .expect("open manager");
    let adapter = manager.adapter(ctrl.config().dev_id).expect("adapter");
    let listener = RecordingListener::new();
    adapter.add_status_listener(listener.clone());
    assert_eq!(adapter.initialize().await, HciStatusCode::Success);
    Stack {
        provider,
        manager,
        adapter,
        ctrl,
        listener,
        gatt,
    }
}

pub async fn powered() -> Stack {
    stack(fast_config(), MockControllerConfig::default(), StubGatt::open()).await
}

/// Advertise `id` and wait for the adapter to report it
pub async fn discover(s: &Stack, id: BdAddressAndType, name: &str) -> Arc<BtDevice> {
    s.ctrl.advertise(&id, &ad_named(name), -40);
    assert!(s.listener.wait_for(|e| *e == Ev::Found(id)).await, "{} not found", id);
    s.adapter.find_discovered_device(&id).expect("discovered device")
}

/// Poll `f` until it holds or [`WAIT`] passes
pub async fn eventually<F: Fn() -> bool>(f: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if f() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn within<T, F: Future<Output = T>>(f: F) -> T {
    tokio::time::timeout(WAIT, f).await.expect("finished in time")
}
