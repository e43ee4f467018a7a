//! HCI command/event engine
//!
//! One [`HciHandler`] owns one controller transport. A dedicated reader thread
//! pulls raw packets into a bounded ring and a drain task decodes them in
//! arrival order. Command Complete and Command Status events resolve the single
//! in-flight command; everything else is translated into [`MgmtEvent`]s and
//! fanned out to the callback list of its kind.
//!
//! Callbacks run on the drain task and must not block. Callers that want to
//! react with further commands hand the work to their own task, so the engine
//! never needs reentrant command issuance.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle as ThreadHandle;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rawbt_core::protocol::commands::{self, LocalVersion};
use rawbt_core::protocol::l2cap::DEFAULT_LE_ACL_MTU;
use rawbt_core::protocol::opcodes::{cmd, DEFAULT_EVENT_MASK, DEFAULT_LE_EVENT_MASK};
use rawbt_core::protocol::{
    AclPacket, AdvertisingParams, HciCommand, HciEvent, HciEventData, HciPacket, L2capFrame,
    LeConnParams, ScanParams,
};
use rawbt_core::smp::{SmpLongTermKey, SmpPdu};
use rawbt_core::{
    monotonic_millis, BdAddress, BdAddressAndType, BdAddressType, BtRole, HciConfig,
    HciStatusCode, LeFeatures, ScanType, TransportError,
};
use smallvec::SmallVec;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::error::{HciError, HciResult};
use crate::l2cap::{AclSink, L2capChannel, L2capMux, L2capServer, Routed};
use crate::mgmt_event::{MgmtEvent, MgmtEventData, MgmtEventKind};
use crate::socket::{HciTransport, HCI_MAX_FRAME_SIZE};

// ----------------------------------------------------------------------------
// Public Types
// ----------------------------------------------------------------------------

pub type MgmtEventCallback = Arc<dyn Fn(&MgmtEvent) + Send + Sync>;

/// Registration token returned by [`HciHandler::add_mgmt_event_callback`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Outcome of one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciCommandReply {
    pub opcode: u16,
    pub status: HciStatusCode,
    /// Command Complete return parameters, status byte included
    pub return_params: Vec<u8>,
}

impl HciCommandReply {
    fn internal(opcode: u16, status: HciStatusCode) -> Self {
        Self {
            opcode,
            status,
            return_params: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Controller properties read during [`HciHandler::initialize`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInfo {
    pub address: BdAddress,
    pub version: LocalVersion,
    pub name: String,
    pub le_features: LeFeatures,
    pub acl_mtu: usize,
    pub acl_packets: u8,
    /// Local P-256 public key, present when LE Secure Connections are usable
    pub p256_public_key: Option<Box<[u8; 64]>>,
}

impl Default for LocalInfo {
    fn default() -> Self {
        Self {
            address: BdAddress::ANY,
            version: LocalVersion::default(),
            name: String::new(),
            le_features: LeFeatures::empty(),
            acl_mtu: DEFAULT_LE_ACL_MTU,
            acl_packets: 0,
            p256_public_key: None,
        }
    }
}

impl LocalInfo {
    pub fn secure_connections(&self) -> bool {
        self.p256_public_key.is_some()
    }
}

/// One-shot subscription created before the command whose event it awaits
///
/// The callback it registers is removed when the waiter is dropped, whether
/// or not the event arrived.
pub struct EventWaiter {
    kind: MgmtEventKind,
    id: CallbackId,
    rx: oneshot::Receiver<MgmtEvent>,
    table: Weak<CallbackTable>,
}

impl Drop for EventWaiter {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            remove_callback(&table, self.kind, self.id);
        }
    }
}

// ----------------------------------------------------------------------------
// Internal Types
// ----------------------------------------------------------------------------

#[derive(Clone)]
struct CallbackEntry {
    id: CallbackId,
    callback: MgmtEventCallback,
}

/// Copy-on-write callback list, dispatch iterates a snapshot
type CallbackList = RwLock<Arc<Vec<CallbackEntry>>>;

/// One callback list per event kind
type CallbackTable = Vec<CallbackList>;

fn remove_callback(table: &CallbackTable, kind: MgmtEventKind, id: CallbackId) -> bool {
    let mut list = table[kind.index()].write();
    if !list.iter().any(|e| e.id == id) {
        return false;
    }
    let next: Vec<CallbackEntry> = list.iter().filter(|e| e.id != id).cloned().collect();
    *list = Arc::new(next);
    true
}

struct PendingCommand {
    opcode: u16,
    first_param: Option<u8>,
    drained: usize,
    reply: oneshot::Sender<HciCommandReply>,
}

enum ReaderItem {
    Packet(Vec<u8>),
    Closed(String),
}

/// Commands answered by Command Status rather than Command Complete
fn replies_with_status(opcode: u16) -> bool {
    matches!(
        opcode,
        cmd::CREATE_CONN
            | cmd::DISCONNECT
            | cmd::LE_CREATE_CONN
            | cmd::LE_READ_REMOTE_FEATURES
            | cmd::LE_ENABLE_ENC
            | cmd::LE_READ_LOCAL_P256_PUBLIC_KEY
            | cmd::LE_GENERATE_DHKEY
    )
}

// ----------------------------------------------------------------------------
// HCI Handler
// ----------------------------------------------------------------------------

pub struct HciHandler {
    dev_id: u16,
    config: HciConfig,
    transport: Arc<dyn HciTransport>,
    open: AtomicBool,
    shall_stop: Arc<AtomicBool>,

    write_lock: Mutex<()>,
    command_lock: tokio::sync::Mutex<()>,
    pending: Mutex<Option<PendingCommand>>,

    callbacks: Arc<CallbackTable>,
    next_callback_id: AtomicU64,

    connections: DashMap<u16, BdAddressAndType>,
    l2cap: L2capMux,
    acl_mtu: AtomicUsize,
    advertising: AtomicBool,
    local: RwLock<LocalInfo>,

    reader: Mutex<Option<ThreadHandle<()>>>,
    drain: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for HciHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HciHandler")
            .field("dev_id", &self.dev_id)
            .field("open", &self.is_open())
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl HciHandler {
    /// Start the reader thread and drain task on the current tokio runtime
    pub fn open(transport: Arc<dyn HciTransport>, config: HciConfig) -> HciResult<Arc<Self>> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| HciError::NoRuntime)?;
        let dev_id = transport.dev_id();
        if !transport.is_open() {
            return Err(HciError::NotOpen { dev_id });
        }

        let handler = Arc::new(Self {
            dev_id,
            transport: transport.clone(),
            open: AtomicBool::new(true),
            shall_stop: Arc::new(AtomicBool::new(false)),
            write_lock: Mutex::new(()),
            command_lock: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
            callbacks: Arc::new(
                (0..MgmtEventKind::COUNT)
                    .map(|_| RwLock::new(Arc::new(Vec::new())))
                    .collect(),
            ),
            next_callback_id: AtomicU64::new(1),
            connections: DashMap::new(),
            l2cap: L2capMux::new(),
            acl_mtu: AtomicUsize::new(DEFAULT_LE_ACL_MTU),
            advertising: AtomicBool::new(false),
            local: RwLock::new(LocalInfo::default()),
            reader: Mutex::new(None),
            drain: Mutex::new(None),
            config,
        });

        let (tx, rx) = mpsc::channel(handler.config.ring_buffer_capacity.max(1));
        let stop = handler.shall_stop.clone();
        let poll = handler.config.reader_poll_timeout;
        let reader = std::thread::Builder::new()
            .name(format!("hci{}-reader", dev_id))
            .spawn(move || reader_loop(dev_id, transport, stop, poll, tx))
            .map_err(|e| HciError::Transport(TransportError::Io(e)))?;
        *handler.reader.lock() = Some(reader);

        let drain = runtime.spawn(drain_loop(Arc::downgrade(&handler), rx));
        *handler.drain.lock() = Some(drain);

        info!("hci{}: handler open", dev_id);
        Ok(handler)
    }

    pub fn dev_id(&self) -> u16 {
        self.dev_id
    }

    pub fn config(&self) -> &HciConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.transport.is_open()
    }

    pub fn local_info(&self) -> LocalInfo {
        self.local.read().clone()
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising.load(Ordering::SeqCst)
    }

    pub fn connection_peer(&self, handle: u16) -> Option<BdAddressAndType> {
        self.connections.get(&handle).map(|e| *e.value())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // ------------------------------------------------------------------------
    // Callback Registry
    // ------------------------------------------------------------------------

    pub fn add_mgmt_event_callback(
        &self,
        kind: MgmtEventKind,
        callback: MgmtEventCallback,
    ) -> CallbackId {
        let id = CallbackId(self.next_callback_id.fetch_add(1, Ordering::Relaxed));
        let mut list = self.callbacks[kind.index()].write();
        let mut next = Vec::with_capacity(list.len() + 1);
        next.extend(list.iter().cloned());
        next.push(CallbackEntry { id, callback });
        *list = Arc::new(next);
        id
    }

    /// `true` when the callback was registered
    pub fn remove_mgmt_event_callback(&self, kind: MgmtEventKind, id: CallbackId) -> bool {
        remove_callback(&self.callbacks, kind, id)
    }

    pub fn clear_all_callbacks(&self) {
        for list in self.callbacks.iter() {
            *list.write() = Arc::new(Vec::new());
        }
    }

    pub fn callback_count(&self, kind: MgmtEventKind) -> usize {
        self.callbacks[kind.index()].read().len()
    }

    fn dispatch(&self, event: MgmtEvent) {
        let snapshot = self.callbacks[event.kind().index()].read().clone();
        trace!(
            "hci{}: dispatch {:?} to {} callbacks",
            self.dev_id,
            event.kind(),
            snapshot.len()
        );
        for entry in snapshot.iter() {
            (entry.callback)(&event);
        }
    }

    /// Dispatch an event that did not originate from the controller
    pub fn inject_event(&self, data: MgmtEventData) {
        self.dispatch(MgmtEvent::new(self.dev_id, monotonic_millis(), data));
    }

    /// Subscribe to the next event of `kind` accepted by `filter`
    pub fn event_waiter<F>(&self, kind: MgmtEventKind, filter: F) -> EventWaiter
    where
        F: Fn(&MgmtEvent) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let id = self.add_mgmt_event_callback(
            kind,
            Arc::new(move |ev: &MgmtEvent| {
                if filter(ev) {
                    if let Some(tx) = slot.lock().take() {
                        let _ = tx.send(ev.clone());
                    }
                }
            }),
        );
        EventWaiter {
            kind,
            id,
            rx,
            table: Arc::downgrade(&self.callbacks),
        }
    }

    pub async fn wait_for(&self, mut waiter: EventWaiter, timeout: Duration) -> Option<MgmtEvent> {
        let result = tokio::time::timeout(timeout, &mut waiter.rx).await;
        drop(waiter);
        match result {
            Ok(Ok(event)) => Some(event),
            _ => None,
        }
    }

    pub fn cancel_waiter(&self, waiter: EventWaiter) {
        drop(waiter);
    }

    // ------------------------------------------------------------------------
    // Command Path
    // ------------------------------------------------------------------------

    fn write_raw(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let _guard = self.write_lock.lock();
        self.transport.write_packet(bytes)
    }

    /// Issue one command and wait for its Command Status or Command Complete
    ///
    /// Timeouts and exhausted reply budgets yield `InternalTimeout`, a closed
    /// engine `InternalFailure`. Neither affects later commands.
    pub async fn send_command(&self, command: HciCommand) -> HciCommandReply {
        let opcode = command.opcode;
        if !self.is_open() {
            return HciCommandReply::internal(opcode, HciStatusCode::InternalFailure);
        }
        let bytes = match command.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("hci{}: cannot encode {}: {}", self.dev_id, cmd::name(opcode), e);
                return HciCommandReply::internal(opcode, HciStatusCode::InvalidHciCommandParameters);
            }
        };

        let _serial = self.command_lock.lock().await;
        let (tx, rx) = oneshot::channel();
        *self.pending.lock() = Some(PendingCommand {
            opcode,
            first_param: command.params.first().copied(),
            drained: 0,
            reply: tx,
        });
        trace!("hci{}: -> {}", self.dev_id, cmd::name(opcode));

        if let Err(e) = self.write_raw(&bytes) {
            self.pending.lock().take();
            self.on_transport_failure(format!("write {} failed: {}", cmd::name(opcode), e));
            return HciCommandReply::internal(opcode, HciStatusCode::InternalFailure);
        }

        let timeout = if replies_with_status(opcode) {
            self.config.command_status_timeout
        } else {
            self.config.command_complete_timeout
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => {
                debug!(
                    "hci{}: {} -> {}",
                    self.dev_id,
                    cmd::name(opcode),
                    reply.status
                );
                reply
            }
            Ok(Err(_)) => HciCommandReply::internal(opcode, HciStatusCode::InternalFailure),
            Err(_) => {
                self.pending.lock().take();
                warn!(
                    "hci{}: {} timed out after {:?}",
                    self.dev_id,
                    cmd::name(opcode),
                    timeout
                );
                HciCommandReply::internal(opcode, HciStatusCode::InternalTimeout)
            }
        }
    }

    async fn send_status(&self, command: HciCommand) -> HciStatusCode {
        self.send_command(command).await.status
    }

    async fn expect_success(
        &self,
        step: &'static str,
        command: HciCommand,
    ) -> HciResult<Vec<u8>> {
        let reply = self.send_command(command).await;
        if reply.is_success() {
            Ok(reply.return_params)
        } else {
            Err(HciError::InitFailed {
                step,
                status: reply.status,
            })
        }
    }

    /// Resolve the pending command if `opcode` matches, returning its first parameter
    fn resolve_pending(
        &self,
        opcode: u16,
        status: HciStatusCode,
        return_params: Vec<u8>,
    ) -> Option<Option<u8>> {
        let mut pending = self.pending.lock();
        match pending.as_ref() {
            Some(p) if p.opcode == opcode => {}
            _ => return None,
        }
        let p = pending.take()?;
        let _ = p.reply.send(HciCommandReply {
            opcode,
            status,
            return_params,
        });
        Some(p.first_param)
    }

    /// Count an event that did not answer the pending command
    fn note_unrelated(&self) {
        let mut pending = self.pending.lock();
        let exhausted = match pending.as_mut() {
            Some(p) => {
                p.drained += 1;
                p.drained > self.config.max_reply_events
            }
            None => false,
        };
        if exhausted {
            if let Some(p) = pending.take() {
                warn!(
                    "hci{}: {} unanswered after {} events",
                    self.dev_id,
                    cmd::name(p.opcode),
                    self.config.max_reply_events
                );
                let _ = p
                    .reply
                    .send(HciCommandReply::internal(p.opcode, HciStatusCode::InternalTimeout));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Controller Operations
    // ------------------------------------------------------------------------

    /// Reset and configure the controller, reading its local properties
    pub async fn initialize(&self) -> HciResult<LocalInfo> {
        self.expect_success("reset", commands::reset()).await?;
        self.expect_success("set_event_mask", commands::set_event_mask(DEFAULT_EVENT_MASK))
            .await?;
        self.expect_success(
            "le_set_event_mask",
            commands::le_set_event_mask(DEFAULT_LE_EVENT_MASK),
        )
        .await?;

        let ret = self
            .expect_success("read_bd_addr", HciCommand::bare(cmd::READ_BD_ADDR))
            .await?;
        let address = commands::read_bd_addr_reply(&ret)?;
        let ret = self
            .expect_success("read_local_version", HciCommand::bare(cmd::READ_LOCAL_VERSION))
            .await?;
        let version = commands::read_local_version_reply(&ret)?;

        let reply = self.send_command(HciCommand::bare(cmd::READ_LOCAL_NAME)).await;
        let name = if reply.is_success() {
            commands::read_local_name_reply(&reply.return_params)?
        } else {
            String::new()
        };

        let ret = self
            .expect_success("le_read_buffer_size", HciCommand::bare(cmd::LE_READ_BUFFER_SIZE))
            .await?;
        let (mtu, acl_packets) = commands::le_read_buffer_size_reply(&ret)?;
        let acl_mtu = if mtu == 0 {
            DEFAULT_LE_ACL_MTU
        } else {
            mtu as usize
        };
        let ret = self
            .expect_success(
                "le_read_local_features",
                HciCommand::bare(cmd::LE_READ_LOCAL_FEATURES),
            )
            .await?;
        let le_features = LeFeatures::from_bits_truncate(commands::le_read_local_features_reply(&ret)?);

        let p256_public_key = self.read_local_p256_public_key().await;
        if p256_public_key.is_none() {
            info!("hci{}: LE Secure Connections unavailable", self.dev_id);
        }

        let info = LocalInfo {
            address,
            version,
            name,
            le_features,
            acl_mtu,
            acl_packets,
            p256_public_key,
        };
        self.acl_mtu.store(acl_mtu, Ordering::SeqCst);
        *self.local.write() = info.clone();
        info!(
            "hci{}: initialized {} (HCI v{}, ACL {}x{})",
            self.dev_id, info.address, info.version.hci_version, acl_mtu, acl_packets
        );
        Ok(info)
    }

    async fn read_local_p256_public_key(&self) -> Option<Box<[u8; 64]>> {
        let waiter = self.event_waiter(MgmtEventKind::LocalP256PublicKey, |_| true);
        let reply = self.send_command(commands::le_read_local_p256_public_key()).await;
        if !reply.is_success() {
            self.cancel_waiter(waiter);
            return None;
        }
        match self
            .wait_for(waiter, self.config.command_complete_timeout)
            .await
            .map(|ev| ev.data)
        {
            Some(MgmtEventData::LocalP256PublicKey { status, key }) if status.is_success() => {
                Some(key)
            }
            _ => None,
        }
    }

    pub async fn reset(&self) -> HciStatusCode {
        self.send_status(commands::reset()).await
    }

    pub async fn write_local_name(&self, name: &str) -> HciStatusCode {
        let status = self.send_status(commands::write_local_name(name)).await;
        if status.is_success() {
            self.local.write().name = name.to_string();
        }
        status
    }

    /// Program scan parameters and enable LE scanning
    pub async fn le_start_scan(&self, params: &ScanParams) -> HciStatusCode {
        let status = self.send_status(commands::le_set_scan_param(params)).await;
        if !status.is_success() {
            return status;
        }
        self.le_enable_scan(true, params.filter_duplicates).await
    }

    pub async fn le_enable_scan(&self, enable: bool, filter_duplicates: bool) -> HciStatusCode {
        self.send_status(commands::le_set_scan_enable(enable, filter_duplicates))
            .await
    }

    pub async fn le_start_advertising(
        &self,
        params: &AdvertisingParams,
        adv_data: &[u8],
        scan_rsp: &[u8],
    ) -> HciStatusCode {
        for command in [
            commands::le_set_adv_param(params),
            commands::le_set_adv_data(adv_data),
            commands::le_set_scan_rsp_data(scan_rsp),
            commands::le_set_adv_enable(true),
        ] {
            let status = self.send_status(command).await;
            if !status.is_success() {
                return status;
            }
        }
        HciStatusCode::Success
    }

    pub async fn le_stop_advertising(&self) -> HciStatusCode {
        self.send_status(commands::le_set_adv_enable(false)).await
    }

    pub async fn le_create_conn(
        &self,
        peer: &BdAddressAndType,
        own_address_type: u8,
        params: &LeConnParams,
        use_white_list: bool,
    ) -> HciStatusCode {
        self.send_status(commands::le_create_conn(
            peer,
            own_address_type,
            params,
            use_white_list,
        ))
        .await
    }

    pub async fn le_create_conn_cancel(&self) -> HciStatusCode {
        self.send_status(commands::le_create_conn_cancel()).await
    }

    pub async fn create_conn(&self, address: &BdAddress) -> HciStatusCode {
        self.send_status(commands::create_conn(address, true)).await
    }

    pub async fn disconnect(&self, handle: u16, reason: HciStatusCode) -> HciStatusCode {
        self.send_status(commands::disconnect(handle, reason)).await
    }

    pub async fn le_read_remote_features(&self, handle: u16) -> HciStatusCode {
        self.send_status(commands::le_read_remote_features(handle))
            .await
    }

    pub async fn le_enable_encryption(&self, handle: u16, ltk: &SmpLongTermKey) -> HciStatusCode {
        self.send_status(commands::le_enable_encryption(
            handle, ltk.rand, ltk.ediv, &ltk.ltk,
        ))
        .await
    }

    pub async fn le_ltk_reply(&self, handle: u16, ltk: &[u8; 16]) -> HciStatusCode {
        self.send_status(commands::le_ltk_reply(handle, ltk)).await
    }

    pub async fn le_ltk_neg_reply(&self, handle: u16) -> HciStatusCode {
        self.send_status(commands::le_ltk_neg_reply(handle)).await
    }

    /// Command Status only, the DHKey arrives as [`MgmtEventData::DhKeyGenerated`]
    pub async fn le_generate_dhkey(&self, remote_public_key: &[u8; 64]) -> HciStatusCode {
        self.send_status(commands::le_generate_dhkey(remote_public_key))
            .await
    }

    pub async fn le_clear_white_list(&self) -> HciStatusCode {
        self.send_status(commands::le_clear_white_list()).await
    }

    pub async fn le_add_to_white_list(&self, peer: &BdAddressAndType) -> HciStatusCode {
        self.send_status(commands::le_add_to_white_list(peer)).await
    }

    pub async fn le_del_from_white_list(&self, peer: &BdAddressAndType) -> HciStatusCode {
        self.send_status(commands::le_del_from_white_list(peer)).await
    }

    // ------------------------------------------------------------------------
    // L2CAP
    // ------------------------------------------------------------------------

    /// Send one SMP PDU on the connection's security manager channel
    pub fn send_smp(&self, handle: u16, pdu: &SmpPdu) -> Result<(), TransportError> {
        let cid = match self.connection_peer(handle) {
            Some(peer) if !peer.is_le() => rawbt_core::protocol::l2cap::cid::SMP_BREDR,
            _ => rawbt_core::protocol::l2cap::cid::SMP,
        };
        trace!("hci{}: SMP -> 0x{:04x} {:?}", self.dev_id, handle, pdu);
        self.send_frame(handle, &L2capFrame::new(cid, pdu.encode()))
    }

    pub fn att_channel(&self, handle: u16) -> Option<L2capChannel> {
        self.l2cap.att_channel(handle)
    }

    /// ATT channels of connections accepted in the peripheral role
    pub fn l2cap_listen(&self) -> L2capServer {
        self.l2cap.listen()
    }

    // ------------------------------------------------------------------------
    // Inbound Processing
    // ------------------------------------------------------------------------

    fn process_packet(self: &Arc<Self>, bytes: &[u8]) {
        match HciPacket::decode(bytes) {
            Ok(HciPacket::Event(event)) => self.process_event(&event),
            Ok(HciPacket::Acl(acl)) => self.process_acl(acl),
            Ok(HciPacket::Command(command)) => {
                trace!("hci{}: ignoring echoed {}", self.dev_id, cmd::name(command.opcode));
            }
            Err(e) => warn!("hci{}: dropping malformed packet: {}", self.dev_id, e),
        }
    }

    fn process_event(self: &Arc<Self>, event: &HciEvent) {
        let data = match HciEventData::decode(event) {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    "hci{}: dropping malformed event 0x{:02x}: {}",
                    self.dev_id, event.code, e
                );
                return;
            }
        };
        let timestamp = monotonic_millis();

        match data {
            HciEventData::CommandComplete {
                opcode,
                return_params,
                ..
            } => {
                let status = commands::reply_status(&return_params);
                match self.resolve_pending(opcode, status, return_params) {
                    Some(first_param) if status.is_success() => {
                        self.on_command_succeeded(opcode, first_param, timestamp)
                    }
                    Some(_) => {}
                    None => self.note_unrelated(),
                }
            }
            HciEventData::CommandStatus { status, opcode, .. } => {
                if self.resolve_pending(opcode, status, Vec::new()).is_none() {
                    self.note_unrelated();
                }
            }
            other => {
                self.note_unrelated();
                for data in self.translate(other) {
                    self.dispatch(MgmtEvent::new(self.dev_id, timestamp, data));
                }
            }
        }
    }

    /// State implied by a successful enable command
    fn on_command_succeeded(&self, opcode: u16, first_param: Option<u8>, timestamp: u64) {
        let enabled = first_param.unwrap_or(0) != 0;
        let data = match opcode {
            cmd::LE_SET_SCAN_ENABLE => MgmtEventData::Discovering {
                scan_type: ScanType::LE,
                enabled,
            },
            cmd::LE_SET_ADV_ENABLE => {
                self.advertising.store(enabled, Ordering::SeqCst);
                MgmtEventData::Advertising { enabled }
            }
            _ => return,
        };
        self.dispatch(MgmtEvent::new(self.dev_id, timestamp, data));
    }

    fn translate(self: &Arc<Self>, data: HciEventData) -> SmallVec<[MgmtEventData; 2]> {
        let mut out = SmallVec::new();
        match data {
            HciEventData::ConnectionComplete {
                status,
                handle,
                address,
                ..
            } => {
                let peer = BdAddressAndType::new(address, BdAddressType::BdAddrBredr);
                if status.is_success() {
                    self.on_connected(handle, peer, BtRole::Master);
                    out.push(MgmtEventData::DeviceConnected {
                        peer,
                        handle,
                        role: BtRole::Master,
                        interval: 0,
                        latency: 0,
                        supervision_timeout: 0,
                    });
                } else {
                    out.push(MgmtEventData::ConnectFailed { peer, status });
                }
            }
            HciEventData::LeConnectionComplete {
                status,
                handle,
                role,
                peer,
                interval,
                latency,
                supervision_timeout,
            } => {
                if status.is_success() {
                    self.on_connected(handle, peer, role);
                    if role == BtRole::Slave && self.advertising.swap(false, Ordering::SeqCst) {
                        out.push(MgmtEventData::Advertising { enabled: false });
                    }
                    out.push(MgmtEventData::DeviceConnected {
                        peer,
                        handle,
                        role,
                        interval,
                        latency,
                        supervision_timeout,
                    });
                } else {
                    out.push(MgmtEventData::ConnectFailed { peer, status });
                }
            }
            HciEventData::DisconnectionComplete {
                status,
                handle,
                reason,
            } => {
                if status.is_success() {
                    let peer = self.connections.remove(&handle).map(|(_, p)| p);
                    self.l2cap.close_connection(handle);
                    out.push(MgmtEventData::DeviceDisconnected {
                        peer,
                        handle,
                        reason,
                    });
                } else {
                    warn!(
                        "hci{}: disconnect of 0x{:04x} failed: {}",
                        self.dev_id, handle, status
                    );
                }
            }
            HciEventData::EncryptionChange {
                status,
                handle,
                enabled,
            } => out.push(MgmtEventData::EncryptionChanged {
                handle,
                status,
                enabled,
            }),
            HciEventData::EncryptionKeyRefresh { status, handle } => {
                out.push(MgmtEventData::EncryptionKeyRefresh { handle, status })
            }
            HciEventData::HardwareError { code } => {
                error!("hci{}: controller hardware error 0x{:02x}", self.dev_id, code);
                out.push(MgmtEventData::HardwareError { code });
            }
            HciEventData::LeAdvertisingReport(reports) => {
                for report in reports {
                    out.push(MgmtEventData::DeviceFound(Box::new(report)));
                }
            }
            HciEventData::LeRemoteFeatures {
                status,
                handle,
                features,
            } => out.push(MgmtEventData::LeRemoteFeatures {
                handle,
                status,
                features: LeFeatures::from_bits_truncate(features),
            }),
            HciEventData::LeLtkRequest { handle, rand, ediv } => {
                out.push(MgmtEventData::LeLtkRequest { handle, rand, ediv })
            }
            HciEventData::LeReadLocalP256PublicKey { status, key } => {
                out.push(MgmtEventData::LocalP256PublicKey {
                    status,
                    key: Box::new(key),
                })
            }
            HciEventData::LeGenerateDhKey { status, dhkey } => {
                out.push(MgmtEventData::DhKeyGenerated { status, dhkey })
            }
            HciEventData::NumberOfCompletedPackets { entries } => {
                trace!("hci{}: completed packets {:?}", self.dev_id, entries);
            }
            HciEventData::Unhandled { code, subevent } => {
                trace!(
                    "hci{}: unhandled event 0x{:02x} {:?}",
                    self.dev_id,
                    code,
                    subevent
                );
            }
            HciEventData::CommandComplete { .. } | HciEventData::CommandStatus { .. } => {}
        }
        out
    }

    fn on_connected(self: &Arc<Self>, handle: u16, peer: BdAddressAndType, role: BtRole) {
        self.connections.insert(handle, peer);
        let sink: Weak<dyn AclSink> = Arc::downgrade(self) as Weak<dyn AclSink>;
        self.l2cap.open_att(handle, sink, role == BtRole::Slave);
        debug!(
            "hci{}: connected {} handle 0x{:04x} as {:?}",
            self.dev_id, peer, handle, role
        );
    }

    fn process_acl(&self, acl: AclPacket) {
        match self.l2cap.push_acl(acl) {
            Ok(Routed::Smp { handle, payload }) => match SmpPdu::decode(&payload) {
                Ok(pdu) => self.dispatch(MgmtEvent::new(
                    self.dev_id,
                    monotonic_millis(),
                    MgmtEventData::SmpMessage { handle, pdu },
                )),
                Err(e) => warn!(
                    "hci{}: dropping malformed SMP PDU on 0x{:04x}: {}",
                    self.dev_id, handle, e
                ),
            },
            Ok(_) => {}
            Err(e) => warn!("hci{}: dropping ACL fragment: {}", self.dev_id, e),
        }
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    fn fail_pending(&self, status: HciStatusCode) {
        if let Some(p) = self.pending.lock().take() {
            let _ = p.reply.send(HciCommandReply::internal(p.opcode, status));
        }
    }

    /// I/O failure: the engine closes and subscribers see `TransportClosed`
    fn on_transport_failure(&self, reason: String) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        error!("hci{}: transport failure: {}", self.dev_id, reason);
        self.transport.close();
        self.fail_pending(HciStatusCode::InternalFailure);
        self.l2cap.close_all();
        self.connections.clear();
        self.dispatch(MgmtEvent::new(
            self.dev_id,
            monotonic_millis(),
            MgmtEventData::TransportClosed { reason },
        ));
    }

    /// Stop the reader and drain task, bounded by the shutdown timeout
    pub async fn close(&self) {
        if self.shall_stop.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("hci{}: closing handler", self.dev_id);
        self.open.store(false, Ordering::SeqCst);
        self.transport.close();
        self.fail_pending(HciStatusCode::InternalFailure);
        self.l2cap.close_all();
        self.connections.clear();

        let timeout = self.config.shutdown_timeout;
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            let join = tokio::task::spawn_blocking(move || reader.join());
            if tokio::time::timeout(timeout, join).await.is_err() {
                warn!("hci{}: reader thread did not stop within {:?}, leaking it", self.dev_id, timeout);
            }
        }
        let drain = self.drain.lock().take();
        if let Some(mut drain) = drain {
            if tokio::time::timeout(timeout, &mut drain).await.is_err() {
                warn!("hci{}: drain task did not stop within {:?}", self.dev_id, timeout);
                drain.abort();
            }
        }
        self.clear_all_callbacks();
        info!("hci{}: handler closed", self.dev_id);
    }
}

impl AclSink for HciHandler {
    fn send_frame(&self, handle: u16, frame: &L2capFrame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let mtu = self.acl_mtu.load(Ordering::SeqCst);
        let fragments = frame
            .fragment(handle, mtu)
            .map_err(|e| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
        let _guard = self.write_lock.lock();
        for fragment in fragments {
            let bytes = fragment
                .encode()
                .map_err(|e| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
            self.transport.write_packet(&bytes)?;
        }
        Ok(())
    }
}

impl Drop for HciHandler {
    fn drop(&mut self) {
        self.shall_stop.store(true, Ordering::SeqCst);
        self.transport.close();
    }
}

// ----------------------------------------------------------------------------
// Background Loops
// ----------------------------------------------------------------------------

fn reader_loop(
    dev_id: u16,
    transport: Arc<dyn HciTransport>,
    stop: Arc<AtomicBool>,
    poll: Duration,
    tx: mpsc::Sender<ReaderItem>,
) {
    debug!("hci{}: reader started", dev_id);
    let mut buf = vec![0u8; HCI_MAX_FRAME_SIZE];
    while !stop.load(Ordering::SeqCst) {
        match transport.read_packet(&mut buf, poll) {
            Ok(Some(n)) => {
                if tx.blocking_send(ReaderItem::Packet(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(_) if stop.load(Ordering::SeqCst) => break,
            Err(e) => {
                let _ = tx.blocking_send(ReaderItem::Closed(e.to_string()));
                break;
            }
        }
    }
    debug!("hci{}: reader stopped", dev_id);
}

async fn drain_loop(handler: Weak<HciHandler>, mut rx: mpsc::Receiver<ReaderItem>) {
    while let Some(item) = rx.recv().await {
        let Some(handler) = handler.upgrade() else {
            break;
        };
        match item {
            ReaderItem::Packet(bytes) => handler.process_packet(&bytes),
            ReaderItem::Closed(reason) => {
                handler.on_transport_failure(reason);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_replied_commands() {
        assert!(replies_with_status(cmd::LE_CREATE_CONN));
        assert!(replies_with_status(cmd::DISCONNECT));
        assert!(!replies_with_status(cmd::RESET));
        assert!(!replies_with_status(cmd::LE_SET_SCAN_ENABLE));
    }

    #[test]
    fn local_info_defaults_to_minimum_acl_mtu() {
        let info = LocalInfo::default();
        assert_eq!(info.acl_mtu, DEFAULT_LE_ACL_MTU);
        assert!(!info.secure_connections());
    }
}
