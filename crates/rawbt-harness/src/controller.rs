//! Simulated controller
//!
//! [`MockController`] implements [`HciTransport`] in memory. Every command
//! written by the engine is recorded and answered the way a controller would,
//! including the follow-up events of status-replied commands. Tests steer it
//! with status overrides, silent opcodes, injected events and scripted SMP
//! peers. [`MockControllers`] provides controllers to the runtime and reports
//! hot-plug changes.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rawbt_core::protocol::l2cap::{cid, DEFAULT_LE_ACL_MTU};
use rawbt_core::protocol::opcodes::cmd;
use rawbt_core::protocol::{AclReassembler, HciCommand, HciPacket, L2capFrame};
use rawbt_core::smp::{SmpAddress, SmpPdu};
use rawbt_core::{
    BdAddress, BdAddressAndType, BdAddressType, BtRole, HciConfig, HciStatusCode, TransportError,
};
use rawbt_hci::{ControllerProvider, HciTransport, IndexChange, IndexWatcher};
use tracing::{debug, trace, warn};

use crate::packets;
use crate::smp_peer::{SmpPeer, SmpPeerConfig};

const FIRST_HANDLE: u16 = 0x0040;
const CONN_INTERVAL: u16 = 24;
const SUPERVISION_TIMEOUT: u16 = 500;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MockControllerConfig {
    pub dev_id: u16,
    pub address: BdAddress,
    pub name: String,
    /// LE ACL buffer size reported by LE Read Buffer Size, 0 reports none
    pub acl_mtu: u16,
    pub acl_packets: u8,
    pub le_features: u64,
    /// LE Read Local P-256 Public Key is supported
    pub secure_connections: bool,
    /// LE Create Connection completes on its own
    pub auto_connect: bool,
    /// Features reported for every remote
    pub remote_features: u64,
}

impl Default for MockControllerConfig {
    fn default() -> Self {
        Self {
            dev_id: 0,
            address: BdAddress::new([0x01, 0x00, 0x00, 0xDA, 0x26, 0xC0]),
            name: "rawbt-mock".to_string(),
            acl_mtu: DEFAULT_LE_ACL_MTU as u16,
            acl_packets: 8,
            le_features: 0x01,
            secure_connections: false,
            auto_connect: true,
            remote_features: 0x01,
        }
    }
}

impl MockControllerConfig {
    pub fn with_dev_id(mut self, dev_id: u16) -> Self {
        self.dev_id = dev_id;
        let [lo, ..] = dev_id.to_le_bytes();
        let mut bytes = *self.address.as_bytes();
        bytes[0] = lo.wrapping_add(1);
        self.address = BdAddress::new(bytes);
        self
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn with_secure_connections(mut self, sc: bool) -> Self {
        self.secure_connections = sc;
        self
    }

    pub fn with_acl_mtu(mut self, mtu: u16) -> Self {
        self.acl_mtu = mtu;
        self
    }
}

// ----------------------------------------------------------------------------
// Controller State
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MockState {
    status_overrides: HashMap<u16, HciStatusCode>,
    silent: HashSet<u16>,
    encryption_status: Option<HciStatusCode>,
    fail_writes: bool,

    commands: Vec<HciCommand>,
    l2cap_out: Vec<(u16, L2capFrame)>,
    reassembler: AclReassembler,

    next_handle: u16,
    connections: BTreeMap<u16, BdAddressAndType>,
    pending_connect: Option<BdAddressAndType>,
    scanning: bool,
    advertising: bool,

    peer_configs: HashMap<BdAddressAndType, SmpPeerConfig>,
    smp_peers: HashMap<u16, SmpPeer>,
}

/// In-memory controller answering the engine's commands
#[derive(Debug)]
pub struct MockController {
    config: MockControllerConfig,
    open: AtomicBool,
    failed: AtomicBool,
    inbound: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
    state: Mutex<MockState>,
}

impl MockController {
    pub fn new(config: MockControllerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            open: AtomicBool::new(true),
            failed: AtomicBool::new(false),
            inbound: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            state: Mutex::new(MockState {
                next_handle: FIRST_HANDLE,
                ..MockState::default()
            }),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(MockControllerConfig::default())
    }

    pub fn config(&self) -> &MockControllerConfig {
        &self.config
    }

    pub fn address(&self) -> BdAddressAndType {
        BdAddressAndType::new(self.config.address, BdAddressType::BdAddrLePublic)
    }

    /// Make the controller usable again after a close, keeping recorded state
    pub fn reopen(&self) {
        self.inbound.lock().clear();
        self.failed.store(false, Ordering::SeqCst);
        self.open.store(true, Ordering::SeqCst);
    }

    /// Simulate an I/O failure of the socket; pending reads error out
    pub fn fail_transport(&self) {
        self.failed.store(true, Ordering::SeqCst);
        let _guard = self.inbound.lock();
        self.ready.notify_all();
    }

    // ------------------------------------------------------------------------
    // Steering
    // ------------------------------------------------------------------------

    /// Answer `opcode` with `status` instead of success
    pub fn set_status(&self, opcode: u16, status: HciStatusCode) {
        self.state.lock().status_overrides.insert(opcode, status);
    }

    pub fn clear_status(&self, opcode: u16) {
        self.state.lock().status_overrides.remove(&opcode);
    }

    /// Never answer `opcode`
    pub fn set_silent(&self, opcode: u16, silent: bool) {
        let mut state = self.state.lock();
        if silent {
            state.silent.insert(opcode);
        } else {
            state.silent.remove(&opcode);
        }
    }

    /// Status of Encryption Change after LE Enable Encryption or an LTK reply
    pub fn set_encryption_status(&self, status: HciStatusCode) {
        self.state.lock().encryption_status = Some(status);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Run a scripted SMP responder on future connections to `peer`
    pub fn attach_smp_peer(&self, peer: BdAddressAndType, config: SmpPeerConfig) {
        self.state.lock().peer_configs.insert(peer, config);
    }

    // ------------------------------------------------------------------------
    // Injection
    // ------------------------------------------------------------------------

    /// Queue one raw H4 packet for the engine
    pub fn push_packet(&self, bytes: Vec<u8>) {
        let mut inbound = self.inbound.lock();
        inbound.push_back(bytes);
        self.ready.notify_all();
    }

    fn push_all(&self, packets: Vec<Vec<u8>>) {
        if packets.is_empty() {
            return;
        }
        let mut inbound = self.inbound.lock();
        inbound.extend(packets);
        self.ready.notify_all();
    }

    pub fn advertise(&self, peer: &BdAddressAndType, ad_data: &[u8], rssi: i8) {
        // ADV_IND: connectable undirected
        self.push_packet(packets::le_advertising_report(peer, 0x00, ad_data, rssi));
    }

    /// Complete a connection the engine initiated while auto-connect is off
    pub fn complete_pending_connection(&self) -> Option<u16> {
        let (packets, handle) = {
            let mut state = self.state.lock();
            let peer = state.pending_connect.take()?;
            let (packet, handle) = self.connect_locked(&mut state, peer, BtRole::Master);
            (vec![packet], handle)
        };
        self.push_all(packets);
        Some(handle)
    }

    /// Fail a connection the engine initiated while auto-connect is off
    pub fn fail_pending_connection(&self, status: HciStatusCode) -> bool {
        let peer = match self.state.lock().pending_connect.take() {
            Some(peer) => peer,
            None => return false,
        };
        self.push_packet(packets::le_connection_complete(
            status,
            0,
            BtRole::Master,
            &peer,
            0,
            0,
        ));
        true
    }

    /// A remote central connecting to us while we advertise
    pub fn connect_incoming(&self, peer: &BdAddressAndType) -> u16 {
        let (packet, handle) = {
            let mut state = self.state.lock();
            state.advertising = false;
            self.connect_locked(&mut state, *peer, BtRole::Slave)
        };
        self.push_packet(packet);
        handle
    }

    pub fn remote_disconnect(&self, handle: u16, reason: HciStatusCode) {
        let known = {
            let mut state = self.state.lock();
            state.smp_peers.remove(&handle);
            state.reassembler.reset(handle);
            state.connections.remove(&handle).is_some()
        };
        if known {
            self.push_packet(packets::disconnection_complete(handle, reason));
        }
    }

    /// Peer-sent SMP PDU, e.g. a Security Request
    pub fn send_smp(&self, handle: u16, pdu: &SmpPdu) {
        self.push_packet(packets::acl_smp(handle, pdu));
    }

    pub fn request_ltk(&self, handle: u16, rand: u64, ediv: u16) {
        self.push_packet(packets::le_ltk_request(handle, rand, ediv));
    }

    pub fn hardware_error(&self, code: u8) {
        self.push_packet(packets::hardware_error(code));
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn commands(&self) -> Vec<HciCommand> {
        self.state.lock().commands.clone()
    }

    pub fn commands_with(&self, opcode: u16) -> Vec<HciCommand> {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.opcode == opcode)
            .cloned()
            .collect()
    }

    pub fn count(&self, opcode: u16) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.opcode == opcode)
            .count()
    }

    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    /// Reassembled L2CAP frames the engine sent, with their handles
    pub fn sent_l2cap(&self) -> Vec<(u16, L2capFrame)> {
        self.state.lock().l2cap_out.clone()
    }

    /// SMP PDUs the scripted peer on `handle` received
    pub fn smp_received(&self, handle: u16) -> Vec<SmpPdu> {
        self.state
            .lock()
            .smp_peers
            .get(&handle)
            .map(|p| p.received().to_vec())
            .unwrap_or_default()
    }

    pub fn handle_of(&self, peer: &BdAddressAndType) -> Option<u16> {
        self.state
            .lock()
            .connections
            .iter()
            .find(|(_, p)| *p == peer)
            .map(|(h, _)| *h)
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().scanning
    }

    pub fn is_advertising(&self) -> bool {
        self.state.lock().advertising
    }

    // ------------------------------------------------------------------------
    // Command Processing
    // ------------------------------------------------------------------------

    fn connect_locked(
        &self,
        state: &mut MockState,
        peer: BdAddressAndType,
        role: BtRole,
    ) -> (Vec<u8>, u16) {
        let handle = state.next_handle;
        state.next_handle = state.next_handle.wrapping_add(1);
        state.connections.insert(handle, peer);
        if let Some(config) = state.peer_configs.get(&peer).cloned() {
            let us = SmpAddress::new(self.config.address, BdAddressType::BdAddrLePublic);
            let them = SmpAddress::new(peer.address, peer.address_type);
            state.smp_peers.insert(handle, SmpPeer::new(us, them, config));
        }
        debug!("mock hci{}: {} connected as 0x{:04x}", self.config.dev_id, peer, handle);
        let packet = packets::le_connection_complete(
            HciStatusCode::Success,
            handle,
            role,
            &peer,
            CONN_INTERVAL,
            SUPERVISION_TIMEOUT,
        );
        (packet, handle)
    }

    fn handle_command(&self, command: HciCommand) -> Vec<Vec<u8>> {
        let mut state = self.state.lock();
        let opcode = command.opcode;
        trace!("mock hci{}: <- {}", self.config.dev_id, cmd::name(opcode));
        state.commands.push(command.clone());
        if state.silent.contains(&opcode) {
            return Vec::new();
        }
        let status = state
            .status_overrides
            .get(&opcode)
            .copied()
            .unwrap_or(HciStatusCode::Success);
        let params = command.params.as_slice();
        let mut out = Vec::new();

        match opcode {
            cmd::LE_CREATE_CONN => {
                out.push(packets::command_status(status, opcode));
                if status.is_success() && params.len() >= 12 {
                    let mut addr = [0u8; 6];
                    addr.copy_from_slice(&params[6..12]);
                    let peer = BdAddressAndType::new(
                        BdAddress::new(addr),
                        BdAddressType::from_hci_le(params[5]),
                    );
                    if self.config.auto_connect {
                        let (packet, _) = self.connect_locked(&mut state, peer, BtRole::Master);
                        out.push(packet);
                    } else {
                        state.pending_connect = Some(peer);
                    }
                }
            }
            cmd::CREATE_CONN => {
                out.push(packets::command_status(status, opcode));
                if status.is_success() && params.len() >= 6 {
                    let mut addr = [0u8; 6];
                    addr.copy_from_slice(&params[..6]);
                    let address = BdAddress::new(addr);
                    let handle = state.next_handle;
                    state.next_handle = state.next_handle.wrapping_add(1);
                    state.connections.insert(
                        handle,
                        BdAddressAndType::new(address, BdAddressType::BdAddrBredr),
                    );
                    out.push(packets::connection_complete(
                        HciStatusCode::Success,
                        handle,
                        &address,
                    ));
                }
            }
            cmd::DISCONNECT => {
                let handle = read_handle(params);
                let known = state.connections.contains_key(&handle);
                let status = if status.is_success() && !known {
                    HciStatusCode::UnknownConnectionIdentifier
                } else {
                    status
                };
                out.push(packets::command_status(status, opcode));
                if status.is_success() {
                    state.connections.remove(&handle);
                    state.smp_peers.remove(&handle);
                    state.reassembler.reset(handle);
                    out.push(packets::disconnection_complete(
                        handle,
                        HciStatusCode::ConnectionTerminatedByLocalHost,
                    ));
                }
            }
            cmd::LE_READ_REMOTE_FEATURES => {
                out.push(packets::command_status(status, opcode));
                if status.is_success() {
                    out.push(packets::le_remote_features(
                        HciStatusCode::Success,
                        read_handle(params),
                        self.config.remote_features,
                    ));
                }
            }
            cmd::LE_ENABLE_ENC => {
                out.push(packets::command_status(status, opcode));
                if status.is_success() {
                    let handle = read_handle(params);
                    let enc = state.encryption_status.unwrap_or(HciStatusCode::Success);
                    out.push(packets::encryption_change(enc, handle, enc.is_success()));
                    if enc.is_success() {
                        if let Some(peer) = state.smp_peers.get_mut(&handle) {
                            for pdu in peer.on_encrypted() {
                                out.push(packets::acl_smp(handle, &pdu));
                            }
                        }
                    }
                }
            }
            cmd::LE_READ_LOCAL_P256_PUBLIC_KEY => {
                let status = if !self.config.secure_connections && status.is_success() {
                    HciStatusCode::UnknownHciCommand
                } else {
                    status
                };
                out.push(packets::command_status(status, opcode));
                if status.is_success() {
                    out.push(packets::le_read_local_p256_complete(
                        HciStatusCode::Success,
                        &[0x11; 64],
                    ));
                }
            }
            cmd::LE_GENERATE_DHKEY => {
                out.push(packets::command_status(status, opcode));
                if status.is_success() {
                    out.push(packets::le_generate_dhkey_complete(
                        HciStatusCode::Success,
                        &[0x22; 32],
                    ));
                }
            }
            cmd::LE_CREATE_CONN_CANCEL => {
                let pending = state.pending_connect.take();
                let status = if status.is_success() && pending.is_none() {
                    HciStatusCode::CommandDisallowed
                } else {
                    status
                };
                out.push(packets::command_complete(opcode, &[status.as_u8()]));
                if let Some(peer) = pending.filter(|_| status.is_success()) {
                    out.push(packets::le_connection_complete(
                        HciStatusCode::UnknownConnectionIdentifier,
                        0,
                        BtRole::Master,
                        &peer,
                        0,
                        0,
                    ));
                }
            }
            cmd::LE_LTK_REPLY | cmd::LE_LTK_NEG_REPLY => {
                let handle = read_handle(params);
                let mut ret = vec![status.as_u8()];
                ret.extend_from_slice(&handle.to_le_bytes());
                out.push(packets::command_complete(opcode, &ret));
                if opcode == cmd::LE_LTK_REPLY && status.is_success() {
                    let enc = state.encryption_status.unwrap_or(HciStatusCode::Success);
                    out.push(packets::encryption_change(enc, handle, enc.is_success()));
                }
            }
            _ => {
                if status.is_success() {
                    match opcode {
                        cmd::LE_SET_SCAN_ENABLE => state.scanning = params.first() == Some(&1),
                        cmd::LE_SET_ADV_ENABLE => state.advertising = params.first() == Some(&1),
                        cmd::RESET => {
                            state.scanning = false;
                            state.advertising = false;
                            state.pending_connect = None;
                            state.connections.clear();
                            state.smp_peers.clear();
                        }
                        _ => {}
                    }
                }
                out.push(packets::command_complete(
                    opcode,
                    &self.return_params(opcode, status),
                ));
            }
        }
        out
    }

    fn return_params(&self, opcode: u16, status: HciStatusCode) -> Vec<u8> {
        let mut ret = vec![status.as_u8()];
        if !status.is_success() {
            return ret;
        }
        match opcode {
            cmd::READ_BD_ADDR => ret.extend_from_slice(self.config.address.as_bytes()),
            cmd::READ_LOCAL_VERSION => {
                // Bluetooth 5.0, Linux Foundation
                ret.push(0x09);
                ret.extend_from_slice(&0x0001u16.to_le_bytes());
                ret.push(0x09);
                ret.extend_from_slice(&0x05F1u16.to_le_bytes());
                ret.extend_from_slice(&0x0001u16.to_le_bytes());
            }
            cmd::READ_LOCAL_NAME => {
                let mut name = [0u8; 248];
                let bytes = self.config.name.as_bytes();
                let n = bytes.len().min(name.len() - 1);
                name[..n].copy_from_slice(&bytes[..n]);
                ret.extend_from_slice(&name);
            }
            cmd::LE_READ_BUFFER_SIZE => {
                ret.extend_from_slice(&self.config.acl_mtu.to_le_bytes());
                ret.push(self.config.acl_packets);
            }
            cmd::LE_READ_LOCAL_FEATURES => {
                ret.extend_from_slice(&self.config.le_features.to_le_bytes())
            }
            _ => {}
        }
        ret
    }

    fn handle_acl(&self, acl: rawbt_core::protocol::AclPacket) -> Vec<Vec<u8>> {
        let handle = acl.handle;
        let mut state = self.state.lock();
        let frame = match state.reassembler.push(acl) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!("mock hci{}: bad ACL from host: {}", self.config.dev_id, e);
                return Vec::new();
            }
        };
        state.l2cap_out.push((handle, frame.clone()));
        if frame.cid != cid::SMP {
            return Vec::new();
        }
        let pdu = match SmpPdu::decode(&frame.payload) {
            Ok(pdu) => pdu,
            Err(e) => {
                warn!("mock hci{}: bad SMP PDU from host: {}", self.config.dev_id, e);
                return Vec::new();
            }
        };
        match state.smp_peers.get_mut(&handle) {
            Some(peer) => peer
                .on_pdu(&pdu)
                .iter()
                .map(|reply| packets::acl_smp(handle, reply))
                .collect(),
            None => Vec::new(),
        }
    }
}

fn read_handle(params: &[u8]) -> u16 {
    match params {
        [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]) & 0x0fff,
        _ => 0,
    }
}

impl HciTransport for MockController {
    fn dev_id(&self) -> u16 {
        self.config.dev_id
    }

    fn read_packet(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, TransportError> {
        let mut inbound = self.inbound.lock();
        if inbound.is_empty() && self.is_open() && !self.failed.load(Ordering::SeqCst) {
            let _ = self.ready.wait_for(&mut inbound, timeout);
        }
        if self.failed.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated controller failure",
            )));
        }
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        match inbound.pop_front() {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(Some(n))
            }
            None => Ok(None),
        }
    }

    fn write_packet(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() || self.failed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.state.lock().fail_writes {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated write failure",
            )));
        }
        let replies = match HciPacket::decode(bytes) {
            Ok(HciPacket::Command(command)) => self.handle_command(command),
            Ok(HciPacket::Acl(acl)) => self.handle_acl(acl),
            Ok(other) => {
                warn!("mock hci{}: unexpected host packet {:?}", self.config.dev_id, other);
                Vec::new()
            }
            Err(e) => {
                warn!("mock hci{}: undecodable host packet: {}", self.config.dev_id, e);
                Vec::new()
            }
        };
        self.push_all(replies);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _guard = self.inbound.lock();
        self.ready.notify_all();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Controller Provider
// ----------------------------------------------------------------------------

/// Hot-plug notifications of [`MockControllers`]
#[derive(Debug, Default)]
pub struct MockIndexWatcher {
    changes: Mutex<VecDeque<IndexChange>>,
    ready: Condvar,
    closed: AtomicBool,
}

impl MockIndexWatcher {
    fn push(&self, change: IndexChange) {
        let mut changes = self.changes.lock();
        changes.push_back(change);
        self.ready.notify_all();
    }
}

impl IndexWatcher for MockIndexWatcher {
    fn next_change(&self, timeout: Duration) -> Result<Option<IndexChange>, TransportError> {
        let mut changes = self.changes.lock();
        if changes.is_empty() && !self.closed.load(Ordering::SeqCst) {
            let _ = self.ready.wait_for(&mut changes, timeout);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(changes.pop_front())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _guard = self.changes.lock();
        self.ready.notify_all();
    }
}

/// Set of simulated controllers keyed by device index
#[derive(Debug, Default)]
pub struct MockControllers {
    controllers: Mutex<BTreeMap<u16, Arc<MockController>>>,
    watcher: Arc<MockIndexWatcher>,
}

impl MockControllers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Provider with one default controller per index
    pub fn with_controllers(dev_ids: &[u16]) -> Arc<Self> {
        let provider = Self::new();
        for dev_id in dev_ids {
            provider.insert(MockController::new(
                MockControllerConfig::default().with_dev_id(*dev_id),
            ));
        }
        provider
    }

    /// Register without a hot-plug notification
    pub fn insert(&self, controller: Arc<MockController>) {
        self.controllers
            .lock()
            .insert(controller.dev_id(), controller);
    }

    /// Plug in a controller at runtime
    pub fn add_controller(&self, controller: Arc<MockController>) {
        let dev_id = controller.dev_id();
        self.insert(controller);
        self.watcher.push(IndexChange::Added(dev_id));
    }

    /// Unplug a controller: its transport fails and removal is reported
    pub fn remove_controller(&self, dev_id: u16) -> Option<Arc<MockController>> {
        let controller = self.controllers.lock().remove(&dev_id)?;
        controller.fail_transport();
        self.watcher.push(IndexChange::Removed(dev_id));
        Some(controller)
    }

    pub fn controller(&self, dev_id: u16) -> Option<Arc<MockController>> {
        self.controllers.lock().get(&dev_id).cloned()
    }
}

impl ControllerProvider for MockControllers {
    fn list_controllers(&self) -> Result<Vec<u16>, TransportError> {
        Ok(self.controllers.lock().keys().copied().collect())
    }

    fn open(&self, dev_id: u16, _config: &HciConfig) -> Result<Arc<dyn HciTransport>, TransportError> {
        let controller = self
            .controller(dev_id)
            .ok_or_else(|| TransportError::OpenFailed {
                what: "mock controller",
                dev_id,
                reason: "no such index".to_string(),
            })?;
        controller.reopen();
        Ok(controller)
    }

    fn index_watcher(&self) -> Result<Arc<dyn IndexWatcher>, TransportError> {
        Ok(self.watcher.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rawbt_core::protocol::commands;
    use rawbt_core::protocol::HciEventData;

    fn decode_event(bytes: &[u8]) -> HciEventData {
        match HciPacket::decode(bytes).expect("packet") {
            HciPacket::Event(ev) => HciEventData::decode(&ev).expect("event"),
            other => panic!("unexpected {:?}", other),
        }
    }

    fn read_one(ctrl: &MockController) -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        let n = ctrl
            .read_packet(&mut buf, Duration::from_millis(10))
            .expect("read")
            .expect("packet");
        buf.truncate(n);
        buf
    }

    #[test]
    fn answers_read_bd_addr() {
        let ctrl = MockController::with_defaults();
        let bytes = HciCommand::bare(cmd::READ_BD_ADDR).encode().expect("encode");
        ctrl.write_packet(&bytes).expect("write");
        match decode_event(&read_one(&ctrl)) {
            HciEventData::CommandComplete { opcode, return_params, .. } => {
                assert_eq!(opcode, cmd::READ_BD_ADDR);
                assert_eq!(
                    commands::read_bd_addr_reply(&return_params).expect("addr"),
                    ctrl.config().address
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn le_create_conn_completes_with_new_handle() {
        let ctrl = MockController::with_defaults();
        let peer = BdAddressAndType::new(BdAddress::new([7; 6]), BdAddressType::BdAddrLeRandom);
        let bytes = commands::le_create_conn(&peer, 0, &Default::default(), false)
            .encode()
            .expect("encode");
        ctrl.write_packet(&bytes).expect("write");
        assert!(matches!(
            decode_event(&read_one(&ctrl)),
            HciEventData::CommandStatus { status: HciStatusCode::Success, .. }
        ));
        match decode_event(&read_one(&ctrl)) {
            HciEventData::LeConnectionComplete { handle, peer: p, .. } => {
                assert_eq!(handle, FIRST_HANDLE);
                assert_eq!(p, peer);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ctrl.handle_of(&peer), Some(FIRST_HANDLE));
    }

    #[test]
    fn silent_opcode_times_out_reads() {
        let ctrl = MockController::with_defaults();
        ctrl.set_silent(cmd::RESET, true);
        ctrl.write_packet(&commands::reset().encode().expect("encode"))
            .expect("write");
        let mut buf = [0u8; 64];
        assert!(ctrl
            .read_packet(&mut buf, Duration::from_millis(5))
            .expect("read")
            .is_none());
        assert_eq!(ctrl.count(cmd::RESET), 1);
    }

    #[test]
    fn provider_reports_hot_plug() {
        let provider = MockControllers::with_controllers(&[0]);
        let watcher = provider.index_watcher().expect("watcher");
        provider.add_controller(MockController::new(
            MockControllerConfig::default().with_dev_id(1),
        ));
        assert_eq!(provider.list_controllers().expect("list"), vec![0, 1]);
        assert_eq!(
            watcher.next_change(Duration::from_millis(5)).expect("change"),
            Some(IndexChange::Added(1))
        );
        provider.remove_controller(0);
        assert_eq!(
            watcher.next_change(Duration::from_millis(5)).expect("change"),
            Some(IndexChange::Removed(0))
        );
    }
}
