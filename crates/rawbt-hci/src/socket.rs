//! Raw HCI socket transport and controller enumeration
//!
//! [`HciTransport`] is the seam between the engine and the kernel. The Linux
//! implementation, [`HciSocket`], binds `AF_BLUETOOTH/BTPROTO_HCI` through
//! `socket2`; `sockaddr_hci` and the HCI filter are not known to `socket2`, so
//! those two calls go through `libc`. [`LinuxControllers`] enumerates adapters
//! and watches hot-plug events on the management control channel.

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rawbt_core::protocol::HciPacketType;
use rawbt_core::{HciConfig, TransportError};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

// ----------------------------------------------------------------------------
// Kernel Constants
// ----------------------------------------------------------------------------

const AF_BLUETOOTH: i32 = 31;
const BTPROTO_HCI: i32 = 1;
const SOL_HCI: i32 = 0;
const HCI_FILTER: i32 = 2;

const HCI_CHANNEL_RAW: u16 = 0;
const HCI_CHANNEL_USER: u16 = 1;
const HCI_CHANNEL_CONTROL: u16 = 3;
const HCI_DEV_NONE: u16 = 0xffff;

const HCI_MAX_DEV: usize = 16;
const HCIDEVDOWN: libc::c_ulong = 0x4004_48ca;
const HCIGETDEVLIST: libc::c_ulong = 0x8004_48d2;

const MGMT_OP_READ_INDEX_LIST: u16 = 0x0003;
const MGMT_EV_INDEX_ADDED: u16 = 0x0004;
const MGMT_EV_INDEX_REMOVED: u16 = 0x0005;
const MGMT_HEADER_SIZE: usize = 6;

/// Largest packet the kernel hands out on an HCI socket
pub const HCI_MAX_FRAME_SIZE: usize = 1028;

#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct HciDevReq {
    dev_id: u16,
    dev_opt: u32,
}

#[repr(C)]
struct HciDevListReq {
    dev_num: u16,
    dev_req: [HciDevReq; HCI_MAX_DEV],
}

// ----------------------------------------------------------------------------
// Transport Traits
// ----------------------------------------------------------------------------

/// Packet-level access to one controller
///
/// Implementations are shared between the reader thread and command senders,
/// so every method takes `&self`.
pub trait HciTransport: Send + Sync {
    fn dev_id(&self) -> u16;

    /// Read one packet into `buf`, `Ok(None)` when `timeout` elapsed without data
    fn read_packet(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<usize>, TransportError>;

    fn write_packet(&self, packet: &[u8]) -> Result<(), TransportError>;

    /// Idempotent. Blocked and subsequent reads return `TransportError::Closed`.
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Adapter add/remove notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexChange {
    Added(u16),
    Removed(u16),
}

/// Source of hot-plug notifications
pub trait IndexWatcher: Send + Sync {
    /// Next change, `Ok(None)` on timeout
    fn next_change(&self, timeout: Duration) -> Result<Option<IndexChange>, TransportError>;

    fn close(&self);
}

/// Enumerates and opens controllers
pub trait ControllerProvider: Send + Sync {
    fn list_controllers(&self) -> Result<Vec<u16>, TransportError>;

    fn open(
        &self,
        dev_id: u16,
        config: &HciConfig,
    ) -> Result<Arc<dyn HciTransport>, TransportError>;

    fn index_watcher(&self) -> Result<Arc<dyn IndexWatcher>, TransportError>;
}

// ----------------------------------------------------------------------------
// libc Helpers
// ----------------------------------------------------------------------------

fn map_open_error(err: std::io::Error, what: &'static str, dev_id: u16) -> TransportError {
    match err.raw_os_error() {
        Some(libc::EPERM) | Some(libc::EACCES) => TransportError::PermissionDenied,
        _ => TransportError::OpenFailed {
            what,
            dev_id,
            reason: err.to_string(),
        },
    }
}

fn new_hci_socket() -> std::io::Result<Socket> {
    Socket::new(
        Domain::from(AF_BLUETOOTH),
        Type::RAW,
        Some(Protocol::from(BTPROTO_HCI)),
    )
}

fn bind_hci(socket: &Socket, dev_id: u16, channel: u16) -> std::io::Result<()> {
    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: channel,
    };
    // SAFETY: bind() with a valid fd and a properly sized sockaddr_hci
    let ret = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &addr as *const SockaddrHci as *const libc::sockaddr,
            std::mem::size_of::<SockaddrHci>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn set_hci_filter(socket: &Socket, filter: &HciFilter) -> std::io::Result<()> {
    // SAFETY: setsockopt() with a valid fd and a properly sized hci_filter
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            SOL_HCI,
            HCI_FILTER,
            filter as *const HciFilter as *const libc::c_void,
            std::mem::size_of::<HciFilter>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// The user channel requires the kernel to have released the device
fn bring_device_down(socket: &Socket, dev_id: u16) -> std::io::Result<()> {
    // SAFETY: HCIDEVDOWN takes the device index by value
    let ret = unsafe { libc::ioctl(socket.as_raw_fd(), HCIDEVDOWN, dev_id as libc::c_ulong) };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// `Ok(true)` when the fd is readable within `timeout`
fn poll_readable(socket: &Socket, timeout: Duration) -> std::io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd: socket.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    // SAFETY: a single, valid pollfd
    let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    if ret > 0 && pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
    }
    Ok(ret > 0)
}

// ----------------------------------------------------------------------------
// HCI Socket
// ----------------------------------------------------------------------------

/// Raw HCI socket bound to one controller
pub struct HciSocket {
    socket: Socket,
    dev_id: u16,
    channel: u16,
    open: AtomicBool,
}

impl HciSocket {
    /// Bind the user channel when allowed, otherwise the raw channel with an all-events filter
    pub fn open(dev_id: u16, use_user_channel: bool) -> Result<Self, TransportError> {
        if use_user_channel {
            let socket = new_hci_socket().map_err(|e| map_open_error(e, "hci socket", dev_id))?;
            if let Err(e) = bring_device_down(&socket, dev_id) {
                debug!("HCIDEVDOWN on hci{} failed: {}", dev_id, e);
            }
            match bind_hci(&socket, dev_id, HCI_CHANNEL_USER) {
                Ok(()) => {
                    info!("hci{}: bound HCI_CHANNEL_USER", dev_id);
                    return Ok(Self::from_socket(socket, dev_id, HCI_CHANNEL_USER));
                }
                Err(e) => {
                    debug!("hci{}: user channel unavailable ({}), using raw", dev_id, e);
                }
            }
        }

        let socket = new_hci_socket().map_err(|e| map_open_error(e, "hci socket", dev_id))?;
        bind_hci(&socket, dev_id, HCI_CHANNEL_RAW)
            .map_err(|e| map_open_error(e, "raw channel", dev_id))?;
        let filter = HciFilter {
            type_mask: (1 << HciPacketType::Event as u32) | (1 << HciPacketType::AclData as u32),
            event_mask: [0xFFFF_FFFF, 0xFFFF_FFFF],
            opcode: 0,
        };
        set_hci_filter(&socket, &filter).map_err(|e| map_open_error(e, "hci filter", dev_id))?;
        info!("hci{}: bound HCI_CHANNEL_RAW", dev_id);
        Ok(Self::from_socket(socket, dev_id, HCI_CHANNEL_RAW))
    }

    fn from_socket(socket: Socket, dev_id: u16, channel: u16) -> Self {
        Self {
            socket,
            dev_id,
            channel,
            open: AtomicBool::new(true),
        }
    }

    pub fn is_user_channel(&self) -> bool {
        self.channel == HCI_CHANNEL_USER
    }
}

impl HciTransport for HciSocket {
    fn dev_id(&self) -> u16 {
        self.dev_id
    }

    fn read_packet(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<usize>, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        if !poll_readable(&self.socket, timeout)? {
            return if self.is_open() {
                Ok(None)
            } else {
                Err(TransportError::Closed)
            };
        }
        match (&self.socket).read(buf) {
            Ok(0) => Err(TransportError::Closed),
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn write_packet(&self, packet: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        (&self.socket).write_all(packet)?;
        Ok(())
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!("hci{}: closing socket", self.dev_id);
            // wakes a reader blocked in poll()
            let _ = self.socket.shutdown(std::net::Shutdown::Both);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Management Index Socket
// ----------------------------------------------------------------------------

/// Management control channel, used only for index added/removed events
pub struct MgmtIndexSocket {
    socket: Socket,
    open: AtomicBool,
}

impl MgmtIndexSocket {
    pub fn open() -> Result<Self, TransportError> {
        let socket =
            new_hci_socket().map_err(|e| map_open_error(e, "mgmt socket", HCI_DEV_NONE))?;
        bind_hci(&socket, HCI_DEV_NONE, HCI_CHANNEL_CONTROL)
            .map_err(|e| map_open_error(e, "control channel", HCI_DEV_NONE))?;
        // the kernel only forwards index events to sockets that asked for the index list
        let mut req = Vec::with_capacity(MGMT_HEADER_SIZE);
        req.extend_from_slice(&MGMT_OP_READ_INDEX_LIST.to_le_bytes());
        req.extend_from_slice(&HCI_DEV_NONE.to_le_bytes());
        req.extend_from_slice(&0u16.to_le_bytes());
        (&socket).write_all(&req)?;
        Ok(Self {
            socket,
            open: AtomicBool::new(true),
        })
    }

    fn parse(frame: &[u8]) -> Option<IndexChange> {
        if frame.len() < MGMT_HEADER_SIZE {
            return None;
        }
        let code = u16::from_le_bytes([frame[0], frame[1]]);
        let index = u16::from_le_bytes([frame[2], frame[3]]);
        match code {
            MGMT_EV_INDEX_ADDED => Some(IndexChange::Added(index)),
            MGMT_EV_INDEX_REMOVED => Some(IndexChange::Removed(index)),
            _ => None,
        }
    }
}

impl IndexWatcher for MgmtIndexSocket {
    fn next_change(&self, timeout: Duration) -> Result<Option<IndexChange>, TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !poll_readable(&self.socket, timeout)? {
            return Ok(None);
        }
        let mut buf = [0u8; 512];
        let n = (&self.socket).read(&mut buf)?;
        Ok(Self::parse(&buf[..n]))
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.socket.shutdown(std::net::Shutdown::Both);
        }
    }
}

// ----------------------------------------------------------------------------
// Linux Controller Provider
// ----------------------------------------------------------------------------

/// Kernel-backed [`ControllerProvider`]
#[derive(Debug, Default, Clone)]
pub struct LinuxControllers;

impl LinuxControllers {
    pub fn new() -> Self {
        Self
    }
}

impl ControllerProvider for LinuxControllers {
    fn list_controllers(&self) -> Result<Vec<u16>, TransportError> {
        let socket =
            new_hci_socket().map_err(|e| map_open_error(e, "hci socket", HCI_DEV_NONE))?;
        let mut req = HciDevListReq {
            dev_num: HCI_MAX_DEV as u16,
            dev_req: [HciDevReq::default(); HCI_MAX_DEV],
        };
        // SAFETY: HCIGETDEVLIST fills at most dev_num entries of our buffer
        let ret = unsafe {
            libc::ioctl(
                socket.as_raw_fd(),
                HCIGETDEVLIST,
                &mut req as *mut HciDevListReq as *mut libc::c_void,
            )
        };
        if ret < 0 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }
        let count = (req.dev_num as usize).min(HCI_MAX_DEV);
        let mut ids: Vec<u16> = req.dev_req[..count].iter().map(|r| r.dev_id).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn open(
        &self,
        dev_id: u16,
        config: &HciConfig,
    ) -> Result<Arc<dyn HciTransport>, TransportError> {
        let socket = HciSocket::open(dev_id, config.use_user_channel)?;
        if !socket.is_user_channel() {
            warn!(
                "hci{}: raw channel shares the controller with the kernel stack",
                dev_id
            );
        }
        Ok(Arc::new(socket))
    }

    fn index_watcher(&self) -> Result<Arc<dyn IndexWatcher>, TransportError> {
        Ok(Arc::new(MgmtIndexSocket::open()?))
    }
}
