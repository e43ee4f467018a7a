//! L2CAP fixed channels over ACL
//!
//! Inbound ACL fragments are reassembled per connection handle. SMP frames are
//! handed back to the engine, ATT frames are queued on the connection's
//! [`L2capChannel`]. Outbound frames go through an [`AclSink`], which
//! fragments them to the controller buffer size.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rawbt_core::protocol::l2cap::cid;
use rawbt_core::protocol::{AclPacket, AclReassembler, L2capFrame};
use rawbt_core::{PacketError, TransportError};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use crate::error::L2capError;

/// Outbound path for complete L2CAP frames
pub trait AclSink: Send + Sync {
    fn send_frame(&self, handle: u16, frame: &L2capFrame) -> Result<(), TransportError>;
}

// ----------------------------------------------------------------------------
// Channel
// ----------------------------------------------------------------------------

struct ChannelInner {
    handle: u16,
    cid: u16,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    wake: Notify,
    closed: AtomicBool,
    sink: Weak<dyn AclSink>,
}

/// One fixed channel of one connection
#[derive(Clone)]
pub struct L2capChannel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for L2capChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("L2capChannel")
            .field("handle", &self.inner.handle)
            .field("cid", &self.inner.cid)
            .field("open", &self.is_open())
            .finish()
    }
}

impl L2capChannel {
    pub fn new(handle: u16, cid: u16, sink: Weak<dyn AclSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ChannelInner {
                handle,
                cid,
                tx,
                rx: tokio::sync::Mutex::new(rx),
                wake: Notify::new(),
                closed: AtomicBool::new(false),
                sink,
            }),
        }
    }

    pub fn handle(&self) -> u16 {
        self.inner.handle
    }

    pub fn cid(&self) -> u16 {
        self.inner.cid
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Next inbound SDU
    pub async fn read(&self, timeout: Duration) -> Result<Vec<u8>, L2capError> {
        if !self.is_open() {
            return Err(L2capError::Closed);
        }
        let mut rx = self.inner.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.inner.wake.notified() => {
                if self.is_open() {
                    Err(L2capError::Interrupted)
                } else {
                    Err(L2capError::Closed)
                }
            }
            msg = rx.recv() => msg.ok_or(L2capError::Closed),
            _ = tokio::time::sleep(timeout) => Err(L2capError::Timeout),
        }
    }

    pub fn write(&self, data: &[u8]) -> Result<(), L2capError> {
        if !self.is_open() {
            return Err(L2capError::Closed);
        }
        let sink = self.inner.sink.upgrade().ok_or(L2capError::Closed)?;
        let frame = L2capFrame::new(self.inner.cid, data.to_vec());
        sink.send_frame(self.inner.handle, &frame)?;
        Ok(())
    }

    /// Make a pending read return `Interrupted`
    pub fn interrupt(&self) {
        self.inner.wake.notify_one();
    }

    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!(
                "L2CAP cid 0x{:04x} on handle 0x{:04x} closed",
                self.inner.cid, self.inner.handle
            );
            self.inner.wake.notify_waiters();
            self.inner.wake.notify_one();
        }
    }

    pub(crate) fn deliver(&self, payload: Vec<u8>) -> bool {
        self.is_open() && self.inner.tx.send(payload).is_ok()
    }
}

// ----------------------------------------------------------------------------
// Server
// ----------------------------------------------------------------------------

/// Accepts ATT channels of connections where the local role is peripheral
pub struct L2capServer {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<L2capChannel>>,
    wake: Notify,
    closed: AtomicBool,
}

impl L2capServer {
    fn new(rx: mpsc::UnboundedReceiver<L2capChannel>) -> Self {
        Self {
            rx: tokio::sync::Mutex::new(rx),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn accept(&self, timeout: Duration) -> Result<L2capChannel, L2capError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(L2capError::Closed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.wake.notified() => Err(L2capError::Closed),
            ch = rx.recv() => ch.ok_or(L2capError::Closed),
            _ = tokio::time::sleep(timeout) => Err(L2capError::Timeout),
        }
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.wake.notify_waiters();
            self.wake.notify_one();
        }
    }
}

// ----------------------------------------------------------------------------
// Multiplexer
// ----------------------------------------------------------------------------

/// Frame routed somewhere other than an ATT channel
#[derive(Debug, PartialEq)]
pub(crate) enum Routed {
    Smp { handle: u16, payload: Vec<u8> },
    Att,
    Incomplete,
    Dropped,
}

#[derive(Default)]
pub(crate) struct L2capMux {
    reassembler: Mutex<AclReassembler>,
    att: DashMap<u16, L2capChannel>,
    server: Mutex<Option<mpsc::UnboundedSender<L2capChannel>>>,
}

impl L2capMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// ATT channel for a new connection, handed to the server when acting as peripheral
    pub fn open_att(&self, handle: u16, sink: Weak<dyn AclSink>, peripheral: bool) -> L2capChannel {
        let channel = L2capChannel::new(handle, cid::ATT, sink);
        if let Some(old) = self.att.insert(handle, channel.clone()) {
            old.close();
        }
        if peripheral {
            let mut server = self.server.lock();
            let gone = server
                .as_ref()
                .is_some_and(|tx| tx.send(channel.clone()).is_err());
            if gone {
                *server = None;
            }
        }
        channel
    }

    pub fn att_channel(&self, handle: u16) -> Option<L2capChannel> {
        self.att.get(&handle).map(|c| c.value().clone())
    }

    pub fn listen(&self) -> L2capServer {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.server.lock() = Some(tx);
        L2capServer::new(rx)
    }

    pub fn push_acl(&self, acl: AclPacket) -> Result<Routed, PacketError> {
        let handle = acl.handle;
        let frame = match self.reassembler.lock().push(acl)? {
            Some(frame) => frame,
            None => return Ok(Routed::Incomplete),
        };
        trace!(
            "L2CAP frame cid 0x{:04x} len {} on handle 0x{:04x}",
            frame.cid,
            frame.payload.len(),
            handle
        );
        match frame.cid {
            cid::SMP | cid::SMP_BREDR => Ok(Routed::Smp {
                handle,
                payload: frame.payload,
            }),
            cid::ATT => match self.att_channel(handle) {
                Some(ch) if ch.deliver(frame.payload) => Ok(Routed::Att),
                _ => {
                    debug!("ATT data for handle 0x{:04x} without open channel", handle);
                    Ok(Routed::Dropped)
                }
            },
            other => {
                debug!("Ignoring L2CAP cid 0x{:04x}", other);
                Ok(Routed::Dropped)
            }
        }
    }

    pub fn close_connection(&self, handle: u16) {
        self.reassembler.lock().reset(handle);
        if let Some((_, ch)) = self.att.remove(&handle) {
            ch.close();
        }
    }

    pub fn close_all(&self) {
        let handles: Vec<u16> = self.att.iter().map(|e| *e.key()).collect();
        for handle in handles {
            self.close_connection(handle);
        }
        *self.server.lock() = None;
    }
}
