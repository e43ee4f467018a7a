//! Adapter worker
//!
//! HCI callbacks run on the engine's drain task and must not block, so they
//! only enqueue a [`Job`]. One worker per adapter takes jobs in order and may
//! await HCI commands while handling them. The periodic services post their
//! ticks into the same queue, which makes the worker the single place where
//! discovery and connection bookkeeping change.

use std::sync::Weak;
use std::time::Duration;

use rawbt_core::{BdAddressAndType, HciStatusCode};
use rawbt_hci::{L2capChannel, L2capError, L2capServer, MgmtEvent};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::BtAdapter;
use crate::gatt::{GattError, GattSession};

// ----------------------------------------------------------------------------
// Jobs
// ----------------------------------------------------------------------------

pub(crate) enum Job {
    Event(MgmtEvent),
    /// LE Create Connection was refused before any connection event
    ConnectFailed {
        id: BdAddressAndType,
        status: HciStatusCode,
        timestamp: u64,
    },
    /// GATT setup of a connection finished
    DeviceReady {
        id: BdAddressAndType,
        handle: u16,
        result: Result<GattSession, GattError>,
    },
    RemoveDevice {
        id: BdAddressAndType,
        done: oneshot::Sender<()>,
    },
    /// ATT channel of a peripheral-role connection
    AttAccepted(L2capChannel),
    DiscoveryTick,
    WatchdogTick,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Job::Event(ev) => write!(f, "Event({:?})", ev.kind()),
            Job::ConnectFailed { id, status, .. } => write!(f, "ConnectFailed({}, {})", id, status),
            Job::DeviceReady { id, handle, .. } => write!(f, "DeviceReady({}, 0x{:04x})", id, handle),
            Job::RemoveDevice { id, .. } => write!(f, "RemoveDevice({})", id),
            Job::AttAccepted(ch) => write!(f, "AttAccepted(0x{:04x})", ch.handle()),
            Job::DiscoveryTick => f.write_str("DiscoveryTick"),
            Job::WatchdogTick => f.write_str("WatchdogTick"),
        }
    }
}

// ----------------------------------------------------------------------------
// Task Handles
// ----------------------------------------------------------------------------

/// Worker and service tasks of one powered adapter
pub(crate) struct AdapterTasks {
    pub jobs: mpsc::UnboundedSender<Job>,
    stop: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl AdapterTasks {
    pub fn new(jobs: mpsc::UnboundedSender<Job>, stop: watch::Sender<bool>) -> Self {
        Self {
            jobs,
            stop,
            handles: Vec::new(),
        }
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub fn push(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.handles.push((name, handle));
    }

    /// Signal every task and join each within `timeout`, aborting stragglers
    pub async fn shutdown(self, dev_id: u16, timeout: Duration) {
        let _ = self.stop.send(true);
        drop(self.jobs);
        for (name, mut handle) in self.handles {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                tracing::warn!("hci{}: {} did not stop within {:?}", dev_id, name, timeout);
                handle.abort();
            }
        }
        debug!("hci{}: adapter tasks stopped", dev_id);
    }
}

// ----------------------------------------------------------------------------
// Loops
// ----------------------------------------------------------------------------

pub(crate) async fn run_worker(
    adapter: Weak<BtAdapter>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let job = tokio::select! {
            _ = stop.changed() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let adapter = match adapter.upgrade() {
            Some(adapter) => adapter,
            None => break,
        };
        trace!("hci{}: job {:?}", adapter.dev_id(), job);
        adapter.handle_job(job).await;
    }
    info!("adapter worker stopped");
}

/// Post `make()` every `period` until stopped or the worker is gone
pub(crate) async fn run_ticker(
    name: &'static str,
    jobs: mpsc::UnboundedSender<Job>,
    period: Duration,
    make: fn() -> Job,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticks = interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticks.tick() => {
                if jobs.send(make()).is_err() {
                    break;
                }
            }
        }
    }
    debug!("{} stopped", name);
}

/// Hand peripheral-role ATT channels to the worker until stopped
pub(crate) async fn run_att_acceptor(
    server: L2capServer,
    jobs: mpsc::UnboundedSender<Job>,
    poll: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = stop.changed() => break,
            accepted = server.accept(poll) => accepted,
        };
        match accepted {
            Ok(channel) => {
                if jobs.send(Job::AttAccepted(channel)).is_err() {
                    break;
                }
            }
            Err(L2capError::Timeout) => continue,
            Err(e) => {
                debug!("ATT acceptor: {}", e);
                break;
            }
        }
    }
    server.close();
    debug!("ATT acceptor stopped");
}

impl BtAdapter {
    async fn handle_job(&self, job: Job) {
        match job {
            Job::Event(event) => self.handle_event(event).await,
            Job::ConnectFailed {
                id,
                status,
                timestamp,
            } => self.on_connect_failed(id, status, timestamp).await,
            Job::DeviceReady { id, handle, result } => {
                self.on_device_ready(id, handle, result).await
            }
            Job::RemoveDevice { id, done } => {
                self.drop_device(&id).await;
                let _ = done.send(());
            }
            Job::AttAccepted(channel) => self.on_att_accepted(channel),
            Job::DiscoveryTick => self.reconcile_discovery().await,
            Job::WatchdogTick => self.check_pairing_timeouts().await,
        }
    }
}
