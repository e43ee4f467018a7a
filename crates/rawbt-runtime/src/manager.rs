//! Stack context and adapter set
//!
//! [`BtManager`] is the explicit replacement for a process-wide singleton:
//! created once with the controller provider, configuration and the external
//! collaborators, it owns one [`BtAdapter`] per controller index and keeps
//! the set current as controllers come and go.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle as ThreadHandle;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use rawbt_core::smp::SmpCrypto;
use rawbt_core::{BtError, Result, StackConfig};
use rawbt_hci::{ControllerProvider, IndexChange, IndexWatcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapter::BtAdapter;
use crate::cow::CowList;
use crate::gatt::GattConnector;
use crate::listener::ChangedAdapterSetListener;

/// What every adapter of one manager shares
pub(crate) struct StackContext {
    pub provider: Arc<dyn ControllerProvider>,
    pub config: StackConfig,
    pub crypto: Arc<dyn SmpCrypto>,
    pub gatt: Arc<dyn GattConnector>,
}

pub type AdapterSetListenerRef = Arc<dyn ChangedAdapterSetListener>;

struct HotPlug {
    watcher: Arc<dyn IndexWatcher>,
    thread: ThreadHandle<()>,
    task: JoinHandle<()>,
}

// ----------------------------------------------------------------------------
// Manager
// ----------------------------------------------------------------------------

pub struct BtManager {
    ctx: Arc<StackContext>,
    adapters: DashMap<u16, Arc<BtAdapter>>,
    listeners: CowList<AdapterSetListenerRef>,
    hotplug: Mutex<Option<HotPlug>>,
    stopping: Arc<AtomicBool>,
}

impl std::fmt::Debug for BtManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<u16> = self.adapters.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        f.debug_struct("BtManager").field("adapters", &ids).finish()
    }
}

impl BtManager {
    /// Enumerate controllers and start watching for hot-plug, adapters start unpowered
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        provider: Arc<dyn ControllerProvider>,
        config: StackConfig,
        crypto: Arc<dyn SmpCrypto>,
        gatt: Arc<dyn GattConnector>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| BtError::illegal_state("BtManager requires a tokio runtime"))?;
        let ids = provider.list_controllers()?;

        let ctx = Arc::new(StackContext {
            provider,
            config,
            crypto,
            gatt,
        });
        let manager = Arc::new(Self {
            ctx,
            adapters: DashMap::new(),
            listeners: CowList::new(),
            hotplug: Mutex::new(None),
            stopping: Arc::new(AtomicBool::new(false)),
        });
        for dev_id in ids {
            manager.adapters.insert(dev_id, BtAdapter::new(dev_id, manager.ctx.clone()));
        }
        info!("manager: {} adapter(s) found", manager.adapters.len());

        match manager.ctx.provider.index_watcher() {
            Ok(watcher) => manager.start_hotplug(&runtime, watcher)?,
            Err(e) => warn!("manager: hot-plug unavailable: {}", e),
        }
        Ok(manager)
    }

    fn start_hotplug(
        self: &Arc<Self>,
        runtime: &tokio::runtime::Handle,
        watcher: Arc<dyn IndexWatcher>,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let poll = self.ctx.config.hci.reader_poll_timeout;
        let stopping = self.stopping.clone();
        let thread_watcher = watcher.clone();
        let thread = std::thread::Builder::new()
            .name("rawbt-hotplug".into())
            .spawn(move || {
                while !stopping.load(Ordering::SeqCst) {
                    match thread_watcher.next_change(poll) {
                        Ok(Some(change)) => {
                            if tx.send(change).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            if !stopping.load(Ordering::SeqCst) {
                                error!("manager: hot-plug watcher failed: {}", e);
                            }
                            break;
                        }
                    }
                }
                debug!("manager: hot-plug watcher stopped");
            })?;

        let weak: Weak<Self> = Arc::downgrade(self);
        let task = runtime.spawn(async move {
            while let Some(change) = rx.recv().await {
                match weak.upgrade() {
                    Some(manager) => manager.on_index_change(change).await,
                    None => break,
                }
            }
        });
        *self.hotplug.lock() = Some(HotPlug {
            watcher,
            thread,
            task,
        });
        Ok(())
    }

    async fn on_index_change(&self, change: IndexChange) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        match change {
            IndexChange::Added(dev_id) => {
                if self.adapters.contains_key(&dev_id) {
                    debug!("manager: hci{} already known", dev_id);
                    return;
                }
                let adapter = BtAdapter::new(dev_id, self.ctx.clone());
                self.adapters.insert(dev_id, adapter.clone());
                info!("manager: hci{} added", dev_id);
                for listener in self.listeners.snapshot().iter() {
                    listener.adapter_added(&adapter);
                }
            }
            IndexChange::Removed(dev_id) => {
                let adapter = match self.adapters.remove(&dev_id) {
                    Some((_, adapter)) => adapter,
                    None => return,
                };
                adapter.close().await;
                info!("manager: hci{} removed", dev_id);
                for listener in self.listeners.snapshot().iter() {
                    listener.adapter_removed(&adapter);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Adapters
    // ------------------------------------------------------------------------

    /// All adapters, by ascending index
    pub fn adapters(&self) -> Vec<Arc<BtAdapter>> {
        let mut all: Vec<Arc<BtAdapter>> = self.adapters.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|a| a.dev_id());
        all
    }

    pub fn adapter(&self, dev_id: u16) -> Option<Arc<BtAdapter>> {
        self.adapters.get(&dev_id).map(|e| e.value().clone())
    }

    /// Lowest-index powered adapter, else the lowest-index valid one
    pub fn default_adapter(&self) -> Option<Arc<BtAdapter>> {
        let all = self.adapters();
        all.iter()
            .find(|a| a.is_powered())
            .or_else(|| all.iter().find(|a| a.is_valid()))
            .cloned()
    }

    pub fn config(&self) -> &StackConfig {
        &self.ctx.config
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    /// Register a listener, replaying `adapter_added` for every current adapter
    pub fn add_changed_adapter_set_listener(&self, listener: AdapterSetListenerRef) -> bool {
        if !self.listeners.push_unique(listener.clone(), |a, b| Arc::ptr_eq(a, b)) {
            return false;
        }
        for adapter in self.adapters() {
            listener.adapter_added(&adapter);
        }
        true
    }

    pub fn remove_changed_adapter_set_listener(&self, listener: &AdapterSetListenerRef) -> bool {
        self.listeners
            .remove_first(|l| Arc::ptr_eq(l, listener))
            .is_some()
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Stop hot-plug and close every adapter
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("manager: shutting down");
        let hotplug = self.hotplug.lock().take();
        if let Some(HotPlug {
            watcher,
            thread,
            task,
        }) = hotplug
        {
            watcher.close();
            task.abort();
            let timeout = self.ctx.config.hci.shutdown_timeout;
            let join = tokio::task::spawn_blocking(move || thread.join());
            if tokio::time::timeout(timeout, join).await.is_err() {
                warn!("manager: hot-plug thread did not stop within {:?}", timeout);
            }
        }

        let adapters = self.adapters();
        self.adapters.clear();
        join_all(adapters.iter().map(|a| a.close())).await;
        self.listeners.clear();
        info!("manager: shut down");
    }
}
