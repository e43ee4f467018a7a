//! Discovery state machine
//!
//! Discovery is tracked twice: the *meta* scan type records what the user
//! asked for, the *native* scan type what the controller last reported. While
//! meta is on, connects pause native scanning and the [`DiscoveryPolicy`]
//! decides when it comes back. Devices holding a pause sit in the adapter's
//! pausing set; native scanning resumes only once that set is empty and no
//! connect is in flight.
//!
//! The reconciliation service ticks through the worker and re-enables native
//! scanning whenever meta is on but the controller is idle, giving up after
//! `max_retries` consecutive refusals.

use std::time::Duration;

use rawbt_core::protocol::ScanParams;
use rawbt_core::{monotonic_millis, BdAddressAndType, BtRole, DiscoveryPolicy, HciStatusCode, ScanType};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::worker::{run_ticker, Job};
use super::BtAdapter;

// ----------------------------------------------------------------------------
// State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct DiscoveryState {
    pub meta: ScanType,
    pub native: ScanType,
    pub policy: DiscoveryPolicy,
    pub scan_params: ScanParams,
    /// Consecutive failed re-enable attempts
    pub retries: u32,
}

impl DiscoveryState {
    pub fn new(scan_params: ScanParams) -> Self {
        Self {
            meta: ScanType::NONE,
            native: ScanType::NONE,
            policy: DiscoveryPolicy::default(),
            scan_params,
            retries: 0,
        }
    }
}

/// Event that may lift a device's discovery pause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PauseRelease {
    Ready,
    Paired,
    Disconnected,
}

impl PauseRelease {
    fn releases(self, policy: DiscoveryPolicy) -> bool {
        match self {
            PauseRelease::Disconnected => true,
            PauseRelease::Ready => matches!(
                policy,
                DiscoveryPolicy::PauseConnectedUntilReady | DiscoveryPolicy::PauseConnectedUntilPaired
            ),
            PauseRelease::Paired => policy == DiscoveryPolicy::PauseConnectedUntilPaired,
        }
    }
}

pub(crate) async fn run_discovery_service(
    jobs: mpsc::UnboundedSender<Job>,
    period: Duration,
    stop: watch::Receiver<bool>,
) {
    run_ticker("discovery service", jobs, period, || Job::DiscoveryTick, stop).await
}

// ----------------------------------------------------------------------------
// Public Operations
// ----------------------------------------------------------------------------

impl BtAdapter {
    /// Start LE discovery, clearing the discovered set first
    pub async fn start_discovery(
        &self,
        policy: DiscoveryPolicy,
        params: Option<ScanParams>,
    ) -> HciStatusCode {
        let hci = match self.powered_hci() {
            Some(hci) => hci,
            None => return HciStatusCode::CommandDisallowed,
        };
        if self.is_advertising() {
            debug!("hci{}: discovery refused while advertising", self.dev_id());
            return HciStatusCode::CommandDisallowed;
        }
        let params = params.unwrap_or_else(|| self.discovery.lock().scan_params.clone());
        if let Err(status) = params.validate() {
            return status;
        }

        let _op = self.discovery_op.lock().await;
        self.registry.clear_discovered();
        *self.role.lock() = BtRole::Master;

        let paused = !self.pausing.is_empty() || self.connect_lock.is_locked();
        let (was_meta, already) = {
            let mut state = self.discovery.lock();
            state.scan_params = params.clone();
            state.policy = policy;
            let was_meta = state.meta.has(ScanType::LE);
            (was_meta, was_meta && (state.native.has(ScanType::LE) || paused))
        };
        if already {
            // A held pause keeps native scanning off until it is released
            debug!("hci{}: discovery already on, policy now {:?}", self.dev_id(), policy);
            return HciStatusCode::Success;
        }

        let status = hci.le_start_scan(&params).await;
        if !status.is_success() {
            warn!("hci{}: start discovery failed: {}", self.dev_id(), status);
            return status;
        }
        {
            let mut state = self.discovery.lock();
            state.meta = ScanType::LE;
            state.native = ScanType::LE;
            state.retries = 0;
        }
        if was_meta {
            debug!("hci{}: native scanning restarted", self.dev_id());
            return HciStatusCode::Success;
        }
        info!("hci{}: discovery started, policy {:?}", self.dev_id(), policy);
        self.notify_discovering(ScanType::LE, ScanType::LE, true, policy, monotonic_millis());
        HciStatusCode::Success
    }

    pub async fn stop_discovery(&self) -> HciStatusCode {
        let _op = self.discovery_op.lock().await;
        let (was_meta, native, policy) = {
            let mut state = self.discovery.lock();
            let was = state.meta;
            state.meta = ScanType::NONE;
            state.retries = 0;
            (was, state.native, state.policy)
        };
        self.pausing.clear();

        let mut status = HciStatusCode::Success;
        if native.has(ScanType::LE) {
            if let Some(hci) = self.hci() {
                status = hci.le_enable_scan(false, false).await;
                if status.is_success() {
                    self.discovery.lock().native = ScanType::NONE;
                } else {
                    warn!("hci{}: stop discovery failed: {}", self.dev_id(), status);
                }
            }
        }
        if !was_meta.is_empty() {
            info!("hci{}: discovery stopped", self.dev_id());
            self.notify_discovering(ScanType::NONE, ScanType::LE, false, policy, monotonic_millis());
        }
        status
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn current_meta_scan_type(&self) -> ScanType {
        self.discovery.lock().meta
    }

    pub fn current_native_scan_type(&self) -> ScanType {
        self.discovery.lock().native
    }

    pub fn discovery_policy(&self) -> DiscoveryPolicy {
        self.discovery.lock().policy
    }

    /// User-requested discovery is on, native scanning may still be paused
    pub fn is_discovering(&self) -> bool {
        !self.current_meta_scan_type().is_empty()
    }

    /// Devices currently holding discovery paused
    pub fn pausing_discovery_devices(&self) -> Vec<BdAddressAndType> {
        self.pausing.snapshot().as_ref().clone()
    }

    // ------------------------------------------------------------------------
    // Pause and Resume
    // ------------------------------------------------------------------------

    /// Turn native scanning off ahead of LE Create Connection
    pub(crate) async fn pause_discovery_for_connect(&self) {
        let _op = self.discovery_op.lock().await;
        if !self.discovery.lock().native.has(ScanType::LE) {
            return;
        }
        let hci = match self.hci() {
            Some(hci) => hci,
            None => return,
        };
        let status = hci.le_enable_scan(false, false).await;
        if status.is_success() {
            self.discovery.lock().native = ScanType::NONE;
            debug!("hci{}: discovery paused for connect", self.dev_id());
        } else {
            warn!("hci{}: pausing discovery failed: {}", self.dev_id(), status);
        }
    }

    /// Re-enable native scanning if nothing holds it off
    pub(crate) async fn resume_discovery(&self) {
        let _op = self.discovery_op.lock().await;
        let filter_dup = {
            let state = self.discovery.lock();
            if !state.meta.has(ScanType::LE) || !state.native.is_empty() {
                return;
            }
            state.scan_params.filter_duplicates
        };
        if !self.pausing.is_empty() || self.connect_lock.is_locked() {
            return;
        }
        if self.is_advertising() {
            return;
        }
        let hci = match self.powered_hci() {
            Some(hci) => hci,
            None => return,
        };

        let status = hci.le_enable_scan(true, filter_dup).await;
        if status.is_success() {
            let mut state = self.discovery.lock();
            state.native = ScanType::LE;
            state.retries = 0;
            drop(state);
            debug!("hci{}: discovery resumed", self.dev_id());
            return;
        }

        let gave_up = {
            let mut state = self.discovery.lock();
            state.retries += 1;
            if state.retries > self.config().discovery.max_retries {
                state.meta = ScanType::NONE;
                state.retries = 0;
                Some(state.policy)
            } else {
                None
            }
        };
        match gave_up {
            Some(policy) => {
                warn!(
                    "hci{}: giving up on discovery after repeated failures ({})",
                    self.dev_id(),
                    status
                );
                self.notify_discovering(ScanType::NONE, ScanType::LE, false, policy, monotonic_millis());
            }
            None => debug!("hci{}: resume discovery refused: {}", self.dev_id(), status),
        }
    }

    /// Reconciliation tick of the discovery service
    pub(crate) async fn reconcile_discovery(&self) {
        let idle = {
            let state = self.discovery.lock();
            state.meta.has(ScanType::LE) && state.native.is_empty()
        };
        if idle {
            self.resume_discovery().await;
        }
    }

    /// Controller reported a scan state change
    pub(crate) async fn on_native_discovering(&self, scan_type: ScanType, enabled: bool) {
        let policy = {
            let mut state = self.discovery.lock();
            if enabled {
                state.native |= scan_type;
            } else {
                state.native.remove(scan_type);
            }
            state.policy
        };
        debug!("hci{}: native discovery {:?} {}", self.dev_id(), scan_type, enabled);
        if !enabled && policy == DiscoveryPolicy::AlwaysOn {
            self.resume_discovery().await;
        }
    }

    /// Policy step for a new connection, run before the connect slot is released
    pub(crate) fn discovery_on_connected(&self, id: &BdAddressAndType) {
        let (meta, policy) = {
            let state = self.discovery.lock();
            (state.meta, state.policy)
        };
        if meta.is_empty() {
            return;
        }
        match policy {
            DiscoveryPolicy::AutoOff => {
                self.discovery.lock().meta = ScanType::NONE;
                debug!("hci{}: discovery auto-off after connect of {}", self.dev_id(), id);
                self.notify_discovering(ScanType::NONE, ScanType::LE, false, policy, monotonic_millis());
            }
            DiscoveryPolicy::AlwaysOn => {}
            _ => {
                if self.pausing.push_unique(*id, |a, b| a == b) {
                    debug!(
                        "hci{}: {} pauses discovery ({} pausing)",
                        self.dev_id(),
                        id,
                        self.pausing.len()
                    );
                }
            }
        }
    }

    /// Lift the pause held by `id` if `reason` releases it under the current policy
    pub(crate) async fn unpause_discovery(&self, id: &BdAddressAndType, reason: PauseRelease) {
        let policy = self.discovery.lock().policy;
        if !reason.releases(policy) {
            return;
        }
        if self.remove_from_pausing(id) {
            self.resume_discovery().await;
        }
    }

    /// Drop `id` from the pausing set, `true` when this emptied it
    pub(crate) fn remove_from_pausing(&self, id: &BdAddressAndType) -> bool {
        if self.pausing.remove_first(|e| e == id).is_none() {
            return false;
        }
        debug!(
            "hci{}: {} released discovery ({} pausing)",
            self.dev_id(),
            id,
            self.pausing.len()
        );
        self.pausing.is_empty()
    }

    pub(crate) fn reset_discovery(&self) {
        let mut state = self.discovery.lock();
        state.meta = ScanType::NONE;
        state.native = ScanType::NONE;
        state.retries = 0;
        drop(state);
        self.pausing.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_rules_follow_policy() {
        use DiscoveryPolicy::*;
        assert!(PauseRelease::Disconnected.releases(PauseConnectedUntilDisconnected));
        assert!(!PauseRelease::Ready.releases(PauseConnectedUntilDisconnected));
        assert!(PauseRelease::Ready.releases(PauseConnectedUntilReady));
        assert!(!PauseRelease::Paired.releases(PauseConnectedUntilReady));
        assert!(PauseRelease::Paired.releases(PauseConnectedUntilPaired));
        assert!(PauseRelease::Ready.releases(PauseConnectedUntilPaired));
    }

    #[test]
    fn state_starts_off() {
        let state = DiscoveryState::new(ScanParams::default());
        assert!(state.meta.is_empty());
        assert!(state.native.is_empty());
        assert_eq!(state.policy, DiscoveryPolicy::PauseConnectedUntilReady);
    }
}
