//! Pairing watchdog
//!
//! A ticker posts [`Job::WatchdogTick`] to the adapter worker at the
//! configured interval; the worker then aborts every pairing that has been
//! mid-exchange for longer than the pairing timeout.

use std::time::Duration;

use rawbt_core::monotonic_millis;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::adapter::worker::{run_ticker, Job};
use crate::adapter::BtAdapter;

pub(crate) async fn run_pairing_watchdog(
    jobs: mpsc::UnboundedSender<Job>,
    period: Duration,
    stop: watch::Receiver<bool>,
) {
    run_ticker("pairing watchdog", jobs, period, || Job::WatchdogTick, stop).await
}

impl BtAdapter {
    /// Fail pairings stuck past the configured timeout
    pub(crate) async fn check_pairing_timeouts(&self) {
        let hci = match self.hci() {
            Some(hci) => hci,
            None => return,
        };
        let timeout_ms = self.config().smp.pairing_timeout.as_millis() as u64;
        let now = monotonic_millis();
        for device in self.registry.connected_devices() {
            if device
                .check_pairing_timeout(self, &hci, now, timeout_ms)
                .await
            {
                debug!("hci{}: watchdog aborted pairing of {}", self.dev_id(), device.address_and_type());
            }
        }
    }
}
