//! rawbt test harness
//!
//! A simulated controller that speaks H4 to the HCI engine, a scripted SMP
//! responder and packet builders, so the stack can be exercised end to end
//! without hardware.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod controller;
pub mod crypto;
pub mod packets;
pub mod smp_peer;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use controller::{MockController, MockControllerConfig, MockControllers, MockIndexWatcher};
pub use crypto::FakeSmpCrypto;
pub use smp_peer::{SmpPeer, SmpPeerConfig};

/// Install a test subscriber honouring `RUST_LOG`, once per process
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
