//! rawbt Runtime
//!
//! Orchestration layer of the rawbt Bluetooth Host stack:
//! - `BtManager`: owns one adapter per controller index and tracks hot-plug
//! - `BtAdapter`: power, discovery policy, advertising, whitelist and the
//!   per-adapter event worker
//! - `BtDevice`: remote device connection and readiness state machine
//! - `smp`: LE Security Manager sessions and the persistent key store
//!
//! Wire formats and the HCI command layer live in `rawbt-core` and
//! `rawbt-hci`; this crate turns their events into listener callbacks.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod adapter;
pub(crate) mod cow;
pub mod device;
pub mod gatt;
pub mod listener;
pub mod manager;
pub mod smp;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use adapter::{BtAdapter, ConnectWait};
pub use device::{BtDevice, DeviceState};
pub use gatt::{GattConnector, GattError, GattService, GattSession, NoGatt};
pub use listener::{AdapterStatusListener, ChangedAdapterSetListener, StatusListenerRef};
pub use manager::{AdapterSetListenerRef, BtManager};
pub use smp::KeyStore;

// Re-export core types for convenience
pub use rawbt_core::{
    BdAddressAndType, BtError, BtRole, DiscoveryPolicy, HciStatusCode, Result, ScanType,
    StackConfig,
};
