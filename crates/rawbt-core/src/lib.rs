//! rawbt core types and codecs
//!
//! This crate provides the wire-level building blocks of the rawbt host stack:
//! addresses and adapter enums, HCI packet framing and event decoding, EIR
//! parsing, connection parameter math, L2CAP framing, SMP PDUs and key
//! material, the persisted key bin and the stack configuration.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod errors;
pub mod protocol;
pub mod smp;
pub mod status;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{
    ConnectionConfig, DiscoveryConfig, HciConfig, KeyStoreConfig, SecurityTier, SmpConfig,
    StackConfig,
};
pub use errors::{BtError, BtResult, KeyStoreError, PacketError, Result, TransportError};
pub use status::HciStatusCode;
pub use types::{
    monotonic_millis, AdapterSetting, BdAddress, BdAddressAndType, BdAddressType, BtMode, BtRole,
    DiscoveryPolicy, HciWhitelistConnectType, LeFeatures, ScanType,
};
