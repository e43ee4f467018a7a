//! Core types for the rawbt host stack
//!
//! Addresses, address types and the small enums shared by every layer. Device
//! identity is the immutable `(address, address-type)` pair [`BdAddressAndType`].

use core::fmt;
use core::str::FromStr;
use std::sync::OnceLock;
use std::time::Instant;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::errors::{BtError, Result};

// ----------------------------------------------------------------------------
// Bluetooth Device Address
// ----------------------------------------------------------------------------

/// 48-bit Bluetooth device address, stored little-endian as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct BdAddress([u8; 6]);

impl BdAddress {
    /// All-zero address
    pub const ANY: Self = Self([0u8; 6]);

    /// Create from wire-order (little-endian) bytes
    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Create from display-order (most significant byte first) bytes
    pub fn from_be_bytes(mut bytes: [u8; 6]) -> Self {
        bytes.reverse();
        Self(bytes)
    }

    /// Read an address from the first six bytes of a buffer
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 6 {
            return Err(BtError::invalid_packet("address requires 6 bytes"));
        }
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&bytes[..6]);
        Ok(Self(addr))
    }

    /// Wire-order bytes
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Display-order bytes
    pub fn to_be_bytes(&self) -> [u8; 6] {
        let mut out = self.0;
        out.reverse();
        out
    }

    /// Random static or resolvable address sub-type, judged by the two top bits
    pub fn random_sub_type(&self) -> RandomAddressType {
        match self.0[5] >> 6 {
            0b00 => RandomAddressType::NonResolvablePrivate,
            0b01 => RandomAddressType::ResolvablePrivate,
            0b11 => RandomAddressType::Static,
            _ => RandomAddressType::Reserved,
        }
    }

    /// Upper-case, underscore separated form used in key file names
    pub fn to_file_component(&self) -> String {
        self.to_be_bytes()
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join("_")
    }
}

impl fmt::Display for BdAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.to_be_bytes();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for BdAddress {
    type Err = BtError;

    fn from_str(s: &str) -> Result<Self> {
        let clean: String = s.chars().filter(|c| *c != ':' && *c != '_' && *c != '-').collect();
        let bytes =
            hex::decode(&clean).map_err(|_| BtError::invalid_packet("Invalid hex in BdAddress"))?;
        if bytes.len() != 6 {
            return Err(BtError::invalid_packet("BdAddress must be exactly 6 bytes"));
        }
        let mut be = [0u8; 6];
        be.copy_from_slice(&bytes);
        Ok(Self::from_be_bytes(be))
    }
}

/// Random address sub-types for `BdAddressType::LeRandom`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandomAddressType {
    NonResolvablePrivate,
    ResolvablePrivate,
    Static,
    Reserved,
}

// ----------------------------------------------------------------------------
// Address Type
// ----------------------------------------------------------------------------

/// Address type as used by the management interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BdAddressType {
    BdAddrBredr = 0x00,
    BdAddrLePublic = 0x01,
    BdAddrLeRandom = 0x02,
    BdAddrUndefined = 0xff,
}

impl BdAddressType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::BdAddrBredr,
            0x01 => Self::BdAddrLePublic,
            0x02 => Self::BdAddrLeRandom,
            _ => Self::BdAddrUndefined,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Map an HCI LE address type (0 public, 1 random, 2/3 identity) to ours
    pub fn from_hci_le(value: u8) -> Self {
        match value {
            0x00 | 0x02 => Self::BdAddrLePublic,
            0x01 | 0x03 => Self::BdAddrLeRandom,
            _ => Self::BdAddrUndefined,
        }
    }

    /// HCI LE address type for outbound commands
    pub fn to_hci_le(self) -> u8 {
        match self {
            Self::BdAddrLeRandom => 0x01,
            _ => 0x00,
        }
    }

    pub fn is_le(self) -> bool {
        matches!(self, Self::BdAddrLePublic | Self::BdAddrLeRandom)
    }
}

/// Immutable device identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BdAddressAndType {
    pub address: BdAddress,
    pub address_type: BdAddressType,
}

impl BdAddressAndType {
    pub fn new(address: BdAddress, address_type: BdAddressType) -> Self {
        Self {
            address,
            address_type,
        }
    }

    pub fn is_le(&self) -> bool {
        self.address_type.is_le()
    }
}

impl fmt::Display for BdAddressAndType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {:?}]", self.address, self.address_type)
    }
}

// ----------------------------------------------------------------------------
// Adapter Modes and Roles
// ----------------------------------------------------------------------------

/// Operating mode of an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BtMode {
    #[default]
    None,
    Dual,
    Bredr,
    Le,
}

/// Local role, Master while discovering/connecting and Slave while advertising
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BtRole {
    #[default]
    None,
    Master,
    Slave,
}

impl BtRole {
    /// HCI connection role byte (0 central, 1 peripheral)
    pub fn from_hci(role: u8) -> Self {
        match role {
            0x00 => BtRole::Master,
            0x01 => BtRole::Slave,
            _ => BtRole::None,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            BtRole::Master => BtRole::Slave,
            BtRole::Slave => BtRole::Master,
            BtRole::None => BtRole::None,
        }
    }
}

bitflags! {
    /// Scan type bitmask, `NONE` meaning discovery is off
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ScanType: u8 {
        const BREDR = 1 << 0;
        const LE = 1 << 1;
        const DUAL = Self::BREDR.bits() | Self::LE.bits();
    }
}

impl ScanType {
    pub const NONE: Self = Self::empty();

    pub fn has(self, other: ScanType) -> bool {
        !other.is_empty() && self.contains(other)
    }
}

bitflags! {
    /// Adapter setting bits as reported by the management interface
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct AdapterSetting: u32 {
        const POWERED = 1 << 0;
        const CONNECTABLE = 1 << 1;
        const FAST_CONNECTABLE = 1 << 2;
        const DISCOVERABLE = 1 << 3;
        const BONDABLE = 1 << 4;
        const LINK_SECURITY = 1 << 5;
        const SSP = 1 << 6;
        const BREDR = 1 << 7;
        const HS = 1 << 8;
        const LE = 1 << 9;
        const ADVERTISING = 1 << 10;
        const SECURE_CONN = 1 << 11;
        const DEBUG_KEYS = 1 << 12;
        const PRIVACY = 1 << 13;
        const CONFIGURATION = 1 << 14;
        const STATIC_ADDRESS = 1 << 15;
        const PHY_CONFIGURATION = 1 << 16;
    }
}

impl AdapterSetting {
    /// Derive the adapter mode from its LE/BREDR bits
    pub fn bt_mode(self) -> BtMode {
        match (self.contains(Self::LE), self.contains(Self::BREDR)) {
            (true, true) => BtMode::Dual,
            (true, false) => BtMode::Le,
            (false, true) => BtMode::Bredr,
            (false, false) => BtMode::None,
        }
    }
}

// ----------------------------------------------------------------------------
// Discovery Policy
// ----------------------------------------------------------------------------

/// What discovery does while devices connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryPolicy {
    /// Leave discovery off after a connection
    AutoOff,
    /// Pause until the device disconnects
    PauseConnectedUntilDisconnected,
    /// Pause until the device is ready or disconnects
    #[default]
    PauseConnectedUntilReady,
    /// Pause until pairing completes, the device is ready or disconnects
    PauseConnectedUntilPaired,
    /// Re-enable whenever the controller turns discovery off
    AlwaysOn,
}

impl DiscoveryPolicy {
    /// Legacy two-valued `keep_alive` flag
    pub fn from_keep_alive(keep_alive: bool) -> Self {
        if keep_alive {
            Self::PauseConnectedUntilReady
        } else {
            Self::AutoOff
        }
    }

    pub fn is_pausing(self) -> bool {
        matches!(
            self,
            Self::PauseConnectedUntilDisconnected
                | Self::PauseConnectedUntilReady
                | Self::PauseConnectedUntilPaired
        )
    }
}

/// Whitelist auto-connect behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HciWhitelistConnectType {
    /// Report only, never auto-connect
    ReportOnly,
    /// Connect automatically when seen
    AutoConnectAlways,
    /// Connect when seen while discovery is active
    AutoConnectDirect,
}

bitflags! {
    /// LE link layer feature bits (first octet set of the 64-bit mask)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct LeFeatures: u64 {
        const LE_ENCRYPTION = 1 << 0;
        const CONN_PARAM_REQ_PROC = 1 << 1;
        const EXT_REJ_IND = 1 << 2;
        const SLAVE_FEAT_EXCHANGE = 1 << 3;
        const LE_PING = 1 << 4;
        const LE_DATA_PACKET_LENGTH_EXT = 1 << 5;
        const LL_PRIVACY = 1 << 6;
        const EXT_SCAN_FILTER_POLICY = 1 << 7;
        const LE_2M_PHY = 1 << 8;
        const STABLE_MOD_IDX_TX = 1 << 9;
        const STABLE_MOD_IDX_RX = 1 << 10;
        const LE_CODED_PHY = 1 << 11;
        const LE_EXT_ADV = 1 << 12;
        const LE_PERIODIC_ADV = 1 << 13;
        const CHAN_SEL_ALGO_2 = 1 << 14;
        const LE_PWR_CLASS_1 = 1 << 15;
        const MIN_NUM_USED_CHAN_PROC = 1 << 16;
    }
}

// ----------------------------------------------------------------------------
// Timestamps
// ----------------------------------------------------------------------------

fn process_start() -> &'static Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now)
}

/// Monotonic milliseconds since the stack was first used in this process
pub fn monotonic_millis() -> u64 {
    process_start().elapsed().as_millis() as u64
}

/// Wall clock seconds since the unix epoch, 0 if the clock is before it
pub fn unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display_and_parse() {
        let addr: BdAddress = "C0:26:DA:01:02:03".parse().expect("valid address");
        assert_eq!(addr.as_bytes(), &[0x03, 0x02, 0x01, 0xDA, 0x26, 0xC0]);
        assert_eq!(addr.to_string(), "C0:26:DA:01:02:03");
        assert_eq!(addr.to_file_component(), "C0_26_DA_01_02_03");
        assert_eq!(addr.random_sub_type(), RandomAddressType::Static);
    }

    #[test]
    fn address_parse_rejects_short_input() {
        assert!("C0:26:DA".parse::<BdAddress>().is_err());
        assert!("zz:26:DA:01:02:03".parse::<BdAddress>().is_err());
    }

    #[test]
    fn hci_le_address_type_mapping() {
        assert_eq!(BdAddressType::from_hci_le(0), BdAddressType::BdAddrLePublic);
        assert_eq!(BdAddressType::from_hci_le(1), BdAddressType::BdAddrLeRandom);
        assert_eq!(BdAddressType::BdAddrLeRandom.to_hci_le(), 1);
        assert!(!BdAddressType::BdAddrBredr.is_le());
    }

    #[test]
    fn keep_alive_maps_to_policy() {
        assert_eq!(DiscoveryPolicy::from_keep_alive(false), DiscoveryPolicy::AutoOff);
        assert_eq!(
            DiscoveryPolicy::from_keep_alive(true),
            DiscoveryPolicy::PauseConnectedUntilReady
        );
        assert!(!DiscoveryPolicy::AlwaysOn.is_pausing());
    }

    #[test]
    fn settings_to_mode() {
        let s = AdapterSetting::POWERED | AdapterSetting::LE;
        assert_eq!(s.bt_mode(), BtMode::Le);
        assert_eq!((s | AdapterSetting::BREDR).bt_mode(), BtMode::Dual);
        assert!(ScanType::DUAL.has(ScanType::LE));
        assert!(!ScanType::NONE.has(ScanType::NONE));
    }
}
