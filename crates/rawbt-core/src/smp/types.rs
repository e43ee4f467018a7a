//! Security manager enums and bit sets

use core::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Security Level
// ----------------------------------------------------------------------------

/// Requested or negotiated link security
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BtSecurityLevel {
    #[default]
    Unset = 0,
    /// No encryption, no authentication
    None = 1,
    /// Encryption without MITM protection
    EncOnly = 2,
    /// Encryption with MITM protection
    EncAuth = 3,
    /// Secure Connections with MITM protection
    EncAuthFips = 4,
}

impl BtSecurityLevel {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::None,
            2 => Self::EncOnly,
            3 => Self::EncAuth,
            4 => Self::EncAuthFips,
            _ => Self::Unset,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether this level asks for an encrypted link
    pub fn requires_encryption(self) -> bool {
        self >= Self::EncOnly
    }
}

// ----------------------------------------------------------------------------
// IO Capability
// ----------------------------------------------------------------------------

/// SMP IO capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SmpIoCapability {
    DisplayOnly = 0x00,
    DisplayYesNo = 0x01,
    KeyboardOnly = 0x02,
    #[default]
    NoInputNoOutput = 0x03,
    KeyboardDisplay = 0x04,
    Unset = 0xff,
}

impl SmpIoCapability {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::DisplayOnly,
            0x01 => Self::DisplayYesNo,
            0x02 => Self::KeyboardOnly,
            0x03 => Self::NoInputNoOutput,
            0x04 => Self::KeyboardDisplay,
            _ => Self::Unset,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    fn has_display(self) -> bool {
        matches!(
            self,
            Self::DisplayOnly | Self::DisplayYesNo | Self::KeyboardDisplay
        )
    }

    fn has_keyboard(self) -> bool {
        matches!(self, Self::KeyboardOnly | Self::KeyboardDisplay)
    }
}

// ----------------------------------------------------------------------------
// Pairing State and Mode
// ----------------------------------------------------------------------------

/// SMP pairing progress, monotonic within one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SmpPairingState {
    #[default]
    None,
    FeatureExchangeStarted,
    FeatureExchangeCompleted,
    PasskeyExpected,
    NumericCompareExpected,
    OobExpected,
    KeyDistribution,
    Completed,
    Failed,
}

impl SmpPairingState {
    /// Mid-exchange states watched by the pairing watchdog
    pub fn is_in_progress(self) -> bool {
        !matches!(self, Self::None | Self::Completed | Self::Failed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for SmpPairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Pairing association model, `Ini`/`Res` naming the side that inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PairingMode {
    #[default]
    None,
    Negotiating,
    JustWorks,
    PasskeyEntryIni,
    PasskeyEntryRes,
    NumericCompareIni,
    OutOfBand,
    PrePaired,
}

impl PairingMode {
    /// Association model for the given initiator/responder capabilities.
    ///
    /// Falls back to Just Works when neither side asks for MITM protection or
    /// when the capabilities cannot support anything stronger.
    pub fn determine(
        initiator: SmpIoCapability,
        responder: SmpIoCapability,
        mitm: bool,
        secure_connections: bool,
        oob: bool,
    ) -> Self {
        use SmpIoCapability::*;
        if oob {
            return PairingMode::OutOfBand;
        }
        if !mitm {
            return PairingMode::JustWorks;
        }
        match (initiator, responder) {
            (NoInputNoOutput, _) | (_, NoInputNoOutput) => PairingMode::JustWorks,
            (Unset, _) | (_, Unset) => PairingMode::JustWorks,
            (DisplayOnly, DisplayOnly) | (DisplayOnly, DisplayYesNo) | (DisplayYesNo, DisplayOnly) => {
                PairingMode::JustWorks
            }
            (DisplayYesNo, DisplayYesNo)
            | (DisplayYesNo, KeyboardDisplay)
            | (KeyboardDisplay, DisplayYesNo)
            | (KeyboardDisplay, KeyboardDisplay)
                if secure_connections =>
            {
                PairingMode::NumericCompareIni
            }
            (DisplayYesNo, DisplayYesNo) => PairingMode::JustWorks,
            (i, r) => {
                // Passkey entry: the side with a keyboard and no display
                // inputs; when both can input the responder does
                if i.has_keyboard() && !(i.has_display() && r.has_keyboard()) {
                    PairingMode::PasskeyEntryIni
                } else {
                    PairingMode::PasskeyEntryRes
                }
            }
        }
    }

    pub fn is_authenticated(self) -> bool {
        matches!(
            self,
            Self::PasskeyEntryIni | Self::PasskeyEntryRes | Self::NumericCompareIni | Self::OutOfBand
        )
    }
}

// ----------------------------------------------------------------------------
// Bit Sets
// ----------------------------------------------------------------------------

bitflags! {
    /// SMP AuthReq field
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SmpAuthReqs: u8 {
        const BONDING = 0x01;
        const MITM = 0x04;
        const SECURE_CONNECTIONS = 0x08;
        const KEYPRESS = 0x10;
        const CT2 = 0x20;
    }
}

bitflags! {
    /// Key distribution / presence mask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SmpKeyType: u8 {
        const ENC_KEY = 0x01;
        const ID_KEY = 0x02;
        const SIGN_KEY = 0x04;
        const LINK_KEY = 0x08;
    }
}

// ----------------------------------------------------------------------------
// Pairing Failed Reasons
// ----------------------------------------------------------------------------

/// Reason code carried by Pairing Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SmpReason {
    PasskeyEntryFailed = 0x01,
    OobNotAvailable = 0x02,
    AuthenticationRequirements = 0x03,
    ConfirmValueFailed = 0x04,
    PairingNotSupported = 0x05,
    EncryptionKeySize = 0x06,
    CommandNotSupported = 0x07,
    UnspecifiedReason = 0x08,
    RepeatedAttempts = 0x09,
    InvalidParameters = 0x0A,
    DhKeyCheckFailed = 0x0B,
    NumericComparisonFailed = 0x0C,
    BredrPairingInProgress = 0x0D,
    CrossTransportKeyNotAllowed = 0x0E,
    Unknown = 0xFF,
}

impl SmpReason {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::PasskeyEntryFailed,
            0x02 => Self::OobNotAvailable,
            0x03 => Self::AuthenticationRequirements,
            0x04 => Self::ConfirmValueFailed,
            0x05 => Self::PairingNotSupported,
            0x06 => Self::EncryptionKeySize,
            0x07 => Self::CommandNotSupported,
            0x08 => Self::UnspecifiedReason,
            0x09 => Self::RepeatedAttempts,
            0x0A => Self::InvalidParameters,
            0x0B => Self::DhKeyCheckFailed,
            0x0C => Self::NumericComparisonFailed,
            0x0D => Self::BredrPairingInProgress,
            0x0E => Self::CrossTransportKeyNotAllowed,
            _ => Self::Unknown,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SmpIoCapability::*;

    #[test]
    fn association_model_table() {
        assert_eq!(
            PairingMode::determine(KeyboardDisplay, NoInputNoOutput, true, true, false),
            PairingMode::JustWorks
        );
        assert_eq!(
            PairingMode::determine(DisplayYesNo, DisplayYesNo, true, true, false),
            PairingMode::NumericCompareIni
        );
        assert_eq!(
            PairingMode::determine(DisplayYesNo, DisplayYesNo, true, false, false),
            PairingMode::JustWorks
        );
        assert_eq!(
            PairingMode::determine(KeyboardOnly, DisplayOnly, true, false, false),
            PairingMode::PasskeyEntryIni
        );
        assert_eq!(
            PairingMode::determine(DisplayOnly, KeyboardOnly, true, true, false),
            PairingMode::PasskeyEntryRes
        );
        assert_eq!(
            PairingMode::determine(KeyboardDisplay, KeyboardDisplay, true, false, false),
            PairingMode::PasskeyEntryRes
        );
        assert_eq!(
            PairingMode::determine(KeyboardDisplay, DisplayOnly, true, true, false),
            PairingMode::PasskeyEntryIni
        );
        assert_eq!(
            PairingMode::determine(KeyboardOnly, KeyboardOnly, false, true, false),
            PairingMode::JustWorks
        );
    }

    #[test]
    fn security_level_ordering() {
        assert!(BtSecurityLevel::EncAuthFips > BtSecurityLevel::EncOnly);
        assert!(!BtSecurityLevel::None.requires_encryption());
        assert!(BtSecurityLevel::EncOnly.requires_encryption());
        assert_eq!(BtSecurityLevel::from_u8(9), BtSecurityLevel::Unset);
    }

    #[test]
    fn pairing_state_progress() {
        assert!(SmpPairingState::KeyDistribution.is_in_progress());
        assert!(!SmpPairingState::Completed.is_in_progress());
        assert!(SmpPairingState::Failed.is_terminal());
    }
}
