//! HCI status codes
//!
//! Controller error codes (Core Spec Vol 1 Part F) plus three host-internal
//! values in the reserved range.

use core::fmt;

macro_rules! status_codes {
    ($($name:ident = $value:expr),* $(,)?) => {
        /// Status returned by the controller or synthesised by the host
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum HciStatusCode {
            $($name = $value,)*
        }

        impl HciStatusCode {
            /// Decode a status byte, unknown values map to `Unknown`
            pub fn from_u8(value: u8) -> Self {
                match value {
                    $($value => Self::$name,)*
                    _ => Self::Unknown,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$name => stringify!($name),)*
                }
            }
        }
    };
}

status_codes! {
    Success = 0x00,
    UnknownHciCommand = 0x01,
    UnknownConnectionIdentifier = 0x02,
    HardwareFailure = 0x03,
    PageTimeout = 0x04,
    AuthenticationFailure = 0x05,
    PinOrKeyMissing = 0x06,
    MemoryCapacityExceeded = 0x07,
    ConnectionTimeout = 0x08,
    ConnectionLimitExceeded = 0x09,
    SynConnectionLimitToADeviceExceeded = 0x0a,
    ConnectionAlreadyExists = 0x0b,
    CommandDisallowed = 0x0c,
    ConnectionRejectedLimitedResources = 0x0d,
    ConnectionRejectedSecurity = 0x0e,
    ConnectionRejectedUnacceptableBdAddr = 0x0f,
    ConnectionAcceptTimeoutExceeded = 0x10,
    UnsupportedFeatureOrParamValue = 0x11,
    InvalidHciCommandParameters = 0x12,
    RemoteUserTerminatedConnection = 0x13,
    RemoteDeviceTerminatedConnectionLowResources = 0x14,
    RemoteDeviceTerminatedConnectionPowerOff = 0x15,
    ConnectionTerminatedByLocalHost = 0x16,
    RepeatedAttempts = 0x17,
    PairingNotAllowed = 0x18,
    UnknownLmpPdu = 0x19,
    UnsupportedRemoteOrLmpFeature = 0x1a,
    ScoOffsetRejected = 0x1b,
    ScoIntervalRejected = 0x1c,
    ScoAirModeRejected = 0x1d,
    InvalidLmpOrLlParameters = 0x1e,
    UnspecifiedError = 0x1f,
    UnsupportedLmpOrLlParameterValue = 0x20,
    RoleChangeNotAllowed = 0x21,
    LmpOrLlResponseTimeout = 0x22,
    LmpOrLlCollision = 0x23,
    LmpPduNotAllowed = 0x24,
    EncryptionModeNotAcceptable = 0x25,
    LinkKeyCannotBeChanged = 0x26,
    RequestedQosNotSupported = 0x27,
    InstantPassed = 0x28,
    PairingWithUnitKeyNotSupported = 0x29,
    DifferentTransactionCollision = 0x2a,
    QosUnacceptableParameter = 0x2c,
    QosRejected = 0x2d,
    ChannelAssessmentNotSupported = 0x2e,
    InsufficientSecurity = 0x2f,
    ParameterOutOfRange = 0x30,
    RoleSwitchPending = 0x32,
    ReservedSlotViolation = 0x34,
    RoleSwitchFailed = 0x35,
    EirTooLarge = 0x36,
    SimplePairingNotSupportedByHost = 0x37,
    HostBusyPairing = 0x38,
    ConnectionRejectedNoSuitableChannel = 0x39,
    ControllerBusy = 0x3a,
    UnacceptableConnectionParam = 0x3b,
    AdvertisingTimeout = 0x3c,
    ConnectionTerminatedMicFailure = 0x3d,
    ConnectionEstFailedOrSyncTimeout = 0x3e,
    MaxConnectionFailed = 0x3f,
    CoarseClockAdjRejected = 0x40,
    Type0SubmapNotDefined = 0x41,
    UnknownAdvertisingIdentifier = 0x42,
    LimitReached = 0x43,
    OperationCancelledByHost = 0x44,
    PacketTooLong = 0x45,
    InternalTimeout = 0xfd,
    InternalFailure = 0xfe,
    Unknown = 0xff,
}

impl HciStatusCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_success(self) -> bool {
        self == HciStatusCode::Success
    }
}

impl Default for HciStatusCode {
    fn default() -> Self {
        HciStatusCode::Success
    }
}

impl fmt::Display for HciStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02x})", self.name(), self.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_and_unknown() {
        assert_eq!(HciStatusCode::from_u8(0x0e), HciStatusCode::ConnectionRejectedSecurity);
        assert_eq!(HciStatusCode::from_u8(0x0b), HciStatusCode::ConnectionAlreadyExists);
        assert_eq!(HciStatusCode::from_u8(0x2b), HciStatusCode::Unknown);
        assert_eq!(HciStatusCode::InternalTimeout.as_u8(), 0xfd);
    }

    #[test]
    fn display_names_status() {
        assert_eq!(
            HciStatusCode::CommandDisallowed.to_string(),
            "CommandDisallowed (0x0c)"
        );
    }
}
