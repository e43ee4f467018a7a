//! Error types for the rawbt host stack
//!
//! Parse-time protocol errors, transport errors and key-store errors are kept
//! in separate enums and unified by [`BtError`]. Controller-rejected results are
//! not errors: they travel as [`crate::HciStatusCode`] values.

use std::path::PathBuf;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Malformed or unexpected packet content, raised while decoding
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Packet too short (expected at least {expected}, got {actual})")]
    TooShort { expected: usize, actual: usize },
    #[error("Packet length mismatch: header says {declared}, payload has {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Unknown HCI packet type: 0x{packet_type:02x}")]
    UnknownPacketType { packet_type: u8 },
    #[error("Unsupported HCI packet type: 0x{packet_type:02x}")]
    UnsupportedPacketType { packet_type: u8 },
    #[error("Unknown SMP opcode: 0x{opcode:02x}")]
    UnknownSmpOpcode { opcode: u8 },
    #[error("Value out of range for {field}: {value}")]
    OutOfRange { field: &'static str, value: u32 },
    #[error("Parameters too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("{message}")]
    Generic { message: String },
}

impl From<&str> for PacketError {
    fn from(message: &str) -> Self {
        PacketError::Generic {
            message: message.to_string(),
        }
    }
}

/// Socket-level failures
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to open {what} for hci{dev_id}: {reason}")]
    OpenFailed {
        what: &'static str,
        dev_id: u16,
        reason: String,
    },
    #[error("Permission denied opening Bluetooth socket")]
    PermissionDenied,
    #[error("Transport is closed")]
    Closed,
    #[error("Read interrupted")]
    Interrupted,
    #[error("Transport timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
}

/// Persisted key file failures
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("Key file I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid key file {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
    #[error("No key directory configured")]
    NoKeyDirectory,
    #[error("Key material is not valid: {reason}")]
    InvalidKeys { reason: String },
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Core error type for the rawbt stack
#[derive(Debug, thiserror::Error)]
pub enum BtError {
    #[error("Invalid packet: {0}")]
    InvalidPacket(#[from] PacketError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    #[error("Controller rejected {operation}: {status}")]
    Rejected {
        operation: String,
        status: crate::HciStatusCode,
    },

    #[error("Illegal state: {reason}")]
    IllegalState { reason: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Channel error: {message}")]
    Channel { message: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl BtError {
    /// Create an invalid packet error with a message
    pub fn invalid_packet<T: Into<String>>(message: T) -> Self {
        BtError::InvalidPacket(PacketError::Generic {
            message: message.into(),
        })
    }

    /// Create an illegal-state error
    pub fn illegal_state<T: Into<String>>(reason: T) -> Self {
        BtError::IllegalState {
            reason: reason.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        BtError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        BtError::Channel {
            message: message.into(),
        }
    }

    /// Wrap a controller status for a named operation
    pub fn rejected<T: Into<String>>(operation: T, status: crate::HciStatusCode) -> Self {
        BtError::Rejected {
            operation: operation.into(),
            status,
        }
    }
}

impl From<std::io::Error> for BtError {
    fn from(err: std::io::Error) -> Self {
        BtError::Transport(TransportError::Io(err))
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, BtError>;
pub type BtResult<T> = Result<T>;
