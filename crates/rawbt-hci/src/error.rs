//! Error types for the HCI engine and L2CAP channels

use rawbt_core::{BtError, HciStatusCode, PacketError, TransportError};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors raised by the HCI command/event engine itself
#[derive(Error, Debug)]
pub enum HciError {
    #[error("HCI handler for hci{dev_id} is not open")]
    NotOpen { dev_id: u16 },

    #[error("No tokio runtime available to drive the HCI handler")]
    NoRuntime,

    #[error("Controller initialisation failed at {step}: {status}")]
    InitFailed {
        step: &'static str,
        status: HciStatusCode,
    },

    #[error("Malformed command reply: {0}")]
    InvalidReply(#[from] PacketError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors of a fixed L2CAP channel
#[derive(Error, Debug)]
pub enum L2capError {
    #[error("L2CAP read timed out")]
    Timeout,

    #[error("L2CAP read interrupted")]
    Interrupted,

    #[error("L2CAP channel closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<HciError> for BtError {
    fn from(err: HciError) -> Self {
        match err {
            HciError::Transport(e) => BtError::Transport(e),
            HciError::InitFailed { step, status } => BtError::rejected(step, status),
            HciError::InvalidReply(e) => BtError::InvalidPacket(e),
            other => BtError::illegal_state(other.to_string()),
        }
    }
}

impl From<L2capError> for BtError {
    fn from(err: L2capError) -> Self {
        match err {
            L2capError::Transport(e) => BtError::Transport(e),
            L2capError::Timeout => BtError::Transport(TransportError::Timeout { duration_ms: 0 }),
            L2capError::Interrupted => BtError::Transport(TransportError::Interrupted),
            L2capError::Closed => BtError::Transport(TransportError::Closed),
        }
    }
}

pub type HciResult<T> = std::result::Result<T, HciError>;
