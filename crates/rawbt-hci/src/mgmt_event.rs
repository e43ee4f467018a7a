//! Uniform management events
//!
//! Every HCI event the host cares about is translated into one
//! [`MgmtEventData`] variant, stamped with the arrival time and the adapter
//! index. Subscribers register per [`MgmtEventKind`].

use rawbt_core::protocol::EInfoReport;
use rawbt_core::smp::{SmpLongTermKey, SmpPdu};
use rawbt_core::{BdAddressAndType, BtRole, HciStatusCode, LeFeatures, ScanType};

/// One translated event
#[derive(Debug, Clone, PartialEq)]
pub struct MgmtEvent {
    pub dev_id: u16,
    /// Monotonic milliseconds at arrival
    pub timestamp: u64,
    pub data: MgmtEventData,
}

impl MgmtEvent {
    pub fn new(dev_id: u16, timestamp: u64, data: MgmtEventData) -> Self {
        Self {
            dev_id,
            timestamp,
            data,
        }
    }

    pub fn kind(&self) -> MgmtEventKind {
        self.data.kind()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MgmtEventData {
    DeviceFound(Box<EInfoReport>),
    DeviceConnected {
        peer: BdAddressAndType,
        handle: u16,
        /// Local role on the link
        role: BtRole,
        interval: u16,
        latency: u16,
        supervision_timeout: u16,
    },
    ConnectFailed {
        peer: BdAddressAndType,
        status: HciStatusCode,
    },
    DeviceDisconnected {
        /// Known when the connection was tracked by this engine
        peer: Option<BdAddressAndType>,
        handle: u16,
        reason: HciStatusCode,
    },
    Discovering {
        scan_type: ScanType,
        enabled: bool,
    },
    Advertising {
        enabled: bool,
    },
    EncryptionChanged {
        handle: u16,
        status: HciStatusCode,
        enabled: bool,
    },
    EncryptionKeyRefresh {
        handle: u16,
        status: HciStatusCode,
    },
    LeRemoteFeatures {
        handle: u16,
        status: HciStatusCode,
        features: LeFeatures,
    },
    LeLtkRequest {
        handle: u16,
        rand: u64,
        ediv: u16,
    },
    LocalP256PublicKey {
        status: HciStatusCode,
        key: Box<[u8; 64]>,
    },
    DhKeyGenerated {
        status: HciStatusCode,
        dhkey: [u8; 32],
    },
    /// Synthesised by the security manager once an LTK is known
    NewLongTermKey {
        peer: BdAddressAndType,
        ltk: SmpLongTermKey,
    },
    SmpMessage {
        handle: u16,
        pdu: SmpPdu,
    },
    HardwareError {
        code: u8,
    },
    TransportClosed {
        reason: String,
    },
}

/// Callback list index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MgmtEventKind {
    DeviceFound,
    DeviceConnected,
    ConnectFailed,
    DeviceDisconnected,
    Discovering,
    Advertising,
    EncryptionChanged,
    EncryptionKeyRefresh,
    LeRemoteFeatures,
    LeLtkRequest,
    LocalP256PublicKey,
    DhKeyGenerated,
    NewLongTermKey,
    SmpMessage,
    HardwareError,
    TransportClosed,
}

impl MgmtEventKind {
    pub const COUNT: usize = 16;

    pub const ALL: [MgmtEventKind; Self::COUNT] = [
        MgmtEventKind::DeviceFound,
        MgmtEventKind::DeviceConnected,
        MgmtEventKind::ConnectFailed,
        MgmtEventKind::DeviceDisconnected,
        MgmtEventKind::Discovering,
        MgmtEventKind::Advertising,
        MgmtEventKind::EncryptionChanged,
        MgmtEventKind::EncryptionKeyRefresh,
        MgmtEventKind::LeRemoteFeatures,
        MgmtEventKind::LeLtkRequest,
        MgmtEventKind::LocalP256PublicKey,
        MgmtEventKind::DhKeyGenerated,
        MgmtEventKind::NewLongTermKey,
        MgmtEventKind::SmpMessage,
        MgmtEventKind::HardwareError,
        MgmtEventKind::TransportClosed,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl MgmtEventData {
    pub fn kind(&self) -> MgmtEventKind {
        match self {
            MgmtEventData::DeviceFound(_) => MgmtEventKind::DeviceFound,
            MgmtEventData::DeviceConnected { .. } => MgmtEventKind::DeviceConnected,
            MgmtEventData::ConnectFailed { .. } => MgmtEventKind::ConnectFailed,
            MgmtEventData::DeviceDisconnected { .. } => MgmtEventKind::DeviceDisconnected,
            MgmtEventData::Discovering { .. } => MgmtEventKind::Discovering,
            MgmtEventData::Advertising { .. } => MgmtEventKind::Advertising,
            MgmtEventData::EncryptionChanged { .. } => MgmtEventKind::EncryptionChanged,
            MgmtEventData::EncryptionKeyRefresh { .. } => MgmtEventKind::EncryptionKeyRefresh,
            MgmtEventData::LeRemoteFeatures { .. } => MgmtEventKind::LeRemoteFeatures,
            MgmtEventData::LeLtkRequest { .. } => MgmtEventKind::LeLtkRequest,
            MgmtEventData::LocalP256PublicKey { .. } => MgmtEventKind::LocalP256PublicKey,
            MgmtEventData::DhKeyGenerated { .. } => MgmtEventKind::DhKeyGenerated,
            MgmtEventData::NewLongTermKey { .. } => MgmtEventKind::NewLongTermKey,
            MgmtEventData::SmpMessage { .. } => MgmtEventKind::SmpMessage,
            MgmtEventData::HardwareError { .. } => MgmtEventKind::HardwareError,
            MgmtEventData::TransportClosed { .. } => MgmtEventKind::TransportClosed,
        }
    }

    /// Connection handle the event refers to, if any
    pub fn handle(&self) -> Option<u16> {
        match self {
            MgmtEventData::DeviceConnected { handle, .. }
            | MgmtEventData::DeviceDisconnected { handle, .. }
            | MgmtEventData::EncryptionChanged { handle, .. }
            | MgmtEventData::EncryptionKeyRefresh { handle, .. }
            | MgmtEventData::LeRemoteFeatures { handle, .. }
            | MgmtEventData::LeLtkRequest { handle, .. }
            | MgmtEventData::SmpMessage { handle, .. } => Some(*handle),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_indices_are_dense() {
        for (i, kind) in MgmtEventKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn handle_is_exposed_for_link_events() {
        let ev = MgmtEventData::DeviceDisconnected {
            peer: None,
            handle: 0x40,
            reason: HciStatusCode::RemoteUserTerminatedConnection,
        };
        assert_eq!(ev.handle(), Some(0x40));
        assert_eq!(ev.kind(), MgmtEventKind::DeviceDisconnected);
        assert_eq!(MgmtEventData::Advertising { enabled: true }.handle(), None);
    }
}
