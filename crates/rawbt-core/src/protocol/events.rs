//! Typed decoding of the HCI events the host consumes

use smallvec::SmallVec;

use crate::errors::PacketError;
use crate::protocol::eir::{read_le_advertising_reports, EInfoReport};
use crate::protocol::opcodes::{evt, le_sub};
use crate::protocol::packet::{HciEvent, Reader};
use crate::status::HciStatusCode;
use crate::types::{BdAddress, BdAddressAndType, BdAddressType, BtRole};

/// Decoded HCI event parameters
#[derive(Debug, Clone, PartialEq)]
pub enum HciEventData {
    CommandComplete {
        num_packets: u8,
        opcode: u16,
        return_params: Vec<u8>,
    },
    CommandStatus {
        status: HciStatusCode,
        num_packets: u8,
        opcode: u16,
    },
    ConnectionComplete {
        status: HciStatusCode,
        handle: u16,
        address: BdAddress,
        link_type: u8,
        encrypted: bool,
    },
    DisconnectionComplete {
        status: HciStatusCode,
        handle: u16,
        reason: HciStatusCode,
    },
    EncryptionChange {
        status: HciStatusCode,
        handle: u16,
        enabled: bool,
    },
    EncryptionKeyRefresh {
        status: HciStatusCode,
        handle: u16,
    },
    HardwareError {
        code: u8,
    },
    NumberOfCompletedPackets {
        /// `(handle, completed)` pairs
        entries: SmallVec<[(u16, u16); 4]>,
    },
    LeConnectionComplete {
        status: HciStatusCode,
        handle: u16,
        /// Local role on this link
        role: BtRole,
        peer: BdAddressAndType,
        interval: u16,
        latency: u16,
        supervision_timeout: u16,
    },
    LeAdvertisingReport(Vec<EInfoReport>),
    LeRemoteFeatures {
        status: HciStatusCode,
        handle: u16,
        features: u64,
    },
    LeLtkRequest {
        handle: u16,
        rand: u64,
        ediv: u16,
    },
    LeReadLocalP256PublicKey {
        status: HciStatusCode,
        key: [u8; 64],
    },
    LeGenerateDhKey {
        status: HciStatusCode,
        dhkey: [u8; 32],
    },
    Unhandled {
        code: u8,
        subevent: Option<u8>,
    },
}

fn status(r: &mut Reader<'_>) -> Result<HciStatusCode, PacketError> {
    Ok(HciStatusCode::from_u8(r.u8()?))
}

impl HciEventData {
    pub fn decode(event: &HciEvent) -> Result<Self, PacketError> {
        let mut r = Reader::new(&event.params);
        let data = match event.code {
            evt::CMD_COMPLETE => HciEventData::CommandComplete {
                num_packets: r.u8()?,
                opcode: r.u16()?,
                return_params: r.rest().to_vec(),
            },
            evt::CMD_STATUS => HciEventData::CommandStatus {
                status: status(&mut r)?,
                num_packets: r.u8()?,
                opcode: r.u16()?,
            },
            evt::CONN_COMPLETE => HciEventData::ConnectionComplete {
                status: status(&mut r)?,
                handle: r.u16()? & 0x0fff,
                address: BdAddress::new(r.array()?),
                link_type: r.u8()?,
                encrypted: r.u8()? != 0,
            },
            evt::DISCONN_COMPLETE => HciEventData::DisconnectionComplete {
                status: status(&mut r)?,
                handle: r.u16()? & 0x0fff,
                reason: status(&mut r)?,
            },
            evt::ENCRYPT_CHANGE => HciEventData::EncryptionChange {
                status: status(&mut r)?,
                handle: r.u16()? & 0x0fff,
                enabled: r.u8()? != 0,
            },
            evt::ENCRYPT_KEY_REFRESH_COMPLETE => HciEventData::EncryptionKeyRefresh {
                status: status(&mut r)?,
                handle: r.u16()? & 0x0fff,
            },
            evt::HARDWARE_ERROR => HciEventData::HardwareError { code: r.u8()? },
            evt::NUM_COMP_PKTS => {
                let n = r.u8()?;
                let mut entries = SmallVec::with_capacity(n as usize);
                for _ in 0..n {
                    entries.push((r.u16()? & 0x0fff, r.u16()?));
                }
                HciEventData::NumberOfCompletedPackets { entries }
            }
            evt::LE_META => {
                let sub = r.u8()?;
                Self::decode_le_meta(sub, &mut r)?
            }
            code => HciEventData::Unhandled {
                code,
                subevent: None,
            },
        };
        Ok(data)
    }

    fn decode_le_meta(sub: u8, r: &mut Reader<'_>) -> Result<Self, PacketError> {
        let data = match sub {
            le_sub::CONN_COMPLETE | le_sub::ENHANCED_CONN_COMPLETE => {
                let status = status(r)?;
                let handle = r.u16()? & 0x0fff;
                let role = BtRole::from_hci(r.u8()?);
                let addr_type = BdAddressType::from_hci_le(r.u8()?);
                let address = BdAddress::new(r.array()?);
                if sub == le_sub::ENHANCED_CONN_COMPLETE {
                    // local and peer resolvable private addresses
                    r.take(12)?;
                }
                HciEventData::LeConnectionComplete {
                    status,
                    handle,
                    role,
                    peer: BdAddressAndType::new(address, addr_type),
                    interval: r.u16()?,
                    latency: r.u16()?,
                    supervision_timeout: r.u16()?,
                }
            }
            le_sub::ADVERTISING_REPORT => {
                HciEventData::LeAdvertisingReport(read_le_advertising_reports(r.rest())?)
            }
            le_sub::REMOTE_FEATURES_COMPLETE => HciEventData::LeRemoteFeatures {
                status: status(r)?,
                handle: r.u16()? & 0x0fff,
                features: r.u64()?,
            },
            le_sub::LTK_REQUEST => HciEventData::LeLtkRequest {
                handle: r.u16()? & 0x0fff,
                rand: r.u64()?,
                ediv: r.u16()?,
            },
            le_sub::READ_LOCAL_P256_PUBKEY_COMPLETE => HciEventData::LeReadLocalP256PublicKey {
                status: status(r)?,
                key: r.array()?,
            },
            le_sub::GENERATE_DHKEY_COMPLETE => HciEventData::LeGenerateDhKey {
                status: status(r)?,
                dhkey: r.array()?,
            },
            other => HciEventData::Unhandled {
                code: evt::LE_META,
                subevent: Some(other),
            },
        };
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::opcodes::cmd;

    #[test]
    fn decodes_command_status_and_complete() {
        let ev = HciEvent::new(evt::CMD_STATUS, vec![0x0e, 0x01, 0x0D, 0x20]);
        assert_eq!(
            HciEventData::decode(&ev).expect("decode"),
            HciEventData::CommandStatus {
                status: HciStatusCode::ConnectionRejectedSecurity,
                num_packets: 1,
                opcode: cmd::LE_CREATE_CONN,
            }
        );
        let ev = HciEvent::new(evt::CMD_COMPLETE, vec![0x01, 0x03, 0x0C, 0x00]);
        match HciEventData::decode(&ev).expect("decode") {
            HciEventData::CommandComplete {
                opcode,
                return_params,
                ..
            } => {
                assert_eq!(opcode, cmd::RESET);
                assert_eq!(return_params, vec![0x00]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn decodes_le_connection_complete() {
        let mut p = vec![0x00, 0x40, 0x00, 0x00, 0x01, 1, 2, 3, 4, 5, 6];
        p.extend_from_slice(&[12, 0, 0, 0, 50, 0, 0]);
        let ev = HciEvent::le_meta(le_sub::CONN_COMPLETE, &p);
        match HciEventData::decode(&ev).expect("decode") {
            HciEventData::LeConnectionComplete {
                status,
                handle,
                role,
                peer,
                supervision_timeout,
                ..
            } => {
                assert!(status.is_success());
                assert_eq!(handle, 0x0040);
                assert_eq!(role, BtRole::Master);
                assert_eq!(peer.address_type, BdAddressType::BdAddrLeRandom);
                assert_eq!(supervision_timeout, 50);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn truncated_event_is_rejected() {
        let ev = HciEvent::new(evt::DISCONN_COMPLETE, vec![0x00, 0x40]);
        assert!(HciEventData::decode(&ev).is_err());
    }
}
