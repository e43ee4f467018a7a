//! SMP PDU codec
//!
//! PDUs are `[code:1][data]` carried on L2CAP CID 0x0006. All multi-byte values
//! are little-endian; 128-bit values travel as `u128`.

use crate::errors::PacketError;
use crate::protocol::packet::Reader;
use crate::smp::types::{SmpAuthReqs, SmpIoCapability, SmpKeyType, SmpReason};
use crate::types::BdAddress;

pub mod code {
    pub const PAIRING_REQUEST: u8 = 0x01;
    pub const PAIRING_RESPONSE: u8 = 0x02;
    pub const PAIRING_CONFIRM: u8 = 0x03;
    pub const PAIRING_RANDOM: u8 = 0x04;
    pub const PAIRING_FAILED: u8 = 0x05;
    pub const ENCRYPTION_INFORMATION: u8 = 0x06;
    pub const MASTER_IDENTIFICATION: u8 = 0x07;
    pub const IDENTITY_INFORMATION: u8 = 0x08;
    pub const IDENTITY_ADDRESS_INFORMATION: u8 = 0x09;
    pub const SIGNING_INFORMATION: u8 = 0x0A;
    pub const SECURITY_REQUEST: u8 = 0x0B;
    pub const PAIRING_PUBLIC_KEY: u8 = 0x0C;
    pub const PAIRING_DHKEY_CHECK: u8 = 0x0D;
    pub const PAIRING_KEYPRESS_NOTIFICATION: u8 = 0x0E;
}

/// Pairing Request / Pairing Response body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingFeatures {
    pub io_capability: SmpIoCapability,
    pub oob_data_present: bool,
    pub auth_req: SmpAuthReqs,
    pub max_encryption_key_size: u8,
    pub initiator_key_dist: SmpKeyType,
    pub responder_key_dist: SmpKeyType,
}

impl PairingFeatures {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.io_capability.as_u8());
        out.push(self.oob_data_present as u8);
        out.push(self.auth_req.bits());
        out.push(self.max_encryption_key_size);
        out.push(self.initiator_key_dist.bits());
        out.push(self.responder_key_dist.bits());
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, PacketError> {
        let io_capability = SmpIoCapability::from_u8(r.u8()?);
        let oob_data_present = r.u8()? != 0;
        let auth_req = SmpAuthReqs::from_bits_truncate(r.u8()?);
        let max_encryption_key_size = r.u8()?;
        if !(7..=16).contains(&max_encryption_key_size) {
            return Err(PacketError::OutOfRange {
                field: "max_encryption_key_size",
                value: max_encryption_key_size as u32,
            });
        }
        Ok(Self {
            io_capability,
            oob_data_present,
            auth_req,
            max_encryption_key_size,
            initiator_key_dist: SmpKeyType::from_bits_truncate(r.u8()?),
            responder_key_dist: SmpKeyType::from_bits_truncate(r.u8()?),
        })
    }

    /// The 7-byte PDU image used by legacy `c1`
    pub fn pdu_bytes(&self, code: u8) -> [u8; 7] {
        let mut out = Vec::with_capacity(7);
        out.push(code);
        self.encode_into(&mut out);
        let mut arr = [0u8; 7];
        arr.copy_from_slice(&out);
        arr
    }
}

/// One SMP PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmpPdu {
    PairingRequest(PairingFeatures),
    PairingResponse(PairingFeatures),
    PairingConfirm(u128),
    PairingRandom(u128),
    PairingFailed(SmpReason),
    EncryptionInformation([u8; 16]),
    MasterIdentification { ediv: u16, rand: u64 },
    IdentityInformation([u8; 16]),
    IdentityAddressInformation { address_type: u8, address: BdAddress },
    SigningInformation([u8; 16]),
    SecurityRequest(SmpAuthReqs),
    /// X and Y coordinates, each 32 bytes little-endian
    PairingPublicKey([u8; 64]),
    PairingDhKeyCheck(u128),
    KeypressNotification(u8),
}

impl SmpPdu {
    pub fn code(&self) -> u8 {
        match self {
            SmpPdu::PairingRequest(_) => code::PAIRING_REQUEST,
            SmpPdu::PairingResponse(_) => code::PAIRING_RESPONSE,
            SmpPdu::PairingConfirm(_) => code::PAIRING_CONFIRM,
            SmpPdu::PairingRandom(_) => code::PAIRING_RANDOM,
            SmpPdu::PairingFailed(_) => code::PAIRING_FAILED,
            SmpPdu::EncryptionInformation(_) => code::ENCRYPTION_INFORMATION,
            SmpPdu::MasterIdentification { .. } => code::MASTER_IDENTIFICATION,
            SmpPdu::IdentityInformation(_) => code::IDENTITY_INFORMATION,
            SmpPdu::IdentityAddressInformation { .. } => code::IDENTITY_ADDRESS_INFORMATION,
            SmpPdu::SigningInformation(_) => code::SIGNING_INFORMATION,
            SmpPdu::SecurityRequest(_) => code::SECURITY_REQUEST,
            SmpPdu::PairingPublicKey(_) => code::PAIRING_PUBLIC_KEY,
            SmpPdu::PairingDhKeyCheck(_) => code::PAIRING_DHKEY_CHECK,
            SmpPdu::KeypressNotification(_) => code::PAIRING_KEYPRESS_NOTIFICATION,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.code()];
        match self {
            SmpPdu::PairingRequest(f) | SmpPdu::PairingResponse(f) => f.encode_into(&mut out),
            SmpPdu::PairingConfirm(v) | SmpPdu::PairingRandom(v) | SmpPdu::PairingDhKeyCheck(v) => {
                out.extend_from_slice(&v.to_le_bytes())
            }
            SmpPdu::PairingFailed(reason) => out.push(reason.as_u8()),
            SmpPdu::EncryptionInformation(k)
            | SmpPdu::IdentityInformation(k)
            | SmpPdu::SigningInformation(k) => out.extend_from_slice(k),
            SmpPdu::MasterIdentification { ediv, rand } => {
                out.extend_from_slice(&ediv.to_le_bytes());
                out.extend_from_slice(&rand.to_le_bytes());
            }
            SmpPdu::IdentityAddressInformation {
                address_type,
                address,
            } => {
                out.push(*address_type);
                out.extend_from_slice(address.as_bytes());
            }
            SmpPdu::SecurityRequest(auth) => out.push(auth.bits()),
            SmpPdu::PairingPublicKey(key) => out.extend_from_slice(key),
            SmpPdu::KeypressNotification(kind) => out.push(*kind),
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut r = Reader::new(bytes);
        let code = r.u8()?;
        let pdu = match code {
            code::PAIRING_REQUEST => SmpPdu::PairingRequest(PairingFeatures::decode(&mut r)?),
            code::PAIRING_RESPONSE => SmpPdu::PairingResponse(PairingFeatures::decode(&mut r)?),
            code::PAIRING_CONFIRM => SmpPdu::PairingConfirm(u128::from_le_bytes(r.array()?)),
            code::PAIRING_RANDOM => SmpPdu::PairingRandom(u128::from_le_bytes(r.array()?)),
            code::PAIRING_FAILED => SmpPdu::PairingFailed(SmpReason::from_u8(r.u8()?)),
            code::ENCRYPTION_INFORMATION => SmpPdu::EncryptionInformation(r.array()?),
            code::MASTER_IDENTIFICATION => SmpPdu::MasterIdentification {
                ediv: r.u16()?,
                rand: r.u64()?,
            },
            code::IDENTITY_INFORMATION => SmpPdu::IdentityInformation(r.array()?),
            code::IDENTITY_ADDRESS_INFORMATION => SmpPdu::IdentityAddressInformation {
                address_type: r.u8()?,
                address: BdAddress::new(r.array()?),
            },
            code::SIGNING_INFORMATION => SmpPdu::SigningInformation(r.array()?),
            code::SECURITY_REQUEST => {
                SmpPdu::SecurityRequest(SmpAuthReqs::from_bits_truncate(r.u8()?))
            }
            code::PAIRING_PUBLIC_KEY => SmpPdu::PairingPublicKey(r.array()?),
            code::PAIRING_DHKEY_CHECK => SmpPdu::PairingDhKeyCheck(u128::from_le_bytes(r.array()?)),
            code::PAIRING_KEYPRESS_NOTIFICATION => SmpPdu::KeypressNotification(r.u8()?),
            other => return Err(PacketError::UnknownSmpOpcode { opcode: other }),
        };
        if r.remaining() != 0 {
            return Err(PacketError::LengthMismatch {
                declared: bytes.len() - r.remaining(),
                actual: bytes.len(),
            });
        }
        Ok(pdu)
    }
}
