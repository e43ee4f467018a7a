//! SMP key material
//!
//! Fixed-size little-endian encodings, matching the optional key structures
//! stored in a key bin: LTK 28 bytes, CSRK 17 bytes, link key 19 bytes.

use bitflags::bitflags;

use crate::errors::PacketError;
use crate::protocol::packet::Reader;
use crate::types::{BdAddress, BdAddressType};

bitflags! {
    /// Long term key properties
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LtkProperties: u8 {
        /// Key was distributed by the responder
        const RESPONDER = 0x01;
        /// Key was generated with MITM protection
        const AUTH = 0x02;
        /// Key was generated with Secure Connections
        const AUTH_SC = 0x04;
    }
}

bitflags! {
    /// Signature resolving key properties
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CsrkProperties: u8 {
        const RESPONDER = 0x01;
        const AUTH = 0x02;
    }
}

// ----------------------------------------------------------------------------
// Long Term Key
// ----------------------------------------------------------------------------

/// Long term key with its EDIV/Rand identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SmpLongTermKey {
    pub properties: LtkProperties,
    pub enc_size: u8,
    pub ediv: u16,
    pub rand: u64,
    pub ltk: [u8; 16],
}

impl SmpLongTermKey {
    pub const ENCODED_SIZE: usize = 28;

    pub fn is_responder(&self) -> bool {
        self.properties.contains(LtkProperties::RESPONDER)
    }

    /// Structurally usable key: a supported size and non-zero value
    pub fn is_valid(&self) -> bool {
        (7..=16).contains(&self.enc_size) && self.ltk.iter().any(|b| *b != 0)
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.properties.bits());
        out.push(self.enc_size);
        out.extend_from_slice(&self.ediv.to_le_bytes());
        out.extend_from_slice(&self.rand.to_le_bytes());
        out.extend_from_slice(&self.ltk);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, PacketError> {
        Ok(Self {
            properties: LtkProperties::from_bits_truncate(r.u8()?),
            enc_size: r.u8()?,
            ediv: r.u16()?,
            rand: r.u64()?,
            ltk: r.array()?,
        })
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

// ----------------------------------------------------------------------------
// Signature Resolving Key
// ----------------------------------------------------------------------------

/// Connection signature resolving key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SmpSignatureResolvingKey {
    pub properties: CsrkProperties,
    pub csrk: [u8; 16],
}

impl SmpSignatureResolvingKey {
    pub const ENCODED_SIZE: usize = 17;

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.properties.bits());
        out.extend_from_slice(&self.csrk);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, PacketError> {
        Ok(Self {
            properties: CsrkProperties::from_bits_truncate(r.u8()?),
            csrk: r.array()?,
        })
    }
}

// ----------------------------------------------------------------------------
// Identity Resolving Key
// ----------------------------------------------------------------------------

/// Identity resolving key with the peer's identity address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SmpIdentityResolvingKey {
    pub responder: bool,
    pub irk: [u8; 16],
    pub id_address: BdAddress,
    pub id_address_type: Option<BdAddressType>,
}

// ----------------------------------------------------------------------------
// Link Key
// ----------------------------------------------------------------------------

/// BR/EDR link key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SmpLinkKey {
    pub responder: bool,
    pub key_type: u8,
    pub key: [u8; 16],
    pub pin_length: u8,
}

impl SmpLinkKey {
    pub const ENCODED_SIZE: usize = 19;

    pub fn is_valid(&self) -> bool {
        self.key_type <= 0x08 && self.key.iter().any(|b| *b != 0)
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.responder as u8);
        out.push(self.key_type);
        out.extend_from_slice(&self.key);
        out.push(self.pin_length);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, PacketError> {
        Ok(Self {
            responder: r.u8()? != 0,
            key_type: r.u8()?,
            key: r.array()?,
            pin_length: r.u8()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_sizes_are_fixed() {
        let mut out = Vec::new();
        SmpLongTermKey::default().encode_into(&mut out);
        assert_eq!(out.len(), SmpLongTermKey::ENCODED_SIZE);
        out.clear();
        SmpSignatureResolvingKey::default().encode_into(&mut out);
        assert_eq!(out.len(), SmpSignatureResolvingKey::ENCODED_SIZE);
        out.clear();
        SmpLinkKey::default().encode_into(&mut out);
        assert_eq!(out.len(), SmpLinkKey::ENCODED_SIZE);
    }

    #[test]
    fn ltk_validity() {
        let mut ltk = SmpLongTermKey {
            enc_size: 16,
            ltk: [0x11; 16],
            ..Default::default()
        };
        assert!(ltk.is_valid());
        ltk.enc_size = 4;
        assert!(!ltk.is_valid());
        ltk.enc_size = 16;
        ltk.clear();
        assert!(!ltk.is_valid());
    }
}
