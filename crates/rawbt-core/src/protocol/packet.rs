//! HCI packet framing
//!
//! Byte-exact encode/decode of the three H4 packet kinds the host exchanges
//! with the controller:
//!
//! * Command `[0x01][opcode:2 LE][param_len:1][params]`
//! * ACL `[0x02][handle|PB<<12|BC<<14 :2 LE][data_len:2 LE][data]`
//! * Event `[0x04][event_code:1][param_len:1][params]`

use crate::errors::PacketError;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

pub const COMMAND_HEADER_SIZE: usize = 4;
pub const ACL_HEADER_SIZE: usize = 5;
pub const EVENT_HEADER_SIZE: usize = 3;
pub const MAX_COMMAND_PARAM_LEN: usize = 255;
pub const MAX_EVENT_PARAM_LEN: usize = 255;

/// H4 packet type indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HciPacketType {
    Command = 0x01,
    AclData = 0x02,
    ScoData = 0x03,
    Event = 0x04,
    IsoData = 0x05,
}

impl HciPacketType {
    pub fn from_u8(value: u8) -> Result<Self, PacketError> {
        match value {
            0x01 => Ok(Self::Command),
            0x02 => Ok(Self::AclData),
            0x03 => Ok(Self::ScoData),
            0x04 => Ok(Self::Event),
            0x05 => Ok(Self::IsoData),
            other => Err(PacketError::UnknownPacketType { packet_type: other }),
        }
    }
}

// ----------------------------------------------------------------------------
// Byte Reader
// ----------------------------------------------------------------------------

/// Bounds-checked little-endian cursor over a parameter buffer
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], PacketError> {
        if self.remaining() < n {
            return Err(PacketError::TooShort {
                expected: self.pos + n,
                actual: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], PacketError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, PacketError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, PacketError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64, PacketError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

// ----------------------------------------------------------------------------
// Command Packet
// ----------------------------------------------------------------------------

/// HCI command with its already-encoded parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciCommand {
    pub opcode: u16,
    pub params: Vec<u8>,
}

impl HciCommand {
    pub fn new(opcode: u16, params: Vec<u8>) -> Self {
        Self { opcode, params }
    }

    /// Command without parameters
    pub fn bare(opcode: u16) -> Self {
        Self::new(opcode, Vec::new())
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        if self.params.len() > MAX_COMMAND_PARAM_LEN {
            return Err(PacketError::TooLarge {
                size: self.params.len(),
                max: MAX_COMMAND_PARAM_LEN,
            });
        }
        let mut bytes = Vec::with_capacity(COMMAND_HEADER_SIZE + self.params.len());
        bytes.push(HciPacketType::Command as u8);
        bytes.extend_from_slice(&self.opcode.to_le_bytes());
        bytes.push(self.params.len() as u8);
        bytes.extend_from_slice(&self.params);
        Ok(bytes)
    }

    /// Decode a full H4 command packet including the type byte
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < COMMAND_HEADER_SIZE {
            return Err(PacketError::TooShort {
                expected: COMMAND_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[0] != HciPacketType::Command as u8 {
            return Err(PacketError::UnsupportedPacketType { packet_type: bytes[0] });
        }
        let opcode = u16::from_le_bytes([bytes[1], bytes[2]]);
        let declared = bytes[3] as usize;
        let actual = bytes.len() - COMMAND_HEADER_SIZE;
        if declared != actual {
            return Err(PacketError::LengthMismatch { declared, actual });
        }
        Ok(Self::new(opcode, bytes[COMMAND_HEADER_SIZE..].to_vec()))
    }
}

// ----------------------------------------------------------------------------
// Event Packet
// ----------------------------------------------------------------------------

/// Raw HCI event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciEvent {
    pub code: u8,
    pub params: Vec<u8>,
}

impl HciEvent {
    pub fn new(code: u8, params: Vec<u8>) -> Self {
        Self { code, params }
    }

    /// LE meta event with subevent code prepended to the parameters
    pub fn le_meta(subevent: u8, params: &[u8]) -> Self {
        let mut p = Vec::with_capacity(params.len() + 1);
        p.push(subevent);
        p.extend_from_slice(params);
        Self::new(super::opcodes::evt::LE_META, p)
    }

    /// Subevent code if this is an LE meta event
    pub fn le_subevent(&self) -> Option<u8> {
        if self.code == super::opcodes::evt::LE_META {
            self.params.first().copied()
        } else {
            None
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        if self.params.len() > MAX_EVENT_PARAM_LEN {
            return Err(PacketError::TooLarge {
                size: self.params.len(),
                max: MAX_EVENT_PARAM_LEN,
            });
        }
        let mut bytes = Vec::with_capacity(EVENT_HEADER_SIZE + self.params.len());
        bytes.push(HciPacketType::Event as u8);
        bytes.push(self.code);
        bytes.push(self.params.len() as u8);
        bytes.extend_from_slice(&self.params);
        Ok(bytes)
    }

    /// Decode a full H4 event packet including the type byte
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < EVENT_HEADER_SIZE {
            return Err(PacketError::TooShort {
                expected: EVENT_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[0] != HciPacketType::Event as u8 {
            return Err(PacketError::UnsupportedPacketType { packet_type: bytes[0] });
        }
        let declared = bytes[2] as usize;
        let actual = bytes.len() - EVENT_HEADER_SIZE;
        if declared != actual {
            return Err(PacketError::LengthMismatch { declared, actual });
        }
        if bytes[1] == super::opcodes::evt::LE_META && declared == 0 {
            return Err(PacketError::from("LE meta event without subevent code"));
        }
        Ok(Self::new(bytes[1], bytes[EVENT_HEADER_SIZE..].to_vec()))
    }
}

// ----------------------------------------------------------------------------
// ACL Data Packet
// ----------------------------------------------------------------------------

/// Packet boundary flag of an ACL packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketBoundary {
    /// First non-automatically-flushable fragment, host to controller
    FirstNonFlushable = 0b00,
    /// Continuing fragment
    Continuing = 0b01,
    /// First automatically-flushable fragment
    FirstFlushable = 0b10,
    /// Complete automatically-flushable PDU (BR/EDR only)
    Complete = 0b11,
}

impl PacketBoundary {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Self::FirstNonFlushable,
            0b01 => Self::Continuing,
            0b10 => Self::FirstFlushable,
            _ => Self::Complete,
        }
    }

    pub fn is_start(self) -> bool {
        !matches!(self, Self::Continuing)
    }
}

/// ACL data packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclPacket {
    /// 12-bit connection handle
    pub handle: u16,
    pub boundary: PacketBoundary,
    /// 2-bit broadcast flag
    pub broadcast: u8,
    pub data: Vec<u8>,
}

impl AclPacket {
    pub fn new(handle: u16, boundary: PacketBoundary, data: Vec<u8>) -> Self {
        Self {
            handle: handle & 0x0fff,
            boundary,
            broadcast: 0,
            data,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        if self.data.len() > u16::MAX as usize {
            return Err(PacketError::TooLarge {
                size: self.data.len(),
                max: u16::MAX as usize,
            });
        }
        let field = (self.handle & 0x0fff)
            | ((self.boundary as u16) << 12)
            | (((self.broadcast & 0b11) as u16) << 14);
        let mut bytes = Vec::with_capacity(ACL_HEADER_SIZE + self.data.len());
        bytes.push(HciPacketType::AclData as u8);
        bytes.extend_from_slice(&field.to_le_bytes());
        bytes.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&self.data);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < ACL_HEADER_SIZE {
            return Err(PacketError::TooShort {
                expected: ACL_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[0] != HciPacketType::AclData as u8 {
            return Err(PacketError::UnsupportedPacketType { packet_type: bytes[0] });
        }
        let field = u16::from_le_bytes([bytes[1], bytes[2]]);
        let declared = u16::from_le_bytes([bytes[3], bytes[4]]) as usize;
        let actual = bytes.len() - ACL_HEADER_SIZE;
        if declared != actual {
            return Err(PacketError::LengthMismatch { declared, actual });
        }
        Ok(Self {
            handle: field & 0x0fff,
            boundary: PacketBoundary::from_bits((field >> 12) as u8),
            broadcast: ((field >> 14) & 0b11) as u8,
            data: bytes[ACL_HEADER_SIZE..].to_vec(),
        })
    }
}

// ----------------------------------------------------------------------------
// Any Packet
// ----------------------------------------------------------------------------

/// Decoded inbound or outbound H4 packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciPacket {
    Command(HciCommand),
    Acl(AclPacket),
    Event(HciEvent),
}

impl HciPacket {
    /// Classify and decode a raw H4 buffer
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let first = *bytes.first().ok_or(PacketError::TooShort {
            expected: 1,
            actual: 0,
        })?;
        match HciPacketType::from_u8(first)? {
            HciPacketType::Command => Ok(HciPacket::Command(HciCommand::decode(bytes)?)),
            HciPacketType::AclData => Ok(HciPacket::Acl(AclPacket::decode(bytes)?)),
            HciPacketType::Event => Ok(HciPacket::Event(HciEvent::decode(bytes)?)),
            other => Err(PacketError::UnsupportedPacketType {
                packet_type: other as u8,
            }),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        match self {
            HciPacket::Command(c) => c.encode(),
            HciPacket::Acl(a) => a.encode(),
            HciPacket::Event(e) => e.encode(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::opcodes::{cmd, evt};

    #[test]
    fn command_header_is_bit_exact() {
        let c = HciCommand::new(cmd::LE_SET_SCAN_ENABLE, vec![0x01, 0x00]);
        let bytes = c.encode().expect("encode");
        assert_eq!(bytes, vec![0x01, 0x0C, 0x20, 0x02, 0x01, 0x00]);
        assert_eq!(HciCommand::decode(&bytes).expect("decode"), c);
    }

    #[test]
    fn event_header_and_le_meta() {
        let e = HciEvent::le_meta(0x01, &[0xAA]);
        let bytes = e.encode().expect("encode");
        assert_eq!(bytes, vec![0x04, evt::LE_META, 0x02, 0x01, 0xAA]);
        let back = HciEvent::decode(&bytes).expect("decode");
        assert_eq!(back.le_subevent(), Some(0x01));
    }

    #[test]
    fn acl_flags_in_upper_handle_bits() {
        let mut p = AclPacket::new(0x0040, PacketBoundary::FirstFlushable, vec![1, 2, 3]);
        p.broadcast = 0b01;
        let bytes = p.encode().expect("encode");
        assert_eq!(&bytes[..5], &[0x02, 0x40, 0x60, 0x03, 0x00]);
        let back = AclPacket::decode(&bytes).expect("decode");
        assert_eq!(back.handle, 0x0040);
        assert_eq!(back.boundary, PacketBoundary::FirstFlushable);
        assert_eq!(back.broadcast, 0b01);
    }

    #[test]
    fn rejects_malformed_packets() {
        assert!(matches!(
            HciPacket::decode(&[]),
            Err(PacketError::TooShort { .. })
        ));
        assert!(matches!(
            HciPacket::decode(&[0x09, 0x00]),
            Err(PacketError::UnknownPacketType { packet_type: 0x09 })
        ));
        assert!(matches!(
            HciPacket::decode(&[0x04, 0x0E, 0x05, 0x01]),
            Err(PacketError::LengthMismatch { declared: 5, actual: 1 })
        ));
        assert!(HciPacket::decode(&[0x04, evt::LE_META, 0x00]).is_err());
        assert!(HciPacket::decode(&[0x03, 0x00, 0x00, 0x00]).is_err());
    }

    #[test]
    fn reader_bounds() {
        let mut r = Reader::new(&[1, 2, 3]);
        assert_eq!(r.u16().expect("u16"), 0x0201);
        assert!(r.u16().is_err());
        assert_eq!(r.u8().expect("u8"), 3);
        assert_eq!(r.remaining(), 0);
    }
}
