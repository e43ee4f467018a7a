//! L2CAP basic frames over ACL
//!
//! Frames are `[length:2 LE][cid:2 LE][payload]`. Outbound frames are split
//! into ACL fragments no larger than the controller's buffer size; inbound
//! fragments are reassembled per connection handle.

use std::collections::HashMap;

use crate::errors::PacketError;
use crate::protocol::packet::{AclPacket, PacketBoundary};

pub const L2CAP_HEADER_SIZE: usize = 4;

/// Fixed channel identifiers
pub mod cid {
    pub const SIGNALING: u16 = 0x0001;
    pub const ATT: u16 = 0x0004;
    pub const LE_SIGNALING: u16 = 0x0005;
    pub const SMP: u16 = 0x0006;
    pub const SMP_BREDR: u16 = 0x0007;
}

/// Default LE ACL data length when the controller does not report one
pub const DEFAULT_LE_ACL_MTU: usize = 27;

/// One complete L2CAP basic frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2capFrame {
    pub cid: u16,
    pub payload: Vec<u8>,
}

impl L2capFrame {
    pub fn new(cid: u16, payload: Vec<u8>) -> Self {
        Self { cid, payload }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        if self.payload.len() > u16::MAX as usize {
            return Err(PacketError::TooLarge {
                size: self.payload.len(),
                max: u16::MAX as usize,
            });
        }
        let mut out = Vec::with_capacity(L2CAP_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.cid.to_le_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < L2CAP_HEADER_SIZE {
            return Err(PacketError::TooShort {
                expected: L2CAP_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let declared = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        let actual = bytes.len() - L2CAP_HEADER_SIZE;
        if declared != actual {
            return Err(PacketError::LengthMismatch { declared, actual });
        }
        Ok(Self {
            cid: u16::from_le_bytes([bytes[2], bytes[3]]),
            payload: bytes[L2CAP_HEADER_SIZE..].to_vec(),
        })
    }

    /// Split into ACL fragments of at most `mtu` data bytes
    pub fn fragment(&self, handle: u16, mtu: usize) -> Result<Vec<AclPacket>, PacketError> {
        let bytes = self.encode()?;
        let mtu = mtu.max(1);
        Ok(bytes
            .chunks(mtu)
            .enumerate()
            .map(|(i, chunk)| {
                let pb = if i == 0 {
                    PacketBoundary::FirstNonFlushable
                } else {
                    PacketBoundary::Continuing
                };
                AclPacket::new(handle, pb, chunk.to_vec())
            })
            .collect())
    }
}

// ----------------------------------------------------------------------------
// Reassembly
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct Partial {
    expected: usize,
    buf: Vec<u8>,
}

/// Per-handle reassembly of ACL fragments into L2CAP frames
#[derive(Debug, Default)]
pub struct AclReassembler {
    partial: HashMap<u16, Partial>,
}

impl AclReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one ACL packet, returning a frame when one completes
    pub fn push(&mut self, acl: AclPacket) -> Result<Option<L2capFrame>, PacketError> {
        if acl.boundary.is_start() {
            if self.partial.remove(&acl.handle).is_some() {
                tracing::debug!(handle = acl.handle, "Discarding incomplete L2CAP frame");
            }
            if acl.data.len() < 2 {
                return Err(PacketError::TooShort {
                    expected: 2,
                    actual: acl.data.len(),
                });
            }
            let expected =
                u16::from_le_bytes([acl.data[0], acl.data[1]]) as usize + L2CAP_HEADER_SIZE;
            self.partial.insert(
                acl.handle,
                Partial {
                    expected,
                    buf: Vec::with_capacity(expected),
                },
            );
        }

        let handle = acl.handle;
        let done = {
            let partial = self.partial.get_mut(&handle).ok_or(PacketError::Generic {
                message: format!("continuation without start on handle 0x{:04x}", handle),
            })?;
            partial.buf.extend_from_slice(&acl.data);
            if partial.buf.len() > partial.expected {
                self.partial.remove(&handle);
                return Err(PacketError::Generic {
                    message: "L2CAP frame overflows its declared length".into(),
                });
            }
            partial.buf.len() == partial.expected
        };

        if done {
            if let Some(partial) = self.partial.remove(&handle) {
                return L2capFrame::decode(&partial.buf).map(Some);
            }
        }
        Ok(None)
    }

    /// Drop reassembly state for a closed connection
    pub fn reset(&mut self, handle: u16) {
        self.partial.remove(&handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_and_reassemble() {
        let frame = L2capFrame::new(cid::ATT, (0u8..60).collect());
        let fragments = frame.fragment(0x0041, DEFAULT_LE_ACL_MTU).expect("fragment");
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].boundary, PacketBoundary::FirstNonFlushable);
        assert_eq!(fragments[1].boundary, PacketBoundary::Continuing);

        let mut r = AclReassembler::new();
        assert!(r.push(fragments[0].clone()).expect("push").is_none());
        assert!(r.push(fragments[1].clone()).expect("push").is_none());
        let out = r.push(fragments[2].clone()).expect("push").expect("frame");
        assert_eq!(out, frame);
    }

    #[test]
    fn continuation_without_start_is_rejected() {
        let mut r = AclReassembler::new();
        let acl = AclPacket::new(0x0040, PacketBoundary::Continuing, vec![1, 2, 3]);
        assert!(r.push(acl).is_err());
    }

    #[test]
    fn overflow_is_rejected_and_state_dropped() {
        let mut r = AclReassembler::new();
        let acl = AclPacket::new(
            0x0040,
            PacketBoundary::FirstFlushable,
            vec![0x01, 0x00, 0x06, 0x00, 0xAA, 0xBB],
        );
        assert!(r.push(acl).is_err());
        let ok = AclPacket::new(
            0x0040,
            PacketBoundary::FirstFlushable,
            vec![0x01, 0x00, 0x06, 0x00, 0xAA],
        );
        let frame = r.push(ok).expect("push").expect("frame");
        assert_eq!(frame.cid, cid::SMP);
    }
}
