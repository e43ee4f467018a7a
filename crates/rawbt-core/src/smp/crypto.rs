//! SMP cryptographic toolbox seam
//!
//! The AES-CMAC based functions are supplied from outside the stack. 128-bit
//! operands are `u128` values; curve coordinates and the DHKey are 32-byte
//! little-endian arrays as carried on the wire and returned by the controller.

use crate::types::{BdAddress, BdAddressType};

/// Address operand of `f5`/`f6`/`c1`: type byte (0 public, 1 random) and address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmpAddress {
    pub random: bool,
    pub address: BdAddress,
}

impl SmpAddress {
    pub fn new(address: BdAddress, address_type: BdAddressType) -> Self {
        Self {
            random: address_type == BdAddressType::BdAddrLeRandom,
            address,
        }
    }

    pub fn type_byte(&self) -> u8 {
        self.random as u8
    }

    /// 56-bit `type || address` image
    pub fn to_56_bits(&self) -> [u8; 7] {
        let mut out = [0u8; 7];
        out[..6].copy_from_slice(self.address.as_bytes());
        out[6] = self.type_byte();
        out
    }
}

/// LE Secure Connections and legacy pairing functions
pub trait SmpCrypto: Send + Sync {
    /// Confirm value generation `f4(U, V, X, Z)`
    fn f4(&self, u: &[u8; 32], v: &[u8; 32], x: u128, z: u8) -> u128;

    /// Key generation `f5(W, N1, N2, A1, A2)` returning `(MacKey, LTK)`
    fn f5(&self, w: &[u8; 32], n1: u128, n2: u128, a1: &SmpAddress, a2: &SmpAddress)
        -> (u128, u128);

    /// Check value generation `f6(W, N1, N2, R, IOcap, A1, A2)`
    #[allow(clippy::too_many_arguments)]
    fn f6(
        &self,
        w: u128,
        n1: u128,
        n2: u128,
        r: u128,
        io_cap: [u8; 3],
        a1: &SmpAddress,
        a2: &SmpAddress,
    ) -> u128;

    /// Numeric comparison value generation `g2(U, V, X, Y)`, full 32-bit result
    fn g2(&self, u: &[u8; 32], v: &[u8; 32], x: u128, y: u128) -> u32;

    /// Legacy confirm value generation `c1`
    #[allow(clippy::too_many_arguments)]
    fn c1(
        &self,
        k: u128,
        r: u128,
        preq: [u8; 7],
        pres: [u8; 7],
        initiator: &SmpAddress,
        responder: &SmpAddress,
    ) -> u128;

    /// Legacy short term key generation `s1`
    fn s1(&self, k: u128, r1: u128, r2: u128) -> u128;
}

/// Six-digit numeric comparison value from a `g2` result
pub fn numeric_comparison_value(g2: u32) -> u32 {
    g2 % 1_000_000
}

/// SC `IOcap` operand of `f6`: `AuthReq || OOB flag || IO capability`
pub fn sc_io_cap(auth_req: u8, oob: bool, io_capability: u8) -> [u8; 3] {
    [io_capability, oob as u8, auth_req]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_image() {
        let a = SmpAddress::new(
            BdAddress::new([1, 2, 3, 4, 5, 6]),
            BdAddressType::BdAddrLeRandom,
        );
        assert_eq!(a.to_56_bits(), [1, 2, 3, 4, 5, 6, 1]);
        assert_eq!(numeric_comparison_value(1_234_567_890), 567_890);
    }
}
