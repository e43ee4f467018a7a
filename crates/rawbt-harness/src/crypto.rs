//! Deterministic stand-in for the SMP cryptographic toolbox
//!
//! Not AES-CMAC. Each function folds its tag and operands through FNV-1a so
//! both ends of a simulated pairing derive identical values.

use rawbt_core::smp::{SmpAddress, SmpCrypto};

const FNV128_OFFSET: u128 = 0x6c62_272e_07bb_0142_62b8_2175_6295_c58d;
const FNV128_PRIME: u128 = 0x0000_0000_0100_0000_0000_0000_0000_013b;

struct Fnv(u128);

impl Fnv {
    fn new(tag: u8) -> Self {
        Fnv(FNV128_OFFSET).feed(&[tag])
    }

    fn feed(mut self, bytes: &[u8]) -> Self {
        for b in bytes {
            self.0 ^= *b as u128;
            self.0 = self.0.wrapping_mul(FNV128_PRIME);
        }
        self
    }

    fn feed_u128(self, v: u128) -> Self {
        self.feed(&v.to_le_bytes())
    }

    fn feed_addr(self, a: &SmpAddress) -> Self {
        self.feed(&a.to_56_bits())
    }

    fn finish(self) -> u128 {
        self.0
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FakeSmpCrypto;

impl SmpCrypto for FakeSmpCrypto {
    fn f4(&self, u: &[u8; 32], v: &[u8; 32], x: u128, z: u8) -> u128 {
        Fnv::new(4).feed(u).feed(v).feed_u128(x).feed(&[z]).finish()
    }

    fn f5(
        &self,
        w: &[u8; 32],
        n1: u128,
        n2: u128,
        a1: &SmpAddress,
        a2: &SmpAddress,
    ) -> (u128, u128) {
        let derive = |tag: u8| {
            Fnv::new(tag)
                .feed(w)
                .feed_u128(n1)
                .feed_u128(n2)
                .feed_addr(a1)
                .feed_addr(a2)
                .finish()
        };
        (derive(50), derive(51))
    }

    fn f6(
        &self,
        w: u128,
        n1: u128,
        n2: u128,
        r: u128,
        io_cap: [u8; 3],
        a1: &SmpAddress,
        a2: &SmpAddress,
    ) -> u128 {
        Fnv::new(6)
            .feed_u128(w)
            .feed_u128(n1)
            .feed_u128(n2)
            .feed_u128(r)
            .feed(&io_cap)
            .feed_addr(a1)
            .feed_addr(a2)
            .finish()
    }

    fn g2(&self, u: &[u8; 32], v: &[u8; 32], x: u128, y: u128) -> u32 {
        Fnv::new(2)
            .feed(u)
            .feed(v)
            .feed_u128(x)
            .feed_u128(y)
            .finish() as u32
    }

    fn c1(
        &self,
        k: u128,
        r: u128,
        preq: [u8; 7],
        pres: [u8; 7],
        initiator: &SmpAddress,
        responder: &SmpAddress,
    ) -> u128 {
        Fnv::new(1)
            .feed_u128(k)
            .feed_u128(r)
            .feed(&preq)
            .feed(&pres)
            .feed_addr(initiator)
            .feed_addr(responder)
            .finish()
    }

    fn s1(&self, k: u128, r1: u128, r2: u128) -> u128 {
        Fnv::new(7).feed_u128(k).feed_u128(r1).feed_u128(r2).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rawbt_core::{BdAddress, BdAddressType};

    #[test]
    fn functions_are_deterministic_and_input_sensitive() {
        let c = FakeSmpCrypto;
        let a = SmpAddress::new(BdAddress::new([1; 6]), BdAddressType::BdAddrLePublic);
        let b = SmpAddress::new(BdAddress::new([2; 6]), BdAddressType::BdAddrLeRandom);
        assert_eq!(
            c.c1(0, 5, [0; 7], [1; 7], &a, &b),
            c.c1(0, 5, [0; 7], [1; 7], &a, &b)
        );
        assert_ne!(
            c.c1(0, 5, [0; 7], [1; 7], &a, &b),
            c.c1(0, 6, [0; 7], [1; 7], &a, &b)
        );
        let (mac, ltk) = c.f5(&[9; 32], 1, 2, &a, &b);
        assert_ne!(mac, ltk);
    }
}
