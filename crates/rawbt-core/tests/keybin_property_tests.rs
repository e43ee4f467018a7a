//! Property-based tests for key bin persistence
//!
//! These tests verify that any valid key bin survives a write/read through the
//! file system unchanged and that its stored size matches the recomputed one.

use proptest::prelude::*;
use rawbt_core::smp::{
    BtSecurityLevel, CsrkProperties, LtkProperties, PairingData, SmpIoCapability, SmpKeyBin,
    SmpKeyType, SmpLinkKey, SmpLongTermKey, SmpPairingState, SmpSignatureResolvingKey,
};
use rawbt_core::{BdAddress, BdAddressAndType, BdAddressType};

fn arb_addr() -> impl Strategy<Value = BdAddressAndType> {
    (
        any::<[u8; 6]>(),
        prop_oneof![
            Just(BdAddressType::BdAddrBredr),
            Just(BdAddressType::BdAddrLePublic),
            Just(BdAddressType::BdAddrLeRandom),
        ],
    )
        .prop_map(|(a, t)| BdAddressAndType::new(BdAddress::new(a), t))
}

fn arb_ltk(responder: bool) -> impl Strategy<Value = SmpLongTermKey> {
    (7u8..=16, any::<u16>(), any::<u64>(), any::<[u8; 16]>())
        .prop_filter("non-zero key", |(_, _, _, k)| k.iter().any(|b| *b != 0))
        .prop_map(move |(enc_size, ediv, rand, ltk)| SmpLongTermKey {
            properties: if responder {
                LtkProperties::RESPONDER
            } else {
                LtkProperties::empty()
            },
            enc_size,
            ediv,
            rand,
            ltk,
        })
}

fn arb_csrk() -> impl Strategy<Value = SmpSignatureResolvingKey> {
    any::<[u8; 16]>().prop_map(|csrk| SmpSignatureResolvingKey {
        properties: CsrkProperties::AUTH,
        csrk,
    })
}

fn arb_link_key() -> impl Strategy<Value = SmpLinkKey> {
    (0u8..=8, any::<[u8; 16]>(), 0u8..=16)
        .prop_filter("non-zero key", |(_, k, _)| k.iter().any(|b| *b != 0))
        .prop_map(|(key_type, key, pin_length)| SmpLinkKey {
            responder: false,
            key_type,
            key,
            pin_length,
        })
}

fn arb_mask() -> impl Strategy<Value = SmpKeyType> {
    (0u8..16).prop_map(SmpKeyType::from_bits_truncate)
}

fn arb_pairing_data() -> impl Strategy<Value = PairingData> {
    (
        prop_oneof![
            Just(BtSecurityLevel::None),
            Just(BtSecurityLevel::EncOnly),
            Just(BtSecurityLevel::EncAuth),
            Just(BtSecurityLevel::EncAuthFips),
        ],
        (0u8..=4).prop_map(SmpIoCapability::from_u8),
        arb_mask(),
        arb_mask(),
        (arb_ltk(false), arb_ltk(true)),
        (arb_csrk(), arb_csrk()),
        (arb_link_key(), arb_link_key()),
    )
        .prop_map(
            |(sec, io, init, resp, (li, lr), (ci, cr), (ki, kr))| PairingData {
                state: SmpPairingState::Completed,
                sec_level_conn: sec,
                io_cap_conn: io,
                keys_init_has: init,
                keys_resp_has: resp,
                ltk_init: li,
                ltk_resp: lr,
                csrk_init: ci,
                csrk_resp: cr,
                lk_init: ki,
                lk_resp: kr,
                ..PairingData::default()
            },
        )
}

proptest! {
    /// Property: write then read yields an equal, valid bin with a consistent size
    #[test]
    fn write_read_round_trip(addr in arb_addr(), pd in arb_pairing_data()) {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = SmpKeyBin::create(addr, &pd);
        prop_assert!(bin.is_valid());

        prop_assert!(bin.write(dir.path(), true).expect("write"));
        let back = SmpKeyBin::read(dir.path(), &addr)
            .expect("read")
            .expect("bin present");

        prop_assert!(back.is_valid());
        prop_assert_eq!(back.calc_size(), back.size);
        prop_assert_eq!(&back, &bin);
    }

    /// Property: the encoded length always equals the self-reported size
    #[test]
    fn encoded_length_matches_size(addr in arb_addr(), pd in arb_pairing_data()) {
        let bin = SmpKeyBin::create(addr, &pd);
        prop_assert_eq!(bin.encode().len(), bin.size as usize);
    }

    /// Property: flipping the size field is always detected
    #[test]
    fn size_tampering_is_rejected(addr in arb_addr(), pd in arb_pairing_data(), delta in 1u16..64) {
        let mut bytes = SmpKeyBin::create(addr, &pd).encode();
        let size = u16::from_le_bytes([bytes[2], bytes[3]]).wrapping_add(delta);
        bytes[2..4].copy_from_slice(&size.to_le_bytes());
        prop_assert!(SmpKeyBin::decode(&bytes).is_err());
    }
}
