//! Scripted SMP responder
//!
//! Plays the remote side of LE legacy Just Works pairing and distributes its
//! LTK once the link is encrypted. Values come from [`FakeSmpCrypto`], so the
//! peer agrees with a stack configured with the same crypto.

use rawbt_core::smp::pdu::code;
use rawbt_core::smp::{
    LtkProperties, PairingFeatures, SmpAddress, SmpAuthReqs, SmpCrypto, SmpIoCapability,
    SmpKeyType, SmpLongTermKey, SmpPdu, SmpReason,
};
use tracing::debug;

use crate::crypto::FakeSmpCrypto;

const PEER_RAND: u128 = 0x5eed_0000_0000_0000_0000_0000_0000_0001;

#[derive(Debug, Clone)]
pub struct SmpPeerConfig {
    pub io_capability: SmpIoCapability,
    pub auth_req: SmpAuthReqs,
    /// Keys this peer offers to distribute
    pub responder_keys: SmpKeyType,
    pub ltk: SmpLongTermKey,
    /// Answer the Pairing Request with Pairing Failed
    pub reject_with: Option<SmpReason>,
    /// Corrupt the confirm value
    pub bad_confirm: bool,
    /// Stay silent after the Pairing Response
    pub stall_after_response: bool,
}

impl Default for SmpPeerConfig {
    fn default() -> Self {
        Self {
            io_capability: SmpIoCapability::NoInputNoOutput,
            auth_req: SmpAuthReqs::BONDING,
            responder_keys: SmpKeyType::ENC_KEY,
            ltk: SmpLongTermKey {
                properties: LtkProperties::RESPONDER,
                enc_size: 16,
                ediv: 0x1234,
                rand: 0x0102_0304_0506_0708,
                ltk: [0x5a; 16],
            },
            reject_with: None,
            bad_confirm: false,
            stall_after_response: false,
        }
    }
}

/// Remote responder of one connection
#[derive(Debug)]
pub struct SmpPeer {
    config: SmpPeerConfig,
    crypto: FakeSmpCrypto,
    initiator: SmpAddress,
    responder: SmpAddress,
    preq: [u8; 7],
    pres: [u8; 7],
    mconfirm: u128,
    resp_dist: SmpKeyType,
    received: Vec<SmpPdu>,
    paired: bool,
}

impl SmpPeer {
    pub fn new(initiator: SmpAddress, responder: SmpAddress, config: SmpPeerConfig) -> Self {
        Self {
            config,
            crypto: FakeSmpCrypto,
            initiator,
            responder,
            preq: [0; 7],
            pres: [0; 7],
            mconfirm: 0,
            resp_dist: SmpKeyType::empty(),
            received: Vec::new(),
            paired: false,
        }
    }

    pub fn received(&self) -> &[SmpPdu] {
        &self.received
    }

    pub fn distributed_ltk(&self) -> SmpLongTermKey {
        self.config.ltk
    }

    /// Random and confirm exchanged successfully
    pub fn is_paired(&self) -> bool {
        self.paired
    }

    fn confirm(&self, rand: u128) -> u128 {
        self.crypto
            .c1(0, rand, self.preq, self.pres, &self.initiator, &self.responder)
    }

    /// Replies to one PDU from the initiator
    pub fn on_pdu(&mut self, pdu: &SmpPdu) -> Vec<SmpPdu> {
        debug!("SMP peer <- {:?}", pdu);
        self.received.push(pdu.clone());
        match pdu {
            SmpPdu::PairingRequest(req) => {
                if let Some(reason) = self.config.reject_with {
                    return vec![SmpPdu::PairingFailed(reason)];
                }
                self.resp_dist = req.responder_key_dist & self.config.responder_keys;
                let rsp = PairingFeatures {
                    io_capability: self.config.io_capability,
                    oob_data_present: false,
                    auth_req: self.config.auth_req,
                    max_encryption_key_size: 16,
                    initiator_key_dist: SmpKeyType::empty(),
                    responder_key_dist: self.resp_dist,
                };
                self.preq = req.pdu_bytes(code::PAIRING_REQUEST);
                self.pres = rsp.pdu_bytes(code::PAIRING_RESPONSE);
                vec![SmpPdu::PairingResponse(rsp)]
            }
            SmpPdu::PairingConfirm(value) => {
                if self.config.stall_after_response {
                    return Vec::new();
                }
                self.mconfirm = *value;
                let mut sconfirm = self.confirm(PEER_RAND);
                if self.config.bad_confirm {
                    sconfirm ^= 1;
                }
                vec![SmpPdu::PairingConfirm(sconfirm)]
            }
            SmpPdu::PairingRandom(mrand) => {
                if self.confirm(*mrand) != self.mconfirm {
                    return vec![SmpPdu::PairingFailed(SmpReason::ConfirmValueFailed)];
                }
                self.paired = true;
                vec![SmpPdu::PairingRandom(PEER_RAND)]
            }
            _ => Vec::new(),
        }
    }

    /// Key distribution once the initiator enabled encryption
    pub fn on_encrypted(&mut self) -> Vec<SmpPdu> {
        if !self.paired || !self.resp_dist.contains(SmpKeyType::ENC_KEY) {
            return Vec::new();
        }
        let ltk = self.config.ltk;
        vec![
            SmpPdu::EncryptionInformation(ltk.ltk),
            SmpPdu::MasterIdentification {
                ediv: ltk.ediv,
                rand: ltk.rand,
            },
        ]
    }

    /// STK the initiator must use to encrypt
    pub fn expected_stk(&self, mrand: u128) -> u128 {
        self.crypto.s1(0, PEER_RAND, mrand)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rawbt_core::{BdAddress, BdAddressType};

    fn peer(config: SmpPeerConfig) -> SmpPeer {
        SmpPeer::new(
            SmpAddress::new(BdAddress::new([1; 6]), BdAddressType::BdAddrLePublic),
            SmpAddress::new(BdAddress::new([2; 6]), BdAddressType::BdAddrLeRandom),
            config,
        )
    }

    fn request() -> PairingFeatures {
        PairingFeatures {
            io_capability: SmpIoCapability::NoInputNoOutput,
            oob_data_present: false,
            auth_req: SmpAuthReqs::BONDING,
            max_encryption_key_size: 16,
            initiator_key_dist: SmpKeyType::empty(),
            responder_key_dist: SmpKeyType::ENC_KEY,
        }
    }

    #[test]
    fn just_works_exchange() {
        let mut p = peer(SmpPeerConfig::default());
        let crypto = FakeSmpCrypto;
        let req = request();
        let rsp = match p.on_pdu(&SmpPdu::PairingRequest(req)).pop() {
            Some(SmpPdu::PairingResponse(rsp)) => rsp,
            other => panic!("unexpected {:?}", other),
        };
        let preq = req.pdu_bytes(code::PAIRING_REQUEST);
        let pres = rsp.pdu_bytes(code::PAIRING_RESPONSE);
        let mrand = 77u128;
        let mconfirm = crypto.c1(0, mrand, preq, pres, &p.initiator, &p.responder);
        let sconfirm = match p.on_pdu(&SmpPdu::PairingConfirm(mconfirm)).pop() {
            Some(SmpPdu::PairingConfirm(v)) => v,
            other => panic!("unexpected {:?}", other),
        };
        let srand = match p.on_pdu(&SmpPdu::PairingRandom(mrand)).pop() {
            Some(SmpPdu::PairingRandom(v)) => v,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(
            crypto.c1(0, srand, preq, pres, &p.initiator, &p.responder),
            sconfirm
        );
        assert_eq!(p.on_encrypted().len(), 2);
    }

    #[test]
    fn rejects_when_scripted() {
        let mut p = peer(SmpPeerConfig {
            reject_with: Some(SmpReason::PairingNotSupported),
            ..SmpPeerConfig::default()
        });
        assert_eq!(
            p.on_pdu(&SmpPdu::PairingRequest(request())),
            vec![SmpPdu::PairingFailed(SmpReason::PairingNotSupported)]
        );
    }
}
