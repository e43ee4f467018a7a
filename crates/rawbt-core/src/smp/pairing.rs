//! Per-device pairing data

use crate::smp::keys::{
    SmpIdentityResolvingKey, SmpLinkKey, SmpLongTermKey, SmpSignatureResolvingKey,
};
use crate::smp::types::{
    BtSecurityLevel, PairingMode, SmpAuthReqs, SmpIoCapability, SmpKeyType, SmpPairingState,
};

/// Security request, negotiation result and key material of one remote device.
///
/// `*_init` keys were distributed by the initiator (central), `*_resp` keys by
/// the responder (peripheral).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingData {
    /// Security level requested by the user before connecting
    pub sec_level_user: BtSecurityLevel,
    /// IO capability requested by the user before connecting
    pub io_cap_user: SmpIoCapability,
    /// Security level in effect on the current connection
    pub sec_level_conn: BtSecurityLevel,
    /// IO capability used on the current connection
    pub io_cap_conn: SmpIoCapability,

    pub state: SmpPairingState,
    pub mode: PairingMode,
    /// Peer sent a Security Request
    pub res_requested_sec: bool,
    pub use_sc: bool,
    pub encrypted: bool,

    pub auth_req_init: SmpAuthReqs,
    pub auth_req_resp: SmpAuthReqs,
    pub io_cap_init: SmpIoCapability,
    pub io_cap_resp: SmpIoCapability,
    pub oob_init: bool,
    pub oob_resp: bool,
    pub max_key_size_init: u8,
    pub max_key_size_resp: u8,

    /// Keys the negotiation promised
    pub keys_init_exp: SmpKeyType,
    pub keys_resp_exp: SmpKeyType,
    /// Keys actually held
    pub keys_init_has: SmpKeyType,
    pub keys_resp_has: SmpKeyType,

    pub ltk_init: SmpLongTermKey,
    pub ltk_resp: SmpLongTermKey,
    pub irk_init: SmpIdentityResolvingKey,
    pub irk_resp: SmpIdentityResolvingKey,
    pub csrk_init: SmpSignatureResolvingKey,
    pub csrk_resp: SmpSignatureResolvingKey,
    pub lk_init: SmpLinkKey,
    pub lk_resp: SmpLinkKey,
}

impl Default for PairingData {
    fn default() -> Self {
        Self {
            sec_level_user: BtSecurityLevel::Unset,
            io_cap_user: SmpIoCapability::Unset,
            sec_level_conn: BtSecurityLevel::Unset,
            io_cap_conn: SmpIoCapability::Unset,
            state: SmpPairingState::None,
            mode: PairingMode::None,
            res_requested_sec: false,
            use_sc: false,
            encrypted: false,
            auth_req_init: SmpAuthReqs::empty(),
            auth_req_resp: SmpAuthReqs::empty(),
            io_cap_init: SmpIoCapability::Unset,
            io_cap_resp: SmpIoCapability::Unset,
            oob_init: false,
            oob_resp: false,
            max_key_size_init: 0,
            max_key_size_resp: 0,
            keys_init_exp: SmpKeyType::empty(),
            keys_resp_exp: SmpKeyType::empty(),
            keys_init_has: SmpKeyType::empty(),
            keys_resp_has: SmpKeyType::empty(),
            ltk_init: SmpLongTermKey::default(),
            ltk_resp: SmpLongTermKey::default(),
            irk_init: SmpIdentityResolvingKey::default(),
            irk_resp: SmpIdentityResolvingKey::default(),
            csrk_init: SmpSignatureResolvingKey::default(),
            csrk_resp: SmpSignatureResolvingKey::default(),
            lk_init: SmpLinkKey::default(),
            lk_resp: SmpLinkKey::default(),
        }
    }
}

impl PairingData {
    /// Reset negotiation state at connect or disconnect, keeping keys and the user request
    pub fn reset_transient(&mut self) {
        let pre_paired = self.mode == PairingMode::PrePaired;
        self.state = SmpPairingState::None;
        self.mode = if pre_paired {
            PairingMode::PrePaired
        } else {
            PairingMode::None
        };
        self.res_requested_sec = false;
        self.encrypted = false;
        self.auth_req_init = SmpAuthReqs::empty();
        self.auth_req_resp = SmpAuthReqs::empty();
        self.io_cap_init = SmpIoCapability::Unset;
        self.io_cap_resp = SmpIoCapability::Unset;
        self.oob_init = false;
        self.oob_resp = false;
        self.keys_init_exp = SmpKeyType::empty();
        self.keys_resp_exp = SmpKeyType::empty();
    }

    /// Forget all key material and the pre-paired mode
    pub fn clear_keys(&mut self) {
        self.keys_init_has = SmpKeyType::empty();
        self.keys_resp_has = SmpKeyType::empty();
        self.ltk_init = SmpLongTermKey::default();
        self.ltk_resp = SmpLongTermKey::default();
        self.irk_init = SmpIdentityResolvingKey::default();
        self.irk_resp = SmpIdentityResolvingKey::default();
        self.csrk_init = SmpSignatureResolvingKey::default();
        self.csrk_resp = SmpSignatureResolvingKey::default();
        self.lk_init = SmpLinkKey::default();
        self.lk_resp = SmpLinkKey::default();
        if self.mode == PairingMode::PrePaired {
            self.mode = PairingMode::None;
        }
    }

    /// Long term key usable to start encryption as central
    pub fn encryption_ltk(&self) -> Option<SmpLongTermKey> {
        let has = |mask: SmpKeyType, ltk: &SmpLongTermKey| {
            mask.contains(SmpKeyType::ENC_KEY) && ltk.is_valid()
        };
        if has(self.keys_resp_has, &self.ltk_resp) {
            Some(self.ltk_resp)
        } else if has(self.keys_init_has, &self.ltk_init) {
            Some(self.ltk_init)
        } else {
            None
        }
    }

    /// Whether every key the negotiation promised has arrived
    pub fn all_keys_received(&self) -> bool {
        self.keys_resp_has.contains(self.keys_resp_exp)
            && self.keys_init_has.contains(self.keys_init_exp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_keeps_keys_and_pre_paired_mode() {
        let mut pd = PairingData {
            mode: PairingMode::PrePaired,
            state: SmpPairingState::Completed,
            keys_resp_has: SmpKeyType::ENC_KEY,
            ..PairingData::default()
        };
        pd.ltk_resp.enc_size = 16;
        pd.ltk_resp.ltk = [7; 16];
        pd.reset_transient();
        assert_eq!(pd.state, SmpPairingState::None);
        assert_eq!(pd.mode, PairingMode::PrePaired);
        assert!(pd.encryption_ltk().is_some());
        pd.clear_keys();
        assert_eq!(pd.mode, PairingMode::None);
        assert!(pd.encryption_ltk().is_none());
    }

    #[test]
    fn key_arrival_tracking() {
        let mut pd = PairingData {
            keys_resp_exp: SmpKeyType::ENC_KEY | SmpKeyType::ID_KEY,
            ..PairingData::default()
        };
        pd.keys_resp_has |= SmpKeyType::ENC_KEY;
        assert!(!pd.all_keys_received());
        pd.keys_resp_has |= SmpKeyType::ID_KEY;
        assert!(pd.all_keys_received());
    }
}
