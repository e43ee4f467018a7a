//! Initiator side of the Security Manager Protocol
//!
//! [`SmpSession`] is a pure state machine: it consumes PDUs, controller
//! results and user input, updates the device's [`PairingData`] and returns
//! the actions the caller must carry out (send a PDU, start encryption, ask
//! the controller for a DHKey, notify listeners). It never touches I/O, so a
//! device can drive it while holding its own lock.
//!
//! Supported association models:
//! - LE Secure Connections: Just Works, Numeric Comparison, Passkey Entry
//! - LE legacy: Just Works, Passkey Entry
//!
//! Out-of-band data is never available, an OOB negotiation fails.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rawbt_core::smp::crypto::{numeric_comparison_value, sc_io_cap};
use rawbt_core::smp::pdu::code;
use rawbt_core::smp::{
    BtSecurityLevel, CsrkProperties, LtkProperties, PairingData, PairingFeatures, PairingMode,
    SmpAddress, SmpAuthReqs, SmpCrypto, SmpIoCapability, SmpKeyType, SmpLongTermKey,
    SmpPairingState, SmpPdu, SmpReason, SmpSignatureResolvingKey,
};
use rawbt_core::{BdAddressType, HciStatusCode};
use smallvec::SmallVec;
use tracing::{debug, warn};

/// Passkey Entry runs one confirm/random exchange per passkey bit
const PASSKEY_ROUNDS: u8 = 20;
const PASSKEY_MAX: u32 = 999_999;
const MIN_KEY_SIZE: u8 = 7;

/// Keys requested from the responder
const REQUESTED_RESPONDER_KEYS: SmpKeyType = SmpKeyType::ENC_KEY
    .union(SmpKeyType::ID_KEY)
    .union(SmpKeyType::SIGN_KEY);

// ----------------------------------------------------------------------------
// Actions
// ----------------------------------------------------------------------------

/// Work the caller performs on behalf of the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmpAction {
    Send(SmpPdu),
    /// LE Generate DHKey with the peer's public key
    GenerateDhKey(Box<[u8; 64]>),
    /// LE Enable Encryption with a short or long term key
    StartEncryption(SmpLongTermKey),
    /// A long term key became known
    NewLongTermKey(SmpLongTermKey),
    StateChanged(SmpPairingState, PairingMode),
}

pub type SmpActions = SmallVec<[SmpAction; 4]>;

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitResponse,
    AwaitPasskey,
    AwaitPublicKey,
    AwaitConfirm,
    AwaitRandom,
    AwaitNumeric,
    AwaitDhKeyCheck,
    AwaitEncryption,
    KeyDistribution,
    Done,
}

/// Addresses and local capabilities of one pairing attempt
#[derive(Debug, Clone)]
pub struct SmpSessionParams {
    pub local: SmpAddress,
    pub remote: SmpAddress,
    /// Local P-256 key, `Some` when Secure Connections are usable
    pub local_public_key: Option<Box<[u8; 64]>>,
    pub max_key_size: u8,
}

pub struct SmpSession {
    crypto: Arc<dyn SmpCrypto>,
    rng: StdRng,
    local: SmpAddress,
    remote: SmpAddress,
    local_pk: Option<Box<[u8; 64]>>,
    max_key_size: u8,

    phase: Phase,
    started_at: u64,
    preq: Option<PairingFeatures>,
    pres: Option<PairingFeatures>,
    enc_size: u8,

    tk: u128,
    passkey: Option<u32>,
    displayed_passkey: Option<u32>,
    numeric_value: Option<u32>,
    round: u8,

    local_rand: u128,
    remote_rand: u128,
    remote_confirm: u128,

    remote_pk: Option<Box<[u8; 64]>>,
    dhkey: Option<[u8; 32]>,
    check_pending: bool,
    mac_key: u128,
    pending_ltk: Option<[u8; 16]>,
}

impl SmpSession {
    pub fn new(params: SmpSessionParams, crypto: Arc<dyn SmpCrypto>) -> Self {
        Self {
            crypto,
            rng: StdRng::from_entropy(),
            local: params.local,
            remote: params.remote,
            local_pk: params.local_public_key,
            max_key_size: params.max_key_size.clamp(MIN_KEY_SIZE, 16),
            phase: Phase::Idle,
            started_at: 0,
            preq: None,
            pres: None,
            enc_size: 0,
            tk: 0,
            passkey: None,
            displayed_passkey: None,
            numeric_value: None,
            round: 0,
            local_rand: 0,
            remote_rand: 0,
            remote_confirm: 0,
            remote_pk: None,
            dhkey: None,
            check_pending: false,
            mac_key: 0,
            pending_ltk: None,
        }
    }

    /// Deterministic randoms
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.phase, Phase::Idle | Phase::Done)
    }

    pub fn is_secure_connections(&self) -> bool {
        self.uses_sc()
    }

    /// Passkey the user must type on the peer
    pub fn displayed_passkey(&self) -> Option<u32> {
        self.displayed_passkey
    }

    /// Six-digit value to compare with the peer's display
    pub fn numeric_value(&self) -> Option<u32> {
        self.numeric_value
    }

    /// Waiting for the controller's DHKey
    pub fn awaits_dhkey(&self) -> bool {
        self.is_active() && self.remote_pk.is_some() && self.dhkey.is_none()
    }

    /// Attempt stuck mid-exchange past `timeout_ms`
    pub fn is_stalled(&self, now_ms: u64, timeout_ms: u64) -> bool {
        self.is_active() && now_ms.saturating_sub(self.started_at) > timeout_ms
    }

    fn uses_sc(&self) -> bool {
        match (&self.preq, &self.pres) {
            (Some(req), Some(rsp)) => {
                req.auth_req.contains(SmpAuthReqs::SECURE_CONNECTIONS)
                    && rsp.auth_req.contains(SmpAuthReqs::SECURE_CONNECTIONS)
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------------
    // Feature Exchange
    // ------------------------------------------------------------------------

    /// Send the Pairing Request for the security requested in `pd`
    pub fn start(&mut self, pd: &mut PairingData, now_ms: u64) -> SmpActions {
        let mut out = SmpActions::new();
        self.started_at = now_ms;
        pd.mode = PairingMode::Negotiating;
        if pd.sec_level_conn == BtSecurityLevel::EncAuthFips && self.local_pk.is_none() {
            warn!("SMP: {:?} needs Secure Connections, unsupported locally", pd.sec_level_conn);
            self.fail(pd, SmpReason::AuthenticationRequirements, false, &mut out);
            return out;
        }
        let io_cap = match pd.io_cap_conn {
            SmpIoCapability::Unset => SmpIoCapability::NoInputNoOutput,
            cap => cap,
        };
        let mut auth_req = SmpAuthReqs::BONDING;
        if pd.sec_level_conn >= BtSecurityLevel::EncAuth {
            auth_req |= SmpAuthReqs::MITM;
        }
        if self.local_pk.is_some() {
            auth_req |= SmpAuthReqs::SECURE_CONNECTIONS;
        }
        let req = PairingFeatures {
            io_capability: io_cap,
            oob_data_present: false,
            auth_req,
            max_encryption_key_size: self.max_key_size,
            initiator_key_dist: SmpKeyType::empty(),
            responder_key_dist: REQUESTED_RESPONDER_KEYS,
        };
        pd.io_cap_conn = io_cap;
        pd.auth_req_init = auth_req;
        pd.io_cap_init = io_cap;
        pd.oob_init = false;
        pd.max_key_size_init = self.max_key_size;
        self.preq = Some(req);
        self.phase = Phase::AwaitResponse;
        out.push(SmpAction::Send(SmpPdu::PairingRequest(req)));
        self.set_state(pd, SmpPairingState::FeatureExchangeStarted, &mut out);
        out
    }

    fn on_response(&mut self, pd: &mut PairingData, rsp: PairingFeatures, out: &mut SmpActions) {
        let req = match self.preq {
            Some(req) => req,
            None => return self.fail(pd, SmpReason::UnspecifiedReason, true, out),
        };
        self.pres = Some(rsp);
        pd.auth_req_resp = rsp.auth_req;
        pd.io_cap_resp = rsp.io_capability;
        pd.oob_resp = rsp.oob_data_present;
        pd.max_key_size_resp = rsp.max_encryption_key_size;

        self.enc_size = req
            .max_encryption_key_size
            .min(rsp.max_encryption_key_size);
        if self.enc_size < MIN_KEY_SIZE {
            return self.fail(pd, SmpReason::EncryptionKeySize, true, out);
        }
        let sc = self.uses_sc();
        let mitm = req.auth_req.contains(SmpAuthReqs::MITM) || rsp.auth_req.contains(SmpAuthReqs::MITM);
        let oob = if sc {
            req.oob_data_present || rsp.oob_data_present
        } else {
            req.oob_data_present && rsp.oob_data_present
        };
        let mode = PairingMode::determine(req.io_capability, rsp.io_capability, mitm, sc, oob);
        pd.use_sc = sc;
        pd.mode = mode;
        debug!(
            "SMP: negotiated {:?}, sc {}, key size {}",
            mode, sc, self.enc_size
        );

        if pd.sec_level_conn >= BtSecurityLevel::EncAuth && !mode.is_authenticated() {
            return self.fail(pd, SmpReason::AuthenticationRequirements, true, out);
        }
        if pd.sec_level_conn == BtSecurityLevel::EncAuthFips && !sc {
            return self.fail(pd, SmpReason::AuthenticationRequirements, true, out);
        }

        // SC derives the LTK, so it is never distributed
        let derived = if sc { SmpKeyType::ENC_KEY } else { SmpKeyType::empty() };
        pd.keys_init_exp = (rsp.initiator_key_dist & req.initiator_key_dist) - derived;
        pd.keys_resp_exp = (rsp.responder_key_dist & req.responder_key_dist) - derived;
        self.set_state(pd, SmpPairingState::FeatureExchangeCompleted, out);

        if mode == PairingMode::OutOfBand {
            self.set_state(pd, SmpPairingState::OobExpected, out);
            return self.fail(pd, SmpReason::OobNotAvailable, true, out);
        }
        if sc {
            let pk = match self.local_pk.as_deref() {
                Some(pk) => *pk,
                None => return self.fail(pd, SmpReason::UnspecifiedReason, true, out),
            };
            out.push(SmpAction::Send(SmpPdu::PairingPublicKey(pk)));
            self.phase = Phase::AwaitPublicKey;
            return;
        }
        match mode {
            PairingMode::PasskeyEntryIni => {
                self.phase = Phase::AwaitPasskey;
                self.set_state(pd, SmpPairingState::PasskeyExpected, out);
            }
            PairingMode::PasskeyEntryRes => {
                let passkey = self.generate_passkey();
                self.tk = passkey as u128;
                self.set_state(pd, SmpPairingState::PasskeyExpected, out);
                self.send_legacy_confirm(out);
            }
            _ => {
                self.tk = 0;
                self.send_legacy_confirm(out);
            }
        }
    }

    fn generate_passkey(&mut self) -> u32 {
        let passkey = self.rng.gen_range(0..=PASSKEY_MAX);
        self.displayed_passkey = Some(passkey);
        passkey
    }

    // ------------------------------------------------------------------------
    // Legacy Pairing
    // ------------------------------------------------------------------------

    fn legacy_confirm(&self, rand: u128) -> Option<u128> {
        let preq = self.preq?.pdu_bytes(code::PAIRING_REQUEST);
        let pres = self.pres?.pdu_bytes(code::PAIRING_RESPONSE);
        Some(
            self.crypto
                .c1(self.tk, rand, preq, pres, &self.local, &self.remote),
        )
    }

    fn send_legacy_confirm(&mut self, out: &mut SmpActions) {
        self.local_rand = self.rng.gen();
        if let Some(confirm) = self.legacy_confirm(self.local_rand) {
            out.push(SmpAction::Send(SmpPdu::PairingConfirm(confirm)));
            self.phase = Phase::AwaitConfirm;
        }
    }

    fn on_legacy_random(&mut self, pd: &mut PairingData, srand: u128, out: &mut SmpActions) {
        if self.legacy_confirm(srand) != Some(self.remote_confirm) {
            return self.fail(pd, SmpReason::ConfirmValueFailed, true, out);
        }
        self.remote_rand = srand;
        let stk = self.crypto.s1(self.tk, srand, self.local_rand);
        let mut properties = LtkProperties::empty();
        if pd.mode.is_authenticated() {
            properties |= LtkProperties::AUTH;
        }
        self.phase = Phase::AwaitEncryption;
        out.push(SmpAction::StartEncryption(SmpLongTermKey {
            properties,
            enc_size: self.enc_size,
            ediv: 0,
            rand: 0,
            ltk: truncate_key(stk, self.enc_size),
        }));
    }

    // ------------------------------------------------------------------------
    // Secure Connections
    // ------------------------------------------------------------------------

    fn pk_x(pk: &[u8; 64]) -> [u8; 32] {
        let mut x = [0u8; 32];
        x.copy_from_slice(&pk[..32]);
        x
    }

    fn on_public_key(&mut self, pd: &mut PairingData, pk: [u8; 64], out: &mut SmpActions) {
        if self.local_pk.as_deref() == Some(&pk) {
            return self.fail(pd, SmpReason::InvalidParameters, true, out);
        }
        self.remote_pk = Some(Box::new(pk));
        out.push(SmpAction::GenerateDhKey(Box::new(pk)));
        match pd.mode {
            PairingMode::PasskeyEntryIni => {
                self.phase = Phase::AwaitPasskey;
                self.set_state(pd, SmpPairingState::PasskeyExpected, out);
            }
            PairingMode::PasskeyEntryRes => {
                let passkey = self.generate_passkey();
                self.passkey = Some(passkey);
                self.round = 0;
                self.set_state(pd, SmpPairingState::PasskeyExpected, out);
                self.send_passkey_round(out);
            }
            _ => {
                // Responder commits first in Just Works and Numeric Comparison
                self.local_rand = self.rng.gen();
                self.phase = Phase::AwaitConfirm;
            }
        }
    }

    fn keys_x(&self) -> Option<([u8; 32], [u8; 32])> {
        let local = self.local_pk.as_deref()?;
        let remote = self.remote_pk.as_deref()?;
        Some((Self::pk_x(local), Self::pk_x(remote)))
    }

    fn passkey_bit(&self) -> u8 {
        let passkey = self.passkey.unwrap_or(0);
        0x80 | ((passkey >> self.round) & 1) as u8
    }

    fn send_passkey_round(&mut self, out: &mut SmpActions) {
        let (pkax, pkbx) = match self.keys_x() {
            Some(keys) => keys,
            None => return,
        };
        self.local_rand = self.rng.gen();
        let confirm = self
            .crypto
            .f4(&pkax, &pkbx, self.local_rand, self.passkey_bit());
        out.push(SmpAction::Send(SmpPdu::PairingConfirm(confirm)));
        self.phase = Phase::AwaitConfirm;
    }

    fn on_sc_random(&mut self, pd: &mut PairingData, nb: u128, out: &mut SmpActions) {
        let (pkax, pkbx) = match self.keys_x() {
            Some(keys) => keys,
            None => return self.fail(pd, SmpReason::UnspecifiedReason, true, out),
        };
        self.remote_rand = nb;
        let passkey_entry = matches!(
            pd.mode,
            PairingMode::PasskeyEntryIni | PairingMode::PasskeyEntryRes
        );
        let z = if passkey_entry { self.passkey_bit() } else { 0 };
        if self.crypto.f4(&pkbx, &pkax, nb, z) != self.remote_confirm {
            return self.fail(pd, SmpReason::ConfirmValueFailed, true, out);
        }
        if passkey_entry {
            self.round += 1;
            if self.round < PASSKEY_ROUNDS {
                return self.send_passkey_round(out);
            }
            return self.dhkey_check(pd, out);
        }
        if pd.mode == PairingMode::NumericCompareIni {
            let g2 = self.crypto.g2(&pkax, &pkbx, self.local_rand, nb);
            self.numeric_value = Some(numeric_comparison_value(g2));
            self.phase = Phase::AwaitNumeric;
            return self.set_state(pd, SmpPairingState::NumericCompareExpected, out);
        }
        self.dhkey_check(pd, out)
    }

    fn r_value(&self) -> u128 {
        self.passkey.map(|p| p as u128).unwrap_or(0)
    }

    /// Compute MacKey and LTK and send Ea, once the DHKey is known
    fn dhkey_check(&mut self, pd: &mut PairingData, out: &mut SmpActions) {
        let dhkey = match self.dhkey {
            Some(dhkey) => dhkey,
            None => {
                self.check_pending = true;
                self.phase = Phase::AwaitDhKeyCheck;
                return;
            }
        };
        self.check_pending = false;
        let (mac_key, ltk) =
            self.crypto
                .f5(&dhkey, self.local_rand, self.remote_rand, &self.local, &self.remote);
        self.mac_key = mac_key;
        self.pending_ltk = Some(truncate_key(ltk, self.enc_size));
        let io_a = sc_io_cap(pd.auth_req_init.bits(), pd.oob_init, pd.io_cap_init.as_u8());
        let ea = self.crypto.f6(
            mac_key,
            self.local_rand,
            self.remote_rand,
            self.r_value(),
            io_a,
            &self.local,
            &self.remote,
        );
        out.push(SmpAction::Send(SmpPdu::PairingDhKeyCheck(ea)));
        self.phase = Phase::AwaitDhKeyCheck;
    }

    fn on_dhkey_check(&mut self, pd: &mut PairingData, eb: u128, out: &mut SmpActions) {
        let ltk = match self.pending_ltk.take() {
            Some(ltk) if !self.check_pending => ltk,
            _ => return self.fail(pd, SmpReason::UnspecifiedReason, true, out),
        };
        let io_b = sc_io_cap(pd.auth_req_resp.bits(), pd.oob_resp, pd.io_cap_resp.as_u8());
        let expected = self.crypto.f6(
            self.mac_key,
            self.remote_rand,
            self.local_rand,
            self.r_value(),
            io_b,
            &self.remote,
            &self.local,
        );
        if expected != eb {
            return self.fail(pd, SmpReason::DhKeyCheckFailed, true, out);
        }
        let mut properties = LtkProperties::AUTH_SC;
        if pd.mode.is_authenticated() {
            properties |= LtkProperties::AUTH;
        }
        let key = SmpLongTermKey {
            properties,
            enc_size: self.enc_size,
            ediv: 0,
            rand: 0,
            ltk,
        };
        pd.ltk_init = key;
        pd.keys_init_has |= SmpKeyType::ENC_KEY;
        self.phase = Phase::AwaitEncryption;
        out.push(SmpAction::StartEncryption(key));
        out.push(SmpAction::NewLongTermKey(key));
    }

    /// Result of LE Generate DHKey
    pub fn on_dhkey(&mut self, pd: &mut PairingData, status: HciStatusCode, dhkey: [u8; 32]) -> SmpActions {
        let mut out = SmpActions::new();
        if self.remote_pk.is_none() || !self.is_active() || self.dhkey.is_some() {
            return out;
        }
        if !status.is_success() {
            warn!("SMP: DHKey generation failed: {}", status);
            self.fail(pd, SmpReason::DhKeyCheckFailed, true, &mut out);
            return out;
        }
        self.dhkey = Some(dhkey);
        if self.check_pending {
            self.dhkey_check(pd, &mut out);
        }
        out
    }

    // ------------------------------------------------------------------------
    // Encryption and Key Distribution
    // ------------------------------------------------------------------------

    /// Encryption Change for the link, relevant only while the session awaits it
    pub fn on_encryption_changed(
        &mut self,
        pd: &mut PairingData,
        status: HciStatusCode,
        enabled: bool,
    ) -> SmpActions {
        let mut out = SmpActions::new();
        if self.phase != Phase::AwaitEncryption {
            return out;
        }
        if !status.is_success() || !enabled {
            warn!("SMP: encryption with the new key failed: {}", status);
            self.fail(pd, SmpReason::UnspecifiedReason, true, &mut out);
            return out;
        }
        pd.encrypted = true;
        pd.sec_level_conn = match (pd.use_sc, pd.mode.is_authenticated()) {
            (true, true) => BtSecurityLevel::EncAuthFips,
            (_, true) => BtSecurityLevel::EncAuth,
            _ => BtSecurityLevel::EncOnly,
        };
        self.phase = Phase::KeyDistribution;
        self.set_state(pd, SmpPairingState::KeyDistribution, &mut out);
        self.maybe_complete(pd, &mut out);
        out
    }

    fn on_key_pdu(&mut self, pd: &mut PairingData, pdu: SmpPdu, out: &mut SmpActions) {
        let auth = pd.mode.is_authenticated();
        match pdu {
            SmpPdu::EncryptionInformation(ltk) => self.pending_ltk = Some(ltk),
            SmpPdu::MasterIdentification { ediv, rand } => {
                let ltk = match self.pending_ltk.take() {
                    Some(ltk) => ltk,
                    None => return self.fail(pd, SmpReason::UnspecifiedReason, true, out),
                };
                let mut properties = LtkProperties::RESPONDER;
                if auth {
                    properties |= LtkProperties::AUTH;
                }
                pd.ltk_resp = SmpLongTermKey {
                    properties,
                    enc_size: self.enc_size,
                    ediv,
                    rand,
                    ltk,
                };
                pd.keys_resp_has |= SmpKeyType::ENC_KEY;
                out.push(SmpAction::NewLongTermKey(pd.ltk_resp));
            }
            SmpPdu::IdentityInformation(irk) => {
                pd.irk_resp.responder = true;
                pd.irk_resp.irk = irk;
            }
            SmpPdu::IdentityAddressInformation {
                address_type,
                address,
            } => {
                pd.irk_resp.id_address = address;
                pd.irk_resp.id_address_type = Some(if address_type == 0 {
                    BdAddressType::BdAddrLePublic
                } else {
                    BdAddressType::BdAddrLeRandom
                });
                pd.keys_resp_has |= SmpKeyType::ID_KEY;
            }
            SmpPdu::SigningInformation(csrk) => {
                let mut properties = CsrkProperties::RESPONDER;
                if auth {
                    properties |= CsrkProperties::AUTH;
                }
                pd.csrk_resp = SmpSignatureResolvingKey { properties, csrk };
                pd.keys_resp_has |= SmpKeyType::SIGN_KEY;
            }
            other => {
                debug!("SMP: ignoring {:?} during key distribution", other);
                return;
            }
        }
        self.maybe_complete(pd, out);
    }

    fn maybe_complete(&mut self, pd: &mut PairingData, out: &mut SmpActions) {
        if pd.all_keys_received() {
            self.phase = Phase::Done;
            self.set_state(pd, SmpPairingState::Completed, out);
        }
    }

    // ------------------------------------------------------------------------
    // Input
    // ------------------------------------------------------------------------

    /// Route one PDU from the responder
    pub fn on_pdu(&mut self, pd: &mut PairingData, pdu: SmpPdu) -> SmpActions {
        let mut out = SmpActions::new();
        let sc = self.uses_sc();
        match (self.phase, pdu) {
            (_, SmpPdu::PairingFailed(reason)) if self.is_active() => {
                warn!("SMP: peer failed pairing: {:?}", reason);
                self.fail(pd, reason, false, &mut out);
            }
            (_, SmpPdu::KeypressNotification(_)) | (_, SmpPdu::SecurityRequest(_)) => {}
            (Phase::AwaitResponse, SmpPdu::PairingResponse(rsp)) => {
                self.on_response(pd, rsp, &mut out)
            }
            (Phase::AwaitPublicKey, SmpPdu::PairingPublicKey(pk)) => {
                self.on_public_key(pd, pk, &mut out)
            }
            (Phase::AwaitConfirm, SmpPdu::PairingConfirm(value)) => {
                self.remote_confirm = value;
                self.phase = Phase::AwaitRandom;
                out.push(SmpAction::Send(SmpPdu::PairingRandom(self.local_rand)));
            }
            (Phase::AwaitRandom, SmpPdu::PairingRandom(value)) if sc => {
                self.on_sc_random(pd, value, &mut out)
            }
            (Phase::AwaitRandom, SmpPdu::PairingRandom(value)) => {
                self.on_legacy_random(pd, value, &mut out)
            }
            (Phase::AwaitDhKeyCheck, SmpPdu::PairingDhKeyCheck(value)) => {
                self.on_dhkey_check(pd, value, &mut out)
            }
            (Phase::KeyDistribution, pdu) => self.on_key_pdu(pd, pdu, &mut out),
            (phase, pdu) if self.is_active() => {
                warn!("SMP: unexpected {:?} in {:?}", pdu, phase);
                self.fail(pd, SmpReason::UnspecifiedReason, true, &mut out);
            }
            (phase, pdu) => debug!("SMP: dropping {:?} in {:?}", pdu, phase),
        }
        out
    }

    /// Passkey typed by the user, `None` when the user declined
    pub fn set_passkey(&mut self, pd: &mut PairingData, passkey: Option<u32>) -> Option<SmpActions> {
        if self.phase != Phase::AwaitPasskey {
            return None;
        }
        let mut out = SmpActions::new();
        match passkey {
            Some(passkey) if passkey <= PASSKEY_MAX => {
                if self.uses_sc() {
                    self.passkey = Some(passkey);
                    self.round = 0;
                    self.send_passkey_round(&mut out);
                } else {
                    self.tk = passkey as u128;
                    self.send_legacy_confirm(&mut out);
                }
            }
            _ => self.fail(pd, SmpReason::PasskeyEntryFailed, true, &mut out),
        }
        Some(out)
    }

    /// User verdict on the numeric comparison value
    pub fn set_numeric_comparison(&mut self, pd: &mut PairingData, equal: bool) -> Option<SmpActions> {
        if self.phase != Phase::AwaitNumeric {
            return None;
        }
        let mut out = SmpActions::new();
        if equal {
            self.dhkey_check(pd, &mut out);
        } else {
            self.fail(pd, SmpReason::NumericComparisonFailed, true, &mut out);
        }
        Some(out)
    }

    /// Give up on an active attempt
    pub fn abort(&mut self, pd: &mut PairingData, reason: SmpReason) -> SmpActions {
        let mut out = SmpActions::new();
        if self.is_active() {
            self.fail(pd, reason, true, &mut out);
        }
        out
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn set_state(&self, pd: &mut PairingData, state: SmpPairingState, out: &mut SmpActions) {
        debug!("SMP: {} -> {} ({:?})", pd.state, state, pd.mode);
        pd.state = state;
        out.push(SmpAction::StateChanged(state, pd.mode));
    }

    fn fail(&mut self, pd: &mut PairingData, reason: SmpReason, notify_peer: bool, out: &mut SmpActions) {
        if notify_peer {
            out.push(SmpAction::Send(SmpPdu::PairingFailed(reason)));
        }
        self.phase = Phase::Done;
        self.check_pending = false;
        self.set_state(pd, SmpPairingState::Failed, out);
    }
}

/// Little-endian key image with the bytes beyond `size` zeroed
fn truncate_key(value: u128, size: u8) -> [u8; 16] {
    let mut bytes = value.to_le_bytes();
    for b in bytes.iter_mut().skip(size as usize) {
        *b = 0;
    }
    bytes
}
