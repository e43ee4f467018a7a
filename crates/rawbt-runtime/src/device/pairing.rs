//! Security Manager glue of a device
//!
//! The [`SmpSession`] is a pure state machine; this side feeds it PDUs and
//! controller results and carries out the actions it returns.

use std::collections::VecDeque;
use std::sync::Arc;

use rawbt_core::smp::{
    BtSecurityLevel, LtkProperties, PairingData, PairingMode, SmpAddress, SmpAuthReqs, SmpKeyType,
    SmpLongTermKey, SmpPairingState, SmpPdu, SmpReason,
};
use rawbt_core::{monotonic_millis, BdAddressType, BtRole, HciStatusCode};
use rawbt_hci::{HciHandler, MgmtEventData};
use tracing::{debug, info, warn};

use super::{BtDevice, DeviceInner};
use crate::adapter::BtAdapter;
use crate::smp::{SmpAction, SmpActions, SmpSession, SmpSessionParams};

/// Outcome of an Encryption Change outside an active pairing
enum EncryptionOutcome {
    Session(SmpActions),
    Restored,
    Rejected,
    Ignored,
}

fn restored_level(ltk: &SmpLongTermKey) -> BtSecurityLevel {
    if ltk.properties.contains(LtkProperties::AUTH_SC | LtkProperties::AUTH) {
        BtSecurityLevel::EncAuthFips
    } else if ltk.properties.contains(LtkProperties::AUTH) {
        BtSecurityLevel::EncAuth
    } else {
        BtSecurityLevel::EncOnly
    }
}

/// Stored key matching an LTK request
fn find_ltk(pd: &PairingData, rand: u64, ediv: u16) -> Option<SmpLongTermKey> {
    let candidates = [
        (pd.keys_init_has, pd.ltk_init),
        (pd.keys_resp_has, pd.ltk_resp),
    ];
    candidates
        .into_iter()
        .filter(|(mask, ltk)| mask.contains(SmpKeyType::ENC_KEY) && ltk.is_valid())
        .map(|(_, ltk)| ltk)
        .find(|ltk| ltk.rand == rand && ltk.ediv == ediv)
}

impl BtDevice {
    fn with_session<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut SmpSession, &mut PairingData) -> R,
    {
        let mut inner = self.inner.lock();
        let DeviceInner { smp, pairing, .. } = &mut *inner;
        smp.as_mut().map(|session| f(session, pairing))
    }

    // ------------------------------------------------------------------------
    // Initiation
    // ------------------------------------------------------------------------

    /// Security step after connecting as central, `false` when the link needs none
    pub(crate) async fn start_security(
        self: &Arc<Self>,
        adapter: &BtAdapter,
        hci: &HciHandler,
    ) -> bool {
        let (handle, stored, level) = {
            let inner = self.inner.lock();
            let stored = match inner.pairing.mode {
                PairingMode::PrePaired => inner.pairing.encryption_ltk(),
                _ => None,
            };
            (inner.handle, stored, inner.pairing.sec_level_conn)
        };
        if handle == 0 {
            return false;
        }
        if let Some(ltk) = stored {
            self.reencrypt(adapter, hci, handle, ltk).await;
            return true;
        }
        if !level.requires_encryption() {
            return false;
        }
        self.begin_pairing(adapter, hci).await;
        true
    }

    async fn reencrypt(
        self: &Arc<Self>,
        adapter: &BtAdapter,
        hci: &HciHandler,
        handle: u16,
        ltk: SmpLongTermKey,
    ) {
        {
            let mut inner = self.inner.lock();
            inner.reencrypting = true;
            inner.pairing.mode = PairingMode::PrePaired;
        }
        debug!("{}: encrypting with stored keys", self.id);
        let status = hci.le_enable_encryption(handle, &ltk).await;
        if !status.is_success() {
            warn!("{}: LE Enable Encryption rejected: {}", self.id, status);
            self.stored_keys_rejected(adapter, hci).await;
        }
    }

    async fn begin_pairing(self: &Arc<Self>, adapter: &BtAdapter, hci: &HciHandler) {
        let local = hci.local_info();
        let params = SmpSessionParams {
            local: SmpAddress::new(local.address, BdAddressType::BdAddrLePublic),
            remote: SmpAddress::new(self.id.address, self.id.address_type),
            local_public_key: local.p256_public_key.clone(),
            max_key_size: adapter.config().smp.max_key_size,
        };
        let actions = {
            let mut inner = self.inner.lock();
            let mut session = SmpSession::new(params, adapter.crypto());
            let actions = session.start(&mut inner.pairing, monotonic_millis());
            inner.smp = Some(session);
            actions
        };
        info!("{}: pairing at {:?}", self.id, self.conn_security_level());
        self.run_smp_actions(adapter, hci, actions).await;
    }

    /// Stored keys failed, forget them and pair afresh
    async fn stored_keys_rejected(self: &Arc<Self>, adapter: &BtAdapter, hci: &HciHandler) {
        {
            let mut inner = self.inner.lock();
            inner.reencrypting = false;
            inner.pairing.clear_keys();
            inner.pairing.encrypted = false;
            if !inner.pairing.sec_level_conn.requires_encryption() {
                inner.pairing.sec_level_conn = BtSecurityLevel::EncOnly;
            }
        }
        adapter.keystore().remove(&self.id);
        info!("{}: stored keys rejected, pairing afresh", self.id);
        self.begin_pairing(adapter, hci).await;
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    pub(crate) async fn on_smp_pdu(
        self: &Arc<Self>,
        adapter: &BtAdapter,
        hci: &HciHandler,
        pdu: SmpPdu,
    ) {
        let (handle, remote_role, session_active, encrypted, stored) = {
            let inner = self.inner.lock();
            (
                inner.handle,
                inner.role,
                inner.smp.as_ref().map(|s| s.is_active()).unwrap_or(false),
                inner.pairing.encrypted,
                inner.pairing.encryption_ltk(),
            )
        };
        match pdu {
            SmpPdu::PairingRequest(_) if remote_role == BtRole::Master => {
                info!("{}: rejecting pairing as peripheral", self.id);
                if let Err(e) =
                    hci.send_smp(handle, &SmpPdu::PairingFailed(SmpReason::PairingNotSupported))
                {
                    warn!("{}: SMP send failed: {}", self.id, e);
                }
                let mode = {
                    let mut inner = self.inner.lock();
                    inner.pairing.state = SmpPairingState::Failed;
                    inner.pairing.mode
                };
                adapter
                    .on_pairing_state(self, SmpPairingState::Failed, mode, monotonic_millis())
                    .await;
            }
            SmpPdu::SecurityRequest(auth) if !session_active && !encrypted => {
                if let Some(ltk) = stored {
                    self.reencrypt(adapter, hci, handle, ltk).await;
                    return;
                }
                {
                    let mut inner = self.inner.lock();
                    let pd = &mut inner.pairing;
                    pd.res_requested_sec = true;
                    let wanted = if auth.contains(SmpAuthReqs::MITM) {
                        BtSecurityLevel::EncAuth
                    } else {
                        BtSecurityLevel::EncOnly
                    };
                    if pd.sec_level_conn < wanted {
                        pd.sec_level_conn = wanted;
                    }
                }
                debug!("{}: peer requested security {:?}", self.id, auth);
                self.begin_pairing(adapter, hci).await;
            }
            pdu => match self.with_session(|s, pd| s.on_pdu(pd, pdu)) {
                Some(actions) => self.run_smp_actions(adapter, hci, actions).await,
                None => debug!("{}: SMP PDU without a pairing session", self.id),
            },
        }
    }

    pub(crate) async fn on_dhkey(
        self: &Arc<Self>,
        adapter: &BtAdapter,
        hci: &HciHandler,
        status: HciStatusCode,
        dhkey: [u8; 32],
    ) {
        if let Some(actions) = self.with_session(|s, pd| s.on_dhkey(pd, status, dhkey)) {
            self.run_smp_actions(adapter, hci, actions).await;
        }
    }

    pub(crate) fn awaits_dhkey(&self) -> bool {
        self.inner
            .lock()
            .smp
            .as_ref()
            .map(|s| s.awaits_dhkey())
            .unwrap_or(false)
    }

    pub(crate) async fn on_encryption_changed(
        self: &Arc<Self>,
        adapter: &BtAdapter,
        hci: &HciHandler,
        status: HciStatusCode,
        enabled: bool,
    ) {
        let success = status.is_success() && enabled;
        let outcome = {
            let mut inner = self.inner.lock();
            let DeviceInner {
                smp,
                pairing,
                reencrypting,
                ..
            } = &mut *inner;
            match smp.as_mut().filter(|s| s.is_active()) {
                Some(session) => {
                    EncryptionOutcome::Session(session.on_encryption_changed(pairing, status, enabled))
                }
                None if *reencrypting => {
                    *reencrypting = false;
                    match pairing.encryption_ltk().filter(|_| success) {
                        Some(ltk) => {
                            pairing.encrypted = true;
                            pairing.sec_level_conn = restored_level(&ltk);
                            pairing.mode = PairingMode::PrePaired;
                            pairing.state = SmpPairingState::Completed;
                            EncryptionOutcome::Restored
                        }
                        None => EncryptionOutcome::Rejected,
                    }
                }
                None => {
                    pairing.encrypted = success;
                    EncryptionOutcome::Ignored
                }
            }
        };
        match outcome {
            EncryptionOutcome::Session(actions) => {
                self.run_smp_actions(adapter, hci, actions).await
            }
            EncryptionOutcome::Restored => {
                info!("{}: encrypted with stored keys", self.id);
                adapter
                    .on_pairing_state(
                        self,
                        SmpPairingState::Completed,
                        PairingMode::PrePaired,
                        monotonic_millis(),
                    )
                    .await;
            }
            EncryptionOutcome::Rejected if self.role() == BtRole::Master => {
                warn!("{}: encryption with stored keys failed: {}", self.id, status);
                self.inner.lock().pairing.clear_keys();
                adapter.keystore().remove(&self.id);
            }
            EncryptionOutcome::Rejected => {
                warn!("{}: encryption with stored keys failed: {}", self.id, status);
                self.stored_keys_rejected(adapter, hci).await;
            }
            EncryptionOutcome::Ignored => {
                debug!("{}: encryption {} ({})", self.id, success, status)
            }
        }
    }

    /// Answer an LE Long Term Key Request as peripheral
    pub(crate) async fn on_ltk_request(&self, hci: &HciHandler, rand: u64, ediv: u16) {
        let (handle, ltk) = {
            let mut inner = self.inner.lock();
            let ltk = find_ltk(&inner.pairing, rand, ediv);
            if ltk.is_some() {
                inner.reencrypting = true;
            }
            (inner.handle, ltk)
        };
        let status = match ltk {
            Some(ltk) => {
                debug!("{}: LTK request answered from stored keys", self.id);
                hci.le_ltk_reply(handle, &ltk.ltk).await
            }
            None => {
                debug!("{}: no LTK for ediv 0x{:04x}", self.id, ediv);
                hci.le_ltk_neg_reply(handle).await
            }
        };
        if !status.is_success() {
            warn!("{}: LTK reply failed: {}", self.id, status);
            self.inner.lock().reencrypting = false;
        }
    }

    /// Record a long term key reported through the management path
    pub(crate) fn store_long_term_key(&self, ltk: SmpLongTermKey) {
        let mut inner = self.inner.lock();
        let pd = &mut inner.pairing;
        if ltk.is_responder() {
            pd.ltk_resp = ltk;
            pd.keys_resp_has |= SmpKeyType::ENC_KEY;
        } else {
            pd.ltk_init = ltk;
            pd.keys_init_has |= SmpKeyType::ENC_KEY;
        }
    }

    /// Abort a pairing stuck past `timeout_ms`
    pub(crate) async fn check_pairing_timeout(
        self: &Arc<Self>,
        adapter: &BtAdapter,
        hci: &HciHandler,
        now_ms: u64,
        timeout_ms: u64,
    ) -> bool {
        let actions = self.with_session(|s, pd| {
            if s.is_stalled(now_ms, timeout_ms) {
                Some(s.abort(pd, SmpReason::UnspecifiedReason))
            } else {
                None
            }
        });
        match actions.flatten() {
            Some(actions) => {
                warn!("{}: pairing timed out after {} ms", self.id, timeout_ms);
                self.run_smp_actions(adapter, hci, actions).await;
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // User Input
    // ------------------------------------------------------------------------

    /// Passkey typed by the user for Passkey Entry
    pub async fn set_pairing_passkey(self: &Arc<Self>, passkey: u32) -> HciStatusCode {
        self.pairing_input(move |s, pd| s.set_passkey(pd, Some(passkey)))
            .await
    }

    /// User declined to enter a passkey
    pub async fn set_pairing_passkey_negative(self: &Arc<Self>) -> HciStatusCode {
        self.pairing_input(|s, pd| s.set_passkey(pd, None)).await
    }

    pub async fn set_pairing_numeric_comparison(self: &Arc<Self>, equal: bool) -> HciStatusCode {
        self.pairing_input(move |s, pd| s.set_numeric_comparison(pd, equal))
            .await
    }

    /// Passkey to show to the user, set while the peer enters it
    pub fn displayed_passkey(&self) -> Option<u32> {
        self.inner
            .lock()
            .smp
            .as_ref()
            .and_then(|s| s.displayed_passkey())
    }

    pub fn numeric_comparison_value(&self) -> Option<u32> {
        self.inner.lock().smp.as_ref().and_then(|s| s.numeric_value())
    }

    async fn pairing_input<F>(self: &Arc<Self>, f: F) -> HciStatusCode
    where
        F: FnOnce(&mut SmpSession, &mut PairingData) -> Option<SmpActions>,
    {
        let adapter = match self.adapter() {
            Some(adapter) => adapter,
            None => return HciStatusCode::InternalFailure,
        };
        let hci = match adapter.powered_hci() {
            Some(hci) => hci,
            None => return HciStatusCode::CommandDisallowed,
        };
        match self.with_session(f).flatten() {
            Some(actions) => {
                self.run_smp_actions(&adapter, &hci, actions).await;
                HciStatusCode::Success
            }
            None => HciStatusCode::CommandDisallowed,
        }
    }

    // ------------------------------------------------------------------------
    // Action Execution
    // ------------------------------------------------------------------------

    pub(crate) async fn run_smp_actions(
        self: &Arc<Self>,
        adapter: &BtAdapter,
        hci: &HciHandler,
        actions: SmpActions,
    ) {
        let mut queue: VecDeque<SmpAction> = actions.into_iter().collect();
        while let Some(action) = queue.pop_front() {
            let handle = self.connection_handle();
            match action {
                SmpAction::Send(pdu) => {
                    if handle == 0 {
                        debug!("{}: link gone, dropping {:?}", self.id, pdu);
                        continue;
                    }
                    if let Err(e) = hci.send_smp(handle, &pdu) {
                        warn!("{}: SMP send failed: {}", self.id, e);
                    }
                }
                SmpAction::GenerateDhKey(remote_pk) => {
                    let status = hci.le_generate_dhkey(&remote_pk).await;
                    if !status.is_success() {
                        if let Some(more) = self.with_session(|s, pd| s.on_dhkey(pd, status, [0; 32])) {
                            queue.extend(more);
                        }
                    }
                }
                SmpAction::StartEncryption(key) => {
                    let status = hci.le_enable_encryption(handle, &key).await;
                    if !status.is_success() {
                        if let Some(more) =
                            self.with_session(|s, pd| s.on_encryption_changed(pd, status, false))
                        {
                            queue.extend(more);
                        }
                    }
                }
                SmpAction::NewLongTermKey(ltk) => {
                    hci.inject_event(MgmtEventData::NewLongTermKey { peer: self.id, ltk })
                }
                SmpAction::StateChanged(state, mode) => {
                    adapter
                        .on_pairing_state(self, state, mode, monotonic_millis())
                        .await
                }
            }
        }
    }
}
