//! Pairing, stored keys and automatic security against the scripted SMP peer

mod common;

use std::time::Duration;

use common::*;
use rawbt_core::protocol::opcodes::cmd;
use rawbt_core::smp::{
    BtSecurityLevel, PairingMode, SmpAuthReqs, SmpIoCapability, SmpKeyBin, SmpPairingState,
    SmpPdu, SmpReason,
};
use rawbt_core::{BdAddressAndType, HciStatusCode, SmpConfig, StackConfig};
use rawbt_harness::{MockControllerConfig, SmpPeerConfig};
use rawbt_runtime::DeviceState;

fn persisted(dir: &std::path::Path) -> StackConfig {
    fast_config().with_key_dir(dir)
}

fn failed(id: BdAddressAndType) -> impl Fn(&Ev) -> bool {
    move |e| matches!(e, Ev::Pairing(d, SmpPairingState::Failed, _) if *d == id)
}

fn completed(id: BdAddressAndType) -> impl Fn(&Ev) -> bool {
    move |e| matches!(e, Ev::Pairing(d, SmpPairingState::Completed, _) if *d == id)
}

/// Pair `id` with Just Works and wait until it is ready
async fn pair(s: &Stack, id: BdAddressAndType) {
    s.ctrl.attach_smp_peer(id, SmpPeerConfig::default());
    let dev = s.adapter.find_or_create_device(id);
    assert!(dev.set_conn_security(BtSecurityLevel::EncOnly, SmpIoCapability::NoInputNoOutput));
    assert_eq!(dev.connect_le().await, HciStatusCode::Success);
    assert!(s
        .listener
        .wait_for(|e| *e == Ev::Pairing(id, SmpPairingState::Completed, PairingMode::JustWorks))
        .await);
    assert!(s.listener.wait_for(|e| *e == Ev::Ready(id)).await);
}

// ----------------------------------------------------------------------------
// Pairing
// ----------------------------------------------------------------------------

#[tokio::test]
async fn just_works_pairing_stores_keys() {
    let dir = tempfile::tempdir().expect("tempdir");
    let s = stack(persisted(dir.path()), MockControllerConfig::default(), StubGatt::open()).await;
    let id = peer(1);
    pair(&s, id).await;

    let dev = s.adapter.find_shared_device(&id).expect("device");
    assert!(dev.is_encrypted());
    assert_eq!(dev.state(), DeviceState::Ready);
    assert_eq!(dev.conn_security_level(), BtSecurityLevel::EncOnly);
    assert!(dev.create_key_bin().is_valid());

    let stored = SmpKeyBin::read(dir.path(), &id)
        .expect("read key bin")
        .expect("key bin present");
    assert!(stored.is_valid());
    assert!(stored.has_ltk_resp());

    // state notifications run from feature exchange to completion
    let events = s.listener.events();
    let started = events
        .iter()
        .position(|e| matches!(e, Ev::Pairing(_, SmpPairingState::FeatureExchangeStarted, _)));
    let done = events.iter().position(completed(id));
    assert!(started.is_some() && started < done);
    s.shutdown().await;
}

#[tokio::test]
async fn stored_keys_reencrypt_on_the_next_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let id = peer(2);
    {
        let s = stack(persisted(dir.path()), MockControllerConfig::default(), StubGatt::open()).await;
        pair(&s, id).await;
        s.shutdown().await;
    }

    let s = stack(persisted(dir.path()), MockControllerConfig::default(), StubGatt::open()).await;
    let dev = s.adapter.find_or_create_device(id);
    assert_eq!(dev.connect_le().await, HciStatusCode::Success);
    assert!(s
        .listener
        .wait_for(|e| *e == Ev::Pairing(id, SmpPairingState::Completed, PairingMode::PrePaired))
        .await);
    assert!(s.listener.wait_for(|e| *e == Ev::Ready(id)).await);
    assert_eq!(s.ctrl.count(cmd::LE_ENABLE_ENC), 1);
    assert_eq!(
        s.listener.count(|e| matches!(e, Ev::Pairing(_, SmpPairingState::FeatureExchangeStarted, _))),
        0
    );
    assert!(dev.is_encrypted());
    s.shutdown().await;
}

#[tokio::test]
async fn rejected_stored_keys_are_forgotten() {
    let dir = tempfile::tempdir().expect("tempdir");
    let id = peer(3);
    {
        let s = stack(persisted(dir.path()), MockControllerConfig::default(), StubGatt::open()).await;
        pair(&s, id).await;
        s.shutdown().await;
    }
    let path = SmpKeyBin::file_path(dir.path(), &id);
    assert!(path.exists());

    let s = stack(persisted(dir.path()), MockControllerConfig::default(), StubGatt::open()).await;
    s.ctrl.set_encryption_status(HciStatusCode::PinOrKeyMissing);
    let dev = s.adapter.find_or_create_device(id);
    dev.connect_le().await;
    assert!(eventually(|| !path.exists()).await);
    assert_ne!(dev.pairing_mode(), PairingMode::PrePaired);
    s.shutdown().await;
}

#[tokio::test]
async fn unpair_forgets_keys_everywhere() {
    let dir = tempfile::tempdir().expect("tempdir");
    let s = stack(persisted(dir.path()), MockControllerConfig::default(), StubGatt::open()).await;
    let id = peer(4);
    pair(&s, id).await;
    let path = SmpKeyBin::file_path(dir.path(), &id);
    assert!(path.exists());

    let dev = s.adapter.find_shared_device(&id).expect("device");
    assert_eq!(dev.unpair().await, HciStatusCode::Success);
    assert!(!path.exists());
    assert!(!dev.create_key_bin().is_valid());
    assert!(s
        .listener
        .wait_for(|e| matches!(e, Ev::Disconnected(d, _, _) if *d == id))
        .await);
    s.shutdown().await;
}

#[tokio::test]
async fn peer_rejection_fails_without_ready() {
    let s = powered().await;
    let id = peer(5);
    s.ctrl.attach_smp_peer(
        id,
        SmpPeerConfig {
            reject_with: Some(SmpReason::PairingNotSupported),
            ..SmpPeerConfig::default()
        },
    );
    let dev = s.adapter.find_or_create_device(id);
    dev.set_conn_security(BtSecurityLevel::EncOnly, SmpIoCapability::NoInputNoOutput);
    dev.connect_le().await;

    assert!(s.listener.wait_for(failed(id)).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(s.listener.count(|e| *e == Ev::Ready(id)), 0);
    assert!(dev.is_connected());
    assert!(!dev.is_encrypted());
    s.shutdown().await;
}

#[tokio::test]
async fn peer_security_request_starts_pairing() {
    let s = powered().await;
    let id = peer(6);
    s.ctrl.attach_smp_peer(id, SmpPeerConfig::default());
    let dev = s.adapter.find_or_create_device(id);
    dev.connect_le().await;
    assert!(s.listener.wait_for(|e| *e == Ev::Ready(id)).await);
    assert_eq!(dev.conn_security_level(), BtSecurityLevel::None);

    s.ctrl
        .send_smp(dev.connection_handle(), &SmpPdu::SecurityRequest(SmpAuthReqs::BONDING));
    assert!(s.listener.wait_for(completed(id)).await);
    assert!(dev.is_encrypted());
    assert_eq!(dev.conn_security_level(), BtSecurityLevel::EncOnly);
    s.shutdown().await;
}

// ----------------------------------------------------------------------------
// Automatic Security
// ----------------------------------------------------------------------------

#[tokio::test]
async fn auto_security_settles_on_a_working_tier() {
    let s = powered().await;
    let id = peer(7);
    s.ctrl.attach_smp_peer(id, SmpPeerConfig::default());
    let dev = s.adapter.find_or_create_device(id);
    assert!(dev.set_conn_security_auto(SmpIoCapability::NoInputNoOutput));
    assert!(dev.is_conn_security_auto_enabled());
    dev.connect_le().await;

    assert!(s.listener.wait_for(completed(id)).await);
    assert!(s.listener.wait_for(|e| *e == Ev::Ready(id)).await);
    assert!(!dev.is_conn_security_auto_enabled());
    // the strongest tier needs Secure Connections, which the controller lacks
    assert!(s.ctrl.count(cmd::LE_CREATE_CONN) >= 2);
    assert_eq!(s.listener.count(|e| matches!(e, Ev::Connected(..))), 1);
    assert_eq!(s.listener.count(|e| matches!(e, Ev::Disconnected(..))), 0);
    assert_eq!(s.listener.count(failed(id)), 0);
    s.shutdown().await;
}

#[tokio::test]
async fn auto_security_reports_only_the_last_failure() {
    let s = powered().await;
    let id = peer(8);
    s.ctrl.attach_smp_peer(
        id,
        SmpPeerConfig {
            reject_with: Some(SmpReason::PairingNotSupported),
            ..SmpPeerConfig::default()
        },
    );
    let dev = s.adapter.find_or_create_device(id);
    assert!(dev.set_conn_security_auto(SmpIoCapability::DisplayYesNo));
    dev.connect_le().await;

    assert!(s.listener.wait_for(failed(id)).await);
    let tiers = s.manager.config().smp.security_auto_tiers.len();
    assert_eq!(s.ctrl.count(cmd::LE_CREATE_CONN), tiers);
    assert_eq!(s.listener.count(failed(id)), 1);
    assert_eq!(s.listener.count(|e| matches!(e, Ev::Connected(..))), 1);
    assert_eq!(s.listener.count(|e| matches!(e, Ev::Disconnected(..))), 0);
    assert!(!dev.is_conn_security_auto_enabled());
    assert_eq!(dev.conn_io_capability(), SmpIoCapability::NoInputNoOutput);
    s.shutdown().await;
}

// ----------------------------------------------------------------------------
// Watchdog
// ----------------------------------------------------------------------------

#[tokio::test]
async fn stalled_pairing_times_out() {
    let config = fast_config().with_smp(
        SmpConfig::default()
            .with_watchdog_interval(Duration::from_millis(50))
            .with_pairing_timeout(Duration::from_millis(200)),
    );
    let s = stack(config, MockControllerConfig::default(), StubGatt::open()).await;
    let id = peer(9);
    s.ctrl.attach_smp_peer(
        id,
        SmpPeerConfig {
            stall_after_response: true,
            ..SmpPeerConfig::default()
        },
    );
    let dev = s.adapter.find_or_create_device(id);
    dev.set_conn_security(BtSecurityLevel::EncOnly, SmpIoCapability::NoInputNoOutput);
    dev.connect_le().await;

    assert!(s.listener.wait_for(failed(id)).await);
    let handle = dev.connection_handle();
    let got_failed = s
        .ctrl
        .smp_received(handle)
        .iter()
        .any(|pdu| matches!(pdu, SmpPdu::PairingFailed(SmpReason::UnspecifiedReason)));
    assert!(got_failed, "peer is told about the timeout");
    s.shutdown().await;
}
