//! Discovery policy against the simulated controller

mod common;

use common::*;
use rawbt_core::protocol::opcodes::cmd;
use rawbt_core::protocol::{AdvertisingParams, EInfoReport, EirDataType};
use rawbt_core::{DiscoveryPolicy, HciStatusCode, ScanType};
use rawbt_harness::{MockController, MockControllerConfig};

fn scan_enables(ctrl: &MockController) -> usize {
    ctrl.commands_with(cmd::LE_SET_SCAN_ENABLE)
        .iter()
        .filter(|c| c.params.first() == Some(&1))
        .count()
}

// ----------------------------------------------------------------------------
// Start and Stop
// ----------------------------------------------------------------------------

#[tokio::test]
async fn start_and_stop_notify_once_each() {
    let s = powered().await;
    let a = &s.adapter;
    assert_eq!(
        a.start_discovery(DiscoveryPolicy::PauseConnectedUntilReady, None).await,
        HciStatusCode::Success
    );
    assert!(a.is_discovering());
    assert_eq!(a.current_native_scan_type(), ScanType::LE);
    assert!(s.ctrl.is_scanning());

    // already on: only the policy changes
    assert_eq!(
        a.start_discovery(DiscoveryPolicy::AlwaysOn, None).await,
        HciStatusCode::Success
    );
    assert_eq!(a.discovery_policy(), DiscoveryPolicy::AlwaysOn);

    assert_eq!(a.stop_discovery().await, HciStatusCode::Success);
    assert!(!a.is_discovering());
    assert!(!s.ctrl.is_scanning());

    let discovering: Vec<Ev> = s
        .listener
        .events()
        .into_iter()
        .filter(|e| matches!(e, Ev::Discovering { .. }))
        .collect();
    assert_eq!(
        discovering,
        vec![
            Ev::Discovering { meta: ScanType::LE, enabled: true },
            Ev::Discovering { meta: ScanType::NONE, enabled: false },
        ]
    );
    s.shutdown().await;
}

#[tokio::test]
async fn discovery_needs_power() {
    let s = powered().await;
    assert_eq!(s.adapter.set_powered(false).await, HciStatusCode::Success);
    assert_eq!(
        s.adapter.start_discovery(DiscoveryPolicy::AutoOff, None).await,
        HciStatusCode::CommandDisallowed
    );
    s.shutdown().await;
}

#[tokio::test]
async fn advertising_and_discovery_exclude_each_other() {
    let s = powered().await;
    let a = &s.adapter;
    let eir = EInfoReport {
        name: Some("rawbt".into()),
        ..EInfoReport::new()
    };
    a.start_discovery(DiscoveryPolicy::AlwaysOn, None).await;
    assert_eq!(
        a.start_advertising(AdvertisingParams::default(), &eir, EirDataType::NAME, EirDataType::empty())
            .await,
        HciStatusCode::CommandDisallowed
    );

    a.stop_discovery().await;
    assert_eq!(
        a.start_advertising(AdvertisingParams::default(), &eir, EirDataType::NAME, EirDataType::empty())
            .await,
        HciStatusCode::Success
    );
    assert!(a.is_advertising());
    assert_eq!(
        a.start_discovery(DiscoveryPolicy::AlwaysOn, None).await,
        HciStatusCode::CommandDisallowed
    );
    assert_eq!(a.stop_advertising().await, HciStatusCode::Success);
    assert!(eventually(|| !a.is_advertising()).await);
    s.shutdown().await;
}

// ----------------------------------------------------------------------------
// Found Devices
// ----------------------------------------------------------------------------

#[tokio::test]
async fn unwanted_devices_are_dropped() {
    let s = powered().await;
    s.listener.set_keep_devices(false);
    s.adapter
        .start_discovery(DiscoveryPolicy::AlwaysOn, None)
        .await;
    let id = peer(1);
    s.ctrl.advertise(&id, &ad_named("nope"), -60);
    assert!(s.listener.wait_for(|e| *e == Ev::Found(id)).await);
    assert!(s.adapter.find_shared_device(&id).is_none());
    assert!(s.adapter.discovered_devices().is_empty());
    s.shutdown().await;
}

#[tokio::test]
async fn repeated_reports_update_the_device() {
    let s = powered().await;
    s.adapter
        .start_discovery(DiscoveryPolicy::AlwaysOn, None)
        .await;
    let id = peer(2);
    let dev = discover(&s, id, "first").await;
    assert_eq!(dev.name(), "first");

    s.ctrl.advertise(&id, &ad_named("second"), -40);
    assert!(s.listener.wait_for(|e| *e == Ev::Updated(id)).await);
    assert_eq!(dev.name(), "second");
    assert_eq!(s.listener.count(|e| *e == Ev::Found(id)), 1);

    // restarting clears the discovered set and reports the device anew
    s.adapter.stop_discovery().await;
    s.adapter
        .start_discovery(DiscoveryPolicy::AlwaysOn, None)
        .await;
    assert!(s.adapter.discovered_devices().is_empty());
    s.ctrl.advertise(&id, &ad_named("second"), -40);
    assert!(eventually(|| s.listener.count(|e| *e == Ev::Found(id)) == 2).await);
    s.shutdown().await;
}

// ----------------------------------------------------------------------------
// Pause and Resume
// ----------------------------------------------------------------------------

#[tokio::test]
async fn connect_pauses_until_ready() {
    let s = stack(fast_config(), MockControllerConfig::default(), StubGatt::gated()).await;
    let a = &s.adapter;
    a.start_discovery(DiscoveryPolicy::PauseConnectedUntilReady, None)
        .await;
    let id = peer(3);
    let dev = discover(&s, id, "sensor").await;

    assert_eq!(dev.connect_le().await, HciStatusCode::Success);
    assert!(s.listener.wait_for(|e| matches!(e, Ev::Connected(d, _) if *d == id)).await);
    assert!(a.is_discovering());
    assert!(a.current_native_scan_type().is_empty());
    assert!(!s.ctrl.is_scanning());
    assert_eq!(a.pausing_discovery_devices(), vec![id]);

    s.gatt.release();
    assert!(s.listener.wait_for(|e| *e == Ev::Ready(id)).await);
    assert!(eventually(|| s.ctrl.is_scanning()).await);
    assert!(a.pausing_discovery_devices().is_empty());
    assert_eq!(s.ctrl.count(cmd::LE_SET_SCAN_ENABLE), 3);
    assert_eq!(
        s.listener.count(|e| matches!(e, Ev::Discovering { .. })),
        1,
        "pausing is not a meta change"
    );
    s.shutdown().await;
}

#[tokio::test]
async fn restart_while_paused_keeps_scanning_off() {
    let s = stack(fast_config(), MockControllerConfig::default(), StubGatt::gated()).await;
    let a = &s.adapter;
    a.start_discovery(DiscoveryPolicy::PauseConnectedUntilReady, None)
        .await;
    let id = peer(4);
    let dev = discover(&s, id, "meter").await;
    assert_eq!(dev.connect_le().await, HciStatusCode::Success);
    assert!(s.listener.wait_for(|e| matches!(e, Ev::Connected(d, _) if *d == id)).await);
    assert!(!s.ctrl.is_scanning());

    assert_eq!(
        a.start_discovery(DiscoveryPolicy::PauseConnectedUntilReady, None)
            .await,
        HciStatusCode::Success
    );
    assert!(a.is_discovering());
    assert!(!s.ctrl.is_scanning());
    assert!(a.current_native_scan_type().is_empty());
    assert_eq!(a.pausing_discovery_devices(), vec![id]);
    assert_eq!(scan_enables(&s.ctrl), 1);

    s.gatt.release();
    assert!(s.listener.wait_for(|e| *e == Ev::Ready(id)).await);
    assert!(eventually(|| s.ctrl.is_scanning()).await);
    assert_eq!(scan_enables(&s.ctrl), 2);
    assert_eq!(s.listener.count(|e| matches!(e, Ev::Discovering { .. })), 1);
    s.shutdown().await;
}

#[tokio::test]
async fn many_connections_resume_exactly_once() {
    let s = stack(fast_config(), MockControllerConfig::default(), StubGatt::gated()).await;
    let a = &s.adapter;
    a.start_discovery(DiscoveryPolicy::PauseConnectedUntilReady, None)
        .await;
    let ids = [peer(10), peer(11), peer(12)];
    for (n, id) in ids.iter().enumerate() {
        let dev = discover(&s, *id, &format!("node{}", n)).await;
        assert_eq!(dev.connect_le().await, HciStatusCode::Success);
        assert!(s.listener.wait_for(|e| matches!(e, Ev::Connected(d, _) if d == id)).await);
    }
    assert_eq!(a.pausing_discovery_devices().len(), 3);
    assert!(!s.ctrl.is_scanning());
    assert_eq!(scan_enables(&s.ctrl), 1);

    s.gatt.release();
    assert!(eventually(|| s.listener.count(|e| matches!(e, Ev::Ready(_))) == 3).await);
    assert!(eventually(|| s.ctrl.is_scanning()).await);
    assert_eq!(scan_enables(&s.ctrl), 2);
    assert_eq!(a.connected_devices().len(), 3);
    s.shutdown().await;
}

#[tokio::test]
async fn pause_until_disconnected_survives_ready() {
    let s = powered().await;
    let a = &s.adapter;
    a.start_discovery(DiscoveryPolicy::PauseConnectedUntilDisconnected, None)
        .await;
    let id = peer(4);
    let dev = discover(&s, id, "watch").await;
    dev.connect_le().await;
    assert!(s.listener.wait_for(|e| *e == Ev::Ready(id)).await);
    assert!(!s.ctrl.is_scanning());
    assert_eq!(a.pausing_discovery_devices(), vec![id]);

    let handle = dev.connection_handle();
    s.ctrl.remote_disconnect(handle, HciStatusCode::RemoteUserTerminatedConnection);
    assert!(s
        .listener
        .wait_for(|e| *e == Ev::Disconnected(id, HciStatusCode::RemoteUserTerminatedConnection, handle))
        .await);
    assert!(eventually(|| s.ctrl.is_scanning()).await);
    assert!(a.pausing_discovery_devices().is_empty());
    s.shutdown().await;
}

#[tokio::test]
async fn auto_off_ends_discovery_on_connect() {
    let s = powered().await;
    let a = &s.adapter;
    a.start_discovery(DiscoveryPolicy::AutoOff, None).await;
    let id = peer(5);
    let dev = discover(&s, id, "tag").await;
    dev.connect_le().await;
    assert!(s.listener.wait_for(|e| *e == Ev::Ready(id)).await);
    assert!(!a.is_discovering());
    assert!(!s.ctrl.is_scanning());
    assert!(s
        .listener
        .wait_for(|e| *e == Ev::Discovering { meta: ScanType::NONE, enabled: false })
        .await);
    s.shutdown().await;
}

#[tokio::test]
async fn refused_resume_gives_up_after_retries() {
    let s = stack(fast_config(), MockControllerConfig::default(), StubGatt::gated()).await;
    let a = &s.adapter;
    a.start_discovery(DiscoveryPolicy::PauseConnectedUntilReady, None)
        .await;
    let id = peer(6);
    let dev = discover(&s, id, "flaky").await;
    dev.connect_le().await;
    assert!(s.listener.wait_for(|e| matches!(e, Ev::Connected(d, _) if *d == id)).await);

    s.ctrl.set_status(cmd::LE_SET_SCAN_ENABLE, HciStatusCode::CommandDisallowed);
    s.gatt.release();
    assert!(s
        .listener
        .wait_for(|e| *e == Ev::Discovering { meta: ScanType::NONE, enabled: false })
        .await);
    assert!(!a.is_discovering());
    // first refusal plus max_retries reconciliation attempts
    assert_eq!(scan_enables(&s.ctrl), 1 + 4);
    s.shutdown().await;
}
