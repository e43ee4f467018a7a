//! HCI engine against the simulated controller

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rawbt_core::protocol::opcodes::cmd;
use rawbt_core::protocol::{HciCommand, LeConnParams, ScanParams};
use rawbt_core::smp::{SmpAuthReqs, SmpPdu};
use rawbt_core::{BdAddress, BdAddressAndType, BdAddressType, BtRole, HciConfig, HciStatusCode, ScanType};
use rawbt_harness::packets;
use rawbt_harness::{MockController, MockControllerConfig};
use rawbt_hci::{HciHandler, MgmtEvent, MgmtEventData, MgmtEventKind};
use tokio::sync::mpsc;

fn config() -> HciConfig {
    HciConfig::default()
        .with_reader_poll_timeout(Duration::from_millis(20))
        .with_command_timeouts(Duration::from_millis(500), Duration::from_millis(500))
}

fn peer(n: u8) -> BdAddressAndType {
    BdAddressAndType::new(BdAddress::new([n, 0x11, 0x22, 0x33, 0x44, 0xC5]), BdAddressType::BdAddrLeRandom)
}

async fn open(ctrl: &Arc<MockController>) -> Arc<HciHandler> {
    rawbt_harness::init_tracing();
    let handler = HciHandler::open(ctrl.clone(), config()).expect("open handler");
    handler.initialize().await.expect("initialize");
    handler
}

fn subscribe(handler: &HciHandler, kind: MgmtEventKind) -> mpsc::UnboundedReceiver<MgmtEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    handler.add_mgmt_event_callback(
        kind,
        Arc::new(move |ev: &MgmtEvent| {
            let _ = tx.send(ev.clone());
        }),
    );
    rx
}

async fn next(rx: &mut mpsc::UnboundedReceiver<MgmtEvent>) -> MgmtEventData {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event in time")
        .expect("channel open")
        .data
}

// ----------------------------------------------------------------------------
// Initialization and Commands
// ----------------------------------------------------------------------------

#[tokio::test]
async fn initialize_reads_controller_properties() {
    let ctrl = MockController::new(MockControllerConfig::default().with_acl_mtu(0));
    let handler = HciHandler::open(ctrl.clone(), config()).expect("open");
    let info = handler.initialize().await.expect("init");

    assert_eq!(info.address, ctrl.config().address);
    assert_eq!(info.name, "rawbt-mock");
    assert_eq!(info.version.hci_version, 0x09);
    // zero buffer size falls back to the LE minimum
    assert_eq!(info.acl_mtu, 27);
    assert!(!info.secure_connections());
    assert_eq!(ctrl.count(cmd::RESET), 1);
    handler.close().await;
}

#[tokio::test]
async fn secure_connections_key_is_read_when_supported() {
    let ctrl = MockController::new(MockControllerConfig::default().with_secure_connections(true));
    let handler = open(&ctrl).await;
    let info = handler.local_info();
    assert!(info.secure_connections());
    assert_eq!(info.p256_public_key.as_deref(), Some(&[0x11u8; 64]));
    handler.close().await;
}

#[tokio::test]
async fn init_failure_names_the_step() {
    let ctrl = MockController::with_defaults();
    ctrl.set_status(cmd::READ_BD_ADDR, HciStatusCode::HardwareFailure);
    let handler = HciHandler::open(ctrl.clone(), config()).expect("open");
    let err = handler.initialize().await.expect_err("must fail");
    assert!(err.to_string().contains("read_bd_addr"), "{}", err);
    handler.close().await;
}

#[tokio::test]
async fn command_status_error_is_returned() {
    let ctrl = MockController::with_defaults();
    let handler = open(&ctrl).await;
    ctrl.set_status(cmd::LE_CREATE_CONN, HciStatusCode::ConnectionRejectedSecurity);
    let status = handler
        .le_create_conn(&peer(1), 0, &LeConnParams::default(), false)
        .await;
    assert_eq!(status, HciStatusCode::ConnectionRejectedSecurity);
    assert_eq!(handler.connection_count(), 0);
    handler.close().await;
}

#[tokio::test]
async fn unanswered_command_times_out_and_engine_recovers() {
    let ctrl = MockController::with_defaults();
    let handler = open(&ctrl).await;
    ctrl.set_silent(cmd::LE_SET_SCAN_PARAM, true);

    let reply = handler
        .send_command(rawbt_core::protocol::commands::le_set_scan_param(&ScanParams::default()))
        .await;
    assert_eq!(reply.status, HciStatusCode::InternalTimeout);

    ctrl.set_silent(cmd::LE_SET_SCAN_PARAM, false);
    assert_eq!(handler.reset().await, HciStatusCode::Success);
    handler.close().await;
}

#[tokio::test]
async fn unrelated_events_exhaust_reply_budget() {
    let ctrl = MockController::with_defaults();
    let mut cfg = config().with_command_timeouts(Duration::from_secs(10), Duration::from_secs(10));
    cfg.max_reply_events = 3;
    let handler = HciHandler::open(ctrl.clone(), cfg).expect("open");
    handler.initialize().await.expect("init");
    ctrl.set_silent(cmd::WRITE_LOCAL_NAME, true);

    let h = handler.clone();
    let started = Instant::now();
    let task = tokio::spawn(async move { h.write_local_name("x").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    for i in 0..5 {
        ctrl.advertise(&peer(i), &[0x02, 0x01, 0x06], -40);
    }
    let status = task.await.expect("join");
    assert_eq!(status, HciStatusCode::InternalTimeout);
    assert!(started.elapsed() < Duration::from_secs(5));
    handler.close().await;
}

#[tokio::test]
async fn malformed_packets_are_dropped() {
    let ctrl = MockController::with_defaults();
    let handler = open(&ctrl).await;
    let mut found = subscribe(&handler, MgmtEventKind::DeviceFound);

    ctrl.push_packet(vec![0x04, 0x0E]);
    ctrl.push_packet(vec![0x09, 0x00, 0x00]);
    // LE meta with a truncated advertising report
    ctrl.push_packet(packets::le_meta(0x02, &[1, 0]));
    ctrl.advertise(&peer(9), &[0x02, 0x01, 0x06], -50);

    match next(&mut found).await {
        MgmtEventData::DeviceFound(report) => assert_eq!(report.address, peer(9).address),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(handler.reset().await, HciStatusCode::Success);
    handler.close().await;
}

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

#[tokio::test]
async fn scan_enable_reports_discovering() {
    let ctrl = MockController::with_defaults();
    let handler = open(&ctrl).await;
    let mut discovering = subscribe(&handler, MgmtEventKind::Discovering);

    assert_eq!(handler.le_start_scan(&ScanParams::default()).await, HciStatusCode::Success);
    assert_eq!(
        next(&mut discovering).await,
        MgmtEventData::Discovering { scan_type: ScanType::LE, enabled: true }
    );
    assert!(ctrl.is_scanning());
    assert_eq!(handler.le_enable_scan(false, false).await, HciStatusCode::Success);
    assert_eq!(
        next(&mut discovering).await,
        MgmtEventData::Discovering { scan_type: ScanType::LE, enabled: false }
    );
    handler.close().await;
}

#[tokio::test]
async fn connect_and_disconnect_track_peers() {
    let ctrl = MockController::with_defaults();
    let handler = open(&ctrl).await;
    let mut connected = subscribe(&handler, MgmtEventKind::DeviceConnected);
    let mut disconnected = subscribe(&handler, MgmtEventKind::DeviceDisconnected);

    let status = handler
        .le_create_conn(&peer(2), 0, &LeConnParams::default(), false)
        .await;
    assert_eq!(status, HciStatusCode::Success);
    let handle = match next(&mut connected).await {
        MgmtEventData::DeviceConnected { peer: p, handle, role, .. } => {
            assert_eq!(p, peer(2));
            assert_eq!(role, BtRole::Master);
            handle
        }
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(handler.connection_peer(handle), Some(peer(2)));
    assert!(handler.att_channel(handle).is_some());

    ctrl.remote_disconnect(handle, HciStatusCode::RemoteUserTerminatedConnection);
    assert_eq!(
        next(&mut disconnected).await,
        MgmtEventData::DeviceDisconnected {
            peer: Some(peer(2)),
            handle,
            reason: HciStatusCode::RemoteUserTerminatedConnection,
        }
    );
    assert_eq!(handler.connection_count(), 0);
    assert!(handler.att_channel(handle).is_none());
    handler.close().await;
}

#[tokio::test]
async fn incoming_connection_ends_advertising() {
    let ctrl = MockController::with_defaults();
    let handler = open(&ctrl).await;
    let mut advertising = subscribe(&handler, MgmtEventKind::Advertising);
    let server = handler.l2cap_listen();

    let status = handler
        .le_start_advertising(&Default::default(), &[0x02, 0x01, 0x06], &[])
        .await;
    assert_eq!(status, HciStatusCode::Success);
    assert_eq!(next(&mut advertising).await, MgmtEventData::Advertising { enabled: true });

    let handle = ctrl.connect_incoming(&peer(3));
    assert_eq!(next(&mut advertising).await, MgmtEventData::Advertising { enabled: false });
    let channel = server.accept(Duration::from_secs(2)).await.expect("accepted");
    assert_eq!(channel.handle(), handle);
    assert!(!handler.is_advertising());
    handler.close().await;
}

#[tokio::test]
async fn callbacks_are_copy_on_write() {
    let ctrl = MockController::with_defaults();
    let handler = open(&ctrl).await;
    let hits = Arc::new(AtomicUsize::new(0));

    let h = hits.clone();
    let first = handler.add_mgmt_event_callback(
        MgmtEventKind::HardwareError,
        Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let mut rx = subscribe(&handler, MgmtEventKind::HardwareError);
    assert_eq!(handler.callback_count(MgmtEventKind::HardwareError), 2);

    ctrl.hardware_error(0x42);
    assert_eq!(next(&mut rx).await, MgmtEventData::HardwareError { code: 0x42 });
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    assert!(handler.remove_mgmt_event_callback(MgmtEventKind::HardwareError, first));
    assert!(!handler.remove_mgmt_event_callback(MgmtEventKind::HardwareError, first));
    ctrl.hardware_error(0x43);
    assert_eq!(next(&mut rx).await, MgmtEventData::HardwareError { code: 0x43 });
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    handler.close().await;
}

#[tokio::test]
async fn dropped_waiters_deregister() {
    let ctrl = MockController::with_defaults();
    let handler = open(&ctrl).await;
    let kind = MgmtEventKind::HardwareError;
    let before = handler.callback_count(kind);

    let waiter = handler.event_waiter(kind, |_| true);
    assert_eq!(handler.callback_count(kind), before + 1);
    drop(waiter);
    assert_eq!(handler.callback_count(kind), before);

    // a wait abandoned mid-flight leaves nothing behind
    let waiter = handler.event_waiter(kind, |_| true);
    let pending = handler.wait_for(waiter, Duration::from_secs(5));
    assert!(tokio::time::timeout(Duration::from_millis(20), pending).await.is_err());
    assert_eq!(handler.callback_count(kind), before);

    let waiter = handler.event_waiter(kind, |_| true);
    ctrl.hardware_error(0x11);
    let event = handler.wait_for(waiter, Duration::from_secs(2)).await;
    assert_eq!(event.map(|e| e.data), Some(MgmtEventData::HardwareError { code: 0x11 }));
    assert_eq!(handler.callback_count(kind), before);
    handler.close().await;
}

// ----------------------------------------------------------------------------
// L2CAP and SMP
// ----------------------------------------------------------------------------

#[tokio::test]
async fn smp_pdus_route_both_ways() {
    let ctrl = MockController::with_defaults();
    let handler = open(&ctrl).await;
    let mut connected = subscribe(&handler, MgmtEventKind::DeviceConnected);
    let mut smp = subscribe(&handler, MgmtEventKind::SmpMessage);

    handler
        .le_create_conn(&peer(4), 0, &LeConnParams::default(), false)
        .await;
    let handle = match next(&mut connected).await {
        MgmtEventData::DeviceConnected { handle, .. } => handle,
        other => panic!("unexpected {:?}", other),
    };

    ctrl.send_smp(handle, &SmpPdu::SecurityRequest(SmpAuthReqs::BONDING));
    assert_eq!(
        next(&mut smp).await,
        MgmtEventData::SmpMessage {
            handle,
            pdu: SmpPdu::SecurityRequest(SmpAuthReqs::BONDING),
        }
    );

    // 65 byte PDU crosses the 27 byte ACL MTU
    let key = SmpPdu::PairingPublicKey([0xAB; 64]);
    handler.send_smp(handle, &key).expect("send");
    let sent = ctrl.sent_l2cap();
    let (h, frame) = sent.last().expect("frame");
    assert_eq!(*h, handle);
    assert_eq!(SmpPdu::decode(&frame.payload).expect("pdu"), key);
    handler.close().await;
}

// ----------------------------------------------------------------------------
// Shutdown
// ----------------------------------------------------------------------------

#[tokio::test]
async fn transport_failure_closes_engine() {
    let ctrl = MockController::with_defaults();
    let handler = open(&ctrl).await;
    let mut closed = subscribe(&handler, MgmtEventKind::TransportClosed);

    ctrl.fail_transport();
    match next(&mut closed).await {
        MgmtEventData::TransportClosed { reason } => {
            assert!(reason.contains("simulated"), "{}", reason)
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!handler.is_open());
    let reply = handler.send_command(HciCommand::bare(cmd::READ_BD_ADDR)).await;
    assert_eq!(reply.status, HciStatusCode::InternalFailure);
    handler.close().await;
}

#[tokio::test]
async fn close_is_idempotent_and_bounded() {
    let ctrl = MockController::with_defaults();
    let handler = open(&ctrl).await;
    let started = Instant::now();
    handler.close().await;
    handler.close().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!handler.is_open());
    assert_eq!(handler.callback_count(MgmtEventKind::DeviceFound), 0);
}
