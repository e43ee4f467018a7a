//! Adapter set, hot-plug and shutdown

mod common;

use std::sync::Arc;

use common::*;
use parking_lot::Mutex;
use rawbt_core::{HciStatusCode, StackConfig};
use rawbt_harness::{FakeSmpCrypto, MockController, MockControllerConfig, MockControllers};
use rawbt_runtime::{AdapterSetListenerRef, BtAdapter, BtManager, ChangedAdapterSetListener, NoGatt};
use tokio_test::assert_ok;

#[derive(Debug, Default)]
struct SetRecorder {
    added: Mutex<Vec<u16>>,
    removed: Mutex<Vec<u16>>,
}

impl ChangedAdapterSetListener for SetRecorder {
    fn adapter_added(&self, adapter: &Arc<BtAdapter>) {
        self.added.lock().push(adapter.dev_id());
    }

    fn adapter_removed(&self, adapter: &Arc<BtAdapter>) {
        self.removed.lock().push(adapter.dev_id());
    }
}

fn open(provider: &Arc<MockControllers>) -> Arc<BtManager> {
    rawbt_harness::init_tracing();
    assert_ok!(BtManager::open(
        provider.clone(),
        fast_config(),
        Arc::new(FakeSmpCrypto),
        Arc::new(NoGatt),
    ))
}

#[tokio::test]
async fn adapters_start_unpowered_in_index_order() {
    let provider = MockControllers::with_controllers(&[2, 0, 1]);
    let manager = open(&provider);
    let ids: Vec<u16> = manager.adapters().iter().map(|a| a.dev_id()).collect();
    assert_eq!(ids, vec![0, 1, 2]);
    assert!(manager.adapters().iter().all(|a| !a.is_powered() && a.is_valid()));

    // without a powered adapter the first valid one is the default
    assert_eq!(manager.default_adapter().map(|a| a.dev_id()), Some(0));
    let second = manager.adapter(1).expect("hci1");
    assert_eq!(second.initialize().await, HciStatusCode::Success);
    assert_eq!(manager.default_adapter().map(|a| a.dev_id()), Some(1));
    assert!(manager.adapter(7).is_none());
    manager.shutdown().await;
}

#[tokio::test]
async fn invalid_config_is_refused() {
    let mut config = StackConfig::default();
    config.smp.max_key_size = 3;
    let err = BtManager::open(
        MockControllers::with_controllers(&[0]),
        config,
        Arc::new(FakeSmpCrypto),
        Arc::new(NoGatt),
    )
    .expect_err("must fail");
    assert!(err.to_string().contains("max_key_size"), "{}", err);
}

#[tokio::test]
async fn listeners_see_existing_and_hot_plugged_adapters() {
    let provider = MockControllers::with_controllers(&[0]);
    let manager = open(&provider);
    let recorder = Arc::new(SetRecorder::default());
    let listener: AdapterSetListenerRef = recorder.clone();
    assert!(manager.add_changed_adapter_set_listener(listener.clone()));
    assert!(!manager.add_changed_adapter_set_listener(listener.clone()));
    assert_eq!(*recorder.added.lock(), vec![0]);

    provider.add_controller(MockController::new(MockControllerConfig::default().with_dev_id(3)));
    assert!(eventually(|| manager.adapter(3).is_some()).await);
    assert!(eventually(|| *recorder.added.lock() == vec![0, 3]).await);

    let plugged = manager.adapter(3).expect("hci3");
    assert_eq!(plugged.initialize().await, HciStatusCode::Success);
    provider.remove_controller(3);
    assert!(eventually(|| *recorder.removed.lock() == vec![3]).await);
    assert!(manager.adapter(3).is_none());
    assert!(!plugged.is_valid());
    assert!(!plugged.is_powered());

    assert!(manager.remove_changed_adapter_set_listener(&listener));
    provider.add_controller(MockController::new(MockControllerConfig::default().with_dev_id(4)));
    assert!(eventually(|| manager.adapter(4).is_some()).await);
    assert_eq!(*recorder.added.lock(), vec![0, 3]);
    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_every_adapter() {
    let s = powered().await;
    let id = peer(1);
    let dev = s.adapter.find_or_create_device(id);
    dev.connect_le().await;
    assert!(s.listener.wait_for(|e| *e == Ev::Ready(id)).await);

    let adapter = s.adapter.clone();
    let listener = s.listener.clone();
    let manager = s.manager.clone();
    within(manager.shutdown()).await;
    assert!(!adapter.is_valid());
    assert!(!adapter.is_powered());
    assert!(manager.adapters().is_empty());
    assert_eq!(listener.count(|e| matches!(e, Ev::Disconnected(d, _, _) if *d == id)), 1);

    // a second shutdown is a no-op
    within(manager.shutdown()).await;
    assert_eq!(adapter.initialize().await, HciStatusCode::CommandDisallowed);
}
