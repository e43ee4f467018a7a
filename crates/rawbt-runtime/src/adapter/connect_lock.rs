//! Single in-flight connection slot
//!
//! Controllers generally refuse a second LE Create Connection while one is
//! pending. The slot is held from the connect command until the connection
//! completes or fails, and names the device holding it so that whichever
//! task observes the outcome can release it.

use std::time::Duration;

use parking_lot::Mutex;
use rawbt_core::BdAddressAndType;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// How a connect waits for the slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectWait {
    /// Wait up to the configured connect lock timeout
    Block,
    /// Give up at once if another connect is in flight
    FailFast,
}

#[derive(Default)]
pub(crate) struct ConnectLock {
    holder: Mutex<Option<BdAddressAndType>>,
    released: Notify,
}

impl ConnectLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_acquire(&self, id: &BdAddressAndType) -> bool {
        let mut holder = self.holder.lock();
        if holder.is_some() {
            // One attempt per slot, the holder included
            return false;
        }
        *holder = Some(*id);
        true
    }

    pub async fn acquire(&self, id: &BdAddressAndType, wait: Option<Duration>) -> bool {
        if self.try_acquire(id) {
            debug!("connect lock: acquired by {}", id);
            return true;
        }
        let timeout = match wait {
            Some(timeout) => timeout,
            None => return false,
        };
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.try_acquire(id) {
                debug!("connect lock: acquired by {} after wait", id);
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    "connect lock: {} timed out after {:?} waiting for {:?}",
                    id,
                    timeout,
                    self.holder()
                );
                return false;
            }
        }
    }

    /// Release if `id` still holds the slot
    pub fn release(&self, id: &BdAddressAndType) -> bool {
        let mut holder = self.holder.lock();
        if holder.as_ref() != Some(id) {
            return false;
        }
        *holder = None;
        drop(holder);
        debug!("connect lock: released by {}", id);
        self.released.notify_waiters();
        true
    }

    pub fn holder(&self) -> Option<BdAddressAndType> {
        *self.holder.lock()
    }

    pub fn is_locked(&self) -> bool {
        self.holder.lock().is_some()
    }

    /// Drop whatever holds the slot, used at power-off
    pub fn clear(&self) {
        *self.holder.lock() = None;
        self.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rawbt_core::{BdAddress, BdAddressType};
    use std::sync::Arc;

    fn id(n: u8) -> BdAddressAndType {
        BdAddressAndType::new(BdAddress::new([n; 6]), BdAddressType::BdAddrLePublic)
    }

    #[tokio::test]
    async fn fail_fast_and_holder_checked_release() {
        let lock = ConnectLock::new();
        assert!(lock.acquire(&id(1), None).await);
        assert!(!lock.acquire(&id(2), None).await);
        assert!(!lock.release(&id(2)));
        assert_eq!(lock.holder(), Some(id(1)));
        assert!(lock.release(&id(1)));
        assert!(!lock.release(&id(1)));
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn holder_cannot_take_the_slot_twice() {
        let lock = ConnectLock::new();
        assert!(lock.acquire(&id(1), None).await);
        assert!(!lock.acquire(&id(1), None).await);
        assert!(
            !lock
                .acquire(&id(1), Some(Duration::from_millis(30)))
                .await
        );
        assert!(lock.release(&id(1)));
        assert!(lock.acquire(&id(1), None).await);
    }

    #[tokio::test]
    async fn blocked_caller_wakes_on_release() {
        let lock = Arc::new(ConnectLock::new());
        assert!(lock.acquire(&id(1), None).await);
        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire(&id(2), Some(Duration::from_secs(2))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(lock.release(&id(1)));
        assert!(waiter.await.unwrap());
        assert_eq!(lock.holder(), Some(id(2)));
    }

    #[tokio::test]
    async fn blocked_caller_times_out() {
        let lock = ConnectLock::new();
        assert!(lock.acquire(&id(1), None).await);
        assert!(
            !lock
                .acquire(&id(2), Some(Duration::from_millis(30)))
                .await
        );
    }
}
