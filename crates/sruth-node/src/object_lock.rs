use parking_lot::Mutex;
use tokio::sync::Notify;

/// A single-slot, latest-wins mailbox (§9 "Object-lock"): `put` replaces
/// any previous value, `take` waits for the next one. Used to feed the
/// topology distributor so a burst of topology updates collapses into at
/// most one on-disk write per coalescence.
pub struct ObjectLock<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> Default for ObjectLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObjectLock<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub fn put(&self, value: T) {
        *self.slot.lock() = Some(value);
        self.notify.notify_one();
    }

    pub async fn take(&self) -> T {
        loop {
            if let Some(value) = self.slot.lock().take() {
                return value;
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_replaces_pending_value() {
        let lock: ObjectLock<u32> = ObjectLock::new();
        lock.put(1);
        lock.put(2);
        assert_eq!(lock.take().await, 2);
    }

    #[tokio::test]
    async fn take_waits_for_a_value() {
        let lock = std::sync::Arc::new(ObjectLock::<u32>::new());
        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.take().await })
        };
        tokio::task::yield_now().await;
        lock.put(7);
        assert_eq!(waiter.await.unwrap(), 7);
    }
}
