//! Replaceable session callbacks
//!
//! A session holds at most one callback per event kind. Callbacks run
//! synchronously on the accept-loop task and must return promptly.

use std::sync::{Arc, PoisonError, RwLock};

use tether_core::Device;

use crate::protocol::Envelope;

pub type DataCallback = Arc<dyn Fn(&Envelope) + Send + Sync>;
pub type DeviceCallback = Arc<dyn Fn(&Device) + Send + Sync>;
pub type SignalCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Slots {
    data: Option<DataCallback>,
    connected: Option<DeviceCallback>,
    disconnected: Option<DeviceCallback>,
    owner_lost: Option<SignalCallback>,
}

#[derive(Default)]
pub(crate) struct Observers {
    slots: RwLock<Slots>,
}

impl Observers {
    fn update(&self, f: impl FnOnce(&mut Slots)) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut slots);
    }

    // Callbacks are cloned out so none runs while the lock is held
    fn snapshot<T>(&self, f: impl FnOnce(&Slots) -> Option<T>) -> Option<T> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        f(&slots)
    }

    pub fn set_data(&self, callback: DataCallback) {
        self.update(|s| s.data = Some(callback));
    }

    pub fn set_connected(&self, callback: DeviceCallback) {
        self.update(|s| s.connected = Some(callback));
    }

    pub fn set_disconnected(&self, callback: DeviceCallback) {
        self.update(|s| s.disconnected = Some(callback));
    }

    pub fn set_owner_lost(&self, callback: SignalCallback) {
        self.update(|s| s.owner_lost = Some(callback));
    }

    pub fn data(&self, envelope: &Envelope) {
        if let Some(callback) = self.snapshot(|s| s.data.clone()) {
            callback(envelope);
        }
    }

    pub fn connected(&self, device: &Device) {
        if let Some(callback) = self.snapshot(|s| s.connected.clone()) {
            callback(device);
        }
    }

    pub fn disconnected(&self, device: &Device) {
        if let Some(callback) = self.snapshot(|s| s.disconnected.clone()) {
            callback(device);
        }
    }

    pub fn owner_lost(&self) {
        if let Some(callback) = self.snapshot(|s| s.owner_lost.clone()) {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_replacing_a_callback() {
        let observers = Observers::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        observers.set_connected(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        observers.connected(&Device::new("a", "1"));

        let counter = second.clone();
        observers.set_connected(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        observers.connected(&Device::new("a", "1"));

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unset_callbacks_are_skipped() {
        let observers = Observers::default();
        observers.data(&Envelope::text("nobody listening"));
        observers.owner_lost();
    }
}
