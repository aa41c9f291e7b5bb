//! Observer registry
//!
//! Holds non-owning references to observers and fans lifecycle events out
//! to them. Dropping the last `Arc` to an observer is enough to stop
//! delivery; a panicking observer does not stop delivery to the rest.

use crate::domain::error::BleError;
use crate::domain::models::{DeviceHandle, GattCharacteristic, RadioState, TargetIdentity};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::warn;

/// Lifecycle notifications broadcast to every registered observer
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverEvent {
    Connected {
        target: TargetIdentity,
        device: DeviceHandle,
    },
    Disconnected {
        target: TargetIdentity,
        device: Option<DeviceHandle>,
        error: Option<BleError>,
    },
    CharacteristicUpdated {
        device: DeviceHandle,
        characteristic: GattCharacteristic,
        value: Result<Vec<u8>, BleError>,
    },
    ScanStateChanged {
        scanning: bool,
    },
    RadioStateChanged(RadioState),
}

/// Capability set of an observer. Every method defaults to a no-op.
pub trait OrchestratorObserver: Send + Sync {
    fn on_connected(&self, _target: &TargetIdentity, _device: DeviceHandle) {}

    fn on_disconnected(
        &self,
        _target: &TargetIdentity,
        _device: Option<DeviceHandle>,
        _error: Option<&BleError>,
    ) {
    }

    fn on_characteristic_update(
        &self,
        _device: DeviceHandle,
        _characteristic: &GattCharacteristic,
        _value: Result<&[u8], &BleError>,
    ) {
    }

    fn on_scan_state_changed(&self, _scanning: bool) {}

    fn on_radio_state_changed(&self, _state: RadioState) {}
}

fn deliver(observer: &dyn OrchestratorObserver, event: &ObserverEvent) {
    match event {
        ObserverEvent::Connected { target, device } => observer.on_connected(target, *device),
        ObserverEvent::Disconnected {
            target,
            device,
            error,
        } => observer.on_disconnected(target, *device, error.as_ref()),
        ObserverEvent::CharacteristicUpdated {
            device,
            characteristic,
            value,
        } => observer.on_characteristic_update(
            *device,
            characteristic,
            value.as_ref().map(Vec::as_slice),
        ),
        ObserverEvent::ScanStateChanged { scanning } => observer.on_scan_state_changed(*scanning),
        ObserverEvent::RadioStateChanged(state) => observer.on_radio_state_changed(*state),
    }
}

fn same_observer(a: &Weak<dyn OrchestratorObserver>, b: &Arc<dyn OrchestratorObserver>) -> bool {
    a.as_ptr() as *const () == Arc::as_ptr(b) as *const ()
}

#[derive(Default)]
pub struct DelegateRegistry {
    observers: Vec<Weak<dyn OrchestratorObserver>>,
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. Adding the same observer twice is a no-op.
    pub fn add(&mut self, observer: &Arc<dyn OrchestratorObserver>) {
        if self.observers.iter().any(|o| same_observer(o, observer)) {
            return;
        }
        self.observers.push(Arc::downgrade(observer));
    }

    pub fn remove(&mut self, observer: &Arc<dyn OrchestratorObserver>) {
        self.observers.retain(|o| !same_observer(o, observer));
    }

    /// Number of observers still alive
    pub fn len(&self) -> usize {
        self.observers.iter().filter(|o| o.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to a snapshot of the live observers. Returns how many
    /// observers handled it without panicking.
    pub fn broadcast(&mut self, event: &ObserverEvent) -> usize {
        self.observers.retain(|o| o.strong_count() > 0);
        let snapshot: Vec<Arc<dyn OrchestratorObserver>> =
            self.observers.iter().filter_map(Weak::upgrade).collect();

        let mut delivered = 0;
        for observer in snapshot {
            let result = panic::catch_unwind(AssertUnwindSafe(|| deliver(&*observer, event)));
            match result {
                Ok(()) => delivered += 1,
                Err(_) => warn!("Observer panicked while handling {:?}", event),
            }
        }
        delivered
    }
}
