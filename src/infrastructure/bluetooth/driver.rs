//! Radio Driver Interface
//!
//! The platform BLE stack as seen by the orchestrator: a set of
//! fire-and-forget requests whose outcomes come back later as
//! [`DriverEvent`]s through a [`DriverEventSink`].

use crate::domain::models::{DeviceHandle, GattCharacteristic, RadioState};
use crate::infrastructure::bluetooth::orchestrator::Message;
use anyhow::Result;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Everything the radio driver reports back
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    RadioStateChanged(RadioState),
    Discovered {
        name: Option<String>,
        alias_value: Option<String>,
        device: DeviceHandle,
    },
    Connected(DeviceHandle),
    Disconnected {
        device: DeviceHandle,
        error: Option<String>,
    },
    ServicesDiscovered {
        device: DeviceHandle,
        services: Vec<Uuid>,
        error: Option<String>,
    },
    CharacteristicsDiscovered {
        device: DeviceHandle,
        service_uuid: Uuid,
        characteristics: Vec<Uuid>,
        error: Option<String>,
    },
    CharacteristicValueUpdated {
        device: DeviceHandle,
        characteristic: GattCharacteristic,
        value: Vec<u8>,
        error: Option<String>,
    },
    WriteCompleted {
        device: DeviceHandle,
        characteristic: GattCharacteristic,
        error: Option<String>,
    },
}

/// Where a driver pushes its events. Cheap to clone; safe to use from the
/// driver's own callback threads. Does not keep the orchestrator queue open.
#[derive(Clone)]
pub struct DriverEventSink {
    sender: mpsc::WeakUnboundedSender<Message>,
}

impl DriverEventSink {
    pub fn new(sender: mpsc::WeakUnboundedSender<Message>) -> Self {
        Self { sender }
    }

    /// Returns `false` once the orchestrator has shut down
    pub fn emit(&self, event: DriverEvent) -> bool {
        self.sender
            .upgrade()
            .is_some_and(|sender| sender.send(Message::Driver(event)).is_ok())
    }
}

/// Platform BLE capability set.
///
/// Methods only start work; results arrive as events. An `Err` means the
/// request could not even be issued.
pub trait RadioDriver: Send + 'static {
    /// Install the sink that receives advertisements and all other events
    fn set_event_sink(&mut self, sink: DriverEventSink);

    fn radio_state(&self) -> RadioState;

    fn start_scan(&mut self) -> Result<()>;
    fn stop_scan(&mut self) -> Result<()>;

    fn connect(&mut self, device: DeviceHandle) -> Result<()>;
    fn cancel_connect(&mut self, device: DeviceHandle) -> Result<()>;
    fn disconnect(&mut self, device: DeviceHandle) -> Result<()>;

    /// Discover only the listed services
    fn discover_services(&mut self, device: DeviceHandle, services: &[Uuid]) -> Result<()>;

    /// Discover only the listed characteristics of one service
    fn discover_characteristics(
        &mut self,
        device: DeviceHandle,
        service_uuid: Uuid,
        characteristics: &[Uuid],
    ) -> Result<()>;

    fn write_value(
        &mut self,
        device: DeviceHandle,
        characteristic: &GattCharacteristic,
        data: &[u8],
    ) -> Result<()>;

    fn read_value(&mut self, device: DeviceHandle, characteristic: &GattCharacteristic)
        -> Result<()>;

    fn set_notify(
        &mut self,
        device: DeviceHandle,
        characteristic: &GattCharacteristic,
        enabled: bool,
    ) -> Result<()>;
}
