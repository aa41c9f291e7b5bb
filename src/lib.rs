//! BLE connection orchestrator.
//!
//! Scan, connect, discover and exchange GATT data with several named
//! peripherals at once, each request with its own countdown.
//!
//! ```ignore
//! let service = BluetoothService::start(driver, &OrchestratorSettings::default());
//! let value = service.read_async("Lock-01", characteristic).await?;
//! ```

pub mod domain;
pub mod infrastructure;

pub use domain::error::BleError;
pub use domain::models::{
    DeviceHandle, GattCharacteristic, RequestId, RequestState, ServiceSpec, TargetIdentity,
};
pub use domain::operation::GattOperation;
pub use domain::request::ConnectRequest;
pub use infrastructure::bluetooth::BluetoothService;
