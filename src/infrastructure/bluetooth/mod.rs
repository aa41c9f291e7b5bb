//! Bluetooth Module
//!
//! Multi-target BLE connection orchestration.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │  (Cloneable handle - public async API)                   │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ Message queue (commands, events, ticks)
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                 ConnectionOrchestrator                   │
//! │  (Single consumer - owns every request and the scan)     │
//! └──────┬──────────────────┬──────────────────┬────────────┘
//!        │                  │                  │
//!        ▼                  ▼                  ▼
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ RadioDriver │   │  TickSource  │   │  Delegate    │
//! │             │   │              │   │  Registry    │
//! │ - Scan      │   │ - Per-request│   │ - Weak       │
//! │ - Connect   │   │   countdown  │   │   observers  │
//! │ - GATT      │   │              │   │              │
//! └─────────────┘   └──────────────┘   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`driver`] - Radio driver trait and the events it reports
//! - [`orchestrator`] - Request lifecycle state machine
//! - [`registry`] - Observer registry and broadcast
//! - [`ticker`] - Countdown ticks on the orchestrator queue
//! - [`service`] - Async handle and process-wide instance
//! - `btleplug_driver` - Driver backed by btleplug (feature `btleplug`)

#[cfg(feature = "btleplug")]
pub mod btleplug_driver;
pub mod driver;
pub mod orchestrator;
pub mod registry;
pub mod service;
pub mod ticker;

pub use driver::{DriverEvent, DriverEventSink, RadioDriver};
pub use orchestrator::{Command, ConnectionOrchestrator, Message};
pub use registry::{DelegateRegistry, ObserverEvent, OrchestratorObserver};
pub use service::{install_shared, shared, BluetoothService};
pub use ticker::{TickSource, TokioTicker};
