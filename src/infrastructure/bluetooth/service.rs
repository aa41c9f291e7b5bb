//! Bluetooth Service Module
//!
//! Async front door to the orchestrator. Every call becomes a message on
//! the orchestrator queue; a single worker task drains the queue, so the
//! service handle can be cloned freely across tasks.

use crate::domain::error::BleError;
use crate::domain::models::{
    DeviceHandle, GattCharacteristic, OrchestratorSnapshot, RequestId, RequestState,
};
use crate::domain::operation::GattOperation;
use crate::domain::request::ConnectRequest;
use crate::domain::settings::OrchestratorSettings;
use crate::infrastructure::bluetooth::driver::{DriverEventSink, RadioDriver};
use crate::infrastructure::bluetooth::orchestrator::{Command, ConnectionOrchestrator, Message};
use crate::infrastructure::bluetooth::registry::OrchestratorObserver;
use crate::infrastructure::bluetooth::ticker::TokioTicker;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

static SHARED: OnceLock<BluetoothService> = OnceLock::new();

/// Handle to a running orchestrator
#[derive(Clone)]
pub struct BluetoothService {
    sender: mpsc::UnboundedSender<Message>,
}

impl BluetoothService {
    /// Spawn the orchestrator worker on the current tokio runtime.
    ///
    /// The worker stops on [`shutdown`](Self::shutdown) or once every
    /// handle has been dropped.
    pub fn start<D: RadioDriver>(driver: D, settings: &OrchestratorSettings) -> Self {
        Self::start_with_handle(driver, settings).0
    }

    /// Like [`start`](Self::start), also returning the worker task, which
    /// ends after [`shutdown`](Self::shutdown).
    pub fn start_with_handle<D: RadioDriver>(
        mut driver: D,
        settings: &OrchestratorSettings,
    ) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        driver.set_event_sink(DriverEventSink::new(sender.downgrade()));

        let period = Duration::from_millis(settings.tick_interval_ms.max(1));
        let ticker = TokioTicker::new(sender.downgrade(), period);
        let mut orchestrator = ConnectionOrchestrator::new(driver, ticker, settings.clone());

        let worker = tokio::spawn(async move {
            info!("Orchestrator started");
            loop {
                let Some(message) = receiver.recv().await else {
                    debug!("Every service handle dropped");
                    orchestrator.dispatch(Message::Shutdown);
                    break;
                };
                if !orchestrator.dispatch(message) {
                    break;
                }
            }
            info!("Orchestrator stopped");
        });

        (Self { sender }, worker)
    }

    fn send(&self, command: Command) {
        if let Err(mpsc::error::SendError(message)) = self.sender.send(Message::Command(command))
        {
            warn!("Orchestrator is not running");
            if let Message::Command(command) = message {
                command.reject(BleError::ServiceStopped);
            }
        }
    }

    /// Queue a connection attempt. Callbacks on the request report the outcome.
    pub fn connect(&self, request: ConnectRequest) -> RequestId {
        let id = request.id();
        self.send(Command::Connect(request));
        id
    }

    /// Connect and wait for the device to become ready
    pub async fn connect_async(&self, request: ConnectRequest) -> Result<DeviceHandle, BleError> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
        let on_err = tx.clone();
        let request = request
            .on_success(move |device| reply(&tx, Ok(device)))
            .on_failure(move |error| reply(&on_err, Err(error)));
        self.connect(request);
        rx.await.unwrap_or(Err(BleError::ServiceStopped))
    }

    pub fn disconnect(&self, target_name: impl Into<String>) {
        self.send(Command::Disconnect {
            target_name: target_name.into(),
        });
    }

    pub fn operate(&self, op: GattOperation) {
        self.send(Command::Operate(op));
    }

    pub fn read(
        &self,
        target_name: impl Into<String>,
        characteristic: GattCharacteristic,
        on_success: impl FnOnce(Vec<u8>) + Send + 'static,
        on_failure: impl FnOnce(BleError) + Send + 'static,
    ) {
        self.operate(GattOperation::read(
            target_name,
            characteristic,
            on_success,
            on_failure,
        ));
    }

    pub fn write(
        &self,
        target_name: impl Into<String>,
        characteristic: GattCharacteristic,
        data: Vec<u8>,
        on_success: impl FnOnce() + Send + 'static,
        on_failure: impl FnOnce(BleError) + Send + 'static,
    ) {
        self.operate(GattOperation::write(
            target_name,
            characteristic,
            data,
            on_success,
            on_failure,
        ));
    }

    /// Read a characteristic, connecting first if needed
    pub async fn read_async(
        &self,
        target_name: impl Into<String>,
        characteristic: GattCharacteristic,
    ) -> Result<Vec<u8>, BleError> {
        self.read_with_progress(target_name, characteristic, |_| {})
            .await
    }

    /// [`read_async`](Self::read_async), reporting each state the target passes through
    pub async fn read_with_progress(
        &self,
        target_name: impl Into<String>,
        characteristic: GattCharacteristic,
        on_progress: impl FnMut(RequestState) + Send + 'static,
    ) -> Result<Vec<u8>, BleError> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
        let on_err = tx.clone();
        let op = GattOperation::read(
            target_name,
            characteristic,
            move |value| reply(&tx, Ok(value)),
            move |error| reply(&on_err, Err(error)),
        )
        .with_progress(on_progress);
        self.operate(op);
        rx.await.unwrap_or(Err(BleError::ServiceStopped))
    }

    /// Write a characteristic, connecting first if needed
    pub async fn write_async(
        &self,
        target_name: impl Into<String>,
        characteristic: GattCharacteristic,
        data: Vec<u8>,
    ) -> Result<(), BleError> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
        let on_err = tx.clone();
        self.write(
            target_name,
            characteristic,
            data,
            move || reply(&tx, Ok(())),
            move |error| reply(&on_err, Err(error)),
        );
        rx.await.unwrap_or(Err(BleError::ServiceStopped))
    }

    pub fn subscribe(
        &self,
        target_name: impl Into<String>,
        characteristic: GattCharacteristic,
        enabled: bool,
    ) {
        self.send(Command::Subscribe {
            target_name: target_name.into(),
            characteristic,
            enabled,
        });
    }

    /// Register a non-owning observer. Drop your `Arc` to stop delivery.
    pub fn add_observer(&self, observer: &Arc<dyn OrchestratorObserver>) {
        self.send(Command::AddObserver(observer.clone()));
    }

    pub fn remove_observer(&self, observer: &Arc<dyn OrchestratorObserver>) {
        self.send(Command::RemoveObserver(observer.clone()));
    }

    /// Current scan flag and active requests; empty once stopped
    pub async fn snapshot(&self) -> OrchestratorSnapshot {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx));
        rx.await.unwrap_or_default()
    }

    /// Fail everything still active with `ServiceStopped` and stop the worker
    pub fn shutdown(&self) {
        if self.sender.send(Message::Shutdown).is_err() {
            debug!("Orchestrator already stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Send on a oneshot shared by a success and a failure callback
fn reply<T>(slot: &std::sync::Mutex<Option<oneshot::Sender<T>>>, value: T) {
    if let Some(tx) = slot.lock().ok().and_then(|mut s| s.take()) {
        let _ = tx.send(value);
    }
}

/// Start the process-wide service. Later calls return the first instance
/// and drop their driver.
pub fn install_shared<D: RadioDriver>(
    driver: D,
    settings: &OrchestratorSettings,
) -> &'static BluetoothService {
    SHARED.get_or_init(|| BluetoothService::start(driver, settings))
}

/// The process-wide service, if [`install_shared`] has run
pub fn shared() -> Option<&'static BluetoothService> {
    SHARED.get()
}
