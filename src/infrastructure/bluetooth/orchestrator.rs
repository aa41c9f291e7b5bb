//! Connection Orchestrator
//!
//! Owns the active request set and advances each request from radio
//! events and countdown ticks. Everything goes through [`dispatch`], one
//! message at a time, so no state here is shared or locked.
//!
//! [`dispatch`]: ConnectionOrchestrator::dispatch

use crate::domain::error::BleError;
use crate::domain::matcher::DeviceMatcher;
use crate::domain::models::{
    DeviceHandle, GattCharacteristic, OperationKind, OrchestratorSnapshot, RequestId,
    RequestState, ServiceSpec,
};
use crate::domain::operation::{GattAction, GattOperation};
use crate::domain::request::{ConnectRequest, TimedRequest};
use crate::domain::settings::{OperationDiscipline, OrchestratorSettings};
use crate::infrastructure::bluetooth::driver::{DriverEvent, RadioDriver};
use crate::infrastructure::bluetooth::registry::{
    DelegateRegistry, ObserverEvent, OrchestratorObserver,
};
use crate::infrastructure::bluetooth::ticker::TickSource;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Public operations, queued by [`BluetoothService`](super::BluetoothService)
pub enum Command {
    Connect(ConnectRequest),
    Disconnect {
        target_name: String,
    },
    Operate(GattOperation),
    Subscribe {
        target_name: String,
        characteristic: GattCharacteristic,
        enabled: bool,
    },
    AddObserver(Arc<dyn OrchestratorObserver>),
    RemoveObserver(Arc<dyn OrchestratorObserver>),
    Snapshot(oneshot::Sender<OrchestratorSnapshot>),
}

impl Command {
    /// Report `error` through whatever failure callback the command carries
    pub(crate) fn reject(self, error: BleError) {
        match self {
            Self::Connect(request) => request.reject(error),
            Self::Operate(op) => op.fail(error),
            _ => {}
        }
    }
}

/// Everything the dispatch loop consumes
pub enum Message {
    Command(Command),
    Driver(DriverEvent),
    Tick(RequestId),
    Shutdown,
}

pub struct ConnectionOrchestrator<D: RadioDriver, T: TickSource> {
    driver: D,
    ticker: T,
    requests: Vec<TimedRequest>,
    observers: DelegateRegistry,
    scanning: bool,
    /// Single read/write slot
    pending: Option<GattOperation>,
    settings: OrchestratorSettings,
}

impl<D: RadioDriver, T: TickSource> ConnectionOrchestrator<D, T> {
    pub fn new(driver: D, ticker: T, settings: OrchestratorSettings) -> Self {
        Self {
            driver,
            ticker,
            requests: Vec::new(),
            observers: DelegateRegistry::new(),
            scanning: false,
            pending: None,
            settings,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn ticker(&self) -> &T {
        &self.ticker
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn requests(&self) -> &[TimedRequest] {
        &self.requests
    }

    pub fn has_pending_operation(&self) -> bool {
        self.pending.is_some()
    }

    pub fn snapshot(&self) -> OrchestratorSnapshot {
        OrchestratorSnapshot {
            scanning: self.scanning,
            requests: self.requests.iter().map(TimedRequest::snapshot).collect(),
        }
    }

    /// Process one message. Returns `false` after a shutdown.
    pub fn dispatch(&mut self, message: Message) -> bool {
        match message {
            Message::Command(command) => self.handle_command(command),
            Message::Driver(event) => self.handle_driver_event(event),
            Message::Tick(id) => self.on_tick(id),
            Message::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(request) => {
                self.connect(request);
            }
            Command::Disconnect { target_name } => self.disconnect(&target_name),
            Command::Operate(op) => self.operate(op),
            Command::Subscribe {
                target_name,
                characteristic,
                enabled,
            } => {
                self.subscribe(&target_name, characteristic, enabled);
            }
            Command::AddObserver(observer) => self.observers.add(&observer),
            Command::RemoveObserver(observer) => self.observers.remove(&observer),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn handle_driver_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::RadioStateChanged(state) => {
                info!("Radio state changed: {:?}", state);
                self.observers
                    .broadcast(&ObserverEvent::RadioStateChanged(state));
            }
            DriverEvent::Discovered {
                name,
                alias_value,
                device,
            } => self.on_discovered(name.as_deref(), alias_value.as_deref(), device),
            DriverEvent::Connected(device) => self.on_connected(device),
            DriverEvent::Disconnected { device, error } => self.on_disconnected(device, error),
            DriverEvent::ServicesDiscovered {
                device,
                services,
                error,
            } => self.on_services_discovered(device, &services, error),
            DriverEvent::CharacteristicsDiscovered {
                device,
                service_uuid,
                characteristics,
                error,
            } => self.on_characteristics_discovered(device, service_uuid, &characteristics, error),
            DriverEvent::CharacteristicValueUpdated {
                device,
                characteristic,
                value,
                error,
            } => self.on_value_updated(device, characteristic, value, error),
            DriverEvent::WriteCompleted {
                device,
                characteristic,
                error,
            } => self.on_write_completed(device, characteristic, error),
        }
    }

    // Public operations

    /// Register a connection attempt and start scanning for it.
    ///
    /// Radio problems fail the request immediately. A request for an
    /// identity that is already `Ready` succeeds at once with the existing
    /// device; one that is still in flight is rejected as a duplicate.
    pub fn connect(&mut self, request: ConnectRequest) -> RequestId {
        let id = request.id();

        if let Some(error) = BleError::from_radio_state(self.driver.radio_state()) {
            warn!("Cannot connect to {}: {}", request.target(), error);
            request.reject(error);
            return id;
        }

        let existing = self
            .requests
            .iter()
            .find(|r| r.target() == request.target() && !r.state().is_terminal());
        if let Some(existing) = existing {
            if existing.state() == RequestState::Ready {
                let existing_id = existing.id();
                info!("{} already connected, reusing {}", request.target(), existing_id);
                if let (Some(on_success), Some(device)) = (request.on_success, existing.device())
                {
                    on_success(device);
                }
                return existing_id;
            }
            warn!(
                "Rejecting {} for {}: {} is still {:?}",
                id,
                request.target(),
                existing.id(),
                existing.state()
            );
            request.reject(BleError::DuplicateRequest);
            return id;
        }

        self.register(request);
        id
    }

    /// Drop the connection (or connection attempt) for `target_name`.
    /// Unknown targets are ignored.
    pub fn disconnect(&mut self, target_name: &str) {
        let Some(idx) = self.index_by_name(target_name) else {
            debug!("Disconnect for {}: nothing active", target_name);
            return;
        };

        let was_ready = self.requests[idx].state() == RequestState::Ready;
        let error = if was_ready {
            None
        } else {
            Some(BleError::Cancelled)
        };
        info!("Disconnecting {}", target_name);
        let request = self.retire(idx, RequestState::Disconnected, error, true);

        if was_ready {
            self.observers.broadcast(&ObserverEvent::Disconnected {
                target: request.target().clone(),
                device: request.device(),
                error: None,
            });
        }
    }

    /// Start a read or write. Uses the single operation slot; see
    /// [`OperationDiscipline`] for what happens on overlap.
    pub fn operate(&mut self, op: GattOperation) {
        if let Some(current) = &self.pending {
            match self.settings.operation_discipline {
                OperationDiscipline::Reject => {
                    warn!(
                        "Rejecting {:?} on {}: {:?} on {} still outstanding",
                        op.kind(),
                        op.target_name(),
                        current.kind(),
                        current.target_name()
                    );
                    op.fail(BleError::OperationInProgress);
                    return;
                }
                OperationDiscipline::SingleSlot => {
                    warn!(
                        "Replacing outstanding {:?} on {} with {:?} on {}",
                        current.kind(),
                        current.target_name(),
                        op.kind(),
                        op.target_name()
                    );
                }
            }
        }

        match self.index_by_name(op.target_name()) {
            Some(idx) => {
                let state = self.requests[idx].state();
                let op = self.pending.insert(op);
                op.progress(state);
                if state == RequestState::Ready {
                    self.issue_pending(idx);
                }
            }
            None => {
                if let Some(error) = BleError::from_radio_state(self.driver.radio_state()) {
                    warn!("Cannot reach {}: {}", op.target_name(), error);
                    op.fail(error);
                    return;
                }
                let characteristic = *op.characteristic();
                let request = ConnectRequest::new(op.target_name())
                    .services(vec![ServiceSpec::new(
                        characteristic.service_uuid,
                        [characteristic.uuid],
                    )])
                    .timeout_secs(self.settings.default_timeout_secs);
                self.pending = Some(op);
                self.register(request);
            }
        }
    }

    /// Enable or disable notifications on a ready target
    pub fn subscribe(
        &mut self,
        target_name: &str,
        characteristic: GattCharacteristic,
        enabled: bool,
    ) -> bool {
        let device = self
            .index_by_name(target_name)
            .map(|idx| &self.requests[idx])
            .filter(|r| r.state() == RequestState::Ready && r.has_characteristic(&characteristic))
            .and_then(TimedRequest::device);

        let Some(device) = device else {
            warn!(
                "Cannot change notifications for {} on {}: not ready",
                characteristic, target_name
            );
            return false;
        };

        match self.driver.set_notify(device, &characteristic, enabled) {
            Ok(()) => {
                info!("Notifications {} for {} on {}", enabled, characteristic, target_name);
                true
            }
            Err(e) => {
                error!("Failed to set notifications on {}: {:#}", device, e);
                false
            }
        }
    }

    pub fn add_observer(&mut self, observer: &Arc<dyn OrchestratorObserver>) {
        self.observers.add(observer);
    }

    pub fn remove_observer(&mut self, observer: &Arc<dyn OrchestratorObserver>) {
        self.observers.remove(observer);
    }

    // Driver events

    fn on_discovered(
        &mut self,
        name: Option<&str>,
        alias_value: Option<&str>,
        device: DeviceHandle,
    ) {
        if self.index_by_device(device).is_some() {
            trace!("{} already bound, ignoring advertisement", device);
            return;
        }
        let Some(id) = DeviceMatcher::find(name, alias_value, &self.requests) else {
            trace!("No request for advertisement {:?} / {:?}", name, alias_value);
            return;
        };
        let Some(idx) = self.index_of(id) else {
            return;
        };

        info!(
            "Matched {} ({:?}) to {}",
            device,
            name,
            self.requests[idx].target()
        );
        self.requests[idx].bind_device(device);
        self.transition(idx, RequestState::Connecting);
        self.sync_scan();

        if let Err(e) = self.driver.connect(device) {
            error!("Failed to start connecting to {}: {:#}", device, e);
            self.retire(idx, RequestState::Failed, Some(BleError::ConnectFailed), false);
        }
    }

    fn on_connected(&mut self, device: DeviceHandle) {
        let Some(idx) = self.index_by_device(device) else {
            debug!("Connected event for unknown {}", device);
            return;
        };
        if self.requests[idx].state() != RequestState::Connecting {
            debug!(
                "Connected event for {} in state {:?}",
                device,
                self.requests[idx].state()
            );
            return;
        }

        let services: Option<Vec<Uuid>> = self.requests[idx]
            .desired_services()
            .map(|specs| specs.iter().map(ServiceSpec::service_uuid).collect());

        match services {
            Some(services) => {
                info!("Connected to {}, discovering {} services", device, services.len());
                self.transition(idx, RequestState::DiscoveringServices);
                if let Err(e) = self.driver.discover_services(device, &services) {
                    error!("Failed to start service discovery on {}: {:#}", device, e);
                    self.retire(
                        idx,
                        RequestState::Failed,
                        Some(BleError::ServiceDiscoveryFailed),
                        true,
                    );
                }
            }
            None => self.become_ready(idx),
        }
    }

    fn on_services_discovered(
        &mut self,
        device: DeviceHandle,
        services: &[Uuid],
        error: Option<String>,
    ) {
        let Some(idx) = self.index_by_device(device) else {
            return;
        };
        if self.requests[idx].state() != RequestState::DiscoveringServices {
            return;
        }

        if let Some(e) = error {
            warn!("Service discovery on {} failed: {}", device, e);
            self.retire(idx, RequestState::Failed, Some(BleError::ServiceDiscoveryFailed), true);
            return;
        }

        let Some(pending) = self.requests[idx].begin_characteristic_discovery(services) else {
            warn!("{} is missing a desired service (offered {:?})", device, services);
            self.retire(idx, RequestState::Failed, Some(BleError::ServiceDiscoveryFailed), true);
            return;
        };

        if pending.is_empty() {
            self.become_ready(idx);
            return;
        }

        self.transition(idx, RequestState::DiscoveringCharacteristics);
        for spec in &pending {
            let characteristics: Vec<Uuid> = spec.characteristic_uuids().iter().copied().collect();
            if let Err(e) =
                self.driver
                    .discover_characteristics(device, spec.service_uuid(), &characteristics)
            {
                error!(
                    "Failed to start characteristic discovery on {}: {:#}",
                    device, e
                );
                self.retire(
                    idx,
                    RequestState::Failed,
                    Some(BleError::CharacteristicDiscoveryFailed),
                    true,
                );
                return;
            }
        }
    }

    fn on_characteristics_discovered(
        &mut self,
        device: DeviceHandle,
        service_uuid: Uuid,
        characteristics: &[Uuid],
        error: Option<String>,
    ) {
        let Some(idx) = self.index_by_device(device) else {
            return;
        };
        if self.requests[idx].state() != RequestState::DiscoveringCharacteristics {
            return;
        }

        if let Some(e) = error {
            warn!("Characteristic discovery for {} on {} failed: {}", service_uuid, device, e);
            self.retire(
                idx,
                RequestState::Failed,
                Some(BleError::CharacteristicDiscoveryFailed),
                true,
            );
            return;
        }

        match self.requests[idx].record_characteristics(service_uuid, characteristics) {
            Some(true) => self.become_ready(idx),
            Some(false) => debug!("{}: characteristics for {} resolved", device, service_uuid),
            None => {
                warn!("{} is missing desired characteristics of {}", device, service_uuid);
                self.retire(
                    idx,
                    RequestState::Failed,
                    Some(BleError::CharacteristicDiscoveryFailed),
                    true,
                );
            }
        }
    }

    fn on_disconnected(&mut self, device: DeviceHandle, error: Option<String>) {
        let Some(idx) = self.index_by_device(device) else {
            debug!("Disconnected event for unknown {}", device);
            return;
        };

        let was_ready = self.requests[idx].state() == RequestState::Ready;
        let (state, ble_error) = if was_ready {
            (RequestState::Disconnected, BleError::UnexpectedDisconnect)
        } else {
            (RequestState::Failed, BleError::ConnectFailed)
        };
        if let Some(e) = &error {
            debug!("{} disconnected: {}", device, e);
        }

        let request = self.retire(idx, state, Some(ble_error.clone()), false);
        self.observers.broadcast(&ObserverEvent::Disconnected {
            target: request.target().clone(),
            device: Some(device),
            error: Some(ble_error),
        });
    }

    fn on_value_updated(
        &mut self,
        device: DeviceHandle,
        characteristic: GattCharacteristic,
        value: Vec<u8>,
        error: Option<String>,
    ) {
        let result = match error {
            Some(e) => {
                debug!("Read of {} on {} failed: {}", characteristic, device, e);
                Err(BleError::ReadFailed)
            }
            None => Ok(value),
        };

        if let Some(op) = self.take_matching(OperationKind::Read, device, &characteristic) {
            op.complete(result.clone());
        }

        self.observers.broadcast(&ObserverEvent::CharacteristicUpdated {
            device,
            characteristic,
            value: result,
        });
    }

    fn on_write_completed(
        &mut self,
        device: DeviceHandle,
        characteristic: GattCharacteristic,
        error: Option<String>,
    ) {
        let Some(op) = self.take_matching(OperationKind::Write, device, &characteristic) else {
            debug!("Unclaimed write completion for {} on {}", characteristic, device);
            return;
        };
        match error {
            Some(e) => {
                debug!("Write of {} on {} failed: {}", characteristic, device, e);
                op.complete(Err(BleError::WriteFailed));
            }
            None => op.complete(Ok(Vec::new())),
        }
    }

    fn on_tick(&mut self, id: RequestId) {
        let Some(idx) = self.index_of(id) else {
            trace!("Tick for retired {}", id);
            return;
        };

        let request = &mut self.requests[idx];
        if !request.tick() {
            return;
        }

        warn!(
            "{} for {} timed out in state {:?}",
            id,
            request.target(),
            request.state()
        );
        request.stop_timer();
        let snapshot = request.snapshot();
        if let Some(on_timeout) = request.take_on_timeout() {
            on_timeout(snapshot);
        }
        self.retire(idx, RequestState::Failed, Some(BleError::ScanTimeout), true);
    }

    // Helpers

    fn index_of(&self, id: RequestId) -> Option<usize> {
        self.requests.iter().position(|r| r.id() == id)
    }

    fn index_by_device(&self, device: DeviceHandle) -> Option<usize> {
        self.requests.iter().position(|r| r.device() == Some(device))
    }

    fn index_by_name(&self, name: &str) -> Option<usize> {
        self.requests.iter().position(|r| r.target().name == name)
    }

    fn register(&mut self, request: ConnectRequest) {
        let mut request = TimedRequest::new(request);
        info!(
            "Scanning for {} ({}, {}s)",
            request.target(),
            request.id(),
            request.remaining_seconds()
        );
        request.start_timer();
        let id = request.id();
        self.requests.push(request);
        self.ticker.start(id);
        self.transition(self.requests.len() - 1, RequestState::Scanning);
        self.sync_scan();
    }

    fn transition(&mut self, idx: usize, state: RequestState) {
        let request = &mut self.requests[idx];
        debug!(
            "{} {}: {:?} -> {:?}",
            request.id(),
            request.target(),
            request.state(),
            state
        );
        request.set_state(state);
        if let Some(op) = self.pending.as_mut() {
            if op.target_name == request.target().name {
                op.progress(state);
            }
        }
    }

    fn become_ready(&mut self, idx: usize) {
        self.transition(idx, RequestState::Ready);

        let request = &mut self.requests[idx];
        request.stop_timer();
        self.ticker.stop(request.id());
        let Some(device) = request.device() else {
            return;
        };
        info!("{} ready on {}", request.target(), device);

        if let Some(on_success) = request.take_on_success() {
            on_success(device);
        }
        let target = request.target().clone();
        self.observers
            .broadcast(&ObserverEvent::Connected { target, device });

        self.issue_pending(idx);
    }

    /// Hand the waiting operation for `requests[idx]` to the driver
    fn issue_pending(&mut self, idx: usize) {
        let request = &self.requests[idx];
        let Some(device) = request.device() else {
            return;
        };
        let resolved = match &self.pending {
            Some(op) if !op.issued && op.target_name == request.target().name => {
                request.has_characteristic(&op.characteristic)
            }
            _ => return,
        };

        if !resolved {
            if let Some(op) = self.pending.take() {
                warn!("{} has no resolved {}", op.target_name, op.characteristic);
                op.fail(BleError::CharacteristicNotFound);
            }
            return;
        }

        let Some(op) = self.pending.as_mut() else {
            return;
        };
        op.issued = true;
        debug!("Issuing {:?} of {} on {}", op.kind(), op.characteristic, device);
        let result = match &op.action {
            GattAction::Read { .. } => self.driver.read_value(device, &op.characteristic),
            GattAction::Write { data, .. } => {
                self.driver.write_value(device, &op.characteristic, data)
            }
        };

        if let Err(e) = result {
            error!("Failed to issue operation on {}: {:#}", device, e);
            if let Some(op) = self.pending.take() {
                op.fail_operation();
            }
        }
    }

    /// Claim the slot for a completion event.
    ///
    /// The slot is shared by every target. With `SingleSlot` any completion
    /// of the right kind from a bound device fires whatever callbacks are
    /// installed, even if they belong to a newer operation on another
    /// target. `Reject` also requires the target and characteristic to
    /// match.
    fn take_matching(
        &mut self,
        kind: OperationKind,
        device: DeviceHandle,
        characteristic: &GattCharacteristic,
    ) -> Option<GattOperation> {
        let owner = self.index_by_device(device).map(|idx| &self.requests[idx])?;
        let op = self.pending.as_ref()?;
        if !op.issued || op.kind() != kind {
            return None;
        }
        if self.settings.operation_discipline == OperationDiscipline::Reject
            && (op.target_name != owner.target().name || op.characteristic != *characteristic)
        {
            return None;
        }
        self.pending.take()
    }

    /// Remove `requests[idx]`, stop its countdown and report `error` to its
    /// caller and to any operation waiting on it.
    fn retire(
        &mut self,
        idx: usize,
        final_state: RequestState,
        error: Option<BleError>,
        release: bool,
    ) -> TimedRequest {
        let mut request = self.requests.remove(idx);
        request.stop_timer();
        self.ticker.stop(request.id());

        if release {
            if let Some(device) = request.device() {
                self.release_link(request.state(), device);
            }
        }

        match &error {
            Some(e) => warn!("{} for {} ended: {}", request.id(), request.target(), e),
            None => info!("{} for {} ended", request.id(), request.target()),
        }
        request.set_state(final_state);

        if let Some(on_failure) = request.take_on_failure() {
            if let Some(e) = &error {
                on_failure(e.clone());
            }
        }

        let name = &request.target().name;
        if self.pending.as_ref().is_some_and(|op| &op.target_name == name) {
            if let Some(mut op) = self.pending.take() {
                op.progress(final_state);
                op.fail(error.unwrap_or(BleError::Cancelled));
            }
        }

        self.sync_scan();
        request
    }

    fn release_link(&mut self, state: RequestState, device: DeviceHandle) {
        let result = match state {
            RequestState::Connecting => self.driver.cancel_connect(device),
            s if s == RequestState::Ready || s.is_in_progress() => self.driver.disconnect(device),
            _ => Ok(()),
        };
        if let Err(e) = result {
            error!("Failed to release {}: {:#}", device, e);
        }
    }

    /// Keep the shared scan running iff some request is still scanning
    fn sync_scan(&mut self) {
        let wanted = self
            .requests
            .iter()
            .any(|r| r.state() == RequestState::Scanning);
        if wanted == self.scanning {
            return;
        }

        let result = if wanted {
            info!("Starting scan");
            self.driver.start_scan()
        } else {
            info!("Stopping scan");
            self.driver.stop_scan()
        };
        if let Err(e) = result {
            error!("Scan {} failed: {:#}", if wanted { "start" } else { "stop" }, e);
        }

        self.scanning = wanted;
        self.observers
            .broadcast(&ObserverEvent::ScanStateChanged { scanning: wanted });
    }

    fn shutdown(&mut self) {
        info!("Shutting down with {} active requests", self.requests.len());
        while !self.requests.is_empty() {
            self.retire(0, RequestState::Failed, Some(BleError::ServiceStopped), true);
        }
        if let Some(op) = self.pending.take() {
            op.fail(BleError::ServiceStopped);
        }
    }
}
