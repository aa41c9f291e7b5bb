//! One pending or active connection attempt and its countdown.

use crate::domain::error::BleError;
use crate::domain::models::{
    DeviceHandle, GattCharacteristic, RequestId, RequestSnapshot, RequestState, ServiceSpec,
    TargetIdentity,
};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

pub type SuccessCallback = Box<dyn FnOnce(DeviceHandle) + Send>;
pub type FailureCallback = Box<dyn FnOnce(BleError) + Send>;
pub type TimeoutCallback = Box<dyn FnOnce(RequestSnapshot) + Send>;

/// A connection attempt as submitted by a caller.
///
/// ```ignore
/// let request = ConnectRequest::new("Lock-01")
///     .alias("AA:BB:CC:DD:EE:FF")
///     .timeout_secs(10)
///     .on_success(|device| println!("ready: {device}"))
///     .on_failure(|err| eprintln!("failed: {err}"));
/// ```
pub struct ConnectRequest {
    pub(crate) id: RequestId,
    pub(crate) target: TargetIdentity,
    pub(crate) services: Option<Vec<ServiceSpec>>,
    pub(crate) timeout_secs: u32,
    pub(crate) on_success: Option<SuccessCallback>,
    pub(crate) on_failure: Option<FailureCallback>,
    pub(crate) on_timeout: Option<TimeoutCallback>,
}

impl ConnectRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self::for_target(TargetIdentity::new(name))
    }

    pub fn for_target(target: TargetIdentity) -> Self {
        Self {
            id: RequestId::next(),
            target,
            services: None,
            timeout_secs: 10,
            on_success: None,
            on_failure: None,
            on_timeout: None,
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.target.alias = Some(alias.into());
        self
    }

    pub fn services(mut self, services: Vec<ServiceSpec>) -> Self {
        self.services = Some(services);
        self
    }

    pub fn timeout_secs(mut self, secs: u32) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn on_success(mut self, f: impl FnOnce(DeviceHandle) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_failure(mut self, f: impl FnOnce(BleError) + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(f));
        self
    }

    pub fn on_timeout(mut self, f: impl FnOnce(RequestSnapshot) + Send + 'static) -> Self {
        self.on_timeout = Some(Box::new(f));
        self
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn target(&self) -> &TargetIdentity {
        &self.target
    }

    /// Report `error` to the caller without ever registering the request
    pub(crate) fn reject(self, error: BleError) {
        if let Some(on_failure) = self.on_failure {
            on_failure(error);
        }
    }
}

pub struct TimedRequest {
    id: RequestId,
    target: TargetIdentity,
    desired_services: Option<Vec<ServiceSpec>>,
    device: Option<DeviceHandle>,
    remaining_seconds: u32,
    timer_active: bool,
    state: RequestState,
    outstanding_discoveries: HashSet<Uuid>,
    resolved: Vec<GattCharacteristic>,
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
    on_timeout: Option<TimeoutCallback>,
}

impl TimedRequest {
    pub fn new(request: ConnectRequest) -> Self {
        Self {
            id: request.id,
            target: request.target,
            desired_services: request.services.filter(|s| !s.is_empty()),
            device: None,
            remaining_seconds: request.timeout_secs,
            timer_active: false,
            state: RequestState::Idle,
            outstanding_discoveries: HashSet::new(),
            resolved: Vec::new(),
            on_success: request.on_success,
            on_failure: request.on_failure,
            on_timeout: request.on_timeout,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn target(&self) -> &TargetIdentity {
        &self.target
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn device(&self) -> Option<DeviceHandle> {
        self.device
    }

    pub fn desired_services(&self) -> Option<&[ServiceSpec]> {
        self.desired_services.as_deref()
    }

    pub fn remaining_seconds(&self) -> u32 {
        self.remaining_seconds
    }

    pub fn timer_active(&self) -> bool {
        self.timer_active
    }

    pub(crate) fn set_state(&mut self, state: RequestState) {
        self.state = state;
    }

    pub(crate) fn bind_device(&mut self, device: DeviceHandle) {
        self.device = Some(device);
    }

    pub(crate) fn start_timer(&mut self) {
        self.timer_active = true;
    }

    pub(crate) fn stop_timer(&mut self) {
        self.timer_active = false;
    }

    /// Advance the countdown by one second. Returns `true` once it hits zero.
    pub(crate) fn tick(&mut self) -> bool {
        if !self.timer_active {
            return false;
        }
        self.remaining_seconds = self.remaining_seconds.saturating_sub(1);
        self.remaining_seconds == 0
    }

    /// Set up characteristic discovery for the desired services the device
    /// actually offers. Returns the specs to discover, or `None` if any
    /// desired service is missing.
    pub(crate) fn begin_characteristic_discovery(
        &mut self,
        offered: &[Uuid],
    ) -> Option<Vec<ServiceSpec>> {
        let desired = self.desired_services.as_deref().unwrap_or_default();
        if desired.iter().any(|s| !offered.contains(&s.service_uuid())) {
            return None;
        }

        let mut pending = Vec::new();
        for spec in desired {
            if spec.characteristic_uuids().is_empty() {
                continue;
            }
            pending.push(spec.clone());
        }
        self.outstanding_discoveries = pending.iter().map(ServiceSpec::service_uuid).collect();
        Some(pending)
    }

    /// Record the characteristics reported for one service. Returns `None`
    /// if a desired characteristic is missing, otherwise whether every
    /// outstanding service has now reported. Repeated reports for the same
    /// service count once.
    pub(crate) fn record_characteristics(
        &mut self,
        service_uuid: Uuid,
        found: &[Uuid],
    ) -> Option<bool> {
        let spec = self
            .desired_services
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|s| s.service_uuid() == service_uuid)?;

        if spec.characteristic_uuids().iter().any(|c| !found.contains(c)) {
            return None;
        }

        for uuid in spec.characteristic_uuids() {
            let characteristic = GattCharacteristic::new(service_uuid, *uuid);
            if !self.resolved.contains(&characteristic) {
                self.resolved.push(characteristic);
            }
        }
        self.outstanding_discoveries.remove(&service_uuid);
        Some(self.outstanding_discoveries.is_empty())
    }

    pub fn has_characteristic(&self, characteristic: &GattCharacteristic) -> bool {
        self.resolved.contains(characteristic)
    }

    pub(crate) fn take_on_success(&mut self) -> Option<SuccessCallback> {
        self.on_success.take()
    }

    pub(crate) fn take_on_failure(&mut self) -> Option<FailureCallback> {
        self.on_failure.take()
    }

    pub(crate) fn take_on_timeout(&mut self) -> Option<TimeoutCallback> {
        self.on_timeout.take()
    }

    pub fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            id: self.id,
            target: self.target.clone(),
            state: self.state,
            remaining_seconds: self.remaining_seconds,
            timer_active: self.timer_active,
            device: self.device,
        }
    }
}

impl fmt::Debug for TimedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedRequest")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("state", &self.state)
            .field("device", &self.device)
            .field("remaining_seconds", &self.remaining_seconds)
            .field("timer_active", &self.timer_active)
            .finish_non_exhaustive()
    }
}
