use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Opaque reference to a peripheral, issued by the radio driver.
///
/// The orchestrator never owns the peripheral; it only compares handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(pub u64);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

/// Unique id of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Allocate a process-wide unique id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Who we are looking for: the advertised name, and optionally a value
/// carried inside the advertisement payload (e.g. a MAC-like token).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetIdentity {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
}

impl TargetIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{} ({})", self.name, alias),
            None => f.write_str(&self.name),
        }
    }
}

/// A service to resolve after connecting, restricted to a set of
/// characteristics. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    service_uuid: Uuid,
    characteristic_uuids: BTreeSet<Uuid>,
}

impl ServiceSpec {
    pub fn new(service_uuid: Uuid, characteristic_uuids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            service_uuid,
            characteristic_uuids: characteristic_uuids.into_iter().collect(),
        }
    }

    /// Parse from the string form used in settings files and on the command line
    pub fn parse(service_uuid: &str, characteristic_uuids: &[&str]) -> anyhow::Result<Self> {
        let service_uuid = Uuid::parse_str(service_uuid)?;
        let characteristic_uuids = characteristic_uuids
            .iter()
            .map(|c| Uuid::parse_str(c))
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(Self {
            service_uuid,
            characteristic_uuids,
        })
    }

    pub fn service_uuid(&self) -> Uuid {
        self.service_uuid
    }

    pub fn characteristic_uuids(&self) -> &BTreeSet<Uuid> {
        &self.characteristic_uuids
    }
}

/// A characteristic addressed by its owning service and its own UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GattCharacteristic {
    pub service_uuid: Uuid,
    pub uuid: Uuid,
}

impl GattCharacteristic {
    pub fn new(service_uuid: Uuid, uuid: Uuid) -> Self {
        Self { service_uuid, uuid }
    }
}

impl fmt::Display for GattCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_uuid, self.uuid)
    }
}

/// Lifecycle of a connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Ready,
    Disconnected,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }

    /// Past scanning but not yet usable
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::DiscoveringServices | Self::DiscoveringCharacteristics
        )
    }
}

/// What the platform radio reports about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RadioState {
    PoweredOff,
    Unauthorized,
    Unsupported,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationKind {
    Read,
    Write,
}

/// Read-only view of a request, handed to timeout hooks and introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestSnapshot {
    pub id: RequestId,
    pub target: TargetIdentity,
    pub state: RequestState,
    pub remaining_seconds: u32,
    pub timer_active: bool,
    pub device: Option<DeviceHandle>,
}

// Handles serialize as plain numbers
impl Serialize for RequestId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl Serialize for DeviceHandle {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

/// State of the whole orchestrator at one point in the event stream
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorSnapshot {
    pub scanning: bool,
    pub requests: Vec<RequestSnapshot>,
}
