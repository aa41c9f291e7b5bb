//! Errors reported to callers through failure callbacks.

use crate::domain::models::RadioState;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    #[error("Bluetooth is powered off")]
    PoweredOff,
    #[error("Bluetooth permission denied")]
    Unauthorized,
    #[error("Bluetooth LE is not supported on this host")]
    Unsupported,
    #[error("timed out before the device became ready")]
    ScanTimeout,
    #[error("failed to connect to the device")]
    ConnectFailed,
    #[error("device disconnected unexpectedly")]
    UnexpectedDisconnect,
    #[error("service discovery failed")]
    ServiceDiscoveryFailed,
    #[error("characteristic discovery failed")]
    CharacteristicDiscoveryFailed,
    #[error("write failed")]
    WriteFailed,
    #[error("read failed")]
    ReadFailed,

    /// A non-terminal request for the same identity is already active
    #[error("a connection request for this device is already pending")]
    DuplicateRequest,
    /// Another read/write is outstanding and the orchestrator rejects overlap
    #[error("another read/write operation is still outstanding")]
    OperationInProgress,
    /// The device is connected but the characteristic was never resolved
    #[error("characteristic was not resolved on the connected device")]
    CharacteristicNotFound,
    /// The caller disconnected the target while the operation was waiting
    #[error("cancelled by disconnect")]
    Cancelled,
    /// The dispatch worker is no longer running
    #[error("orchestrator service has stopped")]
    ServiceStopped,
}

impl BleError {
    /// The error to report for a radio that cannot be used, if any
    pub fn from_radio_state(state: RadioState) -> Option<Self> {
        match state {
            RadioState::PoweredOff => Some(Self::PoweredOff),
            RadioState::Unauthorized => Some(Self::Unauthorized),
            RadioState::Unsupported => Some(Self::Unsupported),
            RadioState::Ready => None,
        }
    }
}
