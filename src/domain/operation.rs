use crate::domain::error::BleError;
use crate::domain::models::{GattCharacteristic, OperationKind, RequestState};
use crate::domain::request::FailureCallback;

pub type ReadCallback = Box<dyn FnOnce(Vec<u8>) + Send>;
pub type WriteCallback = Box<dyn FnOnce() + Send>;
pub type ProgressCallback = Box<dyn FnMut(RequestState) + Send>;

pub enum GattAction {
    Read { on_success: ReadCallback },
    Write { data: Vec<u8>, on_success: WriteCallback },
}

/// A read or write against a named target, driven through the whole
/// scan/connect/discover pipeline when the target is not ready yet.
pub struct GattOperation {
    pub(crate) target_name: String,
    pub(crate) characteristic: GattCharacteristic,
    pub(crate) action: GattAction,
    pub(crate) on_failure: FailureCallback,
    pub(crate) on_progress: Option<ProgressCallback>,
    /// Handed to the radio driver
    pub(crate) issued: bool,
}

impl GattOperation {
    pub fn read(
        target_name: impl Into<String>,
        characteristic: GattCharacteristic,
        on_success: impl FnOnce(Vec<u8>) + Send + 'static,
        on_failure: impl FnOnce(BleError) + Send + 'static,
    ) -> Self {
        Self {
            target_name: target_name.into(),
            characteristic,
            action: GattAction::Read {
                on_success: Box::new(on_success),
            },
            on_failure: Box::new(on_failure),
            on_progress: None,
            issued: false,
        }
    }

    pub fn write(
        target_name: impl Into<String>,
        characteristic: GattCharacteristic,
        data: Vec<u8>,
        on_success: impl FnOnce() + Send + 'static,
        on_failure: impl FnOnce(BleError) + Send + 'static,
    ) -> Self {
        Self {
            target_name: target_name.into(),
            characteristic,
            action: GattAction::Write {
                data,
                on_success: Box::new(on_success),
            },
            on_failure: Box::new(on_failure),
            on_progress: None,
            issued: false,
        }
    }

    /// Report every state the target passes through while this operation waits
    pub fn with_progress(mut self, f: impl FnMut(RequestState) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn kind(&self) -> OperationKind {
        match self.action {
            GattAction::Read { .. } => OperationKind::Read,
            GattAction::Write { .. } => OperationKind::Write,
        }
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn characteristic(&self) -> &GattCharacteristic {
        &self.characteristic
    }

    pub(crate) fn progress(&mut self, state: RequestState) {
        if let Some(on_progress) = self.on_progress.as_mut() {
            on_progress(state);
        }
    }

    pub(crate) fn fail(self, error: BleError) {
        (self.on_failure)(error);
    }

    /// Fail with the error matching this operation's kind
    pub(crate) fn fail_operation(self) {
        let error = match self.kind() {
            OperationKind::Read => BleError::ReadFailed,
            OperationKind::Write => BleError::WriteFailed,
        };
        self.fail(error);
    }

    pub(crate) fn complete(self, result: Result<Vec<u8>, BleError>) {
        match (self.action, result) {
            (GattAction::Read { on_success }, Ok(value)) => on_success(value),
            (GattAction::Write { on_success, .. }, Ok(_)) => on_success(),
            (_, Err(error)) => (self.on_failure)(error),
        }
    }
}
