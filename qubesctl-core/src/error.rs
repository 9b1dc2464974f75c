//! Error types for the reconciliation engine.
//!
//! Two layers: [`BackendError`] is what the State Query Interface reports,
//! [`ReconcileError`] is what the engine reports to its caller.

use thiserror::Error;

use crate::types::PowerState;

/// Errors reported by a [`QubesApi`](crate::QubesApi) backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Failed to reach the management layer.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// Domain was not found.
    #[error("VM not found: {0}")]
    DomainNotFound(String),

    /// Domain is not running (e.g. kill on a halted domain).
    #[error("VM not started: {0}")]
    NotRunning(String),

    /// Tag is not attached to the domain.
    #[error("Tag not found: {0}")]
    TagNotFound(String),

    /// Device could not be resolved on its backend domain.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Domain is in an invalid state for the requested operation.
    #[error("Invalid VM state for operation: {0}")]
    InvalidState(String),

    /// General operation failed.
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Coarse classification of a [`ReconcileError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad key, wrong value type or unresolved cross-reference. Never partially applied.
    Validation,
    /// A referenced domain or device is absent.
    NotFound,
    /// A mutation was rejected after earlier mutations may have been applied.
    Conflict,
    /// A bounded wait ran out of attempts.
    Timeout,
    /// The request named nothing the engine can act on.
    Unrecognized,
    /// The management layer could not be reached.
    Unavailable,
}

/// Errors surfaced by the orchestrator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReconcileError {
    #[error("Invalid property: {0}")]
    InvalidProperty(String),

    #[error("Invalid property value type: {key} (expected {expected})")]
    InvalidValueType { key: String, expected: &'static str },

    #[error("Missing netvm: {0}")]
    MissingNetvm(String),

    #[error("Missing netvm capability: {0}")]
    NetvmCapability(String),

    #[error("Missing default_dispvm: {0}")]
    MissingDefaultDispvm(String),

    #[error("Missing dispvm capability: {0}")]
    DispvmCapability(String),

    #[error("Missing template: {0}")]
    MissingTemplate(String),

    #[error("Missing name for the volume: {0}")]
    VolumeMissingName(String),

    #[error("Missing size for the volume: {0}")]
    VolumeMissingSize(String),

    #[error("Wrong volume name: {name} (allowed: {allowed:?})")]
    WrongVolumeName { name: String, allowed: Vec<&'static str> },

    #[error("Invalid label: {0}")]
    InvalidLabel(String),

    #[error("Failure in updating volume {name}: {reason}")]
    VolumeResize { name: String, reason: String },

    #[error("Invalid device spec: {spec} ({reason})")]
    InvalidDeviceSpec { spec: String, reason: String },

    #[error("Unknown device class '{class}' in {spec}")]
    UnknownDeviceClass { class: String, spec: String },

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to assign device {spec}: {reason}")]
    AssignFailed { spec: String, reason: String },

    #[error("Failed to unassign device {spec}: {reason}")]
    UnassignFailed { spec: String, reason: String },

    #[error("Missing tag(s) to remove.")]
    MissingTags,

    #[error("VM not found: {0}")]
    DomainNotFound(String),

    #[error("Refusing to {action} {name}: AdminVM domains cannot be stopped or removed")]
    ProtectedDomain { name: String, action: &'static str },

    #[error("Cannot create {name}: {reason}")]
    CreateRejected { name: String, reason: String },

    #[error("Failed to write inventory {path}: {reason}")]
    Inventory { path: String, reason: String },

    #[error("Timed out waiting for {name} to reach {target} after {attempts} attempts")]
    Timeout { name: String, target: PowerState, attempts: u32 },

    #[error("{0} requires 1 argument: guest")]
    MissingDomainName(String),

    #[error("Unrecognized directive: {0}")]
    Unrecognized(String),

    #[error("expected state or command parameter to be specified")]
    NoDirective,

    #[error("Hypervisor unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Backend(BackendError),
}

impl ReconcileError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconcileError::InvalidProperty(_)
            | ReconcileError::InvalidValueType { .. }
            | ReconcileError::MissingNetvm(_)
            | ReconcileError::NetvmCapability(_)
            | ReconcileError::MissingDefaultDispvm(_)
            | ReconcileError::DispvmCapability(_)
            | ReconcileError::MissingTemplate(_)
            | ReconcileError::VolumeMissingName(_)
            | ReconcileError::VolumeMissingSize(_)
            | ReconcileError::WrongVolumeName { .. }
            | ReconcileError::InvalidLabel(_)
            | ReconcileError::InvalidDeviceSpec { .. }
            | ReconcileError::UnknownDeviceClass { .. }
            | ReconcileError::MissingTags
            | ReconcileError::ProtectedDomain { .. }
            | ReconcileError::MissingDomainName(_) => ErrorKind::Validation,
            ReconcileError::DomainNotFound(_) | ReconcileError::DeviceNotFound(_) => {
                ErrorKind::NotFound
            }
            ReconcileError::VolumeResize { .. }
            | ReconcileError::AssignFailed { .. }
            | ReconcileError::UnassignFailed { .. }
            | ReconcileError::CreateRejected { .. }
            | ReconcileError::Inventory { .. } => ErrorKind::Conflict,
            ReconcileError::Timeout { .. } => ErrorKind::Timeout,
            ReconcileError::Unrecognized(_) | ReconcileError::NoDirective => {
                ErrorKind::Unrecognized
            }
            ReconcileError::Unavailable(_) => ErrorKind::Unavailable,
            ReconcileError::Backend(e) => match e {
                BackendError::ConnectionFailed(_) => ErrorKind::Unavailable,
                BackendError::DomainNotFound(_) | BackendError::DeviceNotFound(_) => {
                    ErrorKind::NotFound
                }
                _ => ErrorKind::Conflict,
            },
        }
    }
}

impl From<BackendError> for ReconcileError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::ConnectionFailed(msg) => ReconcileError::Unavailable(msg),
            BackendError::DomainNotFound(name) => ReconcileError::DomainNotFound(name),
            other => ReconcileError::Backend(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_errors_are_classified() {
        let err: ReconcileError = BackendError::ConnectionFailed("qubesd down".into()).into();
        assert_eq!(err.kind(), ErrorKind::Unavailable);

        let err: ReconcileError = BackendError::DomainNotFound("work".into()).into();
        assert_eq!(err, ReconcileError::DomainNotFound("work".into()));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err: ReconcileError = BackendError::InvalidState("running".into()).into();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_messages_keep_stable_prefixes() {
        let err = ReconcileError::InvalidValueType { key: "memory".into(), expected: "int" };
        assert!(err.to_string().starts_with("Invalid property value type"));
        assert!(ReconcileError::MissingTags.to_string().contains("Missing tag"));
    }
}
