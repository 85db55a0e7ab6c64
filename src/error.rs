//! Error handling for the device-worker runtime
//!
//! A single flat error enum covers the five error kinds the runtime
//! distinguishes (configuration, transient I/O, protocol, data, resource)
//! plus the structural failures of the manager/worker control plane.

use thiserror::Error;

use crate::driver::DriverError;
use crate::transport::TransportError;

/// Top-level error type for the device-worker runtime.
#[derive(Error, Debug, Clone)]
pub enum WorkerError {
    /// Invalid endpoint, missing property, unsupported protocol, out-of-range setting.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Connection refused, timeout, read failure — recoverable by the reconnect controller.
    #[error("transient I/O error: {0}")]
    Transient(String),

    /// Protocol-level exception (e.g. Modbus exception code, rejected service).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Value out of range or type mismatch on a write.
    #[error("data error: {0}")]
    Data(String),

    /// Socket/port exhausted, or other resource failure.
    #[error("resource error: {0}")]
    Resource(String),

    /// Repository lookup or persistence failure.
    #[error("repository error: {0}")]
    Repository(String),

    #[error("device not found: {0}")]
    NotFound(String),

    #[error("device already exists: {0}")]
    AlreadyExists(String),

    #[error("worker already running: {0}")]
    AlreadyRunning(String),

    #[error("invalid worker state for this operation: {0}")]
    InvalidState(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("data point not writable: {0}")]
    NotWritable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, WorkerError>;

impl From<TransportError> for WorkerError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConfigError(msg) => WorkerError::Configuration(msg),
            TransportError::Timeout(msg)
            | TransportError::ConnectionFailed(msg)
            | TransportError::ConnectionLost(msg) => WorkerError::Transient(msg),
            TransportError::SendFailed(msg) | TransportError::ReceiveFailed(msg) => {
                WorkerError::Transient(msg)
            },
            TransportError::IoError(msg) => WorkerError::Resource(msg),
            TransportError::ProtocolError(msg) => WorkerError::Protocol(msg),
        }
    }
}

impl From<DriverError> for WorkerError {
    fn from(err: DriverError) -> Self {
        match err.kind {
            crate::driver::DriverErrorKind::Configuration => WorkerError::Configuration(err.message),
            crate::driver::DriverErrorKind::Transient => WorkerError::Transient(err.message),
            crate::driver::DriverErrorKind::Protocol => WorkerError::Protocol(err.message),
            crate::driver::DriverErrorKind::Data => WorkerError::Data(err.message),
            crate::driver::DriverErrorKind::Resource => WorkerError::Resource(err.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_timeout_maps_to_transient() {
        let err: WorkerError = TransportError::Timeout("connect".into()).into();
        assert!(matches!(err, WorkerError::Transient(_)));
    }

    #[test]
    fn transport_config_maps_to_configuration() {
        let err: WorkerError = TransportError::ConfigError("bad host".into()).into();
        assert!(matches!(err, WorkerError::Configuration(_)));
    }
}
