//! Error types for the multicore IPC stack

use crate::ProcId;
use thiserror::Error;

/// IPC error types
#[derive(Error, Debug)]
pub enum IpcError {
    /// The send ring towards a remote processor has no free slot
    #[error("Ring towards {proc} is full")]
    RingFull { proc: ProcId },

    /// Processor id outside the configured table or otherwise unusable
    #[error("Invalid processor id: {0}")]
    InvalidProcId(ProcId),

    /// Processor name not present in the identity table
    #[error("Unknown processor: {0}")]
    UnknownProcessor(String),

    /// Local processor id was never configured
    #[error("Local processor id has not been set")]
    LocalIdUnset,

    /// Payload larger than the configured maximum message size
    #[error("Message too large: {len} bytes, maximum is {max}")]
    MessageTooLarge { len: usize, max: usize },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connection already attached (or attaching)
    #[error("Connection to {0} is already attached")]
    AlreadyAttached(ProcId),

    /// Connection not attached
    #[error("Connection to {0} is not attached")]
    NotAttached(ProcId),

    /// Connection is in the middle of a lifecycle transition
    #[error("Connection to {0} is busy changing state")]
    Busy(ProcId),

    /// Ring memory could not be provided or bound
    #[error("Resource error: {0}")]
    Resource(String),

    /// Endpoint address already reserved
    #[error("Endpoint address {0} is already in use")]
    AddressInUse(u32),

    /// No free endpoint address remains
    #[error("Endpoint address space exhausted")]
    AddressExhausted,

    /// Malformed frame or name service record
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Notification line failure
    #[error("Notify error: {0}")]
    Notify(String),

    /// Shared memory failure
    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    /// A name service announcement could not be delivered
    #[error("Failed to announce service '{service}': {source}")]
    Announce {
        service: String,
        #[source]
        source: Box<IpcError>,
    },

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results
pub type Result<T> = std::result::Result<T, IpcError>;

impl IpcError {
    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            IpcError::RingFull { .. } => true,
            IpcError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            IpcError::RingFull { .. } => ErrorCategory::Backpressure,
            IpcError::InvalidProcId(_) => ErrorCategory::Configuration,
            IpcError::UnknownProcessor(_) => ErrorCategory::Configuration,
            IpcError::LocalIdUnset => ErrorCategory::Configuration,
            IpcError::MessageTooLarge { .. } => ErrorCategory::Configuration,
            IpcError::Configuration(_) => ErrorCategory::Configuration,
            IpcError::AlreadyAttached(_) => ErrorCategory::State,
            IpcError::NotAttached(_) => ErrorCategory::State,
            IpcError::Busy(_) => ErrorCategory::State,
            IpcError::AddressInUse(_) => ErrorCategory::State,
            IpcError::AddressExhausted => ErrorCategory::Platform,
            IpcError::Resource(_) => ErrorCategory::Platform,
            IpcError::Malformed(_) => ErrorCategory::Delivery,
            IpcError::Announce { .. } => ErrorCategory::Fatal,
            IpcError::Notify(_) => ErrorCategory::Platform,
            IpcError::SharedMemory(_) => ErrorCategory::Platform,
            IpcError::Timeout(_) => ErrorCategory::Platform,
            IpcError::Serialization(_) => ErrorCategory::Configuration,
            IpcError::Io(_) => ErrorCategory::Platform,
        }
    }
}

/// Error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Ring full / empty: try again later
    Backpressure,
    /// Rejected at the call that introduced it
    Configuration,
    /// Lifecycle misuse; connection state unchanged
    State,
    /// Message dropped on the receive side
    Delivery,
    /// Caller decides between abort and retry
    Fatal,
    /// Memory, notification or OS failure
    Platform,
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        IpcError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recovery() {
        let full = IpcError::RingFull { proc: ProcId(1) };
        assert!(full.is_recoverable());

        let timeout = IpcError::Timeout("detach".to_string());
        assert!(timeout.is_recoverable());

        let config_error = IpcError::Configuration("Invalid config".to_string());
        assert!(!config_error.is_recoverable());
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            IpcError::AlreadyAttached(ProcId(2)).category(),
            ErrorCategory::State
        );
        assert_eq!(
            IpcError::MessageTooLarge { len: 600, max: 496 }.category(),
            ErrorCategory::Configuration
        );

        let announce = IpcError::Announce {
            service: "echo".to_string(),
            source: Box::new(IpcError::NotAttached(ProcId(0))),
        };
        assert_eq!(announce.category(), ErrorCategory::Fatal);
        assert!(announce.to_string().contains("echo"));
    }
}
