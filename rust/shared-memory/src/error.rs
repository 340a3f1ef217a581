//! Shared memory specific error types

use multicore_ipc_core::IpcError;
use thiserror::Error;

/// Shared memory error types
#[derive(Error, Debug)]
pub enum SharedMemoryError {
    /// Slot count must be a non-zero power of two
    #[error("Slot count {0} is not a power of two")]
    NotPowerOfTwo(u32),

    /// Invalid ring geometry
    #[error("Invalid ring geometry: {0}")]
    InvalidGeometry(String),

    /// Region cannot hold the requested rings
    #[error("Region too small: {size} bytes, need {required}")]
    RegionTooSmall { size: usize, required: usize },

    /// Invalid region size
    #[error("Invalid region size: {size}, must be between {min} and {max}")]
    InvalidSize { size: usize, min: usize, max: usize },

    /// Data does not fit in one slot
    #[error("Slot overflow: {len} bytes, slot holds {max}")]
    SlotOverflow { len: usize, max: usize },

    /// The peer bound the same ring with different parameters
    #[error("Ring geometry mismatch: expected {expected}, found {found}")]
    GeometryMismatch { expected: String, found: String },

    /// One slot carried an impossible length; the slot was skipped
    #[error("Corrupt slot {index}: length {len}")]
    CorruptSlot { index: u32, len: u32 },

    /// Data corruption
    #[error("Data corruption detected: {0}")]
    DataCorruption(String),

    /// Memory mapping failed
    #[error("Memory mapping failed: {0}")]
    MappingFailed(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Malformed resource table
    #[error("Resource table error: {0}")]
    ResourceTable(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias
pub type Result<T> = std::result::Result<T, SharedMemoryError>;

impl SharedMemoryError {
    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            SharedMemoryError::Timeout(_) => true,
            SharedMemoryError::CorruptSlot { .. } => true,
            SharedMemoryError::Io(err) => {
                matches!(
                    err.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                )
            }
            _ => false,
        }
    }
}

impl From<SharedMemoryError> for IpcError {
    fn from(err: SharedMemoryError) -> Self {
        match err {
            SharedMemoryError::Io(io) => IpcError::Io(io),
            SharedMemoryError::Timeout(what) => IpcError::Timeout(what),
            other => IpcError::SharedMemory(other.to_string()),
        }
    }
}
