//! Multicore IPC - Shared Memory Module
//!
//! Address-stable shared regions, the fixed-slot ring buffer pair laid out
//! inside them, and the resource table that tells a remote loader where
//! the rings live.

pub mod error;
pub mod platform;
pub mod protocol;
pub mod region;
pub mod resource_table;
pub mod ring;

pub use error::*;
pub use protocol::*;
pub use region::*;
pub use resource_table::*;
pub use ring::*;

/// Re-export platform-specific implementations
pub use platform::*;

/// Current version of the ring layout
pub const SHARED_MEMORY_VERSION: u8 = 1;

/// Ring control block magic number
pub const RING_MAGIC: u32 = 0x5250_4D47; // "RPMG"
