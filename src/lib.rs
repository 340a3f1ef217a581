//! Multicore IPC
//!
//! Shared-memory message transport between processors of one system:
//! fixed-slot ring pairs per processor pair, addressable endpoints
//! multiplexed over them, and a name service for finding endpoints by name.
//!
//! The member crates carry the stack; this crate adds configuration
//! loading, logging setup and an in-process cluster for running every
//! processor in one OS process.

pub mod config;
pub mod logging;
pub mod ping;
pub mod system;

pub use config::*;
pub use logging::init_logger;
pub use system::LocalCluster;

pub use multicore_ipc_core as ipc_core;
pub use multicore_ipc_rpmsg as rpmsg;
pub use multicore_ipc_shared_memory as shared_memory;

/// Re-export common types
pub mod prelude {
    pub use multicore_ipc_core::prelude::*;
    pub use multicore_ipc_rpmsg::{
        Endpoint, EndpointHandle, Message, MessageTransport, SendOutcome, ServiceAddress,
        TransportBuilder, ADDR_ANY, NAME_SERVICE_ADDR,
    };
    pub use multicore_ipc_shared_memory::{RegionPool, RegionProvider, FileRegionProvider};

    pub use crate::{IpcConfig, LocalCluster};
}
