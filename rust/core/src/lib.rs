//! Multicore IPC - Core Module
//!
//! Processor identity, error taxonomy, configuration and the collaborator
//! interfaces (notification lines, observability) consumed by the shared
//! memory rings and the message transport.

pub mod config;
pub mod error;
pub mod metrics;
pub mod multiproc;
pub mod notify;
pub mod observe;

pub use config::*;
pub use error::*;
pub use metrics::*;
pub use multiproc::*;
pub use notify::*;
pub use observe::*;

/// Re-export common types
pub mod prelude {
    pub use crate::{
        config::{MultiProcConfig, SendPolicy, TransportConfig},
        error::{ErrorCategory, IpcError, Result},
        multiproc::{MultiProc, ProcId},
        notify::{MailboxHub, Notifier},
        observe::{EventSink, TransportEvent},
    };
}

/// Current version of the IPC stack
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Destination address requesting automatic assignment
pub const ADDR_ANY: u32 = 0xFFFF_FFFF;

/// Well-known address of the name service endpoint
pub const NAME_SERVICE_ADDR: u32 = 53;

/// Addresses below this bound are set aside for well-known services
pub const RESERVED_ADDRESSES: u32 = 1024;
