//! Multicore IPC - Message Transport
//!
//! Multiplexes addressable endpoints over the ring pair shared with each
//! remote processor, and runs the name service on address 53 so that
//! endpoints created at run time can be found by name.
//!
//! ```text
//!  Endpoint --send--> MessageTransport --frame--> RingPair --signal--> remote
//!  Endpoint <--queue-- EndpointTable <--drain task-- RingPair <--signal-- remote
//! ```

pub mod endpoint;
pub mod name_service;
pub mod transport;
pub mod wire;

pub use endpoint::*;
pub use name_service::*;
pub use transport::*;
pub use wire::*;

pub use multicore_ipc_core::{ADDR_ANY, NAME_SERVICE_ADDR};
pub use multicore_ipc_shared_memory::SendOutcome;
