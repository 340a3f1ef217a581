//! Endpoint table and endpoint handles
//!
//! The table maps local addresses to whatever consumes messages sent to
//! them: a bounded queue read through an [`Endpoint`], or a callback. One
//! table serves every remote processor; each [`Message`] names the
//! processor it came from.

use crate::{Message, MessageTransport};
use multicore_ipc_core::{IpcError, ProcId, Result, ADDR_ANY, NAME_SERVICE_ADDR};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

/// Handler of a callback endpoint; runs on the drain task of the
/// connection the message arrived on.
///
/// Zero-length messages are handed over like any other; a handler that
/// honours teardown checks [`Message::is_teardown`] itself.
pub type EndpointCallback = Arc<dyn Fn(Message) + Send + Sync>;

/// Consumer registered at one address
pub enum Receiver {
    Queue(mpsc::Sender<Message>),
    Callback(EndpointCallback),
    /// Held by the transport itself; never dispatched through the table
    Reserved,
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Receiver::Queue(_) => write!(f, "Queue"),
            Receiver::Callback(_) => write!(f, "Callback"),
            Receiver::Reserved => write!(f, "Reserved"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// Nothing was reserved at the address
    NotReserved,
    /// The address was already released earlier in this session
    AlreadyReleased,
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Delivered,
    /// No endpoint at the destination; the message comes back to the caller
    Unreachable(Message),
    /// The endpoint's queue is full; the message comes back to the caller
    QueueFull(Message),
}

#[derive(Default)]
struct TableInner {
    receivers: BTreeMap<u32, Receiver>,
    released: HashSet<u32>,
}

/// Address-to-receiver map of one local processor
pub struct EndpointTable {
    inner: Mutex<TableInner>,
    reserved_addresses: u32,
}

impl EndpointTable {
    /// Empty table with the name service address taken
    pub fn new(reserved_addresses: u32) -> Self {
        let mut inner = TableInner::default();
        inner.receivers.insert(NAME_SERVICE_ADDR, Receiver::Reserved);
        Self {
            inner: Mutex::new(inner),
            reserved_addresses,
        }
    }

    /// Bind `receiver` at `requested`, or at the lowest free address above
    /// the reserved range when `requested` is [`ADDR_ANY`]
    pub fn reserve(&self, requested: u32, receiver: Receiver) -> Result<u32> {
        let mut inner = self.inner.lock();

        let addr = if requested == ADDR_ANY {
            first_free(&inner.receivers, self.reserved_addresses)?
        } else if inner.receivers.contains_key(&requested) {
            return Err(IpcError::AddressInUse(requested));
        } else {
            requested
        };

        inner.receivers.insert(addr, receiver);
        inner.released.remove(&addr);
        trace!("Reserved endpoint address {}", addr);
        Ok(addr)
    }

    /// Unbind `addr`. Releasing an unreserved address changes nothing.
    pub fn release(&self, addr: u32) -> ReleaseOutcome {
        let mut inner = self.inner.lock();
        if inner.receivers.remove(&addr).is_some() {
            inner.released.insert(addr);
            trace!("Released endpoint address {}", addr);
            ReleaseOutcome::Released
        } else if inner.released.contains(&addr) {
            ReleaseOutcome::AlreadyReleased
        } else {
            ReleaseOutcome::NotReserved
        }
    }

    /// Hand `msg` to the receiver at `msg.dst`.
    ///
    /// Callbacks are invoked after the table lock is dropped, so they may
    /// create or release endpoints themselves.
    pub fn dispatch(&self, msg: Message) -> DispatchOutcome {
        let callback = {
            let inner = self.inner.lock();
            match inner.receivers.get(&msg.dst) {
                Some(Receiver::Queue(queue)) => {
                    return match queue.try_send(msg) {
                        Ok(()) => DispatchOutcome::Delivered,
                        Err(TrySendError::Full(msg)) => DispatchOutcome::QueueFull(msg),
                        Err(TrySendError::Closed(msg)) => DispatchOutcome::Unreachable(msg),
                    };
                }
                Some(Receiver::Callback(callback)) => Arc::clone(callback),
                Some(Receiver::Reserved) | None => return DispatchOutcome::Unreachable(msg),
            }
        };

        callback(msg);
        DispatchOutcome::Delivered
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.inner.lock().receivers.contains_key(&addr)
    }

    /// Addresses currently bound, the name service included
    pub fn len(&self) -> usize {
        self.inner.lock().receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for EndpointTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("EndpointTable")
            .field("addresses", &inner.receivers.keys().collect::<Vec<_>>())
            .field("reserved_addresses", &self.reserved_addresses)
            .finish()
    }
}

fn first_free(receivers: &BTreeMap<u32, Receiver>, floor: u32) -> Result<u32> {
    let mut candidate = floor;
    for &taken in receivers.range(floor..).map(|(addr, _)| addr) {
        if taken != candidate {
            break;
        }
        candidate = candidate.checked_add(1).ok_or(IpcError::AddressExhausted)?;
    }
    if candidate == ADDR_ANY {
        return Err(IpcError::AddressExhausted);
    }
    Ok(candidate)
}

/// Queue-backed endpoint.
///
/// Dropping the endpoint releases its address.
pub struct Endpoint {
    addr: u32,
    transport: MessageTransport,
    queue: mpsc::Receiver<Message>,
    finished: bool,
    released: bool,
}

impl Endpoint {
    pub(crate) fn new(transport: MessageTransport, addr: u32, queue: mpsc::Receiver<Message>) -> Self {
        Self {
            addr,
            transport,
            queue,
            finished: false,
            released: false,
        }
    }

    pub fn addr(&self) -> u32 {
        self.addr
    }

    /// Next message; `None` once a zero-length message has arrived
    pub async fn recv(&mut self) -> Option<Message> {
        if self.finished {
            return None;
        }
        match self.queue.recv().await {
            Some(msg) if !msg.is_teardown() => Some(msg),
            _ => {
                self.finished = true;
                None
            }
        }
    }

    /// Like [`Endpoint::recv`], failing with [`IpcError::Timeout`] if
    /// nothing arrives in time
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Message>> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| {
                IpcError::Timeout(format!(
                    "no message at endpoint {} within {:?}",
                    self.addr, timeout
                ))
            })
    }

    /// Whether a teardown message ended the receive loop
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Send from this endpoint's address
    pub async fn send(&self, remote: ProcId, dst: u32, payload: &[u8]) -> Result<()> {
        self.transport.send(remote, self.addr, dst, payload).await
    }

    /// Answer the sender of `msg`
    pub async fn reply(&self, msg: &Message, payload: &[u8]) -> Result<()> {
        self.send(msg.from, msg.src, payload).await
    }

    /// Release the address now
    pub fn close(mut self) -> ReleaseOutcome {
        self.released = true;
        self.transport.release_endpoint(self.addr)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if !self.released {
            self.transport.release_endpoint(self.addr);
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("addr", &self.addr)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Owner of a callback endpoint's address; dropping it releases the address
pub struct EndpointHandle {
    addr: u32,
    transport: MessageTransport,
    released: bool,
}

impl EndpointHandle {
    pub(crate) fn new(transport: MessageTransport, addr: u32) -> Self {
        Self {
            addr,
            transport,
            released: false,
        }
    }

    pub fn addr(&self) -> u32 {
        self.addr
    }

    pub async fn send(&self, remote: ProcId, dst: u32, payload: &[u8]) -> Result<()> {
        self.transport.send(remote, self.addr, dst, payload).await
    }

    pub fn close(mut self) -> ReleaseOutcome {
        self.released = true;
        self.transport.release_endpoint(self.addr)
    }
}

impl Drop for EndpointHandle {
    fn drop(&mut self) {
        if !self.released {
            self.transport.release_endpoint(self.addr);
        }
    }
}

impl fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointHandle").field("addr", &self.addr).finish()
    }
}
