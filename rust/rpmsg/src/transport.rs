//! Message transport
//!
//! Moves framed messages between local endpoints and the ring pairs shared
//! with each remote processor. Inbound notifications only wake a per
//! connection drain task; decoding and dispatch happen on that task.

use crate::{
    DiscoveryTable, DispatchOutcome, Endpoint, EndpointCallback, EndpointHandle, EndpointTable,
    Message, MessageHeader, NameServiceMessage, NsFlags, NsUpdate, ReleaseOutcome, Receiver,
    ServiceAddress, ServiceRecord,
};
use multicore_ipc_core::{
    EventSink, IpcError, MetricsSnapshot, MultiProc, Notifier, ProcId, Result, SendPolicy,
    TracingEventSink, TransportConfig, TransportEvent, TransportMetrics, NAME_SERVICE_ADDR,
};
use multicore_ipc_shared_memory::{
    PlatformUtils, RegionProvider, RingGeometry, RingPair, RingStats, SendOutcome,
    SharedMemoryError, Side,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Lifecycle of the connection to one remote processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Detached,
    Attaching,
    Attached,
    Detaching,
}

struct Connection {
    remote: ProcId,
    state: Mutex<ConnectionState>,
    rings: Mutex<Option<Arc<RingPair>>>,
    /// Cleared first thing on detach; senders check it after counting in
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    quiesced: Notify,
    wake: Arc<Notify>,
    drain_lock: Mutex<()>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    fn new(remote: ProcId) -> Self {
        Self {
            remote,
            state: Mutex::new(ConnectionState::Detached),
            rings: Mutex::new(None),
            accepting: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            quiesced: Notify::new(),
            wake: Arc::new(Notify::new()),
            drain_lock: Mutex::new(()),
            drain_task: Mutex::new(None),
        }
    }

    fn rings(&self) -> Option<Arc<RingPair>> {
        self.rings.lock().clone()
    }

    /// Count a sender in, or refuse it once detach has started
    fn enter(&self) -> Result<InFlight<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight { conn: self };
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(IpcError::NotAttached(self.remote));
        }
        Ok(guard)
    }

    async fn wait_quiesced(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            if tokio::time::timeout_at(deadline, self.quiesced.notified())
                .await
                .is_err()
            {
                return Err(IpcError::Timeout(format!(
                    "{} sends to {} still in flight",
                    self.in_flight.load(Ordering::SeqCst),
                    self.remote
                )));
            }
        }
        Ok(())
    }
}

struct InFlight<'a> {
    conn: &'a Connection,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let left = self.conn.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        if left == 0 && !self.conn.accepting.load(Ordering::SeqCst) {
            self.conn.quiesced.notify_one();
        }
    }
}

struct Shared {
    local: ProcId,
    multiproc: Arc<MultiProc>,
    notifier: Arc<dyn Notifier>,
    regions: Arc<dyn RegionProvider>,
    config: TransportConfig,
    events: Arc<dyn EventSink>,
    endpoints: EndpointTable,
    discovery: DiscoveryTable,
    metrics: TransportMetrics,
    ns_host: Option<ProcId>,
    connections: Vec<Connection>,
}

/// Message transport of one local processor.
///
/// Cloning is cheap; every clone drives the same connections.
#[derive(Clone)]
pub struct MessageTransport {
    shared: Arc<Shared>,
}

impl fmt::Debug for MessageTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageTransport")
            .field("local", &self.shared.local)
            .field("notifier", &self.shared.notifier.driver_name())
            .field("endpoints", &self.shared.endpoints)
            .finish()
    }
}

/// Assembles a [`MessageTransport`] from its collaborators
pub struct TransportBuilder {
    multiproc: Option<Arc<MultiProc>>,
    notifier: Option<Arc<dyn Notifier>>,
    regions: Option<Arc<dyn RegionProvider>>,
    config: TransportConfig,
    events: Arc<dyn EventSink>,
}

impl Default for TransportBuilder {
    fn default() -> Self {
        Self {
            multiproc: None,
            notifier: None,
            regions: None,
            config: TransportConfig::default(),
            events: Arc::new(TracingEventSink),
        }
    }
}

impl TransportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processor table; its local id names the processor being built
    pub fn multiproc(mut self, multiproc: impl Into<Arc<MultiProc>>) -> Self {
        self.multiproc = Some(multiproc.into());
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn regions(mut self, regions: Arc<dyn RegionProvider>) -> Self {
        self.regions = Some(regions);
        self
    }

    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Result<MessageTransport> {
        self.config.validate()?;
        let missing = |what: &str| IpcError::Configuration(format!("transport needs a {}", what));
        let multiproc = self.multiproc.ok_or_else(|| missing("processor table"))?;
        let notifier = self.notifier.ok_or_else(|| missing("notifier"))?;
        let regions = self.regions.ok_or_else(|| missing("region provider"))?;

        let local = multiproc.self_id()?;
        let ns_host = match &self.config.name_service_host {
            Some(name) => Some(multiproc.require(name)?),
            None => None,
        };
        let connections = multiproc.iter().map(|(id, _)| Connection::new(id)).collect();

        debug!(
            "Transport for {} with {} processors, {} notifier",
            local,
            multiproc.num_processors(),
            notifier.driver_name()
        );

        Ok(MessageTransport {
            shared: Arc::new(Shared {
                local,
                multiproc,
                notifier,
                regions,
                endpoints: EndpointTable::new(self.config.reserved_addresses),
                config: self.config,
                events: self.events,
                discovery: DiscoveryTable::new(),
                metrics: TransportMetrics::new(),
                ns_host,
                connections,
            }),
        })
    }
}

impl MessageTransport {
    pub fn builder() -> TransportBuilder {
        TransportBuilder::new()
    }

    pub fn local_id(&self) -> ProcId {
        self.shared.local
    }

    pub fn multiproc(&self) -> &MultiProc {
        &self.shared.multiproc
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    pub fn connection_state(&self, remote: ProcId) -> Result<ConnectionState> {
        Ok(*self.shared.connection(remote)?.state.lock())
    }

    pub fn ring_stats(&self, remote: ProcId) -> Result<RingStats> {
        let conn = self.shared.connection(remote)?;
        let rings = conn.rings().ok_or(IpcError::NotAttached(remote))?;
        Ok(rings.stats())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Build the ring pair towards `remote` and start listening to it
    #[instrument(skip(self), fields(local = %self.shared.local))]
    pub async fn attach(&self, remote: ProcId) -> Result<()> {
        let conn = self.shared.connection(remote)?;
        {
            let mut state = conn.state.lock();
            match *state {
                ConnectionState::Detached => *state = ConnectionState::Attaching,
                ConnectionState::Attached | ConnectionState::Attaching => {
                    return Err(IpcError::AlreadyAttached(remote))
                }
                ConnectionState::Detaching => return Err(IpcError::Busy(remote)),
            }
        }

        match self.bind(conn) {
            Ok(()) => {
                *conn.state.lock() = ConnectionState::Attached;
                info!("Attached to {}", remote);
                Ok(())
            }
            Err(e) => {
                conn.accepting.store(false, Ordering::SeqCst);
                conn.rings.lock().take();
                let task = conn.drain_task.lock().take();
                if let Some(task) = task {
                    task.abort();
                }
                *conn.state.lock() = ConnectionState::Detached;
                warn!("Attach to {} failed: {}", remote, e);
                Err(e)
            }
        }
    }

    fn bind(&self, conn: &Connection) -> Result<()> {
        let shared = &self.shared;
        let remote = conn.remote;
        let resource = |e: SharedMemoryError| IpcError::Resource(format!("{}: {}", remote, e));

        let geometry =
            RingGeometry::new(shared.config.slot_count, shared.config.slot_size()).map_err(resource)?;
        let region_size = PlatformUtils::align_to_page_size(geometry.pair_bytes());
        let region = shared
            .regions
            .region_for(shared.local, remote, region_size)
            .map_err(resource)?;
        let rings = RingPair::create(region, geometry, Side::for_pair(shared.local, remote))
            .map_err(resource)?;

        debug!(
            "Ring pair to {} in {} ({} bytes)",
            remote,
            rings.region().name,
            region_size
        );
        *conn.rings.lock() = Some(Arc::new(rings));

        let task = tokio::spawn(drain_loop(
            Arc::downgrade(shared),
            remote,
            Arc::clone(&conn.wake),
        ));
        *conn.drain_task.lock() = Some(task);

        let wake = Arc::clone(&conn.wake);
        shared
            .notifier
            .register_callback(remote, Arc::new(move |_| wake.notify_one()))?;

        conn.accepting.store(true, Ordering::SeqCst);
        // Pick up anything the peer placed before this side was listening
        conn.wake.notify_one();
        Ok(())
    }

    /// Stop accepting sends, wait for in-flight ones, then tear down
    #[instrument(skip(self), fields(local = %self.shared.local))]
    pub async fn detach(&self, remote: ProcId) -> Result<()> {
        let shared = &self.shared;
        let conn = shared.connection(remote)?;
        {
            let mut state = conn.state.lock();
            match *state {
                ConnectionState::Attached => *state = ConnectionState::Detaching,
                ConnectionState::Detached => return Err(IpcError::NotAttached(remote)),
                ConnectionState::Attaching | ConnectionState::Detaching => {
                    return Err(IpcError::Busy(remote))
                }
            }
        }

        conn.accepting.store(false, Ordering::SeqCst);
        if let Err(e) = conn.wait_quiesced(shared.config.detach_timeout()).await {
            conn.accepting.store(true, Ordering::SeqCst);
            *conn.state.lock() = ConnectionState::Attached;
            warn!("Detach from {} abandoned: {}", remote, e);
            return Err(e);
        }

        if let Err(e) = shared.notifier.unregister_callback(remote) {
            warn!("Failed to release notification line from {}: {}", remote, e);
        }
        let task = conn.drain_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        // A drain started by a caller of process_inbound finishes first
        drop(conn.drain_lock.lock());
        conn.rings.lock().take();

        let forgotten = shared.discovery.forget_processor(remote);
        if forgotten > 0 {
            debug!("Forgot {} services of {}", forgotten, remote);
        }

        *conn.state.lock() = ConnectionState::Detached;
        info!("Detached from {}", remote);
        Ok(())
    }

    /// Detach every attached connection; the first failure is returned
    pub async fn shutdown(&self) -> Result<()> {
        let mut first_error = None;
        for conn in &self.shared.connections {
            let state = *conn.state.lock();
            if state != ConnectionState::Attached {
                continue;
            }
            if let Err(e) = self.detach(conn.remote).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Place one message in the ring towards `remote` without waiting.
    ///
    /// The remote is signalled once for every placed message and never for
    /// a full ring.
    pub fn try_send(&self, remote: ProcId, src: u32, dst: u32, payload: &[u8]) -> Result<SendOutcome> {
        let shared = &self.shared;
        let max = shared.config.max_message_size;
        if payload.len() > max {
            return Err(IpcError::MessageTooLarge {
                len: payload.len(),
                max,
            });
        }

        let conn = shared.connection(remote)?;
        let _in_flight = conn.enter()?;
        let rings = conn.rings().ok_or(IpcError::NotAttached(remote))?;

        let header = MessageHeader::new(src, dst, payload.len() as u16).to_bytes();
        match rings.try_send_vectored(&[&header[..], payload])? {
            SendOutcome::Sent => {
                shared.metrics.record_send(payload.len());
                shared.notifier.signal(remote)?;
                shared.metrics.record_notification();
                Ok(SendOutcome::Sent)
            }
            SendOutcome::RingFull => {
                shared.metrics.record_ring_full();
                Ok(SendOutcome::RingFull)
            }
        }
    }

    /// Send one message, handling a full ring per the configured policy
    #[instrument(skip(self, payload), fields(len = payload.len()))]
    pub async fn send(&self, remote: ProcId, src: u32, dst: u32, payload: &[u8]) -> Result<()> {
        match self.shared.config.send_policy {
            SendPolicy::Fail => match self.try_send(remote, src, dst, payload)? {
                SendOutcome::Sent => Ok(()),
                SendOutcome::RingFull => Err(IpcError::RingFull { proc: remote }),
            },
            SendPolicy::Retry {
                attempts,
                backoff_us,
            } => {
                for attempt in 1..=attempts {
                    if self.try_send(remote, src, dst, payload)? == SendOutcome::Sent {
                        return Ok(());
                    }
                    if attempt < attempts {
                        debug!("Ring towards {} full, attempt {}/{}", remote, attempt, attempts);
                        tokio::time::sleep(Duration::from_micros(backoff_us)).await;
                    }
                }
                Err(IpcError::RingFull { proc: remote })
            }
            SendPolicy::Wait {
                timeout_ms,
                poll_us,
            } => {
                let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
                loop {
                    if self.try_send(remote, src, dst, payload)? == SendOutcome::Sent {
                        return Ok(());
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(IpcError::Timeout(format!(
                            "ring towards {} stayed full for {}ms",
                            remote, timeout_ms
                        )));
                    }
                    tokio::time::sleep(Duration::from_micros(poll_us)).await;
                }
            }
        }
    }

    /// Drain everything the peer has placed in the receive ring and
    /// dispatch it; returns the number of slots consumed
    pub fn process_inbound(&self, remote: ProcId) -> Result<usize> {
        self.shared.process_inbound(remote)
    }

    /// Queue-backed endpoint at `addr` or, for [`multicore_ipc_core::ADDR_ANY`],
    /// at the next free address
    pub fn create_endpoint(&self, addr: u32) -> Result<Endpoint> {
        let (tx, rx) = mpsc::channel(self.shared.config.receive_queue_depth);
        let addr = self.shared.endpoints.reserve(addr, Receiver::Queue(tx))?;
        debug!("Endpoint {} created on {}", addr, self.shared.local);
        Ok(Endpoint::new(self.clone(), addr, rx))
    }

    /// Endpoint whose messages are handed to `callback` on the drain task.
    ///
    /// Unlike [`Endpoint::recv`], nothing here ends on a zero-length
    /// message: the callback receives it and must check
    /// [`Message::is_teardown`] if it gives teardown a meaning.
    pub fn create_callback_endpoint<F>(&self, addr: u32, callback: F) -> Result<EndpointHandle>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let callback: EndpointCallback = Arc::new(callback);
        let addr = self
            .shared
            .endpoints
            .reserve(addr, Receiver::Callback(callback))?;
        debug!("Callback endpoint {} created on {}", addr, self.shared.local);
        Ok(EndpointHandle::new(self.clone(), addr))
    }

    /// Unbind `addr`. A repeated release changes nothing but is reported.
    pub fn release_endpoint(&self, addr: u32) -> ReleaseOutcome {
        let outcome = self.shared.endpoints.release(addr);
        if outcome == ReleaseOutcome::AlreadyReleased {
            self.shared
                .events
                .record(&TransportEvent::DuplicateRelease { addr });
        }
        outcome
    }

    /// Announce `name` at local address `addr` to the name service host.
    ///
    /// On the host itself the service goes straight into the local
    /// discovery table.
    pub async fn register_service(&self, name: &str, addr: u32) -> Result<()> {
        self.publish(name, addr, NsFlags::Create).await
    }

    /// Withdraw an earlier announcement
    pub async fn unregister_service(&self, name: &str, addr: u32) -> Result<()> {
        self.publish(name, addr, NsFlags::Destroy).await
    }

    async fn publish(&self, name: &str, addr: u32, flags: NsFlags) -> Result<()> {
        let host = self.ns_host(name)?;
        if host == self.shared.local {
            let record = NameServiceMessage::new(name, addr, flags);
            self.shared.apply_name_record(host, record);
            return Ok(());
        }
        self.announce_to(host, name, addr, flags).await
    }

    /// Send one name service record to `remote`
    #[instrument(skip(self))]
    pub async fn announce_to(&self, remote: ProcId, name: &str, addr: u32, flags: NsFlags) -> Result<()> {
        let record = NameServiceMessage::new(name, addr, flags).encode();
        self.send(remote, addr, NAME_SERVICE_ADDR, &record)
            .await
            .map_err(|source| IpcError::Announce {
                service: name.to_string(),
                source: Box::new(source),
            })?;
        debug!("Announced '{}' at {} to {} ({:?})", name, addr, remote, flags);
        Ok(())
    }

    fn ns_host(&self, name: &str) -> Result<ProcId> {
        self.shared.ns_host.ok_or_else(|| IpcError::Announce {
            service: name.to_string(),
            source: Box::new(IpcError::Configuration(
                "no name service host configured".to_string(),
            )),
        })
    }

    /// Address of a service announced to this processor, if known yet
    pub fn resolve(&self, name: &str) -> Option<ServiceAddress> {
        self.shared.discovery.resolve(name)
    }

    pub async fn wait_for_service(&self, name: &str, timeout: Duration) -> Option<ServiceAddress> {
        self.shared.discovery.wait_for(name, timeout).await
    }

    pub fn services(&self) -> Vec<ServiceRecord> {
        self.shared.discovery.services()
    }
}

impl Shared {
    fn connection(&self, remote: ProcId) -> Result<&Connection> {
        let remote = self.multiproc.check(remote)?;
        if remote == self.local {
            return Err(IpcError::InvalidProcId(remote));
        }
        self.connections
            .get(remote.index())
            .ok_or(IpcError::InvalidProcId(remote))
    }

    fn process_inbound(&self, remote: ProcId) -> Result<usize> {
        let conn = self.connection(remote)?;
        let rings = conn.rings().ok_or(IpcError::NotAttached(remote))?;

        let _drain = conn.drain_lock.lock();
        self.notifier.disable_interrupt(remote);
        let drained = self.drain(remote, &rings);
        // A signal latched while masked fires here and schedules another pass
        self.notifier.enable_interrupt(remote);
        self.metrics.record_drain();
        drained
    }

    fn drain(&self, remote: ProcId, rings: &RingPair) -> Result<usize> {
        let mut consumed = 0;
        loop {
            match rings.try_receive() {
                Ok(Some(frame)) => {
                    consumed += 1;
                    self.deliver(remote, frame);
                }
                Ok(None) => return Ok(consumed),
                Err(e @ SharedMemoryError::CorruptSlot { .. }) => {
                    consumed += 1;
                    self.metrics.record_drop();
                    self.events.record(&TransportEvent::MalformedMessage {
                        from: remote,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn deliver(&self, remote: ProcId, frame: bytes::Bytes) {
        let msg = match Message::decode(remote, frame) {
            Ok(msg) => msg,
            Err(e) => {
                self.metrics.record_drop();
                self.events.record(&TransportEvent::MalformedMessage {
                    from: remote,
                    reason: e.to_string(),
                });
                return;
            }
        };
        self.metrics.record_receive(msg.len());

        if msg.dst == NAME_SERVICE_ADDR && self.config.name_service {
            self.handle_name_service(&msg);
            return;
        }

        match self.endpoints.dispatch(msg) {
            DispatchOutcome::Delivered => {}
            DispatchOutcome::Unreachable(msg) => {
                self.metrics.record_drop();
                self.events.record(&TransportEvent::DestinationUnreachable {
                    from: msg.from,
                    src: msg.src,
                    dst: msg.dst,
                    len: msg.len(),
                });
            }
            DispatchOutcome::QueueFull(msg) => {
                self.metrics.record_drop();
                self.events.record(&TransportEvent::ReceiveQueueOverflow {
                    from: msg.from,
                    dst: msg.dst,
                    len: msg.len(),
                });
            }
        }
    }

    fn handle_name_service(&self, msg: &Message) {
        let record = match NameServiceMessage::decode(&msg.payload) {
            Ok(record) => record,
            Err(e) => {
                self.events.record(&TransportEvent::NameServiceRejected {
                    from: msg.from,
                    reason: e.to_string(),
                });
                return;
            }
        };

        self.apply_name_record(msg.from, record);
    }

    fn apply_name_record(&self, from: ProcId, record: NameServiceMessage) {
        let event = match self.discovery.apply(from, &record) {
            NsUpdate::Added(address) => TransportEvent::ServiceAnnounced {
                from,
                name: record.name,
                addr: address.addr,
            },
            NsUpdate::Removed(address) => TransportEvent::ServiceWithdrawn {
                from,
                name: record.name,
                addr: address.addr,
            },
            NsUpdate::Ignored(reason) => TransportEvent::NameServiceRejected { from, reason },
        };
        self.events.record(&event);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        for conn in &mut self.connections {
            if let Some(task) = conn.drain_task.get_mut().take() {
                task.abort();
                let _ = self.notifier.unregister_callback(conn.remote);
            }
        }
    }
}

async fn drain_loop(shared: Weak<Shared>, remote: ProcId, wake: Arc<Notify>) {
    loop {
        wake.notified().await;
        let Some(strong) = shared.upgrade() else {
            break;
        };
        match strong.process_inbound(remote) {
            Ok(count) => {
                if count > 0 {
                    debug!("Drained {} messages from {}", count, remote);
                }
            }
            Err(IpcError::NotAttached(_)) => break,
            Err(e) => warn!("Drain of ring from {} failed: {}", remote, e),
        }
    }
}
