//! Observability sink for events that are not errors of any caller

use crate::ProcId;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

/// Something the transport dropped, skipped or learned on its own
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TransportEvent {
    /// Inbound message for an address with no endpoint
    DestinationUnreachable {
        from: ProcId,
        src: u32,
        dst: u32,
        len: usize,
    },
    /// Endpoint queue was full; message dropped
    ReceiveQueueOverflow { from: ProcId, dst: u32, len: usize },
    /// An address was released twice in the same session
    DuplicateRelease { addr: u32 },
    /// A slot could not be decoded
    MalformedMessage { from: ProcId, reason: String },
    /// A name service record was ignored
    NameServiceRejected { from: ProcId, reason: String },
    /// A remote processor announced a service
    ServiceAnnounced { from: ProcId, name: String, addr: u32 },
    /// A remote processor withdrew a service
    ServiceWithdrawn { from: ProcId, name: String, addr: u32 },
}

/// Receives [`TransportEvent`]s
pub trait EventSink: Send + Sync {
    fn record(&self, event: &TransportEvent);
}

/// Default sink: writes every event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: &TransportEvent) {
        match event {
            TransportEvent::DestinationUnreachable { from, src, dst, len } => {
                warn!(
                    "Destination unreachable: {} bytes from {}:{} to address {}",
                    len, from, src, dst
                );
            }
            TransportEvent::ReceiveQueueOverflow { from, dst, len } => {
                warn!(
                    "Receive queue of endpoint {} full, dropped {} bytes from {}",
                    dst, len, from
                );
            }
            TransportEvent::DuplicateRelease { addr } => {
                warn!("Endpoint address {} released twice", addr);
            }
            TransportEvent::MalformedMessage { from, reason } => {
                warn!("Malformed message from {}: {}", from, reason);
            }
            TransportEvent::NameServiceRejected { from, reason } => {
                warn!("Name service record from {} ignored: {}", from, reason);
            }
            TransportEvent::ServiceAnnounced { from, name, addr } => {
                debug!("Service '{}' announced by {} at {}", name, from, addr);
            }
            TransportEvent::ServiceWithdrawn { from, name, addr } => {
                debug!("Service '{}' withdrawn by {} at {}", name, from, addr);
            }
        }
    }
}

/// Keeps every event in memory and forwards it to the log
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<TransportEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&TransportEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| pred(event)).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingEventSink {
    fn record(&self, event: &TransportEvent) {
        TracingEventSink.record(event);
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink() {
        let sink = RecordingEventSink::new();
        sink.record(&TransportEvent::DuplicateRelease { addr: 1025 });
        sink.record(&TransportEvent::DestinationUnreachable {
            from: ProcId(1),
            src: 1024,
            dst: 77,
            len: 4,
        });

        assert_eq!(sink.events().len(), 2);
        assert_eq!(
            sink.count(|e| matches!(e, TransportEvent::DuplicateRelease { .. })),
            1
        );

        sink.clear();
        assert!(sink.events().is_empty());
    }
}
