//! Name service records and the discovery table they feed
//!
//! Records travel as ordinary messages to address 53:
//!
//! ```text
//! name [u8; 32] | addr u32 | flags u32                           (40 bytes)
//! name [u8; 32] | description [u8; 32] | addr u32 | flags u32    (72 bytes)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use multicore_ipc_core::{IpcError, ProcId, Result};
use multicore_ipc_shared_memory::{decode_fixed_name, encode_fixed_name};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Width of the name and description fields, terminator included
pub const NS_NAME_LEN: usize = 32;

/// Size of a record without description
pub const NS_MESSAGE_SIZE: usize = NS_NAME_LEN + 8;

/// Size of a record with description
pub const NS_EXTENDED_MESSAGE_SIZE: usize = 2 * NS_NAME_LEN + 8;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NsFlags {
    Create = 0,
    Destroy = 1,
}

impl TryFrom<u32> for NsFlags {
    type Error = IpcError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(NsFlags::Create),
            1 => Ok(NsFlags::Destroy),
            other => Err(IpcError::Malformed(format!(
                "unknown name service flags {:#x}",
                other
            ))),
        }
    }
}

/// Announcement of a service created or destroyed on the sending processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameServiceMessage {
    pub name: String,
    pub description: Option<String>,
    pub addr: u32,
    pub flags: NsFlags,
}

impl NameServiceMessage {
    /// Record for `name`; the name is cut to fit its field
    pub fn new(name: &str, addr: u32, flags: NsFlags) -> Self {
        Self {
            name: truncate_name(name),
            description: None,
            addr,
            flags,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(truncate_name(description));
        self
    }

    pub fn encoded_len(&self) -> usize {
        if self.description.is_some() {
            NS_EXTENDED_MESSAGE_SIZE
        } else {
            NS_MESSAGE_SIZE
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&encode_fixed_name(&self.name, NS_NAME_LEN));
        if let Some(description) = &self.description {
            buf.put_slice(&encode_fixed_name(description, NS_NAME_LEN));
        }
        buf.put_u32_le(self.addr);
        buf.put_u32_le(self.flags as u32);
        buf.freeze()
    }

    /// Parse a record; the variant is chosen by length
    pub fn decode(data: &[u8]) -> Result<Self> {
        let extended = match data.len() {
            NS_MESSAGE_SIZE => false,
            NS_EXTENDED_MESSAGE_SIZE => true,
            other => {
                return Err(IpcError::Malformed(format!(
                    "name service record of {} bytes",
                    other
                )))
            }
        };

        let name = decode_fixed_name(&data[..NS_NAME_LEN]);
        if name.is_empty() {
            return Err(IpcError::Malformed("empty service name".to_string()));
        }
        let mut rest = &data[NS_NAME_LEN..];
        let description = if extended {
            let description = decode_fixed_name(&rest[..NS_NAME_LEN]);
            rest.advance(NS_NAME_LEN);
            Some(description)
        } else {
            None
        };
        let addr = rest.get_u32_le();
        let flags = NsFlags::try_from(rest.get_u32_le())?;

        Ok(Self {
            name,
            description,
            addr,
            flags,
        })
    }
}

fn truncate_name(name: &str) -> String {
    decode_fixed_name(&encode_fixed_name(name, NS_NAME_LEN))
}

/// Where a service can be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceAddress {
    pub proc: ProcId,
    pub addr: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub address: ServiceAddress,
    pub description: Option<String>,
}

/// Effect of one name service record on the discovery table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NsUpdate {
    Added(ServiceAddress),
    Removed(ServiceAddress),
    Ignored(String),
}

/// Services announced by remote processors
#[derive(Debug, Default)]
pub struct DiscoveryTable {
    services: RwLock<HashMap<String, ServiceRecord>>,
    changed: Notify,
}

impl DiscoveryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a record received from `from`
    pub fn apply(&self, from: ProcId, msg: &NameServiceMessage) -> NsUpdate {
        let address = ServiceAddress {
            proc: from,
            addr: msg.addr,
        };

        let update = {
            let mut services = self.services.write();
            match msg.flags {
                NsFlags::Create => {
                    services.insert(
                        msg.name.clone(),
                        ServiceRecord {
                            name: msg.name.clone(),
                            address,
                            description: msg.description.clone(),
                        },
                    );
                    NsUpdate::Added(address)
                }
                NsFlags::Destroy => match services.get(&msg.name) {
                    Some(record) if record.address.proc == from => {
                        let removed = record.address;
                        services.remove(&msg.name);
                        NsUpdate::Removed(removed)
                    }
                    Some(record) => NsUpdate::Ignored(format!(
                        "'{}' is owned by {}, not {}",
                        msg.name, record.address.proc, from
                    )),
                    None => NsUpdate::Ignored(format!("'{}' is not registered", msg.name)),
                },
            }
        };

        if !matches!(update, NsUpdate::Ignored(_)) {
            debug!("Discovery table: {} {:?}", msg.name, update);
            self.changed.notify_waiters();
        }
        update
    }

    /// Look up a service; `None` until its announcement has been processed
    pub fn resolve(&self, name: &str) -> Option<ServiceAddress> {
        self.services.read().get(name).map(|record| record.address)
    }

    pub fn record(&self, name: &str) -> Option<ServiceRecord> {
        self.services.read().get(name).cloned()
    }

    /// Resolve `name`, waiting up to `timeout` for it to be announced
    pub async fn wait_for(&self, name: &str, timeout: Duration) -> Option<ServiceAddress> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(address) = self.resolve(name) {
                return Some(address);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.resolve(name);
            }
        }
    }

    /// Drop every service announced by `proc`
    pub fn forget_processor(&self, proc: ProcId) -> usize {
        let removed = {
            let mut services = self.services.write();
            let before = services.len();
            services.retain(|_, record| record.address.proc != proc);
            before - services.len()
        };
        if removed > 0 {
            self.changed.notify_waiters();
        }
        removed
    }

    /// Every known service, sorted by name
    pub fn services(&self) -> Vec<ServiceRecord> {
        let mut records: Vec<_> = self.services.read().values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_record_layout() {
        let msg = NameServiceMessage::new("rpmsg-echo", 1024, NsFlags::Destroy);
        let bytes = msg.encode();
        assert_eq!(bytes.len(), NS_MESSAGE_SIZE);
        assert_eq!(&bytes[..10], b"rpmsg-echo");
        assert_eq!(bytes[10], 0);
        assert_eq!(&bytes[32..36], &1024u32.to_le_bytes());
        assert_eq!(&bytes[36..40], &1u32.to_le_bytes());
        assert_eq!(NameServiceMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_extended_record() {
        let msg = NameServiceMessage::new("camera", 1030, NsFlags::Create)
            .with_description("front sensor pipeline");
        let bytes = msg.encode();
        assert_eq!(bytes.len(), NS_EXTENDED_MESSAGE_SIZE);
        assert_eq!(&bytes[32..38], b"front ");
        assert_eq!(&bytes[64..68], &1030u32.to_le_bytes());

        let decoded = NameServiceMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.description.as_deref(), Some("front sensor pipeline"));
    }

    #[test]
    fn test_long_names_are_truncated() {
        let long = "a-service-name-well-beyond-thirty-two-bytes";
        let msg = NameServiceMessage::new(long, 1, NsFlags::Create);
        assert_eq!(msg.name.len(), NS_NAME_LEN - 1);
        assert!(long.starts_with(&msg.name));

        let bytes = msg.encode();
        assert_eq!(bytes[NS_NAME_LEN - 1], 0);
        assert_eq!(NameServiceMessage::decode(&bytes).unwrap().name, msg.name);
    }

    #[test]
    fn test_decode_rejects_bad_records() {
        assert!(NameServiceMessage::decode(&[0u8; 39]).is_err());
        assert!(NameServiceMessage::decode(&[0u8; NS_MESSAGE_SIZE]).is_err());

        let mut bytes = NameServiceMessage::new("x", 5, NsFlags::Create)
            .encode()
            .to_vec();
        bytes[36] = 7;
        assert!(matches!(
            NameServiceMessage::decode(&bytes),
            Err(IpcError::Malformed(_))
        ));
    }

    #[test]
    fn test_discovery_create_and_destroy() {
        let table = DiscoveryTable::new();
        let dsp = ProcId(1);

        let create = NameServiceMessage::new("echo", 100, NsFlags::Create);
        assert_eq!(
            table.apply(dsp, &create),
            NsUpdate::Added(ServiceAddress { proc: dsp, addr: 100 })
        );
        assert_eq!(
            table.resolve("echo"),
            Some(ServiceAddress { proc: dsp, addr: 100 })
        );

        // Only the announcing processor may withdraw the service
        let destroy = NameServiceMessage::new("echo", 100, NsFlags::Destroy);
        assert!(matches!(table.apply(ProcId(2), &destroy), NsUpdate::Ignored(_)));
        assert!(table.resolve("echo").is_some());

        assert!(matches!(table.apply(dsp, &destroy), NsUpdate::Removed(_)));
        assert_eq!(table.resolve("echo"), None);
        assert!(matches!(table.apply(dsp, &destroy), NsUpdate::Ignored(_)));
    }

    #[test]
    fn test_forget_processor() {
        let table = DiscoveryTable::new();
        table.apply(ProcId(1), &NameServiceMessage::new("a", 1, NsFlags::Create));
        table.apply(ProcId(1), &NameServiceMessage::new("b", 2, NsFlags::Create));
        table.apply(ProcId(2), &NameServiceMessage::new("c", 3, NsFlags::Create));

        assert_eq!(table.forget_processor(ProcId(1)), 2);
        let names: Vec<_> = table.services().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_wait_for_late_announcement() {
        let table = Arc::new(DiscoveryTable::new());
        let writer = Arc::clone(&table);

        let announce = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.apply(ProcId(3), &NameServiceMessage::new("late", 1500, NsFlags::Create));
        });

        let found = table.wait_for("late", Duration::from_secs(2)).await;
        assert_eq!(found, Some(ServiceAddress { proc: ProcId(3), addr: 1500 }));
        announce.await.unwrap();

        assert_eq!(table.wait_for("never", Duration::from_millis(10)).await, None);
    }
}
