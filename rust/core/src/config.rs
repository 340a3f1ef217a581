//! Transport and processor table configuration

use crate::{IpcError, Result, MAX_NAME_LEN, RESERVED_ADDRESSES};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Size of the framed message header on the wire
pub const MESSAGE_HEADER_SIZE: usize = 16;

/// Processor table configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiProcConfig {
    /// Processor names, in id order
    pub processors: Vec<String>,
    /// Name of the local processor, if known at startup
    #[serde(default)]
    pub local: Option<String>,
}

impl MultiProcConfig {
    pub fn validate(&self) -> Result<()> {
        if self.processors.is_empty() {
            return Err(IpcError::Configuration(
                "processor table is empty".to_string(),
            ));
        }
        if self.processors.len() >= u16::MAX as usize {
            return Err(IpcError::Configuration(format!(
                "too many processors: {}",
                self.processors.len()
            )));
        }

        let mut seen = HashSet::new();
        for name in &self.processors {
            if name.is_empty() || name.len() >= MAX_NAME_LEN {
                return Err(IpcError::Configuration(format!(
                    "processor name '{}' must be 1..{} bytes",
                    name,
                    MAX_NAME_LEN - 1
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(IpcError::Configuration(format!(
                    "duplicate processor name '{}'",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// What a sender does when the ring towards the remote is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SendPolicy {
    /// Report the full ring immediately
    Fail,
    /// Retry a bounded number of times, sleeping between attempts
    Retry { attempts: u32, backoff_us: u64 },
    /// Poll until a slot frees up or the timeout elapses
    Wait { timeout_ms: u64, poll_us: u64 },
}

impl Default for SendPolicy {
    fn default() -> Self {
        SendPolicy::Retry {
            attempts: 8,
            backoff_us: 100,
        }
    }
}

/// Message transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum payload bytes per message
    pub max_message_size: usize,
    /// Slots per ring direction (power of two)
    pub slot_count: u32,
    /// Addresses below this bound are never handed out for ADDR_ANY
    pub reserved_addresses: u32,
    /// Depth of each queue-backed endpoint
    pub receive_queue_depth: usize,
    /// Backpressure policy of `send`
    pub send_policy: SendPolicy,
    /// Serve the name service endpoint
    pub name_service: bool,
    /// Processor receiving this processor's announcements
    pub name_service_host: Option<String>,
    /// Upper bound on waiting for in-flight sends during detach
    pub detach_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: 512 - MESSAGE_HEADER_SIZE,
            slot_count: 256,
            reserved_addresses: RESERVED_ADDRESSES,
            receive_queue_depth: 64,
            send_policy: SendPolicy::default(),
            name_service: true,
            name_service_host: None,
            detach_timeout_ms: 1000,
        }
    }
}

impl TransportConfig {
    /// Check every field; called by the transport builder
    pub fn validate(&self) -> Result<()> {
        if self.max_message_size == 0 || self.max_message_size > u16::MAX as usize {
            return Err(IpcError::Configuration(format!(
                "max_message_size must be 1..={}, got {}",
                u16::MAX,
                self.max_message_size
            )));
        }
        if self.slot_count == 0 || !self.slot_count.is_power_of_two() {
            return Err(IpcError::Configuration(format!(
                "slot_count must be a power of two, got {}",
                self.slot_count
            )));
        }
        if self.reserved_addresses == 0 || self.reserved_addresses >= crate::ADDR_ANY {
            return Err(IpcError::Configuration(format!(
                "reserved_addresses out of range: {}",
                self.reserved_addresses
            )));
        }
        if self.receive_queue_depth == 0 {
            return Err(IpcError::Configuration(
                "receive_queue_depth must be non-zero".to_string(),
            ));
        }
        if let SendPolicy::Retry { attempts: 0, .. } = self.send_policy {
            return Err(IpcError::Configuration(
                "retry policy needs at least one attempt".to_string(),
            ));
        }
        Ok(())
    }

    /// Bytes occupied by one framed message
    pub fn slot_size(&self) -> usize {
        MESSAGE_HEADER_SIZE + self.max_message_size
    }

    pub fn detach_timeout(&self) -> Duration {
        Duration::from_millis(self.detach_timeout_ms)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TransportConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.slot_size(), 512);
        assert_eq!(config.reserved_addresses, 1024);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = TransportConfig::from_json_str(
            r#"{
                "slot_count": 16,
                "name_service_host": "HOST",
                "send_policy": { "mode": "wait", "timeout_ms": 50, "poll_us": 10 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.slot_count, 16);
        assert_eq!(config.name_service_host.as_deref(), Some("HOST"));
        assert_eq!(
            config.send_policy,
            SendPolicy::Wait {
                timeout_ms: 50,
                poll_us: 10
            }
        );
        assert_eq!(config.max_message_size, 496);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let mut config = TransportConfig::default();
        config.slot_count = 100;
        assert!(matches!(config.validate(), Err(IpcError::Configuration(_))));

        let mut config = TransportConfig::default();
        config.max_message_size = 70_000;
        assert!(config.validate().is_err());

        let mut config = TransportConfig::default();
        config.send_policy = SendPolicy::Retry {
            attempts: 0,
            backoff_us: 1,
        };
        assert!(config.validate().is_err());

        assert!(TransportConfig::from_json_str(r#"{ "slot_count": 3 }"#).is_err());
        assert!(matches!(
            TransportConfig::from_json_str("not json"),
            Err(IpcError::Serialization(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transport.json");
        std::fs::write(&path, r#"{ "receive_queue_depth": 4, "send_policy": { "mode": "fail" } }"#)
            .unwrap();

        let config = TransportConfig::from_json_file(&path).unwrap();
        assert_eq!(config.receive_queue_depth, 4);
        assert_eq!(config.send_policy, SendPolicy::Fail);

        assert!(matches!(
            TransportConfig::from_json_file(dir.path().join("missing.json")),
            Err(IpcError::Io(_))
        ));
    }
}
