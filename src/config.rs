//! Root configuration: processor table, transport settings and log level

use anyhow::{Context, Result};
use multicore_ipc_core::{MultiProcConfig, TransportConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable overriding `log_level`
pub const LOG_LEVEL_ENV: &str = "IPC_LOG_LEVEL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub multiproc: MultiProcConfig,
    pub transport: TransportConfig,
    pub log_level: String,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            multiproc: MultiProcConfig {
                processors: vec!["HOST".to_string(), "DSP".to_string(), "IPU".to_string()],
                local: None,
            },
            transport: TransportConfig {
                name_service_host: Some("HOST".to_string()),
                ..TransportConfig::default()
            },
            log_level: "info".to_string(),
        }
    }
}

impl IpcConfig {
    /// Read `path` if given, otherwise start from defaults; then apply the
    /// environment override and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
            config.log_level = level;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid configuration JSON")
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read configuration {}", path.display()))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.multiproc
            .validate()
            .context("invalid processor table")?;
        self.transport
            .validate()
            .context("invalid transport settings")?;
        if let Some(host) = &self.transport.name_service_host {
            anyhow::ensure!(
                self.multiproc.processors.contains(host),
                "name service host '{}' is not a configured processor",
                host
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        IpcConfig::default().validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "multiproc": {{ "processors": ["MPU", "DSP1", "DSP2"] }},
                "transport": {{ "slot_count": 32, "name_service_host": "MPU",
                                "send_policy": {{ "mode": "fail" }} }},
                "log_level": "debug"
            }}"#
        )
        .unwrap();

        let config = IpcConfig::from_json_file(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.multiproc.processors.len(), 3);
        assert_eq!(config.transport.slot_count, 32);
        assert_eq!(config.transport.max_message_size, 496);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_unknown_host_rejected() {
        let mut config = IpcConfig::default();
        config.transport.name_service_host = Some("GPU".to_string());
        assert!(config.validate().is_err());

        config.transport.name_service_host = None;
        config.transport.slot_count = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = IpcConfig::load(Some(Path::new("/nonexistent/ipc.json"))).unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/ipc.json"));
    }
}
