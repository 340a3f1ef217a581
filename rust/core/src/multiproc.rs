//! Processor identity table

use crate::{IpcError, MultiProcConfig, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};

/// Maximum processor name length in bytes, including the terminator
pub const MAX_NAME_LEN: usize = 32;

/// Small integer identifying one processor of the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcId(pub u16);

impl ProcId {
    /// Sentinel for "no such processor"
    pub const INVALID: ProcId = ProcId(0xFFFF);

    pub fn is_invalid(self) -> bool {
        self == Self::INVALID
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "proc#invalid")
        } else {
            write!(f, "proc#{}", self.0)
        }
    }
}

/// Static mapping of processor names to ids.
///
/// Populated once at startup; the only mutable field is the local id, which
/// is stored atomically so that every lookup stays lock-free.
#[derive(Debug)]
pub struct MultiProc {
    names: Vec<String>,
    by_name: HashMap<String, ProcId>,
    local: AtomicU16,
}

impl MultiProc {
    /// Build the table from configuration
    pub fn new(config: &MultiProcConfig) -> Result<Self> {
        config.validate()?;

        let names = config.processors.clone();
        let by_name = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), ProcId(idx as u16)))
            .collect();

        let table = Self {
            names,
            by_name,
            local: AtomicU16::new(ProcId::INVALID.0),
        };

        if let Some(local) = &config.local {
            let id = table
                .get_id(local)
                .ok_or_else(|| IpcError::UnknownProcessor(local.clone()))?;
            table.set_local_id(id)?;
        }

        Ok(table)
    }

    /// Build the table from a name list, without a local id
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(&MultiProcConfig {
            processors: names.into_iter().map(Into::into).collect(),
            local: None,
        })
    }

    /// Look up a processor by name
    pub fn get_id(&self, name: &str) -> Option<ProcId> {
        self.by_name.get(name).copied()
    }

    /// Look up a processor name by id
    pub fn get_name(&self, id: ProcId) -> Option<&str> {
        self.names.get(id.index()).map(String::as_str)
    }

    /// Id of the processor this table describes as local
    pub fn self_id(&self) -> Result<ProcId> {
        let id = ProcId(self.local.load(Ordering::Acquire));
        if id.is_invalid() {
            return Err(IpcError::LocalIdUnset);
        }
        Ok(id)
    }

    /// Set the local processor id
    pub fn set_local_id(&self, id: ProcId) -> Result<()> {
        let id = self.check(id)?;
        self.local.store(id.0, Ordering::Release);
        Ok(())
    }

    /// Number of configured processors
    pub fn num_processors(&self) -> u16 {
        self.names.len() as u16
    }

    /// Reject ids outside the table
    pub fn check(&self, id: ProcId) -> Result<ProcId> {
        if id.is_invalid() || id.index() >= self.names.len() {
            return Err(IpcError::InvalidProcId(id));
        }
        Ok(id)
    }

    /// Resolve a name, failing with a typed error
    pub fn require(&self, name: &str) -> Result<ProcId> {
        self.get_id(name)
            .ok_or_else(|| IpcError::UnknownProcessor(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProcId, &str)> {
        self.names
            .iter()
            .enumerate()
            .map(|(idx, name)| (ProcId(idx as u16), name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> MultiProc {
        MultiProc::from_names(["HOST", "DSP1", "DSP2", "IPU"]).unwrap()
    }

    #[test]
    fn test_lookup_by_name_and_id() {
        let mp = table();
        assert_eq!(mp.get_id("DSP1"), Some(ProcId(1)));
        assert_eq!(mp.get_id("GPU"), None);
        assert_eq!(mp.get_name(ProcId(3)), Some("IPU"));
        assert_eq!(mp.get_name(ProcId(4)), None);
        assert_eq!(mp.get_name(ProcId::INVALID), None);
        assert_eq!(mp.num_processors(), 4);
    }

    #[test]
    fn test_local_id_lifecycle() {
        let mp = table();
        assert!(matches!(mp.self_id(), Err(IpcError::LocalIdUnset)));

        assert!(matches!(
            mp.set_local_id(ProcId(9)),
            Err(IpcError::InvalidProcId(ProcId(9)))
        ));
        assert!(mp.self_id().is_err());

        mp.set_local_id(ProcId(2)).unwrap();
        assert_eq!(mp.self_id().unwrap(), ProcId(2));
    }

    #[test]
    fn test_local_from_config() {
        let config = MultiProcConfig {
            processors: vec!["HOST".into(), "DSP1".into()],
            local: Some("DSP1".into()),
        };
        let mp = MultiProc::new(&config).unwrap();
        assert_eq!(mp.self_id().unwrap(), ProcId(1));

        let config = MultiProcConfig {
            processors: vec!["HOST".into()],
            local: Some("DSP7".into()),
        };
        assert!(matches!(
            MultiProc::new(&config),
            Err(IpcError::UnknownProcessor(_))
        ));
    }

    #[test]
    fn test_rejects_bad_tables() {
        assert!(MultiProc::from_names(Vec::<String>::new()).is_err());
        assert!(MultiProc::from_names(["HOST", "HOST"]).is_err());
        assert!(MultiProc::from_names(["X".repeat(MAX_NAME_LEN)]).is_err());
        assert!(MultiProc::from_names(["X".repeat(MAX_NAME_LEN - 1)]).is_ok());
    }

    #[test]
    fn test_iter_and_display() {
        let mp = table();
        let names: Vec<_> = mp.iter().map(|(_, name)| name).collect();
        assert_eq!(names, ["HOST", "DSP1", "DSP2", "IPU"]);
        assert_eq!(ProcId(2).to_string(), "proc#2");
        assert_eq!(ProcId::INVALID.to_string(), "proc#invalid");
    }
}
