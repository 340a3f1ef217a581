//! Shared memory region management

use crate::{Result, SharedMemoryError};
use memmap2::{MmapMut, MmapOptions};
use multicore_ipc_core::ProcId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::debug;

/// Smallest region handed out (one page)
pub const MIN_REGION_SIZE: usize = 4096;

/// Largest region handed out (1GB)
pub const MAX_REGION_SIZE: usize = 1024 * 1024 * 1024;

/// Contiguous, address-stable byte region shared by two processors
pub struct SharedRegion {
    /// Region name/identifier
    pub name: String,
    /// Region size in bytes
    pub size: usize,
    /// Memory pointer
    ptr: NonNull<u8>,
    /// Owns the mapping; the pointer above stays valid while it lives
    backing: Backing,
}

enum Backing {
    Anonymous(#[allow(dead_code)] MmapMut),
    File { map: MmapMut, path: PathBuf },
}

impl SharedRegion {
    /// Map a zero-filled region visible to every thread of this process
    pub fn anonymous(name: impl Into<String>, size: usize) -> Result<Self> {
        let name = name.into();
        validate_region_size(size)?;

        let mut map = MmapMut::map_anon(size)
            .map_err(|e| SharedMemoryError::MappingFailed(format!("{}: {}", name, e)))?;
        let ptr = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| SharedMemoryError::MappingFailed("mmap returned null".to_string()))?;

        debug!("Mapped anonymous region {} ({} bytes)", name, size);
        Ok(Self {
            name,
            size,
            ptr,
            backing: Backing::Anonymous(map),
        })
    }

    /// Map a file so that two OS processes can share the region.
    ///
    /// A new or shorter file is extended with zeros; existing contents are
    /// kept so the second processor sees what the first one initialised.
    pub fn open_file(path: impl AsRef<Path>, size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        validate_region_size(size)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if (file.metadata()?.len() as usize) < size {
            file.set_len(size as u64)?;
        }

        // SAFETY: the file is only accessed through ring control blocks
        // whose indices are atomics; slot bytes are handed off by them.
        let mut map = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .map_err(|e| SharedMemoryError::MappingFailed(format!("{}: {}", path.display(), e)))?;
        let ptr = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| SharedMemoryError::MappingFailed("mmap returned null".to_string()))?;

        debug!("Mapped file region {} ({} bytes)", path.display(), size);
        Ok(Self {
            name: path.display().to_string(),
            size,
            ptr,
            backing: Backing::File { map, path },
        })
    }

    /// Get raw pointer to the memory
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::File { path, .. } => Some(path),
            Backing::Anonymous(_) => None,
        }
    }

    /// Write dirty pages of a file-backed region back to the file
    pub fn flush(&self) -> Result<()> {
        if let Backing::File { map, .. } = &self.backing {
            map.flush()?;
        }
        Ok(())
    }

    /// Fail unless the region holds at least `required` bytes
    pub fn ensure_capacity(&self, required: usize) -> Result<()> {
        if self.size < required {
            return Err(SharedMemoryError::RegionTooSmall {
                size: self.size,
                required,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("path", &self.path())
            .finish()
    }
}

// Safety: the mapping is owned by the region and never remapped
unsafe impl Send for SharedRegion {}
// Safety: concurrent access goes through atomics in the ring control blocks
unsafe impl Sync for SharedRegion {}

/// Supplies the region backing the connection between two processors.
///
/// Both sides of a connection must receive the same memory.
pub trait RegionProvider: Send + Sync {
    fn region_for(&self, local: ProcId, remote: ProcId, min_size: usize)
        -> Result<Arc<SharedRegion>>;
}

fn pair_key(a: ProcId, b: ProcId) -> (ProcId, ProcId) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

/// In-process provider: one anonymous region per unordered processor pair
#[derive(Default)]
pub struct RegionPool {
    regions: Mutex<HashMap<(ProcId, ProcId), Arc<SharedRegion>>>,
}

impl RegionPool {
    /// Create a new region pool
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Remove a pair's region from the pool
    pub fn remove_region(&self, a: ProcId, b: ProcId) -> Option<Arc<SharedRegion>> {
        self.regions.lock().remove(&pair_key(a, b))
    }

    /// Number of regions handed out so far
    pub fn len(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RegionProvider for RegionPool {
    fn region_for(
        &self,
        local: ProcId,
        remote: ProcId,
        min_size: usize,
    ) -> Result<Arc<SharedRegion>> {
        let key = pair_key(local, remote);
        let mut regions = self.regions.lock();

        if let Some(region) = regions.get(&key) {
            region.ensure_capacity(min_size)?;
            return Ok(Arc::clone(region));
        }

        let name = format!("ipc_{}_{}", key.0 .0, key.1 .0);
        let region = Arc::new(SharedRegion::anonymous(name, min_size)?);
        regions.insert(key, Arc::clone(&region));
        Ok(region)
    }
}

/// Cross-process provider: one file per unordered processor pair
#[derive(Debug, Clone)]
pub struct FileRegionProvider {
    dir: PathBuf,
}

impl FileRegionProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, a: ProcId, b: ProcId) -> PathBuf {
        let (lo, hi) = pair_key(a, b);
        self.dir.join(format!("ipc_{}_{}.shm", lo.0, hi.0))
    }
}

impl RegionProvider for FileRegionProvider {
    fn region_for(
        &self,
        local: ProcId,
        remote: ProcId,
        min_size: usize,
    ) -> Result<Arc<SharedRegion>> {
        let region = SharedRegion::open_file(self.path_for(local, remote), min_size)?;
        Ok(Arc::new(region))
    }
}

/// Validate region size
fn validate_region_size(size: usize) -> Result<()> {
    if !(MIN_REGION_SIZE..=MAX_REGION_SIZE).contains(&size) {
        return Err(SharedMemoryError::InvalidSize {
            size,
            min: MIN_REGION_SIZE,
            max: MAX_REGION_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_region() {
        let region = SharedRegion::anonymous("test_region", 8192).unwrap();
        assert_eq!(region.name, "test_region");
        assert_eq!(region.size, 8192);
        assert!(region.path().is_none());

        // Fresh anonymous mappings are zero-filled
        let bytes = unsafe { std::slice::from_raw_parts(region.as_ptr(), region.size) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_region_validation() {
        assert!(SharedRegion::anonymous("tiny", 100).is_err());
        assert!(SharedRegion::anonymous("huge", usize::MAX).is_err());

        let region = SharedRegion::anonymous("small", 4096).unwrap();
        assert!(matches!(
            region.ensure_capacity(5000),
            Err(SharedMemoryError::RegionTooSmall { size: 4096, required: 5000 })
        ));
    }

    #[test]
    fn test_pool_shares_one_region_per_pair() {
        let pool = RegionPool::new();
        let a = pool.region_for(ProcId(0), ProcId(1), 4096).unwrap();
        let b = pool.region_for(ProcId(1), ProcId(0), 4096).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = pool.region_for(ProcId(0), ProcId(2), 4096).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(pool.len(), 2);

        assert!(pool.region_for(ProcId(0), ProcId(1), 1 << 20).is_err());
        assert!(pool.remove_region(ProcId(1), ProcId(0)).is_some());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_file_regions_see_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileRegionProvider::new(dir.path());

        let a = provider.region_for(ProcId(2), ProcId(0), 4096).unwrap();
        let b = provider.region_for(ProcId(0), ProcId(2), 4096).unwrap();
        assert_eq!(a.path(), b.path());
        assert!(a.path().unwrap().ends_with("ipc_0_2.shm"));

        unsafe { a.as_ptr().add(10).write_volatile(0xAB) };
        a.flush().unwrap();
        assert_eq!(unsafe { b.as_ptr().add(10).read_volatile() }, 0xAB);
    }
}
