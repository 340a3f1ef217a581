//! Resource table
//!
//! Boot-time declaration, read by the remote processor's loader, of where
//! the rings and the trace buffer live. Layout (all fields little-endian):
//!
//! ```text
//! 0:  ver u32 | num u32 | reserved [u32; 2]
//! 16: offset[num] u32    byte offset of each entry from the table start
//!     entries            each starts with a u32 type tag
//! ```

use crate::{
    decode_fixed_name, encode_fixed_name, RingGeometry, Result, SharedMemoryError, RING_ALIGN,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Only table version understood
pub const RESOURCE_TABLE_VERSION: u32 = 1;

/// Virtio device id of an rpmsg channel
pub const VIRTIO_ID_RPMSG: u32 = 7;

/// Width of every name field in the table
pub const RESOURCE_NAME_LEN: usize = 32;

const HEADER_SIZE: usize = 16;
const MEMORY_ENTRY_SIZE: usize = 4 + 20 + RESOURCE_NAME_LEN;
const TRACE_ENTRY_SIZE: usize = 4 + 12 + RESOURCE_NAME_LEN;
const VDEV_FIXED_SIZE: usize = 4 + 24;
const VRING_SIZE: usize = 20;

/// Entry type tags
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceType {
    Carveout = 0,
    DevMem = 1,
    Trace = 2,
    Vdev = 3,
}

impl TryFrom<u32> for ResourceType {
    type Error = SharedMemoryError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(ResourceType::Carveout),
            1 => Ok(ResourceType::DevMem),
            2 => Ok(ResourceType::Trace),
            3 => Ok(ResourceType::Vdev),
            other => Err(SharedMemoryError::ResourceTable(format!(
                "unknown entry type {}",
                other
            ))),
        }
    }
}

/// Carveout or device memory range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryResource {
    /// Device address
    pub da: u32,
    /// Physical address
    pub pa: u32,
    pub len: u32,
    pub flags: u32,
    pub name: String,
}

/// Shared trace buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceResource {
    pub da: u32,
    pub len: u32,
    pub name: String,
}

/// One vring of a virtio device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VringDescriptor {
    pub da: u32,
    pub align: u32,
    pub num: u32,
    pub notify_id: u32,
}

/// Virtio device with its vrings and config space
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdevResource {
    pub id: u32,
    pub notify_id: u32,
    pub dfeatures: u32,
    pub gfeatures: u32,
    pub status: u8,
    pub vrings: Vec<VringDescriptor>,
    pub config: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceEntry {
    Carveout(MemoryResource),
    DevMem(MemoryResource),
    Trace(TraceResource),
    Vdev(VdevResource),
}

impl ResourceEntry {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            ResourceEntry::Carveout(_) => ResourceType::Carveout,
            ResourceEntry::DevMem(_) => ResourceType::DevMem,
            ResourceEntry::Trace(_) => ResourceType::Trace,
            ResourceEntry::Vdev(_) => ResourceType::Vdev,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            ResourceEntry::Carveout(_) | ResourceEntry::DevMem(_) => MEMORY_ENTRY_SIZE,
            ResourceEntry::Trace(_) => TRACE_ENTRY_SIZE,
            ResourceEntry::Vdev(vdev) => {
                VDEV_FIXED_SIZE + vdev.vrings.len() * VRING_SIZE + vdev.config.len()
            }
        }
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u32_le(self.resource_type() as u32);
        match self {
            ResourceEntry::Carveout(mem) | ResourceEntry::DevMem(mem) => {
                buf.put_u32_le(mem.da);
                buf.put_u32_le(mem.pa);
                buf.put_u32_le(mem.len);
                buf.put_u32_le(mem.flags);
                buf.put_u32_le(0);
                buf.put_slice(&encode_fixed_name(&mem.name, RESOURCE_NAME_LEN));
            }
            ResourceEntry::Trace(trace) => {
                buf.put_u32_le(trace.da);
                buf.put_u32_le(trace.len);
                buf.put_u32_le(0);
                buf.put_slice(&encode_fixed_name(&trace.name, RESOURCE_NAME_LEN));
            }
            ResourceEntry::Vdev(vdev) => {
                buf.put_u32_le(vdev.id);
                buf.put_u32_le(vdev.notify_id);
                buf.put_u32_le(vdev.dfeatures);
                buf.put_u32_le(vdev.gfeatures);
                let num_vrings = u8::try_from(vdev.vrings.len()).map_err(|_| {
                    SharedMemoryError::ResourceTable(format!(
                        "{} vrings do not fit the u8 count field",
                        vdev.vrings.len()
                    ))
                })?;
                buf.put_u32_le(to_u32(vdev.config.len(), "vdev config length")?);
                buf.put_u8(vdev.status);
                buf.put_u8(num_vrings);
                buf.put_bytes(0, 2);
                for vring in &vdev.vrings {
                    buf.put_u32_le(vring.da);
                    buf.put_u32_le(vring.align);
                    buf.put_u32_le(vring.num);
                    buf.put_u32_le(vring.notify_id);
                    buf.put_u32_le(0);
                }
                buf.put_slice(&vdev.config);
            }
        }
        Ok(())
    }

    fn decode(mut buf: &[u8]) -> Result<Self> {
        need(buf, 4, "entry type")?;
        let kind = ResourceType::try_from(buf.get_u32_le())?;
        match kind {
            ResourceType::Carveout | ResourceType::DevMem => {
                need(buf, MEMORY_ENTRY_SIZE - 4, "memory entry")?;
                let mem = MemoryResource {
                    da: buf.get_u32_le(),
                    pa: buf.get_u32_le(),
                    len: buf.get_u32_le(),
                    flags: buf.get_u32_le(),
                    name: {
                        buf.advance(4);
                        decode_fixed_name(&buf[..RESOURCE_NAME_LEN])
                    },
                };
                Ok(if kind == ResourceType::Carveout {
                    ResourceEntry::Carveout(mem)
                } else {
                    ResourceEntry::DevMem(mem)
                })
            }
            ResourceType::Trace => {
                need(buf, TRACE_ENTRY_SIZE - 4, "trace entry")?;
                let da = buf.get_u32_le();
                let len = buf.get_u32_le();
                buf.advance(4);
                Ok(ResourceEntry::Trace(TraceResource {
                    da,
                    len,
                    name: decode_fixed_name(&buf[..RESOURCE_NAME_LEN]),
                }))
            }
            ResourceType::Vdev => {
                need(buf, VDEV_FIXED_SIZE - 4, "vdev entry")?;
                let id = buf.get_u32_le();
                let notify_id = buf.get_u32_le();
                let dfeatures = buf.get_u32_le();
                let gfeatures = buf.get_u32_le();
                let config_len = buf.get_u32_le() as usize;
                let status = buf.get_u8();
                let num_vrings = buf.get_u8() as usize;
                buf.advance(2);

                need(buf, num_vrings * VRING_SIZE + config_len, "vdev vrings")?;
                let mut vrings = Vec::with_capacity(num_vrings);
                for _ in 0..num_vrings {
                    vrings.push(VringDescriptor {
                        da: buf.get_u32_le(),
                        align: buf.get_u32_le(),
                        num: buf.get_u32_le(),
                        notify_id: buf.get_u32_le(),
                    });
                    buf.advance(4);
                }
                Ok(ResourceEntry::Vdev(VdevResource {
                    id,
                    notify_id,
                    dfeatures,
                    gfeatures,
                    status,
                    vrings,
                    config: buf[..config_len].to_vec(),
                }))
            }
        }
    }
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        SharedMemoryError::ResourceTable(format!("{} {:#x} exceeds 32 bits", what, value))
    })
}

fn need(buf: &[u8], len: usize, what: &str) -> Result<()> {
    if buf.len() < len {
        return Err(SharedMemoryError::ResourceTable(format!(
            "{} truncated: {} of {} bytes",
            what,
            buf.len(),
            len
        )));
    }
    Ok(())
}

/// Decoded resource table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTable {
    entries: Vec<ResourceEntry>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table declaring one rpmsg ring pair at `ring_da` and a trace buffer.
    ///
    /// The vrings follow the ring pair layout: ring 0 at `ring_da`, ring 1
    /// directly after it; the carveout covers both. Fails when the pair does
    /// not fit the 32-bit device address space above `ring_da`.
    pub fn for_ring_pair(
        ring_da: u32,
        geometry: RingGeometry,
        trace_da: u32,
        trace_len: u32,
    ) -> Result<Self> {
        let ring_bytes = to_u32(geometry.ring_bytes(), "ring size")?;
        let pair_bytes = to_u32(geometry.pair_bytes(), "ring pair size")?;
        if ring_da.checked_add(pair_bytes).is_none() {
            return Err(SharedMemoryError::ResourceTable(format!(
                "ring pair of {:#x} bytes at {:#010x} overflows the device address space",
                pair_bytes, ring_da
            )));
        }

        let mut table = Self::new();
        table
            .push(ResourceEntry::Carveout(MemoryResource {
                da: ring_da,
                pa: ring_da,
                len: pair_bytes,
                flags: 0,
                name: "ipc_rings".to_string(),
            }))
            .push(ResourceEntry::Trace(TraceResource {
                da: trace_da,
                len: trace_len,
                name: "trace0".to_string(),
            }))
            .push(ResourceEntry::Vdev(VdevResource {
                id: VIRTIO_ID_RPMSG,
                notify_id: 0,
                dfeatures: 1,
                gfeatures: 0,
                status: 0,
                vrings: (0..2u32)
                    .map(|ring| VringDescriptor {
                        da: ring_da + ring * ring_bytes,
                        align: RING_ALIGN as u32,
                        num: geometry.slot_count,
                        notify_id: ring + 1,
                    })
                    .collect(),
                config: Vec::new(),
            }));
        Ok(table)
    }

    pub fn push(&mut self, entry: ResourceEntry) -> &mut Self {
        self.entries.push(entry);
        self
    }

    pub fn entries(&self) -> &[ResourceEntry] {
        &self.entries
    }

    /// Vrings of the first rpmsg device
    pub fn vdev_rings(&self) -> Option<&[VringDescriptor]> {
        self.entries.iter().find_map(|entry| match entry {
            ResourceEntry::Vdev(vdev) if vdev.id == VIRTIO_ID_RPMSG => Some(vdev.vrings.as_slice()),
            _ => None,
        })
    }

    /// First trace buffer
    pub fn trace(&self) -> Option<&TraceResource> {
        self.entries.iter().find_map(|entry| match entry {
            ResourceEntry::Trace(trace) => Some(trace),
            _ => None,
        })
    }

    /// Serialize the table; fails if a count or offset does not fit its field
    pub fn encode(&self) -> Result<Bytes> {
        let offsets_end = HEADER_SIZE + 4 * self.entries.len();
        let total = offsets_end + self.entries.iter().map(|e| e.encoded_len()).sum::<usize>();
        to_u32(total, "table size")?;
        let mut buf = BytesMut::with_capacity(total);

        buf.put_u32_le(RESOURCE_TABLE_VERSION);
        buf.put_u32_le(to_u32(self.entries.len(), "entry count")?);
        buf.put_bytes(0, 8);

        let mut offset = offsets_end;
        for entry in &self.entries {
            buf.put_u32_le(to_u32(offset, "entry offset")?);
            offset += entry.encoded_len();
        }
        for entry in &self.entries {
            entry.encode(&mut buf)?;
        }
        Ok(buf.freeze())
    }

    /// Parse a table, checking version and every offset
    pub fn decode(data: &[u8]) -> Result<Self> {
        need(data, HEADER_SIZE, "header")?;
        let mut header = &data[..HEADER_SIZE];
        let version = header.get_u32_le();
        if version != RESOURCE_TABLE_VERSION {
            return Err(SharedMemoryError::ResourceTable(format!(
                "unsupported version {}",
                version
            )));
        }
        let num = header.get_u32_le() as usize;

        let mut offsets = &data[HEADER_SIZE..];
        need(offsets, num.saturating_mul(4), "offset array")?;

        let mut entries = Vec::with_capacity(num);
        for _ in 0..num {
            let offset = offsets.get_u32_le() as usize;
            if offset < HEADER_SIZE + 4 * num || offset >= data.len() {
                return Err(SharedMemoryError::ResourceTable(format!(
                    "entry offset {} outside table of {} bytes",
                    offset,
                    data.len()
                )));
            }
            entries.push(ResourceEntry::decode(&data[offset..])?);
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_pair_table() {
        let geometry = RingGeometry::new(256, 512).unwrap();
        let table =
            ResourceTable::for_ring_pair(0x9000_0000, geometry, 0x9F00_0000, 0x8000).unwrap();

        let rings = table.vdev_rings().unwrap();
        assert_eq!(rings.len(), 2);
        assert_eq!(rings[0].da, 0x9000_0000);
        assert_eq!(rings[1].da, 0x9000_0000 + geometry.ring_bytes() as u32);
        assert_eq!(rings[0].num, 256);
        assert_eq!(table.trace().unwrap().len, 0x8000);

        let decoded = ResourceTable::decode(&table.encode().unwrap()).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn test_encoded_layout() {
        let mut table = ResourceTable::new();
        table.push(ResourceEntry::Trace(TraceResource {
            da: 0x100,
            len: 0x200,
            name: "trace0".to_string(),
        }));
        let bytes = table.encode().unwrap();

        assert_eq!(bytes.len(), HEADER_SIZE + 4 + TRACE_ENTRY_SIZE);
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &20u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &(ResourceType::Trace as u32).to_le_bytes());
        assert_eq!(&bytes[24..28], &0x100u32.to_le_bytes());
        assert_eq!(&bytes[36..42], b"trace0");
    }

    #[test]
    fn test_decode_rejects_bad_tables() {
        assert!(ResourceTable::decode(&[0u8; 8]).is_err());

        let mut bad_version = ResourceTable::new().encode().unwrap().to_vec();
        bad_version[0] = 2;
        assert!(matches!(
            ResourceTable::decode(&bad_version),
            Err(SharedMemoryError::ResourceTable(_))
        ));

        let geometry = RingGeometry::new(8, 64).unwrap();
        let good = ResourceTable::for_ring_pair(0, geometry, 0x1000, 64)
            .unwrap()
            .encode()
            .unwrap();

        let truncated = &good[..good.len() - 10];
        assert!(ResourceTable::decode(truncated).is_err());

        let mut bad_offset = good.to_vec();
        bad_offset[16..20].copy_from_slice(&4096u32.to_le_bytes());
        assert!(ResourceTable::decode(&bad_offset).is_err());

        let mut bad_type = good.to_vec();
        let first = u32::from_le_bytes([good[16], good[17], good[18], good[19]]) as usize;
        bad_type[first..first + 4].copy_from_slice(&9u32.to_le_bytes());
        assert!(ResourceTable::decode(&bad_type).is_err());
    }

    #[test]
    fn test_ring_pair_must_fit_address_space() {
        let geometry = RingGeometry::new(256, 512).unwrap();
        let pair = geometry.pair_bytes() as u32;

        assert!(ResourceTable::for_ring_pair(u32::MAX - pair, geometry, 0, 0).is_ok());
        assert!(matches!(
            ResourceTable::for_ring_pair(u32::MAX - pair + 1, geometry, 0, 0),
            Err(SharedMemoryError::ResourceTable(_))
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_vring_count() {
        let vring = VringDescriptor {
            da: 0,
            align: RING_ALIGN as u32,
            num: 4,
            notify_id: 1,
        };
        let mut table = ResourceTable::new();
        table.push(ResourceEntry::Vdev(VdevResource {
            id: VIRTIO_ID_RPMSG,
            notify_id: 0,
            dfeatures: 0,
            gfeatures: 0,
            status: 0,
            vrings: vec![vring; 256],
            config: Vec::new(),
        }));
        assert!(matches!(
            table.encode(),
            Err(SharedMemoryError::ResourceTable(_))
        ));
    }
}
