//! Fixed-slot ring buffer pair
//!
//! One ring per direction, both inside the region shared with the remote
//! processor. Slot ownership moves from producer to consumer when the
//! producer index is published, and back when the consumer index is.

use crate::{
    MemoryBarriers, Result, RingControl, RingGeometry, SharedMemoryError, SharedRegion, Side,
    RING_INITIALIZING, RING_MAGIC, SHARED_MEMORY_VERSION, SLOT_PREFIX_SIZE,
};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};

/// Spins allowed while the peer finishes initialising a ring
const BIND_SPIN_LIMIT: u32 = 1 << 20;

/// Result of a non-blocking send attempt
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Data placed and published
    Sent,
    /// Every slot is owned by the consumer; nothing was written
    RingFull,
}

/// One direction of the pair, viewed through raw pointers into the region
struct RingView {
    control: NonNull<RingControl>,
    slots: NonNull<u8>,
    geometry: RingGeometry,
}

impl RingView {
    /// Bind the ring at `base`, initialising it if nobody has yet.
    ///
    /// # Safety
    /// `base` must be 64-byte aligned and valid for `geometry.ring_bytes()`.
    unsafe fn bind(base: *mut u8, geometry: RingGeometry) -> Result<Self> {
        let control = NonNull::new(base as *mut RingControl)
            .ok_or_else(|| SharedMemoryError::MappingFailed("null ring base".to_string()))?;
        let slots = NonNull::new(base.add(crate::CONTROL_BLOCK_SIZE))
            .ok_or_else(|| SharedMemoryError::MappingFailed("null slot base".to_string()))?;
        let view = Self {
            control,
            slots,
            geometry,
        };

        let ctl = view.control();
        match ctl
            .state
            .compare_exchange(0, RING_INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                ctl.slot_count.store(geometry.slot_count, Ordering::Relaxed);
                ctl.slot_size.store(geometry.slot_size, Ordering::Relaxed);
                ctl.version
                    .store(SHARED_MEMORY_VERSION as u32, Ordering::Relaxed);
                ctl.head.store(0, Ordering::Relaxed);
                ctl.tail.store(0, Ordering::Relaxed);
                ctl.state.store(RING_MAGIC, Ordering::Release);
                trace!("Initialised ring at {:p}", base);
            }
            Err(RING_MAGIC) => view.check_geometry()?,
            Err(RING_INITIALIZING) => {
                let mut spins = 0;
                while ctl.state.load(Ordering::Acquire) != RING_MAGIC {
                    spins += 1;
                    if spins > BIND_SPIN_LIMIT {
                        return Err(SharedMemoryError::Timeout(
                            "peer never finished ring initialisation".to_string(),
                        ));
                    }
                    std::hint::spin_loop();
                }
                view.check_geometry()?;
            }
            Err(other) => {
                return Err(SharedMemoryError::DataCorruption(format!(
                    "ring state word {:#x}",
                    other
                )))
            }
        }
        Ok(view)
    }

    fn control(&self) -> &RingControl {
        // SAFETY: points into a live region for as long as the pair holds it
        unsafe { self.control.as_ref() }
    }

    fn check_geometry(&self) -> Result<()> {
        let ctl = self.control();
        let found = RingGeometry {
            slot_count: ctl.slot_count.load(Ordering::Relaxed),
            slot_size: ctl.slot_size.load(Ordering::Relaxed),
        };
        if found != self.geometry {
            return Err(SharedMemoryError::GeometryMismatch {
                expected: format!("{:?}", self.geometry),
                found: format!("{:?}", found),
            });
        }
        Ok(())
    }

    fn slot_ptr(&self, index: u32) -> *mut u8 {
        let pos = (index & self.geometry.mask()) as usize;
        // SAFETY: pos < slot_count, so the slot lies within ring_bytes()
        unsafe { self.slots.as_ptr().add(pos * self.geometry.slot_stride()) }
    }

    fn pending(&self) -> u32 {
        let ctl = self.control();
        ctl.head
            .load(Ordering::Acquire)
            .wrapping_sub(ctl.tail.load(Ordering::Acquire))
    }
}

/// Send and receive rings towards one remote processor.
///
/// Producers are serialised by a short critical section covering slot
/// claim, copy and index publication; the consumer side has its own lock.
pub struct RingPair {
    region: Arc<SharedRegion>,
    geometry: RingGeometry,
    side: Side,
    tx: RingView,
    rx: RingView,
    producer: Mutex<()>,
    consumer: Mutex<()>,
}

// Safety: the views point into `region`, which the pair keeps alive
unsafe impl Send for RingPair {}
// Safety: index updates are atomic and slot access is serialised per side
unsafe impl Sync for RingPair {}

impl RingPair {
    /// Bind both rings inside `region`
    pub fn create(region: Arc<SharedRegion>, geometry: RingGeometry, side: Side) -> Result<Self> {
        region.ensure_capacity(geometry.pair_bytes())?;
        if region.as_ptr() as usize % crate::RING_ALIGN != 0 {
            return Err(SharedMemoryError::MappingFailed(
                "region base is not cache-line aligned".to_string(),
            ));
        }

        let ring_base = |ring: usize| {
            // SAFETY: ring * ring_bytes() + ring_bytes() <= pair_bytes() <= size
            unsafe { region.as_ptr().add(ring * geometry.ring_bytes()) }
        };
        // SAFETY: ring bases are RING_ALIGN aligned and in bounds
        let tx = unsafe { RingView::bind(ring_base(side.tx_ring()), geometry)? };
        let rx = unsafe { RingView::bind(ring_base(side.rx_ring()), geometry)? };

        debug!(
            "Ring pair on {}: {} slots x {} bytes, side {:?}",
            region.name, geometry.slot_count, geometry.slot_size, side
        );

        Ok(Self {
            region,
            geometry,
            side,
            tx,
            rx,
            producer: Mutex::new(()),
            consumer: Mutex::new(()),
        })
    }

    pub fn geometry(&self) -> RingGeometry {
        self.geometry
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    pub fn capacity(&self) -> u32 {
        self.geometry.slot_count
    }

    /// Place `data` in the next free send slot
    pub fn try_send(&self, data: &[u8]) -> Result<SendOutcome> {
        self.try_send_vectored(&[data])
    }

    /// Place the concatenation of `parts` in the next free send slot
    pub fn try_send_vectored(&self, parts: &[&[u8]]) -> Result<SendOutcome> {
        let len: usize = parts.iter().map(|part| part.len()).sum();
        let max = self.geometry.slot_size as usize;
        if len > max {
            return Err(SharedMemoryError::SlotOverflow { len, max });
        }

        let _claim = self.producer.lock();
        let ctl = self.tx.control();
        let head = ctl.head.load(Ordering::Relaxed);
        let tail = ctl.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.geometry.slot_count {
            return Ok(SendOutcome::RingFull);
        }

        let slot = self.tx.slot_ptr(head);
        // SAFETY: the slot lies between tail and head + capacity, so the
        // consumer does not own it; the producer lock excludes other writers.
        unsafe {
            std::ptr::copy_nonoverlapping((len as u32).to_le_bytes().as_ptr(), slot, 4);
            let mut cursor = slot.add(SLOT_PREFIX_SIZE);
            for part in parts {
                std::ptr::copy_nonoverlapping(part.as_ptr(), cursor, part.len());
                cursor = cursor.add(part.len());
            }
        }

        MemoryBarriers::release_barrier();
        ctl.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(SendOutcome::Sent)
    }

    /// Take the oldest filled receive slot; `None` when the ring is empty.
    ///
    /// A slot with an impossible length is skipped and reported as
    /// [`SharedMemoryError::CorruptSlot`]; the next call continues after it.
    pub fn try_receive(&self) -> Result<Option<Bytes>> {
        let _claim = self.consumer.lock();
        let ctl = self.rx.control();
        let tail = ctl.tail.load(Ordering::Relaxed);
        let head = ctl.head.load(Ordering::Acquire);
        if head == tail {
            return Ok(None);
        }
        if head.wrapping_sub(tail) > self.geometry.slot_count {
            return Err(SharedMemoryError::DataCorruption(format!(
                "producer index {} runs {} slots ahead of consumer index {}",
                head,
                head.wrapping_sub(tail),
                tail
            )));
        }

        MemoryBarriers::acquire_barrier();
        let slot = self.rx.slot_ptr(tail);
        let mut len_bytes = [0u8; 4];
        // SAFETY: head != tail, so the producer published this slot
        unsafe { std::ptr::copy_nonoverlapping(slot, len_bytes.as_mut_ptr(), 4) };
        let len = u32::from_le_bytes(len_bytes);

        let result = if len > self.geometry.slot_size {
            Err(SharedMemoryError::CorruptSlot { index: tail, len })
        } else {
            let mut data = vec![0u8; len as usize];
            // SAFETY: len <= slot_size, within the published slot
            unsafe {
                std::ptr::copy_nonoverlapping(
                    slot.add(SLOT_PREFIX_SIZE),
                    data.as_mut_ptr(),
                    len as usize,
                )
            };
            Ok(Some(Bytes::from(data)))
        };

        ctl.tail.store(tail.wrapping_add(1), Ordering::Release);
        result
    }

    /// Current fill levels
    pub fn stats(&self) -> RingStats {
        RingStats {
            region_name: self.region.name.clone(),
            capacity: self.geometry.slot_count,
            slot_size: self.geometry.slot_size,
            tx_pending: self.tx.pending(),
            rx_pending: self.rx.pending(),
        }
    }
}

impl std::fmt::Debug for RingPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingPair")
            .field("region", &self.region.name)
            .field("geometry", &self.geometry)
            .field("side", &self.side)
            .finish()
    }
}

/// Ring statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingStats {
    pub region_name: String,
    pub capacity: u32,
    pub slot_size: u32,
    pub tx_pending: u32,
    pub rx_pending: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RegionPool;
    use crate::RegionProvider;
    use multicore_ipc_core::ProcId;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    fn pair(slot_count: u32, slot_size: usize) -> (RingPair, RingPair) {
        let geometry = RingGeometry::new(slot_count, slot_size).unwrap();
        let region = Arc::new(
            SharedRegion::anonymous("ring_test", geometry.pair_bytes().max(4096)).unwrap(),
        );
        let low = RingPair::create(Arc::clone(&region), geometry, Side::Low).unwrap();
        let high = RingPair::create(region, geometry, Side::High).unwrap();
        (low, high)
    }

    #[test]
    fn test_send_receive_between_sides() {
        let (low, high) = pair(8, 64);

        assert_eq!(low.try_send(b"to high").unwrap(), SendOutcome::Sent);
        assert_eq!(high.try_send(b"to low").unwrap(), SendOutcome::Sent);

        assert_eq!(high.try_receive().unwrap().unwrap().as_ref(), b"to high");
        assert_eq!(low.try_receive().unwrap().unwrap().as_ref(), b"to low");
        assert!(low.try_receive().unwrap().is_none());
        assert!(high.try_receive().unwrap().is_none());
    }

    #[test]
    fn test_full_ring_and_wraparound() {
        let (low, high) = pair(4, 16);

        for i in 0..4u8 {
            assert_eq!(low.try_send(&[i; 3]).unwrap(), SendOutcome::Sent);
        }
        assert_eq!(low.try_send(b"x").unwrap(), SendOutcome::RingFull);
        assert_eq!(low.stats().tx_pending, 4);

        // Free one slot, then fill across the wrap point several times
        for round in 0..10u8 {
            let got = high.try_receive().unwrap().unwrap();
            assert_eq!(got.len(), 3);
            assert_eq!(low.try_send(&[100 + round; 3]).unwrap(), SendOutcome::Sent);
            assert_eq!(low.try_send(b"y").unwrap(), SendOutcome::RingFull);
        }
        assert_eq!(high.stats().rx_pending, 4);
    }

    #[test]
    fn test_zero_length_and_vectored_slots() {
        let (low, high) = pair(4, 32);

        assert_eq!(low.try_send(&[]).unwrap(), SendOutcome::Sent);
        assert_eq!(
            low.try_send_vectored(&[b"head", b"-", b"tail"]).unwrap(),
            SendOutcome::Sent
        );

        assert!(high.try_receive().unwrap().unwrap().is_empty());
        assert_eq!(high.try_receive().unwrap().unwrap().as_ref(), b"head-tail");
    }

    #[test]
    fn test_slot_overflow_rejected_before_ring() {
        let (low, _high) = pair(4, 16);
        assert!(matches!(
            low.try_send(&[0u8; 17]),
            Err(SharedMemoryError::SlotOverflow { len: 17, max: 16 })
        ));
        assert_eq!(low.stats().tx_pending, 0);
        assert_eq!(low.try_send(&[0u8; 16]).unwrap(), SendOutcome::Sent);
    }

    #[test]
    fn test_create_rejects_small_region_and_mismatch() {
        let geometry = RingGeometry::new(64, 512).unwrap();
        let region = Arc::new(SharedRegion::anonymous("small", 4096).unwrap());
        assert!(matches!(
            RingPair::create(Arc::clone(&region), geometry, Side::Low),
            Err(SharedMemoryError::RegionTooSmall { .. })
        ));

        let a = RingGeometry::new(4, 64).unwrap();
        let b = RingGeometry::new(8, 64).unwrap();
        let _low = RingPair::create(Arc::clone(&region), a, Side::Low).unwrap();
        assert!(matches!(
            RingPair::create(region, b, Side::High),
            Err(SharedMemoryError::GeometryMismatch { .. })
        ));
    }

    #[test]
    fn test_corrupt_slot_is_skipped() {
        let (low, high) = pair(4, 16);
        assert_eq!(low.try_send(b"bad").unwrap(), SendOutcome::Sent);
        assert_eq!(low.try_send(b"good").unwrap(), SendOutcome::Sent);

        // Scribble an impossible length over the first slot
        let slot = low.tx.slot_ptr(0);
        unsafe { std::ptr::copy_nonoverlapping(999u32.to_le_bytes().as_ptr(), slot, 4) };

        assert!(matches!(
            high.try_receive(),
            Err(SharedMemoryError::CorruptSlot { index: 0, len: 999 })
        ));
        assert_eq!(high.try_receive().unwrap().unwrap().as_ref(), b"good");
    }

    #[test]
    fn test_runaway_producer_index_is_corruption() {
        let (low, high) = pair(4, 16);
        assert_eq!(low.try_send(b"ok").unwrap(), SendOutcome::Sent);
        assert_eq!(high.try_receive().unwrap().unwrap().as_ref(), b"ok");

        let tail = high.rx.control().tail.load(Ordering::Acquire);
        low.tx
            .control()
            .head
            .store(tail.wrapping_add(4 + 1), Ordering::Release);

        assert!(matches!(
            high.try_receive(),
            Err(SharedMemoryError::DataCorruption(_))
        ));
        assert_eq!(high.rx.control().tail.load(Ordering::Acquire), tail);
        assert!(matches!(
            high.try_receive(),
            Err(SharedMemoryError::DataCorruption(_))
        ));
    }

    #[test]
    fn test_pool_region_rebinds_existing_rings() {
        let pool = RegionPool::new();
        let geometry = RingGeometry::new(8, 32).unwrap();
        let region = pool
            .region_for(ProcId(0), ProcId(1), geometry.pair_bytes().max(4096))
            .unwrap();

        let first = RingPair::create(Arc::clone(&region), geometry, Side::Low).unwrap();
        assert_eq!(first.try_send(b"kept").unwrap(), SendOutcome::Sent);
        drop(first);

        let peer = RingPair::create(region, geometry, Side::High).unwrap();
        assert_eq!(peer.try_receive().unwrap().unwrap().as_ref(), b"kept");
    }

    #[test]
    fn test_concurrent_producers_never_tear() {
        let (low, high) = pair(1024, 64);
        let low = Arc::new(low);

        std::thread::scope(|scope| {
            for writer in 0..4u8 {
                let low = Arc::clone(&low);
                scope.spawn(move || {
                    for seq in 0..200u8 {
                        let msg = [writer, seq, writer ^ seq, 0xA5, writer, seq];
                        assert_eq!(low.try_send(&msg).unwrap(), SendOutcome::Sent);
                    }
                });
            }
        });

        let mut last_seq = [None::<u8>; 4];
        let mut count = 0;
        while let Some(msg) = high.try_receive().unwrap() {
            assert_eq!(msg.len(), 6);
            let (writer, seq) = (msg[0], msg[1]);
            assert_eq!(&msg[..], &[writer, seq, writer ^ seq, 0xA5, writer, seq]);

            // Per-writer order survives interleaving
            let prev = &mut last_seq[writer as usize];
            assert!(prev.map_or(true, |p| p < seq));
            *prev = Some(seq);
            count += 1;
        }
        assert_eq!(count, 800);
    }

    proptest! {
        #[test]
        fn prop_ring_is_bounded_fifo(ops in proptest::collection::vec(any::<(bool, u8)>(), 1..400)) {
            let (low, high) = pair(8, 8);
            let mut model: VecDeque<u8> = VecDeque::new();

            for (is_send, value) in ops {
                if is_send {
                    match low.try_send(&[value]).unwrap() {
                        SendOutcome::Sent => model.push_back(value),
                        SendOutcome::RingFull => prop_assert_eq!(model.len(), 8),
                    }
                } else {
                    let got = high.try_receive().unwrap();
                    prop_assert_eq!(got.map(|b| b[0]), model.pop_front());
                }
                prop_assert!(model.len() <= 8);
                prop_assert_eq!(low.stats().tx_pending as usize, model.len());
            }
        }
    }
}
