use crate::{ChannelError, DmaEngine};
use log::{debug, warn};
use std::{
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Fill pattern for freshly allocated regions so untouched memory is easy to spot.
pub const SENTINEL: u8 = 0x5a;

/// Who owns a slot right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Owned by the DMA engine, the next descriptor pass may write it.
    FreeForDma,
    /// Written by the engine and waiting to be drained by the worker.
    Filled,
}

#[derive(Debug, thiserror::Error)]
#[error("slot {slot} of channel {channel} is {state:?}")]
pub struct SlotBusy {
    pub channel: usize,
    pub slot: usize,
    pub state: SlotState,
}

#[derive(Debug)]
struct RegionInner {
    state: SlotState,
    generation: u64,
    data: Vec<u8>,
}

/// A DMA-addressable memory region backing one ring slot.
///
/// The engine may only write while the slot is [`SlotState::FreeForDma`];
/// the worker may only read while it is [`SlotState::Filled`]. The region
/// lock is held for the whole write or the whole drain, so neither side can
/// observe the other half-way through.
#[derive(Debug)]
pub struct DmaRegion {
    channel: usize,
    slot: usize,
    len: usize,
    inner: Mutex<RegionInner>,
}

impl DmaRegion {
    pub fn new(channel: usize, slot: usize, len: usize) -> Self {
        Self {
            channel,
            slot,
            len,
            inner: Mutex::new(RegionInner {
                state: SlotState::FreeForDma,
                generation: 0,
                data: vec![SENTINEL; len],
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn state(&self) -> SlotState {
        self.lock().state
    }

    /// Number of completed DMA writes into this region.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Hardware side: fill the region and hand it to software.
    pub fn dma_write<F>(&self, fill: F) -> Result<(), SlotBusy>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut inner = self.lock();
        if inner.state != SlotState::FreeForDma {
            return Err(SlotBusy {
                channel: self.channel,
                slot: self.slot,
                state: inner.state,
            });
        }
        fill(&mut inner.data);
        inner.generation += 1;
        inner.state = SlotState::Filled;
        Ok(())
    }

    /// Software side: take the filled region for reading. Fails if the
    /// engine still owns it.
    pub fn sync_for_cpu(&self) -> Result<FilledSlot<'_>, SlotBusy> {
        let guard = self.lock();
        if guard.state != SlotState::Filled {
            return Err(SlotBusy {
                channel: self.channel,
                slot: self.slot,
                state: guard.state,
            });
        }
        Ok(FilledSlot {
            slot: self.slot,
            guard,
        })
    }
}

/// Read access to a filled slot. [`FilledSlot::recycle`] returns the slot to
/// the engine; dropping without recycling leaves it filled.
pub struct FilledSlot<'a> {
    slot: usize,
    guard: MutexGuard<'a, RegionInner>,
}

impl FilledSlot<'_> {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.guard.generation
    }

    pub fn recycle(mut self) {
        self.guard.state = SlotState::FreeForDma;
    }
}

impl Deref for FilledSlot<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard.data
    }
}

/// A channel's ring of DMA slots.
pub struct Ring {
    channel: usize,
    bytes_per_slot: usize,
    engine: Arc<dyn DmaEngine>,
    slots: Vec<Option<Arc<DmaRegion>>>,
}

impl Ring {
    /// Allocate `ring_depth` regions of `bytes_per_slot` bytes. A failure on
    /// any slot releases the slots already allocated; a short ring is never
    /// returned.
    pub fn allocate(
        engine: &Arc<dyn DmaEngine>,
        ring_depth: usize,
        bytes_per_slot: usize,
    ) -> Result<Self, ChannelError> {
        let mut ring = Self {
            channel: engine.channel(),
            bytes_per_slot,
            engine: Arc::clone(engine),
            slots: Vec::with_capacity(ring_depth),
        };
        for slot in 0..ring_depth {
            match engine.alloc(slot, bytes_per_slot) {
                Ok(region) => ring.slots.push(Some(region)),
                Err(source) => {
                    let freed = ring.free();
                    warn!(
                        "Channel {}: allocation of slot {} failed, released {} slot(s)",
                        ring.channel + 1,
                        slot,
                        freed
                    );
                    return Err(ChannelError::BufferAlloc { slot, source });
                }
            }
        }
        debug!(
            "Channel {}: allocated {} x {} byte ring",
            ring.channel + 1,
            ring_depth,
            bytes_per_slot
        );
        Ok(ring)
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn bytes_per_slot(&self) -> usize {
        self.bytes_per_slot
    }

    pub fn slot(&self, index: usize) -> Option<&Arc<DmaRegion>> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn regions(&self) -> Vec<Arc<DmaRegion>> {
        self.slots.iter().flatten().cloned().collect()
    }

    /// Slots still holding a region.
    pub fn allocated(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Release every region still held. Returns how many were released;
    /// calling again releases nothing.
    pub fn free(&mut self) -> usize {
        let mut freed = 0;
        for slot in self.slots.iter_mut() {
            if let Some(region) = slot.take() {
                self.engine.free(&region);
                freed += 1;
            }
        }
        freed
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HardwareError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEngine {
        fail_at: Option<usize>,
        allocs: AtomicUsize,
        frees: AtomicUsize,
    }

    impl CountingEngine {
        fn new(fail_at: Option<usize>) -> Arc<Self> {
            Arc::new(Self {
                fail_at,
                allocs: AtomicUsize::new(0),
                frees: AtomicUsize::new(0),
            })
        }
    }

    impl DmaEngine for CountingEngine {
        fn channel(&self) -> usize {
            1
        }

        fn alloc(&self, slot: usize, len: usize) -> Result<Arc<DmaRegion>, HardwareError> {
            if self.fail_at == Some(slot) {
                return Err(HardwareError::DmaAlloc { channel: 1, len });
            }
            self.allocs.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(DmaRegion::new(1, slot, len)))
        }

        fn free(&self, _region: &DmaRegion) {
            self.frees.fetch_add(1, Ordering::SeqCst);
        }

        fn load_chain(&self, _regions: &[Arc<DmaRegion>]) -> Result<(), HardwareError> {
            Ok(())
        }

        fn start(&self) -> Result<(), HardwareError> {
            Ok(())
        }

        fn abort(&self) {}

        fn close(&self) {}
    }

    #[test]
    fn allocates_sentinel_filled_ring() {
        let counting = CountingEngine::new(None);
        let engine: Arc<dyn DmaEngine> = counting.clone();
        let mut ring = Ring::allocate(&engine, 3, 16).unwrap();
        assert_eq!(ring.depth(), 3);
        assert_eq!(ring.allocated(), 3);

        let region = ring.slot(1).unwrap();
        assert_eq!(region.slot(), 1);
        assert_eq!(region.state(), SlotState::FreeForDma);
        region.dma_write(|_| {}).unwrap();
        let filled = region.sync_for_cpu().unwrap();
        assert!(filled.iter().all(|&b| b == SENTINEL));
        filled.recycle();

        assert_eq!(ring.free(), 3);
        assert_eq!(ring.free(), 0);
        drop(ring);
        assert_eq!(counting.frees.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn partial_allocation_is_released() {
        let counting = CountingEngine::new(Some(2));
        let engine: Arc<dyn DmaEngine> = counting.clone();
        let err = Ring::allocate(&engine, 4, 32).err().unwrap();
        assert!(matches!(err, ChannelError::BufferAlloc { slot: 2, .. }));
        assert_eq!(counting.allocs.load(Ordering::SeqCst), 2);
        assert_eq!(counting.frees.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropping_ring_releases_regions_once() {
        let counting = CountingEngine::new(None);
        let engine: Arc<dyn DmaEngine> = counting.clone();
        {
            let _ring = Ring::allocate(&engine, 2, 8).unwrap();
        }
        assert_eq!(counting.frees.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn ownership_alternates_between_engine_and_worker() {
        let region = DmaRegion::new(0, 0, 8);
        assert!(region.sync_for_cpu().is_err());

        region.dma_write(|buf| buf.fill(1)).unwrap();
        let busy = region.dma_write(|buf| buf.fill(2)).unwrap_err();
        assert_eq!(busy.state, SlotState::Filled);

        let filled = region.sync_for_cpu().unwrap();
        assert_eq!(filled.generation(), 1);
        assert!(filled.iter().all(|&b| b == 1));
        filled.recycle();

        assert_eq!(region.state(), SlotState::FreeForDma);
        region.dma_write(|buf| buf.fill(3)).unwrap();
        assert_eq!(region.generation(), 2);
    }

    #[test]
    fn unrecycled_slot_stays_with_worker() {
        let region = DmaRegion::new(0, 0, 4);
        region.dma_write(|_| {}).unwrap();
        drop(region.sync_for_cpu().unwrap());
        assert_eq!(region.state(), SlotState::Filled);
        assert!(region.dma_write(|_| {}).is_err());
    }
}
