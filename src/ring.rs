use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::contract::{Fence, OrchestrationError, Result};
use crate::resource::{GpuAddress, MemoryServices, ResourceHandle, ResourceSpec};
use crate::status::STATUS_RECORD_BYTES;

pub const DMEM_BYTES: usize = 64;
pub const PASS_STATS_BYTES: u32 = 16;
pub const TILE_STATS_BYTES: u32 = 16;
pub const MAX_TILES: usize = 22 * 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotIndex(pub usize);

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot{}", self.0)
    }
}

/// Per-frame buffers recycled through the ring.
#[derive(Debug, Clone)]
pub struct SlotResources {
    pub brc_init_dmem: ResourceHandle,
    pub brc_update_dmem: Vec<ResourceHandle>,
    /// Firmware-written second level batch carrying the picture QP, per pass.
    pub second_level_batch: Vec<ResourceHandle>,
    /// HuC status and re-encode mask, read by conditional batch ends.
    pub pak_mmio: ResourceHandle,
    /// Per-pass frame size and SSE.
    pub pak_stats: ResourceHandle,
    pub tile_stats: ResourceHandle,
    pub integrate_dmem: ResourceHandle,
    pub status_record: ResourceHandle,
}

impl SlotResources {
    pub fn allocate(memory: &dyn MemoryServices, index: usize, max_passes: u8) -> Result<Self> {
        let spec = |what: &str, size: usize| ResourceSpec::new(format!("{what}[{index}]"), size);
        let passes = usize::from(max_passes.max(1));
        let mut brc_update_dmem = Vec::with_capacity(passes);
        let mut second_level_batch = Vec::with_capacity(passes);
        for pass in 0..passes {
            brc_update_dmem.push(memory.allocate(&spec(&format!("brc_update_dmem.{pass}"), DMEM_BYTES))?);
            second_level_batch.push(memory.allocate(&spec(&format!("slbb.{pass}"), 16))?);
        }
        Ok(Self {
            brc_init_dmem: memory.allocate(&spec("brc_init_dmem", DMEM_BYTES))?,
            brc_update_dmem,
            second_level_batch,
            pak_mmio: memory.allocate(&spec("pak_mmio", 16))?,
            pak_stats: memory.allocate(&spec("pak_stats", passes * PASS_STATS_BYTES as usize))?,
            tile_stats: memory.allocate(&spec("tile_stats", MAX_TILES * TILE_STATS_BYTES as usize))?,
            integrate_dmem: memory.allocate(&spec("integrate_dmem", DMEM_BYTES))?,
            status_record: memory.allocate(&spec("status", STATUS_RECORD_BYTES))?,
        })
    }

    pub fn pass_stats(&self, pass: u8) -> GpuAddress {
        GpuAddress::new(self.pak_stats, u32::from(pass) * PASS_STATS_BYTES)
    }

    pub fn tile_stats(&self, tile: u32) -> GpuAddress {
        GpuAddress::new(self.tile_stats, tile * TILE_STATS_BYTES)
    }

    pub fn convergence(&self) -> GpuAddress {
        GpuAddress::new(self.pak_mmio, 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSnapshot {
    pub in_flight: usize,
    pub capacity: usize,
    pub next: SlotIndex,
}

#[derive(Debug)]
struct RingState {
    next: usize,
    in_flight: Vec<bool>,
    fences: Vec<Option<Fence>>,
}

/// Fixed ring of per-frame slots. Slots are handed out strictly in
/// `(previous + 1) mod N` order and at most N are in flight.
#[derive(Debug)]
pub struct ResourceRing<T> {
    slots: Vec<T>,
    state: Mutex<RingState>,
    released: Condvar,
}

impl<T> ResourceRing<T> {
    pub fn new(slots: Vec<T>) -> Result<Self> {
        if slots.is_empty() {
            return Err(OrchestrationError::InvalidConfiguration(
                "resource ring needs at least one slot".to_string(),
            ));
        }
        let n = slots.len();
        Ok(Self {
            slots,
            state: Mutex::new(RingState {
                next: 0,
                in_flight: vec![false; n],
                fences: vec![None; n],
            }),
            released: Condvar::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn lock(&self) -> Result<MutexGuard<'_, RingState>> {
        self.state
            .lock()
            .map_err(|_| OrchestrationError::Collaborator("resource ring poisoned".to_string()))
    }

    fn take_next(&self, state: &mut RingState) -> Option<SlotIndex> {
        let index = state.next;
        if state.in_flight[index] {
            return None;
        }
        state.in_flight[index] = true;
        state.next = (index + 1) % self.slots.len();
        Some(SlotIndex(index))
    }

    pub fn try_acquire(&self) -> Result<SlotIndex> {
        let mut state = self.lock()?;
        self.take_next(&mut state).ok_or_else(|| {
            OrchestrationError::ResourceExhausted(format!(
                "all {} ring slots in flight",
                self.slots.len()
            ))
        })
    }

    pub fn acquire_timeout(&self, timeout: Duration) -> Result<SlotIndex> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock()?;
        loop {
            if let Some(index) = self.take_next(&mut state) {
                return Ok(index);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(OrchestrationError::ResourceExhausted(format!(
                    "no ring slot freed within {timeout:?}"
                )));
            }
            let (guard, _) = self.released.wait_timeout(state, remaining).map_err(|_| {
                OrchestrationError::Collaborator("resource ring poisoned".to_string())
            })?;
            state = guard;
        }
    }

    pub fn release(&self, index: SlotIndex) -> Result<()> {
        let mut state = self.lock()?;
        match state.in_flight.get_mut(index.0) {
            Some(flag) if *flag => *flag = false,
            _ => {
                return Err(OrchestrationError::InvalidConfiguration(format!(
                    "{index} is not in flight"
                )));
            }
        }
        drop(state);
        self.released.notify_all();
        Ok(())
    }

    /// Releases a slot that was never submitted and hands the same index out
    /// again on the next acquisition.
    pub fn abandon(&self, index: SlotIndex) -> Result<()> {
        let mut state = self.lock()?;
        if !state.in_flight.get(index.0).copied().unwrap_or(false) {
            return Err(OrchestrationError::InvalidConfiguration(format!(
                "{index} is not in flight"
            )));
        }
        state.in_flight[index.0] = false;
        if (index.0 + 1) % self.slots.len() == state.next {
            state.next = index.0;
        }
        drop(state);
        self.released.notify_all();
        Ok(())
    }

    pub fn set_fence(&self, index: SlotIndex, fence: Fence) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(slot) = state.fences.get_mut(index.0) {
            *slot = Some(fence);
        }
        Ok(())
    }

    /// Fence of the last submission that used this slot.
    pub fn last_fence(&self, index: SlotIndex) -> Option<Fence> {
        self.lock().ok()?.fences.get(index.0).copied().flatten()
    }

    pub fn get(&self, index: SlotIndex) -> Option<&T> {
        self.slots.get(index.0)
    }

    pub fn snapshot(&self) -> RingSnapshot {
        match self.state.lock() {
            Ok(state) => RingSnapshot {
                in_flight: state.in_flight.iter().filter(|f| **f).count(),
                capacity: self.slots.len(),
                next: SlotIndex(state.next),
            },
            Err(_) => RingSnapshot {
                in_flight: self.slots.len(),
                capacity: self.slots.len(),
                next: SlotIndex(0),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn seventh_acquire_fails_until_release() {
        let ring = ResourceRing::new(vec![(); 6]).unwrap();
        let taken: Vec<_> = (0..6).map(|_| ring.try_acquire().unwrap()).collect();
        assert_eq!(taken, (0..6).map(SlotIndex).collect::<Vec<_>>());
        let err = ring.try_acquire().unwrap_err();
        assert!(err.is_recoverable());
        ring.release(SlotIndex(0)).unwrap();
        assert_eq!(ring.try_acquire().unwrap(), SlotIndex(0));
    }

    #[test]
    fn index_sequence_is_periodic() {
        let ring = ResourceRing::new(vec![(); 3]).unwrap();
        let mut seen = Vec::new();
        for _ in 0..7 {
            let index = ring.try_acquire().unwrap();
            seen.push(index.0);
            ring.release(index).unwrap();
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn releasing_idle_slot_is_rejected() {
        let ring = ResourceRing::new(vec![(); 2]).unwrap();
        assert!(ring.release(SlotIndex(1)).is_err());
        assert!(ring.release(SlotIndex(5)).is_err());
    }

    #[test]
    fn abandon_rewinds_to_same_slot() {
        let ring = ResourceRing::new(vec![(); 4]).unwrap();
        let first = ring.try_acquire().unwrap();
        let second = ring.try_acquire().unwrap();
        ring.abandon(second).unwrap();
        assert_eq!(ring.try_acquire().unwrap(), second);
        assert_eq!(ring.snapshot().in_flight, 2);
        ring.release(first).unwrap();
    }

    #[test]
    fn acquire_timeout_wakes_on_release() {
        let ring = Arc::new(ResourceRing::new(vec![(); 1]).unwrap());
        let held = ring.try_acquire().unwrap();
        let releaser = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                ring.release(held).unwrap();
            })
        };
        let index = ring.acquire_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(index, SlotIndex(0));
        releaser.join().unwrap();
    }

    #[test]
    fn acquire_timeout_expires() {
        let ring = ResourceRing::new(vec![(); 1]).unwrap();
        let _held = ring.try_acquire().unwrap();
        let err = ring.acquire_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, OrchestrationError::ResourceExhausted(_)));
    }

    #[test]
    fn fences_are_remembered_per_slot() {
        let ring = ResourceRing::new(vec![(); 2]).unwrap();
        let index = ring.try_acquire().unwrap();
        assert_eq!(ring.last_fence(index), None);
        ring.set_fence(index, Fence(9)).unwrap();
        ring.release(index).unwrap();
        assert_eq!(ring.last_fence(index), Some(Fence(9)));
    }
}
