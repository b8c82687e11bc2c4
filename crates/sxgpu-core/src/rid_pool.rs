use std::fmt;

use bitvec::vec::BitVec;
use tracing::{error, trace};

use crate::config::BindlessConfig;
use crate::error::{GpuError, GpuResult};

/// The three bindless tables a slot can index into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SlotKind {
    Buffer,
    Image,
    AccelerationStructure,
}

impl SlotKind {
    pub const ALL: [SlotKind; 3] = [
        SlotKind::Buffer,
        SlotKind::Image,
        SlotKind::AccelerationStructure,
    ];

    pub fn index(self) -> usize {
        match self {
            SlotKind::Buffer => 0,
            SlotKind::Image => 1,
            SlotKind::AccelerationStructure => 2,
        }
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SlotKind::Buffer => "buffer",
            SlotKind::Image => "image",
            SlotKind::AccelerationStructure => "acceleration structure",
        })
    }
}

/// Free list for one kind. Never-used ids are handed out from `next`,
/// released ids are recycled LIFO. `live` tracks which ids are out.
struct SlotFreeList {
    kind: SlotKind,
    capacity: u32,
    next: u32,
    recycled: Vec<u32>,
    live: BitVec,
}

impl SlotFreeList {
    fn new(kind: SlotKind, capacity: u32) -> Self {
        Self {
            kind,
            capacity,
            next: 0,
            recycled: Vec::new(),
            live: BitVec::repeat(false, capacity as usize),
        }
    }

    fn acquire(&mut self) -> GpuResult<u32> {
        let id = match self.recycled.pop() {
            Some(id) => id,
            None if self.next < self.capacity => {
                let id = self.next;
                self.next += 1;
                id
            }
            None => {
                return Err(GpuError::PoolExhausted {
                    kind: self.kind,
                    capacity: self.capacity,
                })
            }
        };
        debug_assert!(!self.live[id as usize], "free list yielded a live {} slot", self.kind);
        self.live.set(id as usize, true);
        Ok(id)
    }

    fn release(&mut self, id: u32) -> GpuResult<()> {
        if id >= self.capacity {
            return Err(GpuError::InvalidArgument(format!(
                "{} slot {} out of range (capacity {})",
                self.kind, id, self.capacity
            )));
        }
        if !self.live[id as usize] {
            error!("double release of {} slot {}", self.kind, id);
            return Err(GpuError::InvalidState(format!(
                "{} slot {} is not in use",
                self.kind, id
            )));
        }
        self.live.set(id as usize, false);
        self.recycled.push(id);
        Ok(())
    }

    fn in_use(&self) -> u32 {
        self.next - self.recycled.len() as u32
    }
}

/// Fixed-capacity identifier pools for the bindless descriptor tables.
///
/// Ids are opaque; reuse order is unspecified. Callers must only release an
/// id once the resource that held it can no longer be referenced by in-flight
/// GPU work, which the deferred destruction queue takes care of.
pub struct ResourceIdPool {
    lists: [SlotFreeList; 3],
}

impl ResourceIdPool {
    pub fn new(buffer_capacity: u32, image_capacity: u32, acceleration_structure_capacity: u32) -> Self {
        Self {
            lists: [
                SlotFreeList::new(SlotKind::Buffer, buffer_capacity),
                SlotFreeList::new(SlotKind::Image, image_capacity),
                SlotFreeList::new(SlotKind::AccelerationStructure, acceleration_structure_capacity),
            ],
        }
    }

    pub fn from_config(config: &BindlessConfig) -> Self {
        Self::new(
            config.buffer_capacity,
            config.image_capacity,
            config.acceleration_structure_capacity,
        )
    }

    /// Take a free id for `kind`.
    pub fn acquire(&mut self, kind: SlotKind) -> GpuResult<u32> {
        let id = self.lists[kind.index()].acquire()?;
        trace!("acquired {} slot {}", kind, id);
        Ok(id)
    }

    /// Return `id` to the free list. Releasing an id that is not out is an error.
    pub fn release(&mut self, kind: SlotKind, id: u32) -> GpuResult<()> {
        self.lists[kind.index()].release(id)?;
        trace!("released {} slot {}", kind, id);
        Ok(())
    }

    pub fn is_live(&self, kind: SlotKind, id: u32) -> bool {
        self.lists[kind.index()]
            .live
            .get(id as usize)
            .map(|bit| *bit)
            .unwrap_or(false)
    }

    pub fn capacity(&self, kind: SlotKind) -> u32 {
        self.lists[kind.index()].capacity
    }

    pub fn in_use(&self, kind: SlotKind) -> u32 {
        self.lists[kind.index()].in_use()
    }

    pub fn available(&self, kind: SlotKind) -> u32 {
        self.capacity(kind) - self.in_use(kind)
    }
}

impl Default for ResourceIdPool {
    fn default() -> Self {
        Self::from_config(&BindlessConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::Rng;

    use super::*;

    #[test]
    fn acquire_until_exhausted() {
        let mut pool = ResourceIdPool::new(4, 1, 1);
        let mut seen = HashSet::new();
        for _ in 0..4 {
            let id = pool.acquire(SlotKind::Buffer).unwrap();
            assert!(id < 4);
            assert!(seen.insert(id));
        }
        match pool.acquire(SlotKind::Buffer) {
            Err(GpuError::PoolExhausted { kind, capacity }) => {
                assert_eq!(kind, SlotKind::Buffer);
                assert_eq!(capacity, 4);
            }
            other => panic!("expected PoolExhausted, got {:?}", other),
        }
        // Other kinds are independent.
        assert!(pool.acquire(SlotKind::Image).is_ok());
        assert_eq!(pool.available(SlotKind::Buffer), 0);
    }

    #[test]
    fn released_id_becomes_eligible() {
        let mut pool = ResourceIdPool::new(1, 1, 1);
        let id = pool.acquire(SlotKind::Image).unwrap();
        assert!(pool.acquire(SlotKind::Image).is_err());
        pool.release(SlotKind::Image, id).unwrap();
        assert!(!pool.is_live(SlotKind::Image, id));
        let again = pool.acquire(SlotKind::Image).unwrap();
        assert_eq!(again, id);
    }

    #[test]
    fn double_release_is_rejected() {
        let mut pool = ResourceIdPool::new(8, 8, 8);
        let id = pool.acquire(SlotKind::AccelerationStructure).unwrap();
        pool.release(SlotKind::AccelerationStructure, id).unwrap();
        let err = pool.release(SlotKind::AccelerationStructure, id).unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(_)));
        let err = pool.release(SlotKind::AccelerationStructure, 99).unwrap_err();
        assert!(matches!(err, GpuError::InvalidArgument(_)));
    }

    #[test]
    fn random_churn_never_hands_out_live_ids() {
        let mut rng = rand::thread_rng();
        let mut pool = ResourceIdPool::new(64, 64, 64);
        let mut held: Vec<u32> = Vec::new();
        let mut live = HashSet::new();

        for _ in 0..10_000 {
            if !held.is_empty() && (rng.gen_bool(0.45) || held.len() == 64) {
                let idx = rng.gen_range(0..held.len());
                let id = held.swap_remove(idx);
                live.remove(&id);
                pool.release(SlotKind::Buffer, id).unwrap();
            } else {
                let id = pool.acquire(SlotKind::Buffer).unwrap();
                assert!(id < 64);
                assert!(live.insert(id), "slot {} handed out twice", id);
                held.push(id);
            }
            assert_eq!(pool.in_use(SlotKind::Buffer) as usize, held.len());
        }
    }
}
