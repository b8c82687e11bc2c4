use ash::vk;

use sxgpu_core::{GpuError, GpuResult};

use crate::backend::{RawBuffer, RawCommandSlot};
use crate::queue::SlotState;

// ── Staging ─────────────────────────────────────────────────

/// Byte range handed out from a staging buffer for the current recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingRange {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
}

/// CPU-visible buffer with a bump offset that resets every recording.
#[derive(Debug)]
pub struct StagingBuffer {
    raw: RawBuffer,
    offset: u64,
}

impl StagingBuffer {
    pub fn new(raw: RawBuffer) -> Self {
        Self { raw, offset: 0 }
    }

    /// Reserve `size` bytes at `alignment`. On overflow the offset is left
    /// untouched.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> GpuResult<u64> {
        let align = alignment.max(1);
        let overflow = || GpuError::StagingOverflow {
            requested: size,
            remaining: self.remaining(),
        };
        let start = self
            .offset
            .checked_next_multiple_of(align)
            .ok_or_else(overflow)?;
        let end = start.checked_add(size).ok_or_else(overflow)?;
        if end > self.raw.size {
            return Err(overflow());
        }
        self.offset = end;
        Ok(start)
    }

    pub fn reset(&mut self) {
        self.offset = 0;
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn capacity(&self) -> u64 {
        self.raw.size
    }

    pub fn remaining(&self) -> u64 {
        self.raw.size - self.offset
    }

    pub fn handle(&self) -> vk::Buffer {
        self.raw.handle
    }
}

// ── Timestamps ──────────────────────────────────────────────

/// Index of a named interval within one recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampId(pub(crate) u32);

/// Timestamp query pool with named begin/end intervals. Interval `i` uses
/// queries `2i` and `2i + 1`.
#[derive(Debug)]
pub struct TimestampPool {
    raw: Option<vk::QueryPool>,
    capacity: u32,
    valid_bits: u32,
    names: Vec<String>,
    closed: Vec<bool>,
}

impl TimestampPool {
    pub fn new(raw: Option<vk::QueryPool>, capacity: u32, valid_bits: u32) -> Self {
        Self {
            raw,
            capacity,
            valid_bits,
            names: Vec::new(),
            closed: Vec::new(),
        }
    }

    pub fn raw(&self) -> Option<vk::QueryPool> {
        self.raw
    }

    /// Queries in the pool, two per interval.
    pub fn query_capacity(&self) -> u32 {
        self.capacity * 2
    }

    /// Queries written by the current recording.
    pub fn query_count(&self) -> u32 {
        self.names.len() as u32 * 2
    }

    /// Open an interval. Returns its id and the query index to write.
    pub fn begin(&mut self, name: &str) -> GpuResult<(TimestampId, u32)> {
        if self.raw.is_none() {
            return Err(GpuError::Unsupported(format!(
                "timestamp '{}': queue family has no timestamp support",
                name
            )));
        }
        if self.names.len() as u32 >= self.capacity {
            return Err(GpuError::QueryPoolExhausted {
                capacity: self.capacity,
            });
        }
        let id = self.names.len() as u32;
        self.names.push(name.to_string());
        self.closed.push(false);
        Ok((TimestampId(id), id * 2))
    }

    /// Close an interval. Returns the query index to write.
    pub fn end(&mut self, id: TimestampId) -> GpuResult<u32> {
        match self.closed.get_mut(id.0 as usize) {
            Some(closed) if !*closed => {
                *closed = true;
                Ok(id.0 * 2 + 1)
            }
            Some(_) => Err(GpuError::InvalidState(format!(
                "timestamp '{}' already ended",
                self.names[id.0 as usize]
            ))),
            None => Err(GpuError::InvalidArgument(format!(
                "unknown timestamp id {}",
                id.0
            ))),
        }
    }

    /// Close every open interval except `keep`. Returns each closed name with
    /// the query index to write.
    pub fn close_open(&mut self, keep: Option<TimestampId>) -> Vec<(String, u32)> {
        let keep = keep.map(|id| id.0 as usize);
        self.closed
            .iter_mut()
            .enumerate()
            .filter(|(i, closed)| !**closed && Some(*i) != keep)
            .map(|(i, closed)| {
                *closed = true;
                (self.names[i].clone(), i as u32 * 2 + 1)
            })
            .collect()
    }

    /// Durations in milliseconds for every closed interval, given the raw
    /// query values and the device timestamp period in nanoseconds.
    pub fn durations(&self, values: &[u64], period_ns: f32) -> Vec<(String, f64)> {
        let mask = if self.valid_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.valid_bits) - 1
        };
        self.names
            .iter()
            .zip(&self.closed)
            .enumerate()
            .filter(|(_, (_, closed))| **closed)
            .filter_map(|(i, (name, _))| {
                let begin = *values.get(i * 2)? & mask;
                let end = *values.get(i * 2 + 1)? & mask;
                let ticks = end.wrapping_sub(begin) & mask;
                Some((name.clone(), ticks as f64 * f64::from(period_ns) / 1_000_000.0))
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.names.clear();
        self.closed.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

// ── Per-frame command resources ─────────────────────────────

/// Everything one queue needs for one frame in flight.
#[derive(Debug)]
pub struct CommandResources {
    pub(crate) raw: RawCommandSlot,
    pub(crate) state: SlotState,
    /// Frame of the last submission from this slot
    pub(crate) submitted_frame: Option<u64>,
    pub(crate) staging: StagingBuffer,
    pub(crate) timestamps: TimestampPool,
    /// Interval covering the whole command buffer
    pub(crate) frame_interval: Option<TimestampId>,
}

impl CommandResources {
    pub fn new(raw: RawCommandSlot, timestamp_capacity: u32, timestamp_valid_bits: u32) -> Self {
        Self {
            raw,
            state: SlotState::Idle,
            submitted_frame: None,
            staging: StagingBuffer::new(raw.staging),
            timestamps: TimestampPool::new(raw.query_pool, timestamp_capacity, timestamp_valid_bits),
            frame_interval: None,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.raw.command_buffer
    }

    pub fn fence(&self) -> vk::Fence {
        self.raw.fence
    }

    pub fn staging(&self) -> &StagingBuffer {
        &self.staging
    }

    pub fn submitted_frame(&self) -> Option<u64> {
        self.submitted_frame
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;

    fn staging(size: u64) -> StagingBuffer {
        StagingBuffer::new(RawBuffer {
            handle: vk::Buffer::from_raw(1),
            size,
            device_address: None,
        })
    }

    #[test]
    fn staging_allocates_aligned_ranges() {
        let mut s = staging(256);
        assert_eq!(s.allocate(10, 1).unwrap(), 0);
        assert_eq!(s.allocate(16, 16).unwrap(), 16);
        assert_eq!(s.offset(), 32);
        assert_eq!(s.remaining(), 224);
        s.reset();
        assert_eq!(s.offset(), 0);
    }

    #[test]
    fn staging_overflow_leaves_offset() {
        let mut s = staging(100);
        s.allocate(60, 1).unwrap();
        match s.allocate(41, 1) {
            Err(GpuError::StagingOverflow { requested, remaining }) => {
                assert_eq!(requested, 41);
                assert_eq!(remaining, 40);
            }
            other => panic!("expected StagingOverflow, got {:?}", other),
        }
        assert_eq!(s.offset(), 60);
        // Alignment padding can push an otherwise fitting request over.
        assert!(s.allocate(40, 64).is_err());
        assert_eq!(s.offset(), 60);
        assert_eq!(s.allocate(40, 4).unwrap(), 60);
        assert_eq!(s.remaining(), 0);
    }

    #[test]
    fn timestamp_intervals() {
        let mut pool = TimestampPool::new(Some(vk::QueryPool::from_raw(7)), 2, 64);
        let (a, qa) = pool.begin("shadow").unwrap();
        let (b, qb) = pool.begin("gbuffer").unwrap();
        assert_eq!((qa, qb), (0, 2));
        assert!(matches!(
            pool.begin("extra"),
            Err(GpuError::QueryPoolExhausted { capacity: 2 })
        ));
        assert_eq!(pool.end(a).unwrap(), 1);
        assert!(pool.end(a).is_err());
        let _ = b;

        // Period of 2ns per tick: 1_000_000 ticks = 2 ms. Unclosed intervals are skipped.
        let values = [1_000, 1_001_000, 5, 0];
        let durations = pool.durations(&values, 2.0);
        assert_eq!(durations.len(), 1);
        assert_eq!(durations[0].0, "shadow");
        assert!((durations[0].1 - 2.0).abs() < 1e-9);
    }

    #[test]
    fn close_open_skips_kept_and_closed_intervals() {
        let mut pool = TimestampPool::new(Some(vk::QueryPool::from_raw(3)), 4, 64);
        let (frame, _) = pool.begin("graphics").unwrap();
        let (done, _) = pool.begin("done").unwrap();
        pool.end(done).unwrap();
        pool.begin("dangling").unwrap();

        let closed = pool.close_open(Some(frame));
        assert_eq!(closed, vec![("dangling".to_string(), 5)]);
        assert!(pool.close_open(Some(frame)).is_empty());
        // The kept interval is still open and can be ended normally.
        assert_eq!(pool.end(frame).unwrap(), 1);
    }

    #[test]
    fn timestamps_unsupported_without_pool() {
        let mut pool = TimestampPool::new(None, 4, 0);
        assert!(matches!(pool.begin("copy"), Err(GpuError::Unsupported(_))));
    }

    #[test]
    fn timestamp_valid_bits_wrap() {
        let mut pool = TimestampPool::new(Some(vk::QueryPool::from_raw(1)), 1, 8);
        let (id, _) = pool.begin("wrap").unwrap();
        pool.end(id).unwrap();
        // 250 -> 4 wraps through 256.
        let durations = pool.durations(&[250, 4], 1_000_000.0);
        assert!((durations[0].1 - 10.0).abs() < 1e-9);
    }
}
