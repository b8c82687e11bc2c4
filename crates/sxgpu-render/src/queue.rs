use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::{debug, error, info, trace, warn};

use sxgpu_core::config::FrameConfig;
use sxgpu_core::{GpuError, GpuResult};

use crate::backend::{CommandSlotDesc, FenceStatus, GpuBackend};
use crate::command::{CommandResources, StagingRange, TimestampId};

/// Hardware queue capability. One logical queue exists per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [QueueKind::Graphics, QueueKind::Compute, QueueKind::Transfer];

    pub fn index(self) -> usize {
        match self {
            QueueKind::Graphics => 0,
            QueueKind::Compute => 1,
            QueueKind::Transfer => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            QueueKind::Graphics => "graphics",
            QueueKind::Compute => "compute",
            QueueKind::Transfer => "transfer",
        }
    }

    pub fn flags(self) -> vk::QueueFlags {
        match self {
            QueueKind::Graphics => vk::QueueFlags::GRAPHICS,
            QueueKind::Compute => vk::QueueFlags::COMPUTE,
            QueueKind::Transfer => vk::QueueFlags::TRANSFER,
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle of one frame-in-flight slot:
/// `Idle -> Recording -> Submitted -> Retired -> Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Recording,
    Submitted,
    Retired,
}

/// Semaphores attached to a submission. Cross-queue ordering is the
/// caller's responsibility.
#[derive(Debug, Clone, Default)]
pub struct SubmitInfo {
    pub wait_semaphores: Vec<(vk::Semaphore, vk::PipelineStageFlags)>,
    pub signal_semaphores: Vec<vk::Semaphore>,
}

impl SubmitInfo {
    pub fn wait(mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) -> Self {
        self.wait_semaphores.push((semaphore, stage));
        self
    }

    pub fn signal(mut self, semaphore: vk::Semaphore) -> Self {
        self.signal_semaphores.push(semaphore);
        self
    }
}

/// Native queue family plus its per-frame command resources.
pub struct InternalQueue {
    pub kind: QueueKind,
    pub family: u32,
    pub commands: Vec<CommandResources>,
}

#[derive(Debug, Clone, Copy)]
struct ActiveRecording {
    kind: QueueKind,
    slot: usize,
    frame: u64,
}

/// Drives the begin/record/submit/retire cycle for the three queues.
///
/// Frame `f` records into slot `f % frames_in_flight` of the chosen queue.
/// Only one queue records at a time.
pub struct QueueManager {
    backend: Arc<dyn GpuBackend>,
    queues: Vec<InternalQueue>,
    frames_in_flight: u32,
    fence_timeout: Duration,
    timestamp_period: f32,
    recording: Option<ActiveRecording>,
    timestamp_table: BTreeMap<String, f64>,
}

impl QueueManager {
    pub fn new(backend: Arc<dyn GpuBackend>, config: &FrameConfig) -> GpuResult<Self> {
        let frames_in_flight = config.frames_in_flight.max(1);
        let timestamp_period = backend.device_info().limits.timestamp_period;
        let mut manager = Self {
            backend: backend.clone(),
            queues: Vec::with_capacity(3),
            frames_in_flight,
            fence_timeout: Duration::from_millis(config.fence_timeout_ms),
            timestamp_period,
            recording: None,
            timestamp_table: BTreeMap::new(),
        };

        let families = backend.queue_families();
        for kind in QueueKind::ALL {
            let family = match kind {
                QueueKind::Graphics => families.graphics,
                QueueKind::Compute => families.compute,
                QueueKind::Transfer => families.transfer,
            };
            let valid_bits = backend
                .device_info()
                .queue_families
                .iter()
                .find(|f| f.index == family)
                .map_or(0, |f| f.timestamp_valid_bits);
            let query_count = if valid_bits > 0 {
                config.timestamp_queries * 2
            } else {
                0
            };

            // Push as we go so a failure part way still destroys what exists.
            manager.queues.push(InternalQueue {
                kind,
                family,
                commands: Vec::with_capacity(frames_in_flight as usize),
            });
            for _ in 0..frames_in_flight {
                let raw = backend.create_command_slot(
                    kind,
                    &CommandSlotDesc {
                        staging_size: config.staging_buffer_size,
                        query_count,
                    },
                )?;
                manager.queues[kind.index()].commands.push(CommandResources::new(
                    raw,
                    config.timestamp_queries,
                    valid_bits,
                ));
            }
            debug!(
                "{} queue: family {}, {} frame slot(s), timestamps {}",
                kind,
                family,
                frames_in_flight,
                if valid_bits > 0 { "on" } else { "off" }
            );
        }

        info!(
            "queue manager ready: {} frames in flight, {} byte staging per slot",
            frames_in_flight, config.staging_buffer_size
        );
        Ok(manager)
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight
    }

    pub fn slot_for_frame(&self, frame: u64) -> usize {
        (frame % u64::from(self.frames_in_flight)) as usize
    }

    /// Queue currently recording, if any.
    pub fn current_queue(&self) -> Option<QueueKind> {
        self.recording.map(|r| r.kind)
    }

    pub fn queue(&self, kind: QueueKind) -> &InternalQueue {
        &self.queues[kind.index()]
    }

    pub fn slot_state(&self, kind: QueueKind, slot: usize) -> Option<SlotState> {
        self.queues[kind.index()].commands.get(slot).map(|c| c.state)
    }

    /// Start recording on `kind` for `frame`. Waits for the slot's previous
    /// submission, harvests its timestamps and resets fence, pool, queries
    /// and staging offset.
    pub fn begin(&mut self, kind: QueueKind, frame: u64) -> GpuResult<()> {
        if let Some(active) = self.recording {
            error!("begin({}) while {} is recording", kind, active.kind);
            return Err(GpuError::ReentrantRecording {
                active: active.kind.to_string(),
                requested: kind.to_string(),
            });
        }

        let slot = self.slot_for_frame(frame);
        let backend = self.backend.as_ref();
        let cmd = &mut self.queues[kind.index()].commands[slot];

        if cmd.state == SlotState::Submitted {
            trace!("{} slot {}: waiting on fence from frame {:?}", kind, slot, cmd.submitted_frame);
            match backend.wait_fence(cmd.raw.fence, self.fence_timeout)? {
                FenceStatus::Signaled => cmd.state = SlotState::Retired,
                FenceStatus::TimedOut => {
                    error!(
                        "{} slot {}: fence from frame {:?} not signaled after {:?}",
                        kind, slot, cmd.submitted_frame, self.fence_timeout
                    );
                    return Err(GpuError::DeviceLost(format!(
                        "{} queue fence wait exceeded {:?}",
                        kind, self.fence_timeout
                    )));
                }
            }
        }
        if cmd.state == SlotState::Retired {
            harvest_timestamps(backend, cmd, self.timestamp_period, &mut self.timestamp_table)?;
        }

        backend.reset_fence(cmd.raw.fence)?;
        backend.reset_command_pool(cmd.raw.pool)?;
        cmd.staging.reset();
        cmd.timestamps.clear();
        cmd.frame_interval = None;
        backend.begin_command_buffer(cmd.raw.command_buffer)?;

        if let Some(pool) = cmd.timestamps.raw() {
            backend.reset_queries(cmd.raw.command_buffer, pool, cmd.timestamps.query_capacity());
            let (id, query) = cmd.timestamps.begin(kind.name())?;
            backend.write_timestamp(cmd.raw.command_buffer, pool, query);
            cmd.frame_interval = Some(id);
        }

        cmd.state = SlotState::Recording;
        self.recording = Some(ActiveRecording { kind, slot, frame });
        trace!("{} slot {}: recording frame {}", kind, slot, frame);
        Ok(())
    }

    /// Run `f` against the active recording.
    pub fn record_into<R>(&mut self, f: impl FnOnce(&mut Recorder<'_>) -> R) -> GpuResult<R> {
        let active = self
            .recording
            .ok_or_else(|| GpuError::InvalidState("no queue is recording".into()))?;
        let mut recorder = Recorder {
            backend: self.backend.as_ref(),
            cmd: &mut self.queues[active.kind.index()].commands[active.slot],
            kind: active.kind,
            frame: active.frame,
        };
        Ok(f(&mut recorder))
    }

    /// Copy `data` into the active staging buffer.
    pub fn stage(&mut self, data: &[u8], alignment: u64) -> GpuResult<StagingRange> {
        self.record_into(|r| r.stage(data, alignment))?
    }

    /// Close the active command buffer and submit it with the slot's fence.
    pub fn end(&mut self, info: &SubmitInfo) -> GpuResult<()> {
        let active = self.recording.take().ok_or_else(|| {
            error!("end() without a matching begin()");
            GpuError::InvalidState("end without begin".into())
        })?;
        let backend = self.backend.as_ref();
        let cmd = &mut self.queues[active.kind.index()].commands[active.slot];

        if let Some(pool) = cmd.timestamps.raw() {
            // Every query read back at retirement must have been written.
            for (name, query) in cmd.timestamps.close_open(cmd.frame_interval) {
                warn!(
                    "{} frame {}: timestamp '{}' never ended, closing it at submit",
                    active.kind, active.frame, name
                );
                backend.write_timestamp(cmd.raw.command_buffer, pool, query);
            }
            if let Some(id) = cmd.frame_interval.take() {
                let query = cmd.timestamps.end(id)?;
                backend.write_timestamp(cmd.raw.command_buffer, pool, query);
            }
        }

        let submitted = backend
            .end_command_buffer(cmd.raw.command_buffer)
            .and_then(|_| backend.submit(active.kind, cmd.raw.command_buffer, cmd.raw.fence, info));
        if let Err(e) = submitted {
            // Nothing reached the queue, so the fence will never signal.
            cmd.state = SlotState::Idle;
            cmd.timestamps.clear();
            error!("{} submit for frame {} failed: {}", active.kind, active.frame, e);
            return Err(e);
        }

        cmd.state = SlotState::Submitted;
        cmd.submitted_frame = Some(active.frame);
        trace!("{} slot {}: submitted frame {}", active.kind, active.slot, active.frame);
        Ok(())
    }

    /// Mark submissions whose fence has signaled as retired. Never blocks.
    pub fn poll_retired(&mut self) -> GpuResult<usize> {
        let backend = self.backend.as_ref();
        let mut retired = 0;
        for cmd in self.queues.iter_mut().flat_map(|q| q.commands.iter_mut()) {
            if cmd.state == SlotState::Submitted && backend.fence_signaled(cmd.raw.fence)? {
                cmd.state = SlotState::Retired;
                retired += 1;
            }
        }
        Ok(retired)
    }

    /// Frame of the oldest work not yet known to have retired. An open
    /// recording counts: it will be submitted under its own frame.
    pub fn oldest_in_flight(&self) -> Option<u64> {
        self.queues
            .iter()
            .flat_map(|q| q.commands.iter())
            .filter(|c| c.state == SlotState::Submitted)
            .filter_map(|c| c.submitted_frame)
            .chain(self.recording.map(|r| r.frame))
            .min()
    }

    /// Block until every queue is idle, then retire and harvest all slots.
    pub fn wait_idle(&mut self) -> GpuResult<()> {
        if let Some(active) = self.recording {
            warn!("wait_idle while {} is still recording", active.kind);
        }
        self.backend.wait_idle()?;
        let backend = self.backend.as_ref();
        for cmd in self.queues.iter_mut().flat_map(|q| q.commands.iter_mut()) {
            if cmd.state == SlotState::Submitted {
                cmd.state = SlotState::Retired;
            }
            if cmd.state == SlotState::Retired {
                harvest_timestamps(backend, cmd, self.timestamp_period, &mut self.timestamp_table)?;
            }
        }
        Ok(())
    }

    /// Latest duration in milliseconds for every named interval.
    pub fn timestamp_results(&self) -> &BTreeMap<String, f64> {
        &self.timestamp_table
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        let busy = self
            .queues
            .iter()
            .flat_map(|q| q.commands.iter())
            .any(|c| c.state == SlotState::Submitted);
        if busy {
            if let Err(e) = self.backend.wait_idle() {
                error!("wait_idle before destroying command slots failed: {}", e);
            }
        }
        for queue in self.queues.drain(..) {
            for cmd in queue.commands {
                self.backend.destroy_command_slot(cmd.raw);
            }
        }
    }
}

fn harvest_timestamps(
    backend: &dyn GpuBackend,
    cmd: &mut CommandResources,
    period: f32,
    table: &mut BTreeMap<String, f64>,
) -> GpuResult<()> {
    if let Some(pool) = cmd.timestamps.raw() {
        if !cmd.timestamps.is_empty() {
            match backend.read_timestamps(pool, cmd.timestamps.query_count())? {
                Some(values) => {
                    for (name, ms) in cmd.timestamps.durations(&values, period) {
                        table.insert(name, ms);
                    }
                }
                None => warn!("timestamps not available after fence signaled, dropping them"),
            }
        }
    }
    cmd.timestamps.clear();
    cmd.state = SlotState::Idle;
    Ok(())
}

/// Access to the command buffer being recorded.
pub struct Recorder<'a> {
    backend: &'a dyn GpuBackend,
    cmd: &'a mut CommandResources,
    kind: QueueKind,
    frame: u64,
}

impl Recorder<'_> {
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.cmd.raw.command_buffer
    }

    pub fn queue(&self) -> QueueKind {
        self.kind
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Native device for recording commands, when the backend has one.
    pub fn device(&self) -> Option<&ash::Device> {
        self.backend.ash_device()
    }

    pub fn staging_buffer(&self) -> vk::Buffer {
        self.cmd.staging.handle()
    }

    pub fn staging_offset(&self) -> u64 {
        self.cmd.staging.offset()
    }

    pub fn staging_remaining(&self) -> u64 {
        self.cmd.staging.remaining()
    }

    /// Reserve a staging range and copy `data` into it. The caller records
    /// the copy out of the returned range.
    pub fn stage(&mut self, data: &[u8], alignment: u64) -> GpuResult<StagingRange> {
        let offset = self.cmd.staging.allocate(data.len() as u64, alignment)?;
        self.backend
            .write_buffer(self.cmd.staging.handle(), offset, data)?;
        Ok(StagingRange {
            buffer: self.cmd.staging.handle(),
            offset,
            size: data.len() as u64,
        })
    }

    pub fn stage_pod<T: bytemuck::Pod>(&mut self, values: &[T]) -> GpuResult<StagingRange> {
        let alignment = std::mem::align_of::<T>() as u64;
        self.stage(bytemuck::cast_slice(values), alignment)
    }

    pub fn begin_timestamp(&mut self, name: &str) -> GpuResult<TimestampId> {
        let (id, query) = self.cmd.timestamps.begin(name)?;
        if let Some(pool) = self.cmd.timestamps.raw() {
            self.backend.write_timestamp(self.cmd.raw.command_buffer, pool, query);
        }
        Ok(id)
    }

    pub fn end_timestamp(&mut self, id: TimestampId) -> GpuResult<()> {
        let query = self.cmd.timestamps.end(id)?;
        if let Some(pool) = self.cmd.timestamps.raw() {
            self.backend.write_timestamp(self.cmd.raw.command_buffer, pool, query);
        }
        Ok(())
    }
}
