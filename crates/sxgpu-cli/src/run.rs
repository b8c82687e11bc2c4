use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, warn};

use sxgpu_render::{
    BufferUsage, GpuBackend, GpuConfig, GpuContext, GpuError, GpuResult, ImageDesc, ImageUsage,
    MemoryClass, MemoryStats, QueueKind, SlotKind, SubmitInfo,
};

/// Bytes uploaded through the staging buffer each frame.
const UPLOAD_BYTES: usize = 4096;

/// Every Nth frame also records on the compute queue.
const COMPUTE_EVERY: u64 = 4;

#[derive(Debug)]
pub struct RunReport {
    pub device: String,
    pub frames: u64,
    pub timestamps: BTreeMap<String, f64>,
    /// Peak (in use, capacity) per bindless table
    pub peak_slots: BTreeMap<SlotKind, (u32, u32)>,
    /// (in use, capacity) per bindless table after shutdown
    pub final_slots: BTreeMap<SlotKind, (u32, u32)>,
    pub leaked: usize,
    /// Allocator state after the last frame, before shutdown
    pub memory: MemoryStats,
}

/// Drive `frames` frames of allocate/stage/record/submit/free on `backend`.
pub fn run_frames(backend: Arc<dyn GpuBackend>, config: GpuConfig, frames: u64) -> anyhow::Result<RunReport> {
    let device = backend.device_info().name.clone();
    let mut ctx = GpuContext::new(backend, config)?;

    let target = ctx.create_buffer(
        UPLOAD_BYTES as u64,
        BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
        MemoryClass::GpuOnly,
        "upload target",
    )?;
    let texture = ctx.create_image(&ImageDesc::new_2d(
        "checker",
        256,
        256,
        vk::Format::R8G8B8A8_UNORM,
        ImageUsage::SAMPLED,
    ))?;
    debug!(
        "persistent resources: buffer slot {}, image slot {}",
        target.slot_id(),
        texture.slot_id()
    );

    let mut peak_slots = BTreeMap::new();
    let payload: Vec<u32> = (0..(UPLOAD_BYTES / 4) as u32).collect();

    for _ in 0..frames {
        let frame = ctx.frame();

        // One transient uniform buffer per frame, freed through the deferred queue.
        let uniforms = ctx.create_buffer(256, BufferUsage::UNIFORM, MemoryClass::CpuVisible, "frame uniforms")?;
        ctx.write_buffer(&uniforms, 0, &frame.to_le_bytes())?;

        ctx.begin_frame(QueueKind::Graphics)?;
        let staged = ctx.stage_pod(&payload)?;
        let dst = target.handle();
        ctx.record_into(|r| -> GpuResult<()> {
            let upload = optional_timestamp(r.begin_timestamp("upload"))?;
            if let Some(device) = r.device() {
                let region = vk::BufferCopy::default()
                    .src_offset(staged.offset)
                    .dst_offset(0)
                    .size(staged.size);
                unsafe { device.cmd_copy_buffer(r.command_buffer(), staged.buffer, dst, &[region]) };
            }
            if let Some(id) = upload {
                r.end_timestamp(id)?;
            }
            Ok(())
        })??;
        ctx.end_frame(&SubmitInfo::default())?;

        if frame % COMPUTE_EVERY == 0 {
            ctx.begin_frame(QueueKind::Compute)?;
            ctx.end_frame(&SubmitInfo::default())?;
        }

        for kind in SlotKind::ALL {
            let usage = ctx.slot_usage(kind);
            let peak = peak_slots.entry(kind).or_insert(usage);
            peak.0 = peak.0.max(usage.0);
        }

        ctx.destroy(uniforms);
        ctx.next_frame()?;
    }

    let memory = ctx.memory_stats();
    ctx.destroy(target);
    ctx.destroy(texture);
    ctx.wait_idle()?;

    let leaked = ctx.live_handles();
    for handle in &leaked {
        warn!("leaked {} handle '{}' (id {})", handle.kind, handle.name, handle.id);
    }

    let final_slots = SlotKind::ALL
        .iter()
        .map(|&kind| (kind, ctx.slot_usage(kind)))
        .collect();

    Ok(RunReport {
        device,
        frames,
        timestamps: ctx.timestamp_results().clone(),
        peak_slots,
        final_slots,
        leaked: leaked.len(),
        memory,
    })
}

/// Queues without timestamp support report `Unsupported`; skip timing there.
fn optional_timestamp<T>(result: GpuResult<T>) -> GpuResult<Option<T>> {
    match result {
        Ok(id) => Ok(Some(id)),
        Err(GpuError::Unsupported(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

impl RunReport {
    pub fn print(&self) {
        println!();
        println!("sxgpu run on '{}': {} frame(s)", self.device, self.frames);
        println!();

        println!("  Timestamps (last completed frame)");
        if self.timestamps.is_empty() {
            println!("    none recorded");
        }
        for (name, ms) in &self.timestamps {
            println!("    {:<16} {:>10.4} ms", name, ms);
        }
        println!();

        println!("  Bindless slots          peak      final   capacity");
        for (kind, (peak, capacity)) in &self.peak_slots {
            let final_use = self.final_slots.get(kind).map(|s| s.0).unwrap_or(0);
            println!(
                "    {:<20} {:>6} {:>10} {:>10}",
                kind.to_string(),
                peak,
                final_use,
                capacity
            );
        }
        println!();

        println!(
            "  Memory: {} allocation(s), {} KiB allocated, {:.1}% of budget",
            self.memory.allocation_count,
            self.memory.allocated_bytes / 1024,
            self.memory.budget_usage() * 100.0
        );
        println!();

        if self.leaked > 0 {
            println!("  {} handle(s) still live at shutdown", self.leaked);
            println!();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sxgpu_render::headless::HeadlessDevice;

    fn small_config() -> GpuConfig {
        let mut config = GpuConfig::default();
        config.frames.staging_buffer_size = 64 * 1024;
        config.bindless.buffer_capacity = 16;
        config.bindless.image_capacity = 4;
        config.bindless.acceleration_structure_capacity = 4;
        config
    }

    #[test]
    fn test_headless_run_releases_every_slot() {
        let device = Arc::new(HeadlessDevice::simple());
        let report = run_frames(device.clone(), small_config(), 10).unwrap();

        assert_eq!(report.frames, 10);
        assert!(report.timestamps.contains_key("graphics"));
        assert!(report.timestamps.contains_key("upload"));
        // Only the storage target holds a buffer slot; uniforms are not bindless.
        assert_eq!(report.peak_slots[&SlotKind::Buffer].0, 1);
        assert_eq!(report.peak_slots[&SlotKind::Image].0, 1);
        assert_eq!(report.final_slots[&SlotKind::Buffer].0, 0);
        assert_eq!(report.final_slots[&SlotKind::Image].0, 0);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(report.leaked, 0);
        // Staging buffers, the target and the texture were live before shutdown.
        assert!(report.memory.allocation_count >= 11);
    }

    #[test]
    fn test_staging_overflow_surfaces_as_error() {
        let mut config = small_config();
        config.frames.staging_buffer_size = 1024;
        let device = Arc::new(HeadlessDevice::simple());
        let err = run_frames(device, config, 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GpuError>(),
            Some(GpuError::StagingOverflow { .. })
        ));
    }
}
