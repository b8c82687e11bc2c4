//! Integration test: frame pacing, staging, timestamps and deferred frees
//! driven through `GpuContext` on the headless backend.
//!
//! Run with: cargo test -p sxgpu-render --test frame_pacing_test -- --nocapture

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sxgpu_render::headless::{FenceMode, HeadlessDevice, HeadlessOptions};
use sxgpu_render::{
    BufferUsage, GpuConfig, GpuContext, GpuError, MemoryClass, QueueKind, SlotState, SubmitInfo,
};

fn test_config(frames_in_flight: u32) -> GpuConfig {
    let _ = sxgpu_common::logging::try_init_logging("sxgpu_render=debug");
    let mut config = GpuConfig::default();
    config.frames.frames_in_flight = frames_in_flight;
    config.frames.staging_buffer_size = 256;
    config.frames.fence_timeout_ms = 50;
    config.frames.timestamp_queries = 4;
    config.bindless.buffer_capacity = 32;
    config.bindless.image_capacity = 8;
    config.bindless.acceleration_structure_capacity = 4;
    config
}

fn context(fence_mode: FenceMode, config: GpuConfig) -> (Arc<HeadlessDevice>, GpuContext) {
    let device = Arc::new(HeadlessDevice::with_options(HeadlessOptions {
        fence_mode,
        ..Default::default()
    }));
    let ctx = GpuContext::new(device.clone(), config).expect("context");
    (device, ctx)
}

/// Record and submit an empty frame on `queue`, then advance.
fn run_frame(ctx: &mut GpuContext, queue: QueueKind) {
    ctx.begin_frame(queue).expect("begin");
    ctx.end_frame(&SubmitInfo::default()).expect("end");
    ctx.next_frame().expect("next frame");
}

#[test]
fn test_slots_cycle_with_frame_number() {
    let (device, mut ctx) = context(FenceMode::Immediate, test_config(3));

    for frame in 0..7u64 {
        assert_eq!(ctx.frame(), frame);
        ctx.begin_frame(QueueKind::Graphics).unwrap();
        let slot = ctx.queues().slot_for_frame(frame);
        assert_eq!(ctx.slot_state(QueueKind::Graphics, slot), Some(SlotState::Recording));
        ctx.end_frame(&SubmitInfo::default()).unwrap();
        assert_eq!(ctx.slot_state(QueueKind::Graphics, slot), Some(SlotState::Submitted));
        ctx.next_frame().unwrap();
        assert_eq!(ctx.slot_state(QueueKind::Graphics, slot), Some(SlotState::Retired));
    }

    let submissions = device.submissions();
    assert_eq!(submissions.len(), 7);
    // Frames 0, 3 and 6 share a command buffer.
    assert_eq!(submissions[0].command_buffer, submissions[3].command_buffer);
    assert_eq!(submissions[3].command_buffer, submissions[6].command_buffer);
    assert_ne!(submissions[0].command_buffer, submissions[1].command_buffer);
    println!("7 frames over 3 slots");
}

#[test]
fn test_stalled_gpu_times_out_as_device_lost() {
    let (device, mut ctx) = context(FenceMode::Manual, test_config(3));

    for _ in 0..3 {
        run_frame(&mut ctx, QueueKind::Graphics);
    }
    assert_eq!(device.pending_fences().len(), 3);

    // Frame 3 reuses slot 0, whose work never finished.
    match ctx.begin_frame(QueueKind::Graphics) {
        Err(GpuError::DeviceLost(msg)) => println!("device lost as expected: {}", msg),
        other => panic!("expected DeviceLost, got {:?}", other),
    }
    assert!(ctx.queues().current_queue().is_none());

    // Once the GPU catches up the same frame can proceed.
    let first = device.submissions()[0].fence;
    device.signal_fence(first);
    ctx.begin_frame(QueueKind::Graphics).unwrap();
    ctx.end_frame(&SubmitInfo::default()).unwrap();
    assert_eq!(device.submissions().len(), 4);
    assert_eq!(device.submissions()[3].fence, first);
}

#[test]
fn test_begin_waits_for_signal_from_another_thread() {
    let mut config = test_config(2);
    config.frames.fence_timeout_ms = 5_000;
    let (device, mut ctx) = context(FenceMode::Manual, config);

    run_frame(&mut ctx, QueueKind::Compute);
    run_frame(&mut ctx, QueueKind::Compute);
    let fence = device.submissions()[0].fence;

    let signaler = {
        let device = device.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            device.signal_fence(fence);
        })
    };
    ctx.begin_frame(QueueKind::Compute).unwrap();
    signaler.join().unwrap();
    ctx.end_frame(&SubmitInfo::default()).unwrap();
}

#[test]
fn test_reentrant_recording_rejected() {
    let (_device, mut ctx) = context(FenceMode::Immediate, test_config(2));

    ctx.begin_frame(QueueKind::Graphics).unwrap();
    match ctx.begin_frame(QueueKind::Compute) {
        Err(GpuError::ReentrantRecording { active, requested }) => {
            assert_eq!(active, "graphics");
            assert_eq!(requested, "compute");
        }
        other => panic!("expected ReentrantRecording, got {:?}", other),
    }
    assert!(matches!(
        ctx.begin_frame(QueueKind::Graphics),
        Err(GpuError::ReentrantRecording { .. })
    ));
    ctx.end_frame(&SubmitInfo::default()).unwrap();

    assert!(matches!(
        ctx.end_frame(&SubmitInfo::default()),
        Err(GpuError::InvalidState(_))
    ));
    assert!(matches!(ctx.stage(&[1, 2, 3], 1), Err(GpuError::InvalidState(_))));
}

#[test]
fn test_staging_overflow_keeps_offset() {
    let (device, mut ctx) = context(FenceMode::Immediate, test_config(2));

    ctx.begin_frame(QueueKind::Transfer).unwrap();
    let first = ctx.stage(&[7u8; 200], 1).unwrap();
    assert_eq!((first.offset, first.size), (0, 200));

    match ctx.stage(&[0u8; 100], 1) {
        Err(GpuError::StagingOverflow { requested, remaining }) => {
            assert_eq!(requested, 100);
            assert_eq!(remaining, 56);
        }
        other => panic!("expected StagingOverflow, got {:?}", other),
    }
    assert_eq!(ctx.record_into(|r| r.staging_offset()).unwrap(), 200);

    let values: [u32; 4] = [1, 2, 3, 4];
    let pod = ctx.stage_pod(&values).unwrap();
    assert_eq!(pod.offset, 200);
    assert_eq!(pod.size, 16);
    let bytes = device.read_buffer(pod.buffer, pod.offset, 16).unwrap();
    assert_eq!(bytes, bytemuck::cast_slice::<u32, u8>(&values));
    assert_eq!(device.read_buffer(first.buffer, 0, 4).unwrap(), vec![7; 4]);
    ctx.end_frame(&SubmitInfo::default()).unwrap();
    ctx.next_frame().unwrap();

    // Each recording starts from an empty staging buffer.
    ctx.begin_frame(QueueKind::Transfer).unwrap();
    assert_eq!(ctx.record_into(|r| r.staging_offset()).unwrap(), 0);
    ctx.end_frame(&SubmitInfo::default()).unwrap();
}

#[test]
fn test_timestamp_table() {
    let (_device, mut ctx) = context(FenceMode::Immediate, test_config(2));

    ctx.begin_frame(QueueKind::Graphics).unwrap();
    ctx.record_into(|r| -> Result<(), GpuError> {
        let shadow = r.begin_timestamp("shadow pass")?;
        r.end_timestamp(shadow)?;
        Ok(())
    })
    .unwrap()
    .unwrap();
    ctx.end_frame(&SubmitInfo::default()).unwrap();
    ctx.next_frame().unwrap();

    ctx.begin_frame(QueueKind::Compute).unwrap();
    ctx.end_frame(&SubmitInfo::default()).unwrap();
    ctx.wait_idle().unwrap();

    let table = ctx.timestamp_results();
    for (name, ms) in table {
        println!("  {:<12} {:.6} ms", name, ms);
    }
    // Headless timestamps advance 1000 ticks per write at 1ns per tick.
    assert!((table["shadow pass"] - 0.001).abs() < 1e-9);
    assert!((table["graphics"] - 0.003).abs() < 1e-9);
    assert!((table["compute"] - 0.001).abs() < 1e-9);
}

#[test]
fn test_unended_timestamp_keeps_frame_results() {
    let (_device, mut ctx) = context(FenceMode::Immediate, test_config(2));

    ctx.begin_frame(QueueKind::Graphics).unwrap();
    ctx.record_into(|r| r.begin_timestamp("lighting").map(|_| ()))
        .unwrap()
        .unwrap();
    ctx.end_frame(&SubmitInfo::default()).unwrap();
    ctx.wait_idle().unwrap();

    let table = ctx.timestamp_results();
    println!("{:?}", table);
    // graphics begin, lighting begin, lighting closed at submit, graphics end.
    assert!((table["lighting"] - 0.001).abs() < 1e-9);
    assert!((table["graphics"] - 0.003).abs() < 1e-9);
}

#[test]
fn test_timestamp_pool_exhaustion() {
    let (_device, mut ctx) = context(FenceMode::Immediate, test_config(2));

    ctx.begin_frame(QueueKind::Graphics).unwrap();
    // One interval is taken by the whole-buffer timing.
    let result = ctx
        .record_into(|r| {
            let mut opened = Vec::new();
            for i in 0..4 {
                match r.begin_timestamp(&format!("pass {}", i)) {
                    Ok(id) => opened.push(id),
                    Err(e) => return (opened.len(), Some(e)),
                }
            }
            (opened.len(), None)
        })
        .unwrap();
    assert_eq!(result.0, 3);
    assert!(matches!(result.1, Some(GpuError::QueryPoolExhausted { capacity: 4 })));
    ctx.end_frame(&SubmitInfo::default()).unwrap();
}

#[test]
fn test_submit_info_semaphores_forwarded() {
    use ash::vk::{self, Handle};

    let (device, mut ctx) = context(FenceMode::Immediate, test_config(2));
    ctx.begin_frame(QueueKind::Graphics).unwrap();
    let info = SubmitInfo::default()
        .wait(vk::Semaphore::from_raw(900), vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .signal(vk::Semaphore::from_raw(901));
    ctx.end_frame(&info).unwrap();

    let submission = &device.submissions()[0];
    assert_eq!(submission.queue, QueueKind::Graphics);
    assert_eq!(submission.wait_semaphores, 1);
    assert_eq!(submission.signal_semaphores, 1);
}

#[test]
fn test_lagging_gpu_postpones_frees() {
    let (device, mut ctx) = context(FenceMode::Manual, test_config(3));
    let freed = Arc::new(AtomicUsize::new(0));

    ctx.begin_frame(QueueKind::Graphics).unwrap();
    ctx.end_frame(&SubmitInfo::default()).unwrap();
    let counter = freed.clone();
    ctx.submit_resource_free("scratch", move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    for _ in 0..4 {
        ctx.next_frame().unwrap();
    }
    // Frame 0 is still executing, so its frees must wait.
    assert_eq!(freed.load(Ordering::SeqCst), 0);
    assert_eq!(ctx.pending_frees(), 1);

    device.signal_all();
    ctx.next_frame().unwrap();
    assert_eq!(freed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_open_recording_postpones_frees() {
    let (device, mut ctx) = context(FenceMode::Immediate, test_config(3));

    ctx.begin_frame(QueueKind::Graphics).unwrap();
    let buffer = ctx
        .create_buffer(256, BufferUsage::STORAGE, MemoryClass::GpuOnly, "bound in frame 0")
        .unwrap();
    let raw = buffer.handle();
    ctx.destroy(buffer);

    // The frame 0 command buffer is still open and may reference the buffer.
    for _ in 0..3 {
        ctx.next_frame().unwrap();
    }
    assert!(device.buffer_exists(raw));
    assert_eq!(ctx.pending_frees(), 1);

    ctx.end_frame(&SubmitInfo::default()).unwrap();
    assert!(device.buffer_exists(raw));

    ctx.next_frame().unwrap();
    assert!(!device.buffer_exists(raw));
    assert_eq!(ctx.pending_frees(), 0);
}

#[test]
fn test_wait_idle_flushes_everything() {
    let (device, mut ctx) = context(FenceMode::Manual, test_config(3));
    let baseline = device.destroyed_buffers();

    ctx.begin_frame(QueueKind::Graphics).unwrap();
    ctx.end_frame(&SubmitInfo::default()).unwrap();
    let buffer = ctx
        .create_buffer(64, BufferUsage::STORAGE, MemoryClass::GpuOnly, "frame data")
        .unwrap();
    ctx.destroy(buffer);

    ctx.wait_idle().unwrap();
    assert_eq!(ctx.pending_frees(), 0);
    assert_eq!(device.destroyed_buffers(), baseline + 1);
    assert!(device.pending_fences().is_empty());
}

#[test]
fn test_next_frame_while_recording_keeps_recording() {
    let (_device, mut ctx) = context(FenceMode::Immediate, test_config(2));
    ctx.begin_frame(QueueKind::Graphics).unwrap();
    ctx.next_frame().unwrap();
    assert_eq!(ctx.queues().current_queue(), Some(QueueKind::Graphics));
    ctx.end_frame(&SubmitInfo::default()).unwrap();
}
