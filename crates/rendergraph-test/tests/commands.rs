//! Command buffer lifecycle and synchronization on a real queue.

use std::sync::Arc;

use rendergraph_gpu::{
    vk, AccessInfo, BufferDesc, CommandBufferState, Fence, GpuError, GpuResource, MemoryPolicy,
    ResourceBarrier, Semaphore,
};
use rendergraph_test::try_headless;
use serial_test::serial;

#[test]
#[serial]
fn out_of_order_operations_are_rejected() {
    let Some(harness) = try_headless() else { return };
    let mut cmd = harness.pool.allocate_primary().unwrap();
    assert_eq!(cmd.state(), CommandBufferState::Initial);

    assert!(matches!(
        cmd.end(),
        Err(GpuError::InvalidCommandBufferState { .. })
    ));
    assert!(matches!(
        cmd.submit(None),
        Err(GpuError::InvalidCommandBufferState { .. })
    ));

    cmd.begin(false).unwrap();
    assert!(matches!(
        cmd.begin(false),
        Err(GpuError::InvalidCommandBufferState { .. })
    ));
    cmd.end().unwrap();
    assert!(matches!(
        cmd.record(|_, _| {}),
        Err(GpuError::InvalidCommandBufferState { .. })
    ));
    assert_eq!(cmd.state(), CommandBufferState::Executable);
}

#[test]
#[serial]
fn pre_signaled_fence_does_not_block() {
    let Some(harness) = try_headless() else { return };
    let device = Arc::clone(harness.ctx.device());

    let signaled = Fence::new(Arc::clone(&device), true).unwrap();
    assert!(signaled.wait(0).unwrap());
    assert!(signaled.is_signaled().unwrap());

    let unsignaled = Fence::new(device, false).unwrap();
    assert!(!unsignaled.wait(0).unwrap());

    let epoch = signaled.epoch();
    signaled.reset().unwrap();
    assert_eq!(signaled.epoch(), epoch + 1);
    assert!(!signaled.is_signaled().unwrap());
}

#[test]
#[serial]
fn submission_keeps_resources_in_flight_until_reset() {
    let Some(harness) = try_headless() else { return };
    let ctx = &harness.ctx;
    let allocator = ctx.allocator();
    let src = allocator
        .allocate_buffer(
            &BufferDesc::new(256, vk::BufferUsageFlags::TRANSFER_SRC),
            &MemoryPolicy::host_visible(),
        )
        .unwrap();
    let dst = allocator
        .allocate_buffer(
            &BufferDesc::new(256, vk::BufferUsageFlags::TRANSFER_DST),
            &MemoryPolicy::readback(),
        )
        .unwrap();
    src.write_slice(0, &[7u8; 256]).unwrap();

    let signal = Semaphore::new(Arc::clone(ctx.device())).unwrap();
    let mut cmd = harness.pool.allocate_primary().unwrap();
    cmd.begin(true).unwrap();
    cmd.copy_buffer(&src, &dst, 256).unwrap();
    cmd.end().unwrap();
    cmd.insert_signal_semaphore(&signal, vk::PipelineStageFlags2::ALL_COMMANDS)
        .unwrap();

    let fence = Fence::new(Arc::clone(ctx.device()), false).unwrap();
    cmd.submit(Some(&fence)).unwrap();
    assert_eq!(cmd.state(), CommandBufferState::Submitted);
    assert_eq!(src.in_flight().count(), 1);
    assert_eq!(dst.in_flight().count(), 1);
    assert_eq!(signal.in_flight().count(), 1);

    assert!(fence.wait(u64::MAX).unwrap());
    assert!(cmd.is_complete().unwrap());
    cmd.reset().unwrap();
    assert_eq!(cmd.state(), CommandBufferState::Initial);
    assert!(src.in_flight().is_idle());
    assert!(dst.in_flight().is_idle());
    assert!(signal.in_flight().is_idle());
    assert_eq!(cmd.retained_count(), 0);
    assert_eq!(dst.read_vec::<u8>().unwrap(), vec![7u8; 256]);
}

#[test]
#[serial]
fn submitted_buffer_refuses_new_references() {
    let Some(harness) = try_headless() else { return };
    let ctx = &harness.ctx;
    let allocator = ctx.allocator();
    let make_buffer = |usage| {
        allocator
            .allocate_buffer(&BufferDesc::new(64, usage), &MemoryPolicy::device_local())
            .unwrap()
    };
    let src = make_buffer(vk::BufferUsageFlags::TRANSFER_SRC);
    let dst = make_buffer(vk::BufferUsageFlags::TRANSFER_DST);
    let late = make_buffer(vk::BufferUsageFlags::STORAGE_BUFFER);
    let semaphore = Semaphore::new(Arc::clone(ctx.device())).unwrap();

    let mut cmd = harness.pool.allocate_primary().unwrap();
    cmd.begin(true).unwrap();
    cmd.copy_buffer(&src, &dst, 64).unwrap();
    cmd.end().unwrap();
    let fence = Fence::new(Arc::clone(ctx.device()), false).unwrap();
    cmd.submit(Some(&fence)).unwrap();

    assert!(matches!(
        cmd.retain(late.clone()),
        Err(GpuError::InvalidCommandBufferState { .. })
    ));
    assert!(matches!(
        cmd.insert_wait_semaphore(&semaphore, vk::PipelineStageFlags2::ALL_COMMANDS),
        Err(GpuError::InvalidCommandBufferState { .. })
    ));
    assert!(matches!(
        cmd.insert_signal_semaphore(&semaphore, vk::PipelineStageFlags2::ALL_COMMANDS),
        Err(GpuError::InvalidCommandBufferState { .. })
    ));
    assert_eq!(cmd.retained_count(), 2);
    assert_eq!(late.in_flight().count(), 0);

    assert!(fence.wait(u64::MAX).unwrap());
    cmd.reset().unwrap();
    assert_eq!(src.in_flight().count(), 0);
    assert_eq!(dst.in_flight().count(), 0);
    assert_eq!(late.in_flight().count(), 0);
    assert!(semaphore.in_flight().is_idle());

    // A fresh recording may retain it again.
    cmd.begin(true).unwrap();
    cmd.retain(late.clone()).unwrap();
    assert_eq!(cmd.retained_count(), 1);
    cmd.end().unwrap();
}

#[test]
#[serial]
fn submission_without_fence_resets_after_queue_idle() {
    let Some(harness) = try_headless() else { return };
    let mut cmd = harness.pool.allocate_primary().unwrap();
    cmd.begin(true).unwrap();
    cmd.end().unwrap();
    cmd.submit(None).unwrap();
    cmd.reset().unwrap();
    assert_eq!(cmd.state(), CommandBufferState::Initial);
}

#[test]
#[serial]
fn barriers_need_a_recording_buffer() {
    let Some(harness) = try_headless() else { return };
    let buffer = harness
        .ctx
        .allocator()
        .allocate_buffer(
            &BufferDesc::new(64, vk::BufferUsageFlags::STORAGE_BUFFER),
            &MemoryPolicy::device_local(),
        )
        .unwrap();
    let make_barrier = || {
        let mut barrier = ResourceBarrier::default();
        barrier.add_buffer_memory_barrier(
            AccessInfo::new(
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
            ),
            AccessInfo::new(
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_STORAGE_READ,
            ),
            &buffer,
        );
        barrier
    };

    let mut cmd = harness.pool.allocate_primary().unwrap();
    assert!(matches!(
        make_barrier().insert_into_command_buffer(&mut cmd),
        Err(GpuError::InvalidCommandBufferState { .. })
    ));

    cmd.begin(true).unwrap();
    make_barrier().insert_into_command_buffer(&mut cmd).unwrap();
    assert_eq!(cmd.retained_count(), 1);
    ResourceBarrier::default()
        .insert_into_command_buffer(&mut cmd)
        .unwrap();
    cmd.end().unwrap();
}
