//! Allocation, mapping and upload against a real device.

use std::sync::Arc;

use rendergraph_gpu::{vk, BufferDesc, Fence, GpuError, ImageDesc, MemoryPolicy};
use rendergraph_test::try_headless;
use serial_test::serial;

#[test]
#[serial]
fn allocations_are_returned_when_resources_drop() {
    let Some(harness) = try_headless() else { return };
    let allocator = harness.ctx.allocator();
    let before = allocator.live_allocations();

    let buffer = allocator
        .allocate_buffer(
            &BufferDesc::new(1024, vk::BufferUsageFlags::STORAGE_BUFFER),
            &MemoryPolicy::device_local(),
        )
        .unwrap();
    let image = allocator
        .allocate_image(
            &ImageDesc::new_2d(
                16,
                16,
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageUsageFlags::SAMPLED,
            ),
            &MemoryPolicy::device_local(),
        )
        .unwrap();
    assert_eq!(allocator.live_allocations(), before + 2);

    drop(buffer);
    drop(image);
    assert_eq!(allocator.live_allocations(), before);
}

#[test]
#[serial]
fn mapping_is_exclusive() {
    let Some(harness) = try_headless() else { return };
    let buffer = harness
        .ctx
        .allocator()
        .allocate_buffer(
            &BufferDesc::new(64, vk::BufferUsageFlags::UNIFORM_BUFFER),
            &MemoryPolicy::host_visible(),
        )
        .unwrap();

    let mut mapping = buffer.map().unwrap();
    assert!(buffer.is_mapped());
    assert!(matches!(buffer.map(), Err(GpuError::AlreadyMapped)));
    mapping.write(0, &[1u32, 2, 3, 4]).unwrap();
    assert!(matches!(
        mapping.write(60, &[0u32, 0]),
        Err(GpuError::MapOutOfBounds { .. })
    ));
    drop(mapping);

    assert!(!buffer.is_mapped());
    assert!(matches!(buffer.unmap(), Err(GpuError::NotMapped)));
    assert_eq!(&buffer.read_vec::<u32>().unwrap()[..4], &[1, 2, 3, 4]);
}

#[test]
#[serial]
fn device_only_memory_refuses_host_access_policy() {
    let Some(harness) = try_headless() else { return };
    let policy = MemoryPolicy {
        host_access: true,
        ..MemoryPolicy::device_local()
    };
    let err = harness
        .ctx
        .allocator()
        .allocate_buffer(
            &BufferDesc::new(64, vk::BufferUsageFlags::STORAGE_BUFFER),
            &policy,
        )
        .unwrap_err();
    assert!(matches!(err, GpuError::Allocation(_)));
}

#[test]
#[serial]
fn uploaded_buffer_round_trips_through_readback() {
    let Some(harness) = try_headless() else { return };
    let ctx = &harness.ctx;
    let data: Vec<u32> = (0..256).collect();
    let uploaded = rendergraph_gpu::upload::upload_buffer(
        ctx,
        &harness.pool,
        vk::BufferUsageFlags::TRANSFER_SRC,
        &data,
    )
    .unwrap();

    let readback = ctx
        .allocator()
        .allocate_buffer(
            &BufferDesc::new(uploaded.size(), vk::BufferUsageFlags::TRANSFER_DST),
            &MemoryPolicy::readback(),
        )
        .unwrap();
    rendergraph_gpu::execute_one_time(&harness.pool, |cmd| {
        cmd.copy_buffer(&uploaded, &readback, uploaded.size())
    })
    .unwrap();

    assert_eq!(readback.read_vec::<u32>().unwrap(), data);
}

#[test]
#[serial]
fn uploaded_texture_ends_shader_readable() {
    let Some(harness) = try_headless() else { return };
    let pixels = vec![255u8; 4 * 4 * 4];
    let image =
        rendergraph_gpu::upload::upload_image_rgba8(&harness.ctx, &harness.pool, 4, 4, &pixels)
            .unwrap();
    assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

    let err = rendergraph_gpu::upload::upload_image_rgba8(
        &harness.ctx,
        &harness.pool,
        4,
        4,
        &pixels[..10],
    )
    .unwrap_err();
    assert!(matches!(err, GpuError::InvalidState(_)));
}

#[test]
#[serial]
fn storage_buffer_of_hundred_floats_maps_once() {
    let Some(harness) = try_headless() else { return };
    let buffer = harness
        .ctx
        .allocator()
        .allocate_buffer(
            &BufferDesc::new(400, vk::BufferUsageFlags::STORAGE_BUFFER),
            &MemoryPolicy::host_visible(),
        )
        .unwrap();
    let values: Vec<f32> = (0..100u8).map(f32::from).collect();

    let mut mapping = buffer.map().unwrap();
    assert_eq!(mapping.len(), 400);
    mapping.write(0, &values).unwrap();
    assert_eq!(mapping.as_slice::<f32>(), &values[..]);
    assert!(matches!(buffer.map(), Err(GpuError::AlreadyMapped)));
    assert!(matches!(buffer.map_raw(), Err(GpuError::AlreadyMapped)));
    drop(mapping);

    buffer.map_raw().unwrap();
    assert!(buffer.is_mapped());
    buffer.unmap().unwrap();
    assert!(matches!(buffer.unmap(), Err(GpuError::NotMapped)));
    assert_eq!(buffer.read_vec::<f32>().unwrap(), values);
}

#[test]
#[serial]
fn image_layout_follows_recorded_transitions() {
    let Some(harness) = try_headless() else { return };
    let image = harness
        .ctx
        .allocator()
        .allocate_image(
            &ImageDesc::new_2d(
                16,
                16,
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            ),
            &MemoryPolicy::device_local(),
        )
        .unwrap();
    assert_eq!(image.layout(), vk::ImageLayout::UNDEFINED);

    let mut cmd = harness.pool.allocate_primary().unwrap();
    cmd.begin(true).unwrap();
    for layout in [
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        vk::ImageLayout::PRESENT_SRC_KHR,
    ] {
        let barrier = image.transition_barrier(layout);
        assert_eq!(barrier.image_barriers().len(), 1);
        assert_eq!(barrier.image_barriers()[0].old_layout, image.layout());
        assert_eq!(barrier.image_barriers()[0].new_layout, layout);
        image.transition(&mut cmd, layout).unwrap();
        assert_eq!(image.layout(), layout);
    }
    cmd.end().unwrap();

    let fence = Fence::new(Arc::clone(harness.ctx.device()), false).unwrap();
    cmd.submit(Some(&fence)).unwrap();
    assert!(fence.wait(u64::MAX).unwrap());
    cmd.reset().unwrap();

    image.discard_contents();
    assert_eq!(image.layout(), vk::ImageLayout::UNDEFINED);
    assert_eq!(
        image.transition_barrier(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL).image_barriers()[0].old_layout,
        vk::ImageLayout::UNDEFINED
    );
}
