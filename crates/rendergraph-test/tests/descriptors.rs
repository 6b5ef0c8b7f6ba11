//! Descriptor layout, pool and set rules on a real device.

use std::sync::Arc;

use rendergraph_gpu::{
    vk, BindingInfo, BufferDesc, DescriptorPool, DescriptorPoolConfig, DescriptorSetLayout,
    GpuError, Logger, MemoryPolicy,
};
use rendergraph_test::try_headless;
use serial_test::serial;

fn storage_binding() -> BindingInfo {
    BindingInfo::new(
        vk::DescriptorType::STORAGE_BUFFER,
        vk::ShaderStageFlags::COMPUTE,
    )
}

#[test]
#[serial]
fn layouts_freeze_on_compile() {
    let Some(harness) = try_headless() else { return };
    let device = Arc::clone(harness.ctx.device());
    let pool = DescriptorPool::new(
        Arc::clone(&device),
        DescriptorPoolConfig::default(),
        Logger::disabled(),
    )
    .unwrap();

    let mut layout =
        DescriptorSetLayout::new(device, vk::DescriptorSetLayoutCreateFlags::empty());
    assert_eq!(layout.add_binding(storage_binding()).unwrap(), 0);

    let uncompiled = Arc::new(DescriptorSetLayout::new(
        Arc::clone(harness.ctx.device()),
        vk::DescriptorSetLayoutCreateFlags::empty(),
    ));
    assert!(matches!(
        pool.allocate_descriptor_set(&uncompiled),
        Err(GpuError::LayoutNotCompiled)
    ));

    layout.compile().unwrap();
    assert!(matches!(
        layout.add_binding(storage_binding()),
        Err(GpuError::LayoutFrozen)
    ));
    assert!(matches!(layout.compile(), Err(GpuError::LayoutFrozen)));
}

#[test]
#[serial]
fn writes_are_checked_against_the_layout() {
    let Some(harness) = try_headless() else { return };
    let device = Arc::clone(harness.ctx.device());
    let mut layout = DescriptorSetLayout::new(
        Arc::clone(&device),
        vk::DescriptorSetLayoutCreateFlags::empty(),
    );
    layout.add_binding(storage_binding()).unwrap();
    layout.compile().unwrap();
    let layout = Arc::new(layout);

    let pool = DescriptorPool::new(device, DescriptorPoolConfig::default(), Logger::disabled())
        .unwrap();
    let set = pool.allocate_descriptor_set(&layout).unwrap();
    let buffer = harness
        .ctx
        .allocator()
        .allocate_buffer(
            &BufferDesc::new(64, vk::BufferUsageFlags::STORAGE_BUFFER),
            &MemoryPolicy::device_local(),
        )
        .unwrap();

    assert!(matches!(
        set.write_buffer(0, vk::DescriptorType::UNIFORM_BUFFER, &buffer, 0, 64),
        Err(GpuError::DescriptorTypeMismatch { binding: 0, .. })
    ));
    assert!(matches!(
        set.write_buffer(3, vk::DescriptorType::STORAGE_BUFFER, &buffer, 0, 64),
        Err(GpuError::BindingOutOfRange {
            binding: 3,
            count: 1
        })
    ));

    set.write_buffer(0, vk::DescriptorType::STORAGE_BUFFER, &buffer, 0, 64)
        .unwrap();
    assert_eq!(set.pending_writes(), 1);
    set.update().unwrap();
    assert_eq!(set.pending_writes(), 0);
    assert!(set.is_bound(0));
}

#[test]
#[serial]
fn exhausted_pools_grow() {
    let Some(harness) = try_headless() else { return };
    let device = Arc::clone(harness.ctx.device());
    let mut layout = DescriptorSetLayout::new(
        Arc::clone(&device),
        vk::DescriptorSetLayoutCreateFlags::empty(),
    );
    layout.add_binding(storage_binding()).unwrap();
    layout.compile().unwrap();
    let layout = Arc::new(layout);

    let config = DescriptorPoolConfig {
        descriptors_per_type: 2,
        max_sets: 2,
        ..Default::default()
    };
    let pool = DescriptorPool::new(device, config, Logger::disabled()).unwrap();
    let sets: Vec<_> = (0..5)
        .map(|_| pool.allocate_descriptor_set(&layout).unwrap())
        .collect();
    assert_eq!(sets.len(), 5);
    assert!(pool.block_count() >= 3);
}
