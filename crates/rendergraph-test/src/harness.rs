//! Headless context plus the compute round trips used as end-to-end checks.

use std::path::PathBuf;
use std::sync::Arc;

use rendergraph_gpu::{
    vk, AccessInfo, BufferDesc, CommandPool, DescriptorPool, DescriptorPoolConfig, Fence, GpuContext,
    GpuContextBuilder, MemoryPolicy, Pipeline, QueueType, ResourceBarrier, Shader, ShaderStage,
};
use rendergraph_shaders::{ShaderCompiler, ShaderCompilerConfig};

use crate::{Result, TestError};

/// A headless context with a graphics command pool.
pub struct HeadlessHarness {
    pub ctx: GpuContext,
    pub pool: CommandPool,
}

impl HeadlessHarness {
    pub fn new() -> Result<Self> {
        let ctx = GpuContextBuilder::new()
            .app_name("rendergraph-test")
            .validation(std::env::var_os("RENDERGRAPH_VALIDATION").is_some_and(|v| v == "1"))
            .build_headless()?;
        let pool = ctx.command_pool(QueueType::Graphics)?;
        Ok(Self { ctx, pool })
    }
}

/// Build a headless harness, or `None` when no usable device exists.
pub fn try_headless() -> Option<HeadlessHarness> {
    match HeadlessHarness::new() {
        Ok(harness) => Some(harness),
        Err(e) => {
            tracing::warn!("Skipping GPU test: {e}");
            eprintln!("Skipping GPU test: {e}");
            None
        }
    }
}

/// Directory holding the bundled GLSL sources.
pub fn shader_dir() -> PathBuf {
    PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/../rendergraph-shaders/shaders"))
}

/// A compiler that finds the bundled shaders.
pub fn shader_compiler() -> Result<ShaderCompiler> {
    Ok(ShaderCompiler::new(ShaderCompilerConfig {
        search_paths: vec![shader_dir()],
        ..Default::default()
    })?)
}

/// Copy `input` through the `copy` compute shader and read it back.
pub fn copy_round_trip(harness: &HeadlessHarness, input: &[f32]) -> Result<Vec<f32>> {
    let ctx = &harness.ctx;
    let device = Arc::clone(ctx.device());
    let size = std::mem::size_of_val(input) as u64;
    let count = u32::try_from(input.len()).map_err(|_| {
        TestError::Gpu(rendergraph_gpu::GpuError::InvalidState("too many elements".to_string()))
    })?;

    let usage = vk::BufferUsageFlags::STORAGE_BUFFER;
    let src = ctx.allocator().allocate_buffer(
        &BufferDesc::new(size, usage).name("copy source"),
        &MemoryPolicy::host_visible(),
    )?;
    let dst = ctx.allocator().allocate_buffer(
        &BufferDesc::new(size, usage).name("copy destination"),
        &MemoryPolicy::readback(),
    )?;
    src.write_slice(0, input)?;

    let compiler = shader_compiler()?;
    let shader = Shader::load(Arc::clone(&device), &compiler, "copy", "main", ShaderStage::Compute)?;
    let ranges = [vk::PushConstantRange::default()
        .stage_flags(vk::ShaderStageFlags::COMPUTE)
        .offset(0)
        .size(4)];
    let pipeline = Pipeline::compute_with_push_constants(
        Arc::clone(&device),
        shader,
        &ranges,
        ctx.logger().child("pipeline"),
    )?;

    let descriptors = DescriptorPool::new(
        Arc::clone(&device),
        DescriptorPoolConfig::default(),
        ctx.logger().child("descriptors"),
    )?;
    let set = descriptors.allocate_descriptor_set(&pipeline.set_layouts()[0])?;
    set.write_buffer(0, vk::DescriptorType::STORAGE_BUFFER, &src, 0, size)?;
    set.write_buffer(1, vk::DescriptorType::STORAGE_BUFFER, &dst, 0, size)?;
    set.update()?;

    let mut cmd = harness.pool.allocate_primary()?;
    cmd.begin(true)?;
    pipeline.bind(&mut cmd)?;
    pipeline.bind_descriptor_set(&mut cmd, 0, &set)?;
    pipeline.push_constants(&mut cmd, 0, &[count])?;
    pipeline.dispatch_compute(&mut cmd, count.div_ceil(64), 1, 1)?;
    let mut barrier = ResourceBarrier::default();
    barrier.add_buffer_memory_barrier(
        AccessInfo::new(
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_STORAGE_WRITE,
        ),
        AccessInfo::new(vk::PipelineStageFlags2::HOST, vk::AccessFlags2::HOST_READ),
        &dst,
    );
    barrier.insert_into_command_buffer(&mut cmd)?;
    cmd.end()?;

    let fence = Fence::new(device, false)?;
    cmd.submit(Some(&fence))?;
    fence.wait(u64::MAX)?;
    cmd.reset()?;

    let output = dst.read_vec::<f32>()?;
    Ok(output)
}

/// Average `first` and `second` through the `merge` compute shader, one
/// invocation per element, and read the result back.
pub fn merge_round_trip(harness: &HeadlessHarness, first: &[f32], second: &[f32]) -> Result<Vec<f32>> {
    if first.len() != second.len() {
        return Err(TestError::Gpu(rendergraph_gpu::GpuError::InvalidState(
            "merge inputs differ in length".to_string(),
        )));
    }
    let ctx = &harness.ctx;
    let device = Arc::clone(ctx.device());
    let size = std::mem::size_of_val(first) as u64;
    let count = u32::try_from(first.len()).map_err(|_| {
        TestError::Gpu(rendergraph_gpu::GpuError::InvalidState("too many elements".to_string()))
    })?;

    let usage = vk::BufferUsageFlags::STORAGE_BUFFER;
    let inputs = [("merge first", first), ("merge second", second)]
        .into_iter()
        .map(|(name, values)| -> Result<_> {
            let buffer = ctx
                .allocator()
                .allocate_buffer(&BufferDesc::new(size, usage).name(name), &MemoryPolicy::host_visible())?;
            buffer.write_slice(0, values)?;
            Ok(buffer)
        })
        .collect::<Result<Vec<_>>>()?;
    let merged = ctx.allocator().allocate_buffer(
        &BufferDesc::new(size, usage).name("merge output"),
        &MemoryPolicy::readback(),
    )?;

    let compiler = shader_compiler()?;
    let shader = Shader::load(Arc::clone(&device), &compiler, "merge", "main", ShaderStage::Compute)?;
    let pipeline = Pipeline::compute(Arc::clone(&device), shader, ctx.logger().child("pipeline"))?;

    let descriptors = DescriptorPool::new(
        Arc::clone(&device),
        DescriptorPoolConfig::default(),
        ctx.logger().child("descriptors"),
    )?;
    let set = descriptors.allocate_descriptor_set(&pipeline.set_layouts()[0])?;
    set.write_buffer(0, vk::DescriptorType::STORAGE_BUFFER, &inputs[0], 0, size)?;
    set.write_buffer(1, vk::DescriptorType::STORAGE_BUFFER, &inputs[1], 0, size)?;
    set.write_buffer(2, vk::DescriptorType::STORAGE_BUFFER, &merged, 0, size)?;
    set.update()?;

    let mut cmd = harness.pool.allocate_primary()?;
    cmd.begin(true)?;
    pipeline.bind(&mut cmd)?;
    pipeline.bind_descriptor_set(&mut cmd, 0, &set)?;
    pipeline.dispatch_compute(&mut cmd, count, 1, 1)?;
    let mut barrier = ResourceBarrier::default();
    barrier.add_buffer_memory_barrier(
        AccessInfo::new(
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_STORAGE_WRITE,
        ),
        AccessInfo::new(vk::PipelineStageFlags2::HOST, vk::AccessFlags2::HOST_READ),
        &merged,
    );
    barrier.insert_into_command_buffer(&mut cmd)?;
    cmd.end()?;

    let fence = Fence::new(device, false)?;
    cmd.submit(Some(&fence))?;
    fence.wait(u64::MAX)?;
    cmd.reset()?;

    Ok(merged.read_vec::<f32>()?)
}
