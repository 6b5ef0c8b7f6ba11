//! Copies 100 floats between two storage buffers with a compute shader and
//! checks the result on the host.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{ensure, Context};
use rendergraph_gpu::{
    vk, AccessInfo, BufferDesc, DescriptorPool, DescriptorPoolConfig, Fence, GpuContextBuilder,
    MemoryPolicy, Pipeline, QueueType, ResourceBarrier, Shader, ShaderStage,
};
use rendergraph_shaders::{ShaderCompiler, ShaderCompilerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

const ELEMENTS: u32 = 100;
const WORKGROUP_SIZE: u32 = 64;

fn validation_enabled() -> bool {
    match std::env::var("RENDERGRAPH_VALIDATION").as_deref() {
        Ok("1") => true,
        Ok("0") => false,
        _ => cfg!(debug_assertions),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let ctx = GpuContextBuilder::new()
        .app_name("rendergraph-compute")
        .validation(validation_enabled())
        .build_headless()
        .context("failed to create GPU context")?;
    let device = Arc::clone(ctx.device());

    let compiler = ShaderCompiler::new(ShaderCompilerConfig {
        search_paths: vec![PathBuf::from(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../../crates/rendergraph-shaders/shaders"
        ))],
        ..Default::default()
    })?
    .with_logger(ctx.logger().child("shaders"));
    let shader = Shader::load(Arc::clone(&device), &compiler, "copy", "main", ShaderStage::Compute)?;
    let push_constants = [vk::PushConstantRange::default()
        .stage_flags(vk::ShaderStageFlags::COMPUTE)
        .offset(0)
        .size(4)];
    let pipeline = Pipeline::compute_with_push_constants(
        Arc::clone(&device),
        shader,
        &push_constants,
        ctx.logger().child("pipeline"),
    )?;

    let input: Vec<f32> = (0..ELEMENTS).map(|i| i as f32).collect();
    let size = std::mem::size_of_val(input.as_slice()) as u64;
    let src = ctx.allocator().allocate_buffer(
        &BufferDesc::new(size, vk::BufferUsageFlags::STORAGE_BUFFER).name("input"),
        &MemoryPolicy::host_visible(),
    )?;
    let dst = ctx.allocator().allocate_buffer(
        &BufferDesc::new(size, vk::BufferUsageFlags::STORAGE_BUFFER).name("output"),
        &MemoryPolicy::readback(),
    )?;
    src.write_slice(0, &input)?;

    let descriptors = DescriptorPool::new(
        Arc::clone(&device),
        DescriptorPoolConfig::default(),
        ctx.logger().child("descriptors"),
    )?;
    let set = descriptors.allocate_descriptor_set(&pipeline.set_layouts()[0])?;
    set.write_buffer(0, vk::DescriptorType::STORAGE_BUFFER, &src, 0, size)?;
    set.write_buffer(1, vk::DescriptorType::STORAGE_BUFFER, &dst, 0, size)?;
    set.update()?;

    let pool = ctx.command_pool(QueueType::Compute)?;
    let mut cmd = pool.allocate_primary()?;
    cmd.begin(true)?;
    pipeline.bind(&mut cmd)?;
    pipeline.bind_descriptor_set(&mut cmd, 0, &set)?;
    pipeline.push_constants(&mut cmd, 0, &[ELEMENTS])?;
    pipeline.dispatch_compute(&mut cmd, ELEMENTS.div_ceil(WORKGROUP_SIZE), 1, 1)?;
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

    let fence = Fence::new(Arc::clone(&device), false)?;
    cmd.submit(Some(&fence))?;
    fence.wait(u64::MAX)?;
    cmd.reset()?;

    let output = dst.read_vec::<f32>()?;
    ensure!(output.len() == input.len(), "read back {} floats", output.len());
    for (index, (expected, actual)) in input.iter().zip(&output).enumerate() {
        ensure!(
            expected.to_bits() == actual.to_bits(),
            "mismatch at {index}: expected {expected}, got {actual}"
        );
    }

    info!(elements = ELEMENTS, "Compute copy verified");
    Ok(())
}
