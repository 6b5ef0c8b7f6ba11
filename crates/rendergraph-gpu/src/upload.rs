//! Staging uploads into device-local memory.

use crate::allocator::{BufferDesc, ImageDesc, MemoryPolicy};
use crate::command::{execute_one_time, CommandPool};
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::resources::{Buffer, Image};
use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;

fn staging_buffer(ctx: &GpuContext, bytes: &[u8]) -> Result<Arc<Buffer>> {
    let staging = ctx.allocator().allocate_buffer(
        &BufferDesc::new(bytes.len() as u64, vk::BufferUsageFlags::TRANSFER_SRC).name("staging"),
        &MemoryPolicy::host_visible(),
    )?;
    staging.write_slice(0, bytes)?;
    Ok(staging)
}

/// Create a device-local buffer with `usage` holding `data`.
///
/// Blocks until the copy has completed.
pub fn upload_buffer<T: Pod>(
    ctx: &GpuContext,
    pool: &CommandPool,
    usage: vk::BufferUsageFlags,
    data: &[T],
) -> Result<Arc<Buffer>> {
    let bytes: &[u8] = bytemuck::cast_slice(data);
    if bytes.is_empty() {
        return Err(GpuError::InvalidState("cannot upload an empty buffer".to_string()));
    }

    let staging = staging_buffer(ctx, bytes)?;
    let buffer = ctx.allocator().allocate_buffer(
        &BufferDesc::new(bytes.len() as u64, usage | vk::BufferUsageFlags::TRANSFER_DST)
            .name("uploaded buffer"),
        &MemoryPolicy::device_local(),
    )?;

    execute_one_time(pool, |cmd| cmd.copy_buffer(&staging, &buffer, bytes.len() as u64))?;
    Ok(buffer)
}

/// Create a sampled RGBA8 texture from tightly packed `pixels`.
///
/// The image ends in `SHADER_READ_ONLY_OPTIMAL`. Blocks until the copy has
/// completed.
pub fn upload_image_rgba8(
    ctx: &GpuContext,
    pool: &CommandPool,
    width: u32,
    height: u32,
    pixels: &[u8],
) -> Result<Arc<Image>> {
    let expected = width as usize * height as usize * 4;
    if pixels.len() != expected || expected == 0 {
        return Err(GpuError::InvalidState(format!(
            "expected {expected} bytes of RGBA8 pixels for {width}x{height}, got {}",
            pixels.len()
        )));
    }

    let staging = staging_buffer(ctx, pixels)?;
    let image = ctx.allocator().allocate_image(
        &ImageDesc::new_2d(
            width,
            height,
            vk::Format::R8G8B8A8_SRGB,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        )
        .name("uploaded texture"),
        &MemoryPolicy::device_local(),
    )?;

    execute_one_time(pool, |cmd| {
        image.transition(cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
        cmd.copy_buffer_to_image(&staging, &image)?;
        image.transition(cmd, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    })?;
    Ok(image)
}
