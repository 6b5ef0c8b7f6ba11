//! Batched pipeline barriers.
//!
//! A [`ResourceBarrier`] collects memory, buffer and image barriers and records
//! them with a single `vkCmdPipelineBarrier2`. Inserting consumes the batch, so
//! a batch is recorded at most once:
//!
//! ```compile_fail,E0382
//! use rendergraph_gpu::barrier::ResourceBarrier;
//! use rendergraph_gpu::command::CommandBuffer;
//! use rendergraph_gpu::vk;
//!
//! fn record(cmd: &mut CommandBuffer) {
//!     let barrier = ResourceBarrier::new(vk::DependencyFlags::empty());
//!     barrier.insert_into_command_buffer(cmd).unwrap();
//!     barrier.insert_into_command_buffer(cmd).unwrap();
//! }
//! ```

use crate::command::{CommandBuffer, CommandBufferState};
use crate::error::Result;
use crate::resources::{Buffer, GpuResource, Image};
use ash::vk;
use std::sync::Arc;

/// One side of a barrier: the pipeline stages and accesses to order, and the
/// queue family owning the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessInfo {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    /// `QUEUE_FAMILY_IGNORED` unless ownership is being transferred.
    pub queue_family: u32,
}

impl AccessInfo {
    pub fn new(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        Self {
            stage,
            access,
            queue_family: vk::QUEUE_FAMILY_IGNORED,
        }
    }

    /// Set the queue family for an ownership transfer.
    pub fn queue_family(mut self, family: u32) -> Self {
        self.queue_family = family;
        self
    }

    /// The stages and accesses that use an image in `layout`.
    pub fn for_layout(layout: vk::ImageLayout) -> Self {
        use vk::AccessFlags2 as A;
        use vk::PipelineStageFlags2 as S;
        let (stage, access) = match layout {
            vk::ImageLayout::UNDEFINED | vk::ImageLayout::PREINITIALIZED => (S::TOP_OF_PIPE, A::NONE),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL => (S::ALL_TRANSFER, A::TRANSFER_WRITE),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (S::ALL_TRANSFER, A::TRANSFER_READ),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
                S::VERTEX_SHADER | S::FRAGMENT_SHADER | S::COMPUTE_SHADER,
                A::SHADER_READ,
            ),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
                S::COLOR_ATTACHMENT_OUTPUT,
                A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            ),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            | vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
            | vk::ImageLayout::STENCIL_ATTACHMENT_OPTIMAL => (
                S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
                A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
            | vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL
            | vk::ImageLayout::STENCIL_READ_ONLY_OPTIMAL => (
                S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS | S::FRAGMENT_SHADER,
                A::DEPTH_STENCIL_ATTACHMENT_READ | A::SHADER_READ,
            ),
            vk::ImageLayout::PRESENT_SRC_KHR => (S::BOTTOM_OF_PIPE, A::NONE),
            _ => (S::ALL_COMMANDS, A::MEMORY_READ | A::MEMORY_WRITE),
        };
        Self::new(stage, access)
    }
}

/// Whether `format` has a depth component.
pub fn has_depth(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Whether `format` has a stencil component.
pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Image aspects a barrier to `layout` must cover.
///
/// Depth layouts and depth formats select DEPTH, adding STENCIL when the format
/// has both. Stencil-only layouts select STENCIL. Everything else, including
/// multi-planar formats, is COLOR.
pub fn aspect_mask_for_layout(layout: vk::ImageLayout, format: vk::Format) -> vk::ImageAspectFlags {
    match layout {
        vk::ImageLayout::STENCIL_ATTACHMENT_OPTIMAL | vk::ImageLayout::STENCIL_READ_ONLY_OPTIMAL => {
            return vk::ImageAspectFlags::STENCIL;
        }
        vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL | vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL => {
            return vk::ImageAspectFlags::DEPTH;
        }
        _ => {}
    }

    let depth_layout = matches!(
        layout,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            | vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
    );

    match (has_depth(format), has_stencil(format)) {
        (true, true) => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        (true, false) => vk::ImageAspectFlags::DEPTH,
        (false, true) => vk::ImageAspectFlags::STENCIL,
        (false, false) if depth_layout => vk::ImageAspectFlags::DEPTH,
        (false, false) => vk::ImageAspectFlags::COLOR,
    }
}

/// Every mip level and array layer of the given aspects.
pub fn full_subresource_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: vk::REMAINING_MIP_LEVELS,
        base_array_layer: 0,
        layer_count: vk::REMAINING_ARRAY_LAYERS,
    }
}

/// A batch of barriers recorded together.
#[derive(Default)]
pub struct ResourceBarrier {
    dependency_flags: vk::DependencyFlags,
    memory: Vec<vk::MemoryBarrier2<'static>>,
    buffers: Vec<vk::BufferMemoryBarrier2<'static>>,
    images: Vec<vk::ImageMemoryBarrier2<'static>>,
    resources: Vec<Arc<dyn GpuResource>>,
}

impl ResourceBarrier {
    pub fn new(dependency_flags: vk::DependencyFlags) -> Self {
        Self {
            dependency_flags,
            ..Self::default()
        }
    }

    /// Order all memory accesses in `src` before those in `dst`.
    pub fn add_memory_barrier(&mut self, src: AccessInfo, dst: AccessInfo) -> &mut Self {
        self.memory.push(
            vk::MemoryBarrier2::default()
                .src_stage_mask(src.stage)
                .src_access_mask(src.access)
                .dst_stage_mask(dst.stage)
                .dst_access_mask(dst.access),
        );
        self
    }

    /// Barrier over a byte range of `buffer`.
    pub fn add_buffer_barrier(
        &mut self,
        src: AccessInfo,
        dst: AccessInfo,
        buffer: &Arc<Buffer>,
        offset: u64,
        size: u64,
    ) -> &mut Self {
        self.add_raw_buffer_barrier(src, dst, buffer.raw(), offset, size);
        self.resources.push(buffer.clone());
        self
    }

    /// Barrier over the whole of `buffer`.
    pub fn add_buffer_memory_barrier(
        &mut self,
        src: AccessInfo,
        dst: AccessInfo,
        buffer: &Arc<Buffer>,
    ) -> &mut Self {
        self.add_buffer_barrier(src, dst, buffer, 0, vk::WHOLE_SIZE)
    }

    /// Barrier over a raw buffer handle that the caller keeps alive.
    pub fn add_raw_buffer_barrier(
        &mut self,
        src: AccessInfo,
        dst: AccessInfo,
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
    ) -> &mut Self {
        self.buffers.push(
            vk::BufferMemoryBarrier2::default()
                .src_stage_mask(src.stage)
                .src_access_mask(src.access)
                .dst_stage_mask(dst.stage)
                .dst_access_mask(dst.access)
                .src_queue_family_index(src.queue_family)
                .dst_queue_family_index(dst.queue_family)
                .buffer(buffer)
                .offset(offset)
                .size(size),
        );
        self
    }

    /// Layout transition and access barrier for `image`.
    ///
    /// Does not update the image's tracked layout; see [`Image::transition`].
    pub fn add_image_barrier(
        &mut self,
        src: AccessInfo,
        dst: AccessInfo,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        image: &Arc<Image>,
        range: vk::ImageSubresourceRange,
    ) -> &mut Self {
        self.add_raw_image_barrier(src, dst, old_layout, new_layout, image.raw(), range);
        self.resources.push(image.clone());
        self
    }

    /// Image barrier over a raw handle that the caller keeps alive.
    pub fn add_raw_image_barrier(
        &mut self,
        src: AccessInfo,
        dst: AccessInfo,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        image: vk::Image,
        range: vk::ImageSubresourceRange,
    ) -> &mut Self {
        self.images.push(
            vk::ImageMemoryBarrier2::default()
                .src_stage_mask(src.stage)
                .src_access_mask(src.access)
                .dst_stage_mask(dst.stage)
                .dst_access_mask(dst.access)
                .src_queue_family_index(src.queue_family)
                .dst_queue_family_index(dst.queue_family)
                .old_layout(old_layout)
                .new_layout(new_layout)
                .image(image)
                .subresource_range(range),
        );
        self
    }

    pub fn memory_barriers(&self) -> &[vk::MemoryBarrier2<'static>] {
        &self.memory
    }

    pub fn buffer_barriers(&self) -> &[vk::BufferMemoryBarrier2<'static>] {
        &self.buffers
    }

    pub fn image_barriers(&self) -> &[vk::ImageMemoryBarrier2<'static>] {
        &self.images
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty() && self.buffers.is_empty() && self.images.is_empty()
    }

    /// Record the batch into `cmd`, which must be recording.
    ///
    /// An empty batch records nothing.
    pub fn insert_into_command_buffer(self, cmd: &mut CommandBuffer) -> Result<()> {
        cmd.state()
            .expect(CommandBufferState::Recording, "record a barrier into")
            .map_err(|e| cmd.report(e))?;
        if self.is_empty() {
            return Ok(());
        }

        let dependency_info = vk::DependencyInfo::default()
            .dependency_flags(self.dependency_flags)
            .memory_barriers(&self.memory)
            .buffer_memory_barriers(&self.buffers)
            .image_memory_barriers(&self.images);
        cmd.record(|device, raw| unsafe {
            device.cmd_pipeline_barrier2(raw, &dependency_info);
        })?;

        for resource in self.resources {
            cmd.retain(resource)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspect_mask_rule() {
        use vk::ImageAspectFlags as A;
        use vk::ImageLayout as L;

        assert_eq!(aspect_mask_for_layout(L::TRANSFER_DST_OPTIMAL, vk::Format::R8G8B8A8_UNORM), A::COLOR);
        assert_eq!(aspect_mask_for_layout(L::UNDEFINED, vk::Format::B8G8R8A8_SRGB), A::COLOR);
        assert_eq!(
            aspect_mask_for_layout(L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL, vk::Format::D32_SFLOAT),
            A::DEPTH
        );
        assert_eq!(
            aspect_mask_for_layout(L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL, vk::Format::D24_UNORM_S8_UINT),
            A::DEPTH | A::STENCIL
        );
        assert_eq!(
            aspect_mask_for_layout(L::TRANSFER_DST_OPTIMAL, vk::Format::D32_SFLOAT_S8_UINT),
            A::DEPTH | A::STENCIL
        );
        assert_eq!(
            aspect_mask_for_layout(L::STENCIL_ATTACHMENT_OPTIMAL, vk::Format::D24_UNORM_S8_UINT),
            A::STENCIL
        );
        assert_eq!(
            aspect_mask_for_layout(L::DEPTH_READ_ONLY_OPTIMAL, vk::Format::D24_UNORM_S8_UINT),
            A::DEPTH
        );
        assert_eq!(
            aspect_mask_for_layout(L::DEPTH_STENCIL_READ_ONLY_OPTIMAL, vk::Format::UNDEFINED),
            A::DEPTH
        );
        assert_eq!(
            aspect_mask_for_layout(L::SHADER_READ_ONLY_OPTIMAL, vk::Format::G8_B8R8_2PLANE_420_UNORM),
            A::COLOR
        );
    }

    #[test]
    fn batches_barriers_with_ownership_transfer() {
        let src = AccessInfo::new(vk::PipelineStageFlags2::COMPUTE_SHADER, vk::AccessFlags2::SHADER_WRITE)
            .queue_family(1);
        let dst = AccessInfo::new(vk::PipelineStageFlags2::VERTEX_INPUT, vk::AccessFlags2::VERTEX_ATTRIBUTE_READ)
            .queue_family(0);

        let mut barrier = ResourceBarrier::new(vk::DependencyFlags::BY_REGION);
        assert!(barrier.is_empty());
        barrier
            .add_memory_barrier(src, dst)
            .add_raw_buffer_barrier(src, dst, vk::Buffer::null(), 16, 64)
            .add_raw_image_barrier(
                AccessInfo::for_layout(vk::ImageLayout::UNDEFINED),
                AccessInfo::for_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::Image::null(),
                full_subresource_range(vk::ImageAspectFlags::COLOR),
            );

        assert!(!barrier.is_empty());
        assert_eq!(barrier.memory_barriers().len(), 1);

        let buffer = &barrier.buffer_barriers()[0];
        assert_eq!(buffer.src_queue_family_index, 1);
        assert_eq!(buffer.dst_queue_family_index, 0);
        assert_eq!((buffer.offset, buffer.size), (16, 64));

        let image = &barrier.image_barriers()[0];
        assert_eq!(image.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(image.dst_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(image.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(image.subresource_range.level_count, vk::REMAINING_MIP_LEVELS);
    }

    #[test]
    fn layout_access_masks() {
        let present = AccessInfo::for_layout(vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(present.stage, vk::PipelineStageFlags2::BOTTOM_OF_PIPE);
        assert_eq!(present.access, vk::AccessFlags2::NONE);

        let color = AccessInfo::for_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert!(color.access.contains(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE));
    }
}
