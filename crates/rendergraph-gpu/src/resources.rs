//! Buffers, images, image views and samplers.

use crate::allocator::{Allocator, BufferDesc, ImageDesc, MemoryLocation};
use crate::barrier::{aspect_mask_for_layout, full_subresource_range, AccessInfo, ResourceBarrier};
use crate::command::CommandBuffer;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::logging::Logger;
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::Allocation;
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Number of pending submissions that reference a resource.
#[derive(Debug, Default)]
pub struct InFlight(AtomicU32);

impl InFlight {
    pub fn acquire(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one pending submission. Saturates at zero; returns `false` when
    /// nothing was in flight.
    pub fn release(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .is_ok()
    }

    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.count() == 0
    }
}

/// A GPU object a command buffer can keep alive until its work completes.
pub trait GpuResource: Send + Sync {
    fn in_flight(&self) -> &InFlight;

    fn debug_name(&self) -> &str;
}

/// Report a resource destroyed while submissions still reference it.
pub(crate) fn check_idle_on_drop(resource: &dyn GpuResource, logger: &Logger) {
    let pending = resource.in_flight().count();
    if pending != 0 {
        tracing::error!(
            parent: logger.span(),
            name = resource.debug_name(),
            pending,
            "resource destroyed while in use by the GPU"
        );
    }
}

/// A buffer with its own memory allocation.
///
/// Memory is freed when the last `Arc<Buffer>` is dropped. Host-visible
/// buffers stay persistently mapped by the allocator; [`Buffer::map`] and
/// [`Buffer::unmap`] only track exclusive CPU access.
pub struct Buffer {
    allocator: Arc<Allocator>,
    raw: vk::Buffer,
    allocation: Option<Allocation>,
    desc: BufferDesc,
    location: MemoryLocation,
    mapped: AtomicBool,
    in_flight: InFlight,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("raw", &self.raw)
            .field("desc", &self.desc)
            .field("location", &self.location)
            .field("mapped", &self.mapped)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl Buffer {
    pub(crate) fn new(
        allocator: Arc<Allocator>,
        raw: vk::Buffer,
        allocation: Allocation,
        desc: BufferDesc,
        location: MemoryLocation,
    ) -> Self {
        Self {
            allocator,
            raw,
            allocation: Some(allocation),
            desc,
            location,
            mapped: AtomicBool::new(false),
            in_flight: InFlight::default(),
        }
    }

    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }

    pub fn size(&self) -> u64 {
        self.desc.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.desc.usage
    }

    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    pub fn is_host_visible(&self) -> bool {
        self.host_ptr().is_some()
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    fn host_ptr(&self) -> Option<NonNull<u8>> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(NonNull::cast)
    }

    /// Map the buffer, returning a guard that unmaps on drop.
    pub fn map(&self) -> Result<BufferMapping<'_>> {
        let ptr = self.map_raw()?;
        Ok(BufferMapping { buffer: self, ptr })
    }

    /// Map the buffer without a guard. Must be paired with [`Buffer::unmap`].
    pub fn map_raw(&self) -> Result<NonNull<u8>> {
        let ptr = self.host_ptr().ok_or(GpuError::NotHostVisible)?;
        if self
            .mapped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(self.violation(GpuError::AlreadyMapped));
        }
        Ok(ptr)
    }

    /// End a mapping started with [`Buffer::map_raw`].
    pub fn unmap(&self) -> Result<()> {
        if self
            .mapped
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(self.violation(GpuError::NotMapped));
        }
        Ok(())
    }

    /// Copy `data` into the buffer at byte `offset`.
    pub fn write_slice<T: Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.map()?.write(offset, data)
    }

    /// Read the whole buffer as a vector of `T`.
    pub fn read_vec<T: Pod>(&self) -> Result<Vec<T>> {
        Ok(self.map()?.as_slice::<T>().to_vec())
    }

    fn violation(&self, error: GpuError) -> GpuError {
        tracing::error!(parent: self.allocator.logger().span(), name = %self.desc.name, %error, "buffer mapping misuse");
        error
    }
}

impl GpuResource for Buffer {
    fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    fn debug_name(&self) -> &str {
        &self.desc.name
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        check_idle_on_drop(&*self, self.allocator.logger());
        unsafe { self.allocator.device().raw().destroy_buffer(self.raw, None) };
        if let Some(allocation) = self.allocation.take() {
            self.allocator.free(allocation);
        }
    }
}

/// Exclusive CPU access to a mapped buffer. Unmaps on drop.
pub struct BufferMapping<'a> {
    buffer: &'a Buffer,
    ptr: NonNull<u8>,
}

impl BufferMapping<'_> {
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }

    /// View the mapping as `T`s. Trailing bytes that do not fill a whole `T`
    /// are excluded.
    pub fn as_slice<T: Pod>(&self) -> &[T] {
        let bytes = self.as_bytes();
        let whole = bytes.len() - bytes.len() % std::mem::size_of::<T>().max(1);
        bytemuck::cast_slice(&bytes[..whole])
    }

    pub fn as_mut_slice<T: Pod>(&mut self) -> &mut [T] {
        let size = std::mem::size_of::<T>().max(1);
        let bytes = self.as_bytes_mut();
        let whole = bytes.len() - bytes.len() % size;
        bytemuck::cast_slice_mut(&mut bytes[..whole])
    }

    /// Copy `data` to byte `offset`.
    pub fn write<T: Pod>(&mut self, offset: u64, data: &[T]) -> Result<()> {
        let src: &[u8] = bytemuck::cast_slice(data);
        let size = self.buffer.size();
        let len = src.len() as u64;
        let end = offset.checked_add(len).filter(|&end| end <= size);
        if end.is_none() {
            return Err(self
                .buffer
                .violation(GpuError::MapOutOfBounds { offset, len, size }));
        }
        let start = offset as usize;
        self.as_bytes_mut()[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.size() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for BufferMapping<'_> {
    fn drop(&mut self) {
        self.buffer.mapped.store(false, Ordering::Release);
    }
}

/// Who owns an image's handle and memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOwnership {
    /// Created by an [`Allocator`], destroyed with the image.
    Owned,
    /// Owned by a swapchain; never destroyed here.
    Swapchain,
}

/// An image with a tracked current layout.
pub struct Image {
    device: Arc<Device>,
    allocator: Option<Arc<Allocator>>,
    allocation: Option<Allocation>,
    raw: vk::Image,
    desc: ImageDesc,
    layout: Mutex<vk::ImageLayout>,
    ownership: ImageOwnership,
    in_flight: InFlight,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("raw", &self.raw)
            .field("desc", &self.desc)
            .field("layout", &self.layout)
            .field("ownership", &self.ownership)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl Image {
    pub(crate) fn new_owned(
        allocator: Arc<Allocator>,
        raw: vk::Image,
        allocation: Allocation,
        desc: ImageDesc,
    ) -> Self {
        Self {
            device: Arc::clone(allocator.device()),
            allocator: Some(allocator),
            allocation: Some(allocation),
            raw,
            desc,
            layout: Mutex::new(vk::ImageLayout::UNDEFINED),
            ownership: ImageOwnership::Owned,
            in_flight: InFlight::default(),
        }
    }

    pub(crate) fn from_swapchain(
        device: Arc<Device>,
        raw: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
        index: usize,
    ) -> Self {
        let desc = ImageDesc::new_2d(extent.width, extent.height, format, usage)
            .name(format!("swapchain image {index}"));
        Self {
            device,
            allocator: None,
            allocation: None,
            raw,
            desc,
            layout: Mutex::new(vk::ImageLayout::UNDEFINED),
            ownership: ImageOwnership::Swapchain,
            in_flight: InFlight::default(),
        }
    }

    pub fn raw(&self) -> vk::Image {
        self.raw
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.desc.extent
    }

    pub fn ownership(&self) -> ImageOwnership {
        self.ownership
    }

    /// The layout the image will be in once recorded work has executed.
    pub fn layout(&self) -> vk::ImageLayout {
        *self.layout.lock()
    }

    /// Override the tracked layout, e.g. after presentation.
    pub fn set_layout(&self, layout: vk::ImageLayout) {
        *self.layout.lock() = layout;
    }

    /// Forget the contents: the next transition starts from `UNDEFINED`.
    pub fn discard_contents(&self) {
        self.set_layout(vk::ImageLayout::UNDEFINED);
    }

    /// The barrier [`Image::transition`] records, starting from the tracked
    /// layout.
    pub fn transition_barrier(self: &Arc<Self>, new_layout: vk::ImageLayout) -> ResourceBarrier {
        self.layout_barrier(self.layout(), new_layout)
    }

    fn layout_barrier(
        self: &Arc<Self>,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> ResourceBarrier {
        let range = full_subresource_range(aspect_mask_for_layout(new_layout, self.format()));
        let mut barrier = ResourceBarrier::new(vk::DependencyFlags::empty());
        barrier.add_image_barrier(
            AccessInfo::for_layout(old_layout),
            AccessInfo::for_layout(new_layout),
            old_layout,
            new_layout,
            self,
            range,
        );
        barrier
    }

    /// Record a transition from the tracked layout to `new_layout`.
    pub fn transition(self: &Arc<Self>, cmd: &mut CommandBuffer, new_layout: vk::ImageLayout) -> Result<()> {
        self.transition_barrier(new_layout).insert_into_command_buffer(cmd)?;
        self.set_layout(new_layout);
        Ok(())
    }

    /// Record a transition from an explicitly given layout.
    pub fn transition_from(
        self: &Arc<Self>,
        cmd: &mut CommandBuffer,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Result<()> {
        self.layout_barrier(old_layout, new_layout)
            .insert_into_command_buffer(cmd)?;
        self.set_layout(new_layout);
        Ok(())
    }
}

impl GpuResource for Image {
    fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    fn debug_name(&self) -> &str {
        &self.desc.name
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if self.ownership == ImageOwnership::Swapchain {
            return;
        }
        check_idle_on_drop(&*self, self.device.logger());
        unsafe { self.device.raw().destroy_image(self.raw, None) };
        if let (Some(allocator), Some(allocation)) = (&self.allocator, self.allocation.take()) {
            allocator.free(allocation);
        }
    }
}

/// Parameters of an image view. `None` fields are derived from the image.
#[derive(Debug, Clone, Default)]
pub struct ImageViewDesc {
    pub view_type: Option<vk::ImageViewType>,
    pub format: Option<vk::Format>,
    pub components: vk::ComponentMapping,
    pub subresource_range: Option<vk::ImageSubresourceRange>,
}

/// A view of an image. Keeps the image alive; never destroys it.
pub struct ImageView {
    image: Arc<Image>,
    raw: vk::ImageView,
    format: vk::Format,
    in_flight: InFlight,
}

impl ImageView {
    pub fn new(image: &Arc<Image>, desc: &ImageViewDesc) -> Result<Arc<Self>> {
        let format = desc.format.unwrap_or_else(|| image.format());
        let range = desc.subresource_range.unwrap_or_else(|| {
            let aspect = aspect_mask_for_layout(vk::ImageLayout::UNDEFINED, format);
            full_subresource_range(aspect)
        });
        let view_type = desc.view_type.unwrap_or(match image.desc().image_type {
            vk::ImageType::TYPE_1D => vk::ImageViewType::TYPE_1D,
            vk::ImageType::TYPE_3D => vk::ImageViewType::TYPE_3D,
            _ => vk::ImageViewType::TYPE_2D,
        });

        let create_info = vk::ImageViewCreateInfo::default()
            .image(image.raw())
            .view_type(view_type)
            .format(format)
            .components(desc.components)
            .subresource_range(range);

        let raw = unsafe { image.device.raw().create_image_view(&create_info, None)? };

        Ok(Arc::new(Self {
            image: Arc::clone(image),
            raw,
            format,
            in_flight: InFlight::default(),
        }))
    }

    pub fn raw(&self) -> vk::ImageView {
        self.raw
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl GpuResource for ImageView {
    fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    fn debug_name(&self) -> &str {
        self.image.debug_name()
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        check_idle_on_drop(&*self, self.image.device.logger());
        unsafe { self.image.device.raw().destroy_image_view(self.raw, None) };
    }
}

/// Sampler parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    /// Maximum anisotropy, or `None` to disable anisotropic filtering.
    pub anisotropy: Option<f32>,
    pub max_lod: f32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            anisotropy: None,
            max_lod: vk::LOD_CLAMP_NONE,
        }
    }
}

pub struct Sampler {
    device: Arc<Device>,
    raw: vk::Sampler,
    desc: SamplerDesc,
    in_flight: InFlight,
}

impl Sampler {
    pub fn new(device: Arc<Device>, desc: SamplerDesc) -> Result<Arc<Self>> {
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(desc.mag_filter)
            .min_filter(desc.min_filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .anisotropy_enable(desc.anisotropy.is_some())
            .max_anisotropy(desc.anisotropy.unwrap_or(1.0))
            .min_lod(0.0)
            .max_lod(desc.max_lod);

        let raw = unsafe { device.raw().create_sampler(&create_info, None)? };
        Ok(Arc::new(Self {
            device,
            raw,
            desc,
            in_flight: InFlight::default(),
        }))
    }

    pub fn raw(&self) -> vk::Sampler {
        self.raw
    }

    pub fn desc(&self) -> &SamplerDesc {
        &self.desc
    }
}

impl GpuResource for Sampler {
    fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    fn debug_name(&self) -> &str {
        "sampler"
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        check_idle_on_drop(&*self, self.device.logger());
        unsafe { self.device.raw().destroy_sampler(self.raw, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_counts_submissions() {
        let counter = InFlight::default();
        assert!(counter.is_idle());
        counter.acquire();
        counter.acquire();
        assert_eq!(counter.count(), 2);
        assert!(counter.release());
        assert!(counter.release());
        assert!(counter.is_idle());
    }

    #[test]
    fn in_flight_release_saturates_at_zero() {
        let counter = InFlight::default();
        assert!(!counter.release());
        assert_eq!(counter.count(), 0);
        counter.acquire();
        assert!(counter.release());
        assert!(!counter.release());
        assert!(counter.is_idle());
    }

    #[test]
    fn sampler_defaults() {
        let desc = SamplerDesc::default();
        assert_eq!(desc.mag_filter, vk::Filter::LINEAR);
        assert_eq!(desc.address_mode, vk::SamplerAddressMode::REPEAT);
        assert!(desc.anisotropy.is_none());
    }
}
