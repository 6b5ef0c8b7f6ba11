//! GPU memory allocation.
//!
//! [`Allocator`] wraps `gpu-allocator` and hands out reference-counted
//! [`Buffer`]s and [`Image`]s. Every resource keeps an `Arc` back to the
//! allocator, so the underlying memory blocks are released only after the last
//! resource is gone.

use crate::device::Device;
use crate::error::{AllocationError, GpuError, Result};
use crate::logging::Logger;
use crate::resources::{Buffer, Image};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, AllocatorCreateDesc};
pub use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Queue family sharing of a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Sharing {
    #[default]
    Exclusive,
    /// Shared between the listed queue families without ownership transfers.
    Concurrent(Vec<u32>),
}

impl Sharing {
    /// Sharing mode and family list for a create info.
    ///
    /// Concurrent sharing with fewer than two distinct families is exclusive.
    pub fn resolve(&self) -> (vk::SharingMode, Vec<u32>) {
        match self {
            Self::Exclusive => (vk::SharingMode::EXCLUSIVE, Vec::new()),
            Self::Concurrent(families) => {
                let mut families = families.clone();
                families.sort_unstable();
                families.dedup();
                if families.len() < 2 {
                    (vk::SharingMode::EXCLUSIVE, Vec::new())
                } else {
                    (vk::SharingMode::CONCURRENT, families)
                }
            }
        }
    }
}

/// Where a resource lives and who may touch it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPolicy {
    /// Memory location. `MemoryLocation::Unknown` lets `host_access` decide.
    pub location: MemoryLocation,
    /// Whether the CPU maps this resource.
    pub host_access: bool,
    pub sharing: Sharing,
}

impl MemoryPolicy {
    /// Device-local memory, not mappable.
    pub fn device_local() -> Self {
        Self {
            location: MemoryLocation::GpuOnly,
            host_access: false,
            sharing: Sharing::Exclusive,
        }
    }

    /// Host-visible memory for uploads and small CPU-written buffers.
    pub fn host_visible() -> Self {
        Self {
            location: MemoryLocation::CpuToGpu,
            host_access: true,
            sharing: Sharing::Exclusive,
        }
    }

    /// Host-visible memory optimised for reading results back.
    pub fn readback() -> Self {
        Self {
            location: MemoryLocation::GpuToCpu,
            host_access: true,
            sharing: Sharing::Exclusive,
        }
    }

    /// Share the resource between `families`.
    pub fn concurrent(mut self, families: impl Into<Vec<u32>>) -> Self {
        self.sharing = Sharing::Concurrent(families.into());
        self
    }

    /// The concrete location to allocate from.
    pub fn resolve_location(&self) -> Result<MemoryLocation> {
        match (self.location, self.host_access) {
            (MemoryLocation::GpuOnly, true) => Err(AllocationError::Unsupported(
                "host access requested for device-only memory".to_string(),
            )
            .into()),
            (MemoryLocation::Unknown, true) => Ok(MemoryLocation::CpuToGpu),
            (MemoryLocation::Unknown, false) => Ok(MemoryLocation::GpuOnly),
            (location, _) => Ok(location),
        }
    }
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self::device_local()
    }
}

/// Parameters of a buffer allocation.
#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub name: String,
}

impl BufferDesc {
    pub fn new(size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            name: "buffer".to_string(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Parameters of an image allocation.
#[derive(Debug, Clone)]
pub struct ImageDesc {
    pub image_type: vk::ImageType,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub name: String,
}

impl ImageDesc {
    /// A single-sampled 2D image with one mip level and layer.
    pub fn new_2d(width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            image_type: vk::ImageType::TYPE_2D,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            format,
            usage,
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            name: "image".to_string(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn mip_levels(mut self, levels: u32) -> Self {
        self.mip_levels = levels;
        self
    }
}

/// Reference-counted wrapper around the `gpu-allocator` allocator.
pub struct Allocator {
    device: Arc<Device>,
    inner: Mutex<Option<gpu_allocator::vulkan::Allocator>>,
    live: AtomicUsize,
    logger: Logger,
}

impl Allocator {
    pub fn new(device: Arc<Device>, logger: Logger) -> Result<Arc<Self>> {
        let allocator = gpu_allocator::vulkan::Allocator::new(&AllocatorCreateDesc {
            instance: device.instance().raw().clone(),
            device: device.raw().clone(),
            physical_device: device.physical_device(),
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        Ok(Arc::new(Self {
            device,
            inner: Mutex::new(Some(allocator)),
            live: AtomicUsize::new(0),
            logger,
        }))
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Number of allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Create a buffer and bind freshly allocated memory to it.
    pub fn allocate_buffer(
        self: &Arc<Self>,
        desc: &BufferDesc,
        policy: &MemoryPolicy,
    ) -> Result<Arc<Buffer>> {
        let location = policy.resolve_location()?;
        let (sharing_mode, families) = policy.sharing.resolve();
        let device = self.device.raw();

        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(&families);

        let raw = unsafe { device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.get_buffer_memory_requirements(raw) };

        let allocation = match self.allocate(&desc.name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_buffer(raw, None) };
                return Err(self.report(e, &desc.name));
            }
        };

        if let Err(e) = unsafe { device.bind_buffer_memory(raw, allocation.memory(), allocation.offset()) } {
            unsafe { device.destroy_buffer(raw, None) };
            self.free(allocation);
            return Err(self.report(e.into(), &desc.name));
        }

        tracing::debug!(
            parent: self.logger.span(),
            name = %desc.name,
            size = desc.size,
            ?location,
            "buffer allocated"
        );

        Ok(Arc::new(Buffer::new(
            Arc::clone(self),
            raw,
            allocation,
            desc.clone(),
            location,
        )))
    }

    /// Create an image and bind freshly allocated memory to it.
    pub fn allocate_image(
        self: &Arc<Self>,
        desc: &ImageDesc,
        policy: &MemoryPolicy,
    ) -> Result<Arc<Image>> {
        let location = policy.resolve_location()?;
        let (sharing_mode, families) = policy.sharing.resolve();
        let device = self.device.raw();

        let image_info = vk::ImageCreateInfo::default()
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(desc.samples)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(&families)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let raw = unsafe { device.create_image(&image_info, None)? };
        let requirements = unsafe { device.get_image_memory_requirements(raw) };
        let linear = desc.tiling == vk::ImageTiling::LINEAR;

        let allocation = match self.allocate(&desc.name, requirements, location, linear) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_image(raw, None) };
                return Err(self.report(e, &desc.name));
            }
        };

        if let Err(e) = unsafe { device.bind_image_memory(raw, allocation.memory(), allocation.offset()) } {
            unsafe { device.destroy_image(raw, None) };
            self.free(allocation);
            return Err(self.report(e.into(), &desc.name));
        }

        tracing::debug!(
            parent: self.logger.span(),
            name = %desc.name,
            extent = ?desc.extent,
            format = ?desc.format,
            "image allocated"
        );

        Ok(Arc::new(Image::new_owned(
            Arc::clone(self),
            raw,
            allocation,
            desc.clone(),
        )))
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        let mut inner = self.inner.lock();
        let allocator = inner
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("allocator shut down".to_string()))?;
        let allocation = allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(allocation)
    }

    /// Return an allocation. Called exactly once per allocation by the owning
    /// resource.
    pub(crate) fn free(&self, allocation: Allocation) {
        let mut inner = self.inner.lock();
        if let Some(allocator) = inner.as_mut() {
            if let Err(e) = allocator.free(allocation) {
                tracing::error!(parent: self.logger.span(), error = %e, "failed to free allocation");
            }
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    fn report(&self, error: GpuError, name: &str) -> GpuError {
        tracing::error!(parent: self.logger.span(), %name, %error, "allocation failed");
        error
    }

    pub(crate) fn logger(&self) -> &Logger {
        &self.logger
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        let live = self.live_allocations();
        if live != 0 {
            tracing::error!(parent: self.logger.span(), live, "allocator dropped with live allocations");
        }
        // Frees every memory block while the device is still alive.
        drop(self.inner.lock().take());
        tracing::debug!(parent: self.logger.span(), "allocator destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_sharing_needs_two_families() {
        assert_eq!(
            Sharing::Concurrent(vec![0]).resolve(),
            (vk::SharingMode::EXCLUSIVE, vec![])
        );
        assert_eq!(
            Sharing::Concurrent(vec![2, 2]).resolve(),
            (vk::SharingMode::EXCLUSIVE, vec![])
        );
        assert_eq!(
            Sharing::Concurrent(vec![2, 0, 2]).resolve(),
            (vk::SharingMode::CONCURRENT, vec![0, 2])
        );
        assert_eq!(
            Sharing::Exclusive.resolve(),
            (vk::SharingMode::EXCLUSIVE, vec![])
        );
    }

    #[test]
    fn location_resolution() {
        assert_eq!(
            MemoryPolicy::device_local().resolve_location().unwrap(),
            MemoryLocation::GpuOnly
        );
        assert_eq!(
            MemoryPolicy::readback().resolve_location().unwrap(),
            MemoryLocation::GpuToCpu
        );

        let auto = MemoryPolicy {
            location: MemoryLocation::Unknown,
            host_access: true,
            sharing: Sharing::Exclusive,
        };
        assert_eq!(auto.resolve_location().unwrap(), MemoryLocation::CpuToGpu);

        let invalid = MemoryPolicy {
            host_access: true,
            ..MemoryPolicy::device_local()
        };
        assert!(matches!(
            invalid.resolve_location(),
            Err(GpuError::Allocation(AllocationError::Unsupported(_)))
        ));
    }

    #[test]
    fn image_desc_defaults() {
        let desc = ImageDesc::new_2d(64, 32, vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::SAMPLED);
        assert_eq!(desc.extent.depth, 1);
        assert_eq!(desc.mip_levels, 1);
        assert_eq!(desc.samples, vk::SampleCountFlags::TYPE_1);
    }
}
