//! Swapchain management.

use crate::device::{Device, QueueType};
use crate::error::{GpuError, Result};
use crate::logging::Logger;
use crate::resources::{Image, ImageView, ImageViewDesc};
use crate::surface::Surface;
use crate::sync::Semaphore;
use ash::vk;
use std::sync::Arc;

/// Swapchain creation options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainConfig {
    /// FIFO presentation when set, otherwise the lowest-latency mode available.
    pub vsync: bool,
    /// Requested image count; `None` means one more than the surface minimum.
    pub desired_image_count: Option<u32>,
    pub usage: vk::ImageUsageFlags,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            desired_image_count: None,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
        }
    }
}

/// Result of [`Swapchain::acquire_next_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    /// The swapchain still works but no longer matches the surface exactly.
    pub suboptimal: bool,
}

/// Result of a successful [`Swapchain::present`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Optimal,
    Suboptimal,
}

/// A swapchain with an [`Image`] and [`ImageView`] per swapchain image.
pub struct Swapchain {
    device: Arc<Device>,
    surface: Arc<Surface>,
    loader: ash::khr::swapchain::Device,
    raw: vk::SwapchainKHR,
    images: Vec<Arc<Image>>,
    views: Vec<Arc<ImageView>>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    config: SwapchainConfig,
    logger: Logger,
}

impl Swapchain {
    pub fn new(
        device: Arc<Device>,
        surface: Arc<Surface>,
        config: SwapchainConfig,
        framebuffer_size: (u32, u32),
        logger: Logger,
    ) -> Result<Self> {
        let loader = ash::khr::swapchain::Device::new(device.instance().raw(), device.raw());
        let mut swapchain = Self {
            device,
            surface,
            loader,
            raw: vk::SwapchainKHR::null(),
            images: Vec::new(),
            views: Vec::new(),
            format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            config,
            logger,
        };
        swapchain.build(framebuffer_size)?;
        Ok(swapchain)
    }

    /// Rebuild for a new framebuffer size, e.g. after `SwapchainOutOfDate`.
    ///
    /// Waits for the device to go idle first. Command buffers that recorded
    /// work on the current images must be reset beforehand, otherwise this
    /// fails with `InvalidState` and the swapchain is left unchanged.
    pub fn recreate(&mut self, framebuffer_size: (u32, u32)) -> Result<()> {
        self.device.wait_idle()?;
        if let Some(index) = self.first_image_in_use() {
            let error = GpuError::InvalidState(format!(
                "swapchain image {index} is still referenced outside the swapchain"
            ));
            tracing::error!(parent: self.logger.span(), %error, "cannot recreate swapchain");
            return Err(error);
        }
        self.build(framebuffer_size)
    }

    fn first_image_in_use(&self) -> Option<usize> {
        first_shared_image(&self.images, &self.views)
    }

    fn build(&mut self, framebuffer_size: (u32, u32)) -> Result<()> {
        let support = self.surface.support(self.device.physical_device())?;
        let format = select_surface_format(&support.formats).ok_or_else(|| {
            GpuError::SurfaceCreation("surface reports no formats".to_string())
        })?;
        let present_mode = select_present_mode(&support.present_modes, self.config.vsync);
        let extent = calculate_extent(&support.capabilities, framebuffer_size.0, framebuffer_size.1);
        let image_count = select_image_count(&support.capabilities, self.config.desired_image_count);

        let graphics = self.device.queue(QueueType::Graphics).family;
        let present = self.device.queue(QueueType::Present).family;
        let families = [graphics, present];
        let old = self.raw;

        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface.raw())
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(self.config.usage)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);
        create_info = if graphics == present {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        };

        let raw = unsafe { self.loader.create_swapchain(&create_info, None)? };

        // Nothing outside the swapchain holds the old images, so their views
        // go first and the old swapchain after.
        self.views.clear();
        self.images.clear();
        if old != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(old, None) };
        }
        self.raw = raw;
        self.format = format;
        self.extent = extent;

        let raw_images = unsafe { self.loader.get_swapchain_images(raw)? };
        for (index, raw_image) in raw_images.into_iter().enumerate() {
            let image = Arc::new(Image::from_swapchain(
                Arc::clone(&self.device),
                raw_image,
                format.format,
                extent,
                self.config.usage,
                index,
            ));
            let view = ImageView::new(&image, &ImageViewDesc::default())?;
            self.images.push(image);
            self.views.push(view);
        }

        tracing::info!(
            parent: self.logger.span(),
            width = extent.width,
            height = extent.height,
            images = self.images.len(),
            format = ?format.format,
            ?present_mode,
            "swapchain created"
        );
        Ok(())
    }

    /// Acquire the next image, signalling `semaphore` when it is ready.
    ///
    /// The image's tracked layout is reset to `UNDEFINED`, its previous
    /// contents are not preserved.
    pub fn acquire_next_image(&self, semaphore: &Semaphore, timeout_ns: u64) -> Result<AcquiredImage> {
        let (index, suboptimal) = unsafe {
            self.loader
                .acquire_next_image(self.raw, timeout_ns, semaphore.raw(), vk::Fence::null())?
        };
        if let Some(image) = self.images.get(index as usize) {
            image.discard_contents();
        }
        Ok(AcquiredImage { index, suboptimal })
    }

    /// Present image `index` once `wait` is signalled.
    pub fn present(&self, index: u32, wait: &Semaphore) -> Result<PresentOutcome> {
        let wait_semaphores = [wait.raw()];
        let swapchains = [self.raw];
        let indices = [index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let queue = self.device.queue(QueueType::Present).raw;
        let suboptimal = unsafe { self.loader.queue_present(queue, &present_info)? };
        Ok(if suboptimal {
            PresentOutcome::Suboptimal
        } else {
            PresentOutcome::Optimal
        })
    }

    pub fn image(&self, index: u32) -> Option<&Arc<Image>> {
        self.images.get(index as usize)
    }

    pub fn image_view(&self, index: u32) -> Option<&Arc<ImageView>> {
        self.views.get(index as usize)
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.views.clear();
        self.images.clear();
        unsafe { self.loader.destroy_swapchain(self.raw, None) };
        tracing::debug!(parent: self.logger.span(), "swapchain destroyed");
    }
}

/// Index of the first image or view held by anything besides the swapchain.
/// Each image is expected to be held twice: by the swapchain and by its view.
fn first_shared_image<I, V>(images: &[Arc<I>], views: &[Arc<V>]) -> Option<usize> {
    images
        .iter()
        .zip(views)
        .position(|(image, view)| Arc::strong_count(image) > 2 || Arc::strong_count(view) > 1)
}

/// Prefer B8G8R8A8_SRGB with the sRGB non-linear colour space, else the first
/// format offered.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
}

/// FIFO with vsync. Without it MAILBOX, then IMMEDIATE, then FIFO.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// The surface's current extent, or the framebuffer size clamped to the
/// supported range when the surface leaves it to the swapchain.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// Requested count (default minimum + 1), kept within the surface limits.
/// A maximum of 0 means unlimited.
pub fn select_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, desired: Option<u32>) -> u32 {
    let count = desired
        .unwrap_or(capabilities.min_image_count + 1)
        .max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn format_preference() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_UNORM),
            surface_format(vk::Format::B8G8R8A8_SRGB),
        ];
        assert_eq!(
            select_surface_format(&formats).unwrap().format,
            vk::Format::B8G8R8A8_SRGB
        );
        assert_eq!(
            select_surface_format(&formats[..1]).unwrap().format,
            vk::Format::R8G8B8A8_UNORM
        );
        assert!(select_surface_format(&[]).is_none());
    }

    #[test]
    fn present_mode_preference() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(select_present_mode(&all, true), vk::PresentModeKHR::FIFO);
        assert_eq!(select_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            select_present_mode(&all[..2], false),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(select_present_mode(&all[..1], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_clamping() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };
        assert_eq!(calculate_extent(&caps, 4000, 10).width, 800);

        caps.current_extent.width = u32::MAX;
        let extent = calculate_extent(&caps, 4000, 0);
        assert_eq!((extent.width, extent.height), (1920, 1));
    }

    #[test]
    fn image_count_limits() {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(select_image_count(&caps, None), 3);
        assert_eq!(select_image_count(&caps, Some(8)), 3);
        assert_eq!(select_image_count(&caps, Some(1)), 2);

        let unlimited = vk::SurfaceCapabilitiesKHR {
            min_image_count: 3,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(select_image_count(&unlimited, None), 4);
    }

    #[test]
    fn images_retained_elsewhere_block_recreation() {
        let images: Vec<Arc<u32>> = (0..3).map(Arc::new).collect();
        let views: Vec<Arc<Arc<u32>>> = images.iter().map(|i| Arc::new(Arc::clone(i))).collect();
        assert_eq!(first_shared_image(&images, &views), None);

        let recorded_view = Arc::clone(&views[2]);
        assert_eq!(first_shared_image(&images, &views), Some(2));
        drop(recorded_view);

        let recorded_image = Arc::clone(&images[1]);
        assert_eq!(first_shared_image(&images, &views), Some(1));
        drop(recorded_image);
        assert_eq!(first_shared_image(&images, &views), None);
    }

    #[test]
    fn default_config() {
        let config = SwapchainConfig::default();
        assert!(config.vsync);
        assert!(config.usage.contains(vk::ImageUsageFlags::TRANSFER_DST));
    }
}
