//! Presentation surfaces and the window contract.
//!
//! The GPU crate never talks to a windowing system directly. A window
//! implements [`SurfaceProvider`] and hands out the instance extensions and the
//! `VkSurfaceKHR` it needs.

use crate::error::{GpuError, Result};
use crate::instance::Instance;
use crate::logging::Logger;
use ash::vk;
use std::ffi::CStr;
use std::sync::Arc;

/// A window that Vulkan can present to.
pub trait SurfaceProvider {
    /// Instance extensions needed to create a surface for this window.
    fn required_instance_extensions(&self) -> Result<Vec<&'static CStr>>;

    /// Create a surface for this window on `instance`.
    fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance)
        -> Result<vk::SurfaceKHR>;

    /// Current framebuffer size in pixels.
    fn framebuffer_size(&self) -> (u32, u32);

    /// Process pending window events.
    fn poll_events(&mut self);

    /// Whether the user asked to close the window.
    fn should_close(&self) -> bool;
}

/// What a surface supports on a given physical device.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// An owned `VkSurfaceKHR`, destroyed on drop.
pub struct Surface {
    instance: Arc<Instance>,
    loader: ash::khr::surface::Instance,
    raw: vk::SurfaceKHR,
    logger: Logger,
}

impl Surface {
    /// Create a surface for `provider`'s window.
    pub fn new(
        instance: Arc<Instance>,
        provider: &(impl SurfaceProvider + ?Sized),
        logger: Logger,
    ) -> Result<Arc<Self>> {
        let raw = provider.create_surface(instance.entry(), instance.raw())?;
        if raw == vk::SurfaceKHR::null() {
            return Err(GpuError::SurfaceCreation(
                "provider returned a null surface".to_string(),
            ));
        }
        let loader = ash::khr::surface::Instance::new(instance.entry(), instance.raw());
        tracing::debug!(parent: logger.span(), "surface created");
        Ok(Arc::new(Self {
            instance,
            loader,
            raw,
            logger,
        }))
    }

    pub fn raw(&self) -> vk::SurfaceKHR {
        self.raw
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// Whether `family` on `physical_device` can present to this surface.
    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, family: u32) -> Result<bool> {
        let supported = unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, family, self.raw)?
        };
        Ok(supported)
    }

    /// Query capabilities, formats and present modes.
    pub fn support(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        unsafe {
            Ok(SurfaceSupport {
                capabilities: self
                    .loader
                    .get_physical_device_surface_capabilities(physical_device, self.raw)?,
                formats: self
                    .loader
                    .get_physical_device_surface_formats(physical_device, self.raw)?,
                present_modes: self
                    .loader
                    .get_physical_device_surface_present_modes(physical_device, self.raw)?,
            })
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.raw, None) };
        tracing::debug!(parent: self.logger.span(), "surface destroyed");
    }
}
