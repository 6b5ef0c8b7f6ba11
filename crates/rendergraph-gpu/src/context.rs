//! GPU context management.

use crate::allocator::Allocator;
use crate::command::CommandPool;
use crate::device::{Device, QueueType};
use crate::error::Result;
use crate::instance::Instance;
use crate::logging::Logger;
use crate::surface::{Surface, SurfaceProvider};
use std::ffi::CStr;
use std::sync::Arc;

/// The instance, device and allocator an application works with.
///
/// Each part is reference counted, so resources created from the context keep
/// what they need alive on their own.
pub struct GpuContext {
    instance: Arc<Instance>,
    device: Arc<Device>,
    allocator: Arc<Allocator>,
    logger: Logger,
}

impl GpuContext {
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    /// The root logger; components take children of it.
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Create a command pool for `queue_type`.
    pub fn command_pool(&self, queue_type: QueueType) -> Result<CommandPool> {
        CommandPool::new(
            Arc::clone(&self.device),
            queue_type,
            self.logger.child("command"),
        )
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    device_extensions: Vec<&'static CStr>,
    logger: Option<Logger>,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "rendergraph".to_string(),
            enable_validation: cfg!(debug_assertions),
            device_extensions: Vec::new(),
            logger: None,
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Require an additional device extension.
    pub fn device_extension(mut self, extension: &'static CStr) -> Self {
        if !self.device_extensions.contains(&extension) {
            self.device_extensions.push(extension);
        }
        self
    }

    /// Root logger for the context. Defaults to one named after the app.
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Build a context without presentation support.
    pub fn build_headless(self) -> Result<GpuContext> {
        let logger = self.root_logger();
        let instance = self.create_instance(&[], &logger)?;
        self.finish(instance, None, logger)
    }

    /// Build a context that can present to `provider`'s window.
    pub fn build_with_surface(
        self,
        provider: &(impl SurfaceProvider + ?Sized),
    ) -> Result<(GpuContext, Arc<Surface>)> {
        let logger = self.root_logger();
        let extensions = provider.required_instance_extensions()?;
        let instance = self.create_instance(&extensions, &logger)?;
        let surface = Surface::new(Arc::clone(&instance), provider, logger.child("surface"))?;
        let context = self.finish(instance, Some(&surface), logger)?;
        Ok((context, surface))
    }

    fn root_logger(&self) -> Logger {
        self.logger
            .clone()
            .unwrap_or_else(|| Logger::new(&self.app_name))
    }

    fn create_instance(&self, extensions: &[&CStr], logger: &Logger) -> Result<Arc<Instance>> {
        let mut unique: Vec<&CStr> = Vec::with_capacity(extensions.len());
        for extension in extensions {
            if !unique.contains(extension) {
                unique.push(extension);
            }
        }
        Ok(Arc::new(Instance::new(
            &self.app_name,
            self.enable_validation,
            &unique,
            logger.child("instance"),
        )?))
    }

    fn finish(self, instance: Arc<Instance>, surface: Option<&Surface>, logger: Logger) -> Result<GpuContext> {
        let device = Device::new(
            Arc::clone(&instance),
            surface,
            &self.device_extensions,
            logger.child("device"),
        )?;
        let allocator = Allocator::new(Arc::clone(&device), logger.child("allocator"))?;

        tracing::info!(parent: logger.span(), app = %self.app_name, "GPU context ready");

        Ok(GpuContext {
            instance,
            device,
            allocator,
            logger,
        })
    }
}
