//! Vulkan instance creation.

use crate::error::{GpuError, Result};
use crate::logging::Logger;
use ash::vk;
use std::ffi::{c_void, CStr, CString};

/// Validation layers to enable when validation is requested.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Owns the Vulkan entry point, the instance and the optional debug messenger.
///
/// Shared through `Arc`; destroyed when the last device, surface or context
/// holding it is dropped.
pub struct Instance {
    entry: ash::Entry,
    raw: ash::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    validation: bool,
    logger: Logger,
}

impl Instance {
    /// Load Vulkan and create an instance with the given extensions.
    ///
    /// Every requested layer and extension must be available; a missing one is
    /// a setup error.
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        extensions: &[&CStr],
        logger: Logger,
    ) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::LoaderUnavailable(e.to_string()))?;

        let layers = if enable_validation {
            validation_layers()
        } else {
            Vec::new()
        };

        let mut extensions: Vec<&CStr> = extensions.to_vec();
        if enable_validation && !extensions.contains(&ash::ext::debug_utils::NAME) {
            extensions.push(ash::ext::debug_utils::NAME);
        }
        #[cfg(target_os = "macos")]
        if !extensions.contains(&ash::khr::portability_enumeration::NAME) {
            extensions.push(ash::khr::portability_enumeration::NAME);
        }

        check_layers(&entry, &layers, &logger)?;
        check_extensions(&entry, &extensions, &logger)?;

        let app_name = CString::new(app_name)
            .map_err(|_| GpuError::InvalidState("application name contains NUL".to_string()))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"rendergraph")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let extension_names: Vec<*const std::ffi::c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();
        let layer_names: Vec<*const std::ffi::c_char> = layers.iter().map(|l| l.as_ptr()).collect();

        #[cfg(target_os = "macos")]
        let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        #[cfg(not(target_os = "macos"))]
        let create_flags = vk::InstanceCreateFlags::empty();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names)
            .flags(create_flags);

        let raw = unsafe { entry.create_instance(&create_info, None)? };

        let debug_utils = if enable_validation {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &raw);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));
            match unsafe { loader.create_debug_utils_messenger(&messenger_info, None) } {
                Ok(messenger) => Some((loader, messenger)),
                Err(e) => {
                    unsafe { raw.destroy_instance(None) };
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        tracing::info!(parent: logger.span(), validation = enable_validation, "Vulkan instance created");

        Ok(Self {
            entry,
            raw,
            debug_utils,
            validation: enable_validation,
            logger,
        })
    }

    /// The loaded Vulkan entry point.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// The raw instance.
    pub fn raw(&self) -> &ash::Instance {
        &self.raw
    }

    /// Whether validation layers are enabled.
    pub fn validation_enabled(&self) -> bool {
        self.validation
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.raw.destroy_instance(None);
        }
        tracing::debug!(parent: self.logger.span(), "Vulkan instance destroyed");
    }
}

/// Fail if any requested layer is missing.
fn check_layers(entry: &ash::Entry, layers: &[&CStr], logger: &Logger) -> Result<()> {
    let available = unsafe { entry.enumerate_instance_layer_properties()? };
    let available: Vec<&CStr> = available
        .iter()
        .map(|props| props.layer_name_as_c_str().unwrap_or_default())
        .collect();

    tracing::debug!(parent: logger.span(), ?available, "available instance layers");

    for layer in layers {
        if !available.contains(layer) {
            return Err(GpuError::LayerNotSupported(layer.to_string_lossy().into_owned()));
        }
    }
    Ok(())
}

/// Fail if any requested instance extension is missing.
fn check_extensions(entry: &ash::Entry, extensions: &[&CStr], logger: &Logger) -> Result<()> {
    let available = unsafe { entry.enumerate_instance_extension_properties(None)? };
    let available: Vec<&CStr> = available
        .iter()
        .map(|props| props.extension_name_as_c_str().unwrap_or_default())
        .collect();

    tracing::debug!(parent: logger.span(), ?available, "available instance extensions");

    for extension in extensions {
        if !available.contains(extension) {
            return Err(GpuError::ExtensionNotSupported(
                extension.to_string_lossy().into_owned(),
            ));
        }
    }

    tracing::debug!(parent: logger.span(), enabled = ?extensions, "enabled instance extensions");
    Ok(())
}

/// Route validation layer messages into `tracing`.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = match unsafe { callback_data.as_ref() } {
        Some(data) if !data.p_message.is_null() => {
            unsafe { CStr::from_ptr(data.p_message) }.to_string_lossy()
        }
        _ => return vk::FALSE,
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vulkan", ?message_type, "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vulkan", ?message_type, "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        tracing::debug!(target: "vulkan", ?message_type, "{message}");
    } else {
        tracing::trace!(target: "vulkan", ?message_type, "{message}");
    }

    vk::FALSE
}
