//! Physical device selection, logical device and queues.

use crate::error::{GpuError, Result};
use crate::instance::Instance;
use crate::logging::Logger;
use crate::surface::Surface;
use ash::vk;
use std::collections::BTreeMap;
use std::ffi::CStr;
use std::sync::Arc;

/// The kinds of queue a [`Device`] exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueType {
    Graphics,
    Compute,
    Present,
    Transfer,
}

impl QueueType {
    pub const ALL: [Self; 4] = [Self::Graphics, Self::Present, Self::Compute, Self::Transfer];
}

/// Family and index of a queue, before the device exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSlot {
    pub family: u32,
    pub index: u32,
}

/// Queue slots chosen for each [`QueueType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFamilySelection {
    pub graphics: QueueSlot,
    pub present: QueueSlot,
    pub compute: QueueSlot,
    pub transfer: QueueSlot,
    /// Number of queues to request from each used family.
    pub queue_counts: BTreeMap<u32, u32>,
}

impl QueueFamilySelection {
    pub fn slot(&self, ty: QueueType) -> QueueSlot {
        match ty {
            QueueType::Graphics => self.graphics,
            QueueType::Present => self.present,
            QueueType::Compute => self.compute,
            QueueType::Transfer => self.transfer,
        }
    }
}

/// Choose queue families for every [`QueueType`].
///
/// `supports_present` holds one flag per family, or `None` for headless use, in
/// which case presentation maps onto the graphics queue.
///
/// * Graphics and present prefer a single family that supports both.
/// * Compute prefers a family without graphics.
/// * Transfer prefers a family without graphics or compute.
///
/// Queues sharing a family get successive queue indices, wrapping around when
/// the family has fewer queues than users. Present always shares the graphics
/// queue when both live in the same family.
pub fn select_queue_families(
    families: &[vk::QueueFamilyProperties],
    supports_present: Option<&[bool]>,
) -> Result<QueueFamilySelection> {
    let has = |i: usize, flags: vk::QueueFlags| {
        families[i].queue_count > 0 && families[i].queue_flags.contains(flags)
    };
    let presents = |i: usize| supports_present.map_or(true, |p| p.get(i).copied().unwrap_or(false));
    let indices = 0..families.len();

    let combined = indices
        .clone()
        .find(|&i| has(i, vk::QueueFlags::GRAPHICS) && presents(i));
    let (graphics, present) = match combined {
        Some(i) => (i, i),
        None => {
            let graphics = indices
                .clone()
                .find(|&i| has(i, vk::QueueFlags::GRAPHICS))
                .ok_or(GpuError::NoSuitableQueueFamily(QueueType::Graphics))?;
            let present = indices
                .clone()
                .find(|&i| families[i].queue_count > 0 && presents(i))
                .ok_or(GpuError::NoSuitableQueueFamily(QueueType::Present))?;
            (graphics, present)
        }
    };

    let compute = indices
        .clone()
        .find(|&i| has(i, vk::QueueFlags::COMPUTE) && !has(i, vk::QueueFlags::GRAPHICS))
        .or_else(|| indices.clone().find(|&i| has(i, vk::QueueFlags::COMPUTE)))
        .ok_or(GpuError::NoSuitableQueueFamily(QueueType::Compute))?;

    // Graphics and compute families implicitly support transfer.
    let transfer_capable = |i: usize| {
        has(i, vk::QueueFlags::TRANSFER)
            || has(i, vk::QueueFlags::GRAPHICS)
            || has(i, vk::QueueFlags::COMPUTE)
    };
    let transfer = indices
        .clone()
        .find(|&i| {
            has(i, vk::QueueFlags::TRANSFER)
                && !has(i, vk::QueueFlags::GRAPHICS)
                && !has(i, vk::QueueFlags::COMPUTE)
        })
        .or_else(|| indices.clone().find(|&i| transfer_capable(i)))
        .ok_or(GpuError::NoSuitableQueueFamily(QueueType::Transfer))?;

    let mut used: BTreeMap<u32, u32> = BTreeMap::new();
    let mut assign = |family: usize| {
        let family = family as u32;
        let counter = used.entry(family).or_insert(0);
        let index = *counter % families[family as usize].queue_count;
        *counter += 1;
        QueueSlot { family, index }
    };

    let graphics = assign(graphics);
    let present = if present as u32 == graphics.family {
        graphics
    } else {
        assign(present)
    };
    let compute = assign(compute);
    let transfer = assign(transfer);

    let queue_counts = used
        .into_iter()
        .map(|(family, count)| (family, count.min(families[family as usize].queue_count)))
        .collect();

    Ok(QueueFamilySelection {
        graphics,
        present,
        compute,
        transfer,
        queue_counts,
    })
}

/// A device queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Queue {
    pub family: u32,
    pub index: u32,
    pub raw: vk::Queue,
}

/// The logical device and its queues.
///
/// Shared through `Arc`. Keeps the [`Instance`] alive and is destroyed after
/// every allocator, pool and resource created from it.
pub struct Device {
    instance: Arc<Instance>,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    raw: ash::Device,
    graphics: Queue,
    present: Queue,
    compute: Queue,
    transfer: Queue,
    logger: Logger,
}

impl Device {
    /// Select the best physical device and create the logical device.
    ///
    /// When `surface` is given, a present-capable family is required and the
    /// swapchain extension is enabled.
    pub fn new(
        instance: Arc<Instance>,
        surface: Option<&Surface>,
        required_extensions: &[&CStr],
        logger: Logger,
    ) -> Result<Arc<Self>> {
        let mut extensions: Vec<&CStr> = required_extensions.to_vec();
        if surface.is_some() && !extensions.contains(&ash::khr::swapchain::NAME) {
            extensions.push(ash::khr::swapchain::NAME);
        }
        #[cfg(target_os = "macos")]
        if !extensions.contains(&ash::khr::portability_subset::NAME) {
            extensions.push(ash::khr::portability_subset::NAME);
        }

        let (physical_device, selection) =
            select_physical_device(&instance, surface, &extensions, &logger)?;

        let properties = unsafe { instance.raw().get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.raw().get_physical_device_memory_properties(physical_device) };
        let device_name = properties.device_name_as_c_str().unwrap_or_default();
        tracing::info!(
            parent: logger.span(),
            name = %device_name.to_string_lossy(),
            device_type = ?properties.device_type,
            "selected GPU"
        );
        tracing::debug!(parent: logger.span(), ?selection, "queue families");

        let priorities = [1.0_f32; 16];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = selection
            .queue_counts
            .iter()
            .map(|(&family, &count)| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities[..count.min(16) as usize])
            })
            .collect();

        let extension_names: Vec<*const std::ffi::c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();

        let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .features(vk::PhysicalDeviceFeatures::default())
            .push_next(&mut vulkan_1_3_features);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features2);

        let raw = unsafe {
            instance
                .raw()
                .create_device(physical_device, &create_info, None)?
        };

        let queue = |slot: QueueSlot| Queue {
            family: slot.family,
            index: slot.index,
            raw: unsafe { raw.get_device_queue(slot.family, slot.index) },
        };
        let graphics = queue(selection.graphics);
        let present = queue(selection.present);
        let compute = queue(selection.compute);
        let transfer = queue(selection.transfer);

        tracing::debug!(parent: logger.span(), enabled = ?extensions, "device extensions");

        Ok(Arc::new(Self {
            instance,
            physical_device,
            properties,
            memory_properties,
            raw,
            graphics,
            present,
            compute,
            transfer,
            logger,
        }))
    }

    /// The raw logical device.
    pub fn raw(&self) -> &ash::Device {
        &self.raw
    }

    /// The instance this device was created from.
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.properties.limits
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// The queue serving `ty`.
    pub fn queue(&self, ty: QueueType) -> &Queue {
        match ty {
            QueueType::Graphics => &self.graphics,
            QueueType::Present => &self.present,
            QueueType::Compute => &self.compute,
            QueueType::Transfer => &self.transfer,
        }
    }

    /// Find a memory type index matching `type_bits` with all of `flags`.
    pub fn find_memory_type(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Option<u32> {
        find_memory_type(&self.memory_properties, type_bits, flags)
    }

    /// Block until the device has finished all submitted work.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.raw.device_wait_idle()? };
        Ok(())
    }

    pub(crate) fn logger(&self) -> &Logger {
        &self.logger
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(error) = unsafe { self.raw.device_wait_idle() } {
            tracing::error!(parent: self.logger.span(), %error, "wait idle failed before destroying device");
        }
        unsafe { self.raw.destroy_device(None) };
        tracing::debug!(parent: self.logger.span(), "device destroyed");
    }
}

/// Find a memory type index matching `type_bits` with all of `flags`.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    properties.memory_types[..properties.memory_type_count as usize]
        .iter()
        .enumerate()
        .find(|(i, ty)| type_bits & (1 << i) != 0 && ty.property_flags.contains(flags))
        .map(|(i, _)| i as u32)
}

/// Pick the highest scoring device that supports Vulkan 1.3, the required
/// extensions and a full set of queue families.
fn select_physical_device(
    instance: &Instance,
    surface: Option<&Surface>,
    extensions: &[&CStr],
    logger: &Logger,
) -> Result<(vk::PhysicalDevice, QueueFamilySelection)> {
    let raw = instance.raw();
    let devices = unsafe { raw.enumerate_physical_devices()? };
    let mut best: Option<(i32, vk::PhysicalDevice, QueueFamilySelection)> = None;

    for device in devices {
        let properties = unsafe { raw.get_physical_device_properties(device) };
        let name = properties
            .device_name_as_c_str()
            .unwrap_or_default()
            .to_string_lossy()
            .into_owned();

        if vk::api_version_major(properties.api_version) == 1
            && vk::api_version_minor(properties.api_version) < 3
        {
            tracing::debug!(parent: logger.span(), %name, "rejected: Vulkan 1.3 unsupported");
            continue;
        }

        let available = unsafe { raw.enumerate_device_extension_properties(device)? };
        let available: Vec<&CStr> = available
            .iter()
            .map(|props| props.extension_name_as_c_str().unwrap_or_default())
            .collect();
        if let Some(missing) = extensions.iter().find(|ext| !available.contains(ext)) {
            tracing::debug!(parent: logger.span(), %name, ?missing, "rejected: missing extension");
            continue;
        }

        let families = unsafe { raw.get_physical_device_queue_family_properties(device) };
        let present_support = match surface {
            Some(surface) => Some(
                (0..families.len() as u32)
                    .map(|family| surface.supports_present(device, family))
                    .collect::<Result<Vec<bool>>>()?,
            ),
            None => None,
        };
        let selection = match select_queue_families(&families, present_support.as_deref()) {
            Ok(selection) => selection,
            Err(e) => {
                tracing::debug!(parent: logger.span(), %name, error = %e, "rejected");
                continue;
            }
        };

        let score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
            _ => 10,
        };
        if best.as_ref().map_or(true, |(best_score, ..)| score > *best_score) {
            best = Some((score, device, selection));
        }
    }

    best.map(|(_, device, selection)| (device, selection))
        .ok_or(GpuError::NoSuitableDevice)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, queue_count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count,
            ..Default::default()
        }
    }

    const GCT: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::GRAPHICS.as_raw()
            | vk::QueueFlags::COMPUTE.as_raw()
            | vk::QueueFlags::TRANSFER.as_raw(),
    );
    const CT: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::COMPUTE.as_raw() | vk::QueueFlags::TRANSFER.as_raw(),
    );

    #[test]
    fn single_family_round_robin() {
        let families = [family(GCT, 2)];
        let sel = select_queue_families(&families, Some(&[true])).unwrap();
        assert_eq!(sel.graphics, QueueSlot { family: 0, index: 0 });
        assert_eq!(sel.present, sel.graphics);
        assert_eq!(sel.compute, QueueSlot { family: 0, index: 1 });
        // Wraps around the two available queues.
        assert_eq!(sel.transfer, QueueSlot { family: 0, index: 0 });
        assert_eq!(sel.queue_counts.get(&0), Some(&2));
    }

    #[test]
    fn single_queue_is_clamped() {
        let families = [family(GCT, 1)];
        let sel = select_queue_families(&families, None).unwrap();
        for ty in QueueType::ALL {
            assert_eq!(sel.slot(ty), QueueSlot { family: 0, index: 0 });
        }
        assert_eq!(sel.queue_counts.get(&0), Some(&1));
    }

    #[test]
    fn prefers_dedicated_compute_and_transfer() {
        let families = [
            family(GCT, 16),
            family(CT, 8),
            family(vk::QueueFlags::TRANSFER, 2),
        ];
        let sel = select_queue_families(&families, Some(&[true, false, false])).unwrap();
        assert_eq!(sel.graphics.family, 0);
        assert_eq!(sel.present.family, 0);
        assert_eq!(sel.compute, QueueSlot { family: 1, index: 0 });
        assert_eq!(sel.transfer, QueueSlot { family: 2, index: 0 });
        assert_eq!(sel.queue_counts.len(), 3);
    }

    #[test]
    fn prefers_combined_graphics_present_family() {
        let families = [family(GCT, 1), family(GCT, 1)];
        let sel = select_queue_families(&families, Some(&[false, true])).unwrap();
        assert_eq!(sel.graphics.family, 1);
        assert_eq!(sel.present.family, 1);
    }

    #[test]
    fn separate_present_family() {
        let families = [family(GCT, 1), family(vk::QueueFlags::TRANSFER, 1)];
        let sel = select_queue_families(&families, Some(&[false, true])).unwrap();
        assert_eq!(sel.graphics.family, 0);
        assert_eq!(sel.present.family, 1);
        // The present-only family is also the dedicated transfer family.
        assert_eq!(sel.transfer, QueueSlot { family: 1, index: 0 });
    }

    #[test]
    fn missing_families_are_setup_errors() {
        let families = [family(CT, 1)];
        let err = select_queue_families(&families, None).unwrap_err();
        assert!(matches!(
            err,
            GpuError::NoSuitableQueueFamily(QueueType::Graphics)
        ));

        let families = [family(GCT, 1)];
        let err = select_queue_families(&families, Some(&[false])).unwrap_err();
        assert!(matches!(
            err,
            GpuError::NoSuitableQueueFamily(QueueType::Present)
        ));
    }

    #[test]
    fn memory_type_lookup() {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            ..Default::default()
        };
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        assert_eq!(
            find_memory_type(&props, 0b11, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Some(1)
        );
        assert_eq!(
            find_memory_type(&props, 0b01, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
    }
}
