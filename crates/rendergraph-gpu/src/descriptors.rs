//! Descriptor set layouts, growable descriptor pools and descriptor sets.

use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::logging::Logger;
use crate::resources::{Buffer, GpuResource, ImageView, InFlight, Sampler};
use ash::vk;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One binding of a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingInfo {
    pub descriptor_type: vk::DescriptorType,
    pub stage_flags: vk::ShaderStageFlags,
    pub count: u32,
}

impl BindingInfo {
    pub fn new(descriptor_type: vk::DescriptorType, stage_flags: vk::ShaderStageFlags) -> Self {
        Self {
            descriptor_type,
            stage_flags,
            count: 1,
        }
    }

    pub fn count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }
}

/// Bindings of a layout, indexed by insertion order.
///
/// Frozen once the native layout exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingTable {
    bindings: Vec<BindingInfo>,
    frozen: bool,
}

impl BindingTable {
    /// Append a binding and return its index.
    pub fn push(&mut self, info: BindingInfo) -> Result<u32> {
        if self.frozen {
            return Err(GpuError::LayoutFrozen);
        }
        self.bindings.push(info);
        Ok(self.bindings.len() as u32 - 1)
    }

    pub fn freeze(&mut self) -> Result<()> {
        if self.frozen {
            return Err(GpuError::LayoutFrozen);
        }
        self.frozen = true;
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn get(&self, binding: u32) -> Option<&BindingInfo> {
        self.bindings.get(binding as usize)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BindingInfo> {
        self.bindings.iter()
    }

    /// Validate a write of type `ty` to `binding`.
    pub fn check_write(&self, binding: u32, ty: vk::DescriptorType) -> Result<()> {
        let info = self.get(binding).ok_or(GpuError::BindingOutOfRange {
            binding,
            count: self.bindings.len() as u32,
        })?;
        if info.descriptor_type != ty {
            return Err(GpuError::DescriptorTypeMismatch {
                binding,
                expected: info.descriptor_type,
                actual: ty,
            });
        }
        Ok(())
    }
}

/// A descriptor set layout, built binding by binding and then compiled.
pub struct DescriptorSetLayout {
    device: Arc<Device>,
    flags: vk::DescriptorSetLayoutCreateFlags,
    table: BindingTable,
    raw: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    pub fn new(device: Arc<Device>, flags: vk::DescriptorSetLayoutCreateFlags) -> Self {
        Self {
            device,
            flags,
            table: BindingTable::default(),
            raw: vk::DescriptorSetLayout::null(),
        }
    }

    /// Add the next binding. Its index is the number of bindings added before.
    pub fn add_binding(&mut self, info: BindingInfo) -> Result<u32> {
        self.table.push(info).map_err(|e| self.report(e))
    }

    /// Create the native layout. Fails if already compiled.
    pub fn compile(&mut self) -> Result<()> {
        self.table.freeze().map_err(|e| self.report(e))?;

        let bindings: Vec<vk::DescriptorSetLayoutBinding> = self
            .table
            .iter()
            .enumerate()
            .map(|(index, info)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(index as u32)
                    .descriptor_type(info.descriptor_type)
                    .descriptor_count(info.count)
                    .stage_flags(info.stage_flags)
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(self.flags)
            .bindings(&bindings);

        match unsafe { self.device.raw().create_descriptor_set_layout(&create_info, None) } {
            Ok(raw) => {
                self.raw = raw;
                Ok(())
            }
            Err(e) => {
                self.table.frozen = false;
                Err(e.into())
            }
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.raw != vk::DescriptorSetLayout::null()
    }

    /// The native layout, or a null handle before [`Self::compile`].
    pub fn raw(&self) -> vk::DescriptorSetLayout {
        self.raw
    }

    pub fn bindings(&self) -> &BindingTable {
        &self.table
    }

    pub fn descriptor_type(&self, binding: u32) -> Option<vk::DescriptorType> {
        self.table.get(binding).map(|info| info.descriptor_type)
    }

    fn report(&self, error: GpuError) -> GpuError {
        tracing::error!(parent: self.device.logger().span(), %error, "descriptor set layout misuse");
        error
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        if self.is_compiled() {
            unsafe { self.device.raw().destroy_descriptor_set_layout(self.raw, None) };
        }
    }
}

/// Size of each block of a [`DescriptorPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorPoolConfig {
    /// Descriptors of each type in `types` per block.
    pub descriptors_per_type: u32,
    /// Sets per block.
    pub max_sets: u32,
    pub types: Vec<vk::DescriptorType>,
}

impl Default for DescriptorPoolConfig {
    fn default() -> Self {
        Self {
            descriptors_per_type: 100,
            max_sets: 10,
            types: vec![
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::DescriptorType::SAMPLED_IMAGE,
                vk::DescriptorType::STORAGE_IMAGE,
                vk::DescriptorType::SAMPLER,
            ],
        }
    }
}

impl DescriptorPoolConfig {
    pub fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        self.types
            .iter()
            .map(|&ty| {
                vk::DescriptorPoolSize::default()
                    .ty(ty)
                    .descriptor_count(self.descriptors_per_type)
            })
            .collect()
    }
}

/// Whether a failed set allocation should be retried from a new block.
pub fn is_pool_exhausted(result: vk::Result) -> bool {
    matches!(
        result,
        vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL
    )
}

struct PoolBlocks {
    device: Arc<Device>,
    config: DescriptorPoolConfig,
    blocks: Mutex<Vec<vk::DescriptorPool>>,
    logger: Logger,
}

impl PoolBlocks {
    fn create_block(&self) -> Result<vk::DescriptorPool> {
        let sizes = self.config.pool_sizes();
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(self.config.max_sets)
            .pool_sizes(&sizes);
        let block = unsafe { self.device.raw().create_descriptor_pool(&create_info, None)? };
        Ok(block)
    }
}

impl Drop for PoolBlocks {
    fn drop(&mut self) {
        for block in self.blocks.get_mut().drain(..) {
            unsafe { self.device.raw().destroy_descriptor_pool(block, None) };
        }
    }
}

/// A stack of native descriptor pools that grows when the top one is full.
///
/// Native pools are destroyed once the pool and every set allocated from it
/// have been dropped.
pub struct DescriptorPool {
    inner: Arc<PoolBlocks>,
}

impl DescriptorPool {
    pub fn new(device: Arc<Device>, config: DescriptorPoolConfig, logger: Logger) -> Result<Self> {
        let inner = PoolBlocks {
            device,
            config,
            blocks: Mutex::new(Vec::new()),
            logger,
        };
        let first = inner.create_block()?;
        inner.blocks.lock().push(first);
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Number of native pools allocated so far.
    pub fn block_count(&self) -> usize {
        self.inner.blocks.lock().len()
    }

    /// Allocate a set for a compiled `layout`.
    pub fn allocate_descriptor_set(
        &self,
        layout: &Arc<DescriptorSetLayout>,
    ) -> Result<Arc<DescriptorSet>> {
        if !layout.is_compiled() {
            return Err(layout.report(GpuError::LayoutNotCompiled));
        }

        let mut blocks = self.inner.blocks.lock();
        let device = self.inner.device.raw();
        let layouts = [layout.raw()];
        let allocate = |block: vk::DescriptorPool| {
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(block)
                .set_layouts(&layouts);
            unsafe { device.allocate_descriptor_sets(&alloc_info) }
        };

        let top = *blocks.last().ok_or_else(|| {
            GpuError::InvalidState("descriptor pool has no blocks".to_string())
        })?;
        let (block, sets) = match allocate(top) {
            Ok(sets) => (top, sets),
            Err(e) if is_pool_exhausted(e) => {
                let block = self.inner.create_block()?;
                blocks.push(block);
                tracing::debug!(parent: self.inner.logger.span(), blocks = blocks.len(), "descriptor pool grown");
                (block, allocate(block)?)
            }
            Err(e) => return Err(e.into()),
        };
        drop(blocks);

        let raw = sets
            .first()
            .copied()
            .ok_or(GpuError::Vulkan(vk::Result::ERROR_UNKNOWN))?;

        Ok(Arc::new(DescriptorSet {
            pool: Arc::clone(&self.inner),
            block,
            raw,
            layout: Arc::clone(layout),
            pending: Mutex::new(Vec::new()),
            bound: Mutex::new(BTreeMap::new()),
            in_flight: InFlight::default(),
        }))
    }
}

enum PendingWrite {
    Buffer {
        binding: u32,
        ty: vk::DescriptorType,
        buffer: Arc<Buffer>,
        offset: u64,
        range: u64,
    },
    Image {
        binding: u32,
        ty: vk::DescriptorType,
        view: Arc<ImageView>,
        sampler: Option<Arc<Sampler>>,
        layout: vk::ImageLayout,
    },
}

impl PendingWrite {
    fn binding(&self) -> u32 {
        match self {
            Self::Buffer { binding, .. } | Self::Image { binding, .. } => *binding,
        }
    }

    fn resources(&self) -> Vec<Arc<dyn GpuResource>> {
        match self {
            Self::Buffer { buffer, .. } => vec![buffer.clone()],
            Self::Image { view, sampler, .. } => {
                let mut resources: Vec<Arc<dyn GpuResource>> = vec![view.clone()];
                if let Some(sampler) = sampler {
                    resources.push(sampler.clone());
                }
                resources
            }
        }
    }
}

/// A descriptor set with queued writes.
///
/// Writes are validated against the layout when queued and applied together
/// by [`DescriptorSet::update`]. The set keeps every bound resource alive.
pub struct DescriptorSet {
    pool: Arc<PoolBlocks>,
    block: vk::DescriptorPool,
    raw: vk::DescriptorSet,
    layout: Arc<DescriptorSetLayout>,
    pending: Mutex<Vec<PendingWrite>>,
    bound: Mutex<BTreeMap<u32, Vec<Arc<dyn GpuResource>>>>,
    in_flight: InFlight,
}

impl DescriptorSet {
    pub fn raw(&self) -> vk::DescriptorSet {
        self.raw
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    /// Whether an applied write has bound resources to `binding`.
    pub fn is_bound(&self, binding: u32) -> bool {
        self.bound.lock().contains_key(&binding)
    }

    /// Number of writes waiting for [`Self::update`].
    pub fn pending_writes(&self) -> usize {
        self.pending.lock().len()
    }

    /// Queue a buffer descriptor write.
    pub fn write_buffer(
        &self,
        binding: u32,
        ty: vk::DescriptorType,
        buffer: &Arc<Buffer>,
        offset: u64,
        range: u64,
    ) -> Result<()> {
        self.check(binding, ty)?;
        self.pending.lock().push(PendingWrite::Buffer {
            binding,
            ty,
            buffer: Arc::clone(buffer),
            offset,
            range,
        });
        Ok(())
    }

    /// Queue an image descriptor write.
    pub fn write_image(
        &self,
        binding: u32,
        ty: vk::DescriptorType,
        view: &Arc<ImageView>,
        sampler: Option<&Arc<Sampler>>,
        layout: vk::ImageLayout,
    ) -> Result<()> {
        self.check(binding, ty)?;
        self.pending.lock().push(PendingWrite::Image {
            binding,
            ty,
            view: Arc::clone(view),
            sampler: sampler.cloned(),
            layout,
        });
        Ok(())
    }

    fn check(&self, binding: u32, ty: vk::DescriptorType) -> Result<()> {
        self.layout
            .bindings()
            .check_write(binding, ty)
            .map_err(|e| self.layout.report(e))
    }

    /// Apply all queued writes in one call.
    ///
    /// Fails while a pending submission uses this set.
    pub fn update(&self) -> Result<()> {
        if !self.in_flight.is_idle() {
            return Err(self.layout.report(GpuError::InvalidState(
                "descriptor set updated while in use by the GPU".to_string(),
            )));
        }

        let writes = std::mem::take(&mut *self.pending.lock());
        if writes.is_empty() {
            return Ok(());
        }

        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        for write in &writes {
            match write {
                PendingWrite::Buffer {
                    buffer,
                    offset,
                    range,
                    ..
                } => buffer_infos.push(
                    vk::DescriptorBufferInfo::default()
                        .buffer(buffer.raw())
                        .offset(*offset)
                        .range(*range),
                ),
                PendingWrite::Image {
                    view,
                    sampler,
                    layout,
                    ..
                } => image_infos.push(
                    vk::DescriptorImageInfo::default()
                        .image_view(view.raw())
                        .sampler(sampler.as_ref().map_or(vk::Sampler::null(), |s| s.raw()))
                        .image_layout(*layout),
                ),
            }
        }

        let mut next_buffer = 0;
        let mut next_image = 0;
        let native: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .map(|write| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(self.raw)
                    .dst_binding(write.binding())
                    .dst_array_element(0);
                match write {
                    PendingWrite::Buffer { ty, .. } => {
                        next_buffer += 1;
                        base.descriptor_type(*ty)
                            .buffer_info(std::slice::from_ref(&buffer_infos[next_buffer - 1]))
                    }
                    PendingWrite::Image { ty, .. } => {
                        next_image += 1;
                        base.descriptor_type(*ty)
                            .image_info(std::slice::from_ref(&image_infos[next_image - 1]))
                    }
                }
            })
            .collect();

        unsafe { self.pool.device.raw().update_descriptor_sets(&native, &[]) };

        let mut bound = self.bound.lock();
        for write in &writes {
            bound.insert(write.binding(), write.resources());
        }
        Ok(())
    }
}

impl GpuResource for DescriptorSet {
    fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    fn debug_name(&self) -> &str {
        "descriptor set"
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        crate::resources::check_idle_on_drop(&*self, &self.pool.logger);
        let freed = unsafe {
            self.pool
                .device
                .raw()
                .free_descriptor_sets(self.block, &[self.raw])
        };
        if let Err(error) = freed {
            tracing::error!(parent: self.pool.logger.span(), %error, "failed to free descriptor set");
        }
    }
}
