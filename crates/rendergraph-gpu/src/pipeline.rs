//! Compute and graphics pipelines.

use crate::command::{CommandBuffer, CommandBufferState};
use crate::descriptors::{DescriptorSet, DescriptorSetLayout};
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::logging::Logger;
use crate::resources::{GpuResource, InFlight};
use crate::shader::{build_set_layouts, merge_stage_parameters, Shader, ShaderStage};
use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;

/// Fixed-function state of a graphics pipeline.
///
/// Rendering uses dynamic rendering, so attachments are described by format.
#[derive(Debug, Clone)]
pub struct GraphicsPipelineConfig {
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub samples: vk::SampleCountFlags,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare_op: vk::CompareOp,
    pub color_formats: Vec<vk::Format>,
    /// Blend state per colour attachment. Missing entries are not blended.
    pub color_blend: Vec<vk::PipelineColorBlendAttachmentState>,
    pub depth_format: Option<vk::Format>,
    pub stencil_format: Option<vk::Format>,
    pub dynamic_states: Vec<vk::DynamicState>,
    pub push_constant_ranges: Vec<vk::PushConstantRange>,
}

impl Default for GraphicsPipelineConfig {
    fn default() -> Self {
        Self {
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            samples: vk::SampleCountFlags::TYPE_1,
            depth_test: false,
            depth_write: false,
            depth_compare_op: vk::CompareOp::LESS,
            color_formats: vec![vk::Format::B8G8R8A8_SRGB],
            color_blend: vec![opaque_blend()],
            depth_format: None,
            stencil_format: None,
            dynamic_states: vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
            push_constant_ranges: Vec::new(),
        }
    }
}

impl GraphicsPipelineConfig {
    /// Blend states for every colour attachment, padding with opaque writes.
    pub fn attachment_blend_states(&self) -> Vec<vk::PipelineColorBlendAttachmentState> {
        (0..self.color_formats.len())
            .map(|i| self.color_blend.get(i).copied().unwrap_or_else(opaque_blend))
            .collect()
    }
}

/// Colour attachment state that writes RGBA without blending.
pub fn opaque_blend() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::default()
        .blend_enable(false)
        .color_write_mask(vk::ColorComponentFlags::RGBA)
}

/// Shader stages reachable by push constants in `ranges`.
pub fn push_constant_stages(ranges: &[vk::PushConstantRange], offset: u32, size: u32) -> vk::ShaderStageFlags {
    let Some(end) = offset.checked_add(size) else {
        return vk::ShaderStageFlags::empty();
    };
    ranges
        .iter()
        .filter(|r| {
            offset >= r.offset && r.offset.checked_add(r.size).is_some_and(|range_end| end <= range_end)
        })
        .fold(vk::ShaderStageFlags::empty(), |acc, r| acc | r.stage_flags)
}

/// What kind of pipeline this is, with the shaders it was built from.
pub enum PipelineKind {
    Compute {
        shader: Arc<Shader>,
    },
    Graphics {
        vertex: Arc<Shader>,
        fragment: Arc<Shader>,
        config: Box<GraphicsPipelineConfig>,
    },
}

impl PipelineKind {
    fn bind_point(&self) -> vk::PipelineBindPoint {
        match self {
            Self::Compute { .. } => vk::PipelineBindPoint::COMPUTE,
            Self::Graphics { .. } => vk::PipelineBindPoint::GRAPHICS,
        }
    }
}

/// A pipeline and its layout.
///
/// Set `n` of the layout is set `n` of the shaders. For graphics, bindings the
/// vertex and fragment shaders both declare are merged and visible to both
/// stages.
pub struct Pipeline {
    device: Arc<Device>,
    raw: vk::Pipeline,
    layout: vk::PipelineLayout,
    kind: PipelineKind,
    set_layouts: Vec<Arc<DescriptorSetLayout>>,
    push_constant_ranges: Vec<vk::PushConstantRange>,
    in_flight: InFlight,
    logger: Logger,
}

impl Pipeline {
    pub fn compute(device: Arc<Device>, shader: Arc<Shader>, logger: Logger) -> Result<Arc<Self>> {
        Self::compute_with_push_constants(device, shader, &[], logger)
    }

    pub fn compute_with_push_constants(
        device: Arc<Device>,
        shader: Arc<Shader>,
        push_constant_ranges: &[vk::PushConstantRange],
        logger: Logger,
    ) -> Result<Arc<Self>> {
        check_stage(&shader, ShaderStage::Compute)?;
        let set_layouts = shader.set_layouts().to_vec();
        let layout = create_layout(&device, &set_layouts, push_constant_ranges)?;

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(shader.stage_info())
            .layout(layout);
        let raw = unsafe {
            device
                .raw()
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        let raw = finish_creation(&device, layout, raw)?;

        tracing::debug!(parent: logger.span(), sets = set_layouts.len(), "compute pipeline created");

        Ok(Arc::new(Self {
            device,
            raw,
            layout,
            kind: PipelineKind::Compute { shader },
            set_layouts,
            push_constant_ranges: push_constant_ranges.to_vec(),
            in_flight: InFlight::default(),
            logger,
        }))
    }

    pub fn graphics(
        device: Arc<Device>,
        vertex: Arc<Shader>,
        fragment: Arc<Shader>,
        config: GraphicsPipelineConfig,
        logger: Logger,
    ) -> Result<Arc<Self>> {
        check_stage(&vertex, ShaderStage::Vertex)?;
        check_stage(&fragment, ShaderStage::Fragment)?;

        let parameters = merge_stage_parameters(&[vertex.parameters(), fragment.parameters()])?;
        let set_layouts = build_set_layouts(&device, &parameters)?;
        let layout = create_layout(&device, &set_layouts, &config.push_constant_ranges)?;

        let stages = [vertex.stage_info(), fragment.stage_info()];
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&config.vertex_bindings)
            .vertex_attribute_descriptions(&config.vertex_attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(config.topology)
            .primitive_restart_enable(false);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(config.polygon_mode)
            .cull_mode(config.cull_mode)
            .front_face(config.front_face)
            .line_width(1.0);
        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(config.samples);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(config.depth_test)
            .depth_write_enable(config.depth_write)
            .depth_compare_op(config.depth_compare_op);
        let blend_attachments = config.attachment_blend_states();
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&blend_attachments);
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&config.dynamic_states);

        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&config.color_formats)
            .depth_attachment_format(config.depth_format.unwrap_or(vk::Format::UNDEFINED))
            .stencil_attachment_format(config.stencil_format.unwrap_or(vk::Format::UNDEFINED));

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let raw = unsafe {
            device
                .raw()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        let raw = finish_creation(&device, layout, raw)?;

        tracing::debug!(parent: logger.span(), sets = set_layouts.len(), "graphics pipeline created");

        let push_constant_ranges = config.push_constant_ranges.clone();
        Ok(Arc::new(Self {
            device,
            raw,
            layout,
            kind: PipelineKind::Graphics {
                vertex,
                fragment,
                config: Box::new(config),
            },
            set_layouts,
            push_constant_ranges,
            in_flight: InFlight::default(),
            logger,
        }))
    }

    pub fn raw(&self) -> vk::Pipeline {
        self.raw
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn kind(&self) -> &PipelineKind {
        &self.kind
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.kind.bind_point()
    }

    /// Descriptor set layouts in set index order.
    pub fn set_layouts(&self) -> &[Arc<DescriptorSetLayout>] {
        &self.set_layouts
    }

    fn check_recording(&self, cmd: &CommandBuffer, operation: &'static str) -> Result<()> {
        cmd.state()
            .expect(CommandBufferState::Recording, operation)
            .map_err(|e| cmd.report(e))
    }

    /// Bind this pipeline.
    pub fn bind(self: &Arc<Self>, cmd: &mut CommandBuffer) -> Result<()> {
        let (bind_point, raw) = (self.bind_point(), self.raw);
        cmd.record(|device, cb| unsafe { device.cmd_bind_pipeline(cb, bind_point, raw) })?;
        cmd.retain(self.clone())
    }

    /// Bind `set` at `set_index` of this pipeline's layout.
    pub fn bind_descriptor_set(
        self: &Arc<Self>,
        cmd: &mut CommandBuffer,
        set_index: u32,
        set: &Arc<DescriptorSet>,
    ) -> Result<()> {
        self.check_recording(cmd, "bind a descriptor set in")?;
        if set_index as usize >= self.set_layouts.len() {
            return Err(self.report(GpuError::InvalidState(format!(
                "set index {set_index} out of range, pipeline layout has {} sets",
                self.set_layouts.len()
            ))));
        }

        let (bind_point, layout, sets) = (self.bind_point(), self.layout, [set.raw()]);
        cmd.record(|device, cb| unsafe {
            device.cmd_bind_descriptor_sets(cb, bind_point, layout, set_index, &sets, &[]);
        })?;
        cmd.retain(set.clone())?;
        cmd.retain(self.clone())
    }

    /// Dispatch a compute grid. Compute pipelines only.
    pub fn dispatch_compute(self: &Arc<Self>, cmd: &mut CommandBuffer, x: u32, y: u32, z: u32) -> Result<()> {
        self.check_recording(cmd, "dispatch into")?;
        if !matches!(self.kind, PipelineKind::Compute { .. }) {
            return Err(self.report(GpuError::InvalidState(
                "dispatch on a graphics pipeline".to_string(),
            )));
        }
        cmd.record(|device, cb| unsafe { device.cmd_dispatch(cb, x, y, z) })?;
        cmd.retain(self.clone())
    }

    /// Write push constants at byte `offset`.
    pub fn push_constants<T: Pod>(self: &Arc<Self>, cmd: &mut CommandBuffer, offset: u32, data: &[T]) -> Result<()> {
        self.check_recording(cmd, "push constants into")?;
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let stages = u32::try_from(bytes.len()).map_or(vk::ShaderStageFlags::empty(), |size| {
            push_constant_stages(&self.push_constant_ranges, offset, size)
        });
        if stages.is_empty() {
            return Err(self.report(GpuError::InvalidState(format!(
                "push constants at {offset}..{} fall outside every declared range",
                offset as usize + bytes.len()
            ))));
        }
        let layout = self.layout;
        cmd.record(|device, cb| unsafe { device.cmd_push_constants(cb, layout, stages, offset, bytes) })?;
        cmd.retain(self.clone())
    }

    fn report(&self, error: GpuError) -> GpuError {
        tracing::error!(parent: self.logger.span(), %error, "pipeline misuse");
        error
    }
}

impl GpuResource for Pipeline {
    fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    fn debug_name(&self) -> &str {
        match self.kind {
            PipelineKind::Compute { .. } => "compute pipeline",
            PipelineKind::Graphics { .. } => "graphics pipeline",
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        crate::resources::check_idle_on_drop(&*self, &self.logger);
        unsafe {
            self.device.raw().destroy_pipeline(self.raw, None);
            self.device.raw().destroy_pipeline_layout(self.layout, None);
        }
    }
}

fn check_stage(shader: &Shader, expected: ShaderStage) -> Result<()> {
    if shader.stage() == expected {
        Ok(())
    } else {
        Err(GpuError::PipelineCreation(format!(
            "expected a {expected:?} shader, got {:?}",
            shader.stage()
        )))
    }
}

fn create_layout(
    device: &Device,
    set_layouts: &[Arc<DescriptorSetLayout>],
    push_constant_ranges: &[vk::PushConstantRange],
) -> Result<vk::PipelineLayout> {
    let raw_layouts: Vec<vk::DescriptorSetLayout> = set_layouts.iter().map(|l| l.raw()).collect();
    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(&raw_layouts)
        .push_constant_ranges(push_constant_ranges);
    unsafe {
        device
            .raw()
            .create_pipeline_layout(&layout_info, None)
            .map_err(|e| GpuError::PipelineCreation(e.to_string()))
    }
}

/// Take the single pipeline out of a create call, cleaning up on failure.
fn finish_creation(
    device: &Device,
    layout: vk::PipelineLayout,
    result: std::result::Result<Vec<vk::Pipeline>, (Vec<vk::Pipeline>, vk::Result)>,
) -> Result<vk::Pipeline> {
    match result {
        Ok(pipelines) if !pipelines.is_empty() => Ok(pipelines[0]),
        Ok(_) => {
            unsafe { device.raw().destroy_pipeline_layout(layout, None) };
            Err(GpuError::PipelineCreation("driver returned no pipeline".to_string()))
        }
        Err((_, e)) => {
            unsafe { device.raw().destroy_pipeline_layout(layout, None) };
            Err(GpuError::PipelineCreation(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graphics_defaults() {
        let config = GraphicsPipelineConfig::default();
        assert_eq!(config.topology, vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(config.polygon_mode, vk::PolygonMode::FILL);
        assert_eq!(config.cull_mode, vk::CullModeFlags::NONE);
        assert_eq!(config.front_face, vk::FrontFace::COUNTER_CLOCKWISE);
        assert!(!config.depth_test);
        assert_eq!(
            config.dynamic_states,
            vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR]
        );
        let blend = config.attachment_blend_states();
        assert_eq!(blend.len(), 1);
        assert_eq!(blend[0].blend_enable, vk::FALSE);
        assert_eq!(blend[0].color_write_mask, vk::ColorComponentFlags::RGBA);
    }

    #[test]
    fn blend_states_padded_per_attachment() {
        let additive = opaque_blend()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::ONE)
            .dst_color_blend_factor(vk::BlendFactor::ONE);
        let config = GraphicsPipelineConfig {
            color_formats: vec![vk::Format::R8G8B8A8_UNORM, vk::Format::R16G16B16A16_SFLOAT],
            color_blend: vec![additive],
            ..Default::default()
        };
        let blend = config.attachment_blend_states();
        assert_eq!(blend.len(), 2);
        assert_eq!(blend[0].blend_enable, vk::TRUE);
        assert_eq!(blend[1].blend_enable, vk::FALSE);
    }

    #[test]
    fn push_constant_stage_lookup() {
        let ranges = [
            vk::PushConstantRange::default()
                .stage_flags(vk::ShaderStageFlags::VERTEX)
                .offset(0)
                .size(64),
            vk::PushConstantRange::default()
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .offset(64)
                .size(16),
        ];
        assert_eq!(push_constant_stages(&ranges, 0, 64), vk::ShaderStageFlags::VERTEX);
        assert_eq!(push_constant_stages(&ranges, 64, 16), vk::ShaderStageFlags::FRAGMENT);
        assert!(push_constant_stages(&ranges, 60, 8).is_empty());
        assert!(push_constant_stages(&[], 0, 4).is_empty());
    }

    #[test]
    fn push_constant_lookup_near_u32_max() {
        let compute = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(128)];
        assert!(push_constant_stages(&compute, u32::MAX - 3, 8).is_empty());

        let wrapping = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .offset(u32::MAX - 3)
            .size(16)];
        assert!(push_constant_stages(&wrapping, u32::MAX - 3, 4).is_empty());
    }
}
