//! Shader modules and the shader provider contract.
//!
//! A [`ShaderProvider`] turns a shader source into SPIR-V plus the list of
//! parameters the shader declares. [`Shader::new`] creates the module and the
//! descriptor set layouts those parameters describe.

use crate::descriptors::{BindingInfo, DescriptorSetLayout};
use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::vk;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::sync::Arc;

/// Pipeline stage a shader runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub fn flags(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }

    /// Conventional file extension for GLSL sources of this stage.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Vertex => "vert",
            Self::Fragment => "frag",
            Self::Compute => "comp",
        }
    }
}

/// A resource a shader declares, as reported by reflection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterBinding {
    pub set: u32,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    /// Array size, 1 for non-arrays.
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
    pub name: Option<String>,
}

/// Output of a [`ShaderProvider`].
#[derive(Debug, Clone)]
pub struct CompiledShader {
    pub spirv: Vec<u32>,
    pub entry_point: String,
    pub stage: ShaderStage,
    pub parameters: Vec<ParameterBinding>,
}

/// Loads and compiles shaders.
pub trait ShaderProvider {
    fn load_shader(
        &self,
        source: &str,
        entry_point: &str,
        stage: ShaderStage,
    ) -> Result<CompiledShader>;
}

/// Group parameters into per-set binding lists.
///
/// Returns one list for every set index up to the highest one used; unused
/// sets are empty. Inside a set, bindings must run from 0 without gaps, since
/// a layout binding's index is its position.
pub fn layouts_from_parameters(parameters: &[ParameterBinding]) -> Result<Vec<Vec<BindingInfo>>> {
    let mut sets: BTreeMap<u32, BTreeMap<u32, &ParameterBinding>> = BTreeMap::new();
    for param in parameters {
        if sets
            .entry(param.set)
            .or_default()
            .insert(param.binding, param)
            .is_some()
        {
            return Err(GpuError::ShaderReflection(format!(
                "set {} binding {} declared twice",
                param.set, param.binding
            )));
        }
    }

    let set_count = sets.keys().next_back().map_or(0, |&max| max + 1);
    let mut layouts = vec![Vec::new(); set_count as usize];
    for (set, bindings) in sets {
        for (position, (binding, param)) in bindings.into_iter().enumerate() {
            if binding != position as u32 {
                return Err(GpuError::ShaderReflection(format!(
                    "set {set} has a gap before binding {binding}"
                )));
            }
            layouts[set as usize].push(
                BindingInfo::new(param.descriptor_type, param.stages).count(param.count.max(1)),
            );
        }
    }
    Ok(layouts)
}

/// Combine the parameters of several stages into one list.
///
/// Parameters are matched by `(set, binding)`. A binding declared by more
/// than one stage keeps its type and count and gains every stage's flags; a
/// type or count disagreement is a `ShaderReflection` error.
pub fn merge_stage_parameters(stages: &[&[ParameterBinding]]) -> Result<Vec<ParameterBinding>> {
    let mut merged: BTreeMap<(u32, u32), ParameterBinding> = BTreeMap::new();
    for param in stages.iter().flat_map(|params| params.iter()) {
        match merged.get_mut(&(param.set, param.binding)) {
            None => {
                merged.insert((param.set, param.binding), param.clone());
            }
            Some(existing) => {
                if existing.descriptor_type != param.descriptor_type
                    || existing.count.max(1) != param.count.max(1)
                {
                    return Err(GpuError::ShaderReflection(format!(
                        "set {} binding {} is {:?}[{}] in one stage and {:?}[{}] in another",
                        param.set,
                        param.binding,
                        existing.descriptor_type,
                        existing.count,
                        param.descriptor_type,
                        param.count
                    )));
                }
                existing.stages |= param.stages;
                if existing.name.is_none() {
                    existing.name.clone_from(&param.name);
                }
            }
        }
    }
    Ok(merged.into_values().collect())
}

/// Compiled descriptor set layouts for `parameters`, indexed by set number.
pub(crate) fn build_set_layouts(
    device: &Arc<Device>,
    parameters: &[ParameterBinding],
) -> Result<Vec<Arc<DescriptorSetLayout>>> {
    let mut set_layouts = Vec::new();
    for bindings in layouts_from_parameters(parameters)? {
        let mut layout = DescriptorSetLayout::new(
            Arc::clone(device),
            vk::DescriptorSetLayoutCreateFlags::empty(),
        );
        for info in bindings {
            layout.add_binding(info)?;
        }
        layout.compile()?;
        set_layouts.push(Arc::new(layout));
    }
    Ok(set_layouts)
}

/// A shader module with the descriptor set layouts of its parameters.
pub struct Shader {
    device: Arc<Device>,
    module: vk::ShaderModule,
    stage: ShaderStage,
    entry_point: CString,
    parameters: Vec<ParameterBinding>,
    set_layouts: Vec<Arc<DescriptorSetLayout>>,
}

impl Shader {
    pub fn new(device: Arc<Device>, compiled: CompiledShader) -> Result<Arc<Self>> {
        let entry_point = CString::new(compiled.entry_point.as_str())
            .map_err(|_| GpuError::ShaderReflection("entry point contains NUL".to_string()))?;

        let set_layouts = build_set_layouts(&device, &compiled.parameters)?;

        let create_info = vk::ShaderModuleCreateInfo::default().code(&compiled.spirv);
        let module = unsafe { device.raw().create_shader_module(&create_info, None)? };

        tracing::debug!(
            parent: device.logger().span(),
            stage = ?compiled.stage,
            sets = set_layouts.len(),
            parameters = compiled.parameters.len(),
            "shader module created"
        );

        Ok(Arc::new(Self {
            device,
            module,
            stage: compiled.stage,
            entry_point,
            parameters: compiled.parameters,
            set_layouts,
        }))
    }

    /// Compile through `provider` and create the module.
    pub fn load(
        device: Arc<Device>,
        provider: &(impl ShaderProvider + ?Sized),
        source: &str,
        entry_point: &str,
        stage: ShaderStage,
    ) -> Result<Arc<Self>> {
        let compiled = provider.load_shader(source, entry_point, stage)?;
        Self::new(device, compiled)
    }

    pub fn module(&self) -> vk::ShaderModule {
        self.module
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn entry_point(&self) -> &std::ffi::CStr {
        &self.entry_point
    }

    pub fn parameters(&self) -> &[ParameterBinding] {
        &self.parameters
    }

    /// One layout per descriptor set index.
    pub fn set_layouts(&self) -> &[Arc<DescriptorSetLayout>] {
        &self.set_layouts
    }

    pub(crate) fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage.flags())
            .module(self.module)
            .name(&self.entry_point)
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        unsafe { self.device.raw().destroy_shader_module(self.module, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(set: u32, binding: u32, ty: vk::DescriptorType) -> ParameterBinding {
        ParameterBinding {
            set,
            binding,
            descriptor_type: ty,
            count: 1,
            stages: vk::ShaderStageFlags::COMPUTE,
            name: None,
        }
    }

    #[test]
    fn three_storage_buffers() {
        let params: Vec<_> = (0..3)
            .rev()
            .map(|b| param(0, b, vk::DescriptorType::STORAGE_BUFFER))
            .collect();
        let layouts = layouts_from_parameters(&params).unwrap();
        assert_eq!(layouts.len(), 1);
        assert_eq!(layouts[0].len(), 3);
        assert!(layouts[0]
            .iter()
            .all(|b| b.descriptor_type == vk::DescriptorType::STORAGE_BUFFER && b.count == 1));
    }

    #[test]
    fn unused_sets_become_empty_layouts() {
        let mut sampler = param(2, 0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        sampler.count = 4;
        let params = [param(0, 0, vk::DescriptorType::UNIFORM_BUFFER), sampler];
        let layouts = layouts_from_parameters(&params).unwrap();
        assert_eq!(layouts.len(), 3);
        assert!(layouts[1].is_empty());
        assert_eq!(layouts[2][0].count, 4);
    }

    #[test]
    fn rejects_gaps_and_duplicates() {
        let gap = [
            param(0, 0, vk::DescriptorType::STORAGE_BUFFER),
            param(0, 2, vk::DescriptorType::STORAGE_BUFFER),
        ];
        assert!(matches!(
            layouts_from_parameters(&gap),
            Err(GpuError::ShaderReflection(_))
        ));

        let duplicate = [
            param(0, 0, vk::DescriptorType::STORAGE_BUFFER),
            param(0, 0, vk::DescriptorType::UNIFORM_BUFFER),
        ];
        assert!(matches!(
            layouts_from_parameters(&duplicate),
            Err(GpuError::ShaderReflection(_))
        ));
    }

    #[test]
    fn stages_merge_by_set_index() {
        let mut vertex_ubo = param(0, 0, vk::DescriptorType::UNIFORM_BUFFER);
        vertex_ubo.stages = vk::ShaderStageFlags::VERTEX;
        let mut fragment_ubo = vertex_ubo.clone();
        fragment_ubo.stages = vk::ShaderStageFlags::FRAGMENT;
        let mut fragment_image = param(1, 0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        fragment_image.stages = vk::ShaderStageFlags::FRAGMENT;

        let vertex = vec![vertex_ubo];
        let fragment = vec![fragment_ubo, fragment_image];
        let merged = merge_stage_parameters(&[&vertex[..], &fragment[..]]).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(
            merged[0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );

        let layouts = layouts_from_parameters(&merged).unwrap();
        assert_eq!(layouts.len(), 2);
        assert_eq!(layouts[1].len(), 1);
        assert_eq!(
            layouts[1][0].descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert_eq!(layouts[1][0].stage_flags, vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn conflicting_stage_bindings_fail() {
        let vertex = [param(0, 0, vk::DescriptorType::UNIFORM_BUFFER)];
        let fragment = [param(0, 0, vk::DescriptorType::STORAGE_BUFFER)];
        assert!(matches!(
            merge_stage_parameters(&[&vertex[..], &fragment[..]]),
            Err(GpuError::ShaderReflection(_))
        ));

        let mut array = param(0, 0, vk::DescriptorType::UNIFORM_BUFFER);
        array.count = 4;
        assert!(matches!(
            merge_stage_parameters(&[&vertex[..], &[array][..]]),
            Err(GpuError::ShaderReflection(_))
        ));
    }

    #[test]
    fn no_parameters_no_layouts() {
        assert!(layouts_from_parameters(&[]).unwrap().is_empty());
    }

    #[test]
    fn stage_flags() {
        assert_eq!(ShaderStage::Compute.flags(), vk::ShaderStageFlags::COMPUTE);
        assert_eq!(ShaderStage::Fragment.extension(), "frag");
    }
}
