//! Descriptor reflection from SPIR-V via spirq.

use crate::{Result, ShaderError};
use rendergraph_gpu::{vk, ParameterBinding, ShaderStage};
use spirq::ty::DescriptorType;
use spirq::var::Variable;
use spirq::ReflectConfig;

/// List the descriptor parameters `entry_point` uses.
///
/// Each binding appears once even when the module declares it for several
/// entry points.
pub fn reflect_parameters(
    spirv: &[u32],
    entry_point: &str,
    stage: ShaderStage,
) -> Result<Vec<ParameterBinding>> {
    let entry_points = ReflectConfig::new()
        .spv(spirv)
        .ref_all_rscs(true)
        .reflect()
        .map_err(|e| ShaderError::Reflection(format!("SPIR-V reflection failed: {e:?}")))?;

    let entry = entry_points
        .iter()
        .find(|ep| ep.name == entry_point)
        .ok_or_else(|| ShaderError::Reflection(format!("no entry point named {entry_point}")))?;

    let mut parameters: Vec<ParameterBinding> = Vec::new();
    for var in &entry.vars {
        if let Variable::Descriptor {
            name,
            desc_bind,
            desc_ty,
            nbind,
            ..
        } = var
        {
            let (set, binding) = (desc_bind.set(), desc_bind.bind());
            if parameters
                .iter()
                .any(|p| p.set == set && p.binding == binding)
            {
                continue;
            }
            parameters.push(ParameterBinding {
                set,
                binding,
                descriptor_type: descriptor_type(desc_ty)?,
                count: (*nbind).max(1),
                stages: stage.flags(),
                name: name.clone(),
            });
        }
    }
    parameters.sort_by_key(|p| (p.set, p.binding));
    Ok(parameters)
}

fn descriptor_type(desc_ty: &DescriptorType) -> Result<vk::DescriptorType> {
    #[allow(unreachable_patterns)]
    let ty = match desc_ty {
        DescriptorType::Sampler() => vk::DescriptorType::SAMPLER,
        DescriptorType::CombinedImageSampler() => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        DescriptorType::SampledImage() => vk::DescriptorType::SAMPLED_IMAGE,
        DescriptorType::StorageImage(_) => vk::DescriptorType::STORAGE_IMAGE,
        DescriptorType::UniformTexelBuffer() => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        DescriptorType::StorageTexelBuffer(_) => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
        DescriptorType::UniformBuffer() => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorType::StorageBuffer(_) => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorType::InputAttachment(_) => vk::DescriptorType::INPUT_ATTACHMENT,
        DescriptorType::AccelStruct() => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        other => {
            return Err(ShaderError::Reflection(format!(
                "Unsupported SPIR-V descriptor type: {other:?}"
            )))
        }
    };
    Ok(ty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_words_fail_reflection() {
        let err = reflect_parameters(&[0xdead_beef, 1, 2, 3], "main", ShaderStage::Compute)
            .unwrap_err();
        assert!(matches!(err, ShaderError::Reflection(_)));
    }

    #[test]
    fn descriptor_types_map_to_vulkan() {
        assert_eq!(
            descriptor_type(&DescriptorType::UniformBuffer()).unwrap(),
            vk::DescriptorType::UNIFORM_BUFFER
        );
        assert_eq!(
            descriptor_type(&DescriptorType::CombinedImageSampler()).unwrap(),
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
    }
}
