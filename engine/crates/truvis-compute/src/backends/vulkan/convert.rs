use ash::vk;

use crate::resources::{
    state::ResourceState,
    texture::{Format, TextureType},
};

pub fn vk_format(format: Format) -> vk::Format {
    match format {
        Format::Unknown => vk::Format::UNDEFINED,
        // raw view 以 32 位无符号整数寻址
        Format::R32Typeless | Format::R32Uint => vk::Format::R32_UINT,
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::R32Sint => vk::Format::R32_SINT,
        Format::R16Float => vk::Format::R16_SFLOAT,
        Format::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::R32G32Float => vk::Format::R32G32_SFLOAT,
        Format::R32G32B32A32Float => vk::Format::R32G32B32A32_SFLOAT,
    }
}

pub fn vk_image_type(texture_type: TextureType) -> vk::ImageType {
    match texture_type {
        TextureType::Texture1D => vk::ImageType::TYPE_1D,
        TextureType::Texture2D => vk::ImageType::TYPE_2D,
        TextureType::Texture3D => vk::ImageType::TYPE_3D,
    }
}

/// barrier 使用的 stage 与 access
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StateMask {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

/// 资源状态对应的 stage 与 access
///
/// COMMON 作为 src 时需要等待之前的所有命令
pub fn state_mask(state: ResourceState) -> StateMask {
    if state == ResourceState::COMMON {
        return StateMask {
            stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            access: vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        };
    }

    let mut mask = StateMask {
        stage: vk::PipelineStageFlags2::NONE,
        access: vk::AccessFlags2::NONE,
    };
    if state.contains(ResourceState::VERTEX_AND_CONSTANT_BUFFER) {
        mask.stage |= vk::PipelineStageFlags2::COMPUTE_SHADER;
        mask.access |= vk::AccessFlags2::UNIFORM_READ;
    }
    if state.contains(ResourceState::NON_PIXEL_SHADER_RESOURCE) {
        mask.stage |= vk::PipelineStageFlags2::COMPUTE_SHADER;
        mask.access |= vk::AccessFlags2::SHADER_READ;
    }
    if state.contains(ResourceState::UNORDERED_ACCESS) {
        mask.stage |= vk::PipelineStageFlags2::COMPUTE_SHADER;
        mask.access |= vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE;
    }
    if state.contains(ResourceState::COPY_SOURCE) {
        mask.stage |= vk::PipelineStageFlags2::COPY;
        mask.access |= vk::AccessFlags2::TRANSFER_READ;
    }
    if state.contains(ResourceState::COPY_DEST) {
        mask.stage |= vk::PipelineStageFlags2::COPY;
        mask.access |= vk::AccessFlags2::TRANSFER_WRITE;
    }
    mask
}

/// 纹理在某个状态下使用的 layout
pub fn image_layout(state: ResourceState) -> vk::ImageLayout {
    if state == ResourceState::COPY_DEST {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL
    } else if state == ResourceState::COPY_SOURCE {
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL
    } else if state == ResourceState::NON_PIXEL_SHADER_RESOURCE {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    } else {
        // COMMON、UAV 以及组合状态
        vk::ImageLayout::GENERAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formats() {
        assert_eq!(vk_format(Format::R32Float), vk::Format::R32_SFLOAT);
        assert_eq!(vk_format(Format::R32Typeless), vk::Format::R32_UINT);
        assert_eq!(vk_format(Format::Unknown), vk::Format::UNDEFINED);
    }

    #[test]
    fn test_state_masks() {
        let common = state_mask(ResourceState::COMMON);
        assert_eq!(common.stage, vk::PipelineStageFlags2::ALL_COMMANDS);

        let uav = state_mask(ResourceState::UNORDERED_ACCESS);
        assert_eq!(uav.stage, vk::PipelineStageFlags2::COMPUTE_SHADER);
        assert!(uav.access.contains(vk::AccessFlags2::SHADER_WRITE));

        let generic = state_mask(ResourceState::GENERIC_READ);
        assert!(generic.stage.contains(vk::PipelineStageFlags2::COPY | vk::PipelineStageFlags2::COMPUTE_SHADER));
        assert!(!generic.access.contains(vk::AccessFlags2::TRANSFER_WRITE));
    }

    #[test]
    fn test_image_layouts() {
        assert_eq!(image_layout(ResourceState::COPY_DEST), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(image_layout(ResourceState::UNORDERED_ACCESS), vk::ImageLayout::GENERAL);
        assert_eq!(image_layout(ResourceState::COMMON), vk::ImageLayout::GENERAL);
        assert_eq!(image_layout(ResourceState::GENERIC_READ), vk::ImageLayout::GENERAL);
    }
}
