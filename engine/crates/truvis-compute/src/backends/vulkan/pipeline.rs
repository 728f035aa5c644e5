use std::{ffi::CStr, path::Path, rc::Rc};

use ash::vk;

use crate::{
    backends::vulkan::{debug_messenger::DebugType, descriptor_heap::VulkanDescriptorHeap, device::DeviceFunctions},
    diagnostics::LiveToken,
    error::{GfxError, GfxResult, VkResultExt},
};

/// compute pipeline，pipeline layout 只包含描述符堆的那一个 set
pub struct VulkanPipeline {
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,

    device_functions: Rc<DeviceFunctions>,
    _live: LiveToken,
}

impl DebugType for VulkanPipeline {
    fn debug_type_name() -> &'static str {
        "VulkanPipeline"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.pipeline
    }
}

impl VulkanPipeline {
    /// # param
    /// * spirv_path - spv shader 文件路径，入口为 `main`
    pub fn new(
        device_functions: Rc<DeviceFunctions>,
        heap: &VulkanDescriptorHeap,
        spirv_path: &Path,
        debug_name: &str,
        live: LiveToken,
    ) -> GfxResult<Self> {
        let shader_module = Self::create_shader_module(&device_functions, spirv_path)?;
        let entry_point: &CStr = c"main";
        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .module(shader_module)
            .stage(vk::ShaderStageFlags::COMPUTE)
            .name(entry_point);

        let set_layouts = [heap.set_layout()];
        let pipeline_layout_ci = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let pipeline_layout = match unsafe {
            device_functions.create_pipeline_layout(&pipeline_layout_ci, None).vk_op("create_pipeline_layout")
        } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device_functions.destroy_shader_module(shader_module, None) };
                return Err(e);
            }
        };

        let pipeline_ci = vk::ComputePipelineCreateInfo::default().stage(stage_info).layout(pipeline_layout);
        let pipeline = unsafe {
            device_functions.create_compute_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&pipeline_ci), None)
        };

        // pipeline 创建完成之后 shader module 就不再需要了
        unsafe {
            device_functions.destroy_shader_module(shader_module, None);
        }

        let pipeline = match pipeline {
            Ok(pipelines) => pipelines[0],
            Err((_, result)) => {
                unsafe { device_functions.destroy_pipeline_layout(pipeline_layout, None) };
                return Err(GfxError::Vulkan {
                    op: "create_compute_pipelines",
                    result,
                });
            }
        };

        let pipeline = Self {
            pipeline,
            pipeline_layout,
            device_functions,
            _live: live,
        };
        pipeline.device_functions.set_debug_name(&pipeline, debug_name);
        log::info!("created compute pipeline `{}` from {}", debug_name, spirv_path.display());
        Ok(pipeline)
    }

    fn create_shader_module(device_functions: &DeviceFunctions, path: &Path) -> GfxResult<vk::ShaderModule> {
        let mut file = std::fs::File::open(path)
            .map_err(|e| GfxError::InvalidArgument(format!("failed to open shader {}: {e}", path.display())))?;
        let shader_code = ash::util::read_spv(&mut file)
            .map_err(|e| GfxError::InvalidArgument(format!("failed to read spirv {}: {e}", path.display())))?;

        let shader_module_info = vk::ShaderModuleCreateInfo::default().code(&shader_code);
        let shader_module =
            unsafe { device_functions.create_shader_module(&shader_module_info, None).vk_op("create_shader_module")? };
        device_functions.set_object_debug_name(shader_module, format!("ShaderModule::{}", path.display()));
        Ok(shader_module)
    }
}

impl Drop for VulkanPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device_functions.destroy_pipeline(self.pipeline, None);
            self.device_functions.destroy_pipeline_layout(self.pipeline_layout, None);
        }
    }
}

// getters
impl VulkanPipeline {
    #[inline]
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    #[inline]
    pub fn layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }
}
