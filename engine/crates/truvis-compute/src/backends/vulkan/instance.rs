use std::ffi::{CStr, CString, c_char};

use ash::vk;
use itertools::Itertools;

use crate::{
    backends::vulkan::debug_messenger::DebugMsger,
    error::{GfxError, GfxResult, VkResultExt},
    foundation::config::GfxConfig,
};

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// vk entry、instance 以及 debug messenger
///
/// drop 的顺序：debug messenger -> instance -> entry
pub struct Instance {
    debug_msger: Option<DebugMsger>,
    pub(crate) ash_instance: ash::Instance,

    /// 在 drop 之后，会卸载 dll，因此需要确保该字段最后 drop
    pub(crate) vk_entry: ash::Entry,
}

impl Instance {
    /// 设置所需的 layers 和 extensions，创建 vk instance
    pub fn new(config: &GfxConfig) -> GfxResult<Self> {
        let vk_entry =
            unsafe { ash::Entry::load() }.map_err(|e| GfxError::Device(format!("failed to load vulkan: {e}")))?;

        let app_name = CString::new(config.app_name.as_str())
            .map_err(|_| GfxError::Config("app_name contains a nul byte".to_string()))?;
        let app_info = vk::ApplicationInfo::default()
            .api_version(vk::API_VERSION_1_3) // 版本过低时，有些函数无法正确加载
            .application_name(app_name.as_c_str())
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"truvis-compute")
            .engine_version(vk::make_api_version(0, 1, 0, 0));

        let enabled_extensions = Self::get_extensions(&vk_entry)?;
        let mut enabled_extensions_str = String::new();
        for ext in &enabled_extensions {
            enabled_extensions_str.push_str(&format!("\n\t{:?}", unsafe { CStr::from_ptr(*ext) }));
        }
        log::info!("instance extensions: {}", enabled_extensions_str);

        let enabled_layers = Self::get_layers(&vk_entry, config.enable_validation)?;
        log::info!("instance layers: {:?}", enabled_layers.iter().map(|l| unsafe { CStr::from_ptr(*l) }).collect_vec());

        let mut instance_ci = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&enabled_extensions)
            .enabled_layer_names(&enabled_layers);

        // 为 instance info 添加 debug messenger
        let mut debug_utils_messenger_ci = DebugMsger::debug_utils_messenger_ci();
        if config.enable_validation {
            instance_ci = instance_ci.push_next(&mut debug_utils_messenger_ci);
        }

        // GPU-assisted validation 通过 validation features 开启
        let gpu_validation_features = [
            vk::ValidationFeatureEnableEXT::GPU_ASSISTED,
            vk::ValidationFeatureEnableEXT::GPU_ASSISTED_RESERVE_BINDING_SLOT,
        ];
        let mut validation_features =
            vk::ValidationFeaturesEXT::default().enabled_validation_features(&gpu_validation_features);
        if config.enable_validation && config.enable_gpu_based_validation {
            log::info!("gpu based validation enabled");
            instance_ci = instance_ci.push_next(&mut validation_features);
        }

        let ash_instance = unsafe { vk_entry.create_instance(&instance_ci, None).vk_op("create_instance")? };

        let debug_msger = if config.enable_validation {
            match DebugMsger::new(&vk_entry, &ash_instance) {
                Ok(msger) => Some(msger),
                Err(e) => {
                    unsafe { ash_instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Self {
            debug_msger,
            ash_instance,
            vk_entry,
        })
    }
}

// getters
impl Instance {
    #[inline]
    pub fn ash_instance(&self) -> &ash::Instance {
        &self.ash_instance
    }

    #[inline]
    pub fn vk_instance(&self) -> vk::Instance {
        self.ash_instance.handle()
    }

    #[inline]
    pub fn vk_entry(&self) -> &ash::Entry {
        &self.vk_entry
    }
}

// 构造过程
impl Instance {
    /// instance 所需的，且受支持的 extension
    fn get_extensions(vk_entry: &ash::Entry) -> GfxResult<Vec<*const c_char>> {
        let all_ext_props = unsafe {
            vk_entry.enumerate_instance_extension_properties(None).vk_op("enumerate_instance_extension_properties")?
        };

        Self::basic_instance_exts()
            .into_iter()
            .map(|ext| {
                let supported = all_ext_props
                    .iter()
                    .any(|supported_ext| ext == unsafe { CStr::from_ptr(supported_ext.extension_name.as_ptr()) });
                if supported {
                    Ok(ext.as_ptr())
                } else {
                    Err(GfxError::Device(format!("required instance extension {ext:?} is missing")))
                }
            })
            .collect()
    }

    /// validation layer 不存在时只给出警告
    fn get_layers(vk_entry: &ash::Entry, enable_validation: bool) -> GfxResult<Vec<*const c_char>> {
        if !enable_validation {
            return Ok(Vec::new());
        }

        let all_layer_props =
            unsafe { vk_entry.enumerate_instance_layer_properties().vk_op("enumerate_instance_layer_properties")? };
        let supported = all_layer_props
            .iter()
            .any(|layer| VALIDATION_LAYER_NAME == unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) });
        if !supported {
            log::warn!("{:?} is not installed, validation disabled", VALIDATION_LAYER_NAME);
            return Ok(Vec::new());
        }

        Ok(vec![VALIDATION_LAYER_NAME.as_ptr()])
    }

    /// 必须要开启的 instance extensions
    fn basic_instance_exts() -> Vec<&'static CStr> {
        vec![
            // 这个 extension 可以单独使用，提供以下功能：
            // 1. debug messenger
            // 2. 为 vulkan object 设置 debug name
            // 3. 使用 label 标记 queue 中的一个一个 section，capture 区间依赖它
            vk::EXT_DEBUG_UTILS_NAME,
        ]
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        drop(self.debug_msger.take());
        log::info!("destroying instance");
        unsafe {
            self.ash_instance.destroy_instance(None);
        }
    }
}
