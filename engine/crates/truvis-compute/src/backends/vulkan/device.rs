use std::{
    ffi::{CStr, CString},
    ops::Deref,
    rc::Rc,
};

use ash::vk;
use itertools::Itertools;

use crate::{
    backends::vulkan::{debug_messenger::DebugType, instance::Instance, physical_device::PhysicalDevice},
    error::{GfxResult, VkResultExt},
};

/// Vulkan 设备函数指针的集合
///
/// 所有的设备对象都持有 `Rc<DeviceFunctions>`，最后一个引用释放时销毁 device。
/// 持有 `Rc<Instance>`，保证 instance 晚于 device 销毁。
pub struct DeviceFunctions {
    /// 核心 Vulkan 设备 API
    pub(crate) device: ash::Device,
    /// 调试工具扩展 API
    pub(crate) debug_utils: ash::ext::debug_utils::Device,

    instance: Rc<Instance>,
}

// 构造
impl DeviceFunctions {
    pub fn new(instance: Rc<Instance>, pdevice: &PhysicalDevice) -> GfxResult<Self> {
        // compute 与 copy 可能是同一个 queue family，每个 family 只创建一个 queue
        let queue_create_infos = pdevice
            .queue_family_indices()
            .into_iter()
            .map(|family_index| {
                vk::DeviceQueueCreateInfo::default().queue_family_index(family_index).queue_priorities(&[1.0])
            })
            .collect_vec();

        // device 所需的所有 extension
        let device_exts = Self::basic_device_exts().iter().map(|e| e.as_ptr()).collect_vec();
        let mut exts_str = String::new();
        for ext in &device_exts {
            exts_str.push_str(&format!("\n\t{:?}", unsafe { CStr::from_ptr(*ext) }));
        }
        log::info!("device exts: {}", exts_str);

        // device 所需的所有 features
        let mut all_features = vk::PhysicalDeviceFeatures2::default().features(Self::physical_device_basic_features());
        let mut physical_device_ext_features = Self::physical_device_extra_features();
        unsafe {
            physical_device_ext_features.iter_mut().for_each(|f| {
                let ptr = <*mut dyn vk::ExtendsPhysicalDeviceFeatures2>::cast::<vk::BaseOutStructure>(f.as_mut());
                (*ptr).p_next = all_features.p_next as _;
                all_features.p_next = ptr as _;
            });
        }

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_exts)
            .push_next(&mut all_features);

        let device = unsafe {
            instance.ash_instance().create_device(pdevice.vk_handle, &device_create_info, None).vk_op("create_device")?
        };
        let debug_utils = ash::ext::debug_utils::Device::new(instance.ash_instance(), &device);

        Ok(Self {
            device,
            debug_utils,
            instance,
        })
    }

    /// 必要的 physical device core features
    fn physical_device_basic_features() -> vk::PhysicalDeviceFeatures {
        vk::PhysicalDeviceFeatures::default().shader_int64(true)
    }

    /// 必要的 physical device extension features
    fn physical_device_extra_features() -> Vec<Box<dyn vk::ExtendsPhysicalDeviceFeatures2>> {
        vec![
            Box::new(vk::PhysicalDeviceBufferDeviceAddressFeatures::default().buffer_device_address(true)),
            // 时间戳查询在 host 端 reset
            Box::new(vk::PhysicalDeviceHostQueryResetFeatures::default().host_query_reset(true)),
            Box::new(vk::PhysicalDeviceSynchronization2Features::default().synchronization2(true)),
            // fence 使用 timeline semaphore 实现
            Box::new(vk::PhysicalDeviceTimelineSemaphoreFeatures::default().timeline_semaphore(true)),
            Box::new(
                vk::PhysicalDeviceDescriptorIndexingFeatures::default()
                    .descriptor_binding_partially_bound(true) // 描述符表中未写入的槽位
                    .runtime_descriptor_array(true)
                    .shader_uniform_texel_buffer_array_dynamic_indexing(true)
                    .shader_storage_texel_buffer_array_dynamic_indexing(true),
            ),
            // 让 UBO 支持 std430 或者 scalar layout
            Box::new(
                vk::PhysicalDeviceUniformBufferStandardLayoutFeatures::default().uniform_buffer_standard_layout(true),
            ),
        ]
    }

    /// 必要的 device extensions
    ///
    /// 用到的功能都已经提升到 core-1.3.0
    fn basic_device_exts() -> Vec<&'static CStr> {
        Vec::new()
    }
}

// getters
impl DeviceFunctions {
    #[inline]
    pub fn debug_utils(&self) -> &ash::ext::debug_utils::Device {
        &self.debug_utils
    }

    #[inline]
    pub fn instance(&self) -> &Rc<Instance> {
        &self.instance
    }
}

// tools
impl DeviceFunctions {
    #[inline]
    pub fn set_object_debug_name<T: vk::Handle>(&self, handle: T, name: impl AsRef<str>) {
        let Ok(name) = CString::new(name.as_ref()) else {
            log::warn!("debug name {:?} contains a nul byte", name.as_ref());
            return;
        };
        let result = unsafe {
            self.debug_utils.set_debug_utils_object_name(
                &vk::DebugUtilsObjectNameInfoEXT::default().object_name(name.as_c_str()).object_handle(handle),
            )
        };
        if let Err(e) = result {
            log::warn!("failed to set debug name {:?}: {:?}", name, e);
        }
    }

    pub fn set_debug_name<T: DebugType>(&self, handle: &T, name: impl AsRef<str>) {
        let debug_name = format!("{}::{}", T::debug_type_name(), name.as_ref());
        self.set_object_debug_name(handle.vk_handle(), debug_name);
    }
}

impl Deref for DeviceFunctions {
    type Target = ash::Device;
    fn deref(&self) -> &Self::Target {
        &self.device
    }
}

impl Drop for DeviceFunctions {
    fn drop(&mut self) {
        log::info!("destroying device");
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("device_wait_idle failed: {:?}", e);
            }
            self.device.destroy_device(None);
        }
    }
}
