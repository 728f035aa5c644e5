use std::ffi::CStr;

use ash::vk;
use itertools::Itertools;

use crate::{
    error::{GfxError, GfxResult, VkResultExt},
    foundation::gpu_device::QueueKind,
};

#[derive(Clone, Debug)]
pub struct QueueFamily {
    pub name: String,
    pub queue_family_index: u32,
    pub queue_flags: vk::QueueFlags,
    pub queue_count: u32,
    pub timestamp_valid_bits: u32,
}

/// 表示一张物理显卡
pub struct PhysicalDevice {
    pub(crate) vk_handle: vk::PhysicalDevice,

    /// 当前 gpu 的基础属性
    pub(crate) basic_props: vk::PhysicalDeviceProperties,

    /// 执行 compute 命令的 queue family，优先使用不含 graphics 的 family
    pub(crate) compute_queue_family: QueueFamily,
    /// 执行 copy 命令的 queue family，优先使用专用的 transfer family
    pub(crate) copy_queue_family: QueueFamily,
}

impl PhysicalDevice {
    /// 优先选择独立显卡，如果没有则选择第一个可用的显卡
    pub fn new_descrete_physical_device(instance: &ash::Instance) -> GfxResult<Self> {
        let pdevices = unsafe { instance.enumerate_physical_devices().vk_op("enumerate_physical_devices")? };
        pdevices
            .iter()
            .filter_map(|pdevice| match Self::new(*pdevice, instance) {
                Ok(pdevice) => Some(pdevice),
                Err(e) => {
                    log::warn!("skip physical device: {}", e);
                    None
                }
            })
            // 优先使用独立显卡
            .find_or_first(PhysicalDevice::is_descrete_gpu)
            .ok_or_else(|| GfxError::Device("no vulkan physical device with a compute queue".to_string()))
    }

    fn new(pdevice: vk::PhysicalDevice, instance: &ash::Instance) -> GfxResult<Self> {
        let basic_props = unsafe { instance.get_physical_device_properties(pdevice) };
        let physical_device_name = unsafe { CStr::from_ptr(basic_props.device_name.as_ptr()) };
        log::info!("found gpu: {:?}", physical_device_name);

        if basic_props.api_version < vk::API_VERSION_1_3 {
            return Err(GfxError::Device(format!("{:?} does not support vulkan 1.3", physical_device_name)));
        }
        if basic_props.device_type == vk::PhysicalDeviceType::CPU {
            return Err(GfxError::Device(format!("{:?} is a software implementation", physical_device_name)));
        }
        if basic_props.limits.timestamp_compute_and_graphics == vk::FALSE {
            log::warn!("{:?} does not guarantee timestamps on compute queues", physical_device_name);
        }

        // 找到所有的队列信息并打印出来
        let queue_family_props = unsafe { instance.get_physical_device_queue_family_properties(pdevice) };
        log::debug!("physical device: queue family props:\n{:#?}", queue_family_props);

        // 找到符合条件的 queue family
        let find_queue_family = |name: &str, include_flags: vk::QueueFlags, exclude_flags: vk::QueueFlags| {
            queue_family_props
                .iter()
                .enumerate()
                .find(|(_, props)| {
                    props.queue_flags.contains(include_flags) && (props.queue_flags & exclude_flags).is_empty()
                })
                .map(|(family_idx, props)| QueueFamily {
                    name: name.to_string(),
                    queue_family_index: family_idx as u32,
                    queue_flags: props.queue_flags,
                    queue_count: props.queue_count,
                    timestamp_valid_bits: props.timestamp_valid_bits,
                })
        };

        // Compute Only，没有时退回到全能的 queue family
        let compute_queue_family = find_queue_family("compute-only", vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS)
            .or_else(|| find_queue_family("compute", vk::QueueFlags::COMPUTE, vk::QueueFlags::empty()))
            .ok_or_else(|| GfxError::Device(format!("{:?} has no compute queue family", physical_device_name)))?;

        // Transfer Only，没有时与 compute 共用同一个 queue family
        let copy_queue_family = find_queue_family(
            "transfer-only",
            vk::QueueFlags::TRANSFER,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        )
        .unwrap_or_else(|| compute_queue_family.clone());

        Ok(Self {
            vk_handle: pdevice,
            basic_props,
            compute_queue_family,
            copy_queue_family,
        })
    }

    /// 当前 gpu 是否是独立显卡
    #[inline]
    pub fn is_descrete_gpu(&self) -> bool {
        self.basic_props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }
}

// getters
impl PhysicalDevice {
    #[inline]
    pub fn queue_family(&self, kind: QueueKind) -> &QueueFamily {
        match kind {
            QueueKind::Compute => &self.compute_queue_family,
            QueueKind::Copy => &self.copy_queue_family,
        }
    }

    /// 两种队列使用不同的 queue family 时，资源需要 CONCURRENT 共享
    #[inline]
    pub fn queue_family_indices(&self) -> Vec<u32> {
        [self.compute_queue_family.queue_family_index, self.copy_queue_family.queue_family_index]
            .into_iter()
            .unique()
            .collect_vec()
    }

    /// 一个 tick 对应的纳秒数
    #[inline]
    pub fn timestamp_period(&self) -> f32 {
        self.basic_props.limits.timestamp_period
    }
}
