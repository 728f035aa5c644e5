use std::{ops::Deref, rc::Rc};

use ash::vk;

use crate::{
    backends::vulkan::{device::DeviceFunctions, physical_device::PhysicalDevice},
    error::{GfxResult, VkResultExt},
};

/// vma 的封装
///
/// 由于 vma 的生命周期设定：需要引用 Instance 以及 Device，并确保在其生命周期之内
/// 这两个的引用是有效的。持有 `Rc<DeviceFunctions>`，保证 device 晚于 vma 销毁。
pub struct MemAllocator {
    inner: vk_mem::Allocator,

    _device_functions: Rc<DeviceFunctions>,
}

impl MemAllocator {
    pub fn new(device_functions: Rc<DeviceFunctions>, pdevice: &PhysicalDevice) -> GfxResult<Self> {
        let mut vma_ci = vk_mem::AllocatorCreateInfo::new(
            device_functions.instance().ash_instance(),
            &device_functions.device,
            pdevice.vk_handle,
        );
        vma_ci.vulkan_api_version = vk::API_VERSION_1_3;
        vma_ci.flags = vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS;

        let vma = unsafe { vk_mem::Allocator::new(vma_ci).vk_op("vmaCreateAllocator")? };

        Ok(Self {
            inner: vma,
            _device_functions: device_functions,
        })
    }
}

impl Deref for MemAllocator {
    type Target = vk_mem::Allocator;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
