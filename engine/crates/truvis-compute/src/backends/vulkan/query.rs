use std::rc::Rc;

use ash::vk;

use crate::{
    backends::vulkan::{debug_messenger::DebugType, device::DeviceFunctions},
    diagnostics::LiveToken,
    error::{GfxError, GfxResult, VkResultExt},
};

/// timestamp query pool
pub struct VulkanQueryHeap {
    handle: vk::QueryPool,
    /// pool 的容量
    count: u32,

    device_functions: Rc<DeviceFunctions>,
    _live: LiveToken,
}

impl DebugType for VulkanQueryHeap {
    fn debug_type_name() -> &'static str {
        "VulkanQueryHeap"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}

impl Drop for VulkanQueryHeap {
    fn drop(&mut self) {
        unsafe {
            self.device_functions.destroy_query_pool(self.handle, None);
        }
    }
}

impl VulkanQueryHeap {
    /// 创建之后在 host 上 reset 全部 query
    pub fn new_timestamp(
        device_functions: Rc<DeviceFunctions>,
        count: u32,
        debug_name: &str,
        live: LiveToken,
    ) -> GfxResult<Self> {
        if count == 0 {
            return Err(GfxError::InvalidArgument("query heap count must be greater than zero".to_string()));
        }
        let create_info = vk::QueryPoolCreateInfo::default().query_type(vk::QueryType::TIMESTAMP).query_count(count);
        let handle = unsafe { device_functions.create_query_pool(&create_info, None).vk_op("create_query_pool")? };
        unsafe {
            device_functions.reset_query_pool(handle, 0, count);
        }

        let heap = Self {
            handle,
            count,
            device_functions,
            _live: live,
        };
        heap.device_functions.set_debug_name(&heap, debug_name);
        Ok(heap)
    }

    #[inline]
    pub fn handle(&self) -> vk::QueryPool {
        self.handle
    }

    #[inline]
    pub fn check_index(&self, index: u32) -> GfxResult<()> {
        if index >= self.count {
            return Err(GfxError::InvalidArgument(format!(
                "timestamp index {index} out of query heap (count {})",
                self.count
            )));
        }
        Ok(())
    }
}
