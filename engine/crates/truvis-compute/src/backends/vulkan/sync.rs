use std::{cell::Cell, rc::Rc, time::Duration};

use ash::vk;

use crate::{
    backends::vulkan::{debug_messenger::DebugType, device::DeviceFunctions},
    diagnostics::LiveToken,
    error::{GfxError, GfxResult, VkResultExt},
    foundation::gpu_device::WaitStatus,
};

/// fence：timeline semaphore
pub struct VulkanFence {
    semaphore: vk::Semaphore,
    device_functions: Rc<DeviceFunctions>,
    _live: LiveToken,
}

impl DebugType for VulkanFence {
    fn debug_type_name() -> &'static str {
        "VulkanFence"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.semaphore
    }
}

// 创建与销毁
impl VulkanFence {
    pub fn new(
        device_functions: Rc<DeviceFunctions>,
        initial_value: u64,
        debug_name: &str,
        live: LiveToken,
    ) -> GfxResult<Self> {
        let mut timeline_type_ci = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let timeline_semaphore_ci = vk::SemaphoreCreateInfo::default().push_next(&mut timeline_type_ci);
        let semaphore =
            unsafe { device_functions.create_semaphore(&timeline_semaphore_ci, None).vk_op("create_semaphore")? };

        let fence = Self {
            semaphore,
            device_functions,
            _live: live,
        };
        fence.device_functions.set_debug_name(&fence, debug_name);
        Ok(fence)
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe {
            self.device_functions.destroy_semaphore(self.semaphore, None);
        }
    }
}

// getters
impl VulkanFence {
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

// tools
impl VulkanFence {
    #[inline]
    pub fn completed_value(&self) -> GfxResult<u64> {
        unsafe { self.device_functions.get_semaphore_counter_value(self.semaphore).vk_op("get_semaphore_counter_value") }
    }
}

/// event：记录需要等待的 timeline semaphore 与目标值，等待时调用 vkWaitSemaphores
///
/// 注册的 semaphore 由对应的 [`VulkanFence`] 持有，需要保证 fence 晚于 event 的等待销毁
pub struct VulkanEvent {
    target: Cell<Option<(vk::Semaphore, u64)>>,
    _live: LiveToken,
}

impl VulkanEvent {
    pub fn new(live: LiveToken) -> Self {
        Self {
            target: Cell::new(None),
            _live: live,
        }
    }

    #[inline]
    pub fn register(&self, fence: &VulkanFence, value: u64) {
        self.target.set(Some((fence.handle(), value)));
    }

    pub fn wait(&self, device_functions: &DeviceFunctions, timeout: Option<Duration>) -> GfxResult<WaitStatus> {
        let (semaphore, value) = self
            .target
            .get()
            .ok_or_else(|| GfxError::WaitFailed("event has no pending fence registration".to_string()))?;

        let timeout_ns = timeout.map_or(u64::MAX, |t| t.as_nanos().min(u64::MAX as u128) as u64);
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(std::slice::from_ref(&semaphore))
            .values(std::slice::from_ref(&value));
        match unsafe { device_functions.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(WaitStatus::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(WaitStatus::TimedOut),
            Err(result) => Err(GfxError::Vulkan {
                op: "wait_semaphores",
                result,
            }),
        }
    }
}
