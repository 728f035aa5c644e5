use std::{ffi::CString, rc::Rc};

use ash::vk;

use crate::{
    backends::vulkan::{
        command_list::VulkanCommandList, debug_messenger::DebugType, device::DeviceFunctions,
        physical_device::QueueFamily, sync::VulkanFence,
    },
    diagnostics::LiveToken,
    error::{GfxResult, VkResultExt},
    foundation::gpu_device::QueueKind,
};

/// # destroy
///
/// vk::Queue 在 device 销毁时会被销毁
pub struct VulkanQueue {
    pub(crate) vk_queue: vk::Queue,
    pub(crate) queue_family: QueueFamily,
    pub(crate) kind: QueueKind,
    pub(crate) device_functions: Rc<DeviceFunctions>,
    _live: LiveToken,
}

impl DebugType for VulkanQueue {
    fn debug_type_name() -> &'static str {
        "VulkanQueue"
    }
    fn vk_handle(&self) -> impl vk::Handle {
        self.vk_queue
    }
}

impl VulkanQueue {
    /// 每个 queue family 只使用第 0 个队列
    pub fn new(
        device_functions: Rc<DeviceFunctions>,
        queue_family: QueueFamily,
        kind: QueueKind,
        debug_name: &str,
        live: LiveToken,
    ) -> Self {
        let vk_queue = unsafe { device_functions.get_device_queue(queue_family.queue_family_index, 0) };
        let queue = Self {
            vk_queue,
            queue_family,
            kind,
            device_functions,
            _live: live,
        };
        queue.device_functions.set_debug_name(&queue, debug_name);
        queue
    }
}

// getters
impl VulkanQueue {
    #[inline]
    pub fn queue_family(&self) -> &QueueFamily {
        &self.queue_family
    }

    #[inline]
    pub fn handle(&self) -> vk::Queue {
        self.vk_queue
    }
}

// tools
impl VulkanQueue {
    /// 只包含一个 signal 操作的提交
    pub fn signal(&self, fence: &VulkanFence, value: u64) -> GfxResult<()> {
        let signal_info = vk::SemaphoreSubmitInfo::default()
            .semaphore(fence.handle())
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS);
        let submit_info = vk::SubmitInfo2::default().signal_semaphore_infos(std::slice::from_ref(&signal_info));
        unsafe {
            self.device_functions
                .queue_submit2(self.vk_queue, std::slice::from_ref(&submit_info), vk::Fence::null())
                .vk_op("queue_submit2")
        }
    }

    pub fn execute(&self, list: &VulkanCommandList) -> GfxResult<()> {
        let command_buffer_info = vk::CommandBufferSubmitInfo::default().command_buffer(list.command_buffer());
        let submit_info =
            vk::SubmitInfo2::default().command_buffer_infos(std::slice::from_ref(&command_buffer_info));
        unsafe {
            self.device_functions
                .queue_submit2(self.vk_queue, std::slice::from_ref(&submit_info), vk::Fence::null())
                .vk_op("queue_submit2")
        }
    }
}

// debug 相关命令
impl VulkanQueue {
    #[inline]
    pub fn begin_label(&self, label_name: &str) {
        let Ok(name) = CString::new(label_name) else {
            log::warn!("queue label {:?} contains a nul byte", label_name);
            return;
        };
        unsafe {
            self.device_functions.debug_utils.queue_begin_debug_utils_label(
                self.vk_queue,
                &vk::DebugUtilsLabelEXT::default().label_name(name.as_c_str()).color([0.2, 0.6, 1.0, 1.0]),
            );
        }
    }

    #[inline]
    pub fn end_label(&self) {
        unsafe {
            self.device_functions.debug_utils.queue_end_debug_utils_label(self.vk_queue);
        }
    }
}
