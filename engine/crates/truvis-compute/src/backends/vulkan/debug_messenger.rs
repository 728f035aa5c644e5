use std::{
    ffi::CStr,
    sync::atomic::{AtomicU32, Ordering},
};

use ash::vk;

use crate::error::{GfxResult, VkResultExt};

/// 进程内 validation layer 报告的 error 数量
static VALIDATION_ERROR_COUNT: AtomicU32 = AtomicU32::new(0);

#[inline]
pub fn validation_error_count() -> u32 {
    VALIDATION_ERROR_COUNT.load(Ordering::Relaxed)
}

/// validation layer 的消息转发到 `log`
pub struct DebugMsger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMsger {
    pub fn new(vk_entry: &ash::Entry, instance: &ash::Instance) -> GfxResult<Self> {
        let loader = ash::ext::debug_utils::Instance::new(vk_entry, instance);
        let messenger = unsafe {
            loader
                .create_debug_utils_messenger(&Self::debug_utils_messenger_ci(), None)
                .vk_op("create_debug_utils_messenger")?
        };
        Ok(Self { loader, messenger })
    }

    /// 创建 instance 时也挂在 p_next 上，用于捕获 instance 创建与销毁期间的消息
    pub fn debug_utils_messenger_ci() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
        // 日志级别为 debug 及以上时才接收 INFO/VERBOSE，避免 loader 的大量输出
        let mut severity = vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR;
        if log::max_level() >= log::LevelFilter::Debug {
            severity |= vk::DebugUtilsMessageSeverityFlagsEXT::INFO;
        }

        vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(severity)
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vk_debug_callback))
    }
}

impl Drop for DebugMsger {
    fn drop(&mut self) {
        let errors = validation_error_count();
        if errors > 0 {
            log::warn!("validation layer reported {} errors", errors);
        }
        log::info!("destroying debug messenger");
        unsafe {
            self.loader.destroy_debug_utils_messenger(self.messenger, None);
        }
    }
}

/// # Safety
/// 由 validation layer 调用，`p_callback_data` 在回调期间有效
unsafe extern "system" fn vk_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    let Some(data) = (unsafe { p_callback_data.as_ref() }) else {
        return vk::FALSE;
    };
    let c_str_or_empty = |ptr: *const std::os::raw::c_char| {
        if ptr.is_null() { Default::default() } else { unsafe { CStr::from_ptr(ptr).to_string_lossy() } }
    };
    let id_name = c_str_or_empty(data.p_message_id_name);
    let msg = c_str_or_empty(data.p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            VALIDATION_ERROR_COUNT.fetch_add(1, Ordering::Relaxed);
            log::error!("[{:?}][{}] {}", message_type, id_name, msg)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("[{:?}][{}] {}", message_type, id_name, msg),
        _ => log::debug!("[{:?}][{}] {}", message_type, id_name, msg),
    };

    // 返回 TRUE 会中断触发消息的调用，只有 layer 开发者需要
    vk::FALSE
}

/// 可以设置 debug name 的 vulkan 对象，名称格式为 `类型名::对象名`
pub trait DebugType {
    fn debug_type_name() -> &'static str;
    fn vk_handle(&self) -> impl vk::Handle;
}
