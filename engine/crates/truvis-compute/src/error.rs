use ash::vk;

use crate::resources::texture::{Format, TextureType};

/// 计算层的统一错误类型
///
/// 分为三类：
/// - 调用方违反前置条件（参数非法、大小为 0、格式不支持）
/// - 驱动或平台失败（Vulkan 调用失败、等待原语失败）
/// - 逻辑误用（未知的 WorkId、描述符表溢出、映射不可见内存、拷贝越界）
///
/// 所有错误都不会在内部重试，直接通过 `?` 交给调用方。
#[derive(Debug, thiserror::Error)]
pub enum GfxError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("allocation size must be greater than zero")]
    ZeroSize,

    #[error("format {format:?} is not supported as {usage} on {texture_type:?}")]
    UnsupportedFormat {
        format: Format,
        texture_type: Option<TextureType>,
        usage: &'static str,
    },

    #[error("mip count 0 must be resolved to a concrete mip chain before allocation")]
    UnresolvedMipChain,

    #[error("vulkan call `{op}` failed: {result:?}")]
    Vulkan { op: &'static str, result: vk::Result },

    #[error("config error: {0}")]
    Config(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("wait failed: {0}")]
    WaitFailed(String),

    #[error("work id {id} was not produced by this tracker ({issued} ids issued)")]
    UnknownWorkId { id: u64, issued: u64 },

    #[error("descriptor table is full (capacity {capacity})")]
    DescriptorTableFull { capacity: u32 },

    #[error("allocation `{name}` is not host visible")]
    NotHostVisible { name: String },

    #[error("copy of {requested} bytes exceeds allocation `{name}` of {available} bytes")]
    CopyOutOfBounds {
        name: String,
        requested: u64,
        available: u64,
    },
}

pub type GfxResult<T> = Result<T, GfxError>;

/// 将 ash 的 `VkResult` 转换为 [`GfxResult`]，并记录失败的调用
pub trait VkResultExt<T> {
    fn vk_op(self, op: &'static str) -> GfxResult<T>;
}

impl<T> VkResultExt<T> for ash::prelude::VkResult<T> {
    #[inline]
    fn vk_op(self, op: &'static str) -> GfxResult<T> {
        self.map_err(|result| GfxError::Vulkan { op, result })
    }
}
