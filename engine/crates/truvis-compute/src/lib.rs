//! 计算层 (Compute Layer)
//!
//! 直接位于 GPU 计算 API 之上的一层薄封装，核心只有三部分：
//! - [`commands::work_tracker::WorkCompletionTracker`]：向队列提交 signal，并按 [`commands::work_tracker::WorkId`] 阻塞等待完成
//! - [`resources::memory::TypedMemoryAllocator`]：按用途（upload / device-local / readback）分配 GPU 内存，并提供 host 拷贝工具
//! - [`descriptors::descriptor_table::DescriptorTable`]：固定容量、只增不减的 shader 可见描述符表
//!
//! 这三部分都只依赖 [`foundation::gpu_device::GpuDevice`] trait，
//! 具体实现见 [`backends::vulkan`]（ash + vk-mem）与 [`backends::emulated`]（host 内存模拟）。

pub mod backends;
pub mod basic;
pub mod commands;
pub mod descriptors;
pub mod diagnostics;
pub mod error;
pub mod foundation;
pub mod resources;

pub use error::{GfxError, GfxResult};
