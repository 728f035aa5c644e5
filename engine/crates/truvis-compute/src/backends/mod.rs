//! [`GpuDevice`](crate::foundation::gpu_device::GpuDevice) 的具体实现
//!
//! - [`vulkan`]：ash + vk-mem，运行在真实 GPU 上
//! - [`emulated`]：host 内存与后台线程模拟的设备，测试与默认 demo 使用

pub mod emulated;
pub mod vulkan;
