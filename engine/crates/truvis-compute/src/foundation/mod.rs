pub mod config;
pub mod gpu_device;
