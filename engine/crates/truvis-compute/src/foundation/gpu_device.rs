use std::{ptr::NonNull, time::Duration};

use crate::{
    descriptors::descriptor_table::Descriptor,
    error::GfxResult,
    resources::{
        state::{ResourceState, ResourceTransition},
        texture::{Format, TextureDesc, TextureType},
    },
};

/// 队列的种类，copy 队列只能执行拷贝命令
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Compute,
    Copy,
}

/// 内存堆的放置位置
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeapPlacement {
    /// GPU 本地内存，CPU 不可见
    DeviceLocal,
    /// CPU 可写，GPU 可读
    Upload,
    /// GPU 可写，CPU 在同步之后可读
    Readback,
}

impl HeapPlacement {
    #[inline]
    pub fn is_host_visible(self) -> bool {
        !matches!(self, HeapPlacement::DeviceLocal)
    }
}

/// 创建资源时的形状描述，buffer 的大小已经对齐
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceDesc {
    Buffer { size: u64, unordered_access: bool },
    Texture { desc: TextureDesc, unordered_access: bool },
}

/// buffer view 的公共描述
///
/// - typed view：`format` 为具体格式，`stride == 0`
/// - structured view：`format == Unknown`，`stride > 0`
/// - raw view：`format == R32Typeless`，`raw == true`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferViewDesc {
    pub format: Format,
    pub first_element: u64,
    pub element_count: u32,
    pub stride: u32,
    pub raw: bool,
}

impl BufferViewDesc {
    /// 单个元素的字节数；raw view 按 4 字节寻址
    #[inline]
    pub fn element_size(&self) -> u64 {
        if self.raw {
            4
        } else if self.stride > 0 {
            self.stride as u64
        } else {
            self.format.byte_size() as u64
        }
    }

    #[inline]
    pub fn byte_offset(&self) -> u64 {
        self.first_element * self.element_size()
    }

    #[inline]
    pub fn byte_len(&self) -> u64 {
        self.element_count as u64 * self.element_size()
    }
}

/// 写入描述符槽位的 view
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewDesc {
    Constant { size: u64 },
    ShaderResource(BufferViewDesc),
    UnorderedAccess(BufferViewDesc),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    Signaled,
    TimedOut,
}

/// 计算层依赖的全部设备原语
///
/// 核心组件（work tracker、内存分配器、描述符表）只通过该 trait 访问设备，
/// 关联类型就是外部协作者交给核心的不透明句柄。
///
/// 所有关联类型都在 drop 时释放自身持有的设备对象。
pub trait GpuDevice: Sized + 'static {
    type Fence;
    type Event;
    type Queue;
    type CommandList;
    type Resource;
    type DescriptorHeap;
    type Pipeline;
    type QueryHeap;

    fn backend_name(&self) -> &'static str;

    // fence 与 event

    fn create_fence(&self, initial_value: u64, debug_name: &str) -> GfxResult<Self::Fence>;
    fn create_event(&self, debug_name: &str) -> GfxResult<Self::Event>;
    fn fence_completed_value(&self, fence: &Self::Fence) -> GfxResult<u64>;
    /// 注册：fence 到达 `value` 时触发 `event`
    fn set_event_on_completion(&self, fence: &Self::Fence, value: u64, event: &Self::Event) -> GfxResult<()>;
    /// 阻塞等待 event；`timeout == None` 表示无限等待
    fn wait_event(&self, event: &Self::Event, timeout: Option<Duration>) -> GfxResult<WaitStatus>;

    // queue

    fn create_queue(&self, kind: QueueKind, disable_timeout: bool, debug_name: &str) -> GfxResult<Self::Queue>;
    /// 在队列中之前的所有命令完成后，将 fence 设置为 `value`
    fn queue_signal(&self, queue: &Self::Queue, fence: &Self::Fence, value: u64) -> GfxResult<()>;
    /// 提交一个已经 close 的 command list
    fn queue_execute(&self, queue: &Self::Queue, list: &Self::CommandList) -> GfxResult<()>;
    /// 时间戳频率（tick / 秒）
    fn queue_timestamp_frequency(&self, queue: &Self::Queue) -> GfxResult<u64>;
    fn queue_begin_label(&self, queue: &Self::Queue, label: &str);
    fn queue_end_label(&self, queue: &Self::Queue);

    // command list

    /// 创建之后即处于录制状态
    fn create_command_list(&self, kind: QueueKind, debug_name: &str) -> GfxResult<Self::CommandList>;
    fn reset_command_list(&self, list: &mut Self::CommandList) -> GfxResult<()>;
    fn close_command_list(&self, list: &mut Self::CommandList) -> GfxResult<()>;
    fn cmd_copy_resource(&self, list: &mut Self::CommandList, dst: &Self::Resource, src: &Self::Resource)
    -> GfxResult<()>;
    fn cmd_copy_buffer_region(
        &self,
        list: &mut Self::CommandList,
        dst: &Self::Resource,
        dst_offset: u64,
        src: &Self::Resource,
        src_offset: u64,
        size: u64,
    ) -> GfxResult<()>;
    fn cmd_resource_barrier(
        &self,
        list: &mut Self::CommandList,
        barriers: &[(&Self::Resource, ResourceTransition)],
    ) -> GfxResult<()>;
    fn cmd_dispatch(
        &self,
        list: &mut Self::CommandList,
        pipeline: &Self::Pipeline,
        heap: &Self::DescriptorHeap,
        group_count: [u32; 3],
    ) -> GfxResult<()>;
    fn cmd_write_timestamp(&self, list: &mut Self::CommandList, heap: &Self::QueryHeap, index: u32) -> GfxResult<()>;
    /// 将 `[first, first + count)` 的时间戳以 u64 写入 `dst`
    fn cmd_resolve_timestamps(
        &self,
        list: &mut Self::CommandList,
        heap: &Self::QueryHeap,
        first: u32,
        count: u32,
        dst: &Self::Resource,
        dst_offset: u64,
    ) -> GfxResult<()>;

    // resources

    fn check_format_support(&self, texture_type: TextureType, format: Format, unordered_access: bool) -> bool;
    fn create_committed_resource(
        &self,
        placement: HeapPlacement,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        debug_name: &str,
    ) -> GfxResult<Self::Resource>;
    /// 返回 host 可见地址，只对 upload / readback 内存有效
    fn map(&self, resource: &Self::Resource) -> GfxResult<NonNull<u8>>;
    fn unmap(&self, resource: &Self::Resource);
    fn resource_byte_size(&self, resource: &Self::Resource) -> u64;
    fn gpu_virtual_address(&self, resource: &Self::Resource) -> u64;

    // descriptors

    fn create_descriptor_heap(&self, capacity: u32, debug_name: &str) -> GfxResult<Self::DescriptorHeap>;
    /// 相邻两个槽位之间的句柄间距
    fn descriptor_increment_size(&self) -> u64;
    fn descriptor_heap_start(&self, heap: &Self::DescriptorHeap) -> Descriptor;
    fn write_descriptor(
        &self,
        heap: &Self::DescriptorHeap,
        slot: u32,
        resource: &Self::Resource,
        view: &ViewDesc,
    ) -> GfxResult<()>;

    // query

    fn create_timestamp_query_heap(&self, count: u32, debug_name: &str) -> GfxResult<Self::QueryHeap>;

    // diagnostics

    /// 当前仍然存活的设备对象数量
    fn live_object_count(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_view_sizes() {
        let typed = BufferViewDesc {
            format: Format::R32G32Float,
            first_element: 2,
            element_count: 10,
            stride: 0,
            raw: false,
        };
        assert_eq!(typed.element_size(), 8);
        assert_eq!(typed.byte_offset(), 16);
        assert_eq!(typed.byte_len(), 80);

        let structured = BufferViewDesc {
            format: Format::Unknown,
            first_element: 0,
            element_count: 3,
            stride: 48,
            raw: false,
        };
        assert_eq!(structured.byte_len(), 144);

        let raw = BufferViewDesc {
            format: Format::R32Typeless,
            first_element: 0,
            element_count: 64,
            stride: 0,
            raw: true,
        };
        assert_eq!(raw.byte_len(), 256);
    }

    #[test]
    fn test_host_visibility() {
        assert!(!HeapPlacement::DeviceLocal.is_host_visible());
        assert!(HeapPlacement::Upload.is_host_visible());
        assert!(HeapPlacement::Readback.is_host_visible());
    }
}
