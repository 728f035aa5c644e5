//! 基于 ash 与 vk-mem 的设备
//!
//! 与 D3D12 风格的原语一一对应：
//! - fence：timeline semaphore；event：等待 semaphore 到达目标值
//! - command list：独占 command pool 的 primary command buffer
//! - 描述符堆：一个 descriptor set，四种 view 各占一个 binding
//! - timestamp：query pool + `vkCmdCopyQueryPoolResults`

pub mod command_list;
pub mod convert;
pub mod debug_messenger;
pub mod descriptor_heap;
pub mod device;
pub mod instance;
pub mod mem_allocator;
pub mod physical_device;
pub mod pipeline;
pub mod query;
pub mod queue;
pub mod resource;
pub mod sync;

use std::{ffi::CStr, path::Path, ptr::NonNull, rc::Rc, time::Duration};

use ash::vk;

use crate::{
    backends::vulkan::{
        command_list::VulkanCommandList,
        convert::{vk_format, vk_image_type},
        descriptor_heap::VulkanDescriptorHeap,
        device::DeviceFunctions,
        instance::Instance,
        mem_allocator::MemAllocator,
        physical_device::PhysicalDevice,
        pipeline::VulkanPipeline,
        query::VulkanQueryHeap,
        queue::VulkanQueue,
        resource::VulkanResource,
        sync::{VulkanEvent, VulkanFence},
    },
    descriptors::descriptor_table::Descriptor,
    diagnostics::LiveCounter,
    error::{GfxError, GfxResult},
    foundation::{
        config::GfxConfig,
        gpu_device::{GpuDevice, HeapPlacement, QueueKind, ResourceDesc, ViewDesc, WaitStatus},
    },
    resources::{
        state::{ResourceState, ResourceTransition},
        texture::{Format, TextureType},
    },
};

/// 所有的槽位都位于同一个 descriptor set 中，槽位句柄就是数组下标
const DESCRIPTOR_INCREMENT_SIZE: u64 = 1;

/// # destroy
///
/// 字段按声明顺序 drop：vma 先于 device 销毁，device 先于 instance 销毁。
/// 各个设备对象持有 `Rc<DeviceFunctions>`，可以晚于 [`VulkanDevice`] 销毁。
pub struct VulkanDevice {
    live: LiveCounter,
    allocator: Rc<MemAllocator>,
    physical_device: PhysicalDevice,
    /// 资源在这些 queue family 之间共享
    queue_family_indices: Vec<u32>,
    device_functions: Rc<DeviceFunctions>,
}

// 创建
impl VulkanDevice {
    pub fn new(config: &GfxConfig) -> GfxResult<Self> {
        let instance = Rc::new(Instance::new(config)?);
        let physical_device = PhysicalDevice::new_descrete_physical_device(instance.ash_instance())?;
        let device_functions = Rc::new(DeviceFunctions::new(instance, &physical_device)?);
        let allocator = Rc::new(MemAllocator::new(device_functions.clone(), &physical_device)?);

        let device_name = physical_device.basic_props.device_name_as_c_str().unwrap_or(c"unknown");
        log::info!(
            "vulkan device ready: {:?}, compute family {}, copy family {}",
            device_name,
            physical_device.compute_queue_family.queue_family_index,
            physical_device.copy_queue_family.queue_family_index
        );

        Ok(Self {
            live: LiveCounter::default(),
            allocator,
            queue_family_indices: physical_device.queue_family_indices(),
            physical_device,
            device_functions,
        })
    }

    /// 从 SPIR-V 文件创建 compute pipeline，pipeline layout 与 `heap` 的 set layout 一致
    ///
    /// 相同容量的描述符堆 layout 相同，pipeline 可以与它们中的任意一个一起使用
    pub fn create_compute_pipeline(
        &self,
        heap: &VulkanDescriptorHeap,
        spirv_path: &Path,
        debug_name: &str,
    ) -> GfxResult<VulkanPipeline> {
        VulkanPipeline::new(self.device_functions.clone(), heap, spirv_path, debug_name, self.live.token())
    }
}

// getters
impl VulkanDevice {
    #[inline]
    pub fn physical_device(&self) -> &PhysicalDevice {
        &self.physical_device
    }

    #[inline]
    pub fn device_functions(&self) -> &Rc<DeviceFunctions> {
        &self.device_functions
    }

    #[inline]
    pub fn device_name(&self) -> &CStr {
        self.physical_device.basic_props.device_name_as_c_str().unwrap_or(c"unknown")
    }
}

impl GpuDevice for VulkanDevice {
    type Fence = VulkanFence;
    type Event = VulkanEvent;
    type Queue = VulkanQueue;
    type CommandList = VulkanCommandList;
    type Resource = VulkanResource;
    type DescriptorHeap = VulkanDescriptorHeap;
    type Pipeline = VulkanPipeline;
    type QueryHeap = VulkanQueryHeap;

    fn backend_name(&self) -> &'static str {
        "vulkan"
    }

    fn create_fence(&self, initial_value: u64, debug_name: &str) -> GfxResult<Self::Fence> {
        VulkanFence::new(self.device_functions.clone(), initial_value, debug_name, self.live.token())
    }

    fn create_event(&self, _debug_name: &str) -> GfxResult<Self::Event> {
        Ok(VulkanEvent::new(self.live.token()))
    }

    fn fence_completed_value(&self, fence: &Self::Fence) -> GfxResult<u64> {
        fence.completed_value()
    }

    fn set_event_on_completion(&self, fence: &Self::Fence, value: u64, event: &Self::Event) -> GfxResult<()> {
        event.register(fence, value);
        Ok(())
    }

    fn wait_event(&self, event: &Self::Event, timeout: Option<Duration>) -> GfxResult<WaitStatus> {
        event.wait(&self.device_functions, timeout)
    }

    fn create_queue(&self, kind: QueueKind, disable_timeout: bool, debug_name: &str) -> GfxResult<Self::Queue> {
        if disable_timeout {
            // Vulkan 没有对应的队列参数，GPU 超时由驱动决定
            log::debug!("disable_timeout has no effect on vulkan queue `{}`", debug_name);
        }
        let queue_family = self.physical_device.queue_family(kind).clone();
        log::info!("create {:?} queue `{}` on family {}", kind, debug_name, queue_family.name);
        Ok(VulkanQueue::new(self.device_functions.clone(), queue_family, kind, debug_name, self.live.token()))
    }

    fn queue_signal(&self, queue: &Self::Queue, fence: &Self::Fence, value: u64) -> GfxResult<()> {
        queue.signal(fence, value)
    }

    fn queue_execute(&self, queue: &Self::Queue, list: &Self::CommandList) -> GfxResult<()> {
        if !list.is_closed() {
            return Err(GfxError::InvalidArgument(format!(
                "command list `{}` must be closed before execute",
                list.debug_name()
            )));
        }
        if list.kind != queue.kind {
            return Err(GfxError::InvalidArgument(format!(
                "{:?} command list `{}` submitted to {:?} queue",
                list.kind,
                list.debug_name(),
                queue.kind
            )));
        }
        queue.execute(list)
    }

    fn queue_timestamp_frequency(&self, queue: &Self::Queue) -> GfxResult<u64> {
        if queue.queue_family().timestamp_valid_bits == 0 {
            return Err(GfxError::Device(format!(
                "queue family {} does not support timestamps",
                queue.queue_family().name
            )));
        }
        let period = self.physical_device.timestamp_period() as f64;
        Ok((1e9 / period).round() as u64)
    }

    fn queue_begin_label(&self, queue: &Self::Queue, label: &str) {
        queue.begin_label(label);
    }

    fn queue_end_label(&self, queue: &Self::Queue) {
        queue.end_label();
    }

    fn create_command_list(&self, kind: QueueKind, debug_name: &str) -> GfxResult<Self::CommandList> {
        let queue_family = self.physical_device.queue_family(kind);
        VulkanCommandList::new(self.device_functions.clone(), queue_family, kind, debug_name, self.live.token())
    }

    fn reset_command_list(&self, list: &mut Self::CommandList) -> GfxResult<()> {
        list.reset()
    }

    fn close_command_list(&self, list: &mut Self::CommandList) -> GfxResult<()> {
        list.close()
    }

    fn cmd_copy_resource(
        &self,
        list: &mut Self::CommandList,
        dst: &Self::Resource,
        src: &Self::Resource,
    ) -> GfxResult<()> {
        list.copy_resource(dst, src)
    }

    fn cmd_copy_buffer_region(
        &self,
        list: &mut Self::CommandList,
        dst: &Self::Resource,
        dst_offset: u64,
        src: &Self::Resource,
        src_offset: u64,
        size: u64,
    ) -> GfxResult<()> {
        list.copy_buffer_region(dst, dst_offset, src, src_offset, size)
    }

    fn cmd_resource_barrier(
        &self,
        list: &mut Self::CommandList,
        barriers: &[(&Self::Resource, ResourceTransition)],
    ) -> GfxResult<()> {
        list.resource_barrier(barriers)
    }

    fn cmd_dispatch(
        &self,
        list: &mut Self::CommandList,
        pipeline: &Self::Pipeline,
        heap: &Self::DescriptorHeap,
        group_count: [u32; 3],
    ) -> GfxResult<()> {
        list.dispatch(pipeline, heap, group_count)
    }

    fn cmd_write_timestamp(&self, list: &mut Self::CommandList, heap: &Self::QueryHeap, index: u32) -> GfxResult<()> {
        list.write_timestamp(heap, index)
    }

    fn cmd_resolve_timestamps(
        &self,
        list: &mut Self::CommandList,
        heap: &Self::QueryHeap,
        first: u32,
        count: u32,
        dst: &Self::Resource,
        dst_offset: u64,
    ) -> GfxResult<()> {
        if count == 0 {
            return Ok(());
        }
        list.resolve_timestamps(heap, first, count, dst, dst_offset)
    }

    fn check_format_support(&self, texture_type: TextureType, format: Format, unordered_access: bool) -> bool {
        if !format.is_typed() {
            return false;
        }
        let mut usage = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        usage |= if unordered_access { vk::ImageUsageFlags::STORAGE } else { vk::ImageUsageFlags::SAMPLED };

        let instance = self.device_functions.instance().ash_instance();
        let props = unsafe {
            instance.get_physical_device_image_format_properties(
                self.physical_device.vk_handle,
                vk_format(format),
                vk_image_type(texture_type),
                vk::ImageTiling::OPTIMAL,
                usage,
                vk::ImageCreateFlags::empty(),
            )
        };
        match props {
            Ok(_) => true,
            Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED) => false,
            Err(e) => {
                log::warn!("format query for {:?} failed: {:?}", format, e);
                false
            }
        }
    }

    fn create_committed_resource(
        &self,
        placement: HeapPlacement,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        debug_name: &str,
    ) -> GfxResult<Self::Resource> {
        let size = match desc {
            ResourceDesc::Buffer { size, .. } => *size,
            ResourceDesc::Texture { desc, .. } => desc.packed_byte_size()?,
        };
        if size == 0 {
            return Err(GfxError::ZeroSize);
        }
        // 初始状态只决定第一次 barrier 的 src mask，image 总是从 UNDEFINED layout 开始
        log::trace!("create resource `{}`: {} bytes {:?} {:?}", debug_name, size, placement, initial_state);

        VulkanResource::new(
            &self.device_functions,
            self.allocator.clone(),
            &self.queue_family_indices,
            placement,
            desc,
            debug_name,
            self.live.token(),
        )
    }

    fn map(&self, resource: &Self::Resource) -> GfxResult<NonNull<u8>> {
        resource.map()
    }

    fn unmap(&self, resource: &Self::Resource) {
        resource.unmap();
    }

    fn resource_byte_size(&self, resource: &Self::Resource) -> u64 {
        resource.size
    }

    fn gpu_virtual_address(&self, resource: &Self::Resource) -> u64 {
        resource.device_addr()
    }

    fn create_descriptor_heap(&self, capacity: u32, debug_name: &str) -> GfxResult<Self::DescriptorHeap> {
        VulkanDescriptorHeap::new(self.device_functions.clone(), capacity, debug_name, self.live.token())
    }

    fn descriptor_increment_size(&self) -> u64 {
        DESCRIPTOR_INCREMENT_SIZE
    }

    fn descriptor_heap_start(&self, _heap: &Self::DescriptorHeap) -> Descriptor {
        Descriptor {
            gpu_handle: 0,
            cpu_handle: 0,
        }
    }

    fn write_descriptor(
        &self,
        heap: &Self::DescriptorHeap,
        slot: u32,
        resource: &Self::Resource,
        view: &ViewDesc,
    ) -> GfxResult<()> {
        heap.write(slot, resource, view)
    }

    fn create_timestamp_query_heap(&self, count: u32, debug_name: &str) -> GfxResult<Self::QueryHeap> {
        VulkanQueryHeap::new_timestamp(self.device_functions.clone(), count, debug_name, self.live.token())
    }

    fn live_object_count(&self) -> usize {
        self.live.get()
    }
}
