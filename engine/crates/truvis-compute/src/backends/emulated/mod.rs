//! 在 host 上执行的设备
//!
//! 每个队列对应一个执行线程，命令按提交顺序执行，fence 由执行线程推进。
//! compute pipeline 是一个 host 函数，每个 thread group 调用一次。
//! 用于没有 GPU 的环境以及单元测试。

mod kernel;
mod memory;
mod timeline;

use std::{
    cell::{Cell, RefCell},
    ptr::NonNull,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

pub use kernel::{BoundView, BoundViewKind, DispatchContext, EmulatedPipeline, Kernel};

use crate::{
    backends::emulated::{
        memory::HostBlock,
        timeline::{Command, FenceState, LostState, QueueTimeline, lock},
    },
    descriptors::descriptor_table::Descriptor,
    diagnostics::{LiveCounter, LiveToken},
    error::{GfxError, GfxResult},
    foundation::gpu_device::{GpuDevice, HeapPlacement, QueueKind, ResourceDesc, ViewDesc, WaitStatus},
    resources::{
        state::{ResourceState, ResourceTransition},
        texture::{Format, TextureType},
    },
};

/// 相邻描述符槽位之间的间距
const DESCRIPTOR_INCREMENT_SIZE: u64 = 32;
/// 时间戳以纳秒计
const TIMESTAMP_FREQUENCY: u64 = 1_000_000_000;
const GPU_VA_BASE: u64 = 0x1_0000;

pub struct EmulatedFence {
    state: Arc<FenceState>,
    _live: LiveToken,
}

pub struct EmulatedEvent {
    /// set_event_on_completion 注册的 fence 与目标值
    target: RefCell<Option<(Arc<FenceState>, u64)>>,
    _live: LiveToken,
}

pub struct EmulatedQueue {
    timeline: QueueTimeline,
    kind: QueueKind,
    name: String,
    _live: LiveToken,
}

pub struct EmulatedCommandList {
    kind: QueueKind,
    commands: Vec<Command>,
    closed: bool,
    name: String,
    _live: LiveToken,
}

pub struct EmulatedResource {
    block: Arc<HostBlock>,
    placement: HeapPlacement,
    gpu_va: u64,
    name: String,
    _live: LiveToken,
}

pub struct EmulatedDescriptorHeap {
    slots: Arc<Mutex<Vec<Option<BoundView>>>>,
    base: u64,
    _live: LiveToken,
}

pub struct EmulatedQueryHeap {
    slots: Arc<Mutex<Vec<u64>>>,
    _live: LiveToken,
}

pub struct EmulatedDevice {
    live: LiveCounter,
    lost: LostState,
    epoch: Instant,
    /// 执行线程处理每个提交前的等待时间，用于模拟 GPU 的延迟
    execution_delay: Duration,

    open_labels: Cell<usize>,
    next_gpu_va: Cell<u64>,
    next_heap_id: Cell<u64>,
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

// 创建
impl EmulatedDevice {
    pub fn new() -> Self {
        Self {
            live: LiveCounter::default(),
            lost: LostState::default(),
            epoch: Instant::now(),
            execution_delay: Duration::ZERO,
            open_labels: Cell::new(0),
            next_gpu_va: Cell::new(GPU_VA_BASE),
            next_heap_id: Cell::new(0),
        }
    }

    /// 只影响之后创建的队列
    pub fn with_execution_delay(mut self, delay: Duration) -> Self {
        self.execution_delay = delay;
        self
    }

    pub fn create_compute_pipeline(
        &self,
        name: &str,
        kernel: impl Fn(&DispatchContext<'_>) -> GfxResult<()> + Send + Sync + 'static,
    ) -> EmulatedPipeline {
        log::debug!("created emulated pipeline `{}`", name);
        EmulatedPipeline {
            name: name.to_string(),
            kernel: Arc::new(kernel),
            _live: self.live.token(),
        }
    }
}

// getters
impl EmulatedDevice {
    #[inline]
    pub fn execution_delay(&self) -> Duration {
        self.execution_delay
    }

    /// 尚未结束的队列 label 数量
    #[inline]
    pub fn open_label_count(&self) -> usize {
        self.open_labels.get()
    }

    /// 设备丢失的原因
    pub fn lost_reason(&self) -> Option<String> {
        lock(&self.lost).clone()
    }

    #[inline]
    pub fn is_lost(&self) -> bool {
        lock(&self.lost).is_some()
    }
}

// tools
impl EmulatedDevice {
    fn check_lost(&self) -> GfxResult<()> {
        match lock(&self.lost).as_ref() {
            Some(reason) => Err(GfxError::Device(format!("device lost: {reason}"))),
            None => Ok(()),
        }
    }

    fn record(&self, list: &mut EmulatedCommandList, command: Command) -> GfxResult<()> {
        if list.closed {
            return Err(GfxError::InvalidArgument(format!("command list `{}` is closed", list.name)));
        }
        list.commands.push(command);
        Ok(())
    }
}

impl GpuDevice for EmulatedDevice {
    type Fence = EmulatedFence;
    type Event = EmulatedEvent;
    type Queue = EmulatedQueue;
    type CommandList = EmulatedCommandList;
    type Resource = EmulatedResource;
    type DescriptorHeap = EmulatedDescriptorHeap;
    type Pipeline = EmulatedPipeline;
    type QueryHeap = EmulatedQueryHeap;

    fn backend_name(&self) -> &'static str {
        "emulated"
    }

    fn create_fence(&self, initial_value: u64, debug_name: &str) -> GfxResult<Self::Fence> {
        log::trace!("create fence `{}` = {}", debug_name, initial_value);
        Ok(EmulatedFence {
            state: Arc::new(FenceState::new(initial_value)),
            _live: self.live.token(),
        })
    }

    fn create_event(&self, debug_name: &str) -> GfxResult<Self::Event> {
        log::trace!("create event `{}`", debug_name);
        Ok(EmulatedEvent {
            target: RefCell::new(None),
            _live: self.live.token(),
        })
    }

    fn fence_completed_value(&self, fence: &Self::Fence) -> GfxResult<u64> {
        self.check_lost()?;
        Ok(fence.state.completed_value())
    }

    fn set_event_on_completion(&self, fence: &Self::Fence, value: u64, event: &Self::Event) -> GfxResult<()> {
        *event.target.borrow_mut() = Some((fence.state.clone(), value));
        Ok(())
    }

    fn wait_event(&self, event: &Self::Event, timeout: Option<Duration>) -> GfxResult<WaitStatus> {
        let target = event.target.borrow().clone();
        let (fence, value) =
            target.ok_or_else(|| GfxError::WaitFailed("event has no pending fence registration".to_string()))?;

        let signaled = fence.wait_for(value, timeout);
        self.check_lost()?;
        Ok(if signaled { WaitStatus::Signaled } else { WaitStatus::TimedOut })
    }

    fn create_queue(&self, kind: QueueKind, disable_timeout: bool, debug_name: &str) -> GfxResult<Self::Queue> {
        log::debug!("create emulated {:?} queue `{}` (disable_timeout={})", kind, debug_name, disable_timeout);
        let timeline = QueueTimeline::spawn(debug_name, self.epoch, self.execution_delay, self.lost.clone())?;
        Ok(EmulatedQueue {
            timeline,
            kind,
            name: debug_name.to_string(),
            _live: self.live.token(),
        })
    }

    fn queue_signal(&self, queue: &Self::Queue, fence: &Self::Fence, value: u64) -> GfxResult<()> {
        queue.timeline.signal(fence.state.clone(), value)
    }

    fn queue_execute(&self, queue: &Self::Queue, list: &Self::CommandList) -> GfxResult<()> {
        if !list.closed {
            return Err(GfxError::InvalidArgument(format!("command list `{}` must be closed before execute", list.name)));
        }
        if list.kind != queue.kind {
            return Err(GfxError::InvalidArgument(format!(
                "{:?} command list `{}` submitted to {:?} queue `{}`",
                list.kind, list.name, queue.kind, queue.name
            )));
        }
        queue.timeline.execute(list.commands.clone())
    }

    fn queue_timestamp_frequency(&self, _queue: &Self::Queue) -> GfxResult<u64> {
        Ok(TIMESTAMP_FREQUENCY)
    }

    fn queue_begin_label(&self, queue: &Self::Queue, label: &str) {
        log::debug!("[{}] begin label `{}`", queue.name, label);
        self.open_labels.set(self.open_labels.get() + 1);
    }

    fn queue_end_label(&self, queue: &Self::Queue) {
        log::debug!("[{}] end label", queue.name);
        self.open_labels.set(self.open_labels.get().saturating_sub(1));
    }

    fn create_command_list(&self, kind: QueueKind, debug_name: &str) -> GfxResult<Self::CommandList> {
        Ok(EmulatedCommandList {
            kind,
            commands: Vec::new(),
            closed: false,
            name: debug_name.to_string(),
            _live: self.live.token(),
        })
    }

    fn reset_command_list(&self, list: &mut Self::CommandList) -> GfxResult<()> {
        list.commands.clear();
        list.closed = false;
        Ok(())
    }

    fn close_command_list(&self, list: &mut Self::CommandList) -> GfxResult<()> {
        list.closed = true;
        Ok(())
    }

    fn cmd_copy_resource(
        &self,
        list: &mut Self::CommandList,
        dst: &Self::Resource,
        src: &Self::Resource,
    ) -> GfxResult<()> {
        // 纹理与 buffer 的存储都是紧密排列的 mip，按两者较小的大小拷贝
        let size = dst.block.len().min(src.block.len());
        self.record(
            list,
            Command::Copy {
                dst: dst.block.clone(),
                dst_offset: 0,
                src: src.block.clone(),
                src_offset: 0,
                size,
            },
        )
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
        self.record(
            list,
            Command::Copy {
                dst: dst.block.clone(),
                dst_offset: dst_offset as usize,
                src: src.block.clone(),
                src_offset: src_offset as usize,
                size: size as usize,
            },
        )
    }

    fn cmd_resource_barrier(
        &self,
        list: &mut Self::CommandList,
        barriers: &[(&Self::Resource, ResourceTransition)],
    ) -> GfxResult<()> {
        // 执行线程严格串行，barrier 只做记录
        for (resource, transition) in barriers {
            log::trace!(
                "[{}] barrier `{}`: {:?} -> {:?}",
                list.name,
                resource.name,
                transition.before,
                transition.after
            );
        }
        Ok(())
    }

    fn cmd_dispatch(
        &self,
        list: &mut Self::CommandList,
        pipeline: &Self::Pipeline,
        heap: &Self::DescriptorHeap,
        group_count: [u32; 3],
    ) -> GfxResult<()> {
        if list.kind != QueueKind::Compute {
            return Err(GfxError::InvalidArgument(format!("dispatch recorded into copy list `{}`", list.name)));
        }
        self.record(
            list,
            Command::Dispatch {
                name: pipeline.name.clone(),
                kernel: pipeline.kernel.clone(),
                slots: heap.slots.clone(),
                group_count,
            },
        )
    }

    fn cmd_write_timestamp(&self, list: &mut Self::CommandList, heap: &Self::QueryHeap, index: u32) -> GfxResult<()> {
        if index as usize >= lock(&heap.slots).len() {
            return Err(GfxError::InvalidArgument(format!("timestamp index {index} out of query heap")));
        }
        self.record(
            list,
            Command::Timestamp {
                slots: heap.slots.clone(),
                index: index as usize,
            },
        )
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
        let (first, count) = (first as usize, count as usize);
        if first + count > lock(&heap.slots).len() {
            return Err(GfxError::InvalidArgument(format!("timestamp range [{first}, {first}+{count}) out of query heap")));
        }
        self.record(
            list,
            Command::ResolveTimestamps {
                slots: heap.slots.clone(),
                first,
                count,
                dst: dst.block.clone(),
                dst_offset: dst_offset as usize,
            },
        )
    }

    fn check_format_support(&self, _texture_type: TextureType, format: Format, unordered_access: bool) -> bool {
        if !format.is_typed() {
            return false;
        }
        // 与多数硬件一致：RGBA8 不支持 typed UAV load
        !(unordered_access && format == Format::R8G8B8A8Unorm)
    }

    fn create_committed_resource(
        &self,
        placement: HeapPlacement,
        desc: &ResourceDesc,
        initial_state: ResourceState,
        debug_name: &str,
    ) -> GfxResult<Self::Resource> {
        let (len, gpu_va) = match desc {
            ResourceDesc::Buffer { size, .. } => {
                let va = self.next_gpu_va.get();
                self.next_gpu_va.set(va + size);
                (*size, va)
            }
            // 纹理没有 GPU 虚拟地址
            ResourceDesc::Texture { desc, .. } => (desc.packed_byte_size()?, 0),
        };
        if len == 0 {
            return Err(GfxError::ZeroSize);
        }
        log::trace!("create resource `{}`: {} bytes {:?} {:?}", debug_name, len, placement, initial_state);

        Ok(EmulatedResource {
            block: Arc::new(HostBlock::new(len as usize)),
            placement,
            gpu_va,
            name: debug_name.to_string(),
            _live: self.live.token(),
        })
    }

    fn map(&self, resource: &Self::Resource) -> GfxResult<NonNull<u8>> {
        if !resource.placement.is_host_visible() {
            return Err(GfxError::NotHostVisible {
                name: resource.name.clone(),
            });
        }
        Ok(resource.block.as_ptr())
    }

    fn unmap(&self, resource: &Self::Resource) {
        log::trace!("unmap `{}`", resource.name);
    }

    fn resource_byte_size(&self, resource: &Self::Resource) -> u64 {
        resource.block.len() as u64
    }

    fn gpu_virtual_address(&self, resource: &Self::Resource) -> u64 {
        resource.gpu_va
    }

    fn create_descriptor_heap(&self, capacity: u32, debug_name: &str) -> GfxResult<Self::DescriptorHeap> {
        let heap_id = self.next_heap_id.get();
        self.next_heap_id.set(heap_id + 1);
        log::trace!("create descriptor heap `{}` #{} with {} slots", debug_name, heap_id, capacity);

        Ok(EmulatedDescriptorHeap {
            slots: Arc::new(Mutex::new(vec![None; capacity as usize])),
            base: (heap_id + 1) << 32,
            _live: self.live.token(),
        })
    }

    fn descriptor_increment_size(&self) -> u64 {
        DESCRIPTOR_INCREMENT_SIZE
    }

    fn descriptor_heap_start(&self, heap: &Self::DescriptorHeap) -> Descriptor {
        Descriptor {
            gpu_handle: heap.base,
            cpu_handle: heap.base,
        }
    }

    fn write_descriptor(
        &self,
        heap: &Self::DescriptorHeap,
        slot: u32,
        resource: &Self::Resource,
        view: &ViewDesc,
    ) -> GfxResult<()> {
        let bound = BoundView::new(resource.block.clone(), view)?;
        let mut slots = lock(&heap.slots);
        let entry = slots
            .get_mut(slot as usize)
            .ok_or_else(|| GfxError::InvalidArgument(format!("descriptor slot {slot} out of heap")))?;
        *entry = Some(bound);
        Ok(())
    }

    fn create_timestamp_query_heap(&self, count: u32, debug_name: &str) -> GfxResult<Self::QueryHeap> {
        log::trace!("create timestamp query heap `{}` with {} slots", debug_name, count);
        Ok(EmulatedQueryHeap {
            slots: Arc::new(Mutex::new(vec![0; count as usize])),
            _live: self.live.token(),
        })
    }

    fn live_object_count(&self) -> usize {
        self.live.get()
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::{
        commands::{command_list::CommandList, command_queue::CommandQueue, work_tracker::WorkCompletionTracker},
        descriptors::descriptor_table::DescriptorTable,
        resources::{memory::TypedMemoryAllocator, texture::TextureDesc},
    };

    #[test]
    fn test_dispatch_reads_descriptors() {
        let device = Rc::new(EmulatedDevice::new());
        let allocator = TypedMemoryAllocator::new(device.clone());
        let queue = CommandQueue::new_compute(device.clone(), true, "compute").unwrap();
        let mut tracker = WorkCompletionTracker::new(&queue, "tracker");

        let input: Vec<u32> = (0..64).collect();
        let mut src = allocator.allocate_upload(256, "src").unwrap();
        allocator.copy_to_gpu(&mut src, bytemuck::cast_slice(&input)).unwrap();
        let dst = allocator.allocate_buffer(256, true, "dst").unwrap();
        let readback = allocator.allocate_readback(256, "readback").unwrap();

        let mut table = DescriptorTable::new(device.clone(), 2, "table").unwrap();
        table.create_typed_buffer_view(&src, Format::R32Uint, 64, false).unwrap();
        table.create_typed_buffer_view(&dst, Format::R32Uint, 64, true).unwrap();

        // 每个 group 处理 16 个元素
        let pipeline = device.create_compute_pipeline("double", |ctx| {
            let (input, output) = (ctx.view(0)?, ctx.view(1)?);
            for i in 0..16 {
                let index = ctx.group_id[0] as usize * 16 + i;
                output.store(index, input.load::<u32>(index)? * 2)?;
            }
            Ok(())
        });

        let mut list = CommandList::new_compute(device.clone(), "compute").unwrap();
        list.dispatch(&pipeline, &table, [4, 1, 1]).unwrap();
        list.copy_resource(&readback, &dst).unwrap();
        queue.execute_and_wait(&mut list, &mut tracker).unwrap();

        let mut output = vec![0u32; 64];
        allocator.copy_from_gpu(bytemuck::cast_slice_mut(&mut output), &readback).unwrap();
        assert_eq!(output, input.iter().map(|v| v * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_kernel_error_loses_device() {
        let device = Rc::new(EmulatedDevice::new());
        let queue = CommandQueue::new_compute(device.clone(), true, "compute").unwrap();
        let mut tracker = WorkCompletionTracker::new(&queue, "tracker");
        let table = DescriptorTable::new(device.clone(), 1, "table").unwrap();

        // 槽位 0 没有写入，kernel 访问时失败
        let pipeline = device.create_compute_pipeline("broken", |ctx| ctx.view(0).map(|_| ()));
        let mut list = CommandList::new_compute(device.clone(), "compute").unwrap();
        list.dispatch(&pipeline, &table, [1, 1, 1]).unwrap();
        queue.execute(&mut list).unwrap();

        let id = tracker.signal_work().unwrap();
        assert!(matches!(tracker.wait(id), Err(GfxError::Device(_))));
        assert!(device.is_lost());
        assert!(device.lost_reason().is_some_and(|r| r.contains("broken")));
    }

    #[test]
    fn test_texture_round_trip() {
        let device = Rc::new(EmulatedDevice::new());
        let allocator = TypedMemoryAllocator::new(device.clone());
        let queue = CommandQueue::new_copy(device.clone(), true, "copy").unwrap();
        let mut tracker = WorkCompletionTracker::new(&queue, "tracker");

        let desc = TextureDesc::new_2d(8, 8, Format::R32Float).mips(0).with_resolved_mips();
        let texture = allocator.allocate_texture(&desc, false, "texture").unwrap();
        let readback = allocator.allocate_readback_texture(&desc, "readback").unwrap();

        let texels: Vec<f32> = (0..desc.packed_byte_size().unwrap() / 4).map(|v| v as f32).collect();
        let mut list = CommandList::new_copy(device, "copy").unwrap();
        let staging = allocator.enqueue_upload(&mut list, &texture, bytemuck::cast_slice(&texels)).unwrap();
        list.copy_resource(&readback, &texture).unwrap();
        let id = queue.execute_and_wait(&mut list, &mut tracker).unwrap();
        tracker.retain_until_complete(id, staging).unwrap();

        let mut out = vec![0f32; texels.len()];
        allocator.copy_from_gpu(bytemuck::cast_slice_mut(&mut out), &readback).unwrap();
        assert_eq!(out, texels);
    }

    #[test]
    fn test_execute_requires_closed_list() {
        let device = EmulatedDevice::new();
        let queue = device.create_queue(QueueKind::Copy, true, "copy").unwrap();
        let mut list = device.create_command_list(QueueKind::Copy, "copy").unwrap();
        assert!(device.queue_execute(&queue, &list).is_err());
        device.close_command_list(&mut list).unwrap();
        assert!(device.queue_execute(&queue, &list).is_ok());
    }

    #[test]
    fn test_live_objects() {
        let device = EmulatedDevice::new();
        let fence = device.create_fence(0, "fence").unwrap();
        let heap = device.create_descriptor_heap(4, "heap").unwrap();
        assert_eq!(device.live_object_count(), 2);
        assert_eq!(device.descriptor_heap_start(&heap).gpu_handle, 1 << 32);
        drop((fence, heap));
        assert_eq!(device.live_object_count(), 0);
    }
}
