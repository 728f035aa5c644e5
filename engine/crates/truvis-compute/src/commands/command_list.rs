use std::rc::Rc;

use itertools::Itertools;

use crate::{
    commands::timestamp::TimestampQueryHeap,
    descriptors::descriptor_table::DescriptorTable,
    error::{GfxError, GfxResult},
    foundation::gpu_device::{GpuDevice, QueueKind},
    resources::{
        allocation::{AllocationShape, GpuMemAllocation, MemoryKind},
        state::{ResourceState, ResourceTransition},
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ListState {
    Recording,
    Closed,
}

/// 一串 GPU 命令
///
/// 创建之后即处于录制状态；提交前由 [`crate::commands::command_queue::CommandQueue::execute`] close，
/// 再次录制前需要调用 [`CommandList::reset`]。
///
/// 命令中引用的资源需要调用方保证存活到命令执行完成。
pub struct CommandList<D: GpuDevice> {
    device: Rc<D>,
    list: D::CommandList,
    kind: QueueKind,
    state: ListState,
    debug_name: String,
}

// 创建
impl<D: GpuDevice> CommandList<D> {
    pub fn new(device: Rc<D>, kind: QueueKind, debug_name: &str) -> GfxResult<Self> {
        let list = device.create_command_list(kind, debug_name)?;
        log::debug!("created {:?} command list `{}`", kind, debug_name);
        Ok(Self {
            device,
            list,
            kind,
            state: ListState::Recording,
            debug_name: debug_name.to_string(),
        })
    }

    #[inline]
    pub fn new_compute(device: Rc<D>, debug_name: &str) -> GfxResult<Self> {
        Self::new(device, QueueKind::Compute, debug_name)
    }

    #[inline]
    pub fn new_copy(device: Rc<D>, debug_name: &str) -> GfxResult<Self> {
        Self::new(device, QueueKind::Copy, debug_name)
    }
}

// getters
impl<D: GpuDevice> CommandList<D> {
    #[inline]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    #[inline]
    pub fn handle(&self) -> &D::CommandList {
        &self.list
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state == ListState::Closed
    }

    #[inline]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }
}

// 生命周期
impl<D: GpuDevice> CommandList<D> {
    /// 丢弃已录制的命令，重新进入录制状态
    ///
    /// 调用方需要保证之前提交的命令已经执行完成
    pub fn reset(&mut self) -> GfxResult<()> {
        self.device.reset_command_list(&mut self.list)?;
        self.state = ListState::Recording;
        Ok(())
    }

    /// 重复 close 不做任何事
    pub fn close(&mut self) -> GfxResult<()> {
        if self.state == ListState::Recording {
            self.device.close_command_list(&mut self.list)?;
            self.state = ListState::Closed;
        }
        Ok(())
    }

    fn ensure_recording(&self) -> GfxResult<()> {
        if self.state == ListState::Closed {
            return Err(GfxError::InvalidArgument(format!(
                "command list `{}` is closed, reset it before recording",
                self.debug_name
            )));
        }
        Ok(())
    }

    fn ensure_compute(&self, op: &str) -> GfxResult<()> {
        if self.kind != QueueKind::Compute {
            return Err(GfxError::InvalidArgument(format!(
                "`{op}` requires a compute command list, `{}` is {:?}",
                self.debug_name, self.kind
            )));
        }
        Ok(())
    }
}

// 拷贝
impl<D: GpuDevice> CommandList<D> {
    /// 整个资源的拷贝
    ///
    /// buffer 之间要求大小一致；buffer 与纹理之间按紧密排列的 mip 顺序拷贝
    pub fn copy_resource(&mut self, dst: &GpuMemAllocation<D>, src: &GpuMemAllocation<D>) -> GfxResult<()> {
        self.ensure_recording()?;
        Self::check_copy_endpoints(dst, src)?;

        match (dst.shape(), src.shape()) {
            (AllocationShape::Texture(dst_desc), AllocationShape::Texture(src_desc)) if dst_desc != src_desc => {
                return Err(GfxError::InvalidArgument(format!(
                    "copy between textures with different shapes: `{}` <- `{}`",
                    dst.debug_name(),
                    src.debug_name()
                )));
            }
            (AllocationShape::Texture(desc), _) => {
                if src.byte_size() < desc.packed_byte_size()? {
                    return Err(Self::size_mismatch(dst, src));
                }
            }
            (_, AllocationShape::Texture(desc)) => {
                if dst.byte_size() < desc.packed_byte_size()? {
                    return Err(Self::size_mismatch(dst, src));
                }
            }
            (dst_shape, src_shape)
                if dst_shape.is_linear() && src_shape.is_linear() && dst.byte_size() != src.byte_size() =>
            {
                return Err(Self::size_mismatch(dst, src));
            }
            _ => {}
        }

        self.device.cmd_copy_resource(&mut self.list, dst.resource(), src.resource())
    }

    /// buffer 之间的拷贝，大小取两者较小值
    pub fn copy_buffer(&mut self, dst: &GpuMemAllocation<D>, src: &GpuMemAllocation<D>) -> GfxResult<()> {
        self.ensure_recording()?;
        Self::check_copy_endpoints(dst, src)?;
        if !dst.shape().is_linear() || !src.shape().is_linear() {
            return Err(GfxError::InvalidArgument("copy_buffer requires buffer allocations".to_string()));
        }

        let size = dst.byte_size().min(src.byte_size());
        self.device.cmd_copy_buffer_region(&mut self.list, dst.resource(), 0, src.resource(), 0, size)
    }

    fn check_copy_endpoints(dst: &GpuMemAllocation<D>, src: &GpuMemAllocation<D>) -> GfxResult<()> {
        if dst.kind() == MemoryKind::Upload {
            return Err(GfxError::InvalidArgument(format!(
                "upload allocation `{}` is not writable by the GPU",
                dst.debug_name()
            )));
        }
        if src.kind() == MemoryKind::Readback {
            return Err(GfxError::InvalidArgument(format!(
                "readback allocation `{}` can only be a copy destination",
                src.debug_name()
            )));
        }
        Ok(())
    }

    fn size_mismatch(dst: &GpuMemAllocation<D>, src: &GpuMemAllocation<D>) -> GfxError {
        GfxError::InvalidArgument(format!(
            "copy size mismatch: `{}` ({} bytes) <- `{}` ({} bytes)",
            dst.debug_name(),
            dst.byte_size(),
            src.debug_name(),
            src.byte_size()
        ))
    }
}

// barrier
impl<D: GpuDevice> CommandList<D> {
    /// 一次调用提交所有的状态切换；前后状态相同的切换会被跳过
    pub fn resource_barrier(&mut self, transitions: &[(&GpuMemAllocation<D>, ResourceTransition)]) -> GfxResult<()> {
        self.ensure_recording()?;
        if self.kind == QueueKind::Copy {
            if let Some((alloc, _)) = transitions
                .iter()
                .find(|(_, t)| t.before.requires_compute_queue() || t.after.requires_compute_queue())
            {
                return Err(GfxError::InvalidArgument(format!(
                    "copy command list `{}` cannot transition `{}` outside of copy states",
                    self.debug_name,
                    alloc.debug_name()
                )));
            }
        }

        let barriers = transitions
            .iter()
            .filter(|(_, t)| !t.is_noop())
            .map(|(alloc, t)| (alloc.resource(), *t))
            .collect_vec();
        if barriers.is_empty() {
            return Ok(());
        }
        self.device.cmd_resource_barrier(&mut self.list, &barriers)
    }

    /// 将刚完成 copy 的资源从 COMMON 切换到各自的目标状态，合并为一次 barrier
    pub fn transition_from_common(&mut self, dsts: &[(&GpuMemAllocation<D>, ResourceState)]) -> GfxResult<()> {
        if dsts.is_empty() {
            return Err(GfxError::InvalidArgument("no resources to transition".to_string()));
        }
        self.ensure_compute("transition_from_common")?;

        let transitions =
            dsts.iter().map(|(alloc, after)| (*alloc, ResourceTransition::from_common(*after))).collect_vec();
        self.resource_barrier(&transitions)
    }
}

// compute
impl<D: GpuDevice> CommandList<D> {
    pub fn dispatch(
        &mut self,
        pipeline: &D::Pipeline,
        table: &DescriptorTable<D>,
        group_count: [u32; 3],
    ) -> GfxResult<()> {
        self.ensure_recording()?;
        self.ensure_compute("dispatch")?;
        if group_count.contains(&0) {
            return Err(GfxError::InvalidArgument(format!("dispatch with empty group count {group_count:?}")));
        }
        self.device.cmd_dispatch(&mut self.list, pipeline, table.heap(), group_count)
    }
}

// query
impl<D: GpuDevice> CommandList<D> {
    pub fn write_timestamp(&mut self, heap: &TimestampQueryHeap<D>, index: u32) -> GfxResult<()> {
        self.ensure_recording()?;
        heap.check_range(index, 1)?;
        self.device.cmd_write_timestamp(&mut self.list, heap.handle(), index)
    }

    /// 将前 `count` 个时间戳以 u64 写入 readback buffer
    pub fn resolve_timestamps(
        &mut self,
        heap: &TimestampQueryHeap<D>,
        count: u32,
        readback: &GpuMemAllocation<D>,
    ) -> GfxResult<()> {
        self.ensure_recording()?;
        heap.check_range(0, count)?;
        let required = count as u64 * size_of::<u64>() as u64;
        if readback.kind() != MemoryKind::Readback || readback.byte_size() < required {
            return Err(GfxError::InvalidArgument(format!(
                "`{}` must be a readback buffer of at least {} bytes",
                readback.debug_name(),
                required
            )));
        }
        self.device.cmd_resolve_timestamps(&mut self.list, heap.handle(), 0, count, readback.resource(), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backends::emulated::EmulatedDevice,
        resources::{
            memory::TypedMemoryAllocator,
            texture::{Format, TextureDesc},
        },
    };

    fn setup() -> (Rc<EmulatedDevice>, TypedMemoryAllocator<EmulatedDevice>) {
        let device = Rc::new(EmulatedDevice::new());
        (device.clone(), TypedMemoryAllocator::new(device))
    }

    #[test]
    fn test_closed_list_rejects_commands() {
        let (device, allocator) = setup();
        let mut list = CommandList::new_copy(device, "copy").unwrap();
        let a = allocator.allocate_buffer(64, false, "a").unwrap();
        let b = allocator.allocate_upload(64, "b").unwrap();

        list.close().unwrap();
        list.close().unwrap();
        assert!(list.is_closed());
        assert!(list.copy_resource(&a, &b).is_err());

        list.reset().unwrap();
        assert!(list.copy_resource(&a, &b).is_ok());
    }

    #[test]
    fn test_copy_direction_checks() {
        let (device, allocator) = setup();
        let mut list = CommandList::new_copy(device, "copy").unwrap();
        let upload = allocator.allocate_upload(64, "upload").unwrap();
        let readback = allocator.allocate_readback(64, "readback").unwrap();
        let buffer = allocator.allocate_buffer(64, false, "buffer").unwrap();

        // upload 内存不能作为目标，readback 内存不能作为源
        assert!(list.copy_resource(&upload, &buffer).is_err());
        assert!(list.copy_resource(&buffer, &readback).is_err());
        assert!(list.copy_resource(&readback, &buffer).is_ok());
    }

    #[test]
    fn test_copy_size_checks() {
        let (device, allocator) = setup();
        let mut list = CommandList::new_copy(device, "copy").unwrap();
        let small = allocator.allocate_upload(256, "small").unwrap();
        let large = allocator.allocate_buffer(1024, false, "large").unwrap();

        assert!(list.copy_resource(&large, &small).is_err());
        // copy_buffer 按较小的一方拷贝
        assert!(list.copy_buffer(&large, &small).is_ok());

        let texture = allocator.allocate_texture(&TextureDesc::new_2d(16, 16, Format::R32Float), false, "tex").unwrap();
        assert!(list.copy_resource(&texture, &small).is_err());
        let staging = allocator.allocate_upload(1024, "staging").unwrap();
        assert!(list.copy_resource(&texture, &staging).is_ok());
        assert!(list.copy_buffer(&texture, &staging).is_err());
    }

    #[test]
    fn test_copy_list_barrier_restrictions() {
        let (device, allocator) = setup();
        let buffer = allocator.allocate_buffer(64, false, "buffer").unwrap();

        let mut copy = CommandList::new_copy(device.clone(), "copy").unwrap();
        assert!(
            copy.resource_barrier(&[(&buffer, ResourceTransition::new(ResourceState::COMMON, ResourceState::COPY_DEST))])
                .is_ok()
        );
        assert!(
            copy.resource_barrier(&[(&buffer, ResourceTransition::from_common(ResourceState::UNORDERED_ACCESS))])
                .is_err()
        );
        assert!(copy.transition_from_common(&[(&buffer, ResourceState::COPY_SOURCE)]).is_err());

        let mut compute = CommandList::new_compute(device, "compute").unwrap();
        assert!(compute.transition_from_common(&[(&buffer, ResourceState::NON_PIXEL_SHADER_RESOURCE)]).is_ok());
        assert!(compute.transition_from_common(&[]).is_err());
    }
}
