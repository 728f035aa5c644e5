use std::rc::Rc;

use crate::{
    error::{GfxError, GfxResult},
    foundation::gpu_device::GpuDevice,
    resources::{allocation::GpuMemAllocation, memory::TypedMemoryAllocator},
};

/// 时间戳查询池
pub struct TimestampQueryHeap<D: GpuDevice> {
    heap: D::QueryHeap,
    count: u32,
}

impl<D: GpuDevice> TimestampQueryHeap<D> {
    pub fn new(device: &Rc<D>, count: u32, debug_name: &str) -> GfxResult<Self> {
        if count == 0 {
            return Err(GfxError::InvalidArgument("timestamp query heap needs at least one slot".to_string()));
        }
        let heap = device.create_timestamp_query_heap(count, debug_name)?;
        Ok(Self { heap, count })
    }

    #[inline]
    pub fn handle(&self) -> &D::QueryHeap {
        &self.heap
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    pub(crate) fn check_range(&self, first: u32, count: u32) -> GfxResult<()> {
        if count == 0 || first.checked_add(count).is_none_or(|end| end > self.count) {
            return Err(GfxError::InvalidArgument(format!(
                "timestamp range [{first}, {first}+{count}) out of heap size {}",
                self.count
            )));
        }
        Ok(())
    }
}

/// 从 readback buffer 读取时间戳，并换算为秒；`count == 0` 时返回空列表
pub fn read_timestamps<D: GpuDevice>(
    allocator: &TypedMemoryAllocator<D>,
    readback: &GpuMemAllocation<D>,
    count: u32,
    frequency: u64,
) -> GfxResult<Vec<f64>> {
    if frequency == 0 {
        return Err(GfxError::InvalidArgument("timestamp frequency is zero".to_string()));
    }
    if count == 0 {
        return Ok(Vec::new());
    }

    let mut ticks = vec![0u64; count as usize];
    allocator.copy_from_gpu(bytemuck::cast_slice_mut(&mut ticks), readback)?;
    Ok(ticks.iter().map(|&t| t as f64 / frequency as f64).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backends::emulated::EmulatedDevice,
        commands::{command_list::CommandList, command_queue::CommandQueue, work_tracker::WorkCompletionTracker},
    };

    #[test]
    fn test_timestamps_are_ordered() {
        let device = Rc::new(EmulatedDevice::new());
        let allocator = TypedMemoryAllocator::new(device.clone());
        let queue = CommandQueue::new_compute(device.clone(), true, "compute").unwrap();
        let mut tracker = WorkCompletionTracker::new(&queue, "tracker");

        let heap = TimestampQueryHeap::new(&device, 2, "timestamps").unwrap();
        let readback = allocator.allocate_readback(2 * 8, "timestamp-readback").unwrap();

        let mut list = CommandList::new_compute(device, "compute").unwrap();
        list.write_timestamp(&heap, 0).unwrap();
        list.write_timestamp(&heap, 1).unwrap();
        list.resolve_timestamps(&heap, 2, &readback).unwrap();
        queue.execute_and_wait(&mut list, &mut tracker).unwrap();

        let seconds = read_timestamps(&allocator, &readback, 2, queue.timestamp_frequency().unwrap()).unwrap();
        assert_eq!(seconds.len(), 2);
        assert!(seconds[1] >= seconds[0]);

        assert!(read_timestamps(&allocator, &readback, 0, 1_000_000).unwrap().is_empty());
    }

    #[test]
    fn test_timestamp_range_checks() {
        let device = Rc::new(EmulatedDevice::new());
        assert!(TimestampQueryHeap::new(&device, 0, "empty").is_err());

        let heap = TimestampQueryHeap::new(&device, 2, "timestamps").unwrap();
        let mut list = CommandList::new_compute(device.clone(), "compute").unwrap();
        assert!(list.write_timestamp(&heap, 2).is_err());

        let allocator = TypedMemoryAllocator::new(device);
        let small = allocator.allocate_readback(8, "small").unwrap();
        // 256 字节的 readback 足够容纳 2 个时间戳，但 3 个超出了 heap
        assert!(list.resolve_timestamps(&heap, 3, &small).is_err());
        assert!(list.resolve_timestamps(&heap, 2, &small).is_ok());
    }
}
