use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use crate::{commands::command_queue::CommandQueue, foundation::gpu_device::GpuDevice};

/// 设备对象的存活计数
#[derive(Clone, Default)]
pub struct LiveCounter {
    count: Arc<AtomicUsize>,
}

impl LiveCounter {
    /// 创建一个对象时获取 token，token drop 时计数减一
    pub fn token(&self) -> LiveToken {
        self.count.fetch_add(1, Ordering::Relaxed);
        LiveToken {
            count: self.count.clone(),
        }
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

pub struct LiveToken {
    count: Arc<AtomicUsize>,
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }
}

/// 输出仍然存活的设备对象数量，返回该数量
pub fn report_live_objects<D: GpuDevice>(device: &D) -> usize {
    let live = device.live_object_count();
    if live == 0 {
        log::info!("[{}] no live device objects", device.backend_name());
    } else {
        log::warn!("[{}] {} device objects still alive", device.backend_name(), live);
    }
    live
}

/// capture 区间：在队列上插入 begin/end label，capture 工具以此划分一次 capture
///
/// 未开启时不做任何事
pub struct CaptureScope<'a, D: GpuDevice> {
    queue: Option<&'a CommandQueue<D>>,
}

impl<'a, D: GpuDevice> CaptureScope<'a, D> {
    pub fn begin(queue: &'a CommandQueue<D>, name: &str, enabled: bool) -> Self {
        if !enabled {
            return Self { queue: None };
        }
        log::info!("begin capture `{}` on queue `{}`", name, queue.debug_name());
        queue.begin_label(name);
        Self { queue: Some(queue) }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.queue.is_some()
    }

    pub fn end(self) {
        // 通过 drop 触发
    }
}

impl<D: GpuDevice> Drop for CaptureScope<'_, D> {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.end_label();
            log::info!("end capture on queue `{}`", queue.debug_name());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::{backends::emulated::EmulatedDevice, resources::memory::TypedMemoryAllocator};

    #[test]
    fn test_live_counter() {
        let counter = LiveCounter::default();
        let a = counter.token();
        let b = counter.token();
        assert_eq!(counter.get(), 2);
        drop(a);
        assert_eq!(counter.get(), 1);
        drop(b);
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_report_live_objects() {
        let device = Rc::new(EmulatedDevice::new());
        let allocator = TypedMemoryAllocator::new(device.clone());
        let buffer = allocator.allocate_buffer(16, false, "leak").unwrap();
        assert_eq!(report_live_objects(device.as_ref()), 1);
        drop(buffer);
        assert_eq!(report_live_objects(device.as_ref()), 0);
    }

    #[test]
    fn test_capture_scope_labels() {
        let device = Rc::new(EmulatedDevice::new());
        let queue = CommandQueue::new_compute(device.clone(), true, "compute").unwrap();
        {
            let scope = CaptureScope::begin(&queue, "frame", true);
            assert!(scope.is_active());
            assert_eq!(device.open_label_count(), 1);
        }
        assert_eq!(device.open_label_count(), 0);

        let scope = CaptureScope::begin(&queue, "frame", false);
        assert!(!scope.is_active());
        assert_eq!(device.open_label_count(), 0);
        scope.end();
    }
}
