use std::rc::Rc;

use crate::{
    commands::{
        command_list::CommandList,
        work_tracker::{WorkCompletionTracker, WorkId},
    },
    error::{GfxError, GfxResult},
    foundation::gpu_device::{GpuDevice, QueueKind},
};

/// 异步执行命令的队列
///
/// clone 之后指向同一个底层队列，同一队列上的命令按提交顺序执行。
pub struct CommandQueue<D: GpuDevice> {
    device: Rc<D>,
    queue: Rc<D::Queue>,
    kind: QueueKind,
    debug_name: String,
}

impl<D: GpuDevice> Clone for CommandQueue<D> {
    fn clone(&self) -> Self {
        Self {
            device: self.device.clone(),
            queue: self.queue.clone(),
            kind: self.kind,
            debug_name: self.debug_name.clone(),
        }
    }
}

// 创建
impl<D: GpuDevice> CommandQueue<D> {
    pub fn new(device: Rc<D>, kind: QueueKind, disable_timeout: bool, debug_name: &str) -> GfxResult<Self> {
        let queue = device.create_queue(kind, disable_timeout, debug_name)?;
        log::info!(
            "created {:?} queue `{}` on {} backend (gpu timeout disabled: {})",
            kind,
            debug_name,
            device.backend_name(),
            disable_timeout
        );
        Ok(Self {
            device,
            queue: Rc::new(queue),
            kind,
            debug_name: debug_name.to_string(),
        })
    }

    #[inline]
    pub fn new_compute(device: Rc<D>, disable_timeout: bool, debug_name: &str) -> GfxResult<Self> {
        Self::new(device, QueueKind::Compute, disable_timeout, debug_name)
    }

    #[inline]
    pub fn new_copy(device: Rc<D>, disable_timeout: bool, debug_name: &str) -> GfxResult<Self> {
        Self::new(device, QueueKind::Copy, disable_timeout, debug_name)
    }
}

// getters
impl<D: GpuDevice> CommandQueue<D> {
    #[inline]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    #[inline]
    pub fn handle(&self) -> &D::Queue {
        &self.queue
    }

    #[inline]
    pub fn device(&self) -> &Rc<D> {
        &self.device
    }

    #[inline]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// 两个句柄是否指向同一个底层队列
    #[inline]
    pub fn same_queue(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.queue, &other.queue)
    }

    /// 时间戳的频率（tick / 秒）
    #[inline]
    pub fn timestamp_frequency(&self) -> GfxResult<u64> {
        self.device.queue_timestamp_frequency(&self.queue)
    }
}

// tools
impl<D: GpuDevice> CommandQueue<D> {
    /// close 并提交 command list，不等待完成
    pub fn execute(&self, list: &mut CommandList<D>) -> GfxResult<()> {
        if list.kind() != self.kind {
            return Err(GfxError::InvalidArgument(format!(
                "{:?} command list `{}` cannot be executed on {:?} queue `{}`",
                list.kind(),
                list.debug_name(),
                self.kind,
                self.debug_name
            )));
        }
        list.close()?;
        self.device.queue_execute(&self.queue, list.handle())?;
        log::debug!("queue `{}` executed `{}`", self.debug_name, list.debug_name());
        Ok(())
    }

    /// 提交、signal，并阻塞直到完成
    pub fn execute_and_wait(
        &self,
        list: &mut CommandList<D>,
        tracker: &mut WorkCompletionTracker<D>,
    ) -> GfxResult<WorkId> {
        if !self.same_queue(tracker.queue()) {
            return Err(GfxError::InvalidArgument(format!(
                "tracker `{}` is bound to queue `{}`, not `{}`",
                tracker.debug_name(),
                tracker.queue().debug_name(),
                self.debug_name
            )));
        }
        self.execute(list)?;
        let id = tracker.signal_work()?;
        tracker.wait(id)?;
        Ok(id)
    }

    #[inline]
    pub fn begin_label(&self, label: &str) {
        self.device.queue_begin_label(&self.queue, label);
    }

    #[inline]
    pub fn end_label(&self) {
        self.device.queue_end_label(&self.queue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::emulated::EmulatedDevice;

    #[test]
    fn test_queue_kind_must_match() {
        let device = Rc::new(EmulatedDevice::new());
        let queue = CommandQueue::new_copy(device.clone(), true, "copy").unwrap();
        let mut compute_list = CommandList::new_compute(device.clone(), "compute").unwrap();
        assert!(queue.execute(&mut compute_list).is_err());
        // 提交失败时 list 保持录制状态
        assert!(!compute_list.is_closed());

        let mut copy_list = CommandList::new_copy(device, "copy").unwrap();
        queue.execute(&mut copy_list).unwrap();
        assert!(copy_list.is_closed());
    }

    #[test]
    fn test_execute_and_wait_checks_tracker_queue() {
        let device = Rc::new(EmulatedDevice::new());
        let compute = CommandQueue::new_compute(device.clone(), true, "compute").unwrap();
        let other = CommandQueue::new_compute(device.clone(), true, "other").unwrap();
        assert!(compute.same_queue(&compute.clone()));
        assert!(!compute.same_queue(&other));

        let mut tracker = WorkCompletionTracker::new(&other, "other-tracker");
        let mut list = CommandList::new_compute(device, "compute").unwrap();
        assert!(compute.execute_and_wait(&mut list, &mut tracker).is_err());

        let mut tracker = WorkCompletionTracker::new(&compute, "compute-tracker");
        assert_eq!(compute.execute_and_wait(&mut list, &mut tracker).unwrap().value(), 0);
    }

    #[test]
    fn test_timestamp_frequency() {
        let device = Rc::new(EmulatedDevice::new());
        let queue = CommandQueue::new_compute(device, true, "compute").unwrap();
        assert_eq!(queue.timestamp_frequency().unwrap(), 1_000_000_000);
    }
}
