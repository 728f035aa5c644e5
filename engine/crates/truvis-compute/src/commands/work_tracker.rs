use std::time::Duration;

use crate::{
    commands::command_queue::CommandQueue,
    error::{GfxError, GfxResult},
    foundation::gpu_device::{GpuDevice, WaitStatus},
    resources::allocation::GpuMemAllocation,
};

/// 一次提交的标识，由 [`WorkCompletionTracker::signal_work`] 产生
///
/// 同一个 tracker 产生的 id 从 0 开始严格递增，只在该 tracker 内有效。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkId(u64);

impl WorkId {
    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }

    /// fence 的目标值
    ///
    /// 新创建的 fence 初始值为 0，因此目标值为 id + 1，signal 与 wait 使用同一个值
    #[inline]
    pub(crate) fn fence_value(self) -> u64 {
        self.0 + 1
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    TimedOut,
}

/// 每个 WorkId 独占一对 fence + event
struct WorkWaiter<D: GpuDevice> {
    fence: D::Fence,
    event: D::Event,
    completed: bool,
}

/// 绑定到一个队列的提交完成追踪器
///
/// 每次 [`signal_work`](Self::signal_work) 都会创建新的 fence + event，不做复用。
/// 状态只有 Submitted -> Completed 两种，不支持取消。
///
/// 不是线程安全的：并发调用 `signal_work` 需要外部串行化。
pub struct WorkCompletionTracker<D: GpuDevice> {
    queue: CommandQueue<D>,
    waiters: Vec<WorkWaiter<D>>,
    /// 等待对应 WorkId 完成之后才能释放的 staging 内存
    retained: Vec<(WorkId, GpuMemAllocation<D>)>,
    debug_name: String,
}

// 创建
impl<D: GpuDevice> WorkCompletionTracker<D> {
    pub fn new(queue: &CommandQueue<D>, debug_name: &str) -> Self {
        Self {
            queue: queue.clone(),
            waiters: Vec::new(),
            retained: Vec::new(),
            debug_name: debug_name.to_string(),
        }
    }
}

// getters
impl<D: GpuDevice> WorkCompletionTracker<D> {
    #[inline]
    pub fn queue(&self) -> &CommandQueue<D> {
        &self.queue
    }

    #[inline]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// 已经产生的 WorkId 数量
    #[inline]
    pub fn issued(&self) -> u64 {
        self.waiters.len() as u64
    }

    #[inline]
    pub fn last_work_id(&self) -> Option<WorkId> {
        self.waiters.len().checked_sub(1).map(|i| WorkId(i as u64))
    }

    /// 仍在等待 GPU 完成的 staging 内存数量
    #[inline]
    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }
}

// tools
impl<D: GpuDevice> WorkCompletionTracker<D> {
    /// 在队列中已提交的命令之后插入 signal，并返回对应的 WorkId
    ///
    /// 该调用之后再提交的命令不被返回的 WorkId 覆盖
    pub fn signal_work(&mut self) -> GfxResult<WorkId> {
        let id = WorkId(self.waiters.len() as u64);
        let device = self.queue.device();

        let fence = device.create_fence(0, &format!("{}-fence{}", self.debug_name, id.value()))?;
        let event = device.create_event(&format!("{}-event{}", self.debug_name, id.value()))?;
        device.queue_signal(self.queue.handle(), &fence, id.fence_value())?;

        self.waiters.push(WorkWaiter {
            fence,
            event,
            completed: false,
        });
        log::debug!("[{}] signal work {} on queue `{}`", self.debug_name, id, self.queue.debug_name());
        Ok(id)
    }

    /// 阻塞直到 `id` 完成；对已完成的 id 重复调用会立即返回
    pub fn wait(&mut self, id: WorkId) -> GfxResult<()> {
        match self.wait_timeout(id, None)? {
            WaitOutcome::Completed => Ok(()),
            WaitOutcome::TimedOut => Err(GfxError::WaitFailed(format!("unbounded wait on work {id} timed out"))),
        }
    }

    /// `timeout == None` 时无限等待
    pub fn wait_timeout(&mut self, id: WorkId, timeout: Option<Duration>) -> GfxResult<WaitOutcome> {
        let issued = self.issued();
        let device = self.queue.device().clone();
        let waiter = self
            .waiters
            .get(id.value() as usize)
            .ok_or(GfxError::UnknownWorkId { id: id.value(), issued })?;

        if !waiter.completed {
            if device.fence_completed_value(&waiter.fence)? < id.fence_value() {
                device.set_event_on_completion(&waiter.fence, id.fence_value(), &waiter.event)?;
                if device.wait_event(&waiter.event, timeout)? == WaitStatus::TimedOut {
                    log::warn!("[{}] wait on work {} timed out after {:?}", self.debug_name, id, timeout);
                    return Ok(WaitOutcome::TimedOut);
                }
            }
            log::debug!("[{}] work {} completed", self.debug_name, id);
        }

        self.mark_completed(id);
        Ok(WaitOutcome::Completed)
    }

    /// 不阻塞地查询 `id` 是否已经完成
    pub fn poll(&mut self, id: WorkId) -> GfxResult<bool> {
        let issued = self.issued();
        let device = self.queue.device().clone();
        let waiter = self
            .waiters
            .get(id.value() as usize)
            .ok_or(GfxError::UnknownWorkId { id: id.value(), issued })?;

        let completed = waiter.completed || device.fence_completed_value(&waiter.fence)? >= id.fence_value();
        if completed {
            self.mark_completed(id);
        }
        Ok(completed)
    }

    /// 接管 staging 内存，直到 `id` 被确认完成（wait 或 poll）时才释放
    pub fn retain_until_complete(&mut self, id: WorkId, allocation: GpuMemAllocation<D>) -> GfxResult<()> {
        let waiter = self
            .waiters
            .get(id.value() as usize)
            .ok_or(GfxError::UnknownWorkId { id: id.value(), issued: self.issued() })?;
        if waiter.completed {
            drop(allocation);
        } else {
            self.retained.push((id, allocation));
        }
        Ok(())
    }

    /// 同一队列按提交顺序完成，`id` 完成意味着之前的所有 WorkId 也已完成
    fn mark_completed(&mut self, id: WorkId) {
        self.waiters[..=id.value() as usize].iter_mut().for_each(|w| w.completed = true);
        self.release_retained();
    }

    fn release_retained(&mut self) {
        let waiters = &self.waiters;
        let before = self.retained.len();
        self.retained.retain(|(id, _)| !waiters[id.value() as usize].completed);
        let released = before - self.retained.len();
        if released > 0 {
            log::debug!("[{}] released {} staging allocations", self.debug_name, released);
        }
    }
}

impl<D: GpuDevice> Drop for WorkCompletionTracker<D> {
    fn drop(&mut self) {
        // 队列中还有未完成的 signal 时不能销毁 fence，GPU 也可能还在读取 staging 内存
        let Some(last) = self.last_work_id() else {
            return;
        };
        if self.waiters[last.value() as usize].completed {
            return;
        }
        if !self.retained.is_empty() {
            log::warn!("[{}] dropped with {} pending staging allocations", self.debug_name, self.retained.len());
        }
        if let Err(e) = self.wait(last) {
            log::error!("[{}] failed to wait for pending work {}: {}", self.debug_name, last, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{rc::Rc, time::Duration};

    use super::*;
    use crate::{
        backends::emulated::EmulatedDevice, commands::command_list::CommandList,
        resources::memory::TypedMemoryAllocator,
    };

    fn setup(delay: Duration) -> (Rc<EmulatedDevice>, CommandQueue<EmulatedDevice>) {
        let device = Rc::new(EmulatedDevice::new().with_execution_delay(delay));
        let queue = CommandQueue::new_copy(device.clone(), true, "copy").unwrap();
        (device, queue)
    }

    #[test]
    fn test_monotonic_work_ids() {
        let (_device, queue) = setup(Duration::ZERO);
        let mut tracker = WorkCompletionTracker::new(&queue, "tracker");
        assert_eq!(tracker.last_work_id(), None);

        let ids = (0..16).map(|_| tracker.signal_work().unwrap().value()).collect::<Vec<_>>();
        assert_eq!(ids, (0..16).collect::<Vec<_>>());
        assert_eq!(tracker.issued(), 16);
        assert_eq!(tracker.last_work_id().map(WorkId::value), Some(15));
    }

    #[test]
    fn test_idempotent_wait() {
        let (_device, queue) = setup(Duration::ZERO);
        let mut tracker = WorkCompletionTracker::new(&queue, "tracker");
        let id = tracker.signal_work().unwrap();
        for _ in 0..3 {
            tracker.wait(id).unwrap();
        }
        assert!(tracker.poll(id).unwrap());
    }

    #[test]
    fn test_unknown_work_id() {
        let (_device, queue) = setup(Duration::ZERO);
        let mut tracker = WorkCompletionTracker::new(&queue, "tracker");
        tracker.signal_work().unwrap();

        // 其他 tracker 产生的 id 超出范围
        let mut other = WorkCompletionTracker::new(&queue, "other");
        let foreign = (0..3).map(|_| other.signal_work().unwrap()).last().unwrap();
        match tracker.wait(foreign) {
            Err(GfxError::UnknownWorkId { id, issued }) => assert_eq!((id, issued), (2, 1)),
            res => panic!("unexpected: {res:?}"),
        }
        assert!(tracker.poll(foreign).is_err());
    }

    #[test]
    fn test_timeout_and_poll() {
        let (_device, queue) = setup(Duration::from_millis(300));
        let mut tracker = WorkCompletionTracker::new(&queue, "tracker");
        let id = tracker.signal_work().unwrap();

        assert!(!tracker.poll(id).unwrap());
        assert_eq!(tracker.wait_timeout(id, Some(Duration::from_millis(1))).unwrap(), WaitOutcome::TimedOut);
        assert_eq!(tracker.wait_timeout(id, None).unwrap(), WaitOutcome::Completed);
        assert!(tracker.poll(id).unwrap());
    }

    #[test]
    fn test_wait_covers_earlier_work() {
        let (device, queue) = setup(Duration::from_millis(5));
        let allocator = TypedMemoryAllocator::new(device.clone());
        let src = allocator.allocate_buffer(256, false, "src").unwrap();
        let readback = allocator.allocate_readback(256, "readback").unwrap();

        let mut list = CommandList::new_copy(device, "copy").unwrap();
        let staging = allocator.enqueue_upload(&mut list, &src, &[9u8; 256]).unwrap();
        list.copy_resource(&readback, &src).unwrap();
        queue.execute(&mut list).unwrap();

        let mut tracker = WorkCompletionTracker::new(&queue, "tracker");
        let first = tracker.signal_work().unwrap();
        let second = tracker.signal_work().unwrap();
        tracker.retain_until_complete(first, staging).unwrap();
        assert_eq!(tracker.retained_count(), 1);

        // 等待更晚的 id 也意味着更早的工作已经完成
        tracker.wait(second).unwrap();
        assert_eq!(tracker.retained_count(), 0);
        assert!(tracker.poll(first).unwrap());

        let mut out = [0u8; 256];
        allocator.copy_from_gpu(&mut out, &readback).unwrap();
        assert_eq!(out, [9u8; 256]);
    }

    #[test]
    fn test_retain_after_completion_releases_immediately() {
        let (device, queue) = setup(Duration::ZERO);
        let allocator = TypedMemoryAllocator::new(device);
        let mut tracker = WorkCompletionTracker::new(&queue, "tracker");
        let id = tracker.signal_work().unwrap();
        tracker.wait(id).unwrap();

        tracker.retain_until_complete(id, allocator.allocate_upload(16, "staging").unwrap()).unwrap();
        assert_eq!(tracker.retained_count(), 0);
    }

    #[test]
    fn test_drop_waits_for_retained() {
        let (device, queue) = setup(Duration::from_millis(20));
        let allocator = TypedMemoryAllocator::new(device.clone());
        let live_before = device.live_object_count();
        {
            let mut tracker = WorkCompletionTracker::new(&queue, "tracker");
            let id = tracker.signal_work().unwrap();
            tracker.retain_until_complete(id, allocator.allocate_upload(16, "staging").unwrap()).unwrap();
        }
        assert_eq!(device.live_object_count(), live_before);
    }
}
