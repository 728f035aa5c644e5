use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};

use crate::{
    backends::emulated::{
        kernel::{BoundView, DispatchContext, Kernel},
        memory::HostBlock,
    },
    error::{GfxError, GfxResult},
};

/// 执行线程 panic 之后锁仍然可用，数据本身只是计数与槽位
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// fence 的共享状态：只会向前推进的计数
#[derive(Default)]
pub(crate) struct FenceState {
    value: Mutex<u64>,
    cond: Condvar,
}

impl FenceState {
    pub fn new(initial_value: u64) -> Self {
        Self {
            value: Mutex::new(initial_value),
            cond: Condvar::new(),
        }
    }

    pub fn completed_value(&self) -> u64 {
        *lock(&self.value)
    }

    pub fn signal(&self, value: u64) {
        *lock(&self.value) = value;
        self.cond.notify_all();
    }

    /// 返回是否在超时前到达 `target`
    pub fn wait_for(&self, target: u64, timeout: Option<Duration>) -> bool {
        let guard = lock(&self.value);
        match timeout {
            None => {
                let _guard = self.cond.wait_while(guard, |v| *v < target).unwrap_or_else(PoisonError::into_inner);
                true
            }
            Some(timeout) => {
                let (_guard, result) = self
                    .cond
                    .wait_timeout_while(guard, timeout, |v| *v < target)
                    .unwrap_or_else(PoisonError::into_inner);
                !result.timed_out()
            }
        }
    }
}

/// 设备丢失的原因；一旦设置，之后的等待都会失败
pub(crate) type LostState = Arc<Mutex<Option<String>>>;

/// 录制在 command list 中的命令
#[derive(Clone)]
pub(crate) enum Command {
    Copy {
        dst: Arc<HostBlock>,
        dst_offset: usize,
        src: Arc<HostBlock>,
        src_offset: usize,
        size: usize,
    },
    Dispatch {
        name: String,
        kernel: Kernel,
        slots: Arc<Mutex<Vec<Option<BoundView>>>>,
        group_count: [u32; 3],
    },
    Timestamp {
        slots: Arc<Mutex<Vec<u64>>>,
        index: usize,
    },
    ResolveTimestamps {
        slots: Arc<Mutex<Vec<u64>>>,
        first: usize,
        count: usize,
        dst: Arc<HostBlock>,
        dst_offset: usize,
    },
}

impl Command {
    fn execute(&self, epoch: Instant) -> GfxResult<()> {
        match self {
            Command::Copy {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => dst.copy_from(*dst_offset, src, *src_offset, *size),
            Command::Dispatch {
                name,
                kernel,
                slots,
                group_count,
            } => {
                // 执行时读取描述符，与 GPU 的行为一致
                let views = lock(slots).clone();
                let [gx, gy, gz] = *group_count;
                for z in 0..gz {
                    for y in 0..gy {
                        for x in 0..gx {
                            let ctx = DispatchContext {
                                group_id: [x, y, z],
                                group_count: *group_count,
                                views: &views,
                            };
                            kernel(&ctx).map_err(|e| GfxError::Device(format!("kernel `{name}` failed: {e}")))?;
                        }
                    }
                }
                Ok(())
            }
            Command::Timestamp { slots, index } => {
                lock(slots)[*index] = epoch.elapsed().as_nanos() as u64;
                Ok(())
            }
            Command::ResolveTimestamps {
                slots,
                first,
                count,
                dst,
                dst_offset,
            } => {
                let ticks = lock(slots)[*first..*first + *count].to_vec();
                dst.write(*dst_offset, bytemuck::cast_slice(&ticks))
            }
        }
    }
}

enum QueueOp {
    Execute(Vec<Command>),
    Signal { fence: Arc<FenceState>, value: u64 },
}

/// 队列的执行线程：按提交顺序执行命令与 signal
pub(crate) struct QueueTimeline {
    sender: Option<Sender<QueueOp>>,
    worker: Option<JoinHandle<()>>,
}

impl QueueTimeline {
    pub fn spawn(name: &str, epoch: Instant, delay: Duration, lost: LostState) -> GfxResult<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let thread_name = format!("emulated-queue-{name}");
        let worker = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || Self::run(receiver, epoch, delay, lost))
            .map_err(|e| GfxError::Device(format!("failed to spawn queue thread: {e}")))?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    fn run(receiver: Receiver<QueueOp>, epoch: Instant, delay: Duration, lost: LostState) {
        for op in receiver {
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            match op {
                QueueOp::Execute(commands) => {
                    if lock(&lost).is_some() {
                        continue;
                    }
                    if let Err(e) = commands.iter().try_for_each(|c| c.execute(epoch)) {
                        log::error!("device lost: {}", e);
                        *lock(&lost) = Some(e.to_string());
                    }
                }
                // 设备丢失之后仍然推进 fence，等待方通过 lost 状态得知失败
                QueueOp::Signal { fence, value } => fence.signal(value),
            }
        }
    }

    fn send(&self, op: QueueOp) -> GfxResult<()> {
        self.sender
            .as_ref()
            .ok_or_else(|| GfxError::Device("queue timeline already shut down".to_string()))?
            .send(op)
            .map_err(|_| GfxError::Device("queue thread exited".to_string()))
    }

    pub fn execute(&self, commands: Vec<Command>) -> GfxResult<()> {
        self.send(QueueOp::Execute(commands))
    }

    pub fn signal(&self, fence: Arc<FenceState>, value: u64) -> GfxResult<()> {
        self.send(QueueOp::Signal { fence, value })
    }
}

impl Drop for QueueTimeline {
    fn drop(&mut self) {
        // 关闭 channel 之后执行线程处理完剩余的命令再退出
        drop(self.sender.take());
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            log::error!("emulated queue thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fence_wait() {
        let fence = Arc::new(FenceState::new(0));
        assert!(!fence.wait_for(1, Some(Duration::from_millis(1))));
        assert!(fence.wait_for(0, None));

        let signaler = fence.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            signaler.signal(3);
        });
        assert!(fence.wait_for(2, None));
        assert_eq!(fence.completed_value(), 3);
        handle.join().unwrap();
    }

    #[test]
    fn test_timeline_orders_ops() {
        let lost = LostState::default();
        let timeline = QueueTimeline::spawn("test", Instant::now(), Duration::ZERO, lost.clone()).unwrap();
        let src = Arc::new(HostBlock::new(4));
        src.write(0, &[1, 2, 3, 4]).unwrap();
        let dst = Arc::new(HostBlock::new(4));
        let fence = Arc::new(FenceState::new(0));

        timeline
            .execute(vec![Command::Copy {
                dst: dst.clone(),
                dst_offset: 0,
                src,
                src_offset: 0,
                size: 4,
            }])
            .unwrap();
        timeline.signal(fence.clone(), 1).unwrap();
        assert!(fence.wait_for(1, None));

        let mut out = [0u8; 4];
        dst.read(0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(lock(&lost).is_none());
    }
}
