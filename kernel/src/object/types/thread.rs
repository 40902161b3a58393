//! 线程对象
//!
//! 这里的线程只承载 IPC 需要的部分：调度状态和一个可重复使用的
//! 消息等待者（`channel_call` 阻塞时挂在通道上的那个对象）。

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::impl_kernel_object;
use crate::ipc::{MessagePacket, MessageWaiter};
use crate::object::traits::*;
use crate::object::types::channel::{CallError, Channel};
use crate::time::Deadline;

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// 线程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// 线程正在运行
    Running,
    /// 线程阻塞在 `channel_call` 中
    Blocked,
    /// 被挂起；未完成的 call 等待 `resume_channel_call`
    Suspended,
    /// 违反调用约定被终止
    Killed,
}

/// 线程对象
pub struct Thread {
    base: DispatcherBase,
    /// 线程ID
    tid: u64,
    /// 线程状态
    state: Mutex<ThreadState>,
    waiter: Arc<MessageWaiter>,
    /// 被挂起打断、尚未继续的 call 所在的通道
    suspended_call: Mutex<Option<Arc<Channel>>>,
}

impl Thread {
    /// 创建新线程
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            base: DispatcherBase::new(ObjectSignals::empty()),
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(ThreadState::Running),
            waiter: Arc::new(MessageWaiter::new()),
            suspended_call: Mutex::new(None),
        })
    }

    /// 获取线程ID
    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// 获取线程状态
    pub fn state(&self) -> ThreadState {
        *self.state.lock()
    }

    pub fn waiter(&self) -> &Arc<MessageWaiter> {
        &self.waiter
    }

    /// 在 `channel` 上发起 call
    pub fn channel_call(
        &self,
        channel: &Arc<Channel>,
        msg: MessagePacket,
        deadline: Deadline,
    ) -> Result<MessagePacket, CallError> {
        self.check_alive().map_err(CallError::Status)?;
        self.set_state(ThreadState::Blocked);
        let result = channel.call(&self.waiter, msg, deadline);
        self.after_call(channel, result.as_ref().err().map(CallError::status));
        result
    }

    /// 挂起后继续未完成的 call
    ///
    /// 没有在 `channel` 上被打断的 call 时返回 `BadState`，线程状态不变。
    pub fn resume_channel_call(
        &self,
        channel: &Arc<Channel>,
        deadline: Deadline,
    ) -> Result<MessagePacket, Status> {
        self.check_alive()?;
        if !self.waiter.is_armed_on(channel.koid()) {
            return Err(Status::BadState);
        }
        let suspended = {
            let mut state = self.state.lock();
            if *state == ThreadState::Killed {
                return Err(Status::BadState);
            }
            *state = ThreadState::Blocked;
            self.suspended_call.lock().take()
        };
        drop(suspended);
        let result = channel.resume_interrupted_call(&self.waiter, deadline);
        self.after_call(channel, result.as_ref().err().copied());
        result
    }

    fn after_call(&self, channel: &Arc<Channel>, error: Option<Status>) {
        let (abandon, stale) = {
            let mut state = self.state.lock();
            match (*state, error) {
                // 被终止：未完成的 call 不会再有人收取
                (ThreadState::Killed, Some(Status::InternalIntrRetry)) => {
                    (Some(channel.clone()), None)
                }
                (ThreadState::Killed, _) => (None, None),
                (_, Some(Status::BadState)) => {
                    log::warn!("thread {}: concurrent channel_call, killing thread", self.tid);
                    *state = ThreadState::Killed;
                    (self.suspended_call.lock().take(), None)
                }
                (_, Some(Status::InternalIntrRetry)) => {
                    *state = ThreadState::Suspended;
                    (None, self.suspended_call.lock().replace(channel.clone()))
                }
                _ => {
                    *state = ThreadState::Running;
                    (None, None)
                }
            }
        };
        drop(stale);
        if let Some(channel) = abandon {
            channel.abandon_call(&self.waiter);
        }
    }

    /// 挂起线程；正在等待回复的 call 返回 `InternalIntrRetry`
    pub fn suspend(&self) {
        let mut state = self.state.lock();
        match *state {
            ThreadState::Killed => {}
            ThreadState::Blocked => self.waiter.interrupt(),
            _ => *state = ThreadState::Suspended,
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        if *state == ThreadState::Suspended {
            *state = ThreadState::Running;
        }
    }

    /// 终止线程；被挂起的 call 立即放弃，正在阻塞的 call 由调用线程
    /// 醒来后放弃
    pub fn kill(&self) {
        let suspended = {
            let mut state = self.state.lock();
            *state = ThreadState::Killed;
            self.suspended_call.lock().take()
        };
        self.waiter.interrupt();
        if let Some(channel) = suspended {
            channel.abandon_call(&self.waiter);
        }
    }

    fn check_alive(&self) -> Result<(), Status> {
        match self.state() {
            ThreadState::Killed => Err(Status::BadState),
            _ => Ok(()),
        }
    }

    fn set_state(&self, state: ThreadState) {
        let mut current = self.state.lock();
        if *current != ThreadState::Killed {
            *current = state;
        }
    }
}

impl_kernel_object!(Thread, "Thread");
