//! 事件对象
//!
//! 事件对象是最简单的内核对象之一，用于发出信号和等待信号。
//! 事件可以处于两种状态：已信号（signaled）或未信号（unsignaled）。
//! 信号携带一个结果（成功或状态码），等待者取回这个结果。
//! 事件是电平触发的：信号保持到 `clear` 为止。

use spin::Mutex;

use crate::arch;
use crate::impl_kernel_object;
use crate::object::traits::*;
use crate::time::Deadline;

struct EventState {
    /// 已信号时保存结果
    result: Option<Result<(), Status>>,
    /// 挂起请求：下一次（或当前）等待返回 `InternalIntrRetry`
    interrupted: bool,
}

/// 事件对象
pub struct Event {
    base: DispatcherBase,
    state: Mutex<EventState>,
}

impl Event {
    /// 创建新的事件对象（未信号）
    pub fn new() -> Self {
        Self {
            base: DispatcherBase::new(ObjectSignals::empty()),
            state: Mutex::new(EventState {
                result: None,
                interrupted: false,
            }),
        }
    }

    /// 发出事件信号
    pub fn signal(&self) {
        self.signal_with(Ok(()));
    }

    /// 以给定结果发出信号；已信号时保留第一次的结果
    pub fn signal_with(&self, result: Result<(), Status>) {
        let mut state = self.state.lock();
        if state.result.is_none() {
            state.result = Some(result);
            self.base.update_state(ObjectSignals::empty(), ObjectSignals::SIGNALED);
        }
    }

    /// 清除事件信号
    ///
    /// 未被消费的打断请求保留，只有 `wait` 会消费它。
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.result = None;
        self.base.update_state(ObjectSignals::SIGNALED, ObjectSignals::empty());
    }

    /// 检查事件是否已信号
    pub fn is_signaled(&self) -> bool {
        self.state.lock().result.is_some()
    }

    /// 打断等待者（线程挂起时使用）
    pub fn interrupt(&self) {
        self.state.lock().interrupted = true;
    }

    /// 等待事件信号，直到截止时间
    ///
    /// 返回信号携带的结果；超时返回 `TimedOut`；被打断返回
    /// `InternalIntrRetry`，信号不受影响，可以重新等待。
    pub fn wait(&self, deadline: Deadline) -> Result<(), Status> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(result) = state.result {
                    return result;
                }
                if state.interrupted {
                    state.interrupted = false;
                    return Err(Status::InternalIntrRetry);
                }
            }
            if deadline.poll()? {
                return Err(Status::TimedOut);
            }
            arch::cpu::relax();
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl_kernel_object!(Event, "Event");
