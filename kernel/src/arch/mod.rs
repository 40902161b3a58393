//! 内核架构抽象层
//!
//! IPC 核心只需要架构层提供两样东西：
//! - 单调时钟（纳秒），用于截止时间
//! - 等待期间的 CPU 让出原语
//!
//! 具体平台在启动早期通过 [`timer::install`] 注册时钟源。

use spin::Once;

/// 定时器和时钟源
pub trait Timer: Sync {
    /// 获取当前单调时间（纳秒）
    fn timer_now(&self) -> u64;

    /// 自旋等待期间调用，平台可以在这里 WFE / yield
    fn cpu_relax(&self) {
        core::hint::spin_loop();
    }
}

static TIMER: Once<&'static dyn Timer> = Once::new();

/// 架构特定的定时器操作
pub mod timer {
    use super::*;
    use crate::time::Instant;

    /// 注册时钟源。只有第一次注册生效，返回是否是本次注册生效。
    pub fn install(source: &'static dyn Timer) -> bool {
        let mut installed = false;
        TIMER.call_once(|| {
            installed = true;
            source
        });
        if installed {
            log::debug!("timer source installed");
        }
        installed
    }

    /// 获取当前时间
    ///
    /// Before a source is installed the clock reads zero. Blocking waits use
    /// [`Deadline::poll`](crate::time::Deadline::poll), which refuses finite
    /// deadlines in that state.
    pub fn now() -> Instant {
        Instant::from_nanos(TIMER.get().map_or(0, |t| t.timer_now()))
    }

    /// 当前时间；尚未注册时钟源时为 `None`
    pub fn try_now() -> Option<Instant> {
        TIMER.get().map(|t| Instant::from_nanos(t.timer_now()))
    }
}

/// 架构特定的CPU操作
pub mod cpu {
    use super::*;

    /// 忙等一次
    #[inline]
    pub fn relax() {
        match TIMER.get() {
            Some(t) => t.cpu_relax(),
            None => core::hint::spin_loop(),
        }
    }
}
