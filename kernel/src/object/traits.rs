// 基本内核特征
use alloc::sync::Arc;
use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// 内核对象ID（koid）
///
/// 对象销毁后 koid 仍然可以被读取和比较，通道用它记录对端身份。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Koid(u64);

impl Koid {
    /// 无效 koid（0），例如没有关联对象时
    pub const INVALID: Koid = Koid(0);

    pub fn new() -> Koid {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Koid(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Koid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags::bitflags! {
    /// 对象权限位
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rights: u32 {
        const DUPLICATE   = 1 << 0;
        const TRANSFER    = 1 << 1;
        const READ        = 1 << 2;
        const WRITE       = 1 << 3;
        const EXECUTE     = 1 << 4;
        const MAP         = 1 << 5;
        const GET_PROPERTY = 1 << 6;
        const SET_PROPERTY = 1 << 7;
        const ENUMERATE   = 1 << 8;
        const DESTROY     = 1 << 9;
        const WAIT        = 1 << 14;
        const INSPECT     = 1 << 15;
        const SIGNAL      = 1 << 12;
        const SIGNAL_PEER = 1 << 13;
        const SAME_RIGHTS = 1 << 31; // 复制时保持相同权限
    }
}

impl Rights {
    /// 通道句柄的默认权限
    pub const DEFAULT_CHANNEL: Rights = Rights::TRANSFER
        .union(Rights::DUPLICATE)
        .union(Rights::WAIT)
        .union(Rights::INSPECT)
        .union(Rights::READ)
        .union(Rights::WRITE)
        .union(Rights::SIGNAL)
        .union(Rights::SIGNAL_PEER);

    /// 其他对象的基础权限
    pub const BASIC: Rights = Rights::TRANSFER
        .union(Rights::DUPLICATE)
        .union(Rights::WAIT)
        .union(Rights::INSPECT);
}

bitflags::bitflags! {
    /// 基本信号位
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectSignals: u32 {
        const READABLE    = 1 << 0;
        const WRITABLE    = 1 << 1;
        const PEER_CLOSED = 1 << 2;
        const SIGNALED    = 1 << 3;
    }
}

/// 所有内核对象共享的基础状态：koid、句柄计数和信号
pub struct DispatcherBase {
    koid: Koid,
    handle_count: AtomicU32,
    signals: AtomicU32,
}

impl DispatcherBase {
    pub fn new(signals: ObjectSignals) -> Self {
        Self::with_koid(Koid::new(), signals)
    }

    /// 使用预先分配的 koid 创建（通道成对创建时需要提前知道对端 koid）
    pub fn with_koid(koid: Koid, signals: ObjectSignals) -> Self {
        Self {
            koid,
            handle_count: AtomicU32::new(0),
            signals: AtomicU32::new(signals.bits()),
        }
    }

    pub fn koid(&self) -> Koid {
        self.koid
    }

    pub fn signals(&self) -> ObjectSignals {
        ObjectSignals::from_bits_truncate(self.signals.load(Ordering::Acquire))
    }

    /// 先清除 `clear`，再置位 `set`
    pub fn update_state(&self, clear: ObjectSignals, set: ObjectSignals) {
        let _ = self
            .signals
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((bits & !clear.bits()) | set.bits())
            });
    }

    pub fn handle_count(&self) -> u32 {
        self.handle_count.load(Ordering::Acquire)
    }

    pub(crate) fn increment_handle_count(&self) {
        self.handle_count.fetch_add(1, Ordering::AcqRel);
    }

    /// 返回 true 表示刚刚关闭了最后一个句柄
    pub(crate) fn decrement_handle_count(&self) -> bool {
        let prev = self.handle_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "handle count underflow on koid {}", self.koid);
        prev == 1
    }
}

/// 所有内核对象必须实现的特性
pub trait KernelObject: Send + Sync + Any {
    /// 返回对象类型名
    fn type_name(&self) -> &'static str;

    /// 对象基础状态
    fn base(&self) -> &DispatcherBase;

    /// 返回对象ID
    fn koid(&self) -> Koid {
        self.base().koid()
    }

    /// 对象当前信号
    fn signals(&self) -> ObjectSignals {
        self.base().signals()
    }

    /// 关联对象的 koid（通道返回对端）
    fn related_koid(&self) -> Koid {
        Koid::INVALID
    }

    /// 最后一个句柄关闭时调用
    fn on_zero_handles(&self) {}

    /// 将self转换为Any trait对象，以便向下转换
    fn as_any(&self) -> &dyn Any;

    /// Arc 版本的 Any 转换，供 [`DowncastArc`] 使用
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// 为Arc<dyn KernelObject>提供向下转换方法
pub trait DowncastArc {
    /// 尝试将Arc<dyn KernelObject>向下转换为具体类型
    fn downcast_arc<T: KernelObject>(self) -> Result<Arc<T>, Status>;
}

impl DowncastArc for Arc<dyn KernelObject> {
    fn downcast_arc<T: KernelObject>(self) -> Result<Arc<T>, Status> {
        self.into_any_arc()
            .downcast::<T>()
            .map_err(|_| Status::WrongType)
    }
}

/// 为&dyn KernelObject提供向下转换方法
pub trait DowncastRef {
    /// 尝试将&dyn KernelObject向下转换为具体类型的引用
    fn downcast_ref<T: KernelObject>(&self) -> Option<&T>;
}

impl DowncastRef for dyn KernelObject {
    fn downcast_ref<T: KernelObject>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// 内核状态码
///
/// 所有可恢复的失败都以状态码返回；`into_raw` 给出与 Zircon 兼容的数值。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    NotSupported,
    NoResources,
    NoMemory,
    InternalIntrRetry,
    InvalidArgs,
    BadHandle,
    WrongType,
    OutOfRange,
    BufferTooSmall,
    BadState,
    TimedOut,
    ShouldWait,
    Canceled,
    PeerClosed,
    NotFound,
    AlreadyExists,
    AccessDenied,
    Io,
}

impl Status {
    pub const fn into_raw(self) -> i32 {
        match self {
            Status::NotSupported => -2,
            Status::NoResources => -3,
            Status::NoMemory => -4,
            Status::InternalIntrRetry => -6,
            Status::InvalidArgs => -10,
            Status::BadHandle => -11,
            Status::WrongType => -12,
            Status::OutOfRange => -14,
            Status::BufferTooSmall => -15,
            Status::BadState => -20,
            Status::TimedOut => -21,
            Status::ShouldWait => -22,
            Status::Canceled => -23,
            Status::PeerClosed => -24,
            Status::NotFound => -25,
            Status::AlreadyExists => -26,
            Status::AccessDenied => -30,
            Status::Io => -40,
        }
    }

    pub fn from_raw(raw: i32) -> Option<Status> {
        const ALL: [Status; 18] = [
            Status::NotSupported,
            Status::NoResources,
            Status::NoMemory,
            Status::InternalIntrRetry,
            Status::InvalidArgs,
            Status::BadHandle,
            Status::WrongType,
            Status::OutOfRange,
            Status::BufferTooSmall,
            Status::BadState,
            Status::TimedOut,
            Status::ShouldWait,
            Status::Canceled,
            Status::PeerClosed,
            Status::NotFound,
            Status::AlreadyExists,
            Status::AccessDenied,
            Status::Io,
        ];
        ALL.into_iter().find(|s| s.into_raw() == raw)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::NotSupported => "not supported",
            Status::NoResources => "no resources",
            Status::NoMemory => "no memory",
            Status::InternalIntrRetry => "interrupted, retry",
            Status::InvalidArgs => "invalid args",
            Status::BadHandle => "bad handle",
            Status::WrongType => "wrong type",
            Status::OutOfRange => "out of range",
            Status::BufferTooSmall => "buffer too small",
            Status::BadState => "bad state",
            Status::TimedOut => "timed out",
            Status::ShouldWait => "should wait",
            Status::Canceled => "canceled",
            Status::PeerClosed => "peer closed",
            Status::NotFound => "not found",
            Status::AlreadyExists => "already exists",
            Status::AccessDenied => "access denied",
            Status::Io => "i/o error",
        };
        write!(f, "{} ({})", name, self.into_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_raw_codes_round_trip() {
        for raw in [-2, -10, -15, -20, -21, -22, -23, -24, -40] {
            let status = Status::from_raw(raw).unwrap();
            assert_eq!(status.into_raw(), raw);
        }
        assert_eq!(Status::from_raw(0), None);
    }

    #[test]
    fn update_state_clears_before_setting() {
        let base = DispatcherBase::new(ObjectSignals::WRITABLE | ObjectSignals::READABLE);
        base.update_state(ObjectSignals::WRITABLE, ObjectSignals::PEER_CLOSED);
        assert_eq!(base.signals(), ObjectSignals::READABLE | ObjectSignals::PEER_CLOSED);
    }

    #[test]
    fn koids_are_unique() {
        let a = Koid::new();
        let b = Koid::new();
        assert_ne!(a, b);
        assert_ne!(a, Koid::INVALID);
    }
}
