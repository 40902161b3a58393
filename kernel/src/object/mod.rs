//! 内核对象系统
//!
//! 基于能力的对象系统，参考Zircon微内核设计。
//! 核心概念：
//! - 一切皆对象：所有内核资源都表示为对象
//! - 基于句柄：用户态通过句柄引用对象
//! - 基于能力：句柄带有权限，实现最小权限原则
//! - 句柄计数：最后一个句柄关闭时对象收到 `on_zero_handles`，
//!   对象内存本身由 `Arc` 引用计数管理

pub mod handle;
pub mod table;
pub mod traits;
pub mod types;

pub use handle::{Handle, KernelHandle};
pub use table::{HandleTable, HandleValue};
pub use traits::{
    DispatcherBase, DowncastArc, DowncastRef, KernelObject, Koid, ObjectSignals, Rights, Status,
};

/// 简化对象实现的宏
///
/// 对象结构体必须有一个 `base: DispatcherBase` 字段；额外的 trait 方法
/// （例如 `on_zero_handles`）放在花括号里。
#[macro_export]
macro_rules! impl_kernel_object {
    ($type:ty, $name:expr) => {
        $crate::impl_kernel_object!($type, $name, {});
    };
    ($type:ty, $name:expr, { $($extra:item)* }) => {
        impl $crate::object::traits::KernelObject for $type {
            fn type_name(&self) -> &'static str {
                $name
            }

            fn base(&self) -> &$crate::object::traits::DispatcherBase {
                &self.base
            }

            fn as_any(&self) -> &dyn core::any::Any {
                self
            }

            fn into_any_arc(
                self: alloc::sync::Arc<Self>,
            ) -> alloc::sync::Arc<dyn core::any::Any + Send + Sync> {
                self
            }

            $($extra)*
        }
    };
}
