//! 具体内核对象类型实现
//!
//! 包含各种内核对象的具体实现：
//! - 事件对象（Event）
//! - 通信对象（Channel、Port）
//! - 内存对象（Vmo、Pager）
//! - 线程对象（Thread）

pub mod channel;
pub mod event;
pub mod pager;
pub mod port;
pub mod thread;
pub mod vmo;

// 重新导出常用对象类型
pub use crate::ipc::ChannelReadResult;
pub use channel::{CallError, Channel, ReadOptions, WriteError};
pub use event::Event;
pub use pager::Pager;
pub use port::{PacketPageRequest, Port, PortAllocator, PortPacket};
pub use thread::{Thread, ThreadState};
pub use vmo::Vmo;
