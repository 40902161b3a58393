//! HNX IPC core
//!
//! 内核中最关键的两类对象：
//! - 通道（Channel）：双端同步消息传递，支持 call/reply 事务关联
//! - 分页代理（PagerProxy）：把缺页请求通过端口包转交给用户态分页器
//!
//! The crate is `no_std` + `alloc` so the same objects run inside the kernel
//! image and under host unit tests.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod boot;
pub mod diag;
pub mod ipc;
pub mod object;
pub mod syscall;
pub mod time;
pub mod vm;

#[cfg(test)]
mod testing;

pub use object::{Handle, HandleTable, KernelHandle, KernelObject, Koid, Rights, Status};
