//! 端口对象
//!
//! 端口是固定大小数据包的 FIFO。用户包受队列深度限制；内核包（带
//! `PortAllocator` 的包）绕过限制，被取走或端口关闭后通过分配器的
//! `free` 归还给发送方。`free` 总是在不持有端口锁时调用。

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::arch;
use crate::impl_kernel_object;
use crate::object::traits::*;
use crate::time::Deadline;

pub const PKT_TYPE_USER: u32 = 0;
pub const PKT_TYPE_PAGE_REQUEST: u32 = 9;

pub const PAGER_VMO_READ: u16 = 0;
pub const PAGER_VMO_COMPLETE: u16 = 1;
pub const PAGER_VMO_DIRTY: u16 = 2;

/// 用户包的最大排队数量
pub const MAX_USER_PACKETS: usize = 2048;

/// 端口包（48 字节）
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromZeroes, FromBytes, AsBytes)]
pub struct PortPacket {
    pub key: u64,
    pub packet_type: u32,
    pub status: i32,
    pub payload: [u8; 32],
}

/// `PKT_TYPE_PAGE_REQUEST` 包的负载
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromZeroes, FromBytes, AsBytes)]
pub struct PacketPageRequest {
    pub command: u16,
    pub flags: u16,
    pub reserved0: u32,
    pub offset: u64,
    pub length: u64,
    pub reserved1: u64,
}

impl PortPacket {
    pub fn user(key: u64, payload: [u8; 32]) -> Self {
        Self {
            key,
            packet_type: PKT_TYPE_USER,
            status: 0,
            payload,
        }
    }

    pub fn page_request(key: u64, request: PacketPageRequest) -> Self {
        let mut packet = Self {
            key,
            packet_type: PKT_TYPE_PAGE_REQUEST,
            status: 0,
            payload: [0; 32],
        };
        packet.payload.copy_from_slice(request.as_bytes());
        packet
    }

    /// 解析分页请求负载；类型不符返回 `None`
    pub fn as_page_request(&self) -> Option<PacketPageRequest> {
        if self.packet_type != PKT_TYPE_PAGE_REQUEST {
            return None;
        }
        PacketPageRequest::read_from(&self.payload[..])
    }
}

/// 内核包的所有者
pub trait PortAllocator: Send + Sync {
    /// 包已被读出或端口已关闭，包槽归还
    fn free(&self, packet: &PortPacket);
}

struct QueuedPacket {
    packet: PortPacket,
    allocator: Option<Arc<dyn PortAllocator>>,
}

struct PortInner {
    packets: VecDeque<QueuedPacket>,
    user_packets: usize,
    closed: bool,
}

/// 端口对象
pub struct Port {
    base: DispatcherBase,
    inner: Mutex<PortInner>,
}

impl Port {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            base: DispatcherBase::new(ObjectSignals::empty()),
            inner: Mutex::new(PortInner {
                packets: VecDeque::new(),
                user_packets: 0,
                closed: false,
            }),
        })
    }

    /// 入队。端口关闭后返回 `BadHandle`；用户包超过上限返回 `ShouldWait`。
    pub fn queue(
        &self,
        packet: PortPacket,
        allocator: Option<Arc<dyn PortAllocator>>,
    ) -> Result<(), Status> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Status::BadHandle);
        }
        if allocator.is_none() {
            if inner.user_packets >= MAX_USER_PACKETS {
                return Err(Status::ShouldWait);
            }
            inner.user_packets += 1;
        }
        inner.packets.push_back(QueuedPacket { packet, allocator });
        self.base
            .update_state(ObjectSignals::empty(), ObjectSignals::READABLE);
        Ok(())
    }

    /// 撤回 `allocator` 排队中的包。成功时包槽直接归还调用者，不调用 `free`。
    pub fn cancel_queued(&self, allocator: &Arc<dyn PortAllocator>) -> bool {
        let mut inner = self.inner.lock();
        let pos = inner.packets.iter().position(|queued| {
            queued
                .allocator
                .as_ref()
                .is_some_and(|a| core::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(allocator)))
        });
        let Some(pos) = pos else {
            return false;
        };
        inner.packets.remove(pos);
        if inner.packets.is_empty() {
            self.base
                .update_state(ObjectSignals::READABLE, ObjectSignals::empty());
        }
        true
    }

    /// 取出队首的包
    pub fn dequeue(&self) -> Result<PortPacket, Status> {
        let queued = {
            let mut inner = self.inner.lock();
            let queued = inner.packets.pop_front().ok_or(Status::ShouldWait)?;
            if queued.allocator.is_none() {
                inner.user_packets -= 1;
            }
            if inner.packets.is_empty() {
                self.base
                    .update_state(ObjectSignals::READABLE, ObjectSignals::empty());
            }
            queued
        };
        if let Some(allocator) = &queued.allocator {
            allocator.free(&queued.packet);
        }
        Ok(queued.packet)
    }

    /// 等待一个包，直到截止时间
    pub fn wait(&self, deadline: Deadline) -> Result<PortPacket, Status> {
        loop {
            match self.dequeue() {
                Err(Status::ShouldWait) => {}
                result => return result,
            }
            if deadline.poll()? {
                return Err(Status::TimedOut);
            }
            arch::cpu::relax();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl_kernel_object!(Port, "Port", {
    fn on_zero_handles(&self) {
        let drained: Vec<QueuedPacket> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.user_packets = 0;
            inner.packets.drain(..).collect()
        };
        for queued in drained {
            if let Some(allocator) = &queued.allocator {
                allocator.free(&queued.packet);
            }
        }
    }
});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::KernelHandle;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use core::time::Duration;

    #[derive(Default)]
    struct CountingAllocator {
        freed: AtomicUsize,
    }

    impl PortAllocator for CountingAllocator {
        fn free(&self, _packet: &PortPacket) {
            self.freed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn page_packet(offset: u64) -> PortPacket {
        PortPacket::page_request(
            1,
            PacketPageRequest {
                command: PAGER_VMO_READ,
                flags: 0,
                reserved0: 0,
                offset,
                length: 4096,
                reserved1: 0,
            },
        )
    }

    #[test]
    fn packet_layout() {
        assert_eq!(core::mem::size_of::<PortPacket>(), 48);
        assert_eq!(core::mem::size_of::<PacketPageRequest>(), 32);
        let request = page_packet(8192).as_page_request().unwrap();
        assert_eq!((request.command, request.offset), (PAGER_VMO_READ, 8192));
        assert!(PortPacket::user(0, [0; 32]).as_page_request().is_none());
    }

    #[test]
    fn dequeue_frees_kernel_packets() {
        let port = Port::new();
        let alloc = Arc::new(CountingAllocator::default());
        let as_dyn: Arc<dyn PortAllocator> = alloc.clone();
        port.queue(page_packet(0), Some(as_dyn)).unwrap();
        assert!(port.signals().contains(ObjectSignals::READABLE));

        let packet = port.dequeue().unwrap();
        assert_eq!(packet.key, 1);
        assert_eq!(alloc.freed.load(Ordering::SeqCst), 1);
        assert_eq!(port.dequeue().unwrap_err(), Status::ShouldWait);
        assert!(!port.signals().contains(ObjectSignals::READABLE));
    }

    #[test]
    fn cancel_queued_skips_free() {
        let port = Port::new();
        let alloc = Arc::new(CountingAllocator::default());
        let as_dyn: Arc<dyn PortAllocator> = alloc.clone();
        port.queue(page_packet(0), Some(as_dyn.clone())).unwrap();
        assert!(port.cancel_queued(&as_dyn));
        assert!(!port.cancel_queued(&as_dyn));
        assert!(port.is_empty());
        assert_eq!(alloc.freed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn user_packets_are_capped() {
        let port = Port::new();
        for i in 0..MAX_USER_PACKETS {
            port.queue(PortPacket::user(i as u64, [0; 32]), None).unwrap();
        }
        assert_eq!(
            port.queue(PortPacket::user(0, [0; 32]), None).unwrap_err(),
            Status::ShouldWait
        );
        let alloc: Arc<dyn PortAllocator> = Arc::new(CountingAllocator::default());
        assert!(port.queue(page_packet(0), Some(alloc)).is_ok());
    }

    #[test]
    fn closed_port_frees_and_rejects() {
        let port = Port::new();
        let alloc = Arc::new(CountingAllocator::default());
        let as_dyn: Arc<dyn PortAllocator> = alloc.clone();
        let handle = KernelHandle::new(port.clone());
        port.queue(page_packet(0), Some(as_dyn.clone())).unwrap();
        drop(handle);

        assert_eq!(alloc.freed.load(Ordering::SeqCst), 1);
        assert_eq!(port.queue(page_packet(0), Some(as_dyn)).unwrap_err(), Status::BadHandle);
    }

    #[test]
    fn wait_times_out_when_empty() {
        crate::testing::init();
        let port = Port::new();
        assert_eq!(
            port.wait(Deadline::after(Duration::from_millis(5))).unwrap_err(),
            Status::TimedOut
        );
    }
}
