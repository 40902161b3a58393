//! 通道对象
//!
//! 通道对象用于进程间通信（IPC），支持双向消息传递和句柄传递。
//! 通道总是成对创建，每个端点可以独立地发送和接收消息。
//!
//! 锁规则：每个端点只持有自己的锁。需要访问对端时，先在自己的锁内
//! 取出对端的 `Arc`，释放锁，再调用对端。两个端点的锁永远不会嵌套，
//! 因此不存在 self→peer / peer→self 的锁序问题。
//!
//! 句柄在锁外销毁：关闭句柄可能触发另一个通道的 `on_zero_handles`，
//! 而它可能回到本端点加锁。

use alloc::sync::Arc;
use bitflags::bitflags;
use core::fmt;
use spin::Mutex;

use crate::impl_kernel_object;
use crate::ipc::{
    ChannelReadResult, MessagePacket, MessageQueue, MessageWaiter, Txid, WaiterRegistry,
    KERNEL_TXID_BIT,
};
use crate::object::handle::KernelHandle;
use crate::object::traits::*;
use crate::time::Deadline;

bitflags! {
    /// 读选项
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReadOptions: u32 {
        /// 队首消息超出缓冲区时丢弃它（仍返回 `BufferTooSmall`）
        const MAY_DISCARD = 1 << 0;
    }
}

/// 写失败：状态码加上被退回的消息
///
/// 消息的 `owns_handles` 已置为 false，调用者应把其中的句柄放回句柄表。
pub struct WriteError {
    pub status: Status,
    pub message: MessagePacket,
}

impl WriteError {
    fn bounce(status: Status, mut message: MessagePacket) -> Self {
        message.set_owns_handles(false);
        Self { status, message }
    }
}

impl fmt::Debug for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteError")
            .field("status", &self.status)
            .field("message", &self.message)
            .finish()
    }
}

/// `call` 的失败
#[derive(Debug)]
pub enum CallError {
    /// 消息没有发出，原样退回
    NotSent(WriteError),
    /// 消息已发出，等待回复失败
    Status(Status),
}

impl CallError {
    pub fn status(&self) -> Status {
        match self {
            CallError::NotSent(err) => err.status,
            CallError::Status(status) => *status,
        }
    }
}

struct ChannelInner {
    /// 对端；非空 → 空 只发生一次
    peer: Option<Arc<Channel>>,
    messages: MessageQueue,
    waiters: WaiterRegistry,
    next_txid: Txid,
}

impl ChannelInner {
    /// 分配一个内核 txid（最高位置位），跳过正在使用的值
    fn allocate_txid(&mut self) -> Txid {
        loop {
            let txid = self.next_txid | KERNEL_TXID_BIT;
            self.next_txid = self.next_txid.wrapping_add(1) & !KERNEL_TXID_BIT;
            if !self.waiters.contains_txid(txid) {
                return txid;
            }
        }
    }
}

/// 通道端点
pub struct Channel {
    base: DispatcherBase,
    /// 配对时记录，之后一直可读
    peer_koid: Koid,
    inner: Mutex<ChannelInner>,
}

impl Channel {
    fn new_endpoint(koid: Koid, peer_koid: Koid) -> Arc<Self> {
        Arc::new(Self {
            base: DispatcherBase::with_koid(koid, ObjectSignals::WRITABLE),
            peer_koid,
            inner: Mutex::new(ChannelInner {
                peer: None,
                messages: MessageQueue::new(),
                waiters: WaiterRegistry::new(),
                next_txid: 1,
            }),
        })
    }

    /// 创建一对相互连接的通道
    pub fn create() -> (KernelHandle<Channel>, KernelHandle<Channel>) {
        let (koid0, koid1) = (Koid::new(), Koid::new());
        let ep0 = Self::new_endpoint(koid0, koid1);
        let ep1 = Self::new_endpoint(koid1, koid0);
        ep0.inner.lock().peer = Some(ep1.clone());
        ep1.inner.lock().peer = Some(ep0.clone());
        (KernelHandle::new(ep0), KernelHandle::new(ep1))
    }

    pub fn peer_koid(&self) -> Koid {
        self.peer_koid
    }

    /// 对端是否还在
    pub fn has_peer(&self) -> bool {
        self.inner.lock().peer.is_some()
    }

    fn peer(&self) -> Option<Arc<Channel>> {
        self.inner.lock().peer.clone()
    }

    fn carries_self(&self, msg: &MessagePacket) -> bool {
        let koid = self.koid();
        msg.handles().iter().any(|h| h.koid() == koid)
    }

    /// 发送消息到对端通道
    pub fn write(&self, msg: MessagePacket) -> Result<(), WriteError> {
        if self.carries_self(&msg) {
            return Err(WriteError::bounce(Status::NotSupported, msg));
        }
        let Some(peer) = self.peer() else {
            return Err(WriteError::bounce(Status::PeerClosed, msg));
        };
        peer.write_self(msg);
        Ok(())
    }

    /// 对端写入本端点。txid 匹配已登记的等待者时直接交付，不进队列。
    ///
    /// 返回是否唤醒了线程。
    pub fn write_self(&self, msg: MessagePacket) -> bool {
        let mut inner = self.inner.lock();
        let mut msg = msg;
        if msg.txid() != 0 {
            if let Some(waiter) = inner.waiters.take(self.koid(), msg.txid()) {
                match waiter.deliver(msg) {
                    Ok(()) => return true,
                    // 等待者已离开（超时与交付竞争），按普通消息入队
                    Err(bounced) => msg = bounced,
                }
            }
        }
        inner.messages.enqueue(msg);
        self.base
            .update_state(ObjectSignals::empty(), ObjectSignals::READABLE);
        false
    }

    /// 从通道读取消息
    pub fn read(
        &self,
        max_bytes: usize,
        max_handles: usize,
        options: ReadOptions,
    ) -> ChannelReadResult<MessagePacket> {
        let mut discarded = None;
        let result = {
            let mut inner = self.inner.lock();
            let peer_connected = inner.peer.is_some();
            let result = inner.messages.dequeue(
                max_bytes,
                max_handles,
                options.contains(ReadOptions::MAY_DISCARD),
                peer_connected,
                &mut discarded,
            );
            if inner.messages.is_empty() {
                self.base
                    .update_state(ObjectSignals::READABLE, ObjectSignals::empty());
            }
            result
        };
        if let Some(msg) = discarded {
            log::debug!("channel {} discarded oversized message {:?}", self.koid(), msg);
        }
        result
    }

    /// 发送请求并等待 txid 相同的回复
    ///
    /// 消息 txid 为 0 时由内核分配。等待者在释放锁、转发消息之前登记，
    /// 因此回复不可能先于登记到达。
    pub fn call(
        &self,
        waiter: &Arc<MessageWaiter>,
        mut msg: MessagePacket,
        deadline: Deadline,
    ) -> Result<MessagePacket, CallError> {
        if self.carries_self(&msg) {
            return Err(CallError::NotSent(WriteError::bounce(Status::NotSupported, msg)));
        }

        let peer = {
            let mut inner = self.inner.lock();
            let txid = match msg.txid() {
                0 => inner.allocate_txid(),
                txid if inner.waiters.contains_txid(txid) => {
                    return Err(CallError::NotSent(WriteError::bounce(
                        Status::AlreadyExists,
                        msg,
                    )));
                }
                txid => txid,
            };
            if let Err(status) = waiter.begin_wait(self.koid(), txid) {
                return Err(CallError::NotSent(WriteError::bounce(status, msg)));
            }
            let Some(peer) = inner.peer.clone() else {
                let _ = waiter.end_wait();
                return Err(CallError::NotSent(WriteError::bounce(Status::PeerClosed, msg)));
            };
            msg.set_txid(txid);
            inner.waiters.register(waiter.clone());
            peer
        };

        peer.write_self(msg);
        drop(peer);
        self.resume_interrupted_call(waiter, deadline)
            .map_err(CallError::Status)
    }

    /// 等待并收取回复；线程被挂起打断后从这里继续，不重新登记
    pub fn resume_interrupted_call(
        &self,
        waiter: &Arc<MessageWaiter>,
        deadline: Deadline,
    ) -> Result<MessagePacket, Status> {
        // 等待者必须正在本端点上进行 call
        if !waiter.is_armed_on(self.koid()) {
            return Err(Status::BadState);
        }
        if let Err(Status::InternalIntrRetry) = waiter.wait(deadline) {
            return Err(Status::InternalIntrRetry);
        }
        // 超时：如果还在登记表里就自己移除；已被交付或取消则什么都不做
        self.inner.lock().waiters.remove(waiter);
        waiter.end_wait()
    }

    /// 放弃 `waiter` 在本端点上未完成的 call，已到达的回复随之销毁
    ///
    /// 线程被终止时使用。等待者不在本端点上时什么都不做。
    pub fn abandon_call(&self, waiter: &Arc<MessageWaiter>) {
        if !waiter.is_armed_on(self.koid()) {
            return;
        }
        self.inner.lock().waiters.remove(waiter);
        if let Ok(reply) = waiter.end_wait() {
            log::debug!(
                "channel {}: dropping reply {} for abandoned call",
                self.koid(),
                reply.txid()
            );
        }
    }

    /// 对端的最后一个句柄关闭
    fn on_peer_zero_handles(&self) {
        let old_peer = {
            let mut inner = self.inner.lock();
            let old_peer = inner.peer.take();
            self.base
                .update_state(ObjectSignals::WRITABLE, ObjectSignals::PEER_CLOSED);
            if !inner.waiters.is_empty() {
                log::debug!(
                    "channel {}: peer closed, cancelling {} waiter(s)",
                    self.koid(),
                    inner.waiters.len()
                );
            }
            inner.waiters.cancel_all(Status::PeerClosed);
            old_peer
        };
        drop(old_peer);
    }
}

impl_kernel_object!(Channel, "Channel", {
    fn related_koid(&self) -> Koid {
        self.peer_koid
    }

    fn on_zero_handles(&self) {
        let peer = {
            let mut inner = self.inner.lock();
            inner.waiters.cancel_all(Status::Canceled);
            inner.peer.take()
        };
        if let Some(peer) = peer {
            peer.on_peer_zero_handles();
        }
    }
});

impl Drop for Channel {
    fn drop(&mut self) {
        // 剩余消息随 `MessageQueue` 一起销毁
        self.inner.get_mut().waiters.cancel_all(Status::Canceled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn msg(data: &[u8]) -> MessagePacket {
        MessagePacket::create(data, Vec::new()).unwrap()
    }

    #[test]
    fn pair_knows_each_other() {
        let (a, b) = Channel::create();
        assert_eq!(a.dispatcher().peer_koid(), b.dispatcher().koid());
        assert_eq!(b.dispatcher().related_koid(), a.dispatcher().koid());
        assert!(a.dispatcher().signals().contains(ObjectSignals::WRITABLE));
    }

    #[test]
    fn readable_follows_queue() {
        let (a, b) = Channel::create();
        a.dispatcher().write(msg(b"x")).unwrap();
        assert!(b.dispatcher().signals().contains(ObjectSignals::READABLE));
        b.dispatcher().read(1, 0, ReadOptions::empty()).ok().unwrap();
        assert!(!b.dispatcher().signals().contains(ObjectSignals::READABLE));
    }

    #[test]
    fn peer_close_flips_signals() {
        let (a, b) = Channel::create();
        drop(a);
        let b = b.dispatcher();
        assert!(!b.has_peer());
        assert!(b.signals().contains(ObjectSignals::PEER_CLOSED));
        assert!(!b.signals().contains(ObjectSignals::WRITABLE));
        let err = b.write(msg(b"x")).unwrap_err();
        assert_eq!(err.status, Status::PeerClosed);
        assert!(!err.message.owns_handles());
    }

    #[test]
    fn kernel_txids_have_high_bit() {
        let (a, _b) = Channel::create();
        let mut inner = a.dispatcher().inner.lock();
        let first = inner.allocate_txid();
        let second = inner.allocate_txid();
        assert_ne!(first & KERNEL_TXID_BIT, 0);
        assert_ne!(first, second);
    }
}
