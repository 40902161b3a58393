//! 系统调用分发器
//!
//! 通道相关的系统调用，工作在调用线程所属进程的句柄表上。
//! 发送的句柄先从句柄表中取出；消息没有送出时（`owns_handles` 为
//! false）原样放回原来的句柄值，调用者看不到任何变化。

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::ipc::{ChannelReadResult, MessagePacket, Txid, MAX_MESSAGE_HANDLES, MAX_MESSAGE_SIZE};
use crate::object::table::{HandleTable, HandleValue};
use crate::object::traits::*;
use crate::object::types::channel::{CallError, Channel, ReadOptions};
use crate::object::types::Thread;
use crate::object::{Handle, KernelHandle};
use crate::time::Deadline;

/// 系统调用结果类型
pub type SyscallResult<T = ()> = Result<T, Status>;

/// 读到的消息：数据和已经装入句柄表的句柄值
#[derive(Debug, PartialEq, Eq)]
pub struct ChannelMessage {
    pub txid: Txid,
    pub data: Vec<u8>,
    pub handles: Vec<HandleValue>,
}

/// 系统调用分发器
///
/// 每个线程一个，共享所属进程的句柄表。
pub struct SyscallDispatcher {
    /// 进程句柄表
    handle_table: Arc<HandleTable>,
    thread: Arc<Thread>,
}

impl SyscallDispatcher {
    /// 创建新的系统调用分发器（独立的句柄表）
    pub fn new() -> Self {
        Self::with_table(Arc::new(HandleTable::new()))
    }

    /// 与其他线程共享 `handle_table`
    pub fn with_table(handle_table: Arc<HandleTable>) -> Self {
        Self {
            handle_table,
            thread: Thread::new(),
        }
    }

    pub fn handle_table(&self) -> &Arc<HandleTable> {
        &self.handle_table
    }

    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }

    /// 创建通道对象，返回两个端点的句柄值
    pub fn sys_channel_create(&self) -> SyscallResult<(HandleValue, HandleValue)> {
        let (ep0, ep1) = Channel::create();
        let value0 = self.handle_table.add(ep0.into_handle(Rights::DEFAULT_CHANNEL))?;
        match self.handle_table.add(ep1.into_handle(Rights::DEFAULT_CHANNEL)) {
            Ok(value1) => Ok((value0, value1)),
            Err(status) => {
                drop(self.handle_table.remove(value0));
                Err(status)
            }
        }
    }

    /// 从句柄表取出要发送的句柄，组装消息
    fn build_message(
        &self,
        txid: Txid,
        data: &[u8],
        handles: &[HandleValue],
    ) -> SyscallResult<MessagePacket> {
        if data.len() > MAX_MESSAGE_SIZE || handles.len() > MAX_MESSAGE_HANDLES {
            return Err(Status::OutOfRange);
        }
        let taken = self.handle_table.remove_many(handles, Rights::TRANSFER)?;
        let mut msg = MessagePacket::from_vec(data.to_vec(), taken)?;
        msg.set_txid(txid);
        Ok(msg)
    }

    /// 把没有送出的句柄放回原来的句柄值
    fn restore_handles(&self, values: &[HandleValue], mut msg: MessagePacket) {
        if msg.owns_handles() {
            return;
        }
        for (value, handle) in values.iter().zip(msg.take_handles()) {
            if let Err(status) = self.handle_table.restore(*value, handle) {
                log::warn!("syscall: cannot restore handle {}: {}", value, status);
            }
        }
    }

    /// 把收到的句柄装入句柄表。表满时整条消息的句柄都被关闭。
    fn install(&self, msg: MessagePacket) -> SyscallResult<ChannelMessage> {
        let txid = msg.txid();
        let (data, handles) = msg.into_parts();
        let mut values = Vec::with_capacity(handles.len());
        let mut failed = None;
        let mut remaining: Vec<Handle> = Vec::new();
        for handle in handles {
            if failed.is_some() {
                remaining.push(handle);
                continue;
            }
            match self.handle_table.add(handle) {
                Ok(value) => values.push(value),
                Err(status) => failed = Some(status),
            }
        }
        if let Some(status) = failed {
            drop(remaining);
            for value in values {
                drop(self.handle_table.remove(value));
            }
            return Err(status);
        }
        Ok(ChannelMessage { txid, data, handles: values })
    }

    /// 发送消息（需要 WRITE 权限；被发送的句柄需要 TRANSFER 权限）
    pub fn sys_channel_write(
        &self,
        handle: HandleValue,
        data: &[u8],
        handles: &[HandleValue],
    ) -> SyscallResult {
        let channel = self
            .handle_table
            .get_dispatcher::<Channel>(handle, Rights::WRITE)?;
        let msg = self.build_message(0, data, handles)?;
        channel.write(msg).map_err(|err| {
            self.restore_handles(handles, err.message);
            err.status
        })
    }

    /// 读取消息（需要 READ 权限）
    pub fn sys_channel_read(
        &self,
        handle: HandleValue,
        max_bytes: usize,
        max_handles: usize,
        options: ReadOptions,
    ) -> ChannelReadResult<ChannelMessage> {
        let channel = match self.handle_table.get_dispatcher::<Channel>(handle, Rights::READ) {
            Ok(channel) => channel,
            Err(status) => return ChannelReadResult::Err(status),
        };
        match channel.read(max_bytes, max_handles, options).map(|msg| self.install(msg)) {
            ChannelReadResult::Ok(Ok(msg)) => ChannelReadResult::Ok(msg),
            ChannelReadResult::Ok(Err(status)) => ChannelReadResult::Err(status),
            ChannelReadResult::BufferTooSmall { bytes_avail, handles_avail } => {
                ChannelReadResult::BufferTooSmall { bytes_avail, handles_avail }
            }
            ChannelReadResult::Err(status) => ChannelReadResult::Err(status),
        }
    }

    /// 发送请求并等待回复（需要 READ | WRITE 权限）
    ///
    /// 线程被挂起时返回 `InternalIntrRetry`，之后用
    /// [`sys_channel_call_resume`](Self::sys_channel_call_resume) 继续。
    pub fn sys_channel_call(
        &self,
        handle: HandleValue,
        txid: Txid,
        data: &[u8],
        handles: &[HandleValue],
        deadline: Deadline,
    ) -> SyscallResult<ChannelMessage> {
        let channel = self
            .handle_table
            .get_dispatcher::<Channel>(handle, Rights::READ | Rights::WRITE)?;
        let msg = self.build_message(txid, data, handles)?;
        match self.thread.channel_call(&channel, msg, deadline) {
            Ok(reply) => self.install(reply),
            Err(CallError::NotSent(err)) => {
                self.restore_handles(handles, err.message);
                Err(err.status)
            }
            Err(CallError::Status(status)) => Err(status),
        }
    }

    /// 继续被打断的 call
    pub fn sys_channel_call_resume(
        &self,
        handle: HandleValue,
        deadline: Deadline,
    ) -> SyscallResult<ChannelMessage> {
        let channel = self
            .handle_table
            .get_dispatcher::<Channel>(handle, Rights::empty())?;
        let reply = self.thread.resume_channel_call(&channel, deadline)?;
        self.install(reply)
    }

    /// 关闭句柄
    pub fn sys_handle_close(&self, handle: HandleValue) -> SyscallResult {
        let handle = self.handle_table.remove(handle)?;
        drop(handle);
        Ok(())
    }

    /// 把内核对象装入句柄表（测试和内核服务用）
    pub fn install_object<T: KernelObject>(
        &self,
        object: KernelHandle<T>,
        rights: Rights,
    ) -> SyscallResult<HandleValue> {
        self.handle_table.add(object.into_handle(rights))
    }
}

impl Default for SyscallDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
