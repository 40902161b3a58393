//! Reply waiters for channel calls.
//!
//! A [`MessageWaiter`] belongs to one thread and is reused across calls. While
//! a call is in flight it is registered with the calling endpoint under the
//! call's txid; a reply with that txid is handed straight to the waiter
//! instead of being queued.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::message::{MessagePacket, Txid};
use crate::object::types::Event;
use crate::object::{Koid, Status};
use crate::time::Deadline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Idle,
    Waiting,
    Delivered,
    Cancelled(Status),
}

struct WaiterInner {
    state: WaitState,
    txid: Txid,
    channel: Option<Koid>,
    reply: Option<MessagePacket>,
}

pub struct MessageWaiter {
    event: Event,
    inner: Mutex<WaiterInner>,
}

impl MessageWaiter {
    pub fn new() -> Self {
        Self {
            event: Event::new(),
            inner: Mutex::new(WaiterInner {
                state: WaitState::Idle,
                txid: 0,
                channel: None,
                reply: None,
            }),
        }
    }

    /// Arm the waiter for a call on `channel`. Fails with `BadState` if a
    /// previous call has not been ended yet.
    pub fn begin_wait(&self, channel: Koid, txid: Txid) -> Result<(), Status> {
        let mut inner = self.inner.lock();
        if inner.state != WaitState::Idle {
            return Err(Status::BadState);
        }
        inner.state = WaitState::Waiting;
        inner.txid = txid;
        inner.channel = Some(channel);
        inner.reply = None;
        self.event.clear();
        Ok(())
    }

    /// Hand over the reply. Returns the message back if the waiter is no
    /// longer waiting.
    pub fn deliver(&self, msg: MessagePacket) -> Result<(), MessagePacket> {
        let mut inner = self.inner.lock();
        if inner.state != WaitState::Waiting {
            return Err(msg);
        }
        inner.reply = Some(msg);
        inner.state = WaitState::Delivered;
        drop(inner);
        self.event.signal();
        Ok(())
    }

    /// Abort the wait with `status`. No effect once a reply was delivered.
    pub fn cancel(&self, status: Status) {
        let mut inner = self.inner.lock();
        if inner.state != WaitState::Waiting {
            return;
        }
        inner.state = WaitState::Cancelled(status);
        drop(inner);
        self.event.signal_with(Err(status));
    }

    /// Block until delivered, cancelled, interrupted or `deadline`.
    pub fn wait(&self, deadline: Deadline) -> Result<(), Status> {
        self.event.wait(deadline)
    }

    /// Make a blocked (or the next) `wait` return `InternalIntrRetry`.
    pub fn interrupt(&self) {
        self.event.interrupt();
    }

    /// Disarm the waiter and collect the outcome of the call.
    ///
    /// A waiter that was never delivered nor cancelled reports `TimedOut`.
    pub fn end_wait(&self) -> Result<MessagePacket, Status> {
        let mut inner = self.inner.lock();
        let state = core::mem::replace(&mut inner.state, WaitState::Idle);
        let reply = inner.reply.take();
        inner.txid = 0;
        inner.channel = None;
        drop(inner);
        self.event.clear();

        match (state, reply) {
            (WaitState::Delivered, Some(msg)) => Ok(msg),
            (WaitState::Cancelled(status), _) => Err(status),
            _ => Err(Status::TimedOut),
        }
    }

    pub fn txid(&self) -> Txid {
        self.inner.lock().txid
    }

    /// Channel the waiter is currently armed on.
    pub fn channel(&self) -> Option<Koid> {
        self.inner.lock().channel
    }

    pub fn is_waiting(&self) -> bool {
        self.inner.lock().state == WaitState::Waiting
    }

    /// A call on `channel` was begun and not yet ended, whether or not its
    /// outcome has arrived.
    pub fn is_armed_on(&self, channel: Koid) -> bool {
        let inner = self.inner.lock();
        inner.state != WaitState::Idle && inner.channel == Some(channel)
    }

    /// Still waiting for `txid`, on `channel` if one is given.
    fn expects(&self, channel: Option<Koid>, txid: Txid) -> bool {
        let inner = self.inner.lock();
        inner.state == WaitState::Waiting
            && inner.txid == txid
            && channel.map_or(true, |koid| inner.channel == Some(koid))
    }
}

impl Default for MessageWaiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Waiters registered on one channel endpoint, keyed by txid.
#[derive(Default)]
pub struct WaiterRegistry {
    waiters: Vec<Arc<MessageWaiter>>,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, waiter: Arc<MessageWaiter>) {
        self.waiters.push(waiter);
    }

    /// Remove and return the waiter armed on `channel` that expects `txid`.
    pub fn take(&mut self, channel: Koid, txid: Txid) -> Option<Arc<MessageWaiter>> {
        let pos = self
            .waiters
            .iter()
            .position(|w| w.expects(Some(channel), txid))?;
        Some(self.waiters.swap_remove(pos))
    }

    /// Remove `waiter` if it is still registered.
    pub fn remove(&mut self, waiter: &Arc<MessageWaiter>) -> bool {
        match self.waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            Some(pos) => {
                self.waiters.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains_txid(&self, txid: Txid) -> bool {
        self.waiters.iter().any(|w| w.expects(None, txid))
    }

    /// Cancel and unregister every waiter.
    pub fn cancel_all(&mut self, status: Status) {
        for waiter in self.waiters.drain(..) {
            waiter.cancel(status);
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
