//! Per-endpoint message queue.

use alloc::collections::VecDeque;

use super::message::MessagePacket;
use crate::diag::counters;
use crate::object::Status;

/// Outcome of reading from a channel.
///
/// `BufferTooSmall` reports what the head message needs so the caller can
/// retry with larger buffers.
#[derive(Debug)]
pub enum ChannelReadResult<T> {
    Ok(T),
    BufferTooSmall { bytes_avail: usize, handles_avail: usize },
    Err(Status),
}

impl<T> ChannelReadResult<T> {
    pub fn status(&self) -> Result<(), Status> {
        match self {
            ChannelReadResult::Ok(_) => Ok(()),
            ChannelReadResult::BufferTooSmall { .. } => Err(Status::BufferTooSmall),
            ChannelReadResult::Err(status) => Err(*status),
        }
    }

    pub fn ok(self) -> Option<T> {
        match self {
            ChannelReadResult::Ok(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ChannelReadResult<U> {
        match self {
            ChannelReadResult::Ok(value) => ChannelReadResult::Ok(f(value)),
            ChannelReadResult::BufferTooSmall { bytes_avail, handles_avail } => {
                ChannelReadResult::BufferTooSmall { bytes_avail, handles_avail }
            }
            ChannelReadResult::Err(status) => ChannelReadResult::Err(status),
        }
    }
}

/// FIFO of messages waiting for a reader. Unbounded; the deepest it ever got
/// is reported to the diagnostic histogram when the queue is destroyed.
#[derive(Default)]
pub struct MessageQueue {
    messages: VecDeque<MessagePacket>,
    max_depth: usize,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append at the tail, returning the new depth.
    pub fn enqueue(&mut self, msg: MessagePacket) -> usize {
        self.messages.push_back(msg);
        let depth = self.messages.len();
        if depth > self.max_depth {
            self.max_depth = depth;
        }
        depth
    }

    /// Remove the head message if it fits in `max_bytes` / `max_handles`.
    ///
    /// An oversized head stays queued unless `may_discard` is set, in which
    /// case it is unlinked into `discarded` and `BufferTooSmall` is still
    /// reported. The caller destroys a discarded message once it no longer
    /// holds the endpoint lock, since closing its handles may re-enter a
    /// channel.
    pub fn dequeue(
        &mut self,
        max_bytes: usize,
        max_handles: usize,
        may_discard: bool,
        peer_connected: bool,
        discarded: &mut Option<MessagePacket>,
    ) -> ChannelReadResult<MessagePacket> {
        let Some(head) = self.messages.front() else {
            return ChannelReadResult::Err(if peer_connected {
                Status::ShouldWait
            } else {
                Status::PeerClosed
            });
        };

        let bytes_avail = head.data_size();
        let handles_avail = head.handle_count();
        if bytes_avail > max_bytes || handles_avail > max_handles {
            if may_discard {
                *discarded = self.messages.pop_front();
            }
            return ChannelReadResult::BufferTooSmall { bytes_avail, handles_avail };
        }

        match self.messages.pop_front() {
            Some(msg) => ChannelReadResult::Ok(msg),
            None => ChannelReadResult::Err(Status::ShouldWait),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        counters::record_channel_depth(self.max_depth);
        // Remaining packets (and the handles inside them) are destroyed here.
        self.messages.clear();
    }
}
