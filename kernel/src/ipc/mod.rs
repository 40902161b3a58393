//! Channel IPC building blocks
//!
//! Messages, the per-endpoint queue and the reply waiters used by
//! `channel_call`. The endpoint object itself lives in
//! [`crate::object::types::Channel`].

pub mod message;
pub mod queue;
pub mod waiter;


pub use message::{MessagePacket, Txid, KERNEL_TXID_BIT, MAX_MESSAGE_HANDLES, MAX_MESSAGE_SIZE};
pub use queue::{ChannelReadResult, MessageQueue};
pub use waiter::{MessageWaiter, WaiterRegistry};
