//! Channel message packets.

use alloc::vec::Vec;
use core::fmt;

use crate::object::{Handle, Status};

/// Transaction id correlating a call with its reply. Zero means the message
/// is not part of a call.
pub type Txid = u32;

/// Largest payload a single message may carry.
pub const MAX_MESSAGE_SIZE: usize = 65536;
/// Most handles a single message may carry.
pub const MAX_MESSAGE_HANDLES: usize = 64;
/// Txids allocated by the kernel for `call` have the high bit set.
pub const KERNEL_TXID_BIT: Txid = 0x8000_0000;

/// A message in flight: payload bytes plus the handles being transferred.
///
/// A packet is owned by exactly one holder at a time (the writer, a queue,
/// a waiter, or the reader). Dropping it closes the handles it carries.
pub struct MessagePacket {
    data: Vec<u8>,
    handles: Vec<Handle>,
    txid: Txid,
    owns_handles: bool,
}

impl MessagePacket {
    pub fn create(data: &[u8], handles: Vec<Handle>) -> Result<Self, Status> {
        Self::from_vec(data.to_vec(), handles)
    }

    pub fn from_vec(data: Vec<u8>, handles: Vec<Handle>) -> Result<Self, Status> {
        if data.len() > MAX_MESSAGE_SIZE || handles.len() > MAX_MESSAGE_HANDLES {
            return Err(Status::OutOfRange);
        }
        Ok(Self {
            data,
            handles,
            txid: 0,
            owns_handles: true,
        })
    }

    /// A message that belongs to transaction `txid`.
    pub fn with_txid(txid: Txid, data: &[u8], handles: Vec<Handle>) -> Result<Self, Status> {
        let mut msg = Self::create(data, handles)?;
        msg.txid = txid;
        Ok(msg)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    pub fn handles(&self) -> &[Handle] {
        &self.handles
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub fn txid(&self) -> Txid {
        self.txid
    }

    pub fn set_txid(&mut self, txid: Txid) {
        self.txid = txid;
    }

    /// False once a failed operation has handed the message back so the
    /// caller can return its handles to their table.
    pub fn owns_handles(&self) -> bool {
        self.owns_handles
    }

    pub fn set_owns_handles(&mut self, owns: bool) {
        self.owns_handles = owns;
    }

    /// Move the handles out, leaving the packet with none.
    pub fn take_handles(&mut self) -> Vec<Handle> {
        core::mem::take(&mut self.handles)
    }

    pub fn into_parts(mut self) -> (Vec<u8>, Vec<Handle>) {
        let handles = self.take_handles();
        (core::mem::take(&mut self.data), handles)
    }
}

impl fmt::Debug for MessagePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePacket")
            .field("txid", &self.txid)
            .field("data_size", &self.data.len())
            .field("handle_count", &self.handles.len())
            .field("owns_handles", &self.owns_handles)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn size_limits() {
        assert!(MessagePacket::from_vec(vec![0; MAX_MESSAGE_SIZE], Vec::new()).is_ok());
        assert_eq!(
            MessagePacket::from_vec(vec![0; MAX_MESSAGE_SIZE + 1], Vec::new()).unwrap_err(),
            Status::OutOfRange
        );
    }

    #[test]
    fn txid_defaults_to_zero() {
        let msg = MessagePacket::create(b"abc", Vec::new()).unwrap();
        assert_eq!(msg.txid(), 0);
        assert!(msg.owns_handles());
        let msg = MessagePacket::with_txid(9, b"abc", Vec::new()).unwrap();
        assert_eq!(msg.txid(), 9);
        assert_eq!(msg.into_parts().0, b"abc");
    }
}
