//! Page requests: one fault's worth of pages a VMO needs from its pager.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::object::types::Event;
use crate::object::Status;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRequestType {
    /// Pages must be supplied before they can be read.
    Read,
    /// Committed pages are about to be written.
    Dirty,
}

/// A request covers `[offset, offset + length)` of a pager-backed VMO. The
/// faulting thread blocks on the request's event until the page source
/// completes it.
///
/// Requests are identified by pointer; the same `Arc` is handed to the page
/// source and to the provider.
pub struct PageRequest {
    id: u64,
    request_type: PageRequestType,
    offset: u64,
    length: u64,
    event: Event,
}

impl PageRequest {
    pub fn new(request_type: PageRequestType, offset: u64, length: u64) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            request_type,
            offset,
            length,
            event: Event::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request_type(&self) -> PageRequestType {
        self.request_type
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    pub fn overlaps(&self, offset: u64, length: u64) -> bool {
        offset < self.end() && self.offset < offset.saturating_add(length)
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub(crate) fn complete(&self, result: Result<(), Status>) {
        self.event.signal_with(result);
    }

    pub fn is_complete(&self) -> bool {
        self.event.is_signaled()
    }
}

impl core::fmt::Debug for PageRequest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageRequest")
            .field("id", &self.id)
            .field("type", &self.request_type)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish()
    }
}
