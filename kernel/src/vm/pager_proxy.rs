//! Pager proxy
//!
//! The kernel half of a user pager. A proxy turns page requests from its
//! page source into `PKT_TYPE_PAGE_REQUEST` packets on the pager's port, one
//! packet at a time. Requests that arrive while a packet is in flight wait in
//! a FIFO until the port hands the packet slot back through
//! [`PortAllocator::free`].
//!
//! The proxy is owned from two sides: the page source (closed from the VMO
//! side through [`PageProvider::on_close`]) and the pager dispatcher (closed
//! through [`PagerProxy::on_dispatcher_close`]). A `VMO_COMPLETE` packet that
//! is still queued when both sides are gone keeps the page source alive until
//! the port frees it; whichever of the three events comes last drops the page
//! source.
//!
//! Lock order: page source, then proxy, then port or pager dispatcher. The
//! port calls `free` without holding its own lock.

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use core::time::Duration;
use spin::Mutex;

use super::page_request::{PageRequest, PageRequestType};
use super::page_source::{PageProvider, PageSource};
use crate::arch;
use crate::boot::BootOptions;
use crate::diag::counters;
use crate::object::types::port::{
    PacketPageRequest, Port, PortAllocator, PortPacket, PAGER_VMO_COMPLETE, PAGER_VMO_DIRTY,
    PAGER_VMO_READ,
};
use crate::object::types::{Event, Pager};
use crate::object::Status;
use crate::time::{Deadline, Instant};

/// Most requests a dump prints.
const DUMP_LIMIT: usize = 16;

/// How long a page request may stay unanswered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagerOvertimeConfig {
    /// Warn (and dump) every time this much passes; zero disables the warning.
    pub overtime_wait: Duration,
    /// Fail the request after this long; zero waits forever.
    pub overtime_timeout: Duration,
}

impl PagerOvertimeConfig {
    pub fn from_boot_options(options: &BootOptions) -> Self {
        Self {
            overtime_wait: options.userpager_overtime_wait(),
            overtime_timeout: options.userpager_overtime_timeout(),
        }
    }
}

impl Default for PagerOvertimeConfig {
    fn default() -> Self {
        Self::from_boot_options(&BootOptions::DEFAULT)
    }
}

/// What occupies the packet slot.
#[derive(Clone)]
enum ProxyRequest {
    Page(Arc<PageRequest>),
    Complete,
}

impl ProxyRequest {
    fn is(&self, request: &Arc<PageRequest>) -> bool {
        matches!(self, ProxyRequest::Page(r) if Arc::ptr_eq(r, request))
    }
}

/// Packet slot bookkeeping, guarded by the proxy lock.
struct PagerRequestQueue {
    /// Set iff `active` is set.
    packet_busy: bool,
    active: Option<ProxyRequest>,
    pending: VecDeque<ProxyRequest>,
    closed: bool,
    complete_pending: bool,
    page_source: Option<Arc<PageSource>>,
    pager: Option<Weak<Pager>>,
}

/// Work that has to run after the proxy lock is dropped.
#[derive(Default)]
struct Teardown {
    page_source: Option<Arc<PageSource>>,
    pager: Option<Arc<Pager>>,
}

/// State of a proxy as seen by a dump or a test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySnapshot {
    pub packet_busy: bool,
    pub complete_pending: bool,
    pub closed: bool,
    pub has_page_source: bool,
    /// Offset of the request in the packet slot, if it is a page request.
    pub active_offset: Option<u64>,
    pub active_is_complete: bool,
    /// Offsets of the first pending requests, in queue order.
    pub pending_offsets: heapless::Vec<u64, DUMP_LIMIT>,
    pub pending_len: usize,
}

pub struct PagerProxy {
    key: u64,
    port: Arc<Port>,
    overtime: PagerOvertimeConfig,
    this: Weak<PagerProxy>,
    queue: Mutex<PagerRequestQueue>,
}

impl PagerProxy {
    pub fn new(
        pager: Weak<Pager>,
        port: Arc<Port>,
        key: u64,
        overtime: PagerOvertimeConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            key,
            port,
            overtime,
            this: this.clone(),
            queue: Mutex::new(PagerRequestQueue {
                packet_busy: false,
                active: None,
                pending: VecDeque::new(),
                closed: false,
                complete_pending: false,
                page_source: None,
                pager: Some(pager),
            }),
        })
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    /// Attach the page source this proxy serves. Called once, right after
    /// both are created.
    pub fn set_page_source(&self, page_source: Arc<PageSource>) {
        let mut queue = self.queue.lock();
        assert!(queue.page_source.is_none(), "pager proxy {}: page source set twice", self.key);
        queue.page_source = Some(page_source);
    }

    /// Whether `page_source` is the one this proxy serves.
    pub fn serves(&self, page_source: &Arc<PageSource>) -> bool {
        self.queue
            .lock()
            .page_source
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(s, page_source))
    }

    fn allocator(&self) -> Arc<dyn PortAllocator> {
        match self.this.upgrade() {
            Some(this) => this,
            None => panic!("pager proxy {} used while being destroyed", self.key),
        }
    }

    fn packet_for(&self, request: &ProxyRequest) -> PortPacket {
        let payload = match request {
            ProxyRequest::Page(request) => PacketPageRequest {
                command: match request.request_type() {
                    PageRequestType::Read => PAGER_VMO_READ,
                    PageRequestType::Dirty => PAGER_VMO_DIRTY,
                },
                flags: 0,
                reserved0: 0,
                offset: request.offset(),
                length: request.length(),
                reserved1: 0,
            },
            ProxyRequest::Complete => PacketPageRequest {
                command: PAGER_VMO_COMPLETE,
                flags: 0,
                reserved0: 0,
                offset: 0,
                length: 0,
                reserved1: 0,
            },
        };
        PortPacket::page_request(self.key, payload)
    }

    /// Put `request` in the packet slot, or at the back of the pending FIFO
    /// when the slot is taken.
    fn queue_packet_locked(
        &self,
        queue: &mut PagerRequestQueue,
        request: ProxyRequest,
        teardown: &mut Teardown,
    ) {
        if queue.packet_busy {
            queue.pending.push_back(request);
            return;
        }

        let packet = self.packet_for(&request);
        queue.packet_busy = true;
        queue.active = Some(request);

        match self.port.queue(packet, Some(self.allocator())) {
            Ok(()) => {}
            // The port is gone. The packet will never be read, so the slot
            // comes back right away.
            Err(Status::BadHandle) => {
                log::debug!("pager proxy {}: port closed, dropping packet", self.key);
                self.on_packet_freed_locked(queue, teardown);
            }
            Err(status) => panic!(
                "pager proxy {}: failed to queue page request packet: {}",
                self.key, status
            ),
        }
    }

    /// The packet slot is free again.
    fn on_packet_freed_locked(&self, queue: &mut PagerRequestQueue, teardown: &mut Teardown) {
        assert!(queue.packet_busy, "pager proxy {}: freed an idle packet slot", self.key);
        let freed = queue.active.take();
        queue.packet_busy = false;

        if let Some(ProxyRequest::Complete) = freed {
            queue.complete_pending = false;
            if queue.closed {
                self.release_locked(queue, teardown);
            }
        }

        if let Some(next) = queue.pending.pop_front() {
            self.queue_packet_locked(queue, next, teardown);
        }
    }

    /// Final release: both owners closed and no completion packet is
    /// outstanding. Runs at most once since it takes the page source.
    fn release_locked(&self, queue: &mut PagerRequestQueue, teardown: &mut Teardown) {
        if let Some(page_source) = queue.page_source.take() {
            teardown.page_source = Some(page_source);
        }
        teardown.pager = queue.pager.take().and_then(|pager| pager.upgrade());
    }

    fn finish(&self, teardown: Teardown) {
        if let Some(pager) = teardown.pager {
            // Dropped here, outside the pager lock.
            let _released = pager.release_proxy(self);
        }
        if teardown.page_source.is_some() {
            log::debug!("pager proxy {}: page source released", self.key);
        }
    }

    /// The pager dispatcher lost its last handle. Closes the page source and
    /// withdraws a still-queued completion packet.
    pub fn on_dispatcher_close(&self) {
        let page_source = {
            let mut queue = self.queue.lock();
            queue.pager = None;
            queue.page_source.clone()
        };
        // Outside the proxy lock: the page source lock comes first.
        if let Some(page_source) = &page_source {
            page_source.close();
        }
        drop(page_source);

        let mut teardown = Teardown::default();
        {
            let mut guard = self.queue.lock();
            let queue = &mut *guard;
            if queue.complete_pending {
                let in_slot = matches!(queue.active, Some(ProxyRequest::Complete));
                let withdrawn = if in_slot {
                    let cancelled = self.port.cancel_queued(&self.allocator());
                    if cancelled {
                        queue.active = None;
                        queue.packet_busy = false;
                    }
                    cancelled
                } else if let Some(pos) = queue
                    .pending
                    .iter()
                    .position(|r| matches!(r, ProxyRequest::Complete))
                {
                    queue.pending.remove(pos);
                    true
                } else {
                    false
                };
                // Otherwise `free` finishes the teardown.
                if withdrawn {
                    queue.complete_pending = false;
                    if let Some(next) = queue.pending.pop_front() {
                        self.queue_packet_locked(queue, next, &mut teardown);
                    }
                }
            }
            if queue.closed && !queue.complete_pending {
                self.release_locked(queue, &mut teardown);
            }
        }
        self.finish(teardown);
    }

    pub fn snapshot(&self) -> ProxySnapshot {
        let queue = self.queue.lock();
        let mut pending_offsets = heapless::Vec::new();
        for request in queue.pending.iter() {
            let offset = match request {
                ProxyRequest::Page(r) => r.offset(),
                ProxyRequest::Complete => u64::MAX,
            };
            if pending_offsets.push(offset).is_err() {
                break;
            }
        }
        ProxySnapshot {
            packet_busy: queue.packet_busy,
            complete_pending: queue.complete_pending,
            closed: queue.closed,
            has_page_source: queue.page_source.is_some(),
            active_offset: match &queue.active {
                Some(ProxyRequest::Page(r)) => Some(r.offset()),
                _ => None,
            },
            active_is_complete: matches!(queue.active, Some(ProxyRequest::Complete)),
            pending_offsets,
            pending_len: queue.pending.len(),
        }
    }

    fn wait_deadline(&self, start: Instant) -> Deadline {
        let hard = if self.overtime.overtime_timeout.is_zero() {
            Deadline::INFINITE
        } else {
            Deadline::at(start.saturating_add(self.overtime.overtime_timeout))
        };
        if self.overtime.overtime_wait.is_zero() {
            return hard;
        }
        let soft = arch::timer::now().saturating_add(self.overtime.overtime_wait);
        match hard.when() {
            Some(when) if when < soft => hard,
            _ => Deadline::at(soft),
        }
    }
}

impl PageProvider for PagerProxy {
    fn send_async_request(&self, request: &Arc<PageRequest>) {
        counters::PAGER_TOTAL_REQUESTS.add(1);
        let mut teardown = Teardown::default();
        {
            let mut queue = self.queue.lock();
            assert!(!queue.closed, "pager proxy {}: request on a closed proxy", self.key);
            self.queue_packet_locked(&mut queue, ProxyRequest::Page(request.clone()), &mut teardown);
        }
        self.finish(teardown);
    }

    fn clear_async_request(&self, request: &Arc<PageRequest>) {
        let mut teardown = Teardown::default();
        {
            let mut queue = self.queue.lock();
            if queue.active.as_ref().is_some_and(|active| active.is(request)) {
                // If the packet was already read, `free` releases the slot.
                if self.port.cancel_queued(&self.allocator()) {
                    self.on_packet_freed_locked(&mut queue, &mut teardown);
                }
            } else if let Some(pos) = queue.pending.iter().position(|r| r.is(request)) {
                queue.pending.remove(pos);
            }
        }
        self.finish(teardown);
    }

    fn swap_async_request(&self, old: &Arc<PageRequest>, new: &Arc<PageRequest>) {
        let mut queue = self.queue.lock();
        if queue.active.as_ref().is_some_and(|active| active.is(old)) {
            queue.active = Some(ProxyRequest::Page(new.clone()));
        } else if let Some(slot) = queue.pending.iter_mut().find(|r| r.is(old)) {
            *slot = ProxyRequest::Page(new.clone());
        }
    }

    fn on_detach(&self) {
        let mut teardown = Teardown::default();
        {
            let mut queue = self.queue.lock();
            assert!(!queue.closed, "pager proxy {}: detach after close", self.key);
            queue.complete_pending = true;
            self.queue_packet_locked(&mut queue, ProxyRequest::Complete, &mut teardown);
        }
        self.finish(teardown);
    }

    fn on_close(&self) {
        let mut teardown = Teardown::default();
        {
            let mut queue = self.queue.lock();
            queue.closed = true;
            if !queue.complete_pending {
                self.release_locked(&mut queue, &mut teardown);
            }
        }
        self.finish(teardown);
    }

    fn wait_on_event(&self, event: &Event) -> Result<(), Status> {
        let start = arch::timer::now();
        loop {
            match event.wait(self.wait_deadline(start)) {
                Ok(()) => {
                    counters::PAGER_SUCCEEDED_REQUESTS.add(1);
                    return Ok(());
                }
                Err(Status::TimedOut) => {
                    let waited = arch::timer::now().saturating_since(start);
                    let timeout = self.overtime.overtime_timeout;
                    if !timeout.is_zero() && waited >= timeout {
                        counters::PAGER_TIMED_OUT_REQUESTS.add(1);
                        log::error!(
                            "pager proxy {}: page request timed out after {}s",
                            self.key,
                            waited.as_secs()
                        );
                        self.dump();
                        return Err(Status::TimedOut);
                    }
                    counters::PAGER_OVERTIME_WAITS.add(1);
                    log::warn!(
                        "pager proxy {}: page request outstanding for {}s",
                        self.key,
                        waited.as_secs()
                    );
                    self.dump();
                }
                Err(Status::InternalIntrRetry) => return Err(Status::InternalIntrRetry),
                Err(status) => {
                    counters::PAGER_FAILED_REQUESTS.add(1);
                    return Err(status);
                }
            }
        }
    }

    fn dump(&self) {
        let snapshot = self.snapshot();
        log::warn!(
            "pager proxy {}: busy {} complete_pending {} closed {} active {:?} pending {}",
            self.key,
            snapshot.packet_busy,
            snapshot.complete_pending,
            snapshot.closed,
            snapshot.active_offset,
            snapshot.pending_len
        );
        for offset in snapshot.pending_offsets.iter() {
            log::warn!("  pending request at offset {:#x}", offset);
        }
    }
}

impl PortAllocator for PagerProxy {
    fn free(&self, _packet: &PortPacket) {
        let mut teardown = Teardown::default();
        {
            let mut queue = self.queue.lock();
            self.on_packet_freed_locked(&mut queue, &mut teardown);
        }
        self.finish(teardown);
    }
}
