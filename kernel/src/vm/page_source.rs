//! Page source
//!
//! Sits between a pager-backed VMO and the provider that actually produces
//! pages (a [`PagerProxy`](super::PagerProxy)). It tracks which requests are
//! outstanding so they can be completed when pages arrive and failed when the
//! source is detached.
//!
//! Lock order: the page source lock is taken before any provider lock.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::page_request::{PageRequest, PageRequestType};
use crate::object::types::Event;
use crate::object::Status;

/// The side of a page source that forwards requests to whoever fills pages.
pub trait PageProvider: Send + Sync {
    /// Ask for the pages of `request`. Never blocks.
    fn send_async_request(&self, request: &Arc<PageRequest>);
    /// Withdraw a request that has not been answered yet.
    fn clear_async_request(&self, request: &Arc<PageRequest>);
    /// Replace `old` with `new`, keeping its position.
    fn swap_async_request(&self, old: &Arc<PageRequest>, new: &Arc<PageRequest>);
    /// No more requests will be sent.
    fn on_detach(&self);
    /// The page source is going away.
    fn on_close(&self);
    /// Block on a request's event, applying the provider's timeout policy.
    fn wait_on_event(&self, event: &Event) -> Result<(), Status>;
    /// Log the provider's state.
    fn dump(&self);
}

struct PageSourceInner {
    outstanding: Vec<Arc<PageRequest>>,
    detached: bool,
    closed: bool,
}

pub struct PageSource {
    provider: Arc<dyn PageProvider>,
    inner: Mutex<PageSourceInner>,
}

impl PageSource {
    pub fn new(provider: Arc<dyn PageProvider>) -> Arc<Self> {
        Arc::new(Self {
            provider,
            inner: Mutex::new(PageSourceInner {
                outstanding: Vec::new(),
                detached: false,
                closed: false,
            }),
        })
    }

    pub fn provider(&self) -> &Arc<dyn PageProvider> {
        &self.provider
    }

    /// Start fetching `request`. Fails with `BadState` once detached.
    pub fn get_page(&self, request: &Arc<PageRequest>) -> Result<(), Status> {
        let mut inner = self.inner.lock();
        if inner.detached {
            return Err(Status::BadState);
        }
        inner.outstanding.push(request.clone());
        self.provider.send_async_request(request);
        Ok(())
    }

    /// Block until `request` completes. A request that fails or times out is
    /// withdrawn from the provider.
    pub fn wait_for_request(&self, request: &Arc<PageRequest>) -> Result<(), Status> {
        let result = self.provider.wait_on_event(request.event());
        if result.is_err() {
            self.cancel_request(request);
        }
        result
    }

    pub fn cancel_request(&self, request: &Arc<PageRequest>) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.outstanding.iter().position(|r| Arc::ptr_eq(r, request)) {
            inner.outstanding.swap_remove(pos);
            self.provider.clear_async_request(request);
        }
    }

    pub fn swap_request(&self, old: &Arc<PageRequest>, new: &Arc<PageRequest>) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.outstanding.iter_mut().find(|r| Arc::ptr_eq(r, old)) {
            *slot = new.clone();
            self.provider.swap_async_request(old, new);
        }
    }

    /// Pages in the range became available.
    pub fn on_pages_supplied(&self, offset: u64, length: u64) {
        self.complete_matching(offset, length, Some(PageRequestType::Read), Ok(()));
    }

    /// Pages in the range may now be written.
    pub fn on_pages_dirtied(&self, offset: u64, length: u64) {
        self.complete_matching(offset, length, Some(PageRequestType::Dirty), Ok(()));
    }

    /// The pager gave up on the range.
    pub fn on_pages_failed(&self, offset: u64, length: u64, status: Status) {
        self.complete_matching(offset, length, None, Err(status));
    }

    fn complete_matching(
        &self,
        offset: u64,
        length: u64,
        request_type: Option<PageRequestType>,
        result: Result<(), Status>,
    ) {
        let mut inner = self.inner.lock();
        let mut i = 0;
        while i < inner.outstanding.len() {
            let request = &inner.outstanding[i];
            let matches = request.overlaps(offset, length)
                && request_type.map_or(true, |t| t == request.request_type());
            if matches {
                let request = inner.outstanding.swap_remove(i);
                self.provider.clear_async_request(&request);
                request.complete(result);
            } else {
                i += 1;
            }
        }
    }

    /// Fail every outstanding request with `BadState` and stop accepting new
    /// ones. Idempotent.
    pub fn detach(&self) {
        let mut inner = self.inner.lock();
        self.detach_locked(&mut inner);
    }

    fn detach_locked(&self, inner: &mut PageSourceInner) {
        if inner.detached {
            return;
        }
        inner.detached = true;
        for request in inner.outstanding.drain(..) {
            self.provider.clear_async_request(&request);
            request.complete(Err(Status::BadState));
        }
        self.provider.on_detach();
    }

    /// Detach if needed, then tell the provider the source is gone. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        self.detach_locked(&mut inner);
        if !inner.closed {
            inner.closed = true;
            self.provider.on_close();
        }
    }

    pub fn is_detached(&self) -> bool {
        self.inner.lock().detached
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding.len()
    }

    pub fn dump(&self) {
        log::info!("page source: {} outstanding request(s)", self.outstanding());
        self.provider.dump();
    }
}
