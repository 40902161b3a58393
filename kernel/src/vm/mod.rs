//! Pager-backed memory
//!
//! Only the slice of the VM system that user pagers need: page requests, the
//! page source that tracks them, and the proxy that turns them into port
//! packets.

pub mod page_request;
pub mod page_source;
pub mod pager_proxy;

#[cfg(test)]
mod test;

pub use page_request::{PageRequest, PageRequestType};
pub use page_source::{PageProvider, PageSource};
pub use pager_proxy::{PagerOvertimeConfig, PagerProxy, ProxySnapshot};

pub const PAGE_SIZE: usize = 4096;
