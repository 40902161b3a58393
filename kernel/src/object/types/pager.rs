//! 分页器对象
//!
//! 用户态分页器通过它创建由自己提供页面的 VMO。每个这样的 VMO 对应一个
//! `PagerProxy`，缺页请求以端口包的形式送到创建时指定的端口上；分页器
//! 用 `supply_pages` / `fail_pages` 回应。

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::port::Port;
use super::vmo::Vmo;
use crate::boot;
use crate::impl_kernel_object;
use crate::object::traits::*;
use crate::vm::{PageSource, PagerOvertimeConfig, PagerProxy};

/// 分页器对象
pub struct Pager {
    base: DispatcherBase,
    overtime: PagerOvertimeConfig,
    proxies: Mutex<Vec<Arc<PagerProxy>>>,
}

impl Pager {
    /// 超时策略取自启动选项
    pub fn new() -> Arc<Self> {
        Self::with_overtime(PagerOvertimeConfig::from_boot_options(&boot::options()))
    }

    pub fn with_overtime(overtime: PagerOvertimeConfig) -> Arc<Self> {
        Arc::new(Self {
            base: DispatcherBase::new(ObjectSignals::empty()),
            overtime,
            proxies: Mutex::new(Vec::new()),
        })
    }

    /// 创建一个由本分页器提供页面的 VMO，请求包的 key 为 `key`
    pub fn create_vmo(
        self: &Arc<Self>,
        port: Arc<Port>,
        key: u64,
        size: usize,
    ) -> Result<Arc<Vmo>, Status> {
        let proxy = PagerProxy::new(Arc::downgrade(self), port, key, self.overtime);
        let source = PageSource::new(proxy.clone());
        proxy.set_page_source(source.clone());
        let vmo = Vmo::new_paged(size, source)?;
        self.proxies.lock().push(proxy);
        log::debug!("pager {}: created vmo {} with key {}", self.koid(), vmo.koid(), key);
        Ok(vmo)
    }

    /// 从代理表中摘除 `proxy`；返回的引用应在锁外释放
    pub fn release_proxy(&self, proxy: &PagerProxy) -> Option<Arc<PagerProxy>> {
        let mut proxies = self.proxies.lock();
        let pos = proxies
            .iter()
            .position(|p| core::ptr::eq(Arc::as_ptr(p), proxy))?;
        Some(proxies.swap_remove(pos))
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.lock().len()
    }

    /// 服务 `vmo` 的代理
    pub fn proxy_for(&self, vmo: &Vmo) -> Option<Arc<PagerProxy>> {
        let source = vmo.page_source()?;
        self.proxies.lock().iter().find(|p| p.serves(source)).cloned()
    }

    /// 找到服务 `vmo` 的页面源；VMO 不属于本分页器时返回 `InvalidArgs`
    fn source_of(&self, vmo: &Vmo) -> Result<Arc<PageSource>, Status> {
        match (self.proxy_for(vmo), vmo.page_source()) {
            (Some(_), Some(source)) => Ok(source.clone()),
            _ => Err(Status::InvalidArgs),
        }
    }

    /// 为 `[offset, offset + data.len())` 提供页面内容
    pub fn supply_pages(&self, vmo: &Vmo, offset: u64, data: &[u8]) -> Result<(), Status> {
        let source = self.source_of(vmo)?;
        vmo.supply_pages(offset, data)?;
        source.on_pages_supplied(offset, data.len() as u64);
        Ok(())
    }

    /// 允许写入 `[offset, offset + length)`
    pub fn dirty_pages(&self, vmo: &Vmo, offset: u64, length: u64) -> Result<(), Status> {
        let source = self.source_of(vmo)?;
        vmo.check_page_range(offset, length)?;
        source.on_pages_dirtied(offset, length);
        Ok(())
    }

    /// 让覆盖该范围的请求以 `status` 失败
    pub fn fail_pages(
        &self,
        vmo: &Vmo,
        offset: u64,
        length: u64,
        status: Status,
    ) -> Result<(), Status> {
        match status {
            Status::Io | Status::BadState | Status::NoMemory | Status::BufferTooSmall => {}
            _ => return Err(Status::InvalidArgs),
        }
        let source = self.source_of(vmo)?;
        vmo.check_page_range(offset, length)?;
        source.on_pages_failed(offset, length, status);
        Ok(())
    }

    /// 断开 VMO 与分页器：未完成的请求以 `BadState` 失败，端口上收到
    /// `VMO_COMPLETE`
    pub fn detach_vmo(&self, vmo: &Vmo) -> Result<(), Status> {
        let source = self.source_of(vmo)?;
        source.detach();
        Ok(())
    }
}

impl_kernel_object!(Pager, "Pager", {
    fn on_zero_handles(&self) {
        let proxies: Vec<Arc<PagerProxy>> = core::mem::take(&mut *self.proxies.lock());
        for proxy in proxies {
            proxy.on_dispatcher_close();
        }
    }
});
