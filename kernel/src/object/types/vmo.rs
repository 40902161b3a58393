//! 虚拟内存对象（VMO）
//!
//! VMO 是按页管理的一段内存：
//! - 匿名 VMO：页面第一次被访问时以零填充提交
//! - 分页器 VMO：缺失的页面通过页面源向用户态分页器请求，等待超时则
//!   访问失败，而不是永远挂起

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::impl_kernel_object;
use crate::object::traits::*;
use crate::vm::{PageRequest, PageRequestType, PageSource, PAGE_SIZE};

/// 单个 VMO 的大小上限（1GB）
pub const MAX_VMO_SIZE: usize = 1024 * 1024 * 1024;

/// 虚拟内存对象
pub struct Vmo {
    base: DispatcherBase,
    /// 内存大小（字节）
    size: usize,
    /// 已提交的页面，None 表示尚未提交
    pages: Mutex<Vec<Option<Box<[u8]>>>>,
    /// 分页器 VMO 的页面源
    source: Option<Arc<PageSource>>,
}

impl Vmo {
    fn with_source(size: usize, source: Option<Arc<PageSource>>) -> Result<Arc<Self>, Status> {
        if size == 0 || size > MAX_VMO_SIZE {
            return Err(Status::InvalidArgs);
        }
        let num_pages = size.div_ceil(PAGE_SIZE);
        let mut pages = Vec::new();
        pages.resize_with(num_pages, || None);
        Ok(Arc::new(Self {
            base: DispatcherBase::new(ObjectSignals::empty()),
            size,
            pages: Mutex::new(pages),
            source,
        }))
    }

    /// 创建匿名 VMO
    pub fn new(size: usize) -> Result<Arc<Self>, Status> {
        Self::with_source(size, None)
    }

    /// 创建由 `source` 提供页面的 VMO
    pub fn new_paged(size: usize, source: Arc<PageSource>) -> Result<Arc<Self>, Status> {
        Self::with_source(size, Some(source))
    }

    /// 获取VMO大小
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn page_count(&self) -> usize {
        self.size.div_ceil(PAGE_SIZE)
    }

    pub fn page_source(&self) -> Option<&Arc<PageSource>> {
        self.source.as_ref()
    }

    pub fn is_committed(&self, page_index: usize) -> bool {
        self.pages
            .lock()
            .get(page_index)
            .is_some_and(|p| p.is_some())
    }

    /// 页对齐且落在 VMO 内的范围
    pub fn check_page_range(&self, offset: u64, length: u64) -> Result<(), Status> {
        let page = PAGE_SIZE as u64;
        if offset % page != 0 || length % page != 0 {
            return Err(Status::InvalidArgs);
        }
        let end = offset.checked_add(length).ok_or(Status::OutOfRange)?;
        if end > (self.page_count() * PAGE_SIZE) as u64 {
            return Err(Status::OutOfRange);
        }
        Ok(())
    }

    fn byte_range_to_pages(&self, offset: usize, len: usize) -> Result<(usize, usize), Status> {
        let end = offset.checked_add(len).ok_or(Status::OutOfRange)?;
        if end > self.size {
            return Err(Status::OutOfRange);
        }
        Ok((offset / PAGE_SIZE, end.div_ceil(PAGE_SIZE)))
    }

    /// 第一段连续的未提交页面 `[start, end)`
    fn first_missing_run(&self, first: usize, last: usize) -> Option<(usize, usize)> {
        let pages = self.pages.lock();
        let start = (first..last).find(|&i| pages[i].is_none())?;
        let end = (start..last).find(|&i| pages[i].is_some()).unwrap_or(last);
        Some((start, end))
    }

    /// 提交页面 `[first, last)`
    fn fault_in(&self, first: usize, last: usize) -> Result<(), Status> {
        while let Some((start, end)) = self.first_missing_run(first, last) {
            let Some(source) = &self.source else {
                let mut pages = self.pages.lock();
                for page in &mut pages[start..end] {
                    if page.is_none() {
                        *page = Some(vec![0u8; PAGE_SIZE].into_boxed_slice());
                    }
                }
                continue;
            };
            let request = PageRequest::new(
                PageRequestType::Read,
                (start * PAGE_SIZE) as u64,
                ((end - start) * PAGE_SIZE) as u64,
            );
            source.get_page(&request)?;
            if let Err(status) = source.wait_for_request(&request) {
                log::debug!("vmo {}: page fault at {:#x} failed: {}", self.koid(), request.offset(), status);
                return Err(status);
            }
        }
        Ok(())
    }

    /// 提交覆盖 `[offset, offset + len)` 的页面
    pub fn commit_range(&self, offset: usize, len: usize) -> Result<(), Status> {
        let (first, last) = self.byte_range_to_pages(offset, len)?;
        self.fault_in(first, last)
    }

    /// 读取VMO数据
    pub fn read(&self, offset: usize, buffer: &mut [u8]) -> Result<(), Status> {
        self.commit_range(offset, buffer.len())?;
        let pages = self.pages.lock();
        let mut copied = 0;
        while copied < buffer.len() {
            let pos = offset + copied;
            let (index, in_page) = (pos / PAGE_SIZE, pos % PAGE_SIZE);
            let n = (PAGE_SIZE - in_page).min(buffer.len() - copied);
            // 刚刚提交过；分页器 VMO 在此期间被截断不会发生
            let Some(page) = &pages[index] else {
                return Err(Status::BadState);
            };
            buffer[copied..copied + n].copy_from_slice(&page[in_page..in_page + n]);
            copied += n;
        }
        Ok(())
    }

    /// 写入VMO数据。分页器 VMO 在写入前还要等分页器确认（`VMO_DIRTY`）。
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), Status> {
        let (first, last) = self.byte_range_to_pages(offset, data.len())?;
        self.fault_in(first, last)?;
        if let Some(source) = &self.source {
            if first < last {
                let request = PageRequest::new(
                    PageRequestType::Dirty,
                    (first * PAGE_SIZE) as u64,
                    ((last - first) * PAGE_SIZE) as u64,
                );
                source.get_page(&request)?;
                source.wait_for_request(&request)?;
            }
        }

        let mut pages = self.pages.lock();
        let mut copied = 0;
        while copied < data.len() {
            let pos = offset + copied;
            let (index, in_page) = (pos / PAGE_SIZE, pos % PAGE_SIZE);
            let n = (PAGE_SIZE - in_page).min(data.len() - copied);
            let Some(page) = &mut pages[index] else {
                return Err(Status::BadState);
            };
            page[in_page..in_page + n].copy_from_slice(&data[copied..copied + n]);
            copied += n;
        }
        Ok(())
    }

    /// 分页器提供页面内容；已提交的页面保持不变
    pub fn supply_pages(&self, offset: u64, data: &[u8]) -> Result<(), Status> {
        self.check_page_range(offset, data.len() as u64)?;
        let first = offset as usize / PAGE_SIZE;
        let mut pages = self.pages.lock();
        for (i, chunk) in data.chunks(PAGE_SIZE).enumerate() {
            let page = &mut pages[first + i];
            if page.is_none() {
                *page = Some(Box::from(chunk));
            }
        }
        Ok(())
    }

    /// 断开页面源：此后缺页以 `BadState` 失败
    pub fn detach_source(&self) {
        if let Some(source) = &self.source {
            source.detach();
        }
    }
}

impl_kernel_object!(Vmo, "Vmo", {
    fn on_zero_handles(&self) {
        if let Some(source) = &self.source {
            source.close();
        }
    }
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_vmo_zero_fills() {
        let vmo = Vmo::new(3 * PAGE_SIZE).unwrap();
        assert!(!vmo.is_committed(1));
        vmo.write(PAGE_SIZE - 2, b"abcd").unwrap();
        assert!(vmo.is_committed(0) && vmo.is_committed(1));
        assert!(!vmo.is_committed(2));

        let mut buf = [0xffu8; 6];
        vmo.read(PAGE_SIZE - 3, &mut buf).unwrap();
        assert_eq!(&buf, b"\0abcd\0");
    }

    #[test]
    fn bounds() {
        assert_eq!(Vmo::new(0).err(), Some(Status::InvalidArgs));
        let vmo = Vmo::new(PAGE_SIZE).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(vmo.read(PAGE_SIZE - 1, &mut buf), Err(Status::OutOfRange));
        assert_eq!(vmo.check_page_range(1, PAGE_SIZE as u64), Err(Status::InvalidArgs));
        assert_eq!(
            vmo.check_page_range(0, 2 * PAGE_SIZE as u64),
            Err(Status::OutOfRange)
        );
    }

    #[test]
    fn supply_skips_committed_pages() {
        let vmo = Vmo::new(2 * PAGE_SIZE).unwrap();
        vmo.write(0, b"keep").unwrap();
        let data = vec![7u8; 2 * PAGE_SIZE];
        vmo.supply_pages(0, &data).unwrap();

        let mut buf = [0u8; 4];
        vmo.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"keep");
        vmo.read(PAGE_SIZE, &mut buf).unwrap();
        assert_eq!(buf, [7; 4]);
    }
}
