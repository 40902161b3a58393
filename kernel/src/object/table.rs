// kernel/src/object/table.rs

use super::handle::Handle;
use super::traits::{KernelObject, Rights, Status};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// 句柄值
pub type HandleValue = usize;

/// 进程句柄表结构
pub struct HandleTable {
    /// 句柄到对象的映射
    handles: Mutex<Vec<Option<Handle>>>,
}

/// 进程句柄表实现
impl HandleTable {
    /// 最大句柄数 （默认1024）
    pub const MAX_HANDLES: usize = 1024;

    pub fn new() -> Self {
        let mut handles = Vec::with_capacity(Self::MAX_HANDLES);
        handles.resize_with(Self::MAX_HANDLES, || None);
        Self {
            handles: Mutex::new(handles),
        }
    }

    /// 添加句柄，返回句柄值
    pub fn add(&self, handle: Handle) -> Result<HandleValue, Status> {
        let mut handles = self.handles.lock();
        // 寻找空闲槽位
        match handles.iter().position(|slot| slot.is_none()) {
            Some(idx) => {
                handles[idx] = Some(handle);
                Ok(idx)
            }
            None => Err(Status::NoResources),
        }
    }

    /// 获取对象并检查权限与类型（不取出句柄）
    pub fn get_dispatcher<T: KernelObject>(
        &self,
        value: HandleValue,
        required: Rights,
    ) -> Result<Arc<T>, Status> {
        let handles = self.handles.lock();
        let handle = handles
            .get(value)
            .and_then(|h| h.as_ref())
            .ok_or(Status::BadHandle)?;
        let object = handle.dispatcher::<T>()?;
        handle.check_rights(required)?;
        Ok(object)
    }

    /// 查看句柄的权限
    pub fn rights(&self, value: HandleValue) -> Result<Rights, Status> {
        let handles = self.handles.lock();
        handles
            .get(value)
            .and_then(|h| h.as_ref())
            .map(Handle::rights)
            .ok_or(Status::BadHandle)
    }

    pub fn contains(&self, value: HandleValue) -> bool {
        matches!(self.handles.lock().get(value), Some(Some(_)))
    }

    /// 移除句柄（取出所有权）
    pub fn remove(&self, value: HandleValue) -> Result<Handle, Status> {
        let mut handles = self.handles.lock();
        handles
            .get_mut(value)
            .and_then(Option::take)
            .ok_or(Status::BadHandle)
    }

    /// 原子地移除一组句柄：任何一个无效、重复或缺少 `required` 权限时不移除任何句柄
    pub fn remove_many(
        &self,
        values: &[HandleValue],
        required: Rights,
    ) -> Result<Vec<Handle>, Status> {
        let mut handles = self.handles.lock();
        for (i, value) in values.iter().enumerate() {
            if values[..i].contains(value) {
                return Err(Status::BadHandle);
            }
            let handle = handles
                .get(*value)
                .and_then(|h| h.as_ref())
                .ok_or(Status::BadHandle)?;
            handle.check_rights(required)?;
        }
        Ok(values
            .iter()
            .filter_map(|value| handles[*value].take())
            .collect())
    }

    /// 把句柄放回原来的槽位（发送失败时归还调用者）
    pub fn restore(&self, value: HandleValue, handle: Handle) -> Result<(), Status> {
        let mut handles = self.handles.lock();
        match handles.get_mut(value) {
            Some(slot @ None) => {
                *slot = Some(handle);
                Ok(())
            }
            Some(Some(_)) => Err(Status::AlreadyExists),
            None => Err(Status::OutOfRange),
        }
    }

    /// 当前句柄数量
    pub fn len(&self) -> usize {
        self.handles.lock().iter().filter(|h| h.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::types::Event;
    use crate::object::KernelHandle;

    fn event_handle(rights: Rights) -> Handle {
        KernelHandle::new(Arc::new(Event::new())).into_handle(rights)
    }

    #[test]
    fn add_remove_restore() {
        let table = HandleTable::new();
        let v = table.add(event_handle(Rights::BASIC)).unwrap();
        assert!(table.contains(v));

        let h = table.remove(v).unwrap();
        assert!(!table.contains(v));
        assert_eq!(table.remove(v).unwrap_err(), Status::BadHandle);

        table.restore(v, h).unwrap();
        assert!(table.contains(v));
        assert_eq!(
            table.restore(v, event_handle(Rights::BASIC)).unwrap_err(),
            Status::AlreadyExists
        );
    }

    #[test]
    fn remove_many_is_all_or_nothing() {
        let table = HandleTable::new();
        let a = table.add(event_handle(Rights::BASIC)).unwrap();
        let b = table.add(event_handle(Rights::WAIT)).unwrap();

        assert_eq!(
            table.remove_many(&[a, b], Rights::TRANSFER).unwrap_err(),
            Status::AccessDenied
        );
        assert_eq!(table.remove_many(&[a, a], Rights::TRANSFER).unwrap_err(), Status::BadHandle);
        assert_eq!(table.len(), 2);

        let taken = table.remove_many(&[a], Rights::TRANSFER).unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn get_dispatcher_checks_rights() {
        let table = HandleTable::new();
        let v = table.add(event_handle(Rights::WAIT)).unwrap();
        assert!(table.get_dispatcher::<Event>(v, Rights::WAIT).is_ok());
        assert_eq!(
            table.get_dispatcher::<Event>(v, Rights::WRITE).err(),
            Some(Status::AccessDenied)
        );
        assert_eq!(
            table.get_dispatcher::<Event>(999, Rights::WAIT).err(),
            Some(Status::BadHandle)
        );
    }
}
