/// 内核对象句柄
///
/// 句柄是内核对象的引用，用于在进程之间传递对象引用。
/// 每个句柄都有一个权限位，用于控制对对象的访问。
/// 句柄的创建和销毁维护对象的句柄计数：最后一个句柄销毁时调用
/// [`KernelObject::on_zero_handles`]。
use super::traits::{DowncastArc, KernelObject, Koid, Rights, Status};
use alloc::sync::Arc;
use core::fmt;

/// 内核对象句柄
pub struct Handle {
    /// 指向内核对象的引用计数指针
    object: Arc<dyn KernelObject>,
    /// 该句柄拥有的权限
    rights: Rights,
}

impl Handle {
    pub fn new(object: Arc<dyn KernelObject>, rights: Rights) -> Handle {
        object.base().increment_handle_count();
        Handle { object, rights }
    }

    /// 句柄计数已经由 [`KernelHandle`] 持有，直接接管
    fn from_counted(object: Arc<dyn KernelObject>, rights: Rights) -> Handle {
        Handle { object, rights }
    }

    pub fn object(&self) -> &Arc<dyn KernelObject> {
        &self.object
    }

    pub fn rights(&self) -> Rights {
        self.rights
    }

    pub fn koid(&self) -> Koid {
        self.object.koid()
    }

    /// 检查是否拥有指定权限
    pub fn check_rights(&self, required: Rights) -> Result<(), Status> {
        if self.rights.contains(required) {
            Ok(())
        } else {
            Err(Status::AccessDenied)
        }
    }

    /// 复制句柄（可选降低权限）
    pub fn duplicate(&self, new_rights: Rights) -> Result<Handle, Status> {
        self.check_rights(Rights::DUPLICATE)?;
        let rights = if new_rights.contains(Rights::SAME_RIGHTS) {
            self.rights
        } else if self.rights.contains(new_rights) {
            new_rights
        } else {
            return Err(Status::InvalidArgs);
        };
        Ok(Handle::new(self.object.clone(), rights))
    }

    /// 取得具体类型的对象
    pub fn dispatcher<T: KernelObject>(&self) -> Result<Arc<T>, Status> {
        self.object.clone().downcast_arc::<T>()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        // 句柄销毁时，对象句柄计数减1
        if self.object.base().decrement_handle_count() {
            self.object.on_zero_handles();
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("type", &self.object.type_name())
            .field("koid", &self.koid())
            .field("rights", &self.rights)
            .finish()
    }
}

/// 类型化的内核句柄
///
/// 对象创建函数返回它；它和 [`Handle`] 一样计入句柄计数，
/// 可以无损地转换成带权限的 [`Handle`]。
pub struct KernelHandle<T: KernelObject> {
    object: Option<Arc<T>>,
}

impl<T: KernelObject> KernelHandle<T> {
    pub fn new(object: Arc<T>) -> Self {
        object.base().increment_handle_count();
        Self { object: Some(object) }
    }

    pub fn dispatcher(&self) -> &Arc<T> {
        match &self.object {
            Some(object) => object,
            None => unreachable!("kernel handle used after release"),
        }
    }

    /// 转换为带权限的句柄，句柄计数不变
    pub fn into_handle(mut self, rights: Rights) -> Handle {
        match self.object.take() {
            Some(object) => Handle::from_counted(object, rights),
            None => unreachable!("kernel handle used after release"),
        }
    }
}

impl<T: KernelObject> Drop for KernelHandle<T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            if object.base().decrement_handle_count() {
                object.on_zero_handles();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::types::Event;

    #[test]
    fn last_handle_drop_reaches_zero() {
        let event = Arc::new(Event::new());
        let kh = KernelHandle::new(event.clone());
        assert_eq!(event.base().handle_count(), 1);

        let h = kh.into_handle(Rights::BASIC);
        assert_eq!(event.base().handle_count(), 1);

        let dup = h.duplicate(Rights::SAME_RIGHTS).unwrap();
        assert_eq!(event.base().handle_count(), 2);
        drop(h);
        drop(dup);
        assert_eq!(event.base().handle_count(), 0);
    }

    #[test]
    fn duplicate_cannot_gain_rights() {
        let h = KernelHandle::new(Arc::new(Event::new())).into_handle(Rights::DUPLICATE | Rights::WAIT);
        assert_eq!(h.duplicate(Rights::WRITE).unwrap_err(), Status::InvalidArgs);
        assert_eq!(h.duplicate(Rights::WAIT).unwrap().rights(), Rights::WAIT);

        let no_dup = h.duplicate(Rights::WAIT).unwrap();
        assert_eq!(no_dup.duplicate(Rights::WAIT).unwrap_err(), Status::AccessDenied);
    }

    #[test]
    fn dispatcher_checks_type() {
        let h = KernelHandle::new(Arc::new(Event::new())).into_handle(Rights::BASIC);
        assert!(h.dispatcher::<Event>().is_ok());
        assert_eq!(
            h.dispatcher::<crate::object::types::Port>().err(),
            Some(Status::WrongType)
        );
    }
}
