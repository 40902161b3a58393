//! 启动配置
//!
//! 内核启动时用命令行调用一次 [`init`]；之后各子系统通过 [`options`]
//! 读取。没有调用 `init` 时使用默认值。

pub mod options;

use lazy_static::lazy_static;
use spin::RwLock;

pub use options::{BootOptionError, BootOptions};

lazy_static! {
    static ref BOOT_OPTIONS: RwLock<BootOptions> = RwLock::new(BootOptions::DEFAULT);
}

/// 解析启动命令行并替换当前选项；解析失败时保留原值
pub fn init(cmdline: &str) -> Result<(), BootOptionError> {
    match BootOptions::parse(cmdline) {
        Ok(parsed) => {
            *BOOT_OPTIONS.write() = parsed;
            log::info!(
                "boot: userpager overtime wait {}s, timeout {}s",
                parsed.userpager_overtime_wait_seconds,
                parsed.userpager_overtime_timeout_seconds
            );
            Ok(())
        }
        Err(err) => {
            log::error!("{}", err);
            Err(err)
        }
    }
}

/// 当前生效的选项
pub fn options() -> BootOptions {
    *BOOT_OPTIONS.read()
}
