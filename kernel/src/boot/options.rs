//! 启动命令行选项
//!
//! 命令行是空格分隔的 `key=value` 列表；不认识的键被忽略，留给其他子系统。

use core::fmt;
use core::time::Duration;

pub const USERPAGER_OVERTIME_WAIT_SECONDS: &str = "kernel.userpager.overtime_wait_seconds";
pub const USERPAGER_OVERTIME_TIMEOUT_SECONDS: &str = "kernel.userpager.overtime_timeout_seconds";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootOptions {
    /// 分页请求超过这个时间未完成时打印告警，0 关闭
    pub userpager_overtime_wait_seconds: u64,
    /// 分页请求超过这个时间未完成时失败，0 关闭
    pub userpager_overtime_timeout_seconds: u64,
}

impl BootOptions {
    pub const DEFAULT: BootOptions = BootOptions {
        userpager_overtime_wait_seconds: 20,
        userpager_overtime_timeout_seconds: 300,
    };

    /// 解析命令行，未出现的选项取默认值
    pub fn parse(cmdline: &str) -> Result<Self, BootOptionError> {
        let mut options = Self::DEFAULT;
        for token in cmdline.split_ascii_whitespace() {
            let (key, value) = token.split_once('=').unwrap_or((token, ""));
            match key {
                USERPAGER_OVERTIME_WAIT_SECONDS => {
                    options.userpager_overtime_wait_seconds =
                        parse_seconds(USERPAGER_OVERTIME_WAIT_SECONDS, value)?;
                }
                USERPAGER_OVERTIME_TIMEOUT_SECONDS => {
                    options.userpager_overtime_timeout_seconds =
                        parse_seconds(USERPAGER_OVERTIME_TIMEOUT_SECONDS, value)?;
                }
                _ => {}
            }
        }
        Ok(options)
    }

    pub fn userpager_overtime_wait(&self) -> Duration {
        Duration::from_secs(self.userpager_overtime_wait_seconds)
    }

    pub fn userpager_overtime_timeout(&self) -> Duration {
        Duration::from_secs(self.userpager_overtime_timeout_seconds)
    }
}

impl Default for BootOptions {
    fn default() -> Self {
        Self::DEFAULT
    }
}

fn parse_seconds(key: &'static str, value: &str) -> Result<u64, BootOptionError> {
    if value.is_empty() {
        return Err(BootOptionError::MissingValue { key });
    }
    value
        .parse()
        .map_err(|_| BootOptionError::InvalidNumber { key })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOptionError {
    MissingValue { key: &'static str },
    InvalidNumber { key: &'static str },
}

impl fmt::Display for BootOptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootOptionError::MissingValue { key } => write!(f, "boot option {key}: missing value"),
            BootOptionError::InvalidNumber { key } => {
                write!(f, "boot option {key}: expected a number of seconds")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = BootOptions::parse("").unwrap();
        assert_eq!(options, BootOptions::DEFAULT);
        assert_eq!(options.userpager_overtime_wait(), Duration::from_secs(20));
        assert_eq!(options.userpager_overtime_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn overrides_and_ignores_unknown() {
        let options = BootOptions::parse(
            "console=uart kernel.userpager.overtime_wait_seconds=0 \
             kernel.userpager.overtime_timeout_seconds=7 quiet",
        )
        .unwrap();
        assert_eq!(options.userpager_overtime_wait_seconds, 0);
        assert_eq!(options.userpager_overtime_timeout_seconds, 7);
    }

    #[test]
    fn rejects_bad_numbers() {
        assert_eq!(
            BootOptions::parse("kernel.userpager.overtime_wait_seconds=soon"),
            Err(BootOptionError::InvalidNumber {
                key: USERPAGER_OVERTIME_WAIT_SECONDS
            })
        );
        assert_eq!(
            BootOptions::parse("kernel.userpager.overtime_timeout_seconds"),
            Err(BootOptionError::MissingValue {
                key: USERPAGER_OVERTIME_TIMEOUT_SECONDS
            })
        );
    }
}
