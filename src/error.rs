//! 错误类型定义
//!
//! 提供日志引擎操作的错误类型。
//!
//! 不可恢复的编程错误（非 owner 线程操作事务、令牌重复使用、内部计数损坏）
//! 不走 `Result`，而是直接 `panic!`。

use core::fmt;

/// 日志操作错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: &'static str,
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// I/O 错误
    Io,
    /// 无效参数
    InvalidInput,
    /// 磁盘格式错误（magic、校验和或边界不合法）
    Format,
    /// 内存分配失败
    NoMemory,
    /// 日志空间不足
    NoSpace,
    /// 日志已失效，需要关闭并重新打开（触发重放）
    Invalid,
    /// 不支持的操作
    Unsupported,
}

impl Error {
    /// 创建新错误
    pub const fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self { kind, message }
    }

    /// 获取错误类型
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 获取错误消息
    pub const fn message(&self) -> &'static str {
        self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

// Journal error conversion
impl From<crate::journal::JournalError> for Error {
    fn from(err: crate::journal::JournalError) -> Self {
        use crate::journal::JournalError;
        match err {
            JournalError::BadMagic => Error::new(ErrorKind::Format, "Bad journal header magic"),
            JournalError::BadChecksum => Error::new(ErrorKind::Format, "Bad journal header checksum"),
            JournalError::BadGeometry => Error::new(ErrorKind::Format, "Journal header out of bounds"),
            JournalError::ReplayFailed => Error::new(ErrorKind::Format, "Journal replay failed"),
            JournalError::NoSpace => Error::new(ErrorKind::NoSpace, "Journal has no space"),
            JournalError::Invalid => Error::new(ErrorKind::Invalid, "Journal is invalid"),
        }
    }
}

/// Result 类型别名
pub type Result<T> = core::result::Result<T, Error>;
