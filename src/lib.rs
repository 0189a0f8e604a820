//! jnl_core: 块设备上的预写日志引擎
//!
//! 这是一个纯 Rust 实现的文件系统日志库，旨在提供：
//! - **原子事务**：一组块修改要么全部重放，要么全部不重放
//! - **组提交**：小事务合并进同一次日志写入
//! - **异步写出**：日志写入和目标块写回在后台线程进行
//! - **崩溃重放**：打开时按块号排序合并后一次性写回
//!
//! # 示例
//!
//! ```rust,ignore
//! use jnl_core::{BlockDevice, BlockDev, Journal, JournalConfig, JournalFlags, Result};
//!
//! // 实现 BlockDevice trait
//! struct MyDevice {
//!     // ...
//! }
//!
//! impl BlockDevice for MyDevice {
//!     // 实现必要的方法
//!     // ...
//! }
//!
//! fn main() -> Result<()> {
//!     let jdev = BlockDev::new_partition(MyDevice::new(), 0, 1 << 20)?;
//!     let fsdev = BlockDev::new_partition(MyDevice::new(), 1 << 20, 64 << 20)?;
//!
//!     let jnl = Journal::open(jdev, fsdev, 0, JournalFlags::empty(), JournalConfig::default())?;
//!     // ...
//!     jnl.close()
//! }
//! ```
//!
//! # 模块结构
//!
//! - [`error`] - 错误类型定义
//! - [`block`] - 块设备抽象和 I/O 操作
//! - [`consts`] - 常量定义
//! - [`journal`] - 日志引擎

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

// ===== 核心模块 =====

/// 错误处理
pub mod error;

/// 块设备抽象
pub mod block;

/// 常量定义
pub mod consts;

/// 预写日志
pub mod journal;

/// CRC32 校验和计算
pub(crate) mod crc;

#[cfg(test)]
pub(crate) mod testing;

// ===== 公共导出 =====

// 错误处理
pub use error::{Error, ErrorKind, Result};

// 块设备
pub use block::{BlockDev, BlockDevice};

// Journal
pub use journal::{
    BlockBuf, EndWriteCallback, FlushMode, Journal, JournalConfig, JournalError, JournalFlags,
    JournalStats, ModifyToken, ReplayReport, TrimExtent, WritebackHint,
};
