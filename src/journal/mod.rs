//! 预写日志引擎
//!
//! 文件系统把一组块修改作为一个事务交给日志。事务先完整地写进日志区域，
//! 日志头部推进之后，块才被写回它们在文件系统区域中的真实位置。
//! 崩溃后重新打开时，重放把所有已经完整写进日志的事务再应用一遍。
//!
//! # 架构概述
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Filesystem                           │
//! │  start_transaction / modify_block_* / end_transaction     │
//! └───────────────────────┬──────────────────────────────────┘
//!                         │
//!                         ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                   Journal (engine)                        │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐    │
//! │  │ Transaction  │  │   BlockBuf   │  │ ModifyToken  │    │
//! │  │   (trans)    │  │    (buf)     │  │    (buf)     │    │
//! │  └──────┬───────┘  └──────────────┘  └──────────────┘    │
//! │         ▼                                                 │
//! │  commit ──► space (reserve) ──► io (circular log)         │
//! │         │                                                 │
//! │         ▼                                                 │
//! │  writeback thread ──► completion (reclaim log space)      │
//! └───────────────────────┬──────────────────────────────────┘
//!                         │
//!                         ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                     Block Layer                           │
//! │           BlockDev (journal region / fs region)           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # 核心组件
//!
//! - [`types`] - 磁盘格式（日志头、块列表页）和环形几何
//! - [`Journal`] - 对外入口
//! - [`BlockBuf`] / [`ModifyToken`] - 块缓冲区和一次性修改令牌
//! - [`JournalConfig`] / [`JournalFlags`] - 可调参数和行为标志
//! - [`ReplayReport`] - 打开时的重放结果
//!
//! # 使用示例
//!
//! ```rust,ignore
//! use jnl_core::{BlockBuf, BlockDev, FlushMode, Journal, JournalConfig, JournalFlags};
//!
//! let jnl = Journal::open(jdev, fsdev, 0, JournalFlags::empty(), JournalConfig::default())?;
//!
//! jnl.start_transaction()?;
//! let buf = BlockBuf::zeroed(100, jnl.block_size() as usize);
//! let mut token = jnl.modify_block_start(&buf)?;
//! token.with_data_mut(|data| data[0] = 0x42);
//! jnl.modify_block_end(token, None)?;
//! jnl.end_transaction()?;
//!
//! jnl.flush(FlushMode::Full)?;
//! jnl.close()?;
//! ```

/// 磁盘格式与环形几何
pub mod types;

mod bucket;
mod buf;
mod checksum;
mod commit;
mod completion;
mod config;
mod engine;
mod gate;
mod io;
mod recovery;
mod space;
mod trans;
mod writeback;

// Re-exports
pub use buf::{BlockBuf, EndWriteCallback, ModifyToken};
pub use checksum::calc_checksum;
pub use config::{FlushMode, JournalConfig, JournalFlags, WritebackHint};
pub use engine::{Journal, JournalStats};
pub use recovery::ReplayReport;
pub use trans::TrimExtent;
pub use types::*;

/// 日志格式和状态错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalError {
    /// 日志头 magic 或字节序标记不对
    BadMagic,
    /// 日志头或块列表页校验和不对
    BadChecksum,
    /// 头部几何越界
    BadGeometry,
    /// 重放失败，卷不能挂载
    ReplayFailed,
    /// 空间不足
    NoSpace,
    /// 日志已失效
    Invalid,
}

impl core::fmt::Display for JournalError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            JournalError::BadMagic => write!(f, "Bad journal magic"),
            JournalError::BadChecksum => write!(f, "Bad journal checksum"),
            JournalError::BadGeometry => write!(f, "Journal geometry out of bounds"),
            JournalError::ReplayFailed => write!(f, "Journal replay failed"),
            JournalError::NoSpace => write!(f, "Journal has no space"),
            JournalError::Invalid => write!(f, "Journal is invalid"),
        }
    }
}
