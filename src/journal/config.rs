//! 日志配置
//!
//! 可调参数在打开或创建日志时一次性传入，不使用全局状态。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;

use crate::consts::*;

bitflags! {
    /// 打开日志时的行为标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct JournalFlags: u32 {
        /// 跳过重放，直接把日志视为空
        const RESET = 0x0001;
        /// 禁用组提交，每个事务结束时都立即刷新
        const NO_GROUP_COMMIT = 0x0002;
        /// 日志页和头部的写入放到后台线程完成
        const ASYNC_COMMIT = 0x0004;
        /// 不发出设备缓存刷新（设备没有易失写缓存时使用）
        ///
        /// 默认在事务页写完后、推进 end 的头部写出前后各刷新一次日志设备，
        /// 移动 start 的头部写出前刷新一次文件系统设备。
        const NO_CACHE_FLUSH = 0x0008;
    }
}

/// 刷新模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// 只保证日志本身已持久化
    Journal,
    /// 另外等待所有目标块写完，并刷新设备缓存
    Full,
}

/// 文件系统写回提示回调
///
/// 日志空间不足时调用，提示文件系统尽快完成在途写入。
pub type WritebackHint = Arc<dyn Fn() + Send + Sync>;

/// 日志配置
#[derive(Clone)]
pub struct JournalConfig {
    /// 事务缓冲区大小（一个块列表页及其负载的上限）
    pub tbuffer_size: u32,
    /// trim 扩展数达到此值时不再延迟提交
    pub trim_flush_limit: usize,
    /// 空间预留的最大重试次数
    pub reserve_retries: u32,
    /// 空间预留两次重试之间的等待
    pub reserve_wait: Duration,
    /// 重放遇到坏事务或 I/O 错误后的最大重试次数
    pub replay_retries: u32,
    /// 固定的随机种子，用于可复现的初始序列号
    pub sequence_seed: Option<u32>,
    /// 写回提示回调
    pub writeback_hint: Option<WritebackHint>,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            tbuffer_size: DEFAULT_TBUFFER_SIZE,
            trim_flush_limit: DEFAULT_TRIM_FLUSH_LIMIT,
            reserve_retries: DEFAULT_RESERVE_RETRIES,
            reserve_wait: Duration::from_millis(DEFAULT_RESERVE_WAIT_MS),
            replay_retries: DEFAULT_REPLAY_RETRIES,
            sequence_seed: None,
            writeback_hint: None,
        }
    }
}

impl JournalConfig {
    /// 根据主机内存大小计算事务缓冲区大小
    ///
    /// 内存不足 256 MiB 时使用默认值，之后每 256 MiB 增加一份默认值，
    /// 上限为 [`MAX_TBUFFER_SIZE`]。
    ///
    /// # 参数
    /// * `mem_bytes` - 主机物理内存字节数
    pub fn for_host_memory(mem_bytes: u64) -> Self {
        const STEP: u64 = 256 << 20;
        let factor = (mem_bytes / STEP).max(1);
        let tbuffer = (DEFAULT_TBUFFER_SIZE as u64 * factor).min(MAX_TBUFFER_SIZE as u64);
        Self {
            tbuffer_size: tbuffer as u32,
            ..Self::default()
        }
    }

    /// 设置写回提示回调
    pub fn with_writeback_hint<F>(mut self, hint: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.writeback_hint = Some(Arc::new(hint));
        self
    }
}

impl fmt::Debug for JournalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JournalConfig")
            .field("tbuffer_size", &self.tbuffer_size)
            .field("trim_flush_limit", &self.trim_flush_limit)
            .field("reserve_retries", &self.reserve_retries)
            .field("reserve_wait", &self.reserve_wait)
            .field("replay_retries", &self.replay_retries)
            .field("sequence_seed", &self.sequence_seed)
            .field("writeback_hint", &self.writeback_hint.is_some())
            .finish()
    }
}
