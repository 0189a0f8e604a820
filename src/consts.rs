//! 日志引擎常量定义
//!
//! 这个模块包含日志磁盘格式与运行时调优相关的常量：
//! - 日志头 magic 与字节序标记
//! - 块列表页布局
//! - 区域大小边界
//! - 默认调优参数

//=============================================================================
// 日志头
//=============================================================================

/// 日志头 magic（'JNLx'）
pub const JOURNAL_HEADER_MAGIC: u32 = 0x4a4e_4c78;

/// 旧格式日志头 magic（'JHDR'），无校验和与序列号
pub const OLD_JOURNAL_HEADER_MAGIC: u32 = 0x4a48_4452;

/// 字节序标记
pub const ENDIAN_MAGIC: u32 = 0x1234_5678;

/// 日志头在磁盘上的字节数
pub const JOURNAL_HEADER_SIZE: usize = 48;

/// 日志头校验和覆盖的字节数（到 sequence_num 字段之前）
pub const JOURNAL_HEADER_CKSUM_SIZE: usize = 44;

//=============================================================================
// 块列表页
//=============================================================================

/// 块列表页头部字节数（不含条目）
pub const BLHDR_FIXED_SIZE: usize = 16;

/// 每个块条目的字节数
pub const BLOCK_INFO_SIZE: usize = 16;

/// 被 kill 的块条目使用的块号哨兵
pub const KILLED_BLOCK: u64 = u64::MAX;

//=============================================================================
// 区域边界
//=============================================================================

/// 最小物理块大小
pub const MIN_PHYS_BLOCK_SIZE: u32 = 512;

/// 最大物理块大小
pub const MAX_PHYS_BLOCK_SIZE: u32 = 65536;

/// 日志区域最少包含的物理块数
pub const JOURNAL_MIN_BLOCKS: u64 = 64;

/// 日志区域最大字节数（16 GiB）
pub const JOURNAL_MAX_SIZE: u64 = 16 << 30;

//=============================================================================
// 调优默认值
//=============================================================================

/// 默认事务缓冲区大小（一个块列表页连同其数据的上限）
pub const DEFAULT_TBUFFER_SIZE: u32 = 128 * 1024;

/// 事务缓冲区大小上限
pub const MAX_TBUFFER_SIZE: u32 = 1024 * 1024;

/// trim 扩展数达到该值时不再延迟提交
pub const DEFAULT_TRIM_FLUSH_LIMIT: usize = 100;

/// 空间预留的默认重试次数
pub const DEFAULT_RESERVE_RETRIES: u32 = 500;

/// 空间预留两次重试之间的默认等待（毫秒）
pub const DEFAULT_RESERVE_WAIT_MS: u64 = 10;

/// 重放失败后的默认重试次数
pub const DEFAULT_REPLAY_RETRIES: u32 = 3;

/// 空闲空间环的容量
pub const OLD_START_SLOTS: usize = 16;

/// 延迟提交时事务允许跨越的最大块列表页数（不含）
pub const GROUP_COMMIT_MAX_PAGES: usize = 3;
