//! CRC32 校验和计算
//!
//! 为块列表页中的每个数据块提供 CRC32 校验和。

/// 计算 CRC32 校验和（一次性计算）
///
/// # 参数
/// * `data` - 要计算校验和的数据
///
/// # 返回
/// CRC32 值
#[inline]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// 块数据校验和
///
/// 磁盘上 0 表示"未记录校验和"，因此真实结果为 0 时替换为 1。
#[inline]
pub fn block_crc(data: &[u8]) -> u32 {
    match crc32(data) {
        0 => 1,
        crc => crc,
    }
}
