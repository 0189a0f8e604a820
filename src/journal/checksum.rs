//! 日志头与块列表页的滚动校验和

/// 计算滚动校验和
///
/// 每个字节执行 `cksum = (cksum << 8) ^ (cksum + byte)`，最后取反。
/// 调用者负责在计算前把结构体中的校验和字段清零。
///
/// # 参数
/// * `data` - 参与计算的字节
///
/// # 返回
/// 校验和
pub fn calc_checksum(data: &[u8]) -> u32 {
    let mut cksum: u32 = 0;
    for &byte in data {
        cksum = (cksum << 8) ^ cksum.wrapping_add(byte as u32);
    }
    !cksum
}
