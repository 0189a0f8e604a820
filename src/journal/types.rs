//! 日志磁盘格式定义
//!
//! 这个模块定义日志区域中的两种磁盘结构以及环形区域的几何计算：
//!
//! - [`JournalHeader`]：位于日志区域偏移 0 的 48 字节头部
//! - [`BlockListHeader`]：每个事务页开头的块列表头，后跟 16 字节条目
//! - [`Geometry`]：日志区域的环形偏移运算
//!
//! # 字节序
//!
//! 写出时一律使用小端序。读取时若字节序标记读出来是反的，
//! 则整个头部按大端序解码，并要求重放时块列表页也按大端序解码。

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::checksum::calc_checksum;
use super::JournalError;
use crate::consts::*;

// =============================================================================
// Journal Header
// =============================================================================

/// 日志头
///
/// | 偏移 | 字段 |
/// |------|------|
/// | 0  | magic |
/// | 4  | endian |
/// | 8  | start |
/// | 16 | end |
/// | 24 | size |
/// | 32 | blhdr_size |
/// | 36 | checksum |
/// | 40 | jhdr_size |
/// | 44 | sequence_num |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    /// [`JOURNAL_HEADER_MAGIC`] 或旧格式 magic
    pub magic: u32,
    /// 字节序标记 [`ENDIAN_MAGIC`]
    pub endian: u32,
    /// 最老的未回收事务的起始偏移
    pub start: u64,
    /// 最后一个已持久化事务的结束偏移
    pub end: u64,
    /// 日志区域总字节数（含头部块）
    pub size: u64,
    /// 块列表页大小
    pub blhdr_size: u32,
    /// 头部校验和（计算时本字段视为 0）
    pub checksum: u32,
    /// 日志头所占字节数，同时也是日志的物理块大小
    pub jhdr_size: u32,
    /// 最后一个已提交事务的序列号
    pub sequence_num: u32,
}

/// 解码后的日志头以及它的来源格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedHeader {
    /// 按本机字节序解码后的头部
    pub header: JournalHeader,
    /// 磁盘上是大端序
    pub need_swap: bool,
    /// 旧格式（无头部校验和，无序列号）
    pub legacy: bool,
}

impl JournalHeader {
    /// 为一块全新的日志区域构造头部
    pub fn new(jhdr_size: u32, size: u64, blhdr_size: u32, sequence_num: u32) -> Self {
        let start = jhdr_size as u64;
        Self {
            magic: JOURNAL_HEADER_MAGIC,
            endian: ENDIAN_MAGIC,
            start,
            end: start,
            size,
            blhdr_size,
            checksum: 0,
            jhdr_size,
            sequence_num,
        }
    }

    /// 日志中没有待重放的事务
    pub fn is_clean(&self) -> bool {
        self.start == self.end
    }

    /// 编码为磁盘格式（小端序），并填入校验和
    pub fn to_bytes(&self) -> [u8; JOURNAL_HEADER_SIZE] {
        let mut buf = [0u8; JOURNAL_HEADER_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], JOURNAL_HEADER_MAGIC);
        LittleEndian::write_u32(&mut buf[4..8], ENDIAN_MAGIC);
        LittleEndian::write_u64(&mut buf[8..16], self.start);
        LittleEndian::write_u64(&mut buf[16..24], self.end);
        LittleEndian::write_u64(&mut buf[24..32], self.size);
        LittleEndian::write_u32(&mut buf[32..36], self.blhdr_size);
        LittleEndian::write_u32(&mut buf[40..44], self.jhdr_size);
        LittleEndian::write_u32(&mut buf[44..48], self.sequence_num);

        let cksum = calc_checksum(&buf[..JOURNAL_HEADER_CKSUM_SIZE]);
        LittleEndian::write_u32(&mut buf[36..40], cksum);
        buf
    }

    /// 从磁盘字节解码日志头
    ///
    /// 只校验 magic、字节序标记和头部校验和；几何边界由
    /// [`JournalHeader::validate`] 检查。
    pub fn decode(buf: &[u8]) -> Result<DecodedHeader, JournalError> {
        if buf.len() < JOURNAL_HEADER_SIZE {
            return Err(JournalError::BadMagic);
        }

        let le_magic = LittleEndian::read_u32(&buf[0..4]);
        let be_magic = BigEndian::read_u32(&buf[0..4]);
        let need_swap = if is_known_magic(le_magic) {
            false
        } else if is_known_magic(be_magic) {
            true
        } else {
            return Err(JournalError::BadMagic);
        };

        let header = if need_swap {
            Self::read_fields::<BigEndian>(buf)
        } else {
            Self::read_fields::<LittleEndian>(buf)
        };

        if header.endian != ENDIAN_MAGIC {
            return Err(JournalError::BadMagic);
        }

        let legacy = header.magic == OLD_JOURNAL_HEADER_MAGIC;
        if !legacy {
            let mut scratch = [0u8; JOURNAL_HEADER_CKSUM_SIZE];
            scratch.copy_from_slice(&buf[..JOURNAL_HEADER_CKSUM_SIZE]);
            scratch[36..40].fill(0);
            if calc_checksum(&scratch) != header.checksum {
                log::warn!(
                    "[JOURNAL] header checksum mismatch: stored {:#x}",
                    header.checksum
                );
                return Err(JournalError::BadChecksum);
            }
        }

        Ok(DecodedHeader {
            header,
            need_swap,
            legacy,
        })
    }

    fn read_fields<B: ByteOrder>(buf: &[u8]) -> Self {
        Self {
            magic: B::read_u32(&buf[0..4]),
            endian: B::read_u32(&buf[4..8]),
            start: B::read_u64(&buf[8..16]),
            end: B::read_u64(&buf[16..24]),
            size: B::read_u64(&buf[24..32]),
            blhdr_size: B::read_u32(&buf[32..36]),
            checksum: B::read_u32(&buf[36..40]),
            jhdr_size: B::read_u32(&buf[40..44]),
            sequence_num: B::read_u32(&buf[44..48]),
        }
    }

    /// 检查头部描述的几何是否落在日志区域内
    ///
    /// # 参数
    /// * `region_len` - 日志区域的实际字节数
    pub fn validate(&self, region_len: u64) -> Result<(), JournalError> {
        let jhdr = self.jhdr_size as u64;
        if !self.jhdr_size.is_power_of_two()
            || self.jhdr_size < MIN_PHYS_BLOCK_SIZE
            || self.jhdr_size > MAX_PHYS_BLOCK_SIZE
        {
            return Err(JournalError::BadGeometry);
        }
        if self.size < JOURNAL_MIN_BLOCKS * jhdr
            || self.size > region_len
            || self.size > JOURNAL_MAX_SIZE
            || self.size % jhdr != 0
        {
            return Err(JournalError::BadGeometry);
        }
        if self.start < jhdr || self.start >= self.size || self.end < jhdr || self.end >= self.size
        {
            return Err(JournalError::BadGeometry);
        }
        if self.blhdr_size == 0
            || self.blhdr_size % self.jhdr_size != 0
            || self.blhdr_size > MAX_TBUFFER_SIZE
        {
            return Err(JournalError::BadGeometry);
        }
        Ok(())
    }

    /// 头部对应的环形几何
    pub fn geometry(&self) -> Geometry {
        Geometry {
            jhdr_size: self.jhdr_size,
            size: self.size,
        }
    }
}

fn is_known_magic(magic: u32) -> bool {
    magic == JOURNAL_HEADER_MAGIC || magic == OLD_JOURNAL_HEADER_MAGIC
}

// =============================================================================
// Block List Header
// =============================================================================

bitflags! {
    /// 块列表页标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockListFlags: u32 {
        /// 条目中的校验和有效，重放时需要校验负载
        const CHECK_CHECKSUMS = 0x0001;
        /// 事务的第一页
        const FIRST_HEADER = 0x0002;
        /// 事务的最后一页
        const LAST_HEADER = 0x0004;
    }
}

/// 块条目
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockInfo {
    /// 文件系统块号（以 jhdr_size 为单位），被 kill 的条目为 [`KILLED_BLOCK`]
    pub bnum: u64,
    /// 负载 CRC32；条目 0 中存放事务序列号
    pub cksum: u32,
    /// 负载字节数
    pub bsize: u32,
}

impl BlockInfo {
    /// 条目是否已被 kill
    pub fn is_killed(&self) -> bool {
        self.bnum == KILLED_BLOCK
    }
}

/// 块列表页头
///
/// `binfo[0]` 是序列号条目，真正的块条目从下标 1 开始。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockListHeader {
    /// 页能容纳的条目数（含条目 0）
    pub max_blocks: u16,
    /// 已用条目数（含条目 0）
    pub num_blocks: u16,
    /// 页头加全部负载的字节数
    pub bytes_used: u32,
    /// 页校验和
    pub checksum: u32,
    /// 页标志
    pub flags: BlockListFlags,
    /// 全部条目，含条目 0
    pub binfo: Vec<BlockInfo>,
}

impl BlockListHeader {
    /// 事务序列号
    pub fn sequence(&self) -> u32 {
        self.binfo.first().map(|b| b.cksum).unwrap_or(0)
    }

    /// 真正的块条目（跳过条目 0）
    pub fn entries(&self) -> &[BlockInfo] {
        self.binfo.get(1..).unwrap_or(&[])
    }

    /// 校验和覆盖的字节数
    fn cksum_len(num_blocks: u16) -> usize {
        BLOCK_INFO_SIZE * (num_blocks as usize + 1)
    }

    /// 编码到 `buf` 开头（小端序），并填入页校验和
    ///
    /// `buf` 至少要容纳页头和全部条目。
    pub fn encode_into(&self, buf: &mut [u8]) {
        let num_blocks = self.binfo.len() as u16;
        LittleEndian::write_u16(&mut buf[0..2], self.max_blocks);
        LittleEndian::write_u16(&mut buf[2..4], num_blocks);
        LittleEndian::write_u32(&mut buf[4..8], self.bytes_used);
        LittleEndian::write_u32(&mut buf[8..12], 0);
        LittleEndian::write_u32(&mut buf[12..16], self.flags.bits());

        for (i, info) in self.binfo.iter().enumerate() {
            let off = BLHDR_FIXED_SIZE + i * BLOCK_INFO_SIZE;
            LittleEndian::write_u64(&mut buf[off..off + 8], info.bnum);
            LittleEndian::write_u32(&mut buf[off + 8..off + 12], info.cksum);
            LittleEndian::write_u32(&mut buf[off + 12..off + 16], info.bsize);
        }

        let cksum = calc_checksum(&buf[..Self::cksum_len(num_blocks)]);
        LittleEndian::write_u32(&mut buf[8..12], cksum);
    }

    /// 从磁盘字节解码并校验页校验和
    ///
    /// # 参数
    /// * `buf` - 整个块列表页（`blhdr_size` 字节）
    /// * `need_swap` - 按大端序解码
    pub fn decode(buf: &[u8], need_swap: bool) -> Result<Self, JournalError> {
        if need_swap {
            Self::decode_with::<BigEndian>(buf)
        } else {
            Self::decode_with::<LittleEndian>(buf)
        }
    }

    fn decode_with<B: ByteOrder>(buf: &[u8]) -> Result<Self, JournalError> {
        if buf.len() < BLHDR_FIXED_SIZE + BLOCK_INFO_SIZE {
            return Err(JournalError::BadGeometry);
        }
        let max_blocks = B::read_u16(&buf[0..2]);
        let num_blocks = B::read_u16(&buf[2..4]);
        let bytes_used = B::read_u32(&buf[4..8]);
        let checksum = B::read_u32(&buf[8..12]);
        let flags = BlockListFlags::from_bits_truncate(B::read_u32(&buf[12..16]));

        let cksum_len = Self::cksum_len(num_blocks);
        if num_blocks == 0 || num_blocks > max_blocks || cksum_len > buf.len() {
            return Err(JournalError::BadGeometry);
        }

        let mut scratch = buf[..cksum_len].to_vec();
        scratch[8..12].fill(0);
        if calc_checksum(&scratch) != checksum {
            return Err(JournalError::BadChecksum);
        }

        let binfo = (0..num_blocks as usize)
            .map(|i| {
                let off = BLHDR_FIXED_SIZE + i * BLOCK_INFO_SIZE;
                BlockInfo {
                    bnum: B::read_u64(&buf[off..off + 8]),
                    cksum: B::read_u32(&buf[off + 8..off + 12]),
                    bsize: B::read_u32(&buf[off + 12..off + 16]),
                }
            })
            .collect();

        Ok(Self {
            max_blocks,
            num_blocks,
            bytes_used,
            checksum,
            flags,
            binfo,
        })
    }
}

/// 一个块列表页能容纳的条目数（含条目 0）
pub fn max_blocks_for(blhdr_size: u32) -> u16 {
    let slots = (blhdr_size as usize - BLHDR_FIXED_SIZE) / BLOCK_INFO_SIZE;
    slots.min(u16::MAX as usize) as u16
}

// =============================================================================
// Geometry
// =============================================================================

/// 日志区域的环形几何
///
/// 偏移 `[0, jhdr_size)` 是头部，日志数据在 `[jhdr_size, size)` 中循环。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// 头部块大小，日志数据从这里开始
    pub jhdr_size: u32,
    /// 日志区域总字节数
    pub size: u64,
}

impl Geometry {
    /// 日志数据区的容量
    pub fn capacity(&self) -> u64 {
        self.size - self.jhdr_size as u64
    }

    /// 把越过区域末尾的偏移折回头部之后
    pub fn wrap(&self, off: u64) -> u64 {
        if off >= self.size {
            self.jhdr_size as u64 + (off - self.size)
        } else {
            off
        }
    }

    /// 从 `off` 向前推进 `len` 字节
    pub fn advance(&self, off: u64, len: u64) -> u64 {
        self.wrap(off + len)
    }

    /// `start` 与 `end` 之间还能写入的字节数
    pub fn free_space(&self, start: u64, end: u64) -> u64 {
        use core::cmp::Ordering;
        match start.cmp(&end) {
            Ordering::Less => (self.size - (end - start)).saturating_sub(self.jhdr_size as u64),
            Ordering::Greater => start - end,
            Ordering::Equal => self.capacity(),
        }
    }

    /// 从 `from` 向前走到 `to` 需要的字节数
    pub fn distance(&self, from: u64, to: u64) -> u64 {
        if to >= from {
            to - from
        } else {
            (self.size - from) + (to - self.jhdr_size as u64)
        }
    }
}
