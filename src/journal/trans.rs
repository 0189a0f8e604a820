//! 事务缓冲区
//!
//! 一个事务由若干块列表页组成，每页最多 `tbuffer_size` 字节（页头加负载）。
//! 当前页放不下新块时追加一页。提交时把每页编码成磁盘映像，
//! 同时拷贝每个缓冲区此刻的内容并计算块校验和。

use crate::consts::*;
use crate::crc::block_crc;
use crate::error::{Error, ErrorKind, Result};

use super::buf::{BlockBuf, EndWriteCallback};
use super::types::{max_blocks_for, BlockInfo, BlockListFlags, BlockListHeader};

/// 事务中的一个块
pub(crate) struct BlockEntry {
    /// `None` 表示已被 kill，只保留负载空间
    pub(crate) buf: Option<BlockBuf>,
    pub(crate) bnum: u64,
    pub(crate) bsize: u32,
    pub(crate) hook: Option<EndWriteCallback>,
}

/// 块列表页
pub(crate) struct BlockListPage {
    pub(crate) entries: Vec<BlockEntry>,
    /// 页头加负载的字节数
    pub(crate) bytes_used: u32,
}

/// trim 扩展（文件系统区域内的字节范围）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimExtent {
    /// 文件系统区域中的字节偏移
    pub offset: u64,
    /// 字节数
    pub length: u64,
}

impl TrimExtent {
    fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// 一个等待写回目标位置的块
pub(crate) struct PendingWrite {
    pub(crate) bnum: u64,
    pub(crate) data: Vec<u8>,
    pub(crate) hook: Option<EndWriteCallback>,
}

/// 提交映像
///
/// 由 [`Transaction::seal`] 生成，包含写入日志的页和随后写回的块。
pub(crate) struct CommitImage {
    pub(crate) pages: Vec<Vec<u8>>,
    pub(crate) writes: Vec<PendingWrite>,
    pub(crate) bufs: Vec<BlockBuf>,
    pub(crate) trims: Vec<TrimExtent>,
    /// 页在日志中占用的总字节数
    pub(crate) total_bytes: u64,
    /// 不需要写回的字节数（页头加被 kill 的负载）
    pub(crate) pre_flushed: u64,
}

/// 事务
pub(crate) struct Transaction {
    pub(crate) id: u64,
    pub(crate) pages: Vec<BlockListPage>,
    blhdr_size: u32,
    tbuffer_size: u32,
    /// 每页可用的块条目数（不含条目 0）
    max_entries: usize,
    /// 所有页的 bytes_used 之和
    pub(crate) total_bytes: u64,
    /// 被 kill 的负载字节数
    pub(crate) num_killed: u64,
    pub(crate) trims: Vec<TrimExtent>,
    /// 请求不延迟提交
    pub(crate) force: bool,
}

impl Transaction {
    pub(crate) fn new(id: u64, blhdr_size: u32, tbuffer_size: u32) -> Self {
        Self {
            id,
            pages: Vec::new(),
            blhdr_size,
            tbuffer_size,
            max_entries: max_blocks_for(blhdr_size) as usize - 1,
            total_bytes: 0,
            num_killed: 0,
            trims: Vec::new(),
            force: false,
        }
    }

    /// 事务中没有任何块和 trim
    pub(crate) fn is_empty(&self) -> bool {
        self.pages.is_empty() && self.trims.is_empty()
    }

    /// 块条目数（含被 kill 的）
    pub(crate) fn num_blocks(&self) -> usize {
        self.pages.iter().map(|p| p.entries.len()).sum()
    }

    /// 单个块允许的最大字节数
    pub(crate) fn max_block_size(&self) -> u32 {
        self.tbuffer_size - self.blhdr_size
    }

    pub(crate) fn find(&self, buf: &BlockBuf) -> Option<(usize, usize)> {
        self.pages.iter().enumerate().find_map(|(pi, page)| {
            page.entries
                .iter()
                .position(|e| e.buf.as_ref().map_or(false, |b| b.same(buf)))
                .map(|ei| (pi, ei))
        })
    }

    /// 登记一个块
    ///
    /// 已在事务中的块只更新回调。
    ///
    /// # 参数
    /// * `buf` - 缓冲区
    /// * `hook` - 写回完成回调
    /// * `capacity` - 日志数据区容量，事务总大小必须小于它
    pub(crate) fn add_block(
        &mut self,
        buf: &BlockBuf,
        hook: Option<EndWriteCallback>,
        capacity: u64,
    ) -> Result<()> {
        if let Some((pi, ei)) = self.find(buf) {
            if hook.is_some() {
                self.pages[pi].entries[ei].hook = hook;
            }
            return Ok(());
        }

        let bsize = buf.len() as u32;
        let fits = self.pages.last().map_or(false, |p| {
            p.entries.len() < self.max_entries && p.bytes_used + bsize <= self.tbuffer_size
        });
        let growth = if fits {
            bsize as u64
        } else {
            (self.blhdr_size + bsize) as u64
        };
        if self.total_bytes + growth >= capacity {
            return Err(Error::new(
                ErrorKind::NoSpace,
                "Transaction exceeds journal capacity",
            ));
        }

        if !fits {
            self.pages.push(BlockListPage {
                entries: Vec::new(),
                bytes_used: self.blhdr_size,
            });
        }
        let page = self
            .pages
            .last_mut()
            .ok_or(Error::new(ErrorKind::NoMemory, "No block list page"))?;
        page.entries.push(BlockEntry {
            buf: Some(buf.clone()),
            bnum: buf.blkno(),
            bsize,
            hook,
        });
        page.bytes_used += bsize;
        self.total_bytes += growth;
        Ok(())
    }

    /// kill 一个已登记的块：条目保留，块号换成哨兵
    ///
    /// # 返回
    /// 块是否在事务中
    pub(crate) fn kill(&mut self, buf: &BlockBuf) -> bool {
        let Some((pi, ei)) = self.find(buf) else {
            return false;
        };
        let entry = &mut self.pages[pi].entries[ei];
        entry.buf = None;
        entry.bnum = KILLED_BLOCK;
        entry.hook = None;
        self.num_killed += entry.bsize as u64;
        true
    }

    /// 组提交判定：可以延迟到下一个事务一起写出
    pub(crate) fn should_defer(&self, no_group_commit: bool, trim_flush_limit: usize) -> bool {
        if self.force || no_group_commit {
            return false;
        }
        if self.pages.len() >= GROUP_COMMIT_MAX_PAGES {
            return false;
        }
        let last_used = self.pages.last().map_or(0, |p| p.bytes_used);
        if last_used >= self.tbuffer_size - self.tbuffer_size / 8 {
            return false;
        }
        self.trims.len() < trim_flush_limit
    }

    // ===== trim 扩展 =====

    /// 记录一段被释放的范围，与相邻或重叠的扩展合并
    pub(crate) fn add_trim(&mut self, offset: u64, length: u64) {
        merge_extent(&mut self.trims, offset, length);
    }

    /// 从 trim 列表中移除一段重新被分配的范围
    pub(crate) fn remove_trim(&mut self, offset: u64, length: u64) {
        remove_extent(&mut self.trims, offset, length);
    }

    // ===== 提交 =====

    /// 把事务编码成提交映像
    ///
    /// 每页的条目 0 存放序列号；每个活块的当前内容拷贝进页里并计算 CRC32。
    pub(crate) fn seal(&mut self, sequence_num: u32) -> Result<CommitImage> {
        let blhdr = self.blhdr_size as usize;
        let max_blocks = max_blocks_for(self.blhdr_size);
        let last = self.pages.len().saturating_sub(1);

        let mut images = Vec::with_capacity(self.pages.len());
        let mut writes = Vec::new();
        let mut bufs = Vec::new();

        for (pi, page) in self.pages.iter_mut().enumerate() {
            let mut img = Vec::new();
            img.try_reserve_exact(page.bytes_used as usize)
                .map_err(|_| Error::new(ErrorKind::NoMemory, "Cannot allocate block list page"))?;
            img.resize(page.bytes_used as usize, 0);

            let mut flags = BlockListFlags::CHECK_CHECKSUMS;
            if pi == 0 {
                flags |= BlockListFlags::FIRST_HEADER;
            }
            if pi == last {
                flags |= BlockListFlags::LAST_HEADER;
            }

            let mut binfo = Vec::with_capacity(page.entries.len() + 1);
            binfo.push(BlockInfo {
                bnum: 0,
                cksum: sequence_num,
                bsize: 0,
            });

            let mut off = blhdr;
            for entry in page.entries.iter_mut() {
                let len = entry.bsize as usize;
                let payload = &mut img[off..off + len];
                let cksum = match &entry.buf {
                    Some(buf) => {
                        buf.copy_into(payload);
                        writes.push(PendingWrite {
                            bnum: entry.bnum,
                            data: payload.to_vec(),
                            hook: entry.hook.take(),
                        });
                        bufs.push(buf.clone());
                        block_crc(payload)
                    }
                    None => 0,
                };
                binfo.push(BlockInfo {
                    bnum: entry.bnum,
                    cksum,
                    bsize: entry.bsize,
                });
                off += len;
            }

            BlockListHeader {
                max_blocks,
                num_blocks: binfo.len() as u16,
                bytes_used: page.bytes_used,
                checksum: 0,
                flags,
                binfo,
            }
            .encode_into(&mut img[..blhdr]);
            images.push(img);
        }

        Ok(CommitImage {
            pre_flushed: (self.pages.len() * blhdr) as u64 + self.num_killed,
            total_bytes: self.total_bytes,
            pages: images,
            writes,
            bufs,
            trims: core::mem::take(&mut self.trims),
        })
    }

    /// 放弃事务：解锁所有缓冲区，回调收到错误
    pub(crate) fn abort(self, reason: Error) {
        log::debug!(
            "[COMMIT] aborting transaction {} with {} blocks",
            self.id,
            self.num_blocks()
        );
        for page in self.pages {
            for entry in page.entries {
                if let Some(buf) = entry.buf {
                    buf.unlock();
                }
                if let Some(hook) = entry.hook {
                    hook(Err(reason.clone()));
                }
            }
        }
    }
}

/// 把 `[offset, offset + length)` 并入按偏移排序的扩展列表
pub(crate) fn merge_extent(list: &mut Vec<TrimExtent>, offset: u64, length: u64) {
    if length == 0 {
        return;
    }
    let mut merged = TrimExtent { offset, length };
    let first = list.partition_point(|t| t.end() < offset);
    let mut last = first;
    while last < list.len() && list[last].offset <= merged.end() {
        let t = list[last];
        let start = t.offset.min(merged.offset);
        let end = t.end().max(merged.end());
        merged = TrimExtent {
            offset: start,
            length: end - start,
        };
        last += 1;
    }
    list.splice(first..last, [merged]);
}

/// 从扩展列表中挖掉 `[offset, offset + length)`
pub(crate) fn remove_extent(list: &mut Vec<TrimExtent>, offset: u64, length: u64) {
    if length == 0 {
        return;
    }
    let end = offset + length;
    let first = list.partition_point(|t| t.end() <= offset);
    let mut last = first;
    while last < list.len() && list[last].offset < end {
        last += 1;
    }
    if first == last {
        return;
    }

    let mut keep = Vec::with_capacity(2);
    let head = list[first];
    if head.offset < offset {
        keep.push(TrimExtent {
            offset: head.offset,
            length: offset - head.offset,
        });
    }
    let tail = list[last - 1];
    if tail.end() > end {
        keep.push(TrimExtent {
            offset: end,
            length: tail.end() - end,
        });
    }
    list.splice(first..last, keep);
}
