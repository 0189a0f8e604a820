//! 日志重放
//!
//! 挂载时执行一次，状态机如下：
//!
//! ```text
//! Scanning ──► Applying ──► Finalizing ──► Done
//!    │  ▲          │
//!    │  └──retry───┘
//!    └──► Failed
//! ```
//!
//! - `Scanning`：从 `start` 扫描到 `end`，随后越过 `end` 继续推测性扫描，
//!   找回已写入日志但头部尚未更新的事务。每个完整事务的块条目插入合并表。
//! - `Applying`：把合并表中每一项从日志读出，写到文件系统区域。
//! - `Finalizing`：写一个 `start == end` 的干净头部。
//!
//! `[start, end)` 内出现坏事务时，若之前已有完好事务，就以最后一个完好
//! 边界作为新的 `end` 重新扫描；否则重放失败。读错误同样退回到最后一个
//! 完好边界重试，写回错误按原计划重试，重试次数有上限。

use crate::block::{BlockDev, BlockDevice};
use crate::consts::JOURNAL_HEADER_MAGIC;
use crate::crc::block_crc;
use crate::error::{Error, Result};

use super::bucket::{Bucket, BucketTable};
use super::io::JournalIo;
use super::types::{
    BlockInfo, BlockListFlags, BlockListHeader, DecodedHeader, Geometry, JournalHeader,
};
use super::JournalError;

/// 一次重放的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplayReport {
    /// 重放的事务数（含推测扫描找回的）
    pub transactions: u32,
    /// 越过头部记录的 `end` 找回的事务数
    pub extra_transactions: u32,
    /// 合并后实际写回的范围数
    pub buckets: usize,
    /// 使用的重试次数
    pub retries: u32,
    /// 重放后的日志起点（等于终点）
    pub end: u64,
    /// 重放后的序列号
    pub sequence_num: u32,
}

struct ScanPlan {
    end: u64,
    speculative: bool,
}

struct ScanOutcome {
    table: BucketTable,
    /// 最后一个完整事务之后的偏移
    end: u64,
    last_seq: u32,
    transactions: u32,
    extra: u32,
}

enum ScanStop {
    Complete(ScanOutcome),
    /// `[start, end)` 内的坏事务；`good_end` 为最后一个完好事务的终点
    BadTxn { good_end: Option<u64> },
    /// `[start, end)` 内的读错误
    Io { err: Error, good_end: Option<u64> },
}

#[derive(Debug)]
enum Fault {
    Io(Error),
    Bad(&'static str),
}

struct ScannedPage {
    header: BlockListHeader,
    buckets: Vec<Bucket>,
}

enum ReplayState {
    Scanning(ScanPlan),
    Applying(ScanOutcome, ScanPlan),
    Finalizing(ScanOutcome),
    Done(JournalHeader, ReplayReport),
    Failed,
}

pub(crate) struct Replay<'a, D: BlockDevice> {
    jio: &'a JournalIo<D>,
    fsdev: &'a mut BlockDev<D>,
    hdr: JournalHeader,
    need_swap: bool,
    legacy: bool,
    max_retries: u32,
    retries: u32,
}

impl<'a, D: BlockDevice> Replay<'a, D> {
    pub(crate) fn new(
        jio: &'a JournalIo<D>,
        fsdev: &'a mut BlockDev<D>,
        decoded: &DecodedHeader,
        max_retries: u32,
    ) -> Self {
        Self {
            jio,
            fsdev,
            hdr: decoded.header,
            need_swap: decoded.need_swap,
            legacy: decoded.legacy,
            max_retries,
            retries: 0,
        }
    }

    /// 运行状态机
    ///
    /// # 返回
    /// 写回磁盘的新头部和重放报告
    pub(crate) fn run(mut self) -> Result<(JournalHeader, ReplayReport)> {
        log::info!(
            "[REPLAY] start={:#x} end={:#x} seq={} swap={} legacy={}",
            self.hdr.start,
            self.hdr.end,
            self.hdr.sequence_num,
            self.need_swap,
            self.legacy
        );

        // 旧格式没有序列号，无法判断 end 之后的页是否属于新事务
        let mut state = ReplayState::Scanning(ScanPlan {
            end: self.hdr.end,
            speculative: !self.legacy,
        });
        loop {
            state = match state {
                ReplayState::Scanning(plan) => match self.scan(&plan) {
                    ScanStop::Complete(outcome) => ReplayState::Applying(outcome, plan),
                    ScanStop::BadTxn { good_end: None } => {
                        log::error!("[REPLAY] first transaction in the log is corrupt");
                        ReplayState::Failed
                    }
                    ScanStop::BadTxn {
                        good_end: Some(good),
                    } => {
                        log::warn!("[REPLAY] truncating log at last good boundary {:#x}", good);
                        self.retry(ScanPlan {
                            end: good,
                            speculative: false,
                        })
                    }
                    ScanStop::Io { err, good_end } => {
                        log::warn!("[REPLAY] read error while scanning: {}", err);
                        match good_end {
                            Some(good) => self.retry(ScanPlan {
                                end: good,
                                speculative: false,
                            }),
                            None => self.retry(plan),
                        }
                    }
                },
                ReplayState::Applying(outcome, plan) => match self.apply(&outcome) {
                    Ok(()) => ReplayState::Finalizing(outcome),
                    Err(err) => {
                        log::warn!("[REPLAY] error while applying blocks: {}", err);
                        self.retry(plan)
                    }
                },
                ReplayState::Finalizing(outcome) => {
                    let hdr = self.finalize(&outcome)?;
                    let report = ReplayReport {
                        transactions: outcome.transactions,
                        extra_transactions: outcome.extra,
                        buckets: outcome.table.len(),
                        retries: self.retries,
                        end: hdr.end,
                        sequence_num: hdr.sequence_num,
                    };
                    ReplayState::Done(hdr, report)
                }
                ReplayState::Done(hdr, report) => {
                    log::info!(
                        "[REPLAY] done: {} transactions ({} past end), {} ranges, {} retries",
                        report.transactions,
                        report.extra_transactions,
                        report.buckets,
                        report.retries
                    );
                    return Ok((hdr, report));
                }
                ReplayState::Failed => return Err(JournalError::ReplayFailed.into()),
            };
        }
    }

    fn retry(&mut self, plan: ScanPlan) -> ReplayState {
        if self.retries >= self.max_retries {
            log::error!("[REPLAY] giving up after {} retries", self.retries);
            return ReplayState::Failed;
        }
        self.retries += 1;
        ReplayState::Scanning(plan)
    }

    // ===== Scanning =====

    fn scan(&self, plan: &ScanPlan) -> ScanStop {
        let geo = self.hdr.geometry();
        let blhdr = self.hdr.blhdr_size as u64;
        let mut page = vec![0u8; self.hdr.blhdr_size as usize];

        let mut cursor = self.hdr.start;
        let mut last_seq = if self.hdr.is_clean() {
            self.hdr.sequence_num
        } else {
            0
        };
        let mut table = BucketTable::new();
        let mut pending: Vec<Bucket> = Vec::new();
        let mut good_end = None;
        let mut committed_end = self.hdr.start;
        let mut in_range = cursor != plan.end;
        let mut transactions = 0u32;
        let mut extra = 0u32;

        loop {
            if in_range && cursor == plan.end {
                if !pending.is_empty() {
                    log::warn!("[REPLAY] transaction runs past end {:#x}", plan.end);
                    return ScanStop::BadTxn { good_end };
                }
                in_range = false;
            }
            if !in_range && (!plan.speculative || geo.free_space(self.hdr.start, cursor) <= blhdr) {
                break;
            }

            let limit = if in_range {
                geo.distance(cursor, plan.end)
            } else {
                geo.free_space(self.hdr.start, cursor) - 1
            };
            let scanned = match self.examine(&geo, cursor, limit, &mut page) {
                Ok(scanned) => scanned,
                Err(Fault::Io(err)) if in_range => return ScanStop::Io { err, good_end },
                Err(Fault::Bad(what)) if in_range => {
                    log::warn!("[REPLAY] bad {} at {:#x}", what, cursor);
                    return ScanStop::BadTxn { good_end };
                }
                Err(fault) => {
                    log::debug!("[REPLAY] speculative scan stops at {:#x}: {:?}", cursor, fault);
                    break;
                }
            };

            let flags = scanned.header.flags;
            let seq = scanned.header.sequence();
            let mut broken = !self.legacy
                && last_seq != 0
                && seq != 0
                && seq != last_seq
                && seq != last_seq.wrapping_add(1);
            if !self.legacy && !in_range && seq == 0 {
                broken = true;
            }
            if flags.contains(BlockListFlags::FIRST_HEADER) && !pending.is_empty() {
                broken = true;
            }
            if broken {
                if in_range {
                    log::warn!(
                        "[REPLAY] sequence break at {:#x}: {} after {}",
                        cursor,
                        seq,
                        last_seq
                    );
                    return ScanStop::BadTxn { good_end };
                }
                log::debug!(
                    "[REPLAY] speculative scan stops at {:#x}: seq {} after {}",
                    cursor,
                    seq,
                    last_seq
                );
                break;
            }
            if !self.legacy && seq != 0 {
                last_seq = seq;
            }

            pending.extend(scanned.buckets);
            cursor = geo.advance(cursor, scanned.header.bytes_used as u64);

            if self.legacy || flags.contains(BlockListFlags::LAST_HEADER) {
                for bucket in pending.drain(..) {
                    table.insert(&geo, bucket);
                }
                transactions += 1;
                if in_range {
                    good_end = Some(cursor);
                } else {
                    extra += 1;
                    log::info!("[REPLAY] recovered transaction seq {} past end", seq);
                }
                committed_end = cursor;
            }
        }

        ScanStop::Complete(ScanOutcome {
            table,
            end: committed_end,
            last_seq,
            transactions,
            extra,
        })
    }

    /// 读取并校验 `cursor` 处的一页
    ///
    /// # 参数
    /// * `limit` - 这一页最多可以占用的字节数
    fn examine(
        &self,
        geo: &Geometry,
        cursor: u64,
        limit: u64,
        page: &mut [u8],
    ) -> core::result::Result<ScannedPage, Fault> {
        self.jio.read_at(cursor, page).map_err(Fault::Io)?;
        let header = BlockListHeader::decode(page, self.need_swap).map_err(|err| match err {
            JournalError::BadChecksum => Fault::Bad("block list checksum"),
            _ => Fault::Bad("block list header"),
        })?;

        let jhdr = geo.jhdr_size as u64;
        let blhdr = self.hdr.blhdr_size as u64;
        let used = header.bytes_used as u64;
        let payload: u64 = header.entries().iter().map(|e| e.bsize as u64).sum();
        if used != blhdr + payload || used % jhdr != 0 || used > limit {
            return Err(Fault::Bad("bytes_used"));
        }
        if header
            .entries()
            .iter()
            .any(|e| e.bsize == 0 || e.bsize as u64 % jhdr != 0)
        {
            return Err(Fault::Bad("block size"));
        }

        let fs_size = self.fsdev.partition_size();
        let in_fs = |e: &BlockInfo| {
            e.bnum
                .checked_mul(jhdr)
                .and_then(|start| start.checked_add(e.bsize as u64))
                .map_or(false, |end| end <= fs_size)
        };
        if header
            .entries()
            .iter()
            .any(|e| !e.is_killed() && !in_fs(e))
        {
            return Err(Fault::Bad("block number"));
        }

        let check = header.flags.contains(BlockListFlags::CHECK_CHECKSUMS);
        let mut buckets = Vec::with_capacity(header.entries().len());
        let mut off = geo.advance(cursor, blhdr);
        for entry in header.entries() {
            if !entry.is_killed() {
                if check && entry.cksum != 0 {
                    let mut data = vec![0u8; entry.bsize as usize];
                    self.jio.read_at(off, &mut data).map_err(Fault::Io)?;
                    if block_crc(&data) != entry.cksum {
                        return Err(Fault::Bad("block checksum"));
                    }
                }
                buckets.push(Bucket {
                    block_num: entry.bnum,
                    jnl_offset: off,
                    size: entry.bsize,
                    cksum: entry.cksum,
                });
            }
            off = geo.advance(off, entry.bsize as u64);
        }

        Ok(ScannedPage { header, buckets })
    }

    // ===== Applying / Finalizing =====

    fn apply(&mut self, outcome: &ScanOutcome) -> Result<()> {
        let unit = self.hdr.jhdr_size as u64;
        for bucket in outcome.table.iter() {
            let mut data = vec![0u8; bucket.size as usize];
            self.jio.read_at(bucket.jnl_offset, &mut data)?;
            self.fsdev.write_bytes(bucket.block_num * unit, &data)?;
        }
        self.fsdev.flush()
    }

    fn finalize(&self, outcome: &ScanOutcome) -> Result<JournalHeader> {
        let mut hdr = self.hdr;
        hdr.magic = JOURNAL_HEADER_MAGIC;
        hdr.start = outcome.end;
        hdr.end = outcome.end;
        hdr.sequence_num = outcome.last_seq.max(self.hdr.sequence_num);
        self.jio.write_header(&hdr)?;
        self.jio.flush()?;
        Ok(hdr)
    }
}
