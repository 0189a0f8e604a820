//! 提交流水线
//!
//! 事务提交分两个阶段：
//!
//! 1. 准备（持有 flushing 门）：预留空间，分配序列号和日志范围，把起点压入
//!    旧起点环，拷贝块内容生成提交映像。之后先占用 async_io 门再释放
//!    flushing 门，下一个事务可以立即开始准备。
//! 2. 写出（持有 async_io 门）：start 被移动过时先写一次头部，再写块列表页，
//!    然后写推进了 end 的新头部，最后解锁缓冲区并把目标块交给写回线程。
//!
//! 设置 `ASYNC_COMMIT` 且事务没有被强制刷新时，第二阶段在后台线程执行。

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::block::BlockDevice;
use crate::error::Result;

use super::completion::CommittedTxn;
use super::config::JournalFlags;
use super::engine::Shared;
use super::trans::{CommitImage, PendingWrite, Transaction, TrimExtent};
use super::writeback::WriteRequest;
use super::JournalError;

/// 完成第一阶段、等待写出的事务
pub(crate) struct PreparedCommit {
    txn: Arc<CommittedTxn>,
    image: CommitImage,
    /// 准备阶段移动了 start，写页之前必须先把头部写出去
    moved: bool,
    force: bool,
}

pub(crate) enum Staged {
    Pages(Box<PreparedCommit>),
    /// 只有 trim 扩展，不占日志空间
    Trims(Vec<TrimExtent>),
    Empty,
}

/// 下一个序列号（跳过 0）
pub(crate) fn next_sequence(seq: u32) -> u32 {
    match seq.wrapping_add(1) {
        0 => 1,
        n => n,
    }
}

impl<D: BlockDevice + Send + 'static> Shared<D> {
    // ===== 第一阶段 =====

    /// 准备提交
    ///
    /// 失败时日志被标记为失效，事务被放弃（缓冲区解锁，回调收到错误）。
    pub(crate) fn prepare(&self, mut txn: Transaction) -> Result<Staged> {
        if txn.pages.is_empty() {
            if txn.trims.is_empty() {
                return Ok(Staged::Empty);
            }
            return Ok(Staged::Trims(core::mem::take(&mut txn.trims)));
        }

        self.flushing.lock();
        match self.stage(&mut txn) {
            Ok(prepared) => {
                self.async_io.lock();
                self.flushing.unlock();
                Ok(Staged::Pages(Box::new(prepared)))
            }
            Err(err) => {
                self.flushing.unlock();
                self.invalidate("commit preparation failed");
                txn.abort(err.clone());
                Err(err)
            }
        }
    }

    fn stage(&self, txn: &mut Transaction) -> Result<PreparedCommit> {
        if self.is_invalid() {
            return Err(JournalError::Invalid.into());
        }

        let mut moved = self.reserve(txn.total_bytes)?;
        let (seq, start, end) = {
            let mut core = self.core.lock();
            let start = core.end;
            moved |= self.push_old_start(&mut core, start)?;
            let seq = next_sequence(core.sequence_num);
            let end = self.geo.advance(start, txn.total_bytes);
            core.sequence_num = seq;
            core.end = end;
            (seq, start, end)
        };

        let mut image = txn.seal(seq)?;
        let trims = core::mem::take(&mut image.trims);
        let has_trims = !trims.is_empty();
        let committed = Arc::new(CommittedTxn::new(
            txn.id,
            seq,
            start,
            end,
            image.total_bytes,
            image.pre_flushed,
            trims,
        ));
        if has_trims {
            self.core.lock().trimming.push(Arc::clone(&committed));
        }

        log::debug!(
            "[COMMIT] txn {} seq {} staged at {:#x}..{:#x} ({} pages, {} bytes)",
            txn.id,
            seq,
            start,
            end,
            image.pages.len(),
            image.total_bytes
        );
        Ok(PreparedCommit {
            txn: committed,
            image,
            moved,
            force: txn.force,
        })
    }

    // ===== 第二阶段 =====

    /// 执行第二阶段（内联或后台线程）
    pub(crate) fn dispatch(self: &Arc<Self>, staged: Staged) -> Result<()> {
        match staged {
            Staged::Empty => Ok(()),
            Staged::Trims(trims) => {
                // 排在前面事务的目标块写回之后
                self.async_io.wait_idle();
                self.writeback.submit(WriteRequest::Discard(trims))
            }
            Staged::Pages(prepared) => {
                if prepared.force || !self.flags.contains(JournalFlags::ASYNC_COMMIT) {
                    self.finish(*prepared)
                } else {
                    self.finish_async(prepared)
                }
            }
        }
    }

    fn finish_async(self: &Arc<Self>, prepared: Box<PreparedCommit>) -> Result<()> {
        let slot = Arc::new(Mutex::new(Some(prepared)));
        let job = Arc::clone(&slot);
        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("jnl-commit".into())
            .spawn(move || {
                let prepared = job.lock().take();
                if let Some(prepared) = prepared {
                    if let Err(err) = shared.finish(*prepared) {
                        log::error!("[COMMIT] background commit failed: {}", err);
                    }
                }
            });

        if spawned.is_err() {
            log::warn!("[COMMIT] cannot spawn commit thread, finishing inline");
            let prepared = slot.lock().take();
            if let Some(prepared) = prepared {
                return self.finish(*prepared);
            }
        }
        Ok(())
    }

    /// 写出事务并释放 async_io 门
    pub(crate) fn finish(&self, prepared: PreparedCommit) -> Result<()> {
        let PreparedCommit {
            txn, image, moved, ..
        } = prepared;

        let result = self.write_out(&txn, &image.pages, moved);
        for buf in &image.bufs {
            buf.unlock();
        }

        let result = match result {
            Ok(()) => self.submit_writes(&txn, image.writes),
            Err(err) => {
                log::error!(
                    "[COMMIT] writing txn {} seq {} failed: {}",
                    txn.id,
                    txn.sequence_num,
                    err
                );
                self.invalidate("journal write failed");
                for write in image.writes {
                    if let Some(hook) = write.hook {
                        hook(Err(err.clone()));
                    }
                }
                Err(err)
            }
        };

        self.async_io.unlock();
        result
    }

    fn write_out(&self, txn: &CommittedTxn, pages: &[Vec<u8>], moved: bool) -> Result<()> {
        if moved {
            // 新事务页可能覆盖被回收的事务，头部必须先放弃它们
            self.sync_start()?;
            self.write_header()?;
            if self.cache_flush() {
                self.jio.flush()?;
            }
        }

        let mut off = txn.journal_start;
        for page in pages {
            self.jio.write_at(off, page)?;
            off = self.geo.advance(off, page.len() as u64);
        }
        if self.cache_flush() {
            self.jio.flush()?;
        }

        {
            let mut core = self.core.lock();
            core.durable_end = txn.journal_end;
            core.durable_seq = txn.sequence_num;
        }
        self.sync_start()?;
        self.write_header()?;
        if self.cache_flush() {
            self.jio.flush()?;
        }
        Ok(())
    }

    /// 让下一次写出的头部带上已回收到的 start
    ///
    /// 被回收事务的目标块先在文件系统设备上刷新落盘。
    fn sync_start(&self) -> Result<()> {
        let start = {
            let core = self.core.lock();
            if core.start == core.header_start {
                return Ok(());
            }
            core.start
        };
        if self.cache_flush() {
            self.fsdev.lock().flush()?;
        }
        self.core.lock().header_start = start;
        Ok(())
    }

    fn submit_writes(&self, txn: &Arc<CommittedTxn>, writes: Vec<PendingWrite>) -> Result<()> {
        {
            let mut core = self.core.lock();
            core.outstanding += 1;
            core.committed += 1;
        }
        if writes.is_empty() {
            return self.writeback.submit(WriteRequest::Complete(Arc::clone(txn)));
        }
        for write in writes {
            self.writeback.submit(WriteRequest::Block {
                txn: Arc::clone(txn),
                write,
            })?;
        }
        Ok(())
    }

    /// 把内存中的头部写到磁盘
    ///
    /// 写出的 end 和序列号是最后一个已写入日志的事务的，而不是已分配的。
    pub(crate) fn write_header(&self) -> Result<()> {
        self.writing_header.lock();
        let hdr = self.snapshot_header();
        let result = self.jio.write_header(&hdr);
        self.writing_header.unlock();
        result
    }
}
