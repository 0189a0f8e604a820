//! 完成跟踪
//!
//! 事务写入日志后交给写回线程。每写完一个目标块，就把它的字节数累加到
//! 事务上；累计到事务总字节数时，事务占用的日志空间可以回收：
//!
//! 1. 旧起点环中对应的槽标记为完成
//! 2. 若事务起点正好是 `active_start`，`active_start` 前进到事务终点，
//!    并继续吞并之后已经完成的事务；否则记入乱序完成表
//! 3. 事务放进待释放列表，由下一次日志 API 调用释放

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::BlockDevice;

use super::engine::{Core, Shared};
use super::trans::{remove_extent, TrimExtent};

/// 已写入日志、等待目标块写回的事务
pub(crate) struct CommittedTxn {
    pub(crate) id: u64,
    pub(crate) sequence_num: u32,
    pub(crate) journal_start: u64,
    pub(crate) journal_end: u64,
    total_bytes: u64,
    flushed: AtomicU64,
    trims: Mutex<Vec<TrimExtent>>,
}

impl CommittedTxn {
    /// # 参数
    /// * `pre_flushed` - 不需要写回的字节数（页头和被 kill 的负载）
    pub(crate) fn new(
        id: u64,
        sequence_num: u32,
        journal_start: u64,
        journal_end: u64,
        total_bytes: u64,
        pre_flushed: u64,
        trims: Vec<TrimExtent>,
    ) -> Self {
        Self {
            id,
            sequence_num,
            journal_start,
            journal_end,
            total_bytes,
            flushed: AtomicU64::new(pre_flushed),
            trims: Mutex::new(trims),
        }
    }

    /// 累加写完的字节数
    ///
    /// # 返回
    /// 这一次累加是否让事务达到总字节数
    pub(crate) fn account(&self, bytes: u64) -> bool {
        let before = self.flushed.fetch_add(bytes, Ordering::AcqRel);
        let after = before + bytes;
        if after > self.total_bytes {
            panic!(
                "[COMPLETION] transaction {} flushed {} of {} bytes",
                self.id, after, self.total_bytes
            );
        }
        after == self.total_bytes
    }

    pub(crate) fn take_trims(&self) -> Vec<TrimExtent> {
        core::mem::take(&mut *self.trims.lock())
    }

    /// 范围被重新分配，不能再丢弃
    pub(crate) fn forget_trim(&self, offset: u64, length: u64) {
        remove_extent(&mut self.trims.lock(), offset, length);
    }
}

impl Core {
    /// 回收一个全部写回的事务
    pub(crate) fn retire(&mut self, txn: &Arc<CommittedTxn>) {
        if !self.ring.mark_done(txn.journal_start, txn.journal_end) {
            log::trace!(
                "[COMPLETION] transaction {} has no ring slot",
                txn.id
            );
        }

        if txn.journal_start == self.active_start {
            self.active_start = txn.journal_end;
            while let Some(end) = self.completed.remove(&self.active_start) {
                self.active_start = end;
            }
        } else {
            self.completed.insert(txn.journal_start, txn.journal_end);
        }

        self.trimming.retain(|t| !Arc::ptr_eq(t, txn));
        self.outstanding = self.outstanding.checked_sub(1).unwrap_or_else(|| {
            panic!("[COMPLETION] outstanding transaction count underflow")
        });
        self.freeme.push(Arc::clone(txn));
        log::debug!(
            "[COMPLETION] txn {} seq {} retired, active_start={:#x}",
            txn.id,
            txn.sequence_num,
            self.active_start
        );
    }
}

impl<D: BlockDevice + Send + 'static> Shared<D> {
    /// 一个目标块写完
    ///
    /// 事务全部写完时先对它的 trim 扩展发出丢弃，再回收日志空间。
    pub(crate) fn block_done(&self, txn: &Arc<CommittedTxn>, bytes: u64) {
        if !txn.account(bytes) {
            return;
        }
        let trims = txn.take_trims();
        self.discard(&trims);
        {
            let mut core = self.core.lock();
            core.retire(txn);
        }
        self.core_cv.notify_all();
    }

    /// 释放已完成的事务
    pub(crate) fn reap(&self) {
        let garbage = core::mem::take(&mut self.core.lock().freeme);
        if !garbage.is_empty() {
            log::trace!("[COMPLETION] freeing {} transactions", garbage.len());
        }
    }
}
