//! 空闲空间预留
//!
//! 日志是环形的，`start` 之前的空间只有在对应事务的目标块全部写完后才能回收。
//! 每个已写入日志的事务在旧起点环里占一个槽：
//!
//! - 提交时压入事务的 `journal_start`，状态为在途
//! - 目标块写完后槽被改写成事务的 `journal_end`，状态为完成
//! - 预留空间时，最老的槽若已完成，`start` 前进到它记录的偏移
//!
//! 环满时压入操作必须等最老的槽完成。

use std::collections::VecDeque;
use std::thread;

use parking_lot::MutexGuard;

use crate::block::BlockDevice;
use crate::error::{Error, ErrorKind, Result};

use super::engine::{Core, Shared};
use super::JournalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    offset: u64,
    in_flight: bool,
}

/// 旧起点环
#[derive(Debug)]
pub(crate) struct OldStartRing {
    slots: VecDeque<Slot>,
    capacity: usize,
}

impl OldStartRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    /// 最老的槽：(偏移, 是否在途)
    pub(crate) fn oldest(&self) -> Option<(u64, bool)> {
        self.slots.front().map(|s| (s.offset, s.in_flight))
    }

    /// 压入一个在途事务的起点
    pub(crate) fn push(&mut self, start: u64) {
        if self.is_full() {
            panic!("[RESERVE] old start ring overflow");
        }
        self.slots.push_back(Slot {
            offset: start,
            in_flight: true,
        });
    }

    /// 弹出最老的已完成槽
    pub(crate) fn pop_done(&mut self) -> Option<u64> {
        match self.slots.front() {
            Some(slot) if !slot.in_flight => self.slots.pop_front().map(|s| s.offset),
            _ => None,
        }
    }

    /// 事务完成：把起点为 `start` 的在途槽改写为 `end`
    pub(crate) fn mark_done(&mut self, start: u64, end: u64) -> bool {
        match self
            .slots
            .iter_mut()
            .find(|s| s.in_flight && s.offset == start)
        {
            Some(slot) => {
                slot.offset = end;
                slot.in_flight = false;
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }
}

impl<D: BlockDevice + Send + 'static> Shared<D> {
    /// 预留 `desired` 字节日志空间
    ///
    /// 空间不够时依次尝试：回收已完成的旧起点、推进到 `active_start`、
    /// 提示文件系统写回后等待。超过重试次数返回 `NoSpace`。
    ///
    /// # 返回
    /// `start` 是否被移动（调用者需要在写事务页之前先写一次头部）
    pub(crate) fn reserve(&self, desired: u64) -> Result<bool> {
        let geo = self.geo;
        if desired >= geo.capacity() {
            log::warn!(
                "[RESERVE] {} bytes can never fit into a journal of {} bytes",
                desired,
                geo.capacity()
            );
            return Err(Error::new(
                ErrorKind::NoSpace,
                "Transaction larger than journal",
            ));
        }

        let mut moved = false;
        let mut tries = 0u32;
        let mut core = self.core.lock();
        loop {
            if core.invalid {
                return Err(JournalError::Invalid.into());
            }
            let free = geo.free_space(core.start, core.end);
            if free > geo.capacity() {
                panic!(
                    "[RESERVE] free space {} exceeds capacity {} (start={:#x} end={:#x})",
                    free,
                    geo.capacity(),
                    core.start,
                    core.end
                );
            }
            if free > desired {
                return Ok(moved);
            }

            match core.ring.oldest() {
                Some((_, false)) => {
                    if let Some(off) = core.ring.pop_done() {
                        log::trace!("[RESERVE] start {:#x} -> {:#x}", core.start, off);
                        core.start = off;
                        moved = true;
                    }
                    continue;
                }
                Some((_, true)) => {
                    tries += 1;
                    if tries <= self.config.reserve_retries {
                        self.hint_writeback(&mut core);
                        self.core_cv.wait_for(&mut core, self.config.reserve_wait);
                    }
                }
                None if core.active_start != core.start => {
                    log::trace!(
                        "[RESERVE] start {:#x} -> active_start {:#x}",
                        core.start,
                        core.active_start
                    );
                    core.start = core.active_start;
                    moved = true;
                    continue;
                }
                None => {
                    tries += 1;
                    if tries <= self.config.reserve_retries {
                        self.hint_writeback(&mut core);
                        MutexGuard::unlocked(&mut core, || thread::sleep(self.config.reserve_wait));
                    }
                }
            }

            if tries > self.config.reserve_retries {
                log::warn!(
                    "[RESERVE] gave up after {} retries: want {} bytes, free {}",
                    self.config.reserve_retries,
                    desired,
                    geo.free_space(core.start, core.end)
                );
                return Err(JournalError::NoSpace.into());
            }
        }
    }

    /// 在不持有 `core` 的情况下调用写回提示
    fn hint_writeback(&self, core: &mut MutexGuard<'_, Core>) {
        if let Some(hint) = &self.config.writeback_hint {
            MutexGuard::unlocked(core, || hint());
        }
    }

    /// 把事务起点压入旧起点环，环满时等待最老的槽完成（有重试上限）
    ///
    /// # 返回
    /// `start` 是否被移动
    pub(crate) fn push_old_start(&self, core: &mut MutexGuard<'_, Core>, start: u64) -> Result<bool> {
        let mut moved = false;
        let mut tries = 0u32;
        loop {
            if core.invalid {
                return Err(JournalError::Invalid.into());
            }
            if !core.ring.is_full() {
                core.ring.push(start);
                return Ok(moved);
            }
            if let Some(off) = core.ring.pop_done() {
                core.start = off;
                moved = true;
                continue;
            }
            tries += 1;
            if tries > self.config.reserve_retries {
                log::warn!(
                    "[RESERVE] old start ring still full after {} retries",
                    self.config.reserve_retries
                );
                return Err(JournalError::NoSpace.into());
            }
            log::debug!("[RESERVE] old start ring full, waiting for writeback");
            self.hint_writeback(core);
            self.core_cv.wait_for(core, self.config.reserve_wait);
        }
    }
}
