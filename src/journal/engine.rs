//! 日志核心
//!
//! [`Journal`] 是对外入口：创建或打开日志、开始和结束事务、登记块修改、
//! 刷新和关闭。内部状态放在 [`Shared`] 中，由调用线程、后台提交线程和
//! 写回线程共享。
//!
//! 锁的划分：
//! - `owner`：打开事务的所有者线程、嵌套深度、打开的事务和组提交缓冲的事务
//! - `core`：内存中的头部（start、end、序列号）、旧起点环、完成跟踪和统计
//! - 三道门：flushing、async_io、writing_header
//!
//! 加锁顺序是 `owner` 在前、`core` 在后；`core` 从不跨设备 I/O 持有。

use std::collections::hash_map::RandomState;
use std::collections::BTreeMap;
use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::block::{BlockDev, BlockDevice};
use crate::consts::*;
use crate::error::{Error, ErrorKind, Result};

use super::buf::{BlockBuf, EndWriteCallback, ModifyToken};
use super::commit::Staged;
use super::completion::CommittedTxn;
use super::config::{FlushMode, JournalConfig, JournalFlags};
use super::gate::Gate;
use super::io::JournalIo;
use super::recovery::{Replay, ReplayReport};
use super::space::OldStartRing;
use super::trans::Transaction;
use super::types::{Geometry, JournalHeader};
use super::writeback::Writeback;
use super::JournalError;

// =============================================================================
// 内存中的日志状态
// =============================================================================

/// 受 `core` 锁保护的状态
pub(crate) struct Core {
    pub(crate) start: u64,
    /// 可以写进头部的起点：它之前回收的事务目标块已在文件系统设备上落盘
    pub(crate) header_start: u64,
    /// 已分配到的日志终点
    pub(crate) end: u64,
    /// 已写入日志并可以写进头部的终点
    pub(crate) durable_end: u64,
    pub(crate) sequence_num: u32,
    pub(crate) durable_seq: u32,
    /// 这之前的事务都已写回目标位置
    pub(crate) active_start: u64,
    pub(crate) ring: OldStartRing,
    /// 乱序完成的事务：起点 -> 终点
    pub(crate) completed: BTreeMap<u64, u64>,
    /// 已写入日志、目标块尚未全部写完的事务数
    pub(crate) outstanding: usize,
    /// 待释放的事务
    pub(crate) freeme: Vec<Arc<CommittedTxn>>,
    /// 还带着 trim 扩展的在途事务
    pub(crate) trimming: Vec<Arc<CommittedTxn>>,
    pub(crate) invalid: bool,
    pub(crate) closed: bool,
    pub(crate) committed: u64,
    pub(crate) deferred: u64,
}

impl Core {
    pub(crate) fn new(start: u64, end: u64, sequence_num: u32) -> Self {
        Self {
            start,
            header_start: start,
            end,
            durable_end: end,
            sequence_num,
            durable_seq: sequence_num,
            active_start: start,
            ring: OldStartRing::new(OLD_START_SLOTS),
            completed: BTreeMap::new(),
            outstanding: 0,
            freeme: Vec::new(),
            trimming: Vec::new(),
            invalid: false,
            closed: false,
            committed: 0,
            deferred: 0,
        }
    }
}

#[derive(Default)]
struct OwnerState {
    owner: Option<ThreadId>,
    nesting: u32,
    /// 所有者正在构建的事务
    current: Option<Transaction>,
    /// 组提交延迟下来的事务，下一个 start_transaction 复用
    buffered: Option<Transaction>,
}

/// 调用线程、提交线程和写回线程共享的日志状态
pub(crate) struct Shared<D> {
    pub(crate) geo: Geometry,
    template: JournalHeader,
    blhdr_size: u32,
    tbuffer_size: u32,
    pub(crate) flags: JournalFlags,
    pub(crate) config: JournalConfig,
    pub(crate) jio: JournalIo<D>,
    pub(crate) fsdev: Mutex<BlockDev<D>>,
    owner: Mutex<OwnerState>,
    owner_cv: Condvar,
    pub(crate) core: Mutex<Core>,
    pub(crate) core_cv: Condvar,
    pub(crate) flushing: Gate,
    pub(crate) async_io: Gate,
    pub(crate) writing_header: Gate,
    pub(crate) writeback: Writeback,
    next_txn_id: AtomicU64,
    last_replay: Option<ReplayReport>,
}

impl<D: BlockDevice + Send + 'static> Shared<D> {
    /// 标记日志失效，之后的事务全部失败
    pub(crate) fn invalidate(&self, reason: &str) {
        {
            let mut core = self.core.lock();
            if core.invalid {
                return;
            }
            core.invalid = true;
        }
        log::error!("[JOURNAL] journal invalidated: {}", reason);
        self.core_cv.notify_all();
    }

    pub(crate) fn is_invalid(&self) -> bool {
        self.core.lock().invalid
    }

    /// 是否需要发出设备缓存刷新
    pub(crate) fn cache_flush(&self) -> bool {
        !self.flags.contains(JournalFlags::NO_CACHE_FLUSH)
    }

    /// 当前可以写到磁盘的头部
    pub(crate) fn snapshot_header(&self) -> JournalHeader {
        let core = self.core.lock();
        JournalHeader {
            start: core.header_start,
            end: core.durable_end,
            sequence_num: core.durable_seq,
            ..self.template
        }
    }

    fn release_owner(&self, mut st: MutexGuard<'_, OwnerState>) {
        st.owner = None;
        st.nesting = 0;
        drop(st);
        self.owner_cv.notify_all();
    }

    /// 刷新组提交缓冲的事务并等待流水线排空
    pub(crate) fn flush(self: &Arc<Self>, mode: FlushMode) -> Result<()> {
        self.reap();
        let me = thread::current().id();
        let mut st = self.owner.lock();
        let owned = st.owner == Some(me);
        let buffered = if owned {
            None
        } else {
            while st.owner.is_some() {
                self.owner_cv.wait(&mut st);
            }
            st.owner = Some(me);
            st.buffered.take()
        };
        drop(st);

        let staged = match buffered {
            Some(txn) if self.is_invalid() => {
                txn.abort(JournalError::Invalid.into());
                Err(JournalError::Invalid.into())
            }
            Some(mut txn) => {
                txn.force = true;
                self.prepare(txn)
            }
            None => Ok(Staged::Empty),
        };
        if !owned {
            self.release_owner(self.owner.lock());
        }
        self.dispatch(staged?)?;
        self.drain(mode)
    }

    fn drain(&self, mode: FlushMode) -> Result<()> {
        self.flushing.wait_idle();
        self.async_io.wait_idle();
        self.writing_header.wait_idle();
        if self.cache_flush() && !self.is_invalid() {
            self.jio.flush()?;
        }

        if mode == FlushMode::Full {
            {
                let mut core = self.core.lock();
                while core.outstanding > 0 && !core.invalid {
                    self.core_cv.wait(&mut core);
                }
            }
            if !self.is_invalid() {
                self.fsdev.lock().flush()?;
            }
        }

        self.reap();
        if self.is_invalid() {
            return Err(JournalError::Invalid.into());
        }
        Ok(())
    }

    /// 关闭日志
    ///
    /// # 参数
    /// * `clean` - 刷新所有事务并写一个干净的头部；否则丢弃未写出的内容
    fn shutdown(self: &Arc<Self>, clean: bool) -> Result<()> {
        {
            let mut core = self.core.lock();
            if core.closed {
                return Ok(());
            }
            core.closed = true;
        }

        let result = if clean {
            self.flush(FlushMode::Full)
        } else {
            Ok(())
        };
        self.flushing.wait_idle();
        self.async_io.wait_idle();

        let leftover = self.owner.lock().buffered.take();
        if let Some(txn) = leftover {
            txn.abort(Error::new(ErrorKind::Invalid, "Journal released"));
        }

        let abandon = !clean || result.is_err();
        self.writeback.shutdown(abandon);

        if !abandon {
            {
                let mut core = self.core.lock();
                core.start = core.durable_end;
                core.header_start = core.start;
                core.active_start = core.start;
                core.ring.clear();
            }
            self.write_header()?;
            self.jio.flush()?;
        }
        self.reap();
        log::info!("[JOURNAL] closed (clean={})", !abandon);
        result
    }
}

// =============================================================================
// 对外接口
// =============================================================================

/// 一次状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalStats {
    /// 内存中的日志起点
    pub start: u64,
    /// 已分配到的日志终点
    pub end: u64,
    /// 头部中记录的终点
    pub durable_end: u64,
    /// 这之前的事务都已写回目标位置
    pub active_start: u64,
    /// 日志剩余可用字节数
    pub free_space: u64,
    /// 最后分配的事务序列号
    pub sequence_num: u32,
    /// 目标块尚未全部写完的事务数
    pub outstanding: usize,
    /// 写入日志的事务数
    pub committed: u64,
    /// 被组提交延迟的事务结束次数
    pub deferred: u64,
    /// 日志是否已失效
    pub invalid: bool,
}

/// 预写日志
///
/// 所有方法都接受 `&self`，可以放进 `Arc` 在多个线程间共享。
/// 同一时刻只有一个线程可以拥有打开的事务。
pub struct Journal<D: BlockDevice + Send + 'static> {
    shared: Arc<Shared<D>>,
}

impl<D: BlockDevice + Send + 'static> Journal<D> {
    // ===== 创建与打开 =====

    /// 在日志区域上创建新日志
    ///
    /// # 参数
    /// * `jdev` - 日志区域
    /// * `fsdev` - 文件系统区域
    /// * `min_block_size` - 日志块大小下限，实际取它与设备扇区大小的较大者
    /// * `flags` - 行为标志
    /// * `config` - 可调参数
    pub fn create(
        mut jdev: BlockDev<D>,
        fsdev: BlockDev<D>,
        min_block_size: u32,
        flags: JournalFlags,
        config: JournalConfig,
    ) -> Result<Self> {
        let phys = phys_block_size(&jdev, min_block_size)?;
        let region = jdev.partition_size();
        let size = (region - region % phys as u64).min(JOURNAL_MAX_SIZE);
        let seq = initial_sequence(&mut jdev, &config);

        let tbuffer = effective_tbuffer(config.tbuffer_size, size, phys);
        let blhdr = blhdr_size_for(tbuffer, phys);
        let tbuffer = tbuffer.max(blhdr + phys);

        let hdr = JournalHeader::new(phys, size, blhdr, seq);
        hdr.validate(region)?;
        let jio = JournalIo::new(jdev, hdr.geometry());
        jio.write_header(&hdr)?;
        jio.flush()?;

        log::info!(
            "[JOURNAL] created: size={:#x} jhdr={} blhdr={} tbuffer={} seq={}",
            size,
            phys,
            blhdr,
            tbuffer,
            seq
        );
        Self::assemble(jio, fsdev, hdr, flags, config, tbuffer, None)
    }

    /// 打开已有日志，必要时先重放
    ///
    /// # 参数
    /// 同 [`Journal::create`]；`flags` 含 `RESET` 时丢弃日志内容而不重放
    pub fn open(
        mut jdev: BlockDev<D>,
        mut fsdev: BlockDev<D>,
        min_block_size: u32,
        flags: JournalFlags,
        config: JournalConfig,
    ) -> Result<Self> {
        let phys = phys_block_size(&jdev, min_block_size)?;
        let region = jdev.partition_size();

        let mut raw = [0u8; JOURNAL_HEADER_SIZE];
        jdev.read_bytes(0, &mut raw)?;
        let mut decoded = JournalHeader::decode(&raw)?;
        if decoded.legacy {
            decoded.header.sequence_num = 0;
        }
        decoded.header.validate(region)?;

        let mut jio = JournalIo::new(jdev, decoded.header.geometry());
        let (mut hdr, report) = if flags.contains(JournalFlags::RESET) {
            let mut hdr = decoded.header;
            hdr.magic = JOURNAL_HEADER_MAGIC;
            hdr.start = hdr.end;
            // end 之后残留的页不能再被推测扫描接上
            let rand = config.sequence_seed.unwrap_or_else(random_seed);
            hdr.sequence_num = sequence_after(&hdr, rand);
            jio.write_header(&hdr)?;
            jio.flush()?;
            log::info!("[JOURNAL] reset requested, log contents discarded");
            (hdr, None)
        } else {
            let (hdr, report) =
                Replay::new(&jio, &mut fsdev, &decoded, config.replay_retries).run()?;
            (hdr, Some(report))
        };

        if hdr.jhdr_size != phys {
            log::info!(
                "[JOURNAL] block size changed {} -> {}, rewriting header",
                hdr.jhdr_size,
                phys
            );
            let unit = phys as u64;
            hdr.jhdr_size = phys;
            hdr.size -= hdr.size % unit;
            hdr.blhdr_size = round_up(hdr.blhdr_size, phys);
            hdr.start = unit;
            hdr.end = unit;
            hdr.validate(region)?;
            jio = JournalIo::new(jio.into_dev(), hdr.geometry());
            jio.write_header(&hdr)?;
            jio.flush()?;
        }

        let tbuffer = effective_tbuffer(config.tbuffer_size, hdr.size, hdr.jhdr_size)
            .max(hdr.blhdr_size + hdr.jhdr_size);
        log::info!(
            "[JOURNAL] opened: size={:#x} jhdr={} blhdr={} tbuffer={} seq={}",
            hdr.size,
            hdr.jhdr_size,
            hdr.blhdr_size,
            tbuffer,
            hdr.sequence_num
        );
        Self::assemble(jio, fsdev, hdr, flags, config, tbuffer, report)
    }

    /// 只读检查：日志区域中是否是一个干净（无待重放事务）的日志
    pub fn is_clean(jdev: &mut BlockDev<D>) -> Result<bool> {
        let mut raw = [0u8; JOURNAL_HEADER_SIZE];
        jdev.read_bytes(0, &mut raw)?;
        let decoded = JournalHeader::decode(&raw)?;
        decoded.header.validate(jdev.partition_size())?;
        Ok(decoded.header.is_clean())
    }

    fn assemble(
        jio: JournalIo<D>,
        fsdev: BlockDev<D>,
        hdr: JournalHeader,
        flags: JournalFlags,
        config: JournalConfig,
        tbuffer_size: u32,
        last_replay: Option<ReplayReport>,
    ) -> Result<Self> {
        let template = JournalHeader {
            magic: JOURNAL_HEADER_MAGIC,
            endian: ENDIAN_MAGIC,
            checksum: 0,
            ..hdr
        };
        let shared = Arc::new(Shared {
            geo: hdr.geometry(),
            template,
            blhdr_size: hdr.blhdr_size,
            tbuffer_size,
            flags,
            config,
            jio,
            fsdev: Mutex::new(fsdev),
            owner: Mutex::new(OwnerState::default()),
            owner_cv: Condvar::new(),
            core: Mutex::new(Core::new(hdr.start, hdr.end, hdr.sequence_num)),
            core_cv: Condvar::new(),
            flushing: Gate::new("flushing"),
            async_io: Gate::new("async_io"),
            writing_header: Gate::new("writing_header"),
            writeback: Writeback::new(),
            next_txn_id: AtomicU64::new(1),
            last_replay,
        });
        shared.start_writeback()?;
        Ok(Self { shared })
    }

    // ===== 事务 =====

    /// 开始（或嵌套进入）一个事务
    ///
    /// 其它线程拥有打开的事务时阻塞。组提交缓冲了事务时直接复用它。
    pub fn start_transaction(&self) -> Result<()> {
        let sh = &self.shared;
        sh.reap();

        let me = thread::current().id();
        let mut st = sh.owner.lock();
        if st.owner == Some(me) {
            st.nesting += 1;
            return Ok(());
        }
        while st.owner.is_some() {
            sh.owner_cv.wait(&mut st);
        }
        if sh.is_invalid() {
            return Err(JournalError::Invalid.into());
        }

        let txn = match st.buffered.take() {
            Some(txn) => {
                log::trace!("[JOURNAL] reusing buffered transaction {}", txn.id);
                txn
            }
            None => Transaction::new(
                sh.next_txn_id.fetch_add(1, Ordering::Relaxed),
                sh.blhdr_size,
                sh.tbuffer_size,
            ),
        };
        st.owner = Some(me);
        st.nesting = 1;
        st.current = Some(txn);
        Ok(())
    }

    /// 结束事务
    ///
    /// 只有最外层调用真正生效：事务要么留给组提交，要么立即写入日志。
    pub fn end_transaction(&self) -> Result<()> {
        let sh = &self.shared;
        let mut st = sh.owner.lock();
        check_owner(&st, "end_transaction");
        st.nesting -= 1;
        if st.nesting > 0 {
            return Ok(());
        }
        let Some(txn) = st.current.take() else {
            panic!("[JOURNAL] end_transaction without an open transaction");
        };

        if sh.is_invalid() {
            sh.release_owner(st);
            txn.abort(JournalError::Invalid.into());
            return Err(JournalError::Invalid.into());
        }

        let no_group_commit = sh.flags.contains(JournalFlags::NO_GROUP_COMMIT);
        if txn.is_empty() || txn.should_defer(no_group_commit, sh.config.trim_flush_limit) {
            log::trace!(
                "[JOURNAL] deferring transaction {} ({} blocks)",
                txn.id,
                txn.num_blocks()
            );
            st.buffered = Some(txn);
            sh.release_owner(st);
            sh.core.lock().deferred += 1;
            return Ok(());
        }

        // 准备阶段结束前保持所有权
        drop(st);
        let staged = sh.prepare(txn);
        sh.release_owner(sh.owner.lock());
        sh.dispatch(staged?)
    }

    /// 要求当前事务结束时立即写入日志
    pub fn request_immediate_flush(&self) {
        let mut st = self.shared.owner.lock();
        check_owner(&st, "request_immediate_flush");
        current(&mut st).force = true;
    }

    // ===== 块修改 =====

    /// 声明要在当前事务中修改 `buf`
    ///
    /// 缓冲区被其它事务锁定时阻塞到那个事务写出为止。
    pub fn modify_block_start(&self, buf: &BlockBuf) -> Result<ModifyToken> {
        let sh = &self.shared;
        let txn_id = {
            let mut st = sh.owner.lock();
            check_owner(&st, "modify_block_start");
            if sh.is_invalid() {
                return Err(JournalError::Invalid.into());
            }
            let txn = current(&mut st);
            let unit = sh.geo.jhdr_size as usize;
            if buf.is_empty() || buf.len() % unit != 0 || buf.len() > txn.max_block_size() as usize
            {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "Buffer size incompatible with journal block size",
                ));
            }
            let growth = sh.blhdr_size as u64 + buf.len() as u64;
            if txn.find(buf).is_none() && txn.total_bytes + growth >= sh.geo.capacity() {
                return Err(Error::new(
                    ErrorKind::NoSpace,
                    "Transaction exceeds journal capacity",
                ));
            }
            txn.id
        };

        let generation = buf.acquire(txn_id);
        Ok(ModifyToken::new(buf.clone(), generation))
    }

    /// 把修改过的缓冲区登记到当前事务
    ///
    /// # 参数
    /// * `token` - `modify_block_start` 发出的令牌
    /// * `hook` - 块写回目标位置后的回调
    pub fn modify_block_end(
        &self,
        token: ModifyToken,
        hook: Option<EndWriteCallback>,
    ) -> Result<()> {
        let sh = &self.shared;
        let mut st = sh.owner.lock();
        check_owner(&st, "modify_block_end");

        let (buf, generation) = token.consume();
        if !buf.token_valid(generation) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Modify token is no longer valid",
            ));
        }
        if sh.is_invalid() {
            buf.release_token(generation);
            return Err(JournalError::Invalid.into());
        }

        let newly = buf.register(generation);
        let capacity = sh.geo.capacity();
        let txn = current(&mut st);
        match txn.add_block(&buf, hook, capacity) {
            Ok(()) => Ok(()),
            Err(err) => {
                if newly {
                    buf.unlock();
                }
                Err(err)
            }
        }
    }

    /// 放弃一次修改
    ///
    /// 已在事务中的块保持登记；否则缓冲区解锁。
    pub fn modify_block_abort(&self, token: ModifyToken) {
        let st = self.shared.owner.lock();
        check_owner(&st, "modify_block_abort");
        drop(st);
        drop(token);
    }

    /// 从当前事务中移除一个块（块在提交前被释放）
    pub fn kill_block(&self, buf: &BlockBuf) {
        let mut st = self.shared.owner.lock();
        check_owner(&st, "kill_block");
        let txn = current(&mut st);
        if txn.kill(buf) {
            log::trace!("[JOURNAL] killed block {} in txn {}", buf.blkno(), txn.id);
            buf.unlock();
        } else if buf.locked_by() == Some(txn.id) {
            buf.unlock();
        }
    }

    // ===== trim =====

    /// 记录一段被释放的文件系统字节范围，事务写回完成后发出丢弃
    pub fn trim_extent(&self, offset: u64, length: u64) -> Result<()> {
        let sh = &self.shared;
        let mut st = sh.owner.lock();
        check_owner(&st, "trim_extent");
        if sh.is_invalid() {
            return Err(JournalError::Invalid.into());
        }
        current(&mut st).add_trim(offset, length);
        Ok(())
    }

    /// 一段范围被重新分配，从所有待丢弃列表中移除
    pub fn trim_extent_free(&self, offset: u64, length: u64) -> Result<()> {
        let sh = &self.shared;
        let mut st = sh.owner.lock();
        check_owner(&st, "trim_extent_free");
        current(&mut st).remove_trim(offset, length);
        let core = sh.core.lock();
        for txn in &core.trimming {
            txn.forget_trim(offset, length);
        }
        Ok(())
    }

    // ===== 刷新与关闭 =====

    /// 刷新
    ///
    /// [`FlushMode::Journal`] 保证已结束的事务都已持久化到日志；
    /// [`FlushMode::Full`] 另外等待所有目标块写完并刷新文件系统设备缓存。
    pub fn flush(&self, mode: FlushMode) -> Result<()> {
        self.shared.flush(mode)
    }

    /// 刷新所有事务、等待写回完成并写一个干净的头部
    pub fn close(self) -> Result<()> {
        self.shared.shutdown(true)
    }

    /// 不刷新直接释放
    ///
    /// 组提交缓冲的事务被丢弃，尚未写回的目标块回调收到错误。
    /// 已写入日志的事务留待下次打开时重放。
    pub fn release(self) {
        let _ = self.shared.shutdown(false);
    }

    // ===== 查询 =====

    /// 当前状态快照
    pub fn stats(&self) -> JournalStats {
        let sh = &self.shared;
        let core = sh.core.lock();
        JournalStats {
            start: core.start,
            end: core.end,
            durable_end: core.durable_end,
            active_start: core.active_start,
            free_space: sh.geo.free_space(core.start, core.end),
            sequence_num: core.sequence_num,
            outstanding: core.outstanding,
            committed: core.committed,
            deferred: core.deferred,
            invalid: core.invalid,
        }
    }

    /// 打开时的重放结果（`create` 和 `RESET` 打开时为 `None`）
    pub fn last_replay(&self) -> Option<ReplayReport> {
        self.shared.last_replay
    }

    /// 日志是否已失效（写入失败后需要关闭并重新打开）
    pub fn is_invalid(&self) -> bool {
        self.shared.is_invalid()
    }

    /// 日志块大小（块号的单位）
    pub fn block_size(&self) -> u32 {
        self.shared.geo.jhdr_size
    }

    /// 事务缓冲区大小
    pub fn tbuffer_size(&self) -> u32 {
        self.shared.tbuffer_size
    }
}

impl<D: BlockDevice + Send + 'static> Drop for Journal<D> {
    fn drop(&mut self) {
        if let Err(err) = self.shared.shutdown(false) {
            log::warn!("[JOURNAL] release on drop failed: {}", err);
        }
    }
}

fn check_owner(st: &OwnerState, op: &str) {
    if st.owner != Some(thread::current().id()) {
        panic!(
            "[JOURNAL] {} called by a thread that does not own the transaction",
            op
        );
    }
}

fn current(st: &mut OwnerState) -> &mut Transaction {
    match st.current.as_mut() {
        Some(txn) => txn,
        None => panic!("[JOURNAL] no open transaction"),
    }
}

// =============================================================================
// 几何与参数计算
// =============================================================================

fn round_up(value: u32, unit: u32) -> u32 {
    value.div_ceil(unit) * unit
}

fn phys_block_size<D: BlockDevice>(jdev: &BlockDev<D>, min_block_size: u32) -> Result<u32> {
    let phys = jdev.sector_size().max(min_block_size);
    if !phys.is_power_of_two() || !(MIN_PHYS_BLOCK_SIZE..=MAX_PHYS_BLOCK_SIZE).contains(&phys) {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "Unsupported journal block size",
        ));
    }
    Ok(phys)
}

/// 实际使用的事务缓冲区大小：不超过上限和日志的一半，按块大小向下取整
pub(crate) fn effective_tbuffer(requested: u32, size: u64, jhdr_size: u32) -> u32 {
    let unit = jhdr_size as u64;
    let tbuffer = (requested.min(MAX_TBUFFER_SIZE) as u64).min(size / 2);
    (tbuffer - tbuffer % unit) as u32
}

/// 能容纳一个事务缓冲区全部条目的块列表页大小
pub(crate) fn blhdr_size_for(tbuffer_size: u32, jhdr_size: u32) -> u32 {
    let entries = tbuffer_size / jhdr_size + 1;
    let bytes = (BLHDR_FIXED_SIZE + entries as usize * BLOCK_INFO_SIZE) as u32;
    round_up(bytes, jhdr_size)
}

fn random_seed() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u128(nanos);
    hasher.finish() as u32
}

/// 新日志的初始序列号
///
/// 区域里残留一个有序列号的旧日志时，新序列号落在旧序列号之后足够远处，
/// 旧内容不会被误认为是新事务。
fn initial_sequence<D: BlockDevice>(jdev: &mut BlockDev<D>, config: &JournalConfig) -> u32 {
    let rand = config.sequence_seed.unwrap_or_else(random_seed);
    let mut raw = [0u8; JOURNAL_HEADER_SIZE];
    let old = jdev
        .read_bytes(0, &mut raw)
        .ok()
        .and_then(|_| JournalHeader::decode(&raw).ok());

    match old {
        Some(old) if !old.legacy && old.header.sequence_num != 0 && old.header.jhdr_size != 0 => {
            sequence_after(&old.header, rand)
        }
        _ => nonzero_sequence(rand & 0x00ff_ffff),
    }
}

/// 落在 `old` 的序列号之后、比日志能容纳的事务数还远的序列号
fn sequence_after(old: &JournalHeader, rand: u32) -> u32 {
    let span = old.size / old.jhdr_size as u64;
    let seq = (old.sequence_num as u64 + span + (rand % 16384) as u64) as u32 & 0x00ff_ffff;
    nonzero_sequence(seq)
}

fn nonzero_sequence(seq: u32) -> u32 {
    if seq == 0 {
        1
    } else {
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::types::{BlockListFlags, BlockListHeader};
    use crate::testing::RamDisk;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    const KB: u64 = 1024;

    /// 独立的日志盘和文件系统盘
    struct Rig {
        jdisk: RamDisk,
        fsdisk: RamDisk,
        sector: u32,
    }

    impl Rig {
        fn new(sector: u32, journal_bytes: u64, fs_bytes: u64) -> Self {
            Self {
                jdisk: RamDisk::new(sector, journal_bytes / sector as u64),
                fsdisk: RamDisk::new(sector, fs_bytes / sector as u64),
                sector,
            }
        }

        fn devs(&self) -> (BlockDev<RamDisk>, BlockDev<RamDisk>) {
            (
                BlockDev::new(self.jdisk.clone()).unwrap(),
                BlockDev::new(self.fsdisk.clone()).unwrap(),
            )
        }

        fn create(&self, flags: JournalFlags) -> Journal<RamDisk> {
            let (j, f) = self.devs();
            Journal::create(j, f, 0, flags, config()).unwrap()
        }

        fn open(&self, flags: JournalFlags) -> Result<Journal<RamDisk>> {
            let (j, f) = self.devs();
            Journal::open(j, f, 0, flags, config())
        }

        /// 掉电：拷贝两块盘的当前内容
        fn crash(&self) -> Rig {
            Rig {
                jdisk: self.jdisk.crash_copy(),
                fsdisk: self.fsdisk.crash_copy(),
                sector: self.sector,
            }
        }

        fn block(&self, blkno: u64) -> Vec<u8> {
            self.fsdisk
                .read_at(blkno * self.sector as u64, self.sector as usize)
        }
    }

    /// 小缓冲区让 512 字节扇区下的页头正好一个扇区
    fn config() -> JournalConfig {
        JournalConfig {
            tbuffer_size: 4096,
            sequence_seed: Some(100),
            ..JournalConfig::default()
        }
    }

    fn write_txn(jnl: &Journal<RamDisk>, blocks: &[(u64, u8)]) -> Result<()> {
        let size = jnl.block_size() as usize;
        jnl.start_transaction()?;
        for &(blkno, fill) in blocks {
            let buf = BlockBuf::zeroed(blkno, size);
            let mut token = jnl.modify_block_start(&buf)?;
            token.with_data_mut(|d| d.fill(fill));
            jnl.modify_block_end(token, None)?;
        }
        jnl.request_immediate_flush();
        jnl.end_transaction()
    }

    // ----- 创建与打开 -----

    #[test]
    fn test_create_writes_clean_header() {
        let rig = Rig::new(4096, 256 * KB, 64 * KB);
        let (j, f) = rig.devs();
        let cfg = JournalConfig {
            sequence_seed: Some(100),
            ..JournalConfig::default()
        };
        let jnl = Journal::create(j, f, 0, JournalFlags::empty(), cfg).unwrap();
        assert_eq!(jnl.block_size(), 4096);
        assert_eq!(jnl.tbuffer_size(), 128 * KB as u32);
        let stats = jnl.stats();
        assert_eq!((stats.start, stats.end), (4096, 4096));
        assert_eq!(stats.sequence_num, 100);
        drop(jnl);

        let (mut j, _) = rig.devs();
        assert!(Journal::is_clean(&mut j).unwrap());
        let hdr = JournalHeader::decode(&rig.jdisk.read_at(0, 48)).unwrap().header;
        assert_eq!(hdr.blhdr_size, 4096);
        assert_eq!(hdr.size, 256 * KB);
    }

    #[test]
    fn test_create_sequence_base_skips_old_journal() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let mut old = JournalHeader::new(512, 64 * KB, 512, 5000);
        old.end = 2048;
        rig.jdisk.write_at(0, &old.to_bytes());

        let jnl = rig.create(JournalFlags::empty());
        assert_eq!(jnl.stats().sequence_num, 5000 + 128 + 100);
    }

    #[test]
    fn test_open_rejects_garbage() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let err = rig.open(JournalFlags::empty()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Format);

        let mut hdr = JournalHeader::new(512, 64 * KB, 512, 1);
        hdr.start = 64 * KB;
        rig.jdisk.write_at(0, &hdr.to_bytes());
        let err = rig.open(JournalFlags::empty()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_open_big_endian_header() {
        use byteorder::{BigEndian, ByteOrder};

        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let hdr = JournalHeader::new(512, 64 * KB, 512, 9);
        let le = hdr.to_bytes();
        let mut be = [0u8; 48];
        for (i, width) in [(0, 4), (4, 4), (8, 8), (16, 8), (24, 8), (32, 4), (40, 4), (44, 4)] {
            let mut field = le[i..i + width].to_vec();
            field.reverse();
            be[i..i + width].copy_from_slice(&field);
        }
        let mut scratch = be;
        scratch[36..40].fill(0);
        BigEndian::write_u32(
            &mut be[36..40],
            crate::journal::checksum::calc_checksum(&scratch[..44]),
        );
        rig.jdisk.write_at(0, &be);

        let jnl = rig.open(JournalFlags::empty()).unwrap();
        assert_eq!(jnl.stats().sequence_num, 9);
        drop(jnl);
        // 重放后头部以小端序写回
        let back = JournalHeader::decode(&rig.jdisk.read_at(0, 48)).unwrap();
        assert!(!back.need_swap);
    }

    #[test]
    fn test_open_legacy_header_is_upgraded() {
        use byteorder::{ByteOrder, LittleEndian};

        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let mut raw = JournalHeader::new(512, 64 * KB, 512, 0).to_bytes();
        LittleEndian::write_u32(&mut raw[0..4], OLD_JOURNAL_HEADER_MAGIC);
        LittleEndian::write_u32(&mut raw[36..40], 0xdead_beef);
        rig.jdisk.write_at(0, &raw);

        let jnl = rig.open(JournalFlags::empty()).unwrap();
        assert_eq!(jnl.last_replay().unwrap().transactions, 0);
        drop(jnl);
        let back = JournalHeader::decode(&rig.jdisk.read_at(0, 48)).unwrap();
        assert!(!back.legacy);
        assert_eq!(back.header.magic, JOURNAL_HEADER_MAGIC);
    }

    #[test]
    fn test_open_migrates_block_size() {
        let rig = Rig::new(512, 256 * KB, 64 * KB);
        rig.create(JournalFlags::empty()).close().unwrap();

        let (j, f) = rig.devs();
        let jnl = Journal::open(j, f, 4096, JournalFlags::empty(), config()).unwrap();
        assert_eq!(jnl.block_size(), 4096);
        assert_eq!(jnl.stats().start, 4096);
        jnl.close().unwrap();

        let hdr = JournalHeader::decode(&rig.jdisk.read_at(0, 48)).unwrap().header;
        assert_eq!(hdr.jhdr_size, 4096);
        assert_eq!(hdr.blhdr_size % 4096, 0);
        assert_eq!((hdr.start, hdr.end), (4096, 4096));
    }

    #[test]
    fn test_reset_skips_replay() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::empty());
        rig.fsdisk.stall_writes(Some(0..64 * KB));
        write_txn(&jnl, &[(3, 0x33)]).unwrap();
        let crashed = rig.crash();
        rig.fsdisk.stall_writes(None);
        drop(jnl);

        let jnl = crashed.open(JournalFlags::RESET).unwrap();
        assert!(jnl.last_replay().is_none());
        assert_eq!(crashed.block(3), vec![0u8; 512]);
        let stats = jnl.stats();
        assert_eq!(stats.start, stats.end);
    }

    #[test]
    fn test_reset_discards_unrecorded_pages() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::empty());
        rig.fsdisk.stall_writes(Some(0..64 * KB));
        // 页和负载落盘，推进 end 的头部丢失
        rig.jdisk.set_write_budget(Some(2 * 512));
        assert!(write_txn(&jnl, &[(3, 0x33)]).is_err());
        let crashed = rig.crash();
        rig.fsdisk.stall_writes(None);
        drop(jnl);

        let jnl = crashed.open(JournalFlags::RESET).unwrap();
        assert_eq!(jnl.stats().sequence_num, 100 + 128 + 100);
        jnl.close().unwrap();

        let jnl = crashed.open(JournalFlags::empty()).unwrap();
        let report = jnl.last_replay().unwrap();
        assert_eq!(report.transactions, 0);
        assert_eq!(report.extra_transactions, 0);
        assert_eq!(crashed.block(3), vec![0u8; 512]);
    }

    // ----- 提交与重放 -----

    #[test]
    fn test_commit_flushes_journal_device() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::empty());
        let before = rig.jdisk.flushes();

        write_txn(&jnl, &[(1, 0x11)]).unwrap();
        // 事务页之后一次，推进 end 的头部之后一次
        assert_eq!(rig.jdisk.flushes(), before + 2);
        jnl.flush(FlushMode::Journal).unwrap();
        assert_eq!(rig.jdisk.flushes(), before + 3);
    }

    #[test]
    fn test_no_cache_flush_flag() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::NO_CACHE_FLUSH);
        let before = rig.jdisk.flushes();
        write_txn(&jnl, &[(1, 0x11)]).unwrap();
        jnl.flush(FlushMode::Journal).unwrap();
        assert_eq!(rig.jdisk.flushes(), before);
    }

    #[test]
    fn test_commit_writes_home_and_header() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::empty());
        write_txn(&jnl, &[(4, 0xaa), (9, 0xbb)]).unwrap();
        jnl.flush(FlushMode::Full).unwrap();

        assert_eq!(rig.block(4), vec![0xaa; 512]);
        assert_eq!(rig.block(9), vec![0xbb; 512]);
        let stats = jnl.stats();
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.active_start, stats.end);
        assert_eq!(stats.sequence_num, 101);

        let hdr = JournalHeader::decode(&rig.jdisk.read_at(0, 48)).unwrap().header;
        assert_eq!(hdr.end, stats.end);
        assert_eq!(hdr.sequence_num, 101);

        let page = rig.jdisk.read_at(512, 512);
        let blh = BlockListHeader::decode(&page, false).unwrap();
        assert_eq!(blh.sequence(), 101);
        assert!(blh.flags.contains(BlockListFlags::LAST_HEADER));
        assert_eq!(blh.entries()[1].bnum, 9);

        jnl.close().unwrap();
        let (mut j, _) = rig.devs();
        assert!(Journal::is_clean(&mut j).unwrap());
    }

    #[test]
    fn test_crash_before_third_header_update() {
        let rig = Rig::new(4096, 256 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::empty());
        rig.fsdisk.stall_writes(Some(0..64 * KB));

        write_txn(&jnl, &[(1, 0x11)]).unwrap();
        write_txn(&jnl, &[(2, 0x22)]).unwrap();
        // 第三个事务的页都写不下去
        rig.jdisk.set_write_budget(Some(0));
        assert!(write_txn(&jnl, &[(3, 0x33)]).is_err());
        assert!(jnl.is_invalid());

        let crashed = rig.crash();
        rig.fsdisk.stall_writes(None);
        drop(jnl);

        let jnl = crashed.open(JournalFlags::empty()).unwrap();
        let report = jnl.last_replay().unwrap();
        assert_eq!(report.transactions, 2);
        assert_eq!(crashed.block(1), vec![0x11; 4096]);
        assert_eq!(crashed.block(2), vec![0x22; 4096]);
        assert_eq!(crashed.block(3), vec![0u8; 4096]);
    }

    #[test]
    fn test_speculative_scan_recovers_unrecorded_txn() {
        let rig = Rig::new(4096, 256 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::empty());
        rig.fsdisk.stall_writes(Some(0..64 * KB));

        write_txn(&jnl, &[(1, 0x11)]).unwrap();
        // 一页加一块正好两个扇区：页写完，头部更新掉电
        rig.jdisk.set_write_budget(Some(2 * 4096));
        assert!(write_txn(&jnl, &[(2, 0x22)]).is_err());

        let crashed = rig.crash();
        rig.fsdisk.stall_writes(None);
        drop(jnl);

        let hdr = JournalHeader::decode(&crashed.jdisk.read_at(0, 48)).unwrap().header;
        assert_eq!(hdr.end, 4096 + 8192);

        let jnl = crashed.open(JournalFlags::empty()).unwrap();
        let report = jnl.last_replay().unwrap();
        assert_eq!(report.transactions, 2);
        assert_eq!(report.extra_transactions, 1);
        assert_eq!(report.sequence_num, 102);
        assert_eq!(crashed.block(2), vec![0x22; 4096]);
    }

    #[test]
    fn test_last_write_wins_on_same_range() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::empty());
        rig.fsdisk.stall_writes(Some(0..64 * KB));

        write_txn(&jnl, &[(0, 0x01)]).unwrap();
        write_txn(&jnl, &[(0, 0x02)]).unwrap();

        let crashed = rig.crash();
        rig.fsdisk.stall_writes(None);
        drop(jnl);

        let jnl = crashed.open(JournalFlags::empty()).unwrap();
        let report = jnl.last_replay().unwrap();
        assert_eq!(report.transactions, 2);
        assert_eq!(report.buckets, 1);
        assert_eq!(crashed.block(0), vec![0x02; 512]);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::empty());
        rig.fsdisk.stall_writes(Some(0..64 * KB));
        write_txn(&jnl, &[(5, 0x55), (6, 0x66)]).unwrap();
        let crashed = rig.crash();
        rig.fsdisk.stall_writes(None);
        drop(jnl);

        crashed.open(JournalFlags::empty()).unwrap().release();
        let once = crashed.fsdisk.image();
        let jhdr_once = crashed.jdisk.read_at(0, 48);

        let jnl = crashed.open(JournalFlags::empty()).unwrap();
        let report = jnl.last_replay().unwrap();
        assert_eq!(report.transactions, 0);
        jnl.release();
        assert_eq!(crashed.fsdisk.image(), once);
        assert_eq!(crashed.jdisk.read_at(0, 48), jhdr_once);
    }

    #[test]
    fn test_atomicity_under_power_loss() {
        // 三个块、跨两页的事务，在每个扇区边界掉电
        for budget in 0..8u64 {
            let rig = Rig::new(512, 64 * KB, 64 * KB);
            let (j, f) = rig.devs();
            let cfg = JournalConfig {
                tbuffer_size: 1536,
                ..config()
            };
            let jnl = Journal::create(j, f, 0, JournalFlags::empty(), cfg).unwrap();
            rig.fsdisk.stall_writes(Some(0..64 * KB));

            rig.jdisk.set_write_budget(Some(budget * 512));
            let _ = write_txn(&jnl, &[(1, 0x11), (2, 0x22), (3, 0x33)]);
            let crashed = rig.crash();
            rig.fsdisk.stall_writes(None);
            drop(jnl);

            let jnl = crashed.open(JournalFlags::empty()).unwrap();
            let present: Vec<bool> = (1..=3)
                .map(|b| crashed.block(b) != vec![0u8; 512])
                .collect();
            assert!(
                present.iter().all(|p| *p) || present.iter().all(|p| !*p),
                "budget {} left a partial transaction: {:?}",
                budget,
                present
            );
            drop(jnl);
        }
    }

    #[test]
    fn test_flipped_payload_byte_is_not_applied() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::empty());
        rig.fsdisk.stall_writes(Some(0..64 * KB));
        write_txn(&jnl, &[(1, 0x11)]).unwrap();
        write_txn(&jnl, &[(2, 0x22)]).unwrap();
        let crashed = rig.crash();
        rig.fsdisk.stall_writes(None);
        drop(jnl);

        // 第二个事务：页头在 1536，负载在 2048
        let mut byte = crashed.jdisk.read_at(2048 + 100, 1);
        byte[0] ^= 0xff;
        crashed.jdisk.write_at(2048 + 100, &byte);

        let jnl = crashed.open(JournalFlags::empty()).unwrap();
        let report = jnl.last_replay().unwrap();
        assert_eq!(report.transactions, 1);
        assert_eq!(report.retries, 1);
        assert_eq!(crashed.block(1), vec![0x11; 512]);
        assert_eq!(crashed.block(2), vec![0u8; 512]);
    }

    #[test]
    fn test_corrupt_first_txn_fails_replay() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::empty());
        rig.fsdisk.stall_writes(Some(0..64 * KB));
        write_txn(&jnl, &[(1, 0x11)]).unwrap();
        let crashed = rig.crash();
        rig.fsdisk.stall_writes(None);
        drop(jnl);

        crashed.jdisk.write_at(1024, &[0x5a; 16]);
        let err = crashed.open(JournalFlags::empty()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    // ----- 组提交与并发 -----

    #[test]
    fn test_group_commit_defers_small_txn() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::empty());

        jnl.start_transaction().unwrap();
        let buf = BlockBuf::zeroed(7, 512);
        let token = jnl.modify_block_start(&buf).unwrap();
        jnl.modify_block_end(token, None).unwrap();
        jnl.end_transaction().unwrap();

        let stats = jnl.stats();
        assert_eq!(stats.committed, 0);
        assert_eq!(stats.deferred, 1);
        assert!(buf.is_locked());

        // 下一个事务复用缓冲的事务，同一块不会阻塞
        jnl.start_transaction().unwrap();
        let token = jnl.modify_block_start(&buf).unwrap();
        jnl.modify_block_end(token, None).unwrap();
        jnl.end_transaction().unwrap();

        jnl.flush(FlushMode::Journal).unwrap();
        assert_eq!(jnl.stats().committed, 1);
        assert!(!buf.is_locked());
    }

    #[test]
    fn test_no_group_commit_flag() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::NO_GROUP_COMMIT);
        jnl.start_transaction().unwrap();
        let buf = BlockBuf::zeroed(7, 512);
        let token = jnl.modify_block_start(&buf).unwrap();
        jnl.modify_block_end(token, None).unwrap();
        jnl.end_transaction().unwrap();
        assert_eq!(jnl.stats().committed, 1);
    }

    #[test]
    fn test_nested_transactions() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::NO_GROUP_COMMIT);
        jnl.start_transaction().unwrap();
        jnl.start_transaction().unwrap();
        let buf = BlockBuf::zeroed(2, 512);
        let token = jnl.modify_block_start(&buf).unwrap();
        jnl.modify_block_end(token, None).unwrap();
        jnl.end_transaction().unwrap();
        assert_eq!(jnl.stats().committed, 0);
        jnl.end_transaction().unwrap();
        assert_eq!(jnl.stats().committed, 1);
    }

    #[test]
    fn test_second_thread_waits_for_owner() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = Arc::new(rig.create(JournalFlags::empty()));
        jnl.start_transaction().unwrap();

        let entered = Arc::new(AtomicBool::new(false));
        let handle = {
            let jnl = Arc::clone(&jnl);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                jnl.start_transaction().unwrap();
                entered.store(true, Ordering::SeqCst);
                jnl.end_transaction().unwrap();
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!entered.load(Ordering::SeqCst));
        jnl.end_transaction().unwrap();
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic]
    fn test_end_without_ownership_panics() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::empty());
        let _ = jnl.end_transaction();
    }

    #[test]
    fn test_async_commit() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::ASYNC_COMMIT | JournalFlags::NO_GROUP_COMMIT);
        for i in 0..10u64 {
            jnl.start_transaction().unwrap();
            let buf = BlockBuf::new(i, vec![i as u8 + 1; 512]);
            let token = jnl.modify_block_start(&buf).unwrap();
            jnl.modify_block_end(token, None).unwrap();
            jnl.end_transaction().unwrap();
        }
        jnl.flush(FlushMode::Full).unwrap();
        for i in 0..10u64 {
            assert_eq!(rig.block(i), vec![i as u8 + 1; 512]);
        }
        assert_eq!(jnl.stats().committed, 10);
    }

    #[test]
    fn test_journal_wraps_many_times() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::empty());
        for round in 0..200u64 {
            write_txn(&jnl, &[(round % 32, round as u8), ((round + 7) % 32, 0xee)]).unwrap();
        }
        // 回收旧事务前先把它们的目标块刷到盘上
        assert!(rig.fsdisk.flushes() > 0);
        jnl.flush(FlushMode::Full).unwrap();
        let stats = jnl.stats();
        assert_eq!(stats.committed, 200);
        assert!(stats.free_space <= 64 * KB - 512);
        assert_eq!(rig.block(199 % 32), vec![199u8; 512]);
        assert!(rig.jdisk.flushes() > 0);
        jnl.close().unwrap();
    }

    // ----- 空间、失效与回调 -----

    #[test]
    fn test_reserve_gives_up_when_writeback_stalls() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let (j, f) = rig.devs();
        let cfg = JournalConfig {
            reserve_retries: 5,
            reserve_wait: Duration::from_millis(2),
            ..config()
        };
        let jnl = Journal::create(j, f, 0, JournalFlags::empty(), cfg).unwrap();
        rig.fsdisk.stall_writes(Some(0..64 * KB));

        let mut result = Ok(());
        for i in 0..200u64 {
            result = write_txn(&jnl, &[(i % 64, 1)]);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result.unwrap_err().kind(), ErrorKind::NoSpace);
        assert!(jnl.is_invalid());
        rig.fsdisk.stall_writes(None);
        jnl.release();
    }

    #[test]
    fn test_reserve_hints_writeback_while_oldest_in_flight() {
        let rig = Rig::new(512, 32 * KB, 64 * KB);
        let (j, f) = rig.devs();
        let hints = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hints);
        let cfg = JournalConfig {
            reserve_retries: 3,
            reserve_wait: Duration::from_millis(2),
            ..config()
        }
        .with_writeback_hint(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let jnl = Journal::create(j, f, 0, JournalFlags::empty(), cfg).unwrap();
        rig.fsdisk.stall_writes(Some(0..64 * KB));

        // 每个事务 3584 字节，第 9 个放不下，而旧起点环远未满
        let blocks: Vec<(u64, u8)> = (0..6).map(|b| (b, 0x77)).collect();
        let mut result = Ok(());
        for _ in 0..12 {
            result = write_txn(&jnl, &blocks);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result.unwrap_err().kind(), ErrorKind::NoSpace);
        assert!(hints.load(Ordering::SeqCst) >= 3);
        rig.fsdisk.stall_writes(None);
        jnl.release();
    }

    #[test]
    fn test_oversized_txn_is_rejected() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::empty());
        jnl.start_transaction().unwrap();
        let big = BlockBuf::zeroed(0, 64 * KB as usize);
        assert_eq!(
            jnl.modify_block_start(&big).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        let odd = BlockBuf::zeroed(0, 700);
        assert_eq!(
            jnl.modify_block_start(&odd).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        jnl.end_transaction().unwrap();
    }

    #[test]
    fn test_journal_write_failure_invalidates() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::empty());
        rig.jdisk.fail_writes(Some(512..64 * KB));

        let failed = Arc::new(AtomicBool::new(false));
        jnl.start_transaction().unwrap();
        let buf = BlockBuf::zeroed(3, 512);
        let token = jnl.modify_block_start(&buf).unwrap();
        let flag = Arc::clone(&failed);
        jnl.modify_block_end(
            token,
            Some(Box::new(move |res: Result<()>| {
                flag.store(res.is_err(), Ordering::SeqCst)
            })),
        )
        .unwrap();
        jnl.request_immediate_flush();
        assert!(jnl.end_transaction().is_err());

        assert!(failed.load(Ordering::SeqCst));
        assert!(!buf.is_locked());
        assert_eq!(
            jnl.start_transaction().unwrap_err().kind(),
            ErrorKind::Invalid
        );
    }

    #[test]
    fn test_hooks_and_kill() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::empty());
        let done = Arc::new(AtomicUsize::new(0));

        jnl.start_transaction().unwrap();
        let keep = BlockBuf::new(1, vec![0x10; 512]);
        let gone = BlockBuf::new(2, vec![0x20; 512]);
        for buf in [&keep, &gone] {
            let token = jnl.modify_block_start(buf).unwrap();
            let counter = Arc::clone(&done);
            jnl.modify_block_end(
                token,
                Some(Box::new(move |res: Result<()>| {
                    assert!(res.is_ok());
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        }
        jnl.kill_block(&gone);
        assert!(!gone.is_locked());
        jnl.request_immediate_flush();
        jnl.end_transaction().unwrap();
        jnl.flush(FlushMode::Full).unwrap();

        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(rig.block(1), vec![0x10; 512]);
        assert_eq!(rig.block(2), vec![0u8; 512]);
    }

    #[test]
    fn test_modify_abort_unlocks_new_block() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::empty());
        jnl.start_transaction().unwrap();
        let buf = BlockBuf::zeroed(1, 512);
        let token = jnl.modify_block_start(&buf).unwrap();
        assert!(buf.is_locked());
        jnl.modify_block_abort(token);
        assert!(!buf.is_locked());
        jnl.end_transaction().unwrap();
    }

    #[test]
    fn test_trims_discarded_after_writeback() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::empty());

        jnl.start_transaction().unwrap();
        let buf = BlockBuf::zeroed(1, 512);
        let token = jnl.modify_block_start(&buf).unwrap();
        jnl.modify_block_end(token, None).unwrap();
        jnl.trim_extent(8192, 4096).unwrap();
        jnl.trim_extent(12288, 4096).unwrap();
        jnl.trim_extent_free(8192, 512).unwrap();
        jnl.request_immediate_flush();
        jnl.end_transaction().unwrap();
        jnl.flush(FlushMode::Full).unwrap();

        assert_eq!(rig.fsdisk.discards(), vec![(17, 15)]);
    }

    #[test]
    fn test_trims_only_txn() {
        let rig = Rig::new(512, 64 * KB, 64 * KB);
        let jnl = rig.create(JournalFlags::empty());
        jnl.start_transaction().unwrap();
        jnl.trim_extent(0, 1024).unwrap();
        jnl.request_immediate_flush();
        jnl.end_transaction().unwrap();
        jnl.close().unwrap();
        assert_eq!(rig.fsdisk.discards(), vec![(0, 2)]);
    }

    #[test]
    fn test_helpers() {
        assert_eq!(effective_tbuffer(128 * 1024, 256 * 1024, 4096), 128 * 1024);
        assert_eq!(effective_tbuffer(4 << 20, 64 << 20, 512), MAX_TBUFFER_SIZE);
        assert_eq!(effective_tbuffer(128 * 1024, 64 * 1024, 512), 32 * 1024);
        assert_eq!(blhdr_size_for(128 * 1024, 4096), 4096);
        // 16 + (256 + 1) * 16 = 4128
        assert_eq!(blhdr_size_for(128 * 1024, 512), 4608);
    }
}
