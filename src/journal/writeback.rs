//! 目标块写回线程
//!
//! 事务的日志头写入成功后，每个块的内容按提交顺序发给这个线程，
//! 由它写到文件系统区域中的真实位置并驱动完成跟踪。
//! 单个线程按 FIFO 处理请求，同一块的多次写回不会乱序。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::block::BlockDevice;
use crate::error::{Error, ErrorKind, Result};

use super::completion::CommittedTxn;
use super::engine::Shared;
use super::trans::{PendingWrite, TrimExtent};
use super::JournalError;

pub(crate) enum WriteRequest {
    /// 把一个块写回目标位置
    Block {
        txn: Arc<CommittedTxn>,
        write: PendingWrite,
    },
    /// 事务没有需要写回的块，直接完成
    Complete(Arc<CommittedTxn>),
    /// 只有 trim 的事务
    Discard(Vec<TrimExtent>),
    Shutdown,
}

/// 写回线程句柄
pub(crate) struct Writeback {
    tx: Mutex<Option<Sender<WriteRequest>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    abandon: AtomicBool,
}

impl Writeback {
    pub(crate) fn new() -> Self {
        Self {
            tx: Mutex::new(None),
            handle: Mutex::new(None),
            abandon: AtomicBool::new(false),
        }
    }

    /// 提交一个请求
    pub(crate) fn submit(&self, req: WriteRequest) -> Result<()> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx
                .send(req)
                .map_err(|_| Error::new(ErrorKind::Io, "Writeback worker has stopped")),
            None => Err(Error::new(ErrorKind::Io, "Writeback worker has stopped")),
        }
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.abandon.load(Ordering::Acquire)
    }

    /// 停止写回线程
    ///
    /// # 参数
    /// * `abandon` - 丢弃尚未处理的请求（回调收到错误）
    pub(crate) fn shutdown(&self, abandon: bool) {
        if abandon {
            self.abandon.store(true, Ordering::Release);
        }
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(WriteRequest::Shutdown);
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::error!("[WRITEBACK] worker thread panicked");
            }
        }
    }
}

impl<D: BlockDevice + Send + 'static> Shared<D> {
    /// 启动写回线程
    pub(crate) fn start_writeback(self: &Arc<Self>) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("jnl-writeback".into())
            .spawn(move || shared.writeback_loop(rx))
            .map_err(|_| Error::new(ErrorKind::NoMemory, "Cannot spawn writeback thread"))?;
        *self.writeback.tx.lock() = Some(tx);
        *self.writeback.handle.lock() = Some(handle);
        Ok(())
    }

    fn writeback_loop(&self, rx: Receiver<WriteRequest>) {
        log::debug!("[WRITEBACK] worker started");
        for req in rx {
            match req {
                WriteRequest::Shutdown => break,
                WriteRequest::Block { txn, write } => self.write_home(&txn, write),
                WriteRequest::Complete(txn) => self.block_done(&txn, 0),
                WriteRequest::Discard(trims) => self.discard(&trims),
            }
        }
        log::debug!("[WRITEBACK] worker stopped");
    }

    fn write_home(&self, txn: &Arc<CommittedTxn>, write: PendingWrite) {
        let PendingWrite { bnum, data, hook } = write;

        let result = if self.writeback.is_abandoned() {
            Err(JournalError::Invalid.into())
        } else {
            let offset = bnum * self.geo.jhdr_size as u64;
            self.fsdev.lock().write_bytes(offset, &data).map(|_| ())
        };

        let ok = result.is_ok();
        if let Err(err) = &result {
            if !self.writeback.is_abandoned() {
                log::error!(
                    "[WRITEBACK] block {} of txn {} failed: {}",
                    bnum,
                    txn.id,
                    err
                );
                self.invalidate("target block write failed");
            }
        }
        if let Some(hook) = hook {
            hook(result);
        }

        // 写失败的事务不回收，空间留给下次挂载时重放
        if ok {
            self.block_done(txn, data.len() as u64);
        }
    }

    pub(crate) fn discard(&self, trims: &[TrimExtent]) {
        if trims.is_empty() || self.writeback.is_abandoned() {
            return;
        }
        let mut fsdev = self.fsdev.lock();
        for trim in trims {
            if let Err(err) = fsdev.discard(trim.offset, trim.length) {
                log::warn!(
                    "[WRITEBACK] discard {:#x}+{:#x} failed: {}",
                    trim.offset,
                    trim.length,
                    err
                );
            }
        }
    }
}
