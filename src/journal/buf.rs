//! 日志块缓冲区与修改令牌
//!
//! [`BlockBuf`] 是文件系统交给日志的块缓冲区，多个句柄共享同一份数据。
//! 在事务中修改它必须先通过 `modify_block_start` 拿到一个 [`ModifyToken`]，
//! 令牌只能被 `modify_block_end` 消费一次；丢弃令牌等价于 abort。
//!
//! 每个缓冲区记录：
//! - 锁定它的事务 ID（提交完成前其它事务只能等待）
//! - 是否有未消费的令牌
//! - 代数（generation），kill 或提交后旧令牌全部失效

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::Result;

/// 目标块写完后的回调
pub type EndWriteCallback = Box<dyn FnOnce(Result<()>) + Send>;

#[derive(Default)]
struct BufState {
    /// Locking transaction ID
    owner_txn: Option<u64>,
    /// A token has been handed out and not consumed yet
    token_out: bool,
    generation: u64,
    /// Entry exists in the locking transaction
    registered: bool,
}

struct BufInner {
    blkno: u64,
    size: usize,
    data: Mutex<Vec<u8>>,
    state: Mutex<BufState>,
    cv: Condvar,
}

/// 块缓冲区
///
/// `blkno` 以日志物理块大小为单位，数据长度必须是该大小的整数倍。
#[derive(Clone)]
pub struct BlockBuf {
    inner: Arc<BufInner>,
}

impl BlockBuf {
    /// 用给定内容创建缓冲区
    ///
    /// # 参数
    /// * `blkno` - 文件系统区域内的块号
    /// * `data` - 块内容
    pub fn new(blkno: u64, data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(BufInner {
                blkno,
                size: data.len(),
                data: Mutex::new(data),
                state: Mutex::new(BufState::default()),
                cv: Condvar::new(),
            }),
        }
    }

    /// 创建全零缓冲区
    pub fn zeroed(blkno: u64, size: usize) -> Self {
        Self::new(blkno, vec![0u8; size])
    }

    /// 块号
    pub fn blkno(&self) -> u64 {
        self.inner.blkno
    }

    /// 数据长度
    pub fn len(&self) -> usize {
        self.inner.size
    }

    /// 缓冲区长度是否为 0
    pub fn is_empty(&self) -> bool {
        self.inner.size == 0
    }

    /// 当前内容的拷贝
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.data.lock().clone()
    }

    /// 只读访问当前内容
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.inner.data.lock())
    }

    /// 是否被某个事务锁定
    pub fn is_locked(&self) -> bool {
        self.inner.state.lock().owner_txn.is_some()
    }

    pub(crate) fn same(&self, other: &BlockBuf) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn copy_into(&self, dst: &mut [u8]) {
        dst.copy_from_slice(&self.inner.data.lock());
    }

    /// 为事务 `txn_id` 锁定缓冲区并发出令牌
    ///
    /// 被其它事务锁定时阻塞，直到那个事务提交或放弃。
    ///
    /// # 返回
    /// 新令牌的代数
    pub(crate) fn acquire(&self, txn_id: u64) -> u64 {
        let mut st = self.inner.state.lock();
        while matches!(st.owner_txn, Some(t) if t != txn_id) {
            self.inner.cv.wait(&mut st);
        }
        if st.token_out {
            panic!(
                "[JOURNAL] block {} already has an outstanding modify token",
                self.inner.blkno
            );
        }
        st.owner_txn = Some(txn_id);
        st.token_out = true;
        st.generation += 1;
        st.generation
    }

    /// 消费令牌并把缓冲区登记到事务中
    ///
    /// # 返回
    /// 之前是否未登记
    pub(crate) fn register(&self, generation: u64) -> bool {
        let mut st = self.inner.state.lock();
        if !st.token_out || st.generation != generation {
            panic!(
                "[JOURNAL] stale modify token for block {}",
                self.inner.blkno
            );
        }
        st.token_out = false;
        let newly = !st.registered;
        st.registered = true;
        newly
    }

    /// 放弃令牌；未登记的缓冲区随之解锁
    pub(crate) fn release_token(&self, generation: u64) {
        let mut st = self.inner.state.lock();
        if !st.token_out || st.generation != generation {
            return;
        }
        st.token_out = false;
        if !st.registered {
            st.owner_txn = None;
            self.inner.cv.notify_all();
        }
    }

    /// 解锁并使所有旧令牌失效（kill、提交完成或放弃时调用）
    pub(crate) fn unlock(&self) {
        let mut st = self.inner.state.lock();
        st.generation += 1;
        st.token_out = false;
        st.registered = false;
        st.owner_txn = None;
        self.inner.cv.notify_all();
    }

    /// 令牌的代数是否仍然有效
    pub(crate) fn token_valid(&self, generation: u64) -> bool {
        let st = self.inner.state.lock();
        st.token_out && st.generation == generation
    }

    /// 锁定它的事务 ID
    pub(crate) fn locked_by(&self) -> Option<u64> {
        self.inner.state.lock().owner_txn
    }

    #[cfg(test)]
    pub(crate) fn is_registered(&self) -> bool {
        self.inner.state.lock().registered
    }
}

impl fmt::Debug for BlockBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("BlockBuf")
            .field("blkno", &self.inner.blkno)
            .field("size", &self.inner.size)
            .field("owner_txn", &st.owner_txn)
            .field("token_out", &st.token_out)
            .field("registered", &st.registered)
            .finish()
    }
}

/// 修改令牌
///
/// 由 `Journal::modify_block_start` 发出，持有期间可以修改缓冲区内容。
/// 只能交给 `modify_block_end` 消费一次。
pub struct ModifyToken {
    buf: BlockBuf,
    generation: u64,
    consumed: bool,
}

impl ModifyToken {
    pub(crate) fn new(buf: BlockBuf, generation: u64) -> Self {
        Self {
            buf,
            generation,
            consumed: false,
        }
    }

    /// 令牌对应的缓冲区
    pub fn buf(&self) -> &BlockBuf {
        &self.buf
    }

    /// 修改缓冲区内容
    ///
    /// 令牌已经因为 kill 失效时同样是编程错误。
    pub fn with_data_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        if !self.buf.token_valid(self.generation) {
            panic!(
                "[JOURNAL] modify token for block {} is no longer valid",
                self.buf.blkno()
            );
        }
        f(&mut self.buf.inner.data.lock())
    }

    pub(crate) fn consume(mut self) -> (BlockBuf, u64) {
        self.consumed = true;
        (self.buf.clone(), self.generation)
    }
}

impl Drop for ModifyToken {
    fn drop(&mut self) {
        if !self.consumed {
            self.buf.release_token(self.generation);
        }
    }
}

impl fmt::Debug for ModifyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModifyToken")
            .field("blkno", &self.buf.blkno())
            .field("generation", &self.generation)
            .finish()
    }
}
