//! 日志区域 I/O
//!
//! 在 [`BlockDev`] 之上提供环形读写：越过区域末尾的访问从头部块之后继续。

use parking_lot::Mutex;

use crate::block::{BlockDev, BlockDevice};
use crate::error::{Error, ErrorKind, Result};

use super::types::{Geometry, JournalHeader};

pub(crate) struct JournalIo<D> {
    dev: Mutex<BlockDev<D>>,
    geo: Geometry,
}

impl<D: BlockDevice> JournalIo<D> {
    pub(crate) fn new(dev: BlockDev<D>, geo: Geometry) -> Self {
        Self {
            dev: Mutex::new(dev),
            geo,
        }
    }

    pub(crate) fn into_dev(self) -> BlockDev<D> {
        self.dev.into_inner()
    }

    /// 把 `[off, off + len)` 拆成不跨越区域末尾的若干段
    fn for_each_chunk(
        &self,
        off: u64,
        len: usize,
        mut f: impl FnMut(u64, core::ops::Range<usize>) -> Result<()>,
    ) -> Result<()> {
        let geo = self.geo;
        if len as u64 > geo.capacity() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Journal I/O larger than journal",
            ));
        }
        let mut off = geo.wrap(off);
        let mut done = 0usize;
        while done < len {
            if off < geo.jhdr_size as u64 {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "Journal I/O overlaps the header",
                ));
            }
            let n = ((geo.size - off) as usize).min(len - done);
            f(off, done..done + n)?;
            done += n;
            off = geo.wrap(off + n as u64);
        }
        Ok(())
    }

    /// 从日志偏移 `off` 环形读取
    pub(crate) fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        let mut dev = self.dev.lock();
        self.for_each_chunk(off, len, |pos, range| {
            dev.read_bytes(pos, &mut buf[range]).map(|_| ())
        })
    }

    /// 从日志偏移 `off` 环形写入
    pub(crate) fn write_at(&self, off: u64, data: &[u8]) -> Result<()> {
        let mut dev = self.dev.lock();
        self.for_each_chunk(off, data.len(), |pos, range| {
            dev.write_bytes(pos, &data[range]).map(|_| ())
        })
    }

    /// 写日志头（补零到 jhdr_size）
    pub(crate) fn write_header(&self, hdr: &JournalHeader) -> Result<()> {
        let mut block = vec![0u8; hdr.jhdr_size as usize];
        let bytes = hdr.to_bytes();
        block[..bytes.len()].copy_from_slice(&bytes);
        log::trace!(
            "[JOURNAL] write header start={:#x} end={:#x} seq={}",
            hdr.start,
            hdr.end,
            hdr.sequence_num
        );
        self.dev.lock().write_bytes(0, &block).map(|_| ())
    }

    pub(crate) fn flush(&self) -> Result<()> {
        self.dev.lock().flush()
    }
}
