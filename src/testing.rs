//! 测试用内存块设备
//!
//! `RamDisk` 可以克隆，所有克隆共享同一份数据，因此日志区域和文件系统
//! 区域可以是同一块盘上的两个分区。支持以下故障注入：
//!
//! - 写入预算：按扇区计，用完后该次写入只落下预算内的扇区并返回错误，
//!   之后的写入全部失败，用来模拟任意位置掉电
//! - 读错误：落在指定字节范围内的读取失败
//! - 写失败：落在指定字节范围内的写入失败
//! - 写阻塞：落在指定字节范围内的写入一直等待，直到解除

use std::ops::Range;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::block::BlockDevice;
use crate::error::{Error, ErrorKind, Result};

struct DiskState {
    sector_size: u32,
    data: Vec<u8>,
    write_budget: Option<u64>,
    fail_reads: Option<Range<u64>>,
    fail_writes: Option<Range<u64>>,
    stall_writes: Option<Range<u64>>,
    discards: Vec<(u64, u64)>,
    flushes: u64,
}

struct Inner {
    state: Mutex<DiskState>,
    cv: Condvar,
}

#[derive(Clone)]
pub struct RamDisk {
    inner: Arc<Inner>,
}

fn overlaps(range: &Option<Range<u64>>, start: u64, end: u64) -> bool {
    range
        .as_ref()
        .map_or(false, |r| r.start < end && start < r.end)
}

impl RamDisk {
    pub fn new(sector_size: u32, sectors: u64) -> Self {
        Self::from_image(sector_size, vec![0u8; (sector_size as u64 * sectors) as usize])
    }

    pub fn from_image(sector_size: u32, data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(DiskState {
                    sector_size,
                    data,
                    write_budget: None,
                    fail_reads: None,
                    fail_writes: None,
                    stall_writes: None,
                    discards: Vec::new(),
                    flushes: 0,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// 当前磁盘内容的拷贝
    pub fn image(&self) -> Vec<u8> {
        self.inner.state.lock().data.clone()
    }

    /// 从当前内容复制出一块独立的盘，相当于掉电后重新上电
    pub fn crash_copy(&self) -> Self {
        let st = self.inner.state.lock();
        Self::from_image(st.sector_size, st.data.clone())
    }

    pub fn read_at(&self, offset: u64, len: usize) -> Vec<u8> {
        let st = self.inner.state.lock();
        st.data[offset as usize..offset as usize + len].to_vec()
    }

    pub fn write_at(&self, offset: u64, bytes: &[u8]) {
        let mut st = self.inner.state.lock();
        st.data[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
    }

    pub fn set_write_budget(&self, budget: Option<u64>) {
        self.inner.state.lock().write_budget = budget;
    }

    pub fn fail_reads(&self, range: Option<Range<u64>>) {
        self.inner.state.lock().fail_reads = range;
    }

    pub fn fail_writes(&self, range: Option<Range<u64>>) {
        self.inner.state.lock().fail_writes = range;
    }

    pub fn stall_writes(&self, range: Option<Range<u64>>) {
        self.inner.state.lock().stall_writes = range;
        self.inner.cv.notify_all();
    }

    pub fn discards(&self) -> Vec<(u64, u64)> {
        self.inner.state.lock().discards.clone()
    }

    pub fn flushes(&self) -> u64 {
        self.inner.state.lock().flushes
    }
}

impl BlockDevice for RamDisk {
    fn sector_size(&self) -> u32 {
        self.inner.state.lock().sector_size
    }

    fn total_sectors(&self) -> u64 {
        let st = self.inner.state.lock();
        st.data.len() as u64 / st.sector_size as u64
    }

    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize> {
        let st = self.inner.state.lock();
        let ss = st.sector_size as u64;
        let start = lba * ss;
        let len = count as u64 * ss;
        if overlaps(&st.fail_reads, start, start + len) {
            return Err(Error::new(ErrorKind::Io, "Injected read error"));
        }
        if start + len > st.data.len() as u64 {
            return Err(Error::new(ErrorKind::InvalidInput, "Read beyond disk end"));
        }
        buf[..len as usize].copy_from_slice(&st.data[start as usize..(start + len) as usize]);
        Ok(len as usize)
    }

    fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize> {
        let mut st = self.inner.state.lock();
        let ss = st.sector_size as u64;
        let start = lba * ss;
        let len = count as u64 * ss;

        while overlaps(&st.stall_writes, start, start + len) {
            self.inner.cv.wait(&mut st);
        }
        if overlaps(&st.fail_writes, start, start + len) {
            return Err(Error::new(ErrorKind::Io, "Injected write error"));
        }
        if start + len > st.data.len() as u64 {
            return Err(Error::new(ErrorKind::InvalidInput, "Write beyond disk end"));
        }

        let allowed = match st.write_budget {
            Some(budget) => len.min(budget / ss * ss),
            None => len,
        };
        st.data[start as usize..(start + allowed) as usize]
            .copy_from_slice(&buf[..allowed as usize]);
        if let Some(budget) = st.write_budget.as_mut() {
            *budget -= allowed;
        }
        if allowed < len {
            return Err(Error::new(ErrorKind::Io, "Simulated power loss"));
        }
        Ok(len as usize)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.state.lock().flushes += 1;
        Ok(())
    }

    fn discard(&mut self, lba: u64, count: u64) -> Result<()> {
        self.inner.state.lock().discards.push((lba, count));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_budget_is_sector_granular() {
        let mut disk = RamDisk::new(512, 8);
        disk.set_write_budget(Some(512 + 100));
        let err = disk.write_blocks(0, 2, &[7u8; 1024]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);

        let image = disk.image();
        assert_eq!(image[511], 7);
        assert_eq!(image[512], 0);
        assert!(disk.write_blocks(4, 1, &[1u8; 512]).is_err());
    }

    #[test]
    fn test_read_injection() {
        let mut disk = RamDisk::new(512, 8);
        disk.fail_reads(Some(1024..1536));
        let mut buf = [0u8; 512];
        assert!(disk.read_blocks(0, 1, &mut buf).is_ok());
        assert!(disk.read_blocks(2, 1, &mut buf).is_err());
    }
}
