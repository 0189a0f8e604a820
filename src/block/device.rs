//! 块设备核心类型

use crate::error::{Error, ErrorKind, Result};

/// 块设备接口
///
/// 实现此 trait 以提供底层块设备访问。日志区域和文件系统区域
/// 都通过它读写，二者可以是同一设备上的不同分区。
///
/// # 示例
///
/// ```rust,ignore
/// use jnl_core::{BlockDevice, Result};
///
/// struct MyDevice {
///     // ...
/// }
///
/// impl BlockDevice for MyDevice {
///     fn sector_size(&self) -> u32 {
///         4096
///     }
///
///     fn total_sectors(&self) -> u64 {
///         1000000
///     }
///
///     fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize> {
///         // 实现扇区读取
///         Ok(count as usize * self.sector_size() as usize)
///     }
///
///     fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize> {
///         // 实现扇区写入
///         Ok(count as usize * self.sector_size() as usize)
///     }
/// }
/// ```
pub trait BlockDevice {
    /// 物理扇区大小，也就是日志使用的物理块大小（通常 512 或 4096）
    fn sector_size(&self) -> u32;

    /// 总扇区数
    fn total_sectors(&self) -> u64;

    /// 读取扇区
    ///
    /// # 参数
    ///
    /// * `lba` - 起始扇区号
    /// * `count` - 要读取的扇区数
    /// * `buf` - 目标缓冲区（大小至少为 count * sector_size）
    ///
    /// # 返回
    ///
    /// 成功返回实际读取的字节数
    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<usize>;

    /// 写入扇区
    ///
    /// # 参数
    ///
    /// * `lba` - 起始扇区号
    /// * `count` - 要写入的扇区数
    /// * `buf` - 源缓冲区（大小至少为 count * sector_size）
    ///
    /// # 返回
    ///
    /// 成功返回实际写入的字节数
    fn write_blocks(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<usize>;

    /// 刷新设备写缓存
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// 丢弃提示（TRIM）
    ///
    /// 默认实现什么都不做。
    fn discard(&mut self, _lba: u64, _count: u64) -> Result<()> {
        Ok(())
    }

    /// 是否只读
    fn is_read_only(&self) -> bool {
        false
    }
}

/// 块设备区域包装器
///
/// 把底层设备的一段字节范围（分区）暴露为按字节寻址的区域，
/// 并统计读写次数。日志区域和文件系统区域各用一个实例。
///
/// # 并发使用
///
/// BlockDev 本身不包含内部锁。日志引擎内部用
/// `Arc<parking_lot::Mutex<BlockDev<D>>>` 在提交线程和写回线程之间共享。
pub struct BlockDev<D> {
    /// 底层设备
    device: D,
    /// 分区偏移（字节）
    partition_offset: u64,
    /// 分区大小（字节）
    partition_size: u64,
    /// 读取次数
    read_count: u64,
    /// 写入次数
    write_count: u64,
    /// 刷新次数
    flush_count: u64,
}

impl<D: BlockDevice> BlockDev<D> {
    /// 创建覆盖整个设备的区域
    pub fn new(device: D) -> Result<Self> {
        let sector_size = device.sector_size();
        if sector_size == 0 || !sector_size.is_power_of_two() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Sector size must be a power of two",
            ));
        }

        let partition_size = device.total_sectors() * sector_size as u64;

        Ok(Self {
            device,
            partition_offset: 0,
            partition_size,
            read_count: 0,
            write_count: 0,
            flush_count: 0,
        })
    }

    /// 创建指定分区的区域
    ///
    /// # 参数
    ///
    /// * `device` - 底层块设备
    /// * `offset` - 分区起始偏移（字节，扇区对齐）
    /// * `size` - 分区大小（字节）
    pub fn new_partition(device: D, offset: u64, size: u64) -> Result<Self> {
        let mut bd = Self::new(device)?;
        let sector_size = bd.sector_size() as u64;
        if offset % sector_size != 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Partition offset must be sector aligned",
            ));
        }
        if offset.checked_add(size).map_or(true, |e| e > bd.partition_size) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Partition exceeds device size",
            ));
        }
        bd.partition_offset = offset;
        bd.partition_size = size;
        Ok(bd)
    }

    /// 获取底层设备的引用
    pub fn device(&self) -> &D {
        &self.device
    }

    /// 获取底层设备的可变引用
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// 获取物理扇区大小
    pub fn sector_size(&self) -> u32 {
        self.device.sector_size()
    }

    /// 获取分区偏移
    pub fn partition_offset(&self) -> u64 {
        self.partition_offset
    }

    /// 获取分区大小
    pub fn partition_size(&self) -> u64 {
        self.partition_size
    }

    /// 获取读取次数
    pub fn read_count(&self) -> u64 {
        self.read_count
    }

    /// 获取写入次数
    pub fn write_count(&self) -> u64 {
        self.write_count
    }

    /// 获取刷新次数
    pub fn flush_count(&self) -> u64 {
        self.flush_count
    }

    // 内部辅助方法

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.partition_size => Ok(()),
            _ => Err(Error::new(
                ErrorKind::InvalidInput,
                "Access beyond partition end",
            )),
        }
    }

    /// 分区内字节偏移对应的 (起始扇区, 扇区内偏移, 扇区数)
    fn sector_span(&self, offset: u64, len: usize) -> (u64, usize, u32) {
        let sector_size = self.device.sector_size() as u64;
        let abs = self.partition_offset + offset;
        let lba = abs / sector_size;
        let head = (abs % sector_size) as usize;
        let count = (head as u64 + len as u64).div_ceil(sector_size) as u32;
        (lba, head, count)
    }

    // ===== 字节接口 =====

    /// 读取字节
    ///
    /// 对齐的请求直接读入 `buf`，非对齐的请求经过临时缓冲区。
    ///
    /// # 参数
    ///
    /// * `offset` - 分区内字节偏移量
    /// * `buf` - 目标缓冲区
    ///
    /// # 返回
    ///
    /// 成功返回读取的字节数
    pub fn read_bytes(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let len = buf.len();
        if len == 0 {
            return Ok(0);
        }
        self.check_range(offset, len)?;

        let sector_size = self.device.sector_size() as usize;
        let (lba, head, count) = self.sector_span(offset, len);
        self.read_count += 1;

        if head == 0 && len % sector_size == 0 {
            self.device.read_blocks(lba, count, buf)?;
            return Ok(len);
        }

        let mut temp = vec![0u8; count as usize * sector_size];
        self.device.read_blocks(lba, count, &mut temp)?;
        buf.copy_from_slice(&temp[head..head + len]);
        Ok(len)
    }

    /// 写入字节
    ///
    /// 非对齐的请求先读出相关扇区再整体写回。
    ///
    /// # 参数
    ///
    /// * `offset` - 分区内字节偏移量
    /// * `buf` - 源数据缓冲区
    ///
    /// # 返回
    ///
    /// 成功返回写入的字节数
    pub fn write_bytes(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        let len = buf.len();
        if len == 0 {
            return Ok(0);
        }
        if self.device.is_read_only() {
            return Err(Error::new(ErrorKind::Unsupported, "Device is read-only"));
        }
        self.check_range(offset, len)?;

        let sector_size = self.device.sector_size() as usize;
        let (lba, head, count) = self.sector_span(offset, len);
        self.write_count += 1;

        if head == 0 && len % sector_size == 0 {
            self.device.write_blocks(lba, count, buf)?;
            return Ok(len);
        }

        let mut temp = vec![0u8; count as usize * sector_size];
        self.device.read_blocks(lba, count, &mut temp)?;
        temp[head..head + len].copy_from_slice(buf);
        self.device.write_blocks(lba, count, &temp)?;
        Ok(len)
    }

    /// 刷新设备缓存
    pub fn flush(&mut self) -> Result<()> {
        self.flush_count += 1;
        self.device.flush()
    }

    /// 对分区内的字节范围发出丢弃提示
    ///
    /// 只丢弃完整落在范围内的扇区。
    pub fn discard(&mut self, offset: u64, len: u64) -> Result<()> {
        self.check_range(offset, len as usize)?;
        let sector_size = self.device.sector_size() as u64;
        let abs_start = (self.partition_offset + offset).div_ceil(sector_size);
        let abs_end = (self.partition_offset + offset + len) / sector_size;
        if abs_end <= abs_start {
            return Ok(());
        }
        self.device.discard(abs_start, abs_end - abs_start)
    }
}
