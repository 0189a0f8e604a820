//! 重放合并表
//!
//! 重放按从旧到新的顺序扫描日志，每个块条目插入这张按块号排序的表。
//! 表中任意两项描述的文件系统字节范围都不重叠：新条目插入时，
//! 与它重叠的旧项被删除、截头、截尾或一分为二，新写入总是胜出。

use super::types::Geometry;

/// 一个待重放的范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Bucket {
    /// 文件系统块号（jhdr_size 单位）
    pub(crate) block_num: u64,
    /// 负载在日志中的偏移
    pub(crate) jnl_offset: u64,
    pub(crate) size: u32,
    /// 截断后的项不再有有效校验和，置 0
    pub(crate) cksum: u32,
}

impl Bucket {
    fn start(&self, unit: u64) -> u64 {
        self.block_num * unit
    }

    fn end(&self, unit: u64) -> u64 {
        self.start(unit) + self.size as u64
    }

    /// 截取 `[from, to)`（文件系统字节偏移）这一段
    fn slice(&self, geo: &Geometry, from: u64, to: u64) -> Bucket {
        let unit = geo.jhdr_size as u64;
        let skip = from - self.start(unit);
        Bucket {
            block_num: from / unit,
            jnl_offset: geo.advance(self.jnl_offset, skip),
            size: (to - from) as u32,
            cksum: 0,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct BucketTable {
    buckets: Vec<Bucket>,
}

impl BucketTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.iter()
    }

    /// 插入一个更新的条目
    pub(crate) fn insert(&mut self, geo: &Geometry, new: Bucket) {
        let unit = geo.jhdr_size as u64;
        let ns = new.start(unit);
        let ne = new.end(unit);

        // 表按起点排序且互不重叠，终点同样有序
        let first = self.buckets.partition_point(|b| b.end(unit) <= ns);
        let mut last = first;
        while last < self.buckets.len() && self.buckets[last].start(unit) < ne {
            last += 1;
        }

        let mut replacement = Vec::with_capacity(3);
        if first < last {
            let head = self.buckets[first];
            if head.start(unit) < ns {
                replacement.push(head.slice(geo, head.start(unit), ns));
            }
        }
        replacement.push(new);
        if first < last {
            let tail = self.buckets[last - 1];
            if tail.end(unit) > ne {
                replacement.push(tail.slice(geo, ne, tail.end(unit)));
            }
        }

        self.buckets.splice(first..last, replacement);
    }
}
