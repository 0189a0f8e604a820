//! 二元门
//!
//! 提交流水线上的三道门（flushing、async_io、writing_header）都是这个类型：
//! 一个布尔标志加一个条件变量。加锁和解锁可以发生在不同线程，
//! 异步提交时第二阶段在后台线程里解锁 async_io。

use parking_lot::{Condvar, Mutex};

pub(crate) struct Gate {
    name: &'static str,
    busy: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            busy: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// 等待门空闲后占用
    pub(crate) fn lock(&self) {
        let mut busy = self.busy.lock();
        while *busy {
            self.cv.wait(&mut busy);
        }
        *busy = true;
        log::trace!("[GATE] {} locked", self.name);
    }

    /// 释放门并唤醒所有等待者
    pub(crate) fn unlock(&self) {
        let mut busy = self.busy.lock();
        if !*busy {
            panic!("[GATE] {} unlocked while not held", self.name);
        }
        *busy = false;
        self.cv.notify_all();
        log::trace!("[GATE] {} unlocked", self.name);
    }

    /// 等待门空闲，但不占用
    pub(crate) fn wait_idle(&self) {
        let mut busy = self.busy.lock();
        while *busy {
            self.cv.wait(&mut busy);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_busy(&self) -> bool {
        *self.busy.lock()
    }
}
