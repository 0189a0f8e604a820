//! 块设备抽象
//!
//! 提供块设备接口和按字节寻址的分区读写。
//! block/device.rs 中的 `BlockDevice` 是需要外部实现的扇区级接口，
//! `BlockDev` 在其上提供分区边界检查、非对齐读写和计数。

mod device;

pub use device::{BlockDev, BlockDevice};
