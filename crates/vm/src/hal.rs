//! 虚存子系统依赖的外部组件：进程页表、文件、交换分区所在的块设备

use alloc::sync::Arc;

use bitflags::bitflags;

use crate::address::{FrameAddr, VirtPageNum};

bitflags! {
    /// 页表项中由硬件置位的访问位和脏位
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AccessFlags: u8 {
        const ACCESSED = 1 << 0;
        const DIRTY = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub frame: FrameAddr,
    pub writable: bool,
}

/// 单个进程的页表
///
/// 实现需要自己保证并发安全。帧表在持有帧锁时会调用这些方法
pub trait PageTable: Send + Sync {
    /// 建立映射，新映射的访问位和脏位为空
    fn map(&self, vpn: VirtPageNum, frame: FrameAddr, writable: bool);
    /// 撤销映射，返回撤销前的访问位和脏位。未映射时返回空
    fn unmap(&self, vpn: VirtPageNum) -> AccessFlags;
    fn translate(&self, vpn: VirtPageNum) -> Option<Translation>;
    fn access_flags(&self, vpn: VirtPageNum) -> AccessFlags;
    fn clear_flags(&self, vpn: VirtPageNum, flags: AccessFlags);
}

/// 可执行文件或被映射的文件
pub trait BackingFile: Send + Sync {
    /// 返回实际读到的字节数，越过文件末尾时会变少
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize;
    fn write_at(&self, offset: usize, buf: &[u8]) -> usize;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 文件当前是否禁止写入，例如正在运行的可执行文件
    fn write_denied(&self) -> bool {
        false
    }
}

/// 交换分区所在的块设备。`buf` 的长度总是 `SECTOR_SIZE`
pub trait BlockDevice: Send + Sync {
    fn sector_count(&self) -> usize;
    fn read_sector(&self, sector: usize, buf: &mut [u8]);
    fn write_sector(&self, sector: usize, buf: &[u8]);
}

pub type PageTableHandle = Arc<dyn PageTable>;
pub type FileHandle = Arc<dyn BackingFile>;
pub type BlockDeviceHandle = Arc<dyn BlockDevice>;
