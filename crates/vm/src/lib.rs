//! 教学内核的用户虚存子系统
//!
//! 包括帧表（时钟算法换出、共享页帧的占用者集合）、交换分区、补充页表、
//! 缺页处理，以及进程创建与退出时的页共享和回收。
//!
//! 页表、文件和块设备由内核其他部分提供，见 [`hal`]。

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

mod address;
mod config;
mod fault;
mod frame_table;
pub mod hal;
mod manager;
mod mmap;
mod owner;
mod pool;
mod share;
mod space;
mod spt;
mod swap;

#[cfg(test)]
mod test_utils;

pub use address::{FrameAddr, VirtAddr, VirtPageNum};
pub use config::VmConfig;
pub use fault::FaultKind;
pub use hal::{
    AccessFlags, BackingFile, BlockDevice, BlockDeviceHandle, FileHandle, PageTable,
    PageTableHandle, Translation,
};
pub use manager::{VirtualMemory, VmStats};
pub use owner::{Backing, OwnerRecord, SpaceId};
pub use space::AddressSpace;
pub use spt::{MapId, PageKind};
pub use swap::SlotId;
