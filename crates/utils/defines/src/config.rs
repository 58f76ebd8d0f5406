const KB: usize = 1024;
const MB: usize = 1024 * KB;

/// 一个页大小的 bit 数
pub const PAGE_SIZE_BITS: usize = 12;
/// 页大小
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_BITS;
/// 页内偏移的掩码
pub const PAGE_OFFSET_MASK: usize = PAGE_SIZE - 1;

/// 块设备的扇区大小
pub const SECTOR_SIZE: usize = 512;
/// 一页对应的扇区数，也是一个交换槽占用的扇区数
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// 用户地址空间的上界，内核映射在此之上
pub const PHYS_BASE: usize = 0xC000_0000;
/// 最低的可映射用户地址。0 号页永不映射，以便捕获空指针
pub const USER_BASE: usize = PAGE_SIZE;

/// 用户栈的最大大小
pub const MAX_STACK_SIZE: usize = 4 * MB;
/// 栈指针以下仍视为栈增长的字节数。
///
/// x86 的 `PUSHA` 会在调整栈指针之前先写 32 字节
pub const STACK_FAULT_SLACK: usize = 32;

/// 用户页帧池的默认帧数
pub const USER_FRAME_COUNT: usize = 256;
/// 用户页帧池在内核地址空间中的起始地址
pub const USER_POOL_BASE: usize = 0xC040_0000;
