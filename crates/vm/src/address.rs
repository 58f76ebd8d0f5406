use core::{
    fmt,
    ops::{Add, Range, Sub},
};

use defines::config::{PAGE_OFFSET_MASK, PAGE_SIZE, PAGE_SIZE_BITS, PHYS_BASE, USER_BASE};

/// 用户虚拟地址
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(C)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    pub const fn page_offset(&self) -> usize {
        self.0 & PAGE_OFFSET_MASK
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.page_offset() == 0
    }

    /// 向下取整页号
    pub const fn vpn_floor(&self) -> VirtPageNum {
        VirtPageNum(self.0 >> PAGE_SIZE_BITS)
    }

    /// 向上取整页号
    pub const fn vpn_ceil(&self) -> VirtPageNum {
        VirtPageNum(self.0.div_ceil(PAGE_SIZE))
    }

    /// 是否落在用户可映射的范围内，即 `[USER_BASE, PHYS_BASE)`
    pub const fn is_user(&self) -> bool {
        self.0 >= USER_BASE && self.0 < PHYS_BASE
    }
}

impl Add<usize> for VirtAddr {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA:{:#x}", self.0)
    }
}

/// 虚拟页号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtPageNum(pub usize);

impl VirtPageNum {
    pub const fn page_start(&self) -> VirtAddr {
        VirtAddr(self.0 << PAGE_SIZE_BITS)
    }

    pub fn with_offset(self, offset: usize) -> VirtAddr {
        VirtAddr(self.page_start().0 + offset)
    }

    /// 覆盖 `[start, start + len)` 的所有页
    pub fn covering(start: VirtAddr, len: usize) -> Range<VirtPageNum> {
        start.vpn_floor()..VirtAddr(start.0 + len).vpn_ceil()
    }

    pub fn iter(range: Range<VirtPageNum>) -> impl Iterator<Item = VirtPageNum> + Clone {
        (range.start.0..range.end.0).map(VirtPageNum)
    }
}

impl Add<usize> for VirtPageNum {
    type Output = Self;

    fn add(self, len: usize) -> Self::Output {
        Self(self.0 + len)
    }
}

impl Sub<usize> for VirtPageNum {
    type Output = Self;

    fn sub(self, len: usize) -> Self::Output {
        Self(self.0 - len)
    }
}

/// 页帧在内核中可见的地址，也是帧表的键
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameAddr(pub usize);

impl fmt::Debug for FrameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KA:{:#x}", self.0)
    }
}
