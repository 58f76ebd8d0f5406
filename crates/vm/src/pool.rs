//! 用户页帧池
//!
//! 帧表只管理“被谁占用”，实际的内存和空闲链表在这里

use alloc::boxed::Box;

use defines::config::PAGE_SIZE;
use idallocator::RecycleAllocator;
use klocks::SpinMutex;

use crate::address::FrameAddr;

type PageBytes = [u8; PAGE_SIZE];

pub(crate) struct FramePool {
    base: usize,
    pages: Box<[SpinMutex<PageBytes>]>,
    allocator: SpinMutex<RecycleAllocator>,
}

impl FramePool {
    pub fn new(base: usize, count: usize) -> Self {
        let pages = (0..count).map(|_| SpinMutex::new([0; PAGE_SIZE])).collect();
        Self {
            base,
            pages,
            allocator: SpinMutex::new(RecycleAllocator::bounded(0, count)),
        }
    }

    fn index_of(&self, addr: FrameAddr) -> usize {
        let idx = addr.0.wrapping_sub(self.base) / PAGE_SIZE;
        assert!(
            addr.0 >= self.base && addr.0 % PAGE_SIZE == 0 && idx < self.pages.len(),
            "{addr:?} is not a user frame"
        );
        idx
    }

    /// 分配一个物理帧，同时会将该物理帧清空
    pub fn alloc(&self) -> Option<FrameAddr> {
        let idx = self.allocator.lock().alloc()?;
        self.pages[idx].lock_with(|page| page.fill(0));
        Some(FrameAddr(self.base + idx * PAGE_SIZE))
    }

    pub fn dealloc(&self, addr: FrameAddr) {
        let idx = self.index_of(addr);
        self.allocator.lock().dealloc(idx);
    }

    pub fn with_page<R>(&self, addr: FrameAddr, f: impl FnOnce(&PageBytes) -> R) -> R {
        f(&self.pages[self.index_of(addr)].lock())
    }

    pub fn with_page_mut<R>(&self, addr: FrameAddr, f: impl FnOnce(&mut PageBytes) -> R) -> R {
        self.pages[self.index_of(addr)].lock_with(f)
    }

    pub fn free_count(&self) -> usize {
        self.allocator.lock().available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_until_empty_and_zero_on_reuse() {
        let pool = FramePool::new(0x1000_0000, 2);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.alloc(), None);
        assert_eq!(pool.free_count(), 0);

        pool.with_page_mut(a, |page| page[7] = 0xaa);
        pool.dealloc(a);
        let again = pool.alloc().unwrap();
        assert_eq!(again, a);
        pool.with_page(again, |page| assert!(page.iter().all(|&b| b == 0)));
    }

    #[test]
    #[should_panic(expected = "is not a user frame")]
    fn foreign_address_panics() {
        let pool = FramePool::new(0x1000_0000, 1);
        pool.dealloc(FrameAddr(0x2000_0000));
    }
}
