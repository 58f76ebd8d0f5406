#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{vec, vec::Vec};

/// 基于回收的分配器，即用 vector 收集释放的 id
///
/// 可以设置上界，超出上界时分配失败
#[derive(Clone)]
pub struct RecycleAllocator {
    current: usize,
    end: usize,
    recycled: Vec<usize>,
}

impl Default for RecycleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RecycleAllocator {
    /// 默认从 0 开始分配，不设上界
    pub const fn new() -> Self {
        Self::bounded(0, usize::MAX)
    }

    /// 只分配 `[begin, end)` 内的 id
    pub const fn bounded(begin: usize, end: usize) -> Self {
        RecycleAllocator {
            current: begin,
            end,
            recycled: Vec::new(),
        }
    }

    pub fn alloc(&mut self) -> Option<usize> {
        if let Some(id) = self.recycled.pop() {
            Some(id)
        } else if self.current < self.end {
            self.current += 1;
            Some(self.current - 1)
        } else {
            None
        }
    }

    pub fn dealloc(&mut self, id: usize) {
        debug_assert!(id < self.current);
        debug_assert!(!self.recycled.contains(&id), "id {id} has been deallocated!");
        self.recycled.push(id);
    }

    /// 还能分配出去的 id 数
    pub fn available(&self) -> usize {
        self.end - self.current + self.recycled.len()
    }
}

/// 位图分配器，每次分配一段连续的位，首次适配
pub struct BitAllocator {
    bits: Vec<u64>,
    capacity: usize,
    used: usize,
}

impl BitAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            bits: vec![0; capacity.div_ceil(64)],
            capacity,
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    fn test(&self, idx: usize) -> bool {
        self.bits[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn set(&mut self, idx: usize, value: bool) {
        if value {
            self.bits[idx / 64] |= 1 << (idx % 64);
        } else {
            self.bits[idx / 64] &= !(1 << (idx % 64));
        }
    }

    /// 找到第一段长为 `count` 的空闲位并将其置位，返回起始下标
    pub fn alloc_contiguous(&mut self, count: usize) -> Option<usize> {
        debug_assert!(count > 0);
        let mut start = 0;
        let mut run = 0;
        for idx in 0..self.capacity {
            if self.test(idx) {
                run = 0;
                start = idx + 1;
                continue;
            }
            run += 1;
            if run == count {
                for i in start..start + count {
                    self.set(i, true);
                }
                self.used += count;
                return Some(start);
            }
        }
        None
    }

    pub fn dealloc(&mut self, start: usize, count: usize) {
        for idx in start..start + count {
            assert!(self.test(idx), "bit {idx} is not allocated");
            self.set(idx, false);
        }
        self.used -= count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycle_reuses_freed_ids() {
        let mut alloc = RecycleAllocator::bounded(3, usize::MAX);
        assert_eq!(alloc.alloc(), Some(3));
        assert_eq!(alloc.alloc(), Some(4));
        alloc.dealloc(3);
        assert_eq!(alloc.alloc(), Some(3));
        assert_eq!(alloc.alloc(), Some(5));
    }

    #[test]
    fn bounded_recycle_runs_out() {
        let mut alloc = RecycleAllocator::bounded(0, 2);
        assert_eq!(alloc.available(), 2);
        assert_eq!(alloc.alloc(), Some(0));
        assert_eq!(alloc.alloc(), Some(1));
        assert_eq!(alloc.alloc(), None);
        alloc.dealloc(0);
        assert_eq!(alloc.available(), 1);
        assert_eq!(alloc.alloc(), Some(0));
    }

    #[test]
    fn bitmap_first_fit_skips_holes_too_small() {
        let mut bitmap = BitAllocator::new(130);
        assert_eq!(bitmap.alloc_contiguous(8), Some(0));
        assert_eq!(bitmap.alloc_contiguous(8), Some(8));
        assert_eq!(bitmap.alloc_contiguous(8), Some(16));
        bitmap.dealloc(8, 8);
        assert_eq!(bitmap.alloc_contiguous(4), Some(8));
        // [12, 16) 只剩 4 位，放不下 8 位
        assert_eq!(bitmap.alloc_contiguous(8), Some(24));
        assert_eq!(bitmap.used(), 28);
    }

    #[test]
    fn bitmap_crosses_word_boundary_and_fills_up() {
        let mut bitmap = BitAllocator::new(72);
        assert_eq!(bitmap.alloc_contiguous(60), Some(0));
        assert_eq!(bitmap.alloc_contiguous(8), Some(60));
        assert_eq!(bitmap.alloc_contiguous(8), None);
        assert_eq!(bitmap.alloc_contiguous(4), Some(68));
        assert_eq!(bitmap.used(), bitmap.capacity());
    }

    #[test]
    #[should_panic(expected = "is not allocated")]
    fn bitmap_double_free_panics() {
        let mut bitmap = BitAllocator::new(16);
        let start = bitmap.alloc_contiguous(8).unwrap();
        bitmap.dealloc(start, 8);
        bitmap.dealloc(start, 8);
    }
}
