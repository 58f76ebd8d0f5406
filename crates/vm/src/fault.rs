//! 缺页处理
//!
//! 按顺序判断：已映射（保护错误或虚假缺页） -> 懒加载 -> 栈增长 -> 换入 -> 非法访问

use core::sync::atomic::Ordering;

use defines::{
    config::PHYS_BASE,
    error::{errno, KResult},
};

use crate::{
    address::{FrameAddr, VirtAddr, VirtPageNum},
    manager::VirtualMemory,
    owner::{Backing, OwnerBatch, SpaceId},
    space::{AddressSpace, SpaceInner},
    spt::LoadPlan,
    swap::SlotId,
};

/// 缺页被如何处理
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// 页已经映射，例如另一个共享者刚把它换入
    AlreadyMapped,
    LazyLoad,
    StackGrowth,
    SwapIn,
}

impl VirtualMemory {
    /// 处理 `id` 在 `addr` 处的缺页。`user_sp` 是陷入时的用户栈指针。
    ///
    /// 返回 `EACCES` 表示保护错误（如写只读页），`EFAULT` 表示非法访问，
    /// 两者都应由调用者终止进程
    pub fn resolve_fault(
        &self,
        id: SpaceId,
        addr: VirtAddr,
        is_write: bool,
        user_sp: usize,
    ) -> KResult<FaultKind> {
        let space = self.space(id)?;
        let result = self.resolve_in(&space, addr, is_write, user_sp);
        match result {
            Ok(kind) => trace!("space {} fault at {addr:?} handled: {kind:?}", id.0),
            Err(e) => warn!("space {} fault at {addr:?} (write: {is_write}) unhandled: {e}", id.0),
        }
        result
    }

    pub(crate) fn resolve_in(
        &self,
        space: &AddressSpace,
        addr: VirtAddr,
        is_write: bool,
        user_sp: usize,
    ) -> KResult<FaultKind> {
        if !addr.is_user() {
            return Err(errno::EFAULT);
        }
        let vpn = addr.vpn_floor();
        let record = space.record(vpn);
        let mut inner = space.lock_inner();
        loop {
            if let Some(translation) = space.page_table().translate(vpn) {
                if is_write && !translation.writable {
                    return Err(errno::EACCES);
                }
                return Ok(FaultKind::AlreadyMapped);
            }

            if let Some(entry) = inner.spt.get(vpn) {
                if is_write && !entry.writable {
                    return Err(errno::EACCES);
                }
            }

            if let Some(plan) = inner.spt.resolve(addr) {
                self.lazy_load(space, &plan)?;
                inner.spt.mark_loaded(vpn);
                return Ok(FaultKind::LazyLoad);
            }

            if !inner.spt.contains(vpn) && self.in_stack_window(addr, user_sp) {
                self.grow_stack(space, &mut inner, vpn)?;
                return Ok(FaultKind::StackGrowth);
            }

            if let Some(slot) = self.swap.lookup(&record, &self.registry) {
                if self.swap_in(slot) {
                    return Ok(FaultKind::SwapIn);
                }
            } else if self.registry.get(&record).is_none() {
                return Err(errno::EFAULT);
            }
            // 正被换出或正被别的共享者装入，稍后重试
            core::hint::spin_loop();
        }
    }

    fn in_stack_window(&self, addr: VirtAddr, user_sp: usize) -> bool {
        addr.0 < PHYS_BASE
            && addr.0 >= PHYS_BASE - self.config.max_stack_size
            && addr.0 >= user_sp.saturating_sub(self.config.stack_fault_slack)
    }

    fn lazy_load(&self, space: &AddressSpace, plan: &LoadPlan) -> KResult<()> {
        let frame = self.frames.obtain(&self.swap, &self.registry);
        let read = self.frames.with_page_mut(frame, |page| {
            let _fs = self.fs_lock();
            plan.file.read_at(plan.offset, &mut page[..plan.read_bytes])
        });
        if read != plan.read_bytes {
            warn!(
                "short read for {:?}: {read} of {} bytes",
                plan.vpn.page_start(),
                plan.read_bytes
            );
            self.frames.discard(frame);
            return Err(errno::EIO);
        }
        let mut owners = OwnerBatch::new();
        owners.push(space.mapping(plan.vpn, plan.writable));
        self.frames.install(frame, owners, false, &self.registry);
        self.counters.lazy_loads.fetch_add(1, Ordering::Relaxed);
        trace!("lazy load {:?} into {frame:?}", plan.vpn.page_start());
        Ok(())
    }

    fn grow_stack(
        &self,
        space: &AddressSpace,
        inner: &mut SpaceInner,
        vpn: VirtPageNum,
    ) -> KResult<()> {
        inner.spt.register_stack_page(vpn)?;
        let frame = self
            .frames
            .allocate(space.mapping(vpn, true), &self.swap, &self.registry);
        inner.stack_bottom = inner.stack_bottom.min(vpn);
        self.counters.stack_growths.fetch_add(1, Ordering::Relaxed);
        trace!("stack grows to {:?} with {frame:?}", vpn.page_start());
        Ok(())
    }

    /// 把交换槽换入新页帧，并为其全部占用者重新建立映射。
    /// 槽已被别的共享者换入时返回 `false`
    fn swap_in(&self, slot: SlotId) -> bool {
        let frame = self.frames.obtain(&self.swap, &self.registry);
        let swapped = self
            .frames
            .with_page_mut(frame, |page| self.swap.read(slot, page));
        match swapped {
            Some(swapped) => {
                self.frames
                    .install(frame, swapped.owners, swapped.dirty, &self.registry);
                self.counters.swap_ins.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                self.frames.discard(frame);
                false
            }
        }
    }

    /// 让 `vpn` 驻留并钉住，返回其页帧
    pub(crate) fn pin_page(
        &self,
        space: &AddressSpace,
        vpn: VirtPageNum,
        is_write: bool,
    ) -> Option<FrameAddr> {
        let record = space.record(vpn);
        loop {
            self.resolve_in(space, vpn.page_start(), is_write, space.user_sp())
                .ok()?;
            if let Some(Backing::Frame(frame)) = self.registry.get(&record) {
                if self.frames.pin_owned(frame, &record, &self.registry) {
                    return Some(frame);
                }
            }
            // 刚处理完又被换出了，重来
        }
    }
}

#[cfg(test)]
mod tests {
    use defines::config::{MAX_STACK_SIZE, PAGE_SIZE, PHYS_BASE};

    use std::{sync::Arc, thread, time::Duration};

    use super::*;
    use crate::test_utils::{GatedFile, Harness};

    #[test]
    fn lazy_load_reads_once_then_hits_page_table() {
        let h = Harness::new(8);
        let (id, pt) = h.space(1);
        let file = h.file_with_pattern(PAGE_SIZE);
        h.vm.register_segment(id, file.clone(), 0, VirtAddr(0x0804_8000), PAGE_SIZE, 0, false)
            .unwrap();

        let kind = h.vm.resolve_fault(id, VirtAddr(0x0804_8000), false, PHYS_BASE).unwrap();
        assert_eq!(kind, FaultKind::LazyLoad);
        assert_eq!(file.reads(), 1);
        let space = h.vm.space(id).unwrap();
        assert!(space.lock_inner().spt.get(VirtPageNum(0x8048)).unwrap().loaded);

        let again = h.vm.resolve_fault(id, VirtAddr(0x0804_8000), false, PHYS_BASE).unwrap();
        assert_eq!(again, FaultKind::AlreadyMapped);
        assert_eq!(file.reads(), 1);
        assert!(pt.translate_frame(VirtPageNum(0x8048)).is_some());

        let mut buf = [0; 16];
        h.vm.read_user(id, VirtAddr(0x0804_8000), &mut buf).unwrap();
        assert_eq!(&buf[..], &file.contents()[..16]);
    }

    #[test]
    fn partial_page_is_zero_filled() {
        let h = Harness::new(8);
        let (id, _pt) = h.space(1);
        let file = h.file_with_pattern(PAGE_SIZE);
        h.vm.register_segment(id, file, 0, VirtAddr(0x0804_8000), 100, PAGE_SIZE - 100, true)
            .unwrap();
        let bytes = h.load(id, VirtAddr(0x0804_8000), PAGE_SIZE);
        assert!(bytes[100..].iter().all(|&b| b == 0));
        assert!(bytes[..100].iter().any(|&b| b != 0));
    }

    #[test]
    fn write_to_read_only_page_is_a_protection_fault() {
        let h = Harness::new(8);
        let (id, _pt) = h.space(1);
        let file = h.file_with_pattern(PAGE_SIZE);
        h.vm.register_segment(id, file, 0, VirtAddr(0x0804_8000), PAGE_SIZE, 0, false)
            .unwrap();
        // 首次就写，也不能把只读页装进来
        assert_eq!(
            h.vm.resolve_fault(id, VirtAddr(0x0804_8004), true, PHYS_BASE),
            Err(errno::EACCES)
        );
        h.vm.resolve_fault(id, VirtAddr(0x0804_8004), false, PHYS_BASE).unwrap();
        assert_eq!(
            h.vm.resolve_fault(id, VirtAddr(0x0804_8004), true, PHYS_BASE),
            Err(errno::EACCES)
        );
    }

    #[test]
    fn stack_grows_within_the_window_only() {
        let h = Harness::new(8);
        let (id, _pt) = h.space(1);
        let sp = PHYS_BASE - PAGE_SIZE;
        assert_eq!(
            h.vm.resolve_fault(id, VirtAddr(sp), true, sp).unwrap(),
            FaultKind::StackGrowth
        );
        let space = h.vm.space(id).unwrap();
        assert_eq!(space.stack_bottom(), VirtAddr(PHYS_BASE - PAGE_SIZE));

        // `PUSHA` 在调整栈指针前写入 sp - 32
        let sp = PHYS_BASE - PAGE_SIZE;
        assert_eq!(
            h.vm.resolve_fault(id, VirtAddr(sp - 32), true, sp).unwrap(),
            FaultKind::StackGrowth
        );
        assert_eq!(space.stack_bottom(), VirtAddr(PHYS_BASE - 2 * PAGE_SIZE));
        assert_eq!(space.lock_inner().spt.len(), 2);

        // 离栈指针太远
        assert_eq!(
            h.vm.resolve_fault(id, VirtAddr(sp - 3 * PAGE_SIZE), true, sp),
            Err(errno::EFAULT)
        );
        // 超出最大栈大小
        let far = PHYS_BASE - MAX_STACK_SIZE - PAGE_SIZE;
        assert_eq!(h.vm.resolve_fault(id, VirtAddr(far), true, far), Err(errno::EFAULT));
        assert_eq!(h.vm.stats().stack_growths, 2);
    }

    #[test]
    fn unknown_and_kernel_addresses_are_unhandled() {
        let h = Harness::new(4);
        let (id, _pt) = h.space(1);
        assert_eq!(
            h.vm.resolve_fault(id, VirtAddr(0x1000_0000), false, PHYS_BASE),
            Err(errno::EFAULT)
        );
        assert_eq!(h.vm.resolve_fault(id, VirtAddr(0), false, PHYS_BASE), Err(errno::EFAULT));
        assert_eq!(
            h.vm.resolve_fault(id, VirtAddr(PHYS_BASE + 8), false, PHYS_BASE),
            Err(errno::EFAULT)
        );
        assert_eq!(
            h.vm.resolve_fault(SpaceId(99), VirtAddr(0x1000_0000), false, PHYS_BASE),
            Err(errno::ENOENT)
        );
    }

    #[test]
    fn evicted_page_comes_back_with_its_contents() {
        let h = Harness::new(2);
        let (id, pt) = h.space(1);
        let file = h.file_with_pattern(4 * PAGE_SIZE);
        h.vm.register_segment(id, file, 0, VirtAddr(0x0804_8000), 4 * PAGE_SIZE, 0, true)
            .unwrap();

        let u1 = VirtAddr(0x0804_8000);
        h.store(id, u1 + 10, b"recall me");
        // 两个帧，再碰三页后 U1 一定被换出
        for i in 1..4 {
            h.load(id, u1 + i * PAGE_SIZE, 1);
        }
        assert!(pt.translate_frame(u1.vpn_floor()).is_none());
        let slot = match h.vm.backing(id, u1) {
            Some(Backing::Swap(slot)) => slot,
            other => panic!("expected U1 in swap, got {other:?}"),
        };

        assert_eq!(
            h.vm.resolve_fault(id, u1, false, PHYS_BASE).unwrap(),
            FaultKind::SwapIn
        );
        assert_eq!(h.load(id, u1 + 10, 9), b"recall me");
        assert!(h.swap_slots().iter().all(|s| *s != slot));
        assert!(matches!(h.vm.backing(id, u1), Some(Backing::Frame(_))));
        h.audit();
    }

    #[test]
    fn fault_waits_while_the_only_frame_is_being_loaded() {
        let h = Harness::new(1);
        let (loader, _) = h.space(1);
        let (grower, _) = h.space(2);
        let file = Arc::new(GatedFile::new(vec![7; PAGE_SIZE]));
        h.vm.register_segment(loader, file.clone(), 0, VirtAddr(0x0804_8000), PAGE_SIZE, 0, false)
            .unwrap();

        let sp = PHYS_BASE - PAGE_SIZE;
        thread::scope(|s| {
            let load = s.spawn(|| h.vm.resolve_fault(loader, VirtAddr(0x0804_8000), false, PHYS_BASE));
            // 唯一的页帧正在读文件
            file.arrived.wait();
            let grow = s.spawn(|| h.vm.resolve_fault(grower, VirtAddr(sp), true, sp));
            thread::sleep(Duration::from_millis(20));
            file.release.wait();

            assert_eq!(load.join().unwrap(), Ok(FaultKind::LazyLoad));
            assert_eq!(grow.join().unwrap(), Ok(FaultKind::StackGrowth));
        });
        assert_eq!(h.vm.stats().evictions, 1);
        assert!(matches!(
            h.vm.backing(loader, VirtAddr(0x0804_8000)),
            Some(Backing::Swap(_))
        ));
        h.audit();
    }
}
