//! 进程创建时共享代码页，进程退出时回收全部页

use alloc::vec::Vec;

use defines::error::{errno, KResult};
use idallocator::RecycleAllocator;

use crate::{
    address::VirtPageNum,
    manager::VirtualMemory,
    owner::{Backing, SpaceId},
    space::{AddressSpace, SpaceInner},
    spt::{PageKind, SupplementalPageTable},
};

impl VirtualMemory {
    /// 让 `child` 继承 `parent` 的可执行段，返回立即共享的页数
    ///
    /// 两者运行的可执行文件不同时什么也不做。只读且已加载的代码页直接加入父进程页帧
    /// （或交换槽）的占用者集合；可写的数据段和尚未加载的页只复制登记，由子进程自己加载。
    /// 文件映射和栈不继承
    pub fn share(&self, parent: SpaceId, child: SpaceId) -> KResult<usize> {
        if parent == child {
            return Err(errno::EINVAL);
        }
        let parent = self.space(parent)?;
        let child = self.space(child)?;
        if !parent.same_image(&child) {
            debug!(
                "space {} runs another image than {}, nothing shared",
                child.id().0,
                parent.id().0
            );
            return Ok(0);
        }

        // 按编号顺序加锁
        let (parent_inner, mut child_inner) = if parent.id() < child.id() {
            let p = parent.lock_inner();
            (p, child.lock_inner())
        } else {
            let c = child.lock_inner();
            (parent.lock_inner(), c)
        };

        let mut shared = 0;
        for (&vpn, entry) in parent_inner.spt.iter() {
            if entry.kind != PageKind::Executable || child_inner.spt.contains(vpn) {
                continue;
            }
            let mut copy = entry.clone();
            copy.loaded =
                entry.is_shareable() && entry.loaded && self.share_page(&parent, &child, vpn);
            if copy.loaded {
                shared += 1;
            }
            child_inner.spt.insert(vpn, copy);
        }
        info!(
            "space {} shares {shared} pages with space {}",
            child.id().0,
            parent.id().0
        );
        Ok(shared)
    }

    /// 把 `child` 加入 `parent` 在 `vpn` 处页面的占用者集合
    fn share_page(&self, parent: &AddressSpace, child: &AddressSpace, vpn: VirtPageNum) -> bool {
        let via = parent.record(vpn);
        loop {
            let added = match self.registry.get(&via) {
                Some(Backing::Frame(frame)) => {
                    self.frames
                        .add_owner(frame, &via, child.mapping(vpn, false), &self.registry)
                }
                Some(Backing::Swap(slot)) => {
                    self.swap
                        .add_owner(slot, &via, child.mapping(vpn, false), &self.registry)
                }
                None => return false,
            };
            if added {
                return true;
            }
            // 页面正在换入换出，稍后重试
            core::hint::spin_loop();
        }
    }

    /// 进程退出：写回全部文件映射，放弃所有页的所有权，然后丢弃补充页表并注销地址空间
    ///
    /// 共享页只是少了一个占用者，其他进程不受影响
    pub fn release_all(&self, id: SpaceId) -> KResult<()> {
        let space = self.space(id)?;
        let mut inner = space.lock_inner();

        let mapids: Vec<_> = inner.mmaps.keys().copied().collect();
        for mapid in mapids {
            self.unmap_region(&space, &mut inner, mapid);
        }
        self.release_owned(id);
        reset(&mut inner);
        drop(inner);

        self.forget_space(id);
        info!("address space {} released", id.0);
        Ok(())
    }

    fn release_owned(&self, id: SpaceId) {
        loop {
            let records = self.registry.of_space(id);
            if records.is_empty() {
                return;
            }
            for (record, backing) in records {
                // 返回 false 说明页面刚好在换入换出，下一轮重新查询
                match backing {
                    Backing::Frame(frame) => {
                        self.frames.remove_owner(frame, &record, &self.registry);
                    }
                    Backing::Swap(slot) => {
                        self.swap.remove_owner(slot, &record, &self.registry);
                    }
                }
            }
        }
    }
}

fn reset(inner: &mut SpaceInner) {
    inner.spt = SupplementalPageTable::new();
    inner.mmaps.clear();
    inner.mapid_alloc = RecycleAllocator::new();
}
