//! 文件映射
//!
//! 映射的页和可执行文件的段一样懒加载。撤销映射时，不论脏页驻留在内存还是已被换出，
//! 都先写回文件，再释放所有权并删除补充页表项

use alloc::boxed::Box;

use defines::{
    config::{PAGE_SIZE, PHYS_BASE, USER_BASE},
    error::{errno, KResult},
};

use crate::{
    address::{VirtAddr, VirtPageNum},
    hal::FileHandle,
    manager::VirtualMemory,
    owner::{Backing, OwnerRecord, SpaceId},
    space::{AddressSpace, MmapRegion, SpaceInner},
    spt::{MapId, PageKind},
};

impl VirtualMemory {
    /// 把整个文件映射到 `addr` 开始的区域，返回映射编号
    ///
    /// `addr` 为空、未对齐，或文件为空时返回 `EINVAL`；
    /// 区域与已有的页重叠，或伸进栈的范围时返回 `EEXIST`
    pub fn register_mmap(&self, id: SpaceId, file: FileHandle, addr: VirtAddr) -> KResult<MapId> {
        let len = file.len();
        if addr.0 == 0 || !addr.is_page_aligned() || len == 0 {
            return Err(errno::EINVAL);
        }
        let total = len.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let end = addr.0.checked_add(total).ok_or(errno::EINVAL)?;
        if addr.0 < USER_BASE || end > PHYS_BASE - self.config.max_stack_size {
            return Err(errno::EEXIST);
        }

        let space = self.space(id)?;
        let mut inner = space.lock_inner();
        let pages = VirtPageNum::covering(addr, total);
        if inner.spt.overlaps(pages.clone()) {
            return Err(errno::EEXIST);
        }
        let mapid = inner.mapid_alloc.alloc().ok_or(errno::ENOMEM)?;
        let writable = !file.write_denied();
        if let Err(e) = inner.spt.register_file_pages(
            PageKind::Mmap(mapid),
            file.clone(),
            0,
            addr,
            len,
            total - len,
            writable,
        ) {
            inner.mapid_alloc.dealloc(mapid);
            return Err(e);
        }
        inner.mmaps.insert(mapid, MmapRegion { pages, file });
        debug!(
            "space {} mmap {mapid} at {addr:?}, {len} bytes, writable: {writable}",
            id.0
        );
        Ok(mapid)
    }

    /// 撤销从 `addr` 开始的映射。没有这样的映射时返回 `false`
    pub fn deregister_mmap(&self, id: SpaceId, addr: VirtAddr) -> bool {
        let Ok(space) = self.space(id) else {
            return false;
        };
        let mut inner = space.lock_inner();
        let vpn = addr.vpn_floor();
        let found = inner
            .mmaps
            .iter()
            .find(|(_, region)| region.pages.start == vpn)
            .map(|(mapid, _)| *mapid);
        match found {
            Some(mapid) if addr.is_page_aligned() => self.unmap_region(&space, &mut inner, mapid),
            _ => false,
        }
    }

    /// 按编号撤销映射
    pub fn munmap(&self, id: SpaceId, mapid: MapId) -> bool {
        let Ok(space) = self.space(id) else {
            return false;
        };
        let mut inner = space.lock_inner();
        self.unmap_region(&space, &mut inner, mapid)
    }

    pub(crate) fn unmap_region(
        &self,
        space: &AddressSpace,
        inner: &mut SpaceInner,
        mapid: MapId,
    ) -> bool {
        let Some(region) = inner.mmaps.remove(&mapid) else {
            return false;
        };
        for vpn in VirtPageNum::iter(region.pages.clone()) {
            let Some(entry) = inner.spt.deregister(vpn) else {
                continue;
            };
            if entry.loaded {
                self.write_back_and_release(
                    &space.record(vpn),
                    &region.file,
                    entry.offset,
                    entry.read_bytes,
                );
            }
        }
        inner.mapid_alloc.dealloc(mapid);
        debug!("space {} munmap {mapid}", space.id().0);
        true
    }

    /// 脏页写回文件，然后放弃这一页的所有权
    fn write_back_and_release(
        &self,
        record: &OwnerRecord,
        file: &FileHandle,
        offset: usize,
        read_bytes: usize,
    ) {
        loop {
            match self.registry.get(record) {
                Some(Backing::Frame(frame)) => {
                    // 钉住以免写回途中被换出
                    if !self.frames.pin_owned(frame, record, &self.registry) {
                        core::hint::spin_loop();
                        continue;
                    }
                    let dirty = self.frames.lookup(frame).is_some_and(|f| f.is_dirty());
                    if dirty {
                        self.frames.with_page(frame, |page| {
                            let _fs = self.fs_lock();
                            file.write_at(offset, &page[..read_bytes]);
                        });
                    }
                    self.frames.unpin(frame);
                    if self.frames.remove_owner(frame, record, &self.registry) {
                        return;
                    }
                }
                Some(Backing::Swap(slot)) => {
                    let mut page = Box::new([0; PAGE_SIZE]);
                    match self.swap.peek(slot, record, &self.registry, &mut page) {
                        Some(true) => {
                            let _fs = self.fs_lock();
                            file.write_at(offset, &page[..read_bytes]);
                        }
                        Some(false) => {}
                        None => {
                            core::hint::spin_loop();
                            continue;
                        }
                    }
                    if self.swap.remove_owner(slot, record, &self.registry) {
                        return;
                    }
                }
                None => return,
            }
            core::hint::spin_loop();
        }
    }
}
