use alloc::{collections::BTreeMap, sync::Arc};
use core::{
    ops::Range,
    sync::atomic::{AtomicUsize, Ordering},
};

use defines::config::PHYS_BASE;
use idallocator::RecycleAllocator;
use klocks::{SpinMutex, SpinMutexGuard};

use crate::{
    address::{VirtAddr, VirtPageNum},
    hal::{FileHandle, PageTableHandle},
    owner::{Mapping, OwnerRecord, SpaceId},
    spt::{MapId, SupplementalPageTable},
};

/// 一段 `mmap` 映射
#[derive(Clone)]
pub(crate) struct MmapRegion {
    pub pages: Range<VirtPageNum>,
    pub file: FileHandle,
}

pub(crate) struct SpaceInner {
    pub spt: SupplementalPageTable,
    pub mmaps: BTreeMap<MapId, MmapRegion>,
    pub mapid_alloc: RecycleAllocator,
    /// 栈目前延伸到的最低页
    pub stack_bottom: VirtPageNum,
}

/// 进程的用户地址空间在虚存子系统中的视图
pub struct AddressSpace {
    id: SpaceId,
    page_table: PageTableHandle,
    image: Option<FileHandle>,
    user_sp: AtomicUsize,
    inner: SpinMutex<SpaceInner>,
}

impl AddressSpace {
    pub(crate) fn new(id: SpaceId, page_table: PageTableHandle, image: Option<FileHandle>) -> Self {
        Self {
            id,
            page_table,
            image,
            user_sp: AtomicUsize::new(PHYS_BASE),
            inner: SpinMutex::new(SpaceInner {
                spt: SupplementalPageTable::new(),
                mmaps: BTreeMap::new(),
                mapid_alloc: RecycleAllocator::new(),
                stack_bottom: VirtAddr(PHYS_BASE).vpn_floor(),
            }),
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn page_table(&self) -> &PageTableHandle {
        &self.page_table
    }

    /// 是否与 `other` 运行同一个可执行文件
    pub fn same_image(&self, other: &Self) -> bool {
        match (&self.image, &other.image) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn user_sp(&self) -> usize {
        self.user_sp.load(Ordering::Relaxed)
    }

    pub fn set_user_sp(&self, sp: usize) {
        self.user_sp.store(sp, Ordering::Relaxed);
    }

    /// 栈目前延伸到的最低地址
    pub fn stack_bottom(&self) -> VirtAddr {
        self.inner.lock().stack_bottom.page_start()
    }

    pub(crate) fn lock_inner(&self) -> SpinMutexGuard<'_, SpaceInner> {
        self.inner.lock()
    }

    pub(crate) fn record(&self, vpn: VirtPageNum) -> OwnerRecord {
        OwnerRecord::new(self.id, vpn)
    }

    pub(crate) fn mapping(&self, vpn: VirtPageNum, writable: bool) -> Mapping {
        Mapping {
            record: self.record(vpn),
            page_table: self.page_table.clone(),
            writable,
        }
    }
}
