//! 交换分区
//!
//! 每个交换槽占据块设备上连续的一页大小的扇区，以起始扇区号作为标识。
//! 设备读写都不持有交换表的锁

use alloc::vec::Vec;

use defines::config::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};
use hashbrown::HashMap;
use idallocator::BitAllocator;
use klocks::SpinMutex;
use triomphe::Arc;

use crate::{
    hal::BlockDeviceHandle,
    owner::{Backing, Mapping, OwnerBatch, OwnerRecord, OwnerRegistry, Owners},
};

/// 交换槽的起始扇区号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub usize);

struct Slot {
    state: SpinMutex<SlotState>,
}

struct SlotState {
    owners: Owners,
    dirty: bool,
}

struct SwapInner {
    bitmap: BitAllocator,
    slots: HashMap<SlotId, Arc<Slot>>,
}

/// 从交换槽读回的占用者和脏标记
pub(crate) struct SwappedIn {
    pub owners: OwnerBatch,
    pub dirty: bool,
}

pub(crate) struct SwapStore {
    device: BlockDeviceHandle,
    inner: SpinMutex<SwapInner>,
}

impl SwapStore {
    pub fn new(device: BlockDeviceHandle) -> Self {
        // 不足一页的尾部扇区用不上
        let usable = device.sector_count() / SECTORS_PER_PAGE * SECTORS_PER_PAGE;
        info!(
            "swap device has {} sectors, {} slots",
            device.sector_count(),
            usable / SECTORS_PER_PAGE
        );
        Self {
            device,
            inner: SpinMutex::new(SwapInner {
                bitmap: BitAllocator::new(usable),
                slots: HashMap::new(),
            }),
        }
    }

    fn slot(&self, id: SlotId) -> Option<Arc<Slot>> {
        self.inner.lock().slots.get(&id).cloned()
    }

    /// 把一页内容连同占用者写入新的交换槽
    ///
    /// 没有空闲槽时内核已经无处可退，直接 panic
    pub fn write(
        &self,
        page: &[u8; PAGE_SIZE],
        owners: OwnerBatch,
        dirty: bool,
        registry: &OwnerRegistry,
    ) -> SlotId {
        let Some(first) = self.inner.lock().bitmap.alloc_contiguous(SECTORS_PER_PAGE) else {
            panic!("swap exhausted");
        };
        let id = SlotId(first);
        for (i, chunk) in page.chunks_exact(SECTOR_SIZE).enumerate() {
            self.device.write_sector(first + i, chunk);
        }

        let slot = Arc::new(Slot {
            state: SpinMutex::new(SlotState {
                owners: Owners::from_batch(owners),
                dirty,
            }),
        });
        self.inner.lock().slots.insert(id, Arc::clone(&slot));
        let state = slot.state.lock();
        registry.assign(state.owners.iter(), Backing::Swap(id));
        debug!("swap out to {id:?}, {} owners, dirty: {dirty}", state.owners.len());
        id
    }

    /// 把交换槽的内容读入 `page`，交出全部占用者并删除该槽
    ///
    /// 槽已被别人换入时返回 `None`。调用者负责把占用者装入新的页帧
    pub fn read(&self, id: SlotId, page: &mut [u8; PAGE_SIZE]) -> Option<SwappedIn> {
        // 谁把槽从表中移除，谁负责释放扇区
        let slot = self.inner.lock().slots.remove(&id)?;
        let taken = {
            let mut state = slot.state.lock();
            if state.owners.is_reclaimed() {
                None
            } else {
                self.read_sectors(id, page);
                Some((state.owners.take_all(), state.dirty))
            }
        };
        self.inner.lock().bitmap.dealloc(id.0, SECTORS_PER_PAGE);
        let (owners, dirty) = taken?;
        debug!("swap in from {id:?}, {} owners", owners.len());
        Some(SwappedIn { owners, dirty })
    }

    fn read_sectors(&self, id: SlotId, page: &mut [u8; PAGE_SIZE]) {
        for (i, chunk) in page.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.device.read_sector(id.0 + i, chunk);
        }
    }

    /// 不消耗交换槽，只读出内容，返回该槽是否脏
    ///
    /// `record` 必须仍是该槽的占用者
    pub fn peek(
        &self,
        id: SlotId,
        record: &OwnerRecord,
        registry: &OwnerRegistry,
        page: &mut [u8; PAGE_SIZE],
    ) -> Option<bool> {
        let slot = self.slot(id)?;
        let state = slot.state.lock();
        if state.owners.is_reclaimed() || !registry.is(record, Backing::Swap(id)) {
            return None;
        }
        self.read_sectors(id, page);
        Some(state.dirty)
    }

    pub fn lookup(&self, record: &OwnerRecord, registry: &OwnerRegistry) -> Option<SlotId> {
        match registry.get(record)? {
            Backing::Swap(id) => Some(id),
            Backing::Frame(_) => None,
        }
    }

    /// 以 `via` 的名义把 `mapping` 加为共同占用者。
    /// `via` 已不再指向该槽时返回 `false`，调用者应重新查询
    pub fn add_owner(
        &self,
        id: SlotId,
        via: &OwnerRecord,
        mapping: Mapping,
        registry: &OwnerRegistry,
    ) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let mut state = slot.state.lock();
        if state.owners.is_reclaimed() || !registry.is(via, Backing::Swap(id)) {
            return false;
        }
        registry.assign([&mapping], Backing::Swap(id));
        state.owners.push(mapping);
        true
    }

    /// 移除一个占用者，最后一个占用者离开时删除该槽。
    /// 记录已不再指向该槽时返回 `false`
    pub fn remove_owner(&self, id: SlotId, record: &OwnerRecord, registry: &OwnerRegistry) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let mut state = slot.state.lock();
        if state.owners.is_reclaimed() || !registry.is(record, Backing::Swap(id)) {
            return false;
        }
        registry.remove(record);
        if state.owners.remove(record).1 {
            self.delete(id);
        }
        true
    }

    /// 释放交换槽占用的扇区并将其从表中移除
    pub fn delete(&self, id: SlotId) {
        let mut inner = self.inner.lock();
        if inner.slots.remove(&id).is_some() {
            inner.bitmap.dealloc(id.0, SECTORS_PER_PAGE);
            debug!("swap slot {id:?} deleted");
        }
    }

    pub fn slots_in_use(&self) -> usize {
        self.inner.lock().slots.len()
    }

    #[cfg(test)]
    pub fn owners_of(&self, id: SlotId) -> Vec<OwnerRecord> {
        self.slot(id)
            .map(|slot| slot.state.lock().owners.iter().map(|m| m.record).collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn all_slots(&self) -> Vec<SlotId> {
        self.inner.lock().slots.keys().copied().collect()
    }
}
