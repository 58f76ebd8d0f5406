//! 所有权记录
//!
//! 一条记录 `(地址空间, 虚拟页)` 在任一时刻只属于一个页帧或一个交换槽。
//! 页帧和交换槽的占用者集合就是它们的引用计数，集合变空即回收

use alloc::{collections::BTreeMap, vec::Vec};
use core::fmt;

use klocks::SpinMutex;
use smallvec::SmallVec;

use crate::{
    address::{FrameAddr, VirtPageNum},
    hal::PageTableHandle,
    swap::SlotId,
};

/// 地址空间的标识，通常就是进程号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerRecord {
    pub space: SpaceId,
    pub vpn: VirtPageNum,
}

impl OwnerRecord {
    pub fn new(space: SpaceId, vpn: VirtPageNum) -> Self {
        Self { space, vpn }
    }
}

/// 所有权记录加上重新建立映射所需的信息
#[derive(Clone)]
pub struct Mapping {
    pub record: OwnerRecord,
    pub page_table: PageTableHandle,
    pub writable: bool,
}

impl Mapping {
    pub fn map(&self, frame: FrameAddr) {
        self.page_table.map(self.record.vpn, frame, self.writable);
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("record", &self.record)
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}

/// 一批所有权记录，页帧和交换槽之间整体搬移
pub type OwnerBatch = SmallVec<[Mapping; 2]>;

/// 占用者集合
///
/// `Active` 时集合非空；最后一个占用者离开后变为 `Reclaimed`，之后不再接受新占用者
pub enum Owners {
    Active(OwnerBatch),
    Reclaimed,
}

impl Owners {
    #[cfg(test)]
    pub fn new(first: Mapping) -> Self {
        let mut batch = OwnerBatch::new();
        batch.push(first);
        Self::Active(batch)
    }

    pub fn from_batch(batch: OwnerBatch) -> Self {
        assert!(!batch.is_empty(), "owner batch must not be empty");
        Self::Active(batch)
    }

    pub fn is_reclaimed(&self) -> bool {
        matches!(self, Self::Reclaimed)
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Active(batch) => batch.len(),
            Self::Reclaimed => 0,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        let batch: &[Mapping] = match self {
            Self::Active(batch) => batch,
            Self::Reclaimed => &[],
        };
        batch.iter()
    }

    #[track_caller]
    pub fn push(&mut self, mapping: Mapping) {
        match self {
            Self::Active(batch) => {
                assert!(
                    !batch.iter().any(|m| m.record == mapping.record),
                    "{:?} already owns this page",
                    mapping.record
                );
                batch.push(mapping);
            }
            Self::Reclaimed => panic!("adding {:?} to a reclaimed owner set", mapping.record),
        }
    }

    /// 移除一个占用者。返回集合是否因此变空（已转为 `Reclaimed`）
    ///
    /// 移除不存在的占用者说明所有权记录已经不一致，直接 panic
    #[track_caller]
    pub fn remove(&mut self, record: &OwnerRecord) -> (Mapping, bool) {
        let Self::Active(batch) = self else {
            panic!("removing {record:?} from a reclaimed owner set");
        };
        let Some(pos) = batch.iter().position(|m| m.record == *record) else {
            panic!("{record:?} is not an owner");
        };
        let mapping = batch.remove(pos);
        let emptied = batch.is_empty();
        if emptied {
            *self = Self::Reclaimed;
        }
        (mapping, emptied)
    }

    /// 取走全部占用者，集合转为 `Reclaimed`
    pub fn take_all(&mut self) -> OwnerBatch {
        match core::mem::replace(self, Self::Reclaimed) {
            Self::Active(batch) => batch,
            Self::Reclaimed => panic!("taking owners of a reclaimed owner set"),
        }
    }
}

/// 所有权记录当前指向的后备对象
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    Frame(FrameAddr),
    Swap(SlotId),
}

/// 全局所有权登记表
///
/// 记录的变更总是在持有对应页帧或交换槽的锁时进行，
/// 因此持有该锁并核对登记表，就能确认记录没有被并发搬走
pub(crate) struct OwnerRegistry {
    records: SpinMutex<BTreeMap<OwnerRecord, Backing>>,
}

impl OwnerRegistry {
    pub fn new() -> Self {
        Self {
            records: SpinMutex::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, record: &OwnerRecord) -> Option<Backing> {
        self.records.lock().get(record).copied()
    }

    pub fn is(&self, record: &OwnerRecord, backing: Backing) -> bool {
        self.get(record) == Some(backing)
    }

    pub fn assign<'a>(&self, mappings: impl IntoIterator<Item = &'a Mapping>, backing: Backing) {
        let mut records = self.records.lock();
        for mapping in mappings {
            records.insert(mapping.record, backing);
        }
    }

    pub fn remove(&self, record: &OwnerRecord) -> Option<Backing> {
        self.records.lock().remove(record)
    }

    /// 某个地址空间的全部记录
    pub fn of_space(&self, space: SpaceId) -> Vec<(OwnerRecord, Backing)> {
        let from = OwnerRecord::new(space, VirtPageNum(0));
        let to = OwnerRecord::new(space, VirtPageNum(usize::MAX));
        self.records
            .lock()
            .range(from..=to)
            .map(|(record, backing)| (*record, *backing))
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }
}
