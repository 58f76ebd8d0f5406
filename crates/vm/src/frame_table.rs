//! 帧表：记录每个用户页帧被哪些虚拟页占用，并用时钟算法挑选换出的页帧
//!
//! 加锁顺序：帧锁 -> 帧表锁 -> 登记表锁，帧表锁 -> 页帧池的分配器锁。
//! 帧表锁只在查找、插入、移动指针时短暂持有，持有帧表锁时不会再去拿任何帧锁
//!
//! 每个用户页帧在任一时刻要么在空闲池里，要么在时钟环上，要么被计入 `in_flight`

use alloc::{collections::VecDeque, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use defines::config::PAGE_SIZE;
use hashbrown::HashMap;
use klocks::SpinMutex;
use triomphe::Arc;

use crate::{
    address::FrameAddr,
    config::VmConfig,
    hal::AccessFlags,
    owner::{Backing, Mapping, OwnerBatch, OwnerRecord, OwnerRegistry, Owners},
    pool::FramePool,
    swap::SwapStore,
};

pub struct Frame {
    addr: FrameAddr,
    state: SpinMutex<FrameState>,
}

struct FrameState {
    owners: Owners,
    pin_count: usize,
    /// 第二次机会时从页表脏位折叠进来，页表脏位被清掉后仍能记得
    dirty: bool,
}

impl Frame {
    pub fn addr(&self) -> FrameAddr {
        self.addr
    }

    pub fn owners(&self) -> Vec<OwnerRecord> {
        self.state.lock().owners.iter().map(|m| m.record).collect()
    }

    pub fn is_pinned(&self) -> bool {
        self.state.lock().pin_count > 0
    }

    /// 页帧是否可能与磁盘上的内容不一致
    pub fn is_dirty(&self) -> bool {
        let state = self.state.lock();
        state.dirty
            || state.owners.iter().any(|m| {
                m.page_table
                    .access_flags(m.record.vpn)
                    .contains(AccessFlags::DIRTY)
            })
    }
}

struct TableInner {
    frames: HashMap<FrameAddr, Arc<Frame>>,
    /// 时钟算法的环，队首即当前指针
    clock: VecDeque<FrameAddr>,
    /// 既不在空闲池也不在环上的页帧数，例如正在从文件读入内容的页帧
    in_flight: usize,
}

pub(crate) struct FrameTable {
    pool: FramePool,
    inner: SpinMutex<TableInner>,
    evictions: AtomicUsize,
}

impl FrameTable {
    pub fn new(config: &VmConfig) -> Self {
        Self {
            pool: FramePool::new(config.frame_base, config.user_frames),
            inner: SpinMutex::new(TableInner {
                frames: HashMap::new(),
                clock: VecDeque::new(),
                in_flight: 0,
            }),
            evictions: AtomicUsize::new(0),
        }
    }

    /// 拿到一个清零的空闲页帧，必要时换出一个。
    ///
    /// 得到的页帧还不在表里，不会被换出。填好内容后再 [`install`](Self::install)，
    /// 用不上时 [`discard`](Self::discard)
    pub fn obtain(&self, swap: &SwapStore, registry: &OwnerRegistry) -> FrameAddr {
        if let Some(addr) = self.take_free() {
            return addr;
        }
        let addr = self.evict(swap, registry);
        self.pool.with_page_mut(addr, |page| page.fill(0));
        addr
    }

    /// 归还一个 `obtain` 得到但最终没有用上的页帧
    pub fn discard(&self, addr: FrameAddr) {
        self.pool.dealloc(addr);
        self.inner.lock().in_flight -= 1;
    }

    fn take_free(&self) -> Option<FrameAddr> {
        // 先记账再出池，其他换出者才不会以为页帧凭空消失了
        self.inner.lock().in_flight += 1;
        let addr = self.pool.alloc();
        if addr.is_none() {
            self.inner.lock().in_flight -= 1;
        }
        addr
    }

    /// 环上没有可换出的页帧时调用：还有页帧在路上或在空闲池里就稍后重试，否则 panic
    fn wait_or_die(&self, inner: &TableInner, reason: &str) {
        if inner.in_flight == 0 && self.pool.free_count() == 0 {
            panic!("{reason}");
        }
        core::hint::spin_loop();
    }

    /// 把填好内容的页帧登记到表中，并为每个占用者建立映射
    pub fn install(
        &self,
        addr: FrameAddr,
        owners: OwnerBatch,
        dirty: bool,
        registry: &OwnerRegistry,
    ) -> Arc<Frame> {
        let frame = Arc::new(Frame {
            addr,
            state: SpinMutex::new(FrameState {
                owners: Owners::from_batch(owners),
                pin_count: 0,
                dirty,
            }),
        });
        let state = frame.state.lock();
        {
            let mut inner = self.inner.lock();
            let old = inner.frames.insert(addr, Arc::clone(&frame));
            assert!(old.is_none(), "{addr:?} installed twice");
            inner.clock.push_back(addr);
            inner.in_flight -= 1;
        }
        registry.assign(state.owners.iter(), Backing::Frame(addr));
        for mapping in state.owners.iter() {
            mapping.map(addr);
        }
        drop(state);
        frame
    }

    /// 分配一个清零的页帧给 `owner` 并建立映射
    pub fn allocate(&self, owner: Mapping, swap: &SwapStore, registry: &OwnerRegistry) -> FrameAddr {
        let addr = self.obtain(swap, registry);
        let mut batch = OwnerBatch::new();
        batch.push(owner);
        self.install(addr, batch, false, registry);
        addr
    }

    pub fn lookup(&self, addr: FrameAddr) -> Option<Arc<Frame>> {
        self.inner.lock().frames.get(&addr).cloned()
    }

    /// 以 `via` 的名义把 `mapping` 加为共同占用者，并立即建立映射。
    /// `via` 已不再指向该页帧时返回 `false`
    pub fn add_owner(
        &self,
        addr: FrameAddr,
        via: &OwnerRecord,
        mapping: Mapping,
        registry: &OwnerRegistry,
    ) -> bool {
        let Some(frame) = self.lookup(addr) else {
            return false;
        };
        let mut state = frame.state.lock();
        if state.owners.is_reclaimed() || !registry.is(via, Backing::Frame(addr)) {
            return false;
        }
        registry.assign([&mapping], Backing::Frame(addr));
        mapping.map(addr);
        state.owners.push(mapping);
        true
    }

    /// 移除一个占用者并撤销其映射，最后一个占用者离开时回收页帧。
    /// 记录已不再指向该页帧时返回 `false`
    pub fn remove_owner(
        &self,
        addr: FrameAddr,
        record: &OwnerRecord,
        registry: &OwnerRegistry,
    ) -> bool {
        let Some(frame) = self.lookup(addr) else {
            return false;
        };
        let emptied = {
            let mut state = frame.state.lock();
            if state.owners.is_reclaimed() || !registry.is(record, Backing::Frame(addr)) {
                return false;
            }
            registry.remove(record);
            let (mapping, emptied) = state.owners.remove(record);
            if mapping
                .page_table
                .unmap(record.vpn)
                .contains(AccessFlags::DIRTY)
            {
                state.dirty = true;
            }
            emptied
        };
        if emptied {
            self.forget(addr);
            self.discard(addr);
            trace!("{addr:?} freed");
        }
        true
    }

    /// 把页帧移出表和环，之后由调用者 `install` 或 `discard`
    fn forget(&self, addr: FrameAddr) {
        let mut inner = self.inner.lock();
        inner.frames.remove(&addr);
        inner.clock.retain(|a| *a != addr);
        inner.in_flight += 1;
    }

    /// 时钟算法换出一个页帧，返回腾出来的页帧
    ///
    /// 每前进一步都先看空闲池，有别人刚释放的页帧就直接拿走。
    /// 任一占用者的访问位或脏位被置上的页帧会得到第二次机会：
    /// 脏位折叠进页帧自身，随后清空所有占用者的访问位和脏位，指针前移。
    /// 被钉住的页帧同样清位后跳过。
    /// 选中的页帧先撤销全部映射，再把内容和全部占用者整体写入交换分区
    pub fn evict(&self, swap: &SwapStore, registry: &OwnerRegistry) -> FrameAddr {
        let mut pinned_run = 0;
        loop {
            if let Some(addr) = self.take_free() {
                return addr;
            }
            let (frame, ring) = {
                let mut inner = self.inner.lock();
                let Some(addr) = inner.clock.pop_front() else {
                    self.wait_or_die(&inner, "no user frame to evict");
                    continue;
                };
                inner.clock.push_back(addr);
                (Arc::clone(&inner.frames[&addr]), inner.clock.len())
            };

            let mut state = frame.state.lock();
            if state.owners.is_reclaimed() {
                continue;
            }
            let flags = state
                .owners
                .iter()
                .fold(AccessFlags::empty(), |acc, m| acc | m.page_table.access_flags(m.record.vpn));
            if !flags.is_empty() {
                state.dirty |= flags.contains(AccessFlags::DIRTY);
                for m in state.owners.iter() {
                    m.page_table.clear_flags(m.record.vpn, AccessFlags::all());
                }
            }
            if state.pin_count > 0 {
                drop(state);
                pinned_run += 1;
                if pinned_run > 2 * ring {
                    pinned_run = 0;
                    self.wait_or_die(&self.inner.lock(), "every user frame is pinned");
                }
                continue;
            }
            pinned_run = 0;
            if !flags.is_empty() {
                trace!("{:?} gets a second chance", frame.addr);
                continue;
            }

            let owners = state.owners.take_all();
            let mut dirty = state.dirty;
            for m in &owners {
                dirty |= m.page_table.unmap(m.record.vpn).contains(AccessFlags::DIRTY);
            }
            let slot = self
                .pool
                .with_page(frame.addr, |page| swap.write(page, owners, dirty, registry));
            drop(state);

            self.forget(frame.addr);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("evict {:?} to {slot:?}", frame.addr);
            return frame.addr;
        }
    }

    /// 钉住页帧，使其不会被换出。钉住是计数的
    pub fn pin(&self, addr: FrameAddr) -> bool {
        let Some(frame) = self.lookup(addr) else {
            return false;
        };
        let mut state = frame.state.lock();
        if state.owners.is_reclaimed() {
            return false;
        }
        state.pin_count += 1;
        true
    }

    /// 只有 `record` 仍占用该页帧时才钉住
    pub fn pin_owned(&self, addr: FrameAddr, record: &OwnerRecord, registry: &OwnerRegistry) -> bool {
        let Some(frame) = self.lookup(addr) else {
            return false;
        };
        let mut state = frame.state.lock();
        if state.owners.is_reclaimed() || !registry.is(record, Backing::Frame(addr)) {
            return false;
        }
        state.pin_count += 1;
        true
    }

    pub fn unpin(&self, addr: FrameAddr) -> bool {
        let Some(frame) = self.lookup(addr) else {
            warn!("unpin {addr:?} which is not a live frame");
            return false;
        };
        let mut state = frame.state.lock();
        if state.pin_count == 0 {
            warn!("unbalanced unpin of {addr:?}");
            return false;
        }
        state.pin_count -= 1;
        true
    }

    /// 内核经由自己的映射写入页帧时，页表脏位不会被置上，需要手动标记
    pub fn mark_dirty(&self, addr: FrameAddr) {
        if let Some(frame) = self.lookup(addr) {
            frame.state.lock().dirty = true;
        }
    }

    pub fn with_page<R>(&self, addr: FrameAddr, f: impl FnOnce(&[u8; PAGE_SIZE]) -> R) -> R {
        self.pool.with_page(addr, f)
    }

    pub fn with_page_mut<R>(
        &self,
        addr: FrameAddr,
        f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R,
    ) -> R {
        self.pool.with_page_mut(addr, f)
    }

    pub fn resident(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn free(&self) -> usize {
        self.pool.free_count()
    }

    pub fn evictions(&self) -> usize {
        self.evictions.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn all_frames(&self) -> Vec<Arc<Frame>> {
        self.inner.lock().frames.values().cloned().collect()
    }
}
