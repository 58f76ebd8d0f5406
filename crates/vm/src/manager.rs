use alloc::{collections::BTreeMap, vec::Vec};
use core::ops::Range;
use core::sync::atomic::{AtomicUsize, Ordering};

use defines::{
    config::{PAGE_SIZE, PHYS_BASE},
    error::{errno, KResult},
};
use klocks::{SpinMutex, SpinMutexGuard};
use scopeguard::ScopeGuard;
use triomphe::Arc;

use crate::{
    address::{FrameAddr, VirtAddr, VirtPageNum},
    config::VmConfig,
    frame_table::FrameTable,
    hal::{BlockDeviceHandle, FileHandle, PageTableHandle},
    owner::{Backing, OwnerRecord, OwnerRegistry, SpaceId},
    space::AddressSpace,
    swap::SwapStore,
};

/// `[addr, addr + len)` 整个落在用户空间时返回覆盖它的页
fn user_pages(addr: VirtAddr, len: usize) -> Option<Range<VirtPageNum>> {
    let end = addr.0.checked_add(len)?;
    (addr.is_user() && end <= PHYS_BASE).then(|| VirtPageNum::covering(addr, len))
}

/// 虚存子系统的统计信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmStats {
    pub resident_frames: usize,
    pub free_frames: usize,
    pub swap_slots: usize,
    pub evictions: usize,
    pub swap_ins: usize,
    pub lazy_loads: usize,
    pub stack_growths: usize,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub swap_ins: AtomicUsize,
    pub lazy_loads: AtomicUsize,
    pub stack_growths: AtomicUsize,
}

/// 虚存子系统
///
/// 持有帧表、交换分区、所有权登记表以及所有已登记的地址空间。
/// 内核启动时构造一次，之后以引用或 `Arc` 共享
pub struct VirtualMemory {
    pub(crate) config: VmConfig,
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapStore,
    pub(crate) registry: OwnerRegistry,
    spaces: SpinMutex<BTreeMap<SpaceId, Arc<AddressSpace>>>,
    fs_lock: SpinMutex<()>,
    pub(crate) counters: Counters,
}

impl VirtualMemory {
    pub fn new(config: VmConfig, swap_device: BlockDeviceHandle) -> KResult<Self> {
        config.validate()?;
        info!(
            "vm init: {} user frames, max stack {:#x}",
            config.user_frames, config.max_stack_size
        );
        Ok(Self {
            frames: FrameTable::new(&config),
            swap: SwapStore::new(swap_device),
            registry: OwnerRegistry::new(),
            spaces: SpinMutex::new(BTreeMap::new()),
            fs_lock: SpinMutex::new(()),
            counters: Counters::default(),
            config,
        })
    }


    /// 文件系统锁。懒加载和写回文件时会拿这把锁，调用本模块的方法前不能持有它
    pub fn fs_lock(&self) -> SpinMutexGuard<'_, ()> {
        self.fs_lock.lock()
    }

    /// 登记一个进程的地址空间。`image` 是它运行的可执行文件，决定能否共享代码页
    pub fn create_space(
        &self,
        id: SpaceId,
        page_table: PageTableHandle,
        image: Option<FileHandle>,
    ) -> KResult<Arc<AddressSpace>> {
        let mut spaces = self.spaces.lock();
        if spaces.contains_key(&id) {
            return Err(errno::EEXIST);
        }
        let space = Arc::new(AddressSpace::new(id, page_table, image));
        spaces.insert(id, Arc::clone(&space));
        info!("address space {} created", id.0);
        Ok(space)
    }

    pub fn space(&self, id: SpaceId) -> KResult<Arc<AddressSpace>> {
        self.spaces.lock().get(&id).cloned().ok_or(errno::ENOENT)
    }

    pub(crate) fn forget_space(&self, id: SpaceId) {
        self.spaces.lock().remove(&id);
    }

    /// 记录系统调用入口处的用户栈指针，钉住缓冲区时据此判断栈增长
    pub fn set_user_sp(&self, id: SpaceId, sp: usize) -> KResult<()> {
        self.space(id)?.set_user_sp(sp);
        Ok(())
    }

    /// 登记可执行文件的一个可加载段，由程序加载器对每个段调用一次
    #[allow(clippy::too_many_arguments)]
    pub fn register_segment(
        &self,
        id: SpaceId,
        file: FileHandle,
        offset: usize,
        upage: VirtAddr,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> KResult<()> {
        let space = self.space(id)?;
        let mut inner = space.lock_inner();
        inner
            .spt
            .register_segment(file, offset, upage, read_bytes, zero_bytes, writable)
    }

    /// `addr` 所在的页当前由哪个页帧或交换槽承载
    pub fn backing(&self, id: SpaceId, addr: VirtAddr) -> Option<Backing> {
        self.registry.get(&OwnerRecord::new(id, addr.vpn_floor()))
    }

    /// 页帧当前的全部占用者；不是活跃页帧时返回 `None`
    pub fn frame_owners(&self, frame: FrameAddr) -> Option<Vec<OwnerRecord>> {
        self.frames.lookup(frame).map(|f| f.owners())
    }

    /// 钉住覆盖 `[addr, addr + len)` 的所有页，使其驻留且不被换出。
    ///
    /// 不在内存中的页按缺页的方式处理（懒加载、栈增长、换入）。
    /// 任何一页无法处理时，已钉住的页会被放开，返回 `false`
    pub fn pin_range(&self, id: SpaceId, addr: VirtAddr, len: usize) -> bool {
        self.pin_range_impl(id, addr, len, false)
    }

    /// 同 [`pin_range`](Self::pin_range)，但要求每一页都可写，用于内核写入用户缓冲区
    pub fn pin_range_mut(&self, id: SpaceId, addr: VirtAddr, len: usize) -> bool {
        self.pin_range_impl(id, addr, len, true)
    }

    fn pin_range_impl(&self, id: SpaceId, addr: VirtAddr, len: usize, is_write: bool) -> bool {
        let Ok(space) = self.space(id) else {
            return false;
        };
        if len == 0 {
            return true;
        }
        let Some(pages) = user_pages(addr, len) else {
            return false;
        };
        let mut pinned = scopeguard::guard(Vec::new(), |pinned: Vec<FrameAddr>| {
            for frame in pinned {
                self.frames.unpin(frame);
            }
        });
        for vpn in VirtPageNum::iter(pages) {
            match self.pin_page(&space, vpn, is_write) {
                Some(frame) => pinned.push(frame),
                None => {
                    warn!("pin {:?} in space {} failed", vpn.page_start(), id.0);
                    return false;
                }
            }
        }
        ScopeGuard::into_inner(pinned);
        true
    }

    /// 放开 [`pin_range`](Self::pin_range) 钉住的页。有页并未被钉住时返回 `false`
    pub fn unpin_range(&self, id: SpaceId, addr: VirtAddr, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        let Some(pages) = user_pages(addr, len) else {
            warn!("unpin {addr:?}+{len:#x} in space {} which is not a user range", id.0);
            return false;
        };
        let mut balanced = true;
        for vpn in VirtPageNum::iter(pages) {
            match self.registry.get(&OwnerRecord::new(id, vpn)) {
                Some(Backing::Frame(frame)) => balanced &= self.frames.unpin(frame),
                _ => {
                    warn!("unpin {:?} in space {} which is not resident", vpn.page_start(), id.0);
                    balanced = false;
                }
            }
        }
        balanced
    }

    /// 直接按页帧地址钉住，例如驱动对页帧做 DMA 时
    pub fn pin_frame(&self, frame: FrameAddr) -> bool {
        self.frames.pin(frame)
    }

    pub fn unpin_frame(&self, frame: FrameAddr) -> bool {
        self.frames.unpin(frame)
    }

    /// 从用户地址读取。所涉及的页必须已驻留，通常先用 [`pin_range`](Self::pin_range) 钉住
    pub fn read_user(&self, id: SpaceId, addr: VirtAddr, buf: &mut [u8]) -> KResult<()> {
        let space = self.space(id)?;
        let mut done = 0;
        while done < buf.len() {
            let va = addr + done;
            let chunk = (PAGE_SIZE - va.page_offset()).min(buf.len() - done);
            let frame = space
                .page_table()
                .translate(va.vpn_floor())
                .ok_or(errno::EFAULT)?
                .frame;
            self.frames.with_page(frame, |page| {
                let from = va.page_offset();
                buf[done..done + chunk].copy_from_slice(&page[from..from + chunk]);
            });
            done += chunk;
        }
        Ok(())
    }

    /// 写入用户地址。内核经由自己的映射写入，页表脏位不会被置上，因此直接标记页帧为脏
    pub fn write_user(&self, id: SpaceId, addr: VirtAddr, data: &[u8]) -> KResult<()> {
        let space = self.space(id)?;
        let mut done = 0;
        while done < data.len() {
            let va = addr + done;
            let chunk = (PAGE_SIZE - va.page_offset()).min(data.len() - done);
            let translation = space
                .page_table()
                .translate(va.vpn_floor())
                .ok_or(errno::EFAULT)?;
            if !translation.writable {
                return Err(errno::EFAULT);
            }
            self.frames.with_page_mut(translation.frame, |page| {
                let from = va.page_offset();
                page[from..from + chunk].copy_from_slice(&data[done..done + chunk]);
            });
            self.frames.mark_dirty(translation.frame);
            done += chunk;
        }
        Ok(())
    }

    /// 按页帧地址读页帧内容。页帧须已被钉住
    pub fn with_page<R>(&self, frame: FrameAddr, f: impl FnOnce(&[u8; PAGE_SIZE]) -> R) -> R {
        self.frames.with_page(frame, f)
    }

    pub fn with_page_mut<R>(
        &self,
        frame: FrameAddr,
        f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R,
    ) -> R {
        self.frames.with_page_mut(frame, f)
    }

    pub fn stats(&self) -> VmStats {
        VmStats {
            resident_frames: self.frames.resident(),
            free_frames: self.frames.free(),
            swap_slots: self.swap.slots_in_use(),
            evictions: self.frames.evictions(),
            swap_ins: self.counters.swap_ins.load(Ordering::Relaxed),
            lazy_loads: self.counters.lazy_loads.load(Ordering::Relaxed),
            stack_growths: self.counters.stack_growths.load(Ordering::Relaxed),
        }
    }
}
