//! 测试用的页表、文件、块设备，以及模拟用户访存的辅助函数

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Barrier, Mutex,
    },
};

use defines::config::{SECTORS_PER_PAGE, SECTOR_SIZE};

use crate::{
    address::{FrameAddr, VirtAddr, VirtPageNum},
    config::VmConfig,
    hal::{AccessFlags, BackingFile, BlockDevice, FileHandle, PageTable, Translation},
    manager::VirtualMemory,
    owner::{Backing, SpaceId},
    swap::SlotId,
};

struct Pte {
    frame: FrameAddr,
    writable: bool,
    flags: AccessFlags,
}

/// 模拟硬件页表，访问位和脏位由 [`touch`](Self::touch) 置上
#[derive(Default)]
pub struct FakePageTable {
    entries: Mutex<BTreeMap<VirtPageNum, Pte>>,
}

impl FakePageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟一次用户访存
    pub fn touch(&self, vpn: VirtPageNum, write: bool) {
        let mut entries = self.entries.lock().unwrap();
        let pte = entries.get_mut(&vpn).expect("touching an unmapped page");
        pte.flags |= AccessFlags::ACCESSED;
        if write {
            assert!(pte.writable, "user store to a read-only page");
            pte.flags |= AccessFlags::DIRTY;
        }
    }

    pub fn translate_frame(&self, vpn: VirtPageNum) -> Option<FrameAddr> {
        self.translate(vpn).map(|t| t.frame)
    }

    pub fn mapped(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl PageTable for FakePageTable {
    fn map(&self, vpn: VirtPageNum, frame: FrameAddr, writable: bool) {
        self.entries.lock().unwrap().insert(
            vpn,
            Pte {
                frame,
                writable,
                flags: AccessFlags::empty(),
            },
        );
    }

    fn unmap(&self, vpn: VirtPageNum) -> AccessFlags {
        self.entries
            .lock()
            .unwrap()
            .remove(&vpn)
            .map_or(AccessFlags::empty(), |pte| pte.flags)
    }

    fn translate(&self, vpn: VirtPageNum) -> Option<Translation> {
        self.entries
            .lock()
            .unwrap()
            .get(&vpn)
            .map(|pte| Translation {
                frame: pte.frame,
                writable: pte.writable,
            })
    }

    fn access_flags(&self, vpn: VirtPageNum) -> AccessFlags {
        self.entries
            .lock()
            .unwrap()
            .get(&vpn)
            .map_or(AccessFlags::empty(), |pte| pte.flags)
    }

    fn clear_flags(&self, vpn: VirtPageNum, flags: AccessFlags) {
        if let Some(pte) = self.entries.lock().unwrap().get_mut(&vpn) {
            pte.flags.remove(flags);
        }
    }
}

/// 内存中的文件，统计读写次数
pub struct MemFile {
    data: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    deny_write: AtomicBool,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            deny_write: AtomicBool::new(false),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn deny_write(&self, deny: bool) {
        self.deny_write.store(deny, Ordering::Relaxed);
    }
}

impl BackingFile for MemFile {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let data = self.data.lock().unwrap();
        let n = buf.len().min(data.len().saturating_sub(offset));
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    // 不扩展文件
    fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut data = self.data.lock().unwrap();
        let n = buf.len().min(data.len().saturating_sub(offset));
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        n
    }

    fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    fn write_denied(&self) -> bool {
        self.deny_write.load(Ordering::Relaxed)
    }
}

/// 读取时先在 `arrived` 上报到，再等 `release` 放行，之后与 [`MemFile`] 一样
pub struct GatedFile {
    file: MemFile,
    pub arrived: Barrier,
    pub release: Barrier,
}

impl GatedFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            file: MemFile::new(data),
            arrived: Barrier::new(2),
            release: Barrier::new(2),
        }
    }
}

impl BackingFile for GatedFile {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        self.arrived.wait();
        self.release.wait();
        self.file.read_at(offset, buf)
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        self.file.write_at(offset, buf)
    }

    fn len(&self) -> usize {
        self.file.len()
    }
}

pub struct RamDisk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl RamDisk {
    pub fn new(sectors: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; sectors]),
        }
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> usize {
        self.sectors.lock().unwrap().len()
    }

    fn read_sector(&self, sector: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.sectors.lock().unwrap()[sector]);
    }

    fn write_sector(&self, sector: usize, buf: &[u8]) {
        self.sectors.lock().unwrap()[sector].copy_from_slice(buf);
    }
}

/// 一个虚存子系统加上它的各个地址空间的假页表
pub struct Harness {
    pub vm: VirtualMemory,
    tables: Mutex<BTreeMap<SpaceId, Arc<FakePageTable>>>,
}

impl Harness {
    pub fn new(frames: usize) -> Self {
        Self::with_swap(frames, 256)
    }

    pub fn with_swap(frames: usize, swap_pages: usize) -> Self {
        simple_logger::init(|args| eprint!("{args}"));
        let config = VmConfig {
            user_frames: frames,
            ..VmConfig::default()
        };
        let disk = Arc::new(RamDisk::new(swap_pages * SECTORS_PER_PAGE));
        Self {
            vm: VirtualMemory::new(config, disk).unwrap(),
            tables: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn space(&self, id: usize) -> (SpaceId, Arc<FakePageTable>) {
        self.create(id, None)
    }

    pub fn space_with_image(&self, id: usize, image: &Arc<MemFile>) -> (SpaceId, Arc<FakePageTable>) {
        self.create(id, Some(image.clone()))
    }

    fn create(&self, id: usize, image: Option<FileHandle>) -> (SpaceId, Arc<FakePageTable>) {
        let id = SpaceId(id);
        let pt = Arc::new(FakePageTable::new());
        self.vm.create_space(id, pt.clone(), image).unwrap();
        self.tables.lock().unwrap().insert(id, pt.clone());
        (id, pt)
    }

    /// 内容不含 0 字节，便于区分清零的部分
    pub fn file_with_pattern(&self, len: usize) -> Arc<MemFile> {
        Arc::new(MemFile::new((0..len).map(|i| (i % 251 + 1) as u8).collect()))
    }

    fn pt(&self, id: SpaceId) -> Arc<FakePageTable> {
        self.tables.lock().unwrap()[&id].clone()
    }

    /// 以用户身份读：钉住、拷贝、置访问位、放开
    pub fn load(&self, id: SpaceId, addr: VirtAddr, len: usize) -> Vec<u8> {
        assert!(self.vm.pin_range(id, addr, len), "user load at {addr:?} faulted");
        let mut buf = vec![0; len];
        self.vm.read_user(id, addr, &mut buf).unwrap();
        let pt = self.pt(id);
        for vpn in VirtPageNum::iter(VirtPageNum::covering(addr, len)) {
            pt.touch(vpn, false);
        }
        assert!(self.vm.unpin_range(id, addr, len));
        buf
    }

    /// 以用户身份写
    pub fn store(&self, id: SpaceId, addr: VirtAddr, data: &[u8]) {
        assert!(self.vm.pin_range_mut(id, addr, data.len()), "user store at {addr:?} faulted");
        self.vm.write_user(id, addr, data).unwrap();
        let pt = self.pt(id);
        for vpn in VirtPageNum::iter(VirtPageNum::covering(addr, data.len())) {
            pt.touch(vpn, true);
        }
        assert!(self.vm.unpin_range(id, addr, data.len()));
    }

    pub fn swap_slots(&self) -> Vec<SlotId> {
        self.vm.swap.all_slots()
    }

    /// 每条所有权记录恰好属于一个页帧或一个交换槽
    pub fn audit(&self) {
        let mut owners = 0;
        for frame in self.vm.frames.all_frames() {
            for record in frame.owners() {
                assert_eq!(
                    self.vm.registry.get(&record),
                    Some(Backing::Frame(frame.addr())),
                    "{record:?}"
                );
                owners += 1;
            }
        }
        for slot in self.vm.swap.all_slots() {
            for record in self.vm.swap.owners_of(slot) {
                assert_eq!(self.vm.registry.get(&record), Some(Backing::Swap(slot)), "{record:?}");
                owners += 1;
            }
        }
        assert_eq!(owners, self.vm.registry.len());
    }
}
