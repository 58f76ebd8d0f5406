//! 补充页表：记录每个用户页第一次被访问时该如何填充

use alloc::collections::BTreeMap;
use core::ops::Range;

use defines::{
    config::{PAGE_SIZE, PHYS_BASE, USER_BASE},
    error::{errno, KResult},
};

use crate::{
    address::{VirtAddr, VirtPageNum},
    hal::FileHandle,
};

/// 文件映射的编号，进程内唯一
pub type MapId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// 可执行文件的段，首次访问时从文件读入
    Executable,
    /// `mmap` 映射的文件页
    Mmap(MapId),
    /// 栈页，只会被清零，不对应文件
    Stack,
}

#[derive(Clone)]
pub struct SptEntry {
    pub kind: PageKind,
    pub loaded: bool,
    pub file: Option<FileHandle>,
    pub offset: usize,
    pub read_bytes: usize,
    pub zero_bytes: usize,
    pub writable: bool,
}

impl SptEntry {
    pub fn is_shareable(&self) -> bool {
        self.kind == PageKind::Executable && !self.writable
    }
}

/// 缺页时要做的加载：从 `file` 的 `offset` 读 `read_bytes` 字节，其余清零
pub struct LoadPlan {
    pub vpn: VirtPageNum,
    pub file: FileHandle,
    pub offset: usize,
    pub read_bytes: usize,
    pub writable: bool,
}

#[derive(Default)]
pub struct SupplementalPageTable {
    entries: BTreeMap<VirtPageNum, SptEntry>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个可加载段。与已登记的段落在同一页时合并：
    /// 可写性取或，读入字节数取较大者
    pub fn register_segment(
        &mut self,
        file: FileHandle,
        offset: usize,
        upage: VirtAddr,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> KResult<()> {
        self.register_file_pages(
            PageKind::Executable,
            file,
            offset,
            upage,
            read_bytes,
            zero_bytes,
            writable,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn register_file_pages(
        &mut self,
        kind: PageKind,
        file: FileHandle,
        offset: usize,
        upage: VirtAddr,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> KResult<()> {
        let total = read_bytes.checked_add(zero_bytes).ok_or(errno::EINVAL)?;
        if !upage.is_page_aligned()
            || offset % PAGE_SIZE != 0
            || total == 0
            || total % PAGE_SIZE != 0
            || upage.0 < USER_BASE
            || upage.0.checked_add(total).map_or(true, |end| end > PHYS_BASE)
        {
            return Err(errno::EINVAL);
        }
        let pages = VirtPageNum::covering(upage, total);

        // 先检查再修改，失败时不留下半截登记
        for vpn in VirtPageNum::iter(pages.clone()) {
            if let Some(entry) = self.entries.get(&vpn) {
                if kind != PageKind::Executable || entry.kind != PageKind::Executable {
                    return Err(errno::EEXIST);
                }
            }
        }

        let mut read_left = read_bytes;
        for (i, vpn) in VirtPageNum::iter(pages).enumerate() {
            let page_read = read_left.min(PAGE_SIZE);
            read_left -= page_read;
            let page_offset = offset + i * PAGE_SIZE;
            match self.entries.get_mut(&vpn) {
                Some(entry) => {
                    entry.writable |= writable;
                    if page_read > entry.read_bytes {
                        entry.read_bytes = page_read;
                        entry.zero_bytes = PAGE_SIZE - page_read;
                        entry.offset = page_offset;
                        entry.file = Some(file.clone());
                    }
                }
                None => {
                    self.entries.insert(
                        vpn,
                        SptEntry {
                            kind,
                            loaded: false,
                            file: Some(file.clone()),
                            offset: page_offset,
                            read_bytes: page_read,
                            zero_bytes: PAGE_SIZE - page_read,
                            writable,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// 登记一个已经分配好页帧的栈页
    pub fn register_stack_page(&mut self, vpn: VirtPageNum) -> KResult<()> {
        if self.entries.contains_key(&vpn) {
            return Err(errno::EEXIST);
        }
        self.entries.insert(
            vpn,
            SptEntry {
                kind: PageKind::Stack,
                loaded: true,
                file: None,
                offset: 0,
                read_bytes: 0,
                zero_bytes: PAGE_SIZE,
                writable: true,
            },
        );
        Ok(())
    }

    /// 找到覆盖 `addr` 且尚未加载的文件页，给出加载方式。栈页不走这里
    pub fn resolve(&self, addr: VirtAddr) -> Option<LoadPlan> {
        let vpn = addr.vpn_floor();
        let entry = self.entries.get(&vpn)?;
        if entry.loaded || entry.kind == PageKind::Stack {
            return None;
        }
        Some(LoadPlan {
            vpn,
            file: entry.file.clone()?,
            offset: entry.offset,
            read_bytes: entry.read_bytes,
            writable: entry.writable,
        })
    }

    pub fn mark_loaded(&mut self, vpn: VirtPageNum) {
        if let Some(entry) = self.entries.get_mut(&vpn) {
            entry.loaded = true;
        }
    }

    pub fn get(&self, vpn: VirtPageNum) -> Option<&SptEntry> {
        self.entries.get(&vpn)
    }

    pub fn contains(&self, vpn: VirtPageNum) -> bool {
        self.entries.contains_key(&vpn)
    }

    pub fn overlaps(&self, pages: Range<VirtPageNum>) -> bool {
        self.entries.range(pages).next().is_some()
    }

    /// 移除一页的登记。脏页的写回由调用者在此之前完成
    pub fn deregister(&mut self, vpn: VirtPageNum) -> Option<SptEntry> {
        self.entries.remove(&vpn)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VirtPageNum, &SptEntry)> {
        self.entries.iter()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn insert(&mut self, vpn: VirtPageNum, entry: SptEntry) {
        self.entries.insert(vpn, entry);
    }
}
