//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 反向映射 (Reverse Mapping)
//!
//! 从物理页找到映射它的所有页表项：
//! - 匿名页经 `page->mapping` 找到 anon_vma，再找到挂在其上的 VMA
//! - 文件页经 address_space 找到映射该文件的 VMA
//!
//! 在 VMA 内，页的虚拟地址由 `(mapping, index)` 线性算出：
//! `address = vm_start + ((index - vm_pgoff) << PAGE_SHIFT)`。
//! 迁移时 `try_to_unmap` 把页表项换成指向旧 PFN 的迁移项，
//! `remove_migration_ptes` 再用新页的 `(mapping, index)` 找回这些地址，
//! 并按旧页的 index 计算应安装的子页。
//!
//! 每个页表项都把整页映射进来（透明大页按 PMD 映射），并持有一个页
//! 引用和一个 mapcount。

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use spin::Mutex;

use crate::config::PAGE_SHIFT;
use crate::errno::Errno;
use crate::mm::filemap::AddressSpace;
use crate::mm::memcg::MemCgroup;
use crate::mm::page_desc::{Mapping, Page, PageFlag, Pfn};

/// 匿名页反向映射的根
///
/// 对应 Linux 的 struct anon_vma (include/linux/rmap.h)。引用计数只用于
/// 延长生命周期，不提供互斥。
#[derive(Debug)]
pub struct AnonVma {
    id: u64,
    refcount: AtomicUsize,
}

impl AnonVma {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            refcount: AtomicUsize::new(1),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 当前引用数
    #[inline]
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }
}

/// 持有的 anon_vma 引用，析构时 put_anon_vma
#[derive(Debug)]
pub struct AnonVmaRef {
    anon_vma: Arc<AnonVma>,
}

impl AnonVmaRef {
    fn get(anon_vma: &Arc<AnonVma>) -> Self {
        anon_vma.refcount.fetch_add(1, Ordering::AcqRel);
        Self {
            anon_vma: anon_vma.clone(),
        }
    }

    pub fn anon_vma(&self) -> &Arc<AnonVma> {
        &self.anon_vma
    }
}

impl Drop for AnonVmaRef {
    fn drop(&mut self) {
        self.anon_vma.refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

/// 获取匿名页的 anon_vma 引用（page_get_anon_vma）
///
/// 页未被映射时返回 None：此时也不会有页表项需要恢复。KSM 页不在
/// 这里处理。
pub fn page_get_anon_vma(page: &Page) -> Option<AnonVmaRef> {
    if page.is_ksm() || !page.is_mapped() {
        return None;
    }
    match page.mapping() {
        Mapping::Anon(anon_vma) => Some(AnonVmaRef::get(&anon_vma)),
        _ => None,
    }
}

/// 页表项引用统计（page_referenced 的结果）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Referenced {
    /// 被访问过的页表项数
    pub ptes: usize,
    /// 是否有可执行映射（VM_EXEC）
    pub exec: bool,
}

/// 反向映射协作者
///
/// 页交换在固定的时机调用：加锁之后拆除映射，交换完成之后恢复映射。
pub trait Rmap: Send + Sync {
    /// 把映射 `page` 的页表项全部换成迁移项（try_to_unmap + TTU_MIGRATION）
    ///
    /// 返回是否确实拆除了页表项。
    fn unmap_for_migration(&self, page: &Page) -> bool;

    /// 把指向 `old` 的迁移项恢复成指向 `new` 的页表项（remove_migration_ptes）
    ///
    /// 用 `new` 的 `(mapping, index)` 定位地址，用 `old` 的 index 计算子页。
    fn remap_after_migration(&self, old: &Page, new: &Arc<Page>);

    /// 统计并清除页表项的访问位（page_referenced）
    fn page_referenced(&self, page: &Page) -> Referenced;
}

/// VMA 的后备对象
#[derive(Debug, Clone)]
pub enum VmaBacking {
    Anon(Arc<AnonVma>),
    File(Arc<AddressSpace>),
}

/// 虚拟内存区域
#[derive(Debug, Clone)]
pub struct Vma {
    pub start: usize,
    pub end: usize,
    /// 起始地址对应的页索引（vm_pgoff）
    pub pgoff: usize,
    pub backing: VmaBacking,
    /// 可执行映射
    pub exec: bool,
    /// vma_migratable
    pub migratable: bool,
}

impl Vma {
    /// 匿名 VMA，vm_pgoff 取 `start >> PAGE_SHIFT`
    pub fn new_anon(start: usize, end: usize, anon_vma: Arc<AnonVma>) -> Self {
        Self {
            start,
            end,
            pgoff: start >> PAGE_SHIFT,
            backing: VmaBacking::Anon(anon_vma),
            exec: false,
            migratable: true,
        }
    }

    /// 文件映射 VMA
    pub fn new_file(start: usize, end: usize, pgoff: usize, mapping: Arc<AddressSpace>) -> Self {
        Self {
            start,
            end,
            pgoff,
            backing: VmaBacking::File(mapping),
            exec: false,
            migratable: true,
        }
    }

    /// 地址对应的页索引（linear_page_index）
    #[inline]
    pub fn linear_page_index(&self, address: usize) -> usize {
        ((address - self.start) >> PAGE_SHIFT) + self.pgoff
    }

    /// 页索引对应的地址（vma_address），不在本 VMA 内时为 None
    pub fn address_of(&self, index: usize) -> Option<usize> {
        if index < self.pgoff {
            return None;
        }
        let address = self.start.checked_add((index - self.pgoff) << PAGE_SHIFT)?;
        (address < self.end).then_some(address)
    }

    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        self.start <= address && address < self.end
    }

    /// VMA 是否属于页的反向映射
    fn backs(&self, mapping: &Mapping) -> bool {
        match (&self.backing, mapping) {
            (VmaBacking::Anon(a), Mapping::Anon(b)) => Arc::ptr_eq(a, b),
            (VmaBacking::File(a), Mapping::File(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// 页表项
#[derive(Debug, Clone)]
pub enum Pte {
    /// 映射整页
    Present { page: Arc<Page>, young: bool },
    /// 迁移项，记录旧页的 PFN
    Migration { pfn: Pfn },
}

/// mm 标志：正在执行 mm_manage（MMF_MM_MANAGE）
const MMF_MM_MANAGE: u64 = 1 << 0;

/// 进程地址空间（mm_struct 的子集）
#[derive(Debug)]
pub struct Mm {
    id: u64,
    vmas: Mutex<Vec<Vma>>,
    /// 页起始地址 → 页表项
    ptes: Mutex<BTreeMap<usize, Pte>>,
    flags: AtomicU64,
    memcg: Option<Arc<MemCgroup>>,
}

impl Mm {
    pub fn new(id: u64, memcg: Option<Arc<MemCgroup>>) -> Arc<Self> {
        Arc::new(Self {
            id,
            vmas: Mutex::new(Vec::new()),
            ptes: Mutex::new(BTreeMap::new()),
            flags: AtomicU64::new(0),
            memcg,
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// mem_cgroup_from_task
    pub fn mem_cgroup(&self) -> Option<&Arc<MemCgroup>> {
        self.memcg.as_ref()
    }

    /// 插入 VMA，不允许重叠
    pub fn add_vma(&self, vma: Vma) -> Result<(), Errno> {
        if vma.start >= vma.end {
            return Err(Errno::InvalidArgument);
        }
        let mut vmas = self.vmas.lock();
        if vmas.iter().any(|v| v.start < vma.end && vma.start < v.end) {
            return Err(Errno::InvalidArgument);
        }
        let pos = vmas.partition_point(|v| v.start < vma.start);
        vmas.insert(pos, vma);
        Ok(())
    }

    /// 第一个 `end > address` 的 VMA（find_vma），调用者需检查 `start`
    pub fn find_vma(&self, address: usize) -> Option<Vma> {
        self.vmas.lock().iter().find(|v| address < v.end).cloned()
    }

    /// 在 `address` 建立对 `page` 的映射（缺页处理的结果）
    ///
    /// 匿名 VMA 中，未归属的页在这里获得 anon_vma 和 index；文件 VMA
    /// 要求页已在对应的页缓存槽位中。
    pub fn map_page(&self, address: usize, page: &Arc<Page>) -> Result<(), Errno> {
        if address % page.size() != 0 {
            return Err(Errno::InvalidArgument);
        }
        let vma = self
            .find_vma(address)
            .filter(|v| v.contains(address) && address + page.size() <= v.end)
            .ok_or(Errno::BadAddress)?;
        let index = vma.linear_page_index(address);

        match &vma.backing {
            VmaBacking::Anon(anon_vma) => match page.mapping() {
                Mapping::None => {
                    page.set_mapping(Mapping::Anon(anon_vma.clone()));
                    page.set_index(index);
                    page.set_flag(PageFlag::SwapBacked);
                }
                Mapping::Anon(ref av) if Arc::ptr_eq(av, anon_vma) && page.index() == index => {}
                _ => return Err(Errno::InvalidArgument),
            },
            VmaBacking::File(mapping) => {
                let same_file = matches!(page.mapping(), Mapping::File(ref m) if Arc::ptr_eq(m, mapping));
                if !same_file || page.index() != index {
                    return Err(Errno::InvalidArgument);
                }
            }
        }

        let mut ptes = self.ptes.lock();
        if ptes.contains_key(&address) {
            return Err(Errno::DeviceOrResourceBusy);
        }
        page.get_page();
        page.add_mapcount();
        ptes.insert(
            address,
            Pte::Present {
                page: page.clone(),
                young: true,
            },
        );
        Ok(())
    }

    /// 覆盖 `address` 的页表项及其起始地址
    fn lookup(ptes: &BTreeMap<usize, Pte>, address: usize) -> Option<(usize, &Pte)> {
        let (&start, pte) = ptes.range(..=address).next_back()?;
        let covers = match pte {
            Pte::Present { page, .. } => address < start + page.size(),
            Pte::Migration { .. } => address == start,
        };
        covers.then_some((start, pte))
    }

    /// 查找并引用 `address` 处映射的页（follow_page + FOLL_GET）
    ///
    /// 没有映射或正在迁移时返回 None。
    pub fn follow_page(&self, address: usize) -> Option<Arc<Page>> {
        let ptes = self.ptes.lock();
        match Self::lookup(&ptes, address)? {
            (_, Pte::Present { page, .. }) => {
                page.get_page();
                Some(page.clone())
            }
            (_, Pte::Migration { .. }) => None,
        }
    }

    /// `address` 所在的物理页帧
    pub fn translate(&self, address: usize) -> Option<Pfn> {
        let ptes = self.ptes.lock();
        match Self::lookup(&ptes, address)? {
            (start, Pte::Present { page, .. }) => {
                Some(page.pfn() + ((address - start) >> PAGE_SHIFT))
            }
            (_, Pte::Migration { .. }) => None,
        }
    }

    /// 是否存在迁移项
    pub fn has_migration_entries(&self) -> bool {
        self.ptes
            .lock()
            .values()
            .any(|pte| matches!(pte, Pte::Migration { .. }))
    }

    /// 模拟一次访问，置位访问位
    pub fn touch(&self, address: usize) -> bool {
        let mut ptes = self.ptes.lock();
        let Some((start, _)) = Self::lookup(&ptes, address) else {
            return false;
        };
        match ptes.get_mut(&start) {
            Some(Pte::Present { young, .. }) => {
                *young = true;
                true
            }
            _ => false,
        }
    }

    /// 拆除 `address` 处的映射（zap_pte_range），返回是否拆除
    pub fn zap_page(&self, address: usize) -> bool {
        let mut ptes = self.ptes.lock();
        let Some((start, Pte::Present { .. })) = Self::lookup(&ptes, address) else {
            return false;
        };
        if let Some(Pte::Present { page, .. }) = ptes.remove(&start) {
            page.sub_mapcount();
            page.put_page();
        }
        true
    }

    /// 标记 mm 正在被 mm_manage 处理，已被标记时返回 false
    pub fn try_begin_manage(&self) -> bool {
        self.flags.fetch_or(MMF_MM_MANAGE, Ordering::AcqRel) & MMF_MM_MANAGE == 0
    }

    /// 清除 mm_manage 标记
    pub fn end_manage(&self) {
        self.flags.fetch_and(!MMF_MM_MANAGE, Ordering::Release);
    }

    /// 反向映射遍历的一步：`page` 在本 mm 中可能的全部地址及所在 VMA
    fn rmap_addresses(&self, mapping: &Mapping, index: usize) -> Vec<(usize, Vma)> {
        self.vmas
            .lock()
            .iter()
            .filter(|vma| vma.backs(mapping))
            .filter_map(|vma| vma.address_of(index).map(|addr| (addr, vma.clone())))
            .collect()
    }
}

/// 所有 mm 的反向映射登记表
#[derive(Debug, Default)]
pub struct RmapRegistry {
    mms: Mutex<Vec<Weak<Mm>>>,
}

impl RmapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记 mm
    pub fn register(&self, mm: &Arc<Mm>) {
        let mut mms = self.mms.lock();
        mms.retain(|m| m.strong_count() > 0);
        mms.push(Arc::downgrade(mm));
    }

    fn live_mms(&self) -> Vec<Arc<Mm>> {
        self.mms.lock().iter().filter_map(Weak::upgrade).collect()
    }
}

impl Rmap for RmapRegistry {
    fn unmap_for_migration(&self, page: &Page) -> bool {
        let mapping = page.mapping();
        if mapping.is_none() {
            return false;
        }
        let index = page.index();
        let mut unmapped = false;

        for mm in self.live_mms() {
            for (address, _) in mm.rmap_addresses(&mapping, index) {
                let mut ptes = mm.ptes.lock();
                let hit = matches!(
                    ptes.get(&address),
                    Some(Pte::Present { page: p, .. }) if core::ptr::eq(Arc::as_ptr(p), page)
                );
                if !hit {
                    continue;
                }
                if let Some(Pte::Present { page: p, .. }) =
                    ptes.insert(address, Pte::Migration { pfn: page.pfn() })
                {
                    p.sub_mapcount();
                    p.put_page();
                    unmapped = true;
                }
            }
        }
        unmapped
    }

    fn remap_after_migration(&self, old: &Page, new: &Arc<Page>) {
        let mapping = new.mapping();
        if mapping.is_none() {
            return;
        }
        let index = new.index();

        for mm in self.live_mms() {
            for (address, vma) in mm.rmap_addresses(&mapping, index) {
                let mut ptes = mm.ptes.lock();
                let hit = matches!(
                    ptes.get(&address),
                    Some(Pte::Migration { pfn }) if *pfn == old.pfn()
                );
                if !hit {
                    continue;
                }
                // 子页 = 线性索引 - 旧页 index，整页映射时必须为 0
                let subpage = vma.linear_page_index(address).wrapping_sub(old.index());
                if subpage != 0 {
                    log::warn!(
                        "rmap: migration entry at {:#x} of mm {} maps subpage {:#x} of {:#x}, skipped",
                        address,
                        mm.id(),
                        subpage,
                        old.pfn()
                    );
                    continue;
                }
                new.get_page();
                new.add_mapcount();
                ptes.insert(
                    address,
                    Pte::Present {
                        page: new.clone(),
                        young: false,
                    },
                );
            }
        }
    }

    fn page_referenced(&self, page: &Page) -> Referenced {
        let mapping = page.mapping();
        let mut referenced = Referenced::default();
        if mapping.is_none() {
            return referenced;
        }
        let index = page.index();

        for mm in self.live_mms() {
            for (address, vma) in mm.rmap_addresses(&mapping, index) {
                let mut ptes = mm.ptes.lock();
                if let Some(Pte::Present { page: p, young }) = ptes.get_mut(&address) {
                    if core::ptr::eq(Arc::as_ptr(p), page) && *young {
                        *young = false;
                        referenced.ptes += 1;
                        referenced.exec |= vma.exec;
                    }
                }
            }
        }
        referenced
    }
}
