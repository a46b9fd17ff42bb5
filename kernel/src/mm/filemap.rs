//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 页缓存 (Page Cache) 和 buffer_head
//!
//! 完全遵循 Linux 内核的页缓存设计 (mm/filemap.c, fs/buffer.c)
//!
//! 核心概念：
//! - `struct address_space`: 地址空间，按页索引管理一个文件的所有缓存页
//! - `i_pages`: 索引树，自带锁（xa_lock），页交换只在改写槽位时持有
//! - `struct buffer_head`: 缓冲区头，块设备页的每个块对应一个，
//!   通过 `b_page` 指回所在页
//!
//! 页缓存持有每个缓存页的一个引用（按基本页数计），挂有 buffer_head
//! 的页再多持有一个私有引用。

use core::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::collections::BTreeMap;
use std::sync::Arc;

use spin::{Mutex, MutexGuard};

use crate::errno::Errno;
use crate::mm::migrate::MigrateSync;
use crate::mm::numa::{NodeStatItem, NumaTopology};
use crate::mm::page_desc::{Mapping, Page, PageFlag, Pfn};

/// 地址空间的迁移操作（a_ops->migratepage）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateOp {
    /// buffer_migrate_page：块设备页，需要搬移 buffer_head
    Buffer,
    /// 文件系统自定义的 migratepage，页交换不支持
    Generic,
    /// 没有 migratepage（fallback_migrate_page）
    None,
}

/// 地址空间
///
/// 对应 Linux 的 struct address_space (include/linux/fs.h)
#[derive(Debug)]
pub struct AddressSpace {
    id: u64,
    /// 页索引 → 缓存页
    i_pages: Mutex<BTreeMap<usize, Arc<Page>>>,
    migrate_op: MigrateOp,
    /// mapping_cap_account_dirty
    account_dirty: bool,
    nrpages: AtomicUsize,
}

/// 持有 i_pages 锁时的索引视图（xa_state）
pub struct PageIndex<'a> {
    slots: MutexGuard<'a, BTreeMap<usize, Arc<Page>>>,
}

impl PageIndex<'_> {
    /// 槽位中的页（xas_load）
    pub fn load(&self, index: usize) -> Option<&Arc<Page>> {
        self.slots.get(&index)
    }

    /// 槽位中是否恰好是 `page`
    pub fn holds(&self, index: usize, page: &Page) -> bool {
        self.load(index)
            .map_or(false, |slot| core::ptr::eq(Arc::as_ptr(slot), page))
    }

    /// 改写槽位（xas_store），返回原来的页
    pub fn store(&mut self, index: usize, page: Arc<Page>) -> Option<Arc<Page>> {
        self.slots.insert(index, page)
    }
}

impl AddressSpace {
    /// 创建新的地址空间
    pub fn new(id: u64, migrate_op: MigrateOp, account_dirty: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            i_pages: Mutex::new(BTreeMap::new()),
            migrate_op,
            account_dirty,
            nrpages: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn migrate_op(&self) -> MigrateOp {
        self.migrate_op
    }

    /// 脏页是否计入 NR_FILE_DIRTY（mapping_cap_account_dirty）
    #[inline]
    pub fn cap_account_dirty(&self) -> bool {
        self.account_dirty
    }

    /// 缓存的基本页数
    #[inline]
    pub fn nrpages(&self) -> usize {
        self.nrpages.load(Ordering::Relaxed)
    }

    /// 锁住索引树（xas_lock_irq）
    pub fn lock_index(&self) -> PageIndex<'_> {
        PageIndex {
            slots: self.i_pages.lock(),
        }
    }

    /// 把页加入页缓存（add_to_page_cache_lru 的缓存部分）
    ///
    /// 页缓存获得 `nr_pages` 个引用，页归属于本地址空间。
    pub fn add_to_page_cache(
        self: &Arc<Self>,
        page: &Arc<Page>,
        index: usize,
        topology: &NumaTopology,
    ) -> Result<(), Errno> {
        let mut slots = self.i_pages.lock();
        if slots.contains_key(&index) {
            return Err(Errno::DeviceOrResourceBusy);
        }
        page.set_mapping(Mapping::File(self.clone()));
        page.set_index(index);
        page.page_ref_add(page.nr_pages() as i32);
        slots.insert(index, page.clone());
        self.nrpages.fetch_add(page.nr_pages(), Ordering::Relaxed);

        let nr = page.nr_pages() as isize;
        topology.mod_node_state(page.nid(), NodeStatItem::FilePages, nr);
        if page.is_swap_backed() && !page.is_swap_cache() {
            topology.mod_node_state(page.nid(), NodeStatItem::Shmem, nr);
        }
        Ok(())
    }

    /// 查找并引用缓存页（find_get_page）
    ///
    /// 页的引用计数被冻结时查找失败。
    pub fn find_get_page(&self, index: usize) -> Option<Arc<Page>> {
        let slots = self.i_pages.lock();
        let page = slots.get(&index)?;
        if page.try_get_page() {
            Some(page.clone())
        } else {
            None
        }
    }

    /// 置脏并计入节点统计（set_page_dirty / account_page_dirtied）
    ///
    /// 页上挂着的 buffer 一并置脏（__set_page_dirty_buffers）。
    pub fn set_page_dirty(&self, page: &Page, topology: &NumaTopology) {
        if let Some(ring) = page.buffers() {
            ring.heads().iter().for_each(BufferHead::mark_dirty);
        }
        if page.test_and_set_flag(PageFlag::Dirty) {
            return;
        }
        if self.account_dirty {
            let nr = page.nr_pages() as isize;
            topology.mod_node_state(page.nid(), NodeStatItem::FileDirty, nr);
            topology.mod_node_state(page.nid(), NodeStatItem::ZoneWritePending, nr);
        }
    }

    /// 回写脏页（writeout）
    ///
    /// 清除脏位并发起回写；回写在本模型中同步完成。页交换调用方随后
    /// 需要重试，因此总是返回 `EAGAIN`。
    pub fn writeout(&self, page: &Page, topology: &NumaTopology) -> Errno {
        if let Some(ring) = page.buffers() {
            ring.heads().iter().for_each(BufferHead::clear_dirty);
        }
        if page.test_and_clear_flag(PageFlag::Dirty) && self.account_dirty {
            let nr = page.nr_pages() as isize;
            topology.mod_node_state(page.nid(), NodeStatItem::FileDirty, -nr);
            topology.mod_node_state(page.nid(), NodeStatItem::ZoneWritePending, -nr);
        }
        log::debug!("filemap: wrote out page {:#x} of mapping {}", page.pfn(), self.id);
        Errno::TryAgain
    }
}

// ========== buffer_head ==========

const BH_LOCK: u32 = 1 << 0;
const BH_DIRTY: u32 = 1 << 1;

/// 缓冲区头
///
/// 对应 Linux 的 struct buffer_head (include/linux/buffer_head.h)
#[derive(Debug)]
pub struct BufferHead {
    /// 所在页（b_page）
    b_page: AtomicUsize,
    /// 块在页内的偏移（bh_offset）
    offset: usize,
    b_state: AtomicU32,
    b_count: AtomicI32,
}

impl BufferHead {
    fn new(pfn: Pfn, offset: usize) -> Self {
        Self {
            b_page: AtomicUsize::new(pfn),
            offset,
            b_state: AtomicU32::new(0),
            b_count: AtomicI32::new(0),
        }
    }

    /// 所在页的 PFN
    #[inline]
    pub fn page_pfn(&self) -> Pfn {
        self.b_page.load(Ordering::Acquire)
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// 修改所在页（set_bh_page）
    pub fn set_page(&self, pfn: Pfn) {
        self.b_page.store(pfn, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.b_state.load(Ordering::Acquire) & BH_LOCK != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.b_state.load(Ordering::Acquire) & BH_DIRTY != 0
    }

    /// mark_buffer_dirty
    pub fn mark_dirty(&self) {
        self.b_state.fetch_or(BH_DIRTY, Ordering::AcqRel);
    }

    /// clear_buffer_dirty
    pub fn clear_dirty(&self) {
        self.b_state.fetch_and(!BH_DIRTY, Ordering::AcqRel);
    }

    /// 引用计数（b_count）
    pub fn count(&self) -> i32 {
        self.b_count.load(Ordering::Acquire)
    }

    fn trylock(&self) -> bool {
        self.b_state.fetch_or(BH_LOCK, Ordering::AcqRel) & BH_LOCK == 0
    }

    fn lock(&self) {
        while !self.trylock() {
            std::thread::yield_now();
        }
    }

    fn unlock(&self) {
        self.b_state.fetch_and(!BH_LOCK, Ordering::Release);
    }
}

/// 一页上的全部 buffer_head（b_this_page 环）
#[derive(Debug)]
pub struct BufferRing {
    heads: Vec<BufferHead>,
}

impl BufferRing {
    /// 为页创建按 `blocksize` 切分的 buffer_head 环
    pub fn new(page: &Page, blocksize: usize) -> Arc<Self> {
        assert!(blocksize > 0 && page.size() % blocksize == 0);
        let heads = (0..page.size() / blocksize)
            .map(|i| BufferHead::new(page.pfn(), i * blocksize))
            .collect();
        Arc::new(Self { heads })
    }

    pub fn heads(&self) -> &[BufferHead] {
        &self.heads
    }

    /// 锁住全部 buffer（buffer_migrate_lock_buffers）
    ///
    /// 异步模式只尝试加锁，任何一个失败都会解开已加的锁并返回 false；
    /// 其他模式阻塞加锁。每个成功加锁的 buffer 持有一个引用。
    pub fn lock_all(&self, sync: MigrateSync) -> bool {
        if sync != MigrateSync::Async {
            for bh in &self.heads {
                bh.b_count.fetch_add(1, Ordering::AcqRel);
                bh.lock();
            }
            return true;
        }

        for (i, bh) in self.heads.iter().enumerate() {
            bh.b_count.fetch_add(1, Ordering::AcqRel);
            if !bh.trylock() {
                bh.b_count.fetch_sub(1, Ordering::AcqRel);
                for locked in &self.heads[..i] {
                    locked.unlock();
                    locked.b_count.fetch_sub(1, Ordering::AcqRel);
                }
                return false;
            }
        }
        true
    }

    /// 解锁并释放 lock_all 持有的引用
    pub fn unlock_all(&self) {
        for bh in &self.heads {
            bh.unlock();
            bh.b_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// 所有 buffer 改指向 `pfn`
    pub fn repoint(&self, pfn: Pfn) {
        for bh in &self.heads {
            bh.set_page(pfn);
        }
    }

    /// 是否仍有人使用（buffer_busy）
    pub fn is_busy(&self) -> bool {
        self.heads
            .iter()
            .any(|bh| bh.count() != 0 || bh.is_locked() || bh.is_dirty())
    }
}

/// 给页挂上 buffer_head（attach_page_private）
pub fn attach_page_buffers(page: &Page, ring: Arc<BufferRing>) {
    page.set_buffers(Some(ring));
    page.set_flag(PageFlag::Private);
    page.get_page();
}

/// 释放页的 buffer_head（try_to_free_buffers）
///
/// 任一 buffer 仍被使用时失败。
pub fn try_to_free_buffers(page: &Page) -> bool {
    let Some(ring) = page.buffers() else {
        return true;
    };
    if ring.is_busy() {
        return false;
    }
    page.take_buffers();
    if page.test_and_clear_flag(PageFlag::Private) {
        page.put_page();
    }
    true
}
