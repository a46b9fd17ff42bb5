//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 页描述符 (Page Descriptor)
//!
//! 为每个物理页帧维护元数据，包括：
//! - 引用计数 (_refcount)
//! - 页标志位 (flags)
//! - 映射计数 (_mapcount)
//! - 所属地址空间与偏移 (mapping, index)
//! - NUMA 访问提示 (last_cpupid) 和所属 memcg
//! - 块设备页的 buffer_head 环
//!
//! 页描述符的身份字段（mapping/index/flags）只能在持有页锁时修改，
//! 页锁由 [`PageLock`] 守卫表示，离开作用域自动释放。

use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use spin::{Mutex, MutexGuard};

use crate::config::PAGE_SIZE;
use crate::errno::Errno;
use crate::mm::filemap::{AddressSpace, BufferRing};
use crate::mm::memcg::MemCgroup;
use crate::mm::migrate::FrameAllocator;
use crate::mm::numa::NodeId;
use crate::mm::rmap::AnonVma;

/// 物理页帧号
pub type Pfn = usize;

/// 页标志位
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PageFlag {
    /// 页已锁定，不可访问
    Locked = 1 << 0,
    /// 页发生过 I/O 错误
    Error = 1 << 1,
    /// 页已被访问（用于 LRU）
    Referenced = 1 << 2,
    /// 页数据有效（已从磁盘读取）
    UpToDate = 1 << 3,
    /// 页已修改（需要回写）
    Dirty = 1 << 4,
    /// 页在 LRU 链表中
    Lru = 1 << 5,
    /// 页在活跃 LRU 链表
    Active = 1 << 6,
    /// 页有等待者
    Waiters = 1 << 7,
    /// 文件系统私用的检查位
    Checked = 1 << 8,
    /// 页有私有数据（buffer_head）
    Private = 1 << 9,
    /// 页在磁盘上有对应块
    MappedToDisk = 1 << 10,
    /// 页正在回写
    Writeback = 1 << 11,
    /// 页在交换缓存中
    SwapCache = 1 << 12,
    /// 页由交换空间支持
    SwapBacked = 1 << 13,
    /// 页不可驱逐
    Unevictable = 1 << 14,
    /// 页最近被访问过（page_idle 跟踪）
    Young = 1 << 15,
    /// 页空闲（page_idle 跟踪）
    Idle = 1 << 16,
    /// 透明大页同时被 PMD 和 PTE 映射
    DoubleMap = 1 << 17,
    /// hugetlbfs 大页
    Huge = 1 << 18,
    /// KSM 合并页
    Ksm = 1 << 19,
    /// 保留页（内核使用，不可交换）
    Reserved = 1 << 20,
}

/// 页标志位集合
#[derive(Debug, Default)]
pub struct PageFlags(AtomicU32);

impl PageFlags {
    /// 创建空的标志位集合
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// 获取原始值
    pub fn raw(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    /// 测试标志位是否设置
    pub fn test(&self, flag: PageFlag) -> bool {
        self.0.load(Ordering::Acquire) & (flag as u32) != 0
    }

    /// 设置标志位
    pub fn set(&self, flag: PageFlag) {
        self.0.fetch_or(flag as u32, Ordering::Release);
    }

    /// 清除标志位
    pub fn clear(&self, flag: PageFlag) {
        self.0.fetch_and(!(flag as u32), Ordering::Release);
    }

    /// 测试并设置标志位（返回旧值）
    pub fn test_and_set(&self, flag: PageFlag) -> bool {
        let bit = flag as u32;
        (self.0.fetch_or(bit, Ordering::AcqRel) & bit) != 0
    }

    /// 测试并清除标志位（返回旧值）
    pub fn test_and_clear(&self, flag: PageFlag) -> bool {
        let bit = flag as u32;
        (self.0.fetch_and(!bit, Ordering::AcqRel) & bit) != 0
    }
}

/// 页的归属：匿名页指向 anon_vma，文件页指向 address_space
///
/// 对应 Linux page->mapping 的两种编码（低位 PAGE_MAPPING_ANON）
#[derive(Clone, Default)]
pub enum Mapping {
    /// 没有归属（刚分配或已被截断）
    #[default]
    None,
    /// 匿名页
    Anon(Arc<AnonVma>),
    /// 页缓存页
    File(Arc<AddressSpace>),
}

impl Mapping {
    /// 是否为空
    pub fn is_none(&self) -> bool {
        matches!(self, Mapping::None)
    }

    /// 两个归属是否指向同一个对象
    pub fn same_as(&self, other: &Mapping) -> bool {
        match (self, other) {
            (Mapping::None, Mapping::None) => true,
            (Mapping::Anon(a), Mapping::Anon(b)) => Arc::ptr_eq(a, b),
            (Mapping::File(a), Mapping::File(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mapping::None => write!(f, "none"),
            Mapping::Anon(av) => write!(f, "anon_vma:{}", av.id()),
            Mapping::File(mapping) => write!(f, "address_space:{}", mapping.id()),
        }
    }
}

/// 映射计数的初始偏移值（-1 表示未映射）
const PAGE_MAPCOUNT_BIAS: i32 = -1;

/// 页描述符
///
/// 每个物理页帧（或复合页的头页）对应一个 Page 结构体。复合页的
/// 全部内容保存在头页的 `data` 中，长度为 `PAGE_SIZE << order`。
pub struct Page {
    /// 物理页帧号
    pfn: Pfn,

    /// 所在 NUMA 节点
    nid: NodeId,

    /// 复合页 order，基本页为 0
    order: u32,

    /// 原子标志位
    flags: PageFlags,

    /// 映射计数：有多少页表项直接引用此页
    /// -1 表示未映射，0 表示已映射一次，以此类推
    _mapcount: AtomicI32,

    /// 引用计数：对此页的引用数，0 表示空闲
    _refcount: AtomicI32,

    /// 在映射中的偏移（页单位）
    index: AtomicUsize,

    /// 最近访问此页的 CPU/节点（NUMA balancing 提示），-1 表示无
    last_cpupid: AtomicI32,

    /// 所属 anon_vma 或 address_space
    mapping: Mutex<Mapping>,

    /// 计费的内存 cgroup
    mem_cgroup: Mutex<Option<Arc<MemCgroup>>>,

    /// 私有数据：buffer_head 环
    private: Mutex<Option<Arc<BufferRing>>>,

    /// 页内容
    data: Mutex<Box<[u8]>>,

    /// 等待页锁的线程数，与 Waiters 位一起修改
    nr_waiters: Mutex<usize>,
}

impl Page {
    /// 创建一个新的页描述符（初始化为空闲状态）
    pub fn new(pfn: Pfn, nid: NodeId, order: u32) -> Self {
        Self {
            pfn,
            nid,
            order,
            flags: PageFlags::new(),
            _mapcount: AtomicI32::new(PAGE_MAPCOUNT_BIAS),
            _refcount: AtomicI32::new(0),
            index: AtomicUsize::new(0),
            last_cpupid: AtomicI32::new(-1),
            mapping: Mutex::new(Mapping::None),
            mem_cgroup: Mutex::new(None),
            private: Mutex::new(None),
            data: Mutex::new(vec![0u8; PAGE_SIZE << order].into_boxed_slice()),
            nr_waiters: Mutex::new(0),
        }
    }

    /// 物理页帧号
    #[inline]
    pub fn pfn(&self) -> Pfn {
        self.pfn
    }

    /// 所在节点
    #[inline]
    pub fn nid(&self) -> NodeId {
        self.nid
    }

    /// 复合页 order
    #[inline]
    pub fn order(&self) -> u32 {
        self.order
    }

    /// 包含的基本页数（hpage_nr_pages）
    #[inline]
    pub fn nr_pages(&self) -> usize {
        1 << self.order
    }

    /// 内容字节数
    #[inline]
    pub fn size(&self) -> usize {
        PAGE_SIZE << self.order
    }

    /// 是否为复合页
    #[inline]
    pub fn is_compound(&self) -> bool {
        self.order > 0
    }

    // ========== 标志位操作 ==========

    /// 原始标志位
    #[inline]
    pub fn flags_raw(&self) -> u32 {
        self.flags.raw()
    }

    /// 测试标志位
    #[inline]
    pub fn test_flag(&self, flag: PageFlag) -> bool {
        self.flags.test(flag)
    }

    /// 设置标志位
    #[inline]
    pub fn set_flag(&self, flag: PageFlag) {
        self.flags.set(flag);
    }

    /// 清除标志位
    #[inline]
    pub fn clear_flag(&self, flag: PageFlag) {
        self.flags.clear(flag);
    }

    /// 测试并设置标志位
    #[inline]
    pub fn test_and_set_flag(&self, flag: PageFlag) -> bool {
        self.flags.test_and_set(flag)
    }

    /// 测试并清除标志位
    #[inline]
    pub fn test_and_clear_flag(&self, flag: PageFlag) -> bool {
        self.flags.test_and_clear(flag)
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.test_flag(PageFlag::Locked)
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.test_flag(PageFlag::Dirty)
    }

    #[inline]
    pub fn is_writeback(&self) -> bool {
        self.test_flag(PageFlag::Writeback)
    }

    #[inline]
    pub fn is_lru(&self) -> bool {
        self.test_flag(PageFlag::Lru)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.test_flag(PageFlag::Active)
    }

    #[inline]
    pub fn is_unevictable(&self) -> bool {
        self.test_flag(PageFlag::Unevictable)
    }

    #[inline]
    pub fn is_swap_backed(&self) -> bool {
        self.test_flag(PageFlag::SwapBacked)
    }

    #[inline]
    pub fn is_swap_cache(&self) -> bool {
        self.test_flag(PageFlag::SwapCache)
    }

    /// hugetlbfs 大页
    #[inline]
    pub fn is_huge(&self) -> bool {
        self.test_flag(PageFlag::Huge)
    }

    /// 透明大页
    #[inline]
    pub fn is_trans_huge(&self) -> bool {
        self.is_compound() && !self.is_huge()
    }

    #[inline]
    pub fn is_ksm(&self) -> bool {
        self.test_flag(PageFlag::Ksm)
    }

    /// 是否挂有私有数据（page_has_private）
    #[inline]
    pub fn has_private(&self) -> bool {
        self.test_flag(PageFlag::Private)
    }

    /// 文件页走 file LRU（page_is_file_cache）
    #[inline]
    pub fn is_file_cache(&self) -> bool {
        !self.is_swap_backed()
    }

    // ========== 引用计数操作 ==========

    /// 获取引用计数
    #[inline]
    pub fn refcount(&self) -> i32 {
        self._refcount.load(Ordering::Acquire)
    }

    /// 增加引用计数
    /// 返回增加后的值
    #[inline]
    pub fn get_page(&self) -> i32 {
        self._refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// 减少引用计数
    /// 返回减少后的值；如果变为 0，页回到空闲状态
    #[inline]
    pub fn put_page(&self) -> i32 {
        let count = self._refcount.fetch_sub(1, Ordering::AcqRel) - 1;
        assert!(count >= 0, "put_page on free page pfn {:#x}", self.pfn);
        count
    }

    /// 增加 nr 个引用（page_ref_add）
    #[inline]
    pub fn page_ref_add(&self, nr: i32) -> i32 {
        self._refcount.fetch_add(nr, Ordering::AcqRel) + nr
    }

    /// 尝试增加引用计数（仅当 refcount > 0 时）
    /// 成功返回 true
    #[inline]
    pub fn try_get_page(&self) -> bool {
        loop {
            let old = self._refcount.load(Ordering::Acquire);
            if old <= 0 {
                return false;
            }
            match self._refcount.compare_exchange_weak(
                old,
                old + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }

    /// 设置引用计数（仅用于初始化）
    #[inline]
    pub fn set_refcount(&self, count: i32) {
        self._refcount.store(count, Ordering::Release);
    }

    /// 冻结引用计数（page_ref_freeze）
    ///
    /// 只有当前计数恰好等于 `expected` 时才把它原子地置 0，此后
    /// `try_get_page` 全部失败，相当于阻断了并发的页缓存查找。
    /// 返回的守卫在析构时把计数恢复为 `expected`（或经
    /// [`RefFreeze::unfreeze_to`] 修改后的值）。
    pub fn try_freeze(&self, expected: i32) -> Result<RefFreeze<'_>, Errno> {
        self._refcount
            .compare_exchange(expected, 0, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| RefFreeze {
                page: self,
                count: expected,
            })
            .map_err(|_| Errno::DeviceOrResourceBusy)
    }

    // ========== 映射计数操作 ==========

    /// 获取原始映射计数（-1 表示未映射）
    #[inline]
    pub fn raw_mapcount(&self) -> i32 {
        self._mapcount.load(Ordering::Acquire)
    }

    /// 映射此页的页表项个数（page_mapcount）
    #[inline]
    pub fn mapcount(&self) -> i32 {
        self.raw_mapcount() - PAGE_MAPCOUNT_BIAS
    }

    /// 增加映射计数
    /// 返回增加后的原始值
    #[inline]
    pub fn add_mapcount(&self) -> i32 {
        self._mapcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// 减少映射计数
    /// 返回减少后的原始值
    #[inline]
    pub fn sub_mapcount(&self) -> i32 {
        self._mapcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// 检查页是否被映射（page_mapped）
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self._mapcount.load(Ordering::Acquire) > PAGE_MAPCOUNT_BIAS
    }

    // ========== 映射信息操作 ==========

    /// 页的归属（page->mapping 原值）
    pub fn mapping(&self) -> Mapping {
        self.mapping.lock().clone()
    }

    /// 设置页的归属
    pub fn set_mapping(&self, mapping: Mapping) {
        *self.mapping.lock() = mapping;
    }

    /// 页所属的地址空间（page_mapping），匿名页返回 None
    pub fn page_mapping(&self) -> Option<Arc<AddressSpace>> {
        match &*self.mapping.lock() {
            Mapping::File(mapping) => Some(mapping.clone()),
            _ => None,
        }
    }

    /// 是否为匿名页（PageAnon）
    pub fn is_anon(&self) -> bool {
        matches!(&*self.mapping.lock(), Mapping::Anon(_))
    }

    /// 获取页索引
    #[inline]
    pub fn index(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    /// 设置页索引
    #[inline]
    pub fn set_index(&self, index: usize) {
        self.index.store(index, Ordering::Release);
    }

    /// 交换最近访问提示，返回旧值（page_cpupid_xchg_last）
    #[inline]
    pub fn cpupid_xchg_last(&self, cpupid: i32) -> i32 {
        self.last_cpupid.swap(cpupid, Ordering::AcqRel)
    }

    /// 最近访问提示
    #[inline]
    pub fn last_cpupid(&self) -> i32 {
        self.last_cpupid.load(Ordering::Acquire)
    }

    // ========== memcg ==========

    /// 计费的 memcg（page_memcg）
    pub fn mem_cgroup(&self) -> Option<Arc<MemCgroup>> {
        self.mem_cgroup.lock().clone()
    }

    /// 设置计费的 memcg，不做 charge/uncharge
    pub fn set_mem_cgroup(&self, memcg: Option<Arc<MemCgroup>>) {
        *self.mem_cgroup.lock() = memcg;
    }

    /// memcg 是否为指定 cgroup
    pub fn in_mem_cgroup(&self, memcg: &MemCgroup) -> bool {
        self.mem_cgroup
            .lock()
            .as_ref()
            .map_or(false, |cg| cg.id() == memcg.id())
    }

    // ========== 私有数据操作 ==========

    /// buffer_head 环（page_buffers）
    pub fn buffers(&self) -> Option<Arc<BufferRing>> {
        self.private.lock().clone()
    }

    /// 设置 buffer_head 环（set_page_private）
    pub fn set_buffers(&self, buffers: Option<Arc<BufferRing>>) {
        *self.private.lock() = buffers;
    }

    /// 取走 buffer_head 环
    pub fn take_buffers(&self) -> Option<Arc<BufferRing>> {
        self.private.lock().take()
    }

    // ========== 页内容 ==========

    /// 锁住页内容，只在持有页锁时调用
    pub fn data(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.data.lock()
    }

    /// 用固定字节填充页内容
    pub fn fill(&self, byte: u8) {
        self.data.lock().fill(byte);
    }

    /// 复制一份页内容
    pub fn read_all(&self) -> Vec<u8> {
        self.data.lock().to_vec()
    }

    // ========== 页锁 ==========

    /// 尝试加页锁（trylock_page）
    pub fn trylock(self: &Arc<Self>) -> Option<PageLock> {
        if self.flags.test_and_set(PageFlag::Locked) {
            None
        } else {
            Some(PageLock { page: self.clone() })
        }
    }

    /// 加页锁，阻塞直到成功（lock_page）
    ///
    /// 等待期间置 Waiters 位，最后一个等待者拿到锁时才清除。
    pub fn lock(self: &Arc<Self>) -> PageLock {
        if let Some(guard) = self.trylock() {
            return guard;
        }
        {
            let mut waiters = self.nr_waiters.lock();
            *waiters += 1;
            self.set_flag(PageFlag::Waiters);
        }
        let guard = loop {
            if let Some(guard) = self.trylock() {
                break guard;
            }
            std::thread::yield_now();
        };
        let mut waiters = self.nr_waiters.lock();
        *waiters -= 1;
        if *waiters == 0 {
            self.clear_flag(PageFlag::Waiters);
        }
        guard
    }

    /// 等待回写完成（wait_on_page_writeback）
    pub fn wait_on_writeback(&self) {
        while self.is_writeback() {
            std::thread::yield_now();
        }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("pfn", &format_args!("{:#x}", self.pfn))
            .field("nid", &self.nid)
            .field("order", &self.order)
            .field("count", &self.refcount())
            .field("mapcount", &self.mapcount())
            .field("mapping", &self.mapping())
            .field("index", &format_args!("{:#x}", self.index()))
            .field("flags", &format_args!("{:#x}", self.flags_raw()))
            .finish()
    }
}

/// 页锁守卫
///
/// 持有期间页的 Locked 位被置位，析构时清除（unlock_page）。
pub struct PageLock {
    page: Arc<Page>,
}

impl PageLock {
    /// 被锁住的页
    #[inline]
    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }
}

impl Deref for PageLock {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PageLock {
    fn drop(&mut self) {
        self.page.clear_flag(PageFlag::Locked);
    }
}

impl fmt::Debug for PageLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageLock({:#x})", self.page.pfn())
    }
}

/// 引用计数冻结守卫
#[derive(Debug)]
pub struct RefFreeze<'a> {
    page: &'a Page,
    count: i32,
}

impl RefFreeze<'_> {
    /// 修改解冻后的计数（page_ref_unfreeze 的参数）
    pub fn unfreeze_to(&mut self, count: i32) {
        self.count = count;
    }
}

impl Drop for RefFreeze<'_> {
    fn drop(&mut self) {
        self.page._refcount.store(self.count, Ordering::Release);
    }
}

/// 打印页的状态（pr_dump_page）
pub fn dump_page(page: &Page, msg: &str) {
    if cfg!(feature = "debug_log") {
        log::debug!(
            "dump: {} page({:#x}): count: {}, mapcount: {}, mapping: {:?}, index: {:#x}, \
             flags: {:#x}, {}, order: {}, {}",
            msg,
            page.pfn(),
            page.refcount(),
            page.mapcount(),
            page.mapping(),
            page.index(),
            page.flags_raw(),
            if page.is_compound() { "compound_page" } else { "single_page" },
            page.order(),
            if page.is_dirty() { "dirty" } else { "clean" },
        );
    } else {
        log::debug!("dump: {} page({:#x})", msg, page.pfn());
    }
}

// ========== 全局页数组 (mem_map) ==========

/// 页数组
///
/// 持有所有页描述符，按节点分配新的物理页帧。复合页占用
/// `1 << order` 个连续 PFN，PFN 总是按 order 对齐。
pub struct MemMap {
    pages: Mutex<Vec<Arc<Page>>>,
    next_pfn: AtomicUsize,
}

impl MemMap {
    /// 创建页数组，PFN 从 `base_pfn` 开始编号
    pub fn new(base_pfn: Pfn) -> Self {
        Self {
            pages: Mutex::new(Vec::new()),
            next_pfn: AtomicUsize::new(base_pfn),
        }
    }

    /// 在节点 `nid` 上分配一个 order 阶的页，返回时引用计数为 1
    pub fn alloc_page(&self, nid: NodeId, order: u32) -> Arc<Page> {
        let nr = 1usize << order;
        let pfn = loop {
            let cur = self.next_pfn.load(Ordering::Acquire);
            let aligned = (cur + nr - 1) & !(nr - 1);
            if self
                .next_pfn
                .compare_exchange(cur, aligned + nr, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break aligned;
            }
        };
        let page = Arc::new(Page::new(pfn, nid, order));
        page.set_refcount(1);
        self.pages.lock().push(page.clone());
        page
    }

    /// 已分配的页描述符数
    pub fn nr_pages(&self) -> usize {
        self.pages.lock().len()
    }
}

impl FrameAllocator for MemMap {
    fn alloc_page_on_node(&self, nid: NodeId, order: u32) -> Option<Arc<Page>> {
        Some(self.alloc_page(nid, order))
    }
}
