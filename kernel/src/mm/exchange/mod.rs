//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 页交换 (Page Exchange)
//!
//! 把两个正在使用、位于不同节点的页原地互换：内容、`(mapping, index)`
//! 身份、瞬时标志、memcg 归属全部交叉交换，原来指向 A 的页表项改为
//! 指向 B，反之亦然。
//!
//! 单对页的流程（见 `pair`）：
//!
//! ```text
//! 加锁 from → 加锁 to → 检查回写 → 拆除页表项
//!   → 交换身份 (mapping) → 交换内容 (copy_page) → 交换标志 (flags)
//!   → 恢复页表项 → 解锁 to → 解锁 from → 放回 LRU
//! ```
//!
//! 批量并发交换（见 `concur`）把同一阶段放在一起执行：先拆除全部页对
//! 的映射，再批量交换身份、一次性并行拷贝全部内容、最后批量恢复映射。
//! 不能走并发路径的页对（复合页、页缓存页）退回到逐对串行处理。
//!
//! 进入交换的页必须已经隔离（不在 LRU 上，多持有一个隔离引用，
//! NR_ISOLATED_* 已计数）。无论成败，交换结束时每个页恰好被放回
//! LRU 或释放一次。

mod concur;
pub mod flags;
pub mod mapping;
mod pair;

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{ExchangeConfig, ExchangeParams};
use crate::errno::Errno;
use crate::mm::copy_page::CopyEngine;
use crate::mm::dma::DmaProvider;
use crate::mm::lru::LruIsolation;
use crate::mm::migrate::MigrateMode;
use crate::mm::numa::NumaTopology;
use crate::mm::page_desc::{Page, PageFlag, PageLock};
use crate::mm::rmap::{AnonVmaRef, Rmap};

pub use flags::{exchange_page_flags, PageFlagsSnapshot};
pub use mapping::{rebind, ExtraRefs};

/// 交换前的计数快照，用于事后诊断
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CountSnapshot {
    from_count: i32,
    from_mapcount: i32,
    to_count: i32,
    to_mapcount: i32,
    from_flags: u32,
    to_flags: u32,
}

impl CountSnapshot {
    fn take(from: &Page, to: &Page) -> Self {
        Self {
            from_count: from.refcount(),
            from_mapcount: from.mapcount(),
            to_count: to.refcount(),
            to_mapcount: to.mapcount(),
            from_flags: from.flags_raw(),
            to_flags: to.flags_raw(),
        }
    }
}

/// 一对待交换的页（exchange_page_info）
///
/// 由选页方创建，在交换的各个阶段之间按所有权移动，交换结束后两页
/// 解锁放回 LRU，记录随之销毁。
pub struct ExchangePair {
    from: Arc<Page>,
    to: Arc<Page>,
    from_lock: Option<PageLock>,
    to_lock: Option<PageLock>,
    from_anon_vma: Option<AnonVmaRef>,
    to_anon_vma: Option<AnonVmaRef>,
    from_was_mapped: bool,
    to_was_mapped: bool,
    /// 交换前的 index，恢复页表项时临时还原
    from_index: usize,
    to_index: usize,
    before: CountSnapshot,
}

impl ExchangePair {
    /// 由两个已隔离的页组成一对
    pub fn new(from: Arc<Page>, to: Arc<Page>) -> Self {
        Self {
            from,
            to,
            from_lock: None,
            to_lock: None,
            from_anon_vma: None,
            to_anon_vma: None,
            from_was_mapped: false,
            to_was_mapped: false,
            from_index: 0,
            to_index: 0,
            before: CountSnapshot::default(),
        }
    }

    #[inline]
    pub fn from(&self) -> &Arc<Page> {
        &self.from
    }

    #[inline]
    pub fn to(&self) -> &Arc<Page> {
        &self.to
    }

    /// 是否持有两把页锁
    pub fn is_locked(&self) -> bool {
        self.from_lock.is_some() && self.to_lock.is_some()
    }

    /// 按加锁的逆序释放：先 to 再 from，anon_vma 引用随页锁一起释放
    fn unlock(&mut self) {
        self.to_anon_vma.take();
        self.to_lock.take();
        self.from_anon_vma.take();
        self.from_lock.take();
    }

    fn into_pages(mut self) -> (Arc<Page>, Arc<Page>) {
        self.unlock();
        (self.from, self.to)
    }
}

impl core::fmt::Debug for ExchangePair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExchangePair")
            .field("from", &format_args!("{:#x}", self.from.pfn()))
            .field("to", &format_args!("{:#x}", self.to.pfn()))
            .field("locked", &self.is_locked())
            .field("from_was_mapped", &self.from_was_mapped)
            .field("to_was_mapped", &self.to_was_mapped)
            .finish()
    }
}

/// 一批交换的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    pub nr_succeeded: usize,
    pub nr_failed: usize,
}

impl ExchangeStats {
    /// 有任何一对失败时返回聚合错误 `EFAULT`
    pub fn into_result(self) -> Result<(), Errno> {
        if self.nr_failed > 0 {
            Err(Errno::BadAddress)
        } else {
            Ok(())
        }
    }
}

/// 页交换器
///
/// 持有交换用到的全部协作者：反向映射、LRU 隔离、拷贝引擎。
pub struct PageExchanger {
    topology: Arc<NumaTopology>,
    rmap: Arc<dyn Rmap>,
    lru: Arc<dyn LruIsolation>,
    copy: CopyEngine,
    /// 串行路径 EAGAIN 重试次数
    retries: AtomicUsize,
    /// 并发路径最大轮数
    concur_passes: AtomicUsize,
    /// 每批并发交换的页对数（migration_batch_size）
    batch_size: AtomicUsize,
}

impl PageExchanger {
    pub fn new(
        topology: Arc<NumaTopology>,
        rmap: Arc<dyn Rmap>,
        lru: Arc<dyn LruIsolation>,
        copy: CopyEngine,
        params: &ExchangeParams,
    ) -> Self {
        Self {
            topology,
            rmap,
            lru,
            copy,
            retries: AtomicUsize::new(params.retries),
            concur_passes: AtomicUsize::new(params.concur_passes.max(1)),
            batch_size: AtomicUsize::new(params.batch_size),
        }
    }

    /// 按完整配置创建，拷贝引擎一并构造
    pub fn with_config(
        topology: Arc<NumaTopology>,
        rmap: Arc<dyn Rmap>,
        lru: Arc<dyn LruIsolation>,
        dma_provider: Arc<dyn DmaProvider>,
        config: &ExchangeConfig,
    ) -> Self {
        let copy = CopyEngine::new(topology.clone(), dma_provider, config);
        Self::new(topology, rmap, lru, copy, &config.exchange)
    }

    #[inline]
    pub fn topology(&self) -> &Arc<NumaTopology> {
        &self.topology
    }

    #[inline]
    pub fn lru(&self) -> &Arc<dyn LruIsolation> {
        &self.lru
    }

    #[inline]
    pub fn rmap(&self) -> &Arc<dyn Rmap> {
        &self.rmap
    }

    /// 拷贝引擎（limit_mt_num、DMA 开关在这里调整）
    #[inline]
    pub fn copy_engine(&self) -> &CopyEngine {
        &self.copy
    }

    pub fn retries(&self) -> usize {
        self.retries.load(Ordering::Acquire)
    }

    pub fn set_retries(&self, retries: usize) {
        self.retries.store(retries, Ordering::Release);
    }

    pub fn concur_passes(&self) -> usize {
        self.concur_passes.load(Ordering::Acquire)
    }

    pub fn set_concur_passes(&self, passes: usize) -> Result<(), Errno> {
        if passes == 0 {
            return Err(Errno::InvalidArgument);
        }
        self.concur_passes.store(passes, Ordering::Release);
        Ok(())
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::Acquire)
    }

    pub fn set_batch_size(&self, batch_size: usize) {
        self.batch_size.store(batch_size, Ordering::Release);
    }

    /// 按模式选择串行或并发路径交换一批页对
    pub fn exchange_page_list(&self, pairs: Vec<ExchangePair>, mode: MigrateMode) -> Result<(), Errno> {
        if mode.concur() {
            self.exchange_pages_concur(pairs, mode)
        } else {
            self.exchange_pages(pairs, mode).into_result()
        }
    }

    /// 隔离两个 LRU 页并同步交换（exchange_two_pages）
    pub fn exchange_two_pages(&self, page1: &Arc<Page>, page2: &Arc<Page>) -> Result<(), Errno> {
        if !(page1.is_lru() && page2.is_lru()) {
            return Err(Errno::DeviceOrResourceBusy);
        }
        self.lru.isolate_page(page1)?;
        self.topology.mod_isolated(page1, page1.nr_pages() as isize);

        if let Err(err) = self.lru.isolate_page(page2) {
            self.putback(page1.clone());
            return Err(err);
        }
        self.topology.mod_isolated(page2, page2.nr_pages() as isize);

        let pair = ExchangePair::new(page1.clone(), page2.clone());
        self.exchange_pages(vec![pair], MigrateMode::SYNC).into_result()
    }

    /// 放回 LRU 并撤销隔离计数
    pub(crate) fn putback(&self, page: Arc<Page>) {
        self.topology.mod_isolated(&page, -(page.nr_pages() as isize));
        self.lru.putback(page);
    }

    /// 隔离期间已被其他人释放的页：丢掉隔离引用即可
    fn release_freed(&self, page: Arc<Page>) {
        page.clear_flag(PageFlag::Active);
        page.clear_flag(PageFlag::Unevictable);
        self.topology.mod_isolated(&page, -(page.nr_pages() as isize));
        page.put_page();
    }

    /// 任一页已被释放（只剩隔离引用）时处理掉整对，返回 true
    ///
    /// 被释放的页直接丢掉，另一页原样放回 LRU。
    fn release_if_freed(&self, from: &Arc<Page>, to: &Arc<Page>) -> bool {
        if from.refcount() == 1 {
            log::debug!("exchange: page {:#x} was freed under us", from.pfn());
            self.release_freed(from.clone());
            if to.refcount() == 1 {
                self.release_freed(to.clone());
            } else {
                self.putback(to.clone());
            }
            return true;
        }
        if to.refcount() == 1 {
            log::debug!("exchange: page {:#x} was freed under us", to.pfn());
            self.release_freed(to.clone());
            self.putback(from.clone());
            return true;
        }
        false
    }
}

/// 两页能否交换：同 order，且都不是 hugetlbfs 大页（can_be_exchanged）
pub fn can_be_exchanged(from: &Page, to: &Page) -> bool {
    from.is_compound() == to.is_compound()
        && !from.is_huge()
        && !to.is_huge()
        && from.order() == to.order()
}
