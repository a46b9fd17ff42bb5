//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 场景测试模块
//!
//! 用真实的内存内协作者（NodeLru、RmapRegistry、MemMap）搭建两节点
//! 环境，从隔离一直跑到放回 LRU，检查页表项、引用计数和节点统计。
//!
//! 运行测试：
//! ```bash
//! cargo test --package mm-exchange
//! ```

mod file_backed;
mod syscalls;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::config::ExchangeConfig;
use crate::errno::Errno;
use crate::mm::dma::SoftwareDma;
use crate::mm::exchange::{ExchangePair, PageExchanger};
use crate::mm::lru::{LruIsolation, NodeLru};
use crate::mm::memcg::MemCgroup;
use crate::mm::migrate::{MigrateMode, PageMigrator};
use crate::mm::numa::{NodeId, NodeStatItem, NumaTopology};
use crate::mm::page_desc::{MemMap, Page, PageFlag};
use crate::mm::rmap::{AnonVma, Mm, Referenced, Rmap, RmapRegistry, Vma};

/// 测试 VMA 的起始地址（2MB 对齐）
pub const BASE: usize = 0x1000_0000;

/// 测试 VMA 的长度
pub const VMA_SIZE: usize = 0x1000_0000;

/// PMD 大页大小
pub const HPAGE_SIZE: usize = 2 << 20;

/// 两节点测试环境
pub struct Fixture {
    pub topology: Arc<NumaTopology>,
    pub mem_map: MemMap,
    pub lru: Arc<NodeLru>,
    pub rmap: Arc<RmapRegistry>,
    pub memcg: Arc<MemCgroup>,
    pub anon_vma: Arc<AnonVma>,
    pub mm: Arc<Mm>,
    pub exchanger: Arc<PageExchanger>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(&ExchangeConfig::default())
    }

    pub fn with_config(config: &ExchangeConfig) -> Self {
        let topology = Arc::new(NumaTopology::new(vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]]));
        let rmap = Arc::new(RmapRegistry::new());
        Self::with_rmap(topology, rmap.clone(), rmap, config)
    }

    /// 交换器使用指定的反向映射实现，页表仍登记在 `registry` 中
    pub fn with_rmap(
        topology: Arc<NumaTopology>,
        registry: Arc<RmapRegistry>,
        rmap: Arc<dyn Rmap>,
        config: &ExchangeConfig,
    ) -> Self {
        let lru = Arc::new(NodeLru::new(topology.clone()));
        let memcg = MemCgroup::new(1, "job");
        let anon_vma = AnonVma::new(1);
        let mm = Mm::new(1, Some(memcg.clone()));
        registry.register(&mm);
        mm.add_vma(Vma::new_anon(BASE, BASE + VMA_SIZE, anon_vma.clone()))
            .unwrap();

        let exchanger = Arc::new(PageExchanger::with_config(
            topology.clone(),
            rmap,
            lru.clone(),
            SoftwareDma::new(2),
            config,
        ));
        Self {
            topology,
            mem_map: MemMap::new(0x1000),
            lru,
            rmap: registry,
            memcg,
            anon_vma,
            mm,
            exchanger,
        }
    }

    /// 在 `addr` 映射一个新的匿名页并加入 LRU
    ///
    /// 返回时页只剩映射持有的一个引用。
    pub fn map_anon(&self, addr: usize, nid: NodeId, order: u32, fill: u8, active: bool) -> Arc<Page> {
        let page = self.mem_map.alloc_page(nid, order);
        page.set_mem_cgroup(Some(self.memcg.clone()));
        page.fill(fill);
        self.mm.map_page(addr, &page).unwrap();
        page.put_page();
        if active {
            page.set_flag(PageFlag::Active);
        }
        self.lru.add(&page);
        page
    }

    /// 从 LRU 隔离一页并计入 NR_ISOLATED
    pub fn isolate(&self, page: &Arc<Page>) {
        self.lru.isolate_page(page).unwrap();
        self.topology.mod_isolated(page, page.nr_pages() as isize);
    }

    /// 隔离两页并组成一对
    pub fn isolated_pair(&self, from: &Arc<Page>, to: &Arc<Page>) -> ExchangePair {
        self.isolate(from);
        self.isolate(to);
        ExchangePair::new(from.clone(), to.clone())
    }

    /// 全部节点的隔离页数
    pub fn nr_isolated(&self) -> isize {
        (0..self.topology.nr_nodes())
            .map(|nid| {
                self.topology.node_page_state(nid, NodeStatItem::IsolatedAnon)
                    + self.topology.node_page_state(nid, NodeStatItem::IsolatedFile)
            })
            .sum()
    }
}

/// 页内容是否全为 `byte`
pub fn filled_with(page: &Page, byte: u8) -> bool {
    page.read_all().iter().all(|&b| b == byte)
}

/// 声称拆除了映射、实际什么都不做的反向映射
///
/// 页始终保持映射状态，每次交换都以 EAGAIN 失败。
pub struct StuckRmap {
    inner: Arc<RmapRegistry>,
    pub unmap_calls: AtomicUsize,
}

impl StuckRmap {
    pub fn new(inner: Arc<RmapRegistry>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            unmap_calls: AtomicUsize::new(0),
        })
    }

    pub fn unmap_calls(&self) -> usize {
        self.unmap_calls.load(Ordering::Acquire)
    }
}

impl Rmap for StuckRmap {
    fn unmap_for_migration(&self, _page: &Page) -> bool {
        self.unmap_calls.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn remap_after_migration(&self, old: &Page, new: &Arc<Page>) {
        self.inner.remap_after_migration(old, new);
    }

    fn page_referenced(&self, page: &Page) -> Referenced {
        self.inner.page_referenced(page)
    }
}

/// 一次迁移请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrateCall {
    pub nr_pages: usize,
    pub target: NodeId,
    pub mode: MigrateMode,
}

/// 记录请求的迁移器
///
/// `accept` 为 true 时把页当作已迁移：撤销隔离并放回 LRU；否则全部
/// 留给调用者。
pub struct RecordingMigrator {
    topology: Arc<NumaTopology>,
    lru: Arc<NodeLru>,
    accept: bool,
    pub calls: Mutex<Vec<MigrateCall>>,
}

impl RecordingMigrator {
    pub fn new(fx: &Fixture, accept: bool) -> Arc<Self> {
        Arc::new(Self {
            topology: fx.topology.clone(),
            lru: fx.lru.clone(),
            accept,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<MigrateCall> {
        self.calls.lock().clone()
    }
}

impl PageMigrator for RecordingMigrator {
    fn migrate_pages(&self, pages: &mut Vec<Arc<Page>>, target: NodeId, mode: MigrateMode) -> Result<usize, Errno> {
        self.calls.lock().push(MigrateCall {
            nr_pages: pages.len(),
            target,
            mode,
        });
        if !self.accept {
            return Ok(pages.len());
        }
        for page in pages.drain(..) {
            self.topology.mod_isolated(&page, -(page.nr_pages() as isize));
            self.lru.putback(page);
        }
        Ok(0)
    }
}
