//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! LRU 链表与页隔离
//!
//! 每个节点每个 memcg 一组 LRU 链表（lruvec），同一节点的全部 lruvec
//! 由节点的 lru_lock 保护。链表头是最新加入的页，隔离从链表尾扫描。
//!
//! 引用约定：
//! - 链表本身不持有页引用
//! - 隔离成功的页多持有一个引用，`putback` 时释放
//! - `isolate` / `isolate_list` 会同时增加 NR_ISOLATED_*，
//!   `isolate_page` 和 `putback` 不改隔离计数，由调用者负责

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use spin::Mutex;

use crate::config::HPAGE_PMD_NR;
use crate::errno::Errno;
use crate::mm::memcg::MemCgroup;
use crate::mm::numa::{NodeId, NodeStatItem, NumaTopology};
use crate::mm::page_desc::{Page, PageFlag};

/// LRU 链表种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum LruList {
    InactiveAnon = 0,
    ActiveAnon = 1,
    InactiveFile = 2,
    ActiveFile = 3,
    Unevictable = 4,
}

const NR_LRU_LISTS: usize = 5;

impl LruList {
    /// 可回收的链表（for_each_evictable_lru）
    pub const EVICTABLE: [LruList; 4] = [
        LruList::InactiveAnon,
        LruList::ActiveAnon,
        LruList::InactiveFile,
        LruList::ActiveFile,
    ];

    #[inline]
    pub fn is_active(self) -> bool {
        matches!(self, LruList::ActiveAnon | LruList::ActiveFile)
    }

    #[inline]
    pub fn is_file(self) -> bool {
        matches!(self, LruList::InactiveFile | LruList::ActiveFile)
    }

    /// 页应该进入的链表（page_lru）
    pub fn of_page(page: &Page) -> Self {
        if page.is_unevictable() {
            return LruList::Unevictable;
        }
        match (page.is_file_cache(), page.is_active()) {
            (false, false) => LruList::InactiveAnon,
            (false, true) => LruList::ActiveAnon,
            (true, false) => LruList::InactiveFile,
            (true, true) => LruList::ActiveFile,
        }
    }
}

/// 隔离哪些页
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolateAction {
    /// 只扫描非活跃链表
    ColdPages,
    /// 只扫描活跃链表
    HotPages,
    /// 全部扫描
    HotAndColdPages,
}

/// 一次隔离的结果
#[derive(Debug, Default)]
pub struct IsolatedPages {
    /// 基本页
    pub base: Vec<Arc<Page>>,
    /// 复合页（PMD 大页在前，其他 order 的复合页在后）
    pub huge: Vec<Arc<Page>>,
    /// base 中的基本页数
    pub nr_base: usize,
    /// huge 中的基本页数
    pub nr_huge: usize,
}

impl IsolatedPages {
    /// 隔离的基本页总数
    #[inline]
    pub fn nr_taken(&self) -> usize {
        self.nr_base + self.nr_huge
    }
}

/// 页隔离协作者
pub trait LruIsolation: Send + Sync {
    /// 从节点的 LRU 链表批量隔离页（isolate_pages_from_lru_list）
    ///
    /// `nr_to_scan` 为 None 时扫描 memcg 在该节点上的全部页。
    fn isolate(
        &self,
        nid: NodeId,
        memcg: &MemCgroup,
        nr_to_scan: Option<usize>,
        action: IsolateAction,
    ) -> IsolatedPages;

    /// 从一条链表隔离至多 `nr_to_scan` 个页
    fn isolate_list(
        &self,
        nid: NodeId,
        memcg: &MemCgroup,
        lru: LruList,
        nr_to_scan: usize,
    ) -> Vec<Arc<Page>>;

    /// 隔离单个页（isolate_lru_page）
    fn isolate_page(&self, page: &Arc<Page>) -> Result<(), Errno>;

    /// 把隔离的页放回 LRU 并释放隔离引用（putback_lru_page）
    fn putback(&self, page: Arc<Page>);

    /// memcg 在节点上的页数（memcg_size_node）
    fn nr_pages(&self, nid: NodeId, memcg: &MemCgroup) -> usize;

    /// memcg 在节点上活跃链表的页数
    fn nr_active(&self, nid: NodeId, memcg: &MemCgroup) -> usize;

    /// 单条链表的页数（lruvec_size_memcg_node）
    fn lru_size(&self, nid: NodeId, memcg: &MemCgroup, lru: LruList) -> usize;
}

#[derive(Debug, Default)]
struct LruVec {
    lists: [VecDeque<Arc<Page>>; NR_LRU_LISTS],
}

impl LruVec {
    fn size(&self, lru: LruList) -> usize {
        self.lists[lru as usize].iter().map(|p| p.nr_pages()).sum()
    }
}

/// 按节点组织的 LRU
#[derive(Debug)]
pub struct NodeLru {
    topology: Arc<NumaTopology>,
    /// 每节点一把 lru_lock，memcg id → lruvec
    nodes: Vec<Mutex<BTreeMap<u64, LruVec>>>,
}

fn memcg_id(page: &Page) -> u64 {
    page.mem_cgroup().map_or(0, |memcg| memcg.id())
}

impl NodeLru {
    pub fn new(topology: Arc<NumaTopology>) -> Self {
        let nodes = (0..topology.nr_nodes())
            .map(|_| Mutex::new(BTreeMap::new()))
            .collect();
        Self { topology, nodes }
    }

    fn node(&self, nid: NodeId) -> &Mutex<BTreeMap<u64, LruVec>> {
        assert!(nid < self.nodes.len(), "lru: node {} is offline", nid);
        &self.nodes[nid]
    }

    /// 把新页加入 LRU（lru_cache_add），不改变引用计数
    pub fn add(&self, page: &Arc<Page>) {
        assert!(!page.is_lru(), "lru: page {:#x} already on lru", page.pfn());
        let mut lruvecs = self.node(page.nid()).lock();
        let lruvec = lruvecs.entry(memcg_id(page)).or_default();
        page.set_flag(PageFlag::Lru);
        lruvec.lists[LruList::of_page(page) as usize].push_front(page.clone());
    }

    /// 页当前是否在某条链表上
    pub fn contains(&self, page: &Page) -> bool {
        let lruvecs = self.node(page.nid()).lock();
        lruvecs.values().any(|lruvec| {
            lruvec
                .lists
                .iter()
                .any(|list| list.iter().any(|p| core::ptr::eq(Arc::as_ptr(p), page)))
        })
    }

    /// 从一条链表的尾部扫描隔离（isolate_lru_pages）
    ///
    /// 正在被释放的页（引用为 0）留在链表上。返回隔离的基本页数。
    fn isolate_lru_pages(
        list: &mut VecDeque<Arc<Page>>,
        nr_to_scan: usize,
        out: &mut IsolatedPages,
    ) -> usize {
        let mut busy = Vec::new();
        let mut odd = Vec::new();
        let mut scan = 0;
        let mut nr_taken = 0;

        while scan < nr_to_scan && nr_taken < nr_to_scan {
            let Some(page) = list.pop_back() else {
                break;
            };
            assert!(page.is_lru(), "lru: page {:#x} on list without PG_lru", page.pfn());
            scan += 1;

            if !page.try_get_page() {
                busy.push(page);
                continue;
            }
            page.clear_flag(PageFlag::Lru);

            let nr_pages = page.nr_pages();
            nr_taken += nr_pages;
            if nr_pages == 1 {
                out.nr_base += nr_pages;
                out.base.push(page);
            } else if nr_pages == HPAGE_PMD_NR {
                out.nr_huge += nr_pages;
                out.huge.push(page);
            } else {
                out.nr_huge += nr_pages;
                odd.push(page);
            }
        }

        for page in busy.into_iter().rev() {
            list.push_back(page);
        }
        out.huge.extend(odd);
        nr_taken
    }
}

impl LruIsolation for NodeLru {
    fn isolate(
        &self,
        nid: NodeId,
        memcg: &MemCgroup,
        nr_to_scan: Option<usize>,
        action: IsolateAction,
    ) -> IsolatedPages {
        let nr_pages = nr_to_scan.unwrap_or_else(|| self.nr_pages(nid, memcg));
        let mut out = IsolatedPages::default();
        let mut nr_all_taken = 0;

        log::debug!("lru: isolate {} pages directly from lru lists of node {}", nr_pages, nid);

        for lru in LruList::EVICTABLE {
            if action == IsolateAction::ColdPages && lru.is_active() {
                continue;
            }
            if action == IsolateAction::HotPages && !lru.is_active() {
                continue;
            }
            if nr_all_taken >= nr_pages {
                break;
            }

            let nr_taken = {
                let mut lruvecs = self.node(nid).lock();
                let Some(lruvec) = lruvecs.get_mut(&memcg.id()) else {
                    break;
                };
                Self::isolate_lru_pages(
                    &mut lruvec.lists[lru as usize],
                    nr_pages - nr_all_taken,
                    &mut out,
                )
            };

            let item = if lru.is_file() {
                NodeStatItem::IsolatedFile
            } else {
                NodeStatItem::IsolatedAnon
            };
            self.topology.mod_node_state(nid, item, nr_taken as isize);
            nr_all_taken += nr_taken;
        }
        out
    }

    fn isolate_list(
        &self,
        nid: NodeId,
        memcg: &MemCgroup,
        lru: LruList,
        nr_to_scan: usize,
    ) -> Vec<Arc<Page>> {
        let mut out = IsolatedPages::default();
        let nr_taken = {
            let mut lruvecs = self.node(nid).lock();
            match lruvecs.get_mut(&memcg.id()) {
                Some(lruvec) => {
                    Self::isolate_lru_pages(&mut lruvec.lists[lru as usize], nr_to_scan, &mut out)
                }
                None => 0,
            }
        };
        let item = if lru.is_file() {
            NodeStatItem::IsolatedFile
        } else {
            NodeStatItem::IsolatedAnon
        };
        self.topology.mod_node_state(nid, item, nr_taken as isize);

        let mut pages = out.base;
        pages.extend(out.huge);
        pages
    }

    fn isolate_page(&self, page: &Arc<Page>) -> Result<(), Errno> {
        let mut lruvecs = self.node(page.nid()).lock();
        if !page.is_lru() {
            return Err(Errno::DeviceOrResourceBusy);
        }
        let lruvec = lruvecs
            .get_mut(&memcg_id(page))
            .ok_or(Errno::DeviceOrResourceBusy)?;
        let list = &mut lruvec.lists[LruList::of_page(page) as usize];
        let pos = list
            .iter()
            .position(|p| Arc::ptr_eq(p, page))
            .ok_or(Errno::DeviceOrResourceBusy)?;
        if !page.try_get_page() {
            return Err(Errno::DeviceOrResourceBusy);
        }
        list.remove(pos);
        page.clear_flag(PageFlag::Lru);
        Ok(())
    }

    fn putback(&self, page: Arc<Page>) {
        self.add(&page);
        page.put_page();
    }

    fn nr_pages(&self, nid: NodeId, memcg: &MemCgroup) -> usize {
        let lruvecs = self.node(nid).lock();
        lruvecs.get(&memcg.id()).map_or(0, |lruvec| {
            (0..NR_LRU_LISTS)
                .map(|i| lruvec.lists[i].iter().map(|p| p.nr_pages()).sum::<usize>())
                .sum()
        })
    }

    fn nr_active(&self, nid: NodeId, memcg: &MemCgroup) -> usize {
        let lruvecs = self.node(nid).lock();
        lruvecs.get(&memcg.id()).map_or(0, |lruvec| {
            lruvec.size(LruList::ActiveAnon) + lruvec.size(LruList::ActiveFile)
        })
    }

    fn lru_size(&self, nid: NodeId, memcg: &MemCgroup, lru: LruList) -> usize {
        let lruvecs = self.node(nid).lock();
        lruvecs.get(&memcg.id()).map_or(0, |lruvec| lruvec.size(lru))
    }
}
