//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 节点间平衡 (mm_manage)
//!
//! 在一个慢节点（from）和一个快节点（to）之间按 memcg 的节点预算移动
//! 页：从 from 节点隔离热页，to 节点放不下时先从 to 节点隔离冷页腾出
//! 空间。指定交换语义时，同 order 的 (from, to) 页配对后原地交换，
//! 配不上对的页和剩余的页走单向迁移。
//!
//! ```text
//! 隔离 from 热页 ──┐
//!                  ├─ to 预算不足 ─→ 隔离 to 冷页 ─→ 配对交换 / 迁回 from
//!                  └─→ 放回溢出部分 ─→ 迁移到 to
//! ```

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use bitflags::bitflags;

use crate::errno::Errno;
use crate::mm::exchange::{ExchangePair, PageExchanger};
use crate::mm::lru::{IsolateAction, LruList};
use crate::mm::memcg::{MemCgroup, NodeBudget};
use crate::mm::migrate::{MigrateFlags, MigrateMode, PageMigrator};
use crate::mm::numa::NodeId;
use crate::mm::page_desc::{Page, PageFlag};

bitflags! {
    /// mm_manage / exchange_pages 的标志（MPOL_MF_*）
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ManageFlags: u32 {
        /// 移动页
        const MOVE = 1 << 1;
        /// 移动全部页（冷热都要）
        const MOVE_ALL = 1 << 2;
        /// DMA 拷贝
        const MOVE_DMA = 1 << 5;
        /// 多线程拷贝
        const MOVE_MT = 1 << 6;
        /// 并发批量处理
        const MOVE_CONCUR = 1 << 7;
        /// 交换语义
        const EXCHANGE = 1 << 8;
        /// 先整理活跃/非活跃链表
        const SHRINK_LISTS = 1 << 9;
    }
}

impl ManageFlags {
    /// 对应的迁移模式，同步级别固定为 MIGRATE_SYNC
    pub fn migrate_mode(self) -> MigrateMode {
        let mut flags = MigrateFlags::empty();
        flags.set(MigrateFlags::MT, self.contains(Self::MOVE_MT));
        flags.set(MigrateFlags::DMA, self.contains(Self::MOVE_DMA));
        flags.set(MigrateFlags::CONCUR, self.contains(Self::MOVE_CONCUR));
        MigrateMode::SYNC.with(flags)
    }
}

/// 一个方向上的迁移统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationStats {
    pub nr_migrations: usize,
    pub nr_base_pages: usize,
    pub nr_huge_pages: usize,
}

/// 每个进程累计的 mm_manage 统计（page_migration_stats）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManageStats {
    pub nr_exchanges: usize,
    pub nr_exchange_base_pages: usize,
    pub nr_exchange_huge_pages: usize,
    /// 慢节点 → 快节点
    pub s2f: MigrationStats,
    /// 快节点 → 慢节点
    pub f2s: MigrationStats,
}

/// 一次隔离得到的两组页及其基本页数
struct IsolatedLists {
    base: VecDeque<Arc<Page>>,
    huge: VecDeque<Arc<Page>>,
    nr_base: usize,
    nr_huge: usize,
}

fn nr_pages_of(pages: &VecDeque<Arc<Page>>) -> usize {
    pages.iter().map(|page| page.nr_pages()).sum()
}

/// 节点平衡器
pub struct NodeBalancer {
    exchanger: Arc<PageExchanger>,
    migrator: Arc<dyn PageMigrator>,
}

impl NodeBalancer {
    pub fn new(exchanger: Arc<PageExchanger>, migrator: Arc<dyn PageMigrator>) -> Self {
        Self { exchanger, migrator }
    }

    #[inline]
    pub fn exchanger(&self) -> &Arc<PageExchanger> {
        &self.exchanger
    }

    /// 先整理链表（可选），再在两个节点之间平衡
    pub fn mm_manage(
        &self,
        memcg: &MemCgroup,
        from_nid: NodeId,
        to_nid: NodeId,
        nr_pages: usize,
        flags: ManageFlags,
        stats: &mut ManageStats,
    ) -> Result<(), Errno> {
        let topology = self.exchanger.topology();
        if !topology.node_online(from_nid) || !topology.node_online(to_nid) {
            return Err(Errno::InvalidArgument);
        }
        if flags.contains(ManageFlags::SHRINK_LISTS) {
            self.shrink_lists(memcg, from_nid, to_nid);
        }
        if flags.contains(ManageFlags::MOVE) {
            self.do_mm_manage(memcg, from_nid, to_nid, nr_pages, flags, stats)?;
        }
        Ok(())
    }

    fn isolate(&self, nid: NodeId, memcg: &MemCgroup, nr_pages: usize, action: IsolateAction) -> IsolatedLists {
        let isolated = self.exchanger.lru().isolate(nid, memcg, Some(nr_pages), action);
        IsolatedLists {
            nr_base: isolated.nr_base,
            nr_huge: isolated.nr_huge,
            base: isolated.base.into(),
            huge: isolated.huge.into(),
        }
    }

    /// 在两个节点之间移动页（do_mm_manage）
    pub fn do_mm_manage(
        &self,
        memcg: &MemCgroup,
        from_nid: NodeId,
        to_nid: NodeId,
        nr_pages: usize,
        flags: ManageFlags,
        stats: &mut ManageStats,
    ) -> Result<(), Errno> {
        if memcg.is_root() {
            return Ok(());
        }
        let lru = self.exchanger.lru();
        let mode = flags.migrate_mode();
        let move_all = flags.contains(ManageFlags::MOVE_ALL);
        let split_mode = flags.intersects(ManageFlags::MOVE_MT | ManageFlags::MOVE_CONCUR);
        let mut from_action = if move_all {
            IsolateAction::HotAndColdPages
        } else {
            IsolateAction::HotPages
        };

        let to_budget = NodeBudget {
            nid: to_nid,
            nr_pages: lru.nr_pages(to_nid, memcg),
            max_pages: memcg.max_size_node(to_nid),
        };
        let nr_free_to = to_budget.nr_free();
        let nr_active_from = lru.nr_active(from_nid, memcg);
        let nr_pages = nr_pages
            .min(to_budget.max_pages.unwrap_or(usize::MAX))
            .min(lru.nr_pages(from_nid, memcg));

        log::debug!(
            "mm_manage: {} free pages at to node {}, {} active pages at from node {}",
            nr_free_to,
            to_nid,
            nr_active_from,
            from_nid
        );

        // to 节点放得下 from 的全部活跃页时，冷页也一起搬
        if nr_free_to > 0 && (nr_active_from as isize) < nr_free_to {
            from_action = IsolateAction::HotAndColdPages;
        }

        let mut from = self.isolate(from_nid, memcg, nr_pages, from_action);
        let nr_isolated_from = from.nr_base + from.nr_huge;
        log::debug!("mm_manage: {} pages isolated at from node {}", nr_isolated_from, from_nid);

        if to_budget.is_limited() && nr_free_to < nr_isolated_from as isize {
            let to_action = if move_all {
                IsolateAction::HotAndColdPages
            } else {
                IsolateAction::ColdPages
            };
            let nr_to_evict = (nr_isolated_from as isize - nr_free_to) as usize;
            let mut to = self.isolate(to_nid, memcg, nr_to_evict, to_action);
            log::debug!(
                "mm_manage: {} pages isolated at to node {}",
                to.nr_base + to.nr_huge,
                to_nid
            );

            if flags.contains(ManageFlags::EXCHANGE) {
                let nr_exchanged = self.exchange_pages_between_nodes(
                    &mut from.base,
                    &mut to.base,
                    mode,
                );
                to.nr_base -= nr_exchanged;
                stats.nr_exchange_base_pages += nr_exchanged;

                let nr_exchanged = self.exchange_pages_between_nodes(
                    &mut from.huge,
                    &mut to.huge,
                    mode,
                );
                to.nr_huge -= nr_exchanged;
                stats.nr_exchange_huge_pages += nr_exchanged;
                stats.nr_exchanges += 1;
            }

            // 剩下的 to 页单向迁回 from 节点
            let base_mode = if split_mode {
                mode.without(MigrateFlags::MT)
            } else {
                mode
            };
            to.nr_base -= self.migrate_to_node(mem::take(&mut to.base), from_nid, base_mode);
            to.nr_huge -= self.migrate_to_node(mem::take(&mut to.huge), from_nid, mode);
            stats.f2s.nr_migrations += 1;
            stats.f2s.nr_base_pages += to.nr_base;
            stats.f2s.nr_huge_pages += to.nr_huge;

            self.putback_overflow_pages(
                to.nr_base,
                to.nr_huge,
                nr_free_to,
                &mut from,
            );
        }

        if log::log_enabled!(log::Level::Debug) {
            log::debug!(
                "mm_manage: {} pages to be migrated to node {}",
                nr_pages_of(&from.base) + nr_pages_of(&from.huge),
                to_nid
            );
        }
        if nr_free_to < 0 && !(from.base.is_empty() && from.huge.is_empty()) {
            log::info!("mm_manage: {} free pages at to node {}", nr_free_to, to_nid);
        }

        let base_mode = if split_mode {
            mode.without(MigrateFlags::MT)
        } else {
            mode
        };
        from.nr_base -= self.migrate_to_node(mem::take(&mut from.base), to_nid, base_mode);
        from.nr_huge -= self.migrate_to_node(mem::take(&mut from.huge), to_nid, mode);
        stats.s2f.nr_migrations += 1;
        stats.s2f.nr_base_pages += from.nr_base;
        stats.s2f.nr_huge_pages += from.nr_huge;
        Ok(())
    }

    /// 从两组隔离页的头部配对，至多 `limit` 对（add_pages_to_exchange_list）
    ///
    /// order 不同的页和属于页缓存的 from 页放到一边，配对结束后按原顺序
    /// 放回各自列表的头部。to 页可以属于页缓存。
    fn add_pages_to_exchange_list(
        from: &mut VecDeque<Arc<Page>>,
        to: &mut VecDeque<Arc<Page>>,
        limit: usize,
    ) -> Vec<ExchangePair> {
        let mut pairs = Vec::new();
        let mut odd_from = Vec::new();
        let mut odd_to = Vec::new();

        while pairs.len() < limit {
            let (Some(from_page), Some(to_page)) = (from.front(), to.front()) else {
                break;
            };
            if from_page.nr_pages() != to_page.nr_pages() {
                log::info!(
                    "mm_manage: from: {}, to: {}",
                    from_page.nr_pages(),
                    to_page.nr_pages()
                );
                odd_from.extend(from.pop_front());
                odd_to.extend(to.pop_front());
                continue;
            }
            if from_page.page_mapping().is_some() {
                odd_from.extend(from.pop_front());
                continue;
            }
            if let (Some(from_page), Some(to_page)) = (from.pop_front(), to.pop_front()) {
                pairs.push(ExchangePair::new(from_page, to_page));
            }
        }

        for page in odd_from.into_iter().rev() {
            from.push_front(page);
        }
        for page in odd_to.into_iter().rev() {
            to.push_front(page);
        }
        pairs
    }

    /// 分批配对交换，返回已配对的基本页数（exchange_pages_between_nodes）
    ///
    /// 已配对的页无论交换成败都已放回 LRU，不再留在列表中。
    fn exchange_pages_between_nodes(
        &self,
        from: &mut VecDeque<Arc<Page>>,
        to: &mut VecDeque<Arc<Page>>,
        mode: MigrateMode,
    ) -> usize {
        let max_pairs = from.len().min(to.len());
        let batch_size = match self.exchanger.batch_size() {
            n if n > 0 && mode.concur() => n,
            _ => max_pairs,
        };
        let mut nr_exchanged = 0;
        let mut nr_added = 0;

        while !from.is_empty() && !to.is_empty() {
            let pairs = Self::add_pages_to_exchange_list(from, to, batch_size);
            // 两边只剩页缓存页或 order 对不上
            if pairs.is_empty() {
                break;
            }
            nr_added += pairs.len();
            assert!(nr_added <= max_pairs, "mm_manage: paired more than isolated");
            nr_exchanged += pairs.iter().map(|pair| pair.to().nr_pages()).sum::<usize>();

            if let Err(err) = self.exchanger.exchange_page_list(pairs, mode) {
                log::debug!("mm_manage: exchange batch failed: {}", err);
            }
        }
        nr_exchanged
    }

    /// 单向迁移一组页，返回失败的基本页数（migrate_to_node）
    ///
    /// 并发模式按 batch_size 分批，否则一次提交全部。失败的页放回 LRU。
    fn migrate_to_node(&self, mut pages: VecDeque<Arc<Page>>, nid: NodeId, mode: MigrateMode) -> usize {
        let batch_size = self.exchanger.batch_size();
        let unlimited = batch_size == 0 || !mode.concur();
        let mut nr_failed = 0;
        let mut from_nid = None;

        while !pages.is_empty() {
            let n = if unlimited {
                pages.len()
            } else {
                batch_size.min(pages.len())
            };
            let mut batch: Vec<Arc<Page>> = pages.drain(..n).collect();
            from_nid = batch.first().map(|page| page.nid());

            let rc = self.migrator.migrate_pages(&mut batch, nid, mode);
            if let Err(err) = rc {
                log::debug!("mm_manage: migrate batch to node {} failed: {}", nid, err);
            }
            for page in batch {
                nr_failed += page.nr_pages();
                self.exchanger.putback(page);
            }
        }
        log::debug!(
            "mm_manage: {} pages failed to migrate from {:?} to {}",
            nr_failed,
            from_nid,
            nid
        );
        nr_failed
    }

    /// 保留列表头部总量不超过 `max_pages` 的页，其余放回 LRU
    ///
    /// 返回剩余额度；`nr_remaining` 更新为保留的基本页数。
    fn putback_list_overflow(&self, mut max_pages: usize, pages: &mut VecDeque<Arc<Page>>, nr_remaining: &mut usize) -> usize {
        let Some(first) = pages.front() else {
            return max_pages;
        };
        *nr_remaining = 0;

        let mut keep = 0;
        if max_pages <= 2 * first.nr_pages() {
            max_pages = 0;
        } else {
            for page in pages.iter() {
                let nr = page.nr_pages();
                // 多留一页余量，避免用光空闲空间
                if max_pages <= 2 * nr {
                    max_pages = 0;
                    break;
                }
                max_pages -= nr;
                *nr_remaining += nr;
                keep += 1;
            }
        }

        for page in pages.split_off(keep) {
            self.exchanger.putback(page);
        }
        max_pages
    }

    /// 放回 to 节点容纳不下的 from 页（putback_overflow_pages）
    ///
    /// 额度 = to 节点空闲页数 + 已迁出 to 节点的页数。空闲为负时先用
    /// 迁出的基本页、再用迁出的大页抵扣欠额；剩余额度基本页和大页各占
    /// 一半，基本页用不完的部分留给大页。
    fn putback_overflow_pages(&self, moved_base: usize, moved_huge: usize, nr_free: isize, from: &mut IsolatedLists) {
        let mut max_base = moved_base;
        let mut max_huge = moved_huge;
        let free_half = if nr_free > 0 { nr_free as usize / 2 } else { 0 };

        if nr_free < 0 {
            let mut deficit = nr_free.unsigned_abs();
            let paid = deficit.min(max_base);
            max_base -= paid;
            deficit -= paid;
            max_huge -= deficit.min(max_huge);
        }

        let left = self.putback_list_overflow(free_half.saturating_add(max_base), &mut from.base, &mut from.nr_base);
        self.putback_list_overflow(
            free_half.saturating_add(max_huge).saturating_add(left),
            &mut from.huge,
            &mut from.nr_huge,
        );
    }

    /// 整理两个节点的链表（shrink_lists）
    ///
    /// 每条可回收链表扫描一半：活跃链表里没被访问的页降级，非活跃链表
    /// 里被访问两次以上的页升级。
    pub fn shrink_lists(&self, memcg: &MemCgroup, from_nid: NodeId, to_nid: NodeId) {
        if memcg.is_root() {
            return;
        }
        self.shrink_node(memcg, from_nid);
        self.shrink_node(memcg, to_nid);
    }

    fn shrink_node(&self, memcg: &MemCgroup, nid: NodeId) {
        let lru = self.exchanger.lru();
        for list in LruList::EVICTABLE {
            let nr_to_scan = lru.lru_size(nid, memcg, list) / 2;
            if nr_to_scan == 0 {
                continue;
            }
            let (nr_active, nr_inactive) = if list.is_active() {
                self.shrink_active_list(memcg, nid, list, nr_to_scan)
            } else {
                self.shrink_inactive_list(memcg, nid, list, nr_to_scan)
            };
            log::debug!(
                "mm_manage: node {} {:?}: {} active, {} inactive",
                nid,
                list,
                nr_active,
                nr_inactive
            );
        }
    }

    fn shrink_active_list(&self, memcg: &MemCgroup, nid: NodeId, list: LruList, nr_to_scan: usize) -> (usize, usize) {
        let pages = self.exchanger.lru().isolate_list(nid, memcg, list, nr_to_scan);
        let rmap = self.exchanger.rmap();
        let (mut nr_active, mut nr_inactive) = (0, 0);

        for page in pages {
            if page.is_unevictable() {
                self.exchanger.putback(page);
                continue;
            }
            let referenced = rmap.page_referenced(&page);
            // 被访问过的可执行文件页再留一轮
            if referenced.ptes > 0 && referenced.exec && page.is_file_cache() {
                nr_active += page.nr_pages();
            } else {
                page.clear_flag(PageFlag::Active);
                nr_inactive += page.nr_pages();
            }
            self.exchanger.putback(page);
        }
        (nr_active, nr_inactive)
    }

    fn shrink_inactive_list(&self, memcg: &MemCgroup, nid: NodeId, list: LruList, nr_to_scan: usize) -> (usize, usize) {
        let pages = self.exchanger.lru().isolate_list(nid, memcg, list, nr_to_scan);
        let rmap = self.exchanger.rmap();
        let (mut nr_active, mut nr_inactive) = (0, 0);

        for page in pages {
            let referenced = rmap.page_referenced(&page);
            let referenced_page = page.test_and_clear_flag(PageFlag::Referenced);

            if referenced.ptes > 0 {
                page.set_flag(PageFlag::Referenced);
                if referenced_page || referenced.ptes > 1 || referenced.exec {
                    page.set_flag(PageFlag::Active);
                }
            }
            if page.is_active() {
                nr_active += page.nr_pages();
            } else {
                nr_inactive += page.nr_pages();
            }
            self.exchanger.putback(page);
        }
        (nr_active, nr_inactive)
    }
}
