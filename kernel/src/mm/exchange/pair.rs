//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 单对页交换
//!
//! 加锁顺序固定为先 from 后 to，解锁顺序相反。页锁和 anon_vma 引用
//! 都存放在 [`ExchangePair`] 中，任何失败路径都经 `ExchangePair::unlock`
//! 释放。

use std::slice;
use std::sync::Arc;

use super::{can_be_exchanged, exchange_page_flags, rebind, ExchangePair, ExchangeStats, ExtraRefs};
use super::{CountSnapshot, PageExchanger};
use crate::errno::Errno;
use crate::mm::copy_page::{copy_page_single, CopyMode};
use crate::mm::filemap::{try_to_free_buffers, MigrateOp};
use crate::mm::migrate::MigrateMode;
use crate::mm::page_desc::{dump_page, Page, PageFlag, PageLock};
use crate::mm::rmap::page_get_anon_vma;

/// 加锁与回写的等待策略
#[derive(Debug, Clone, Copy)]
pub(super) struct UnmapPolicy {
    /// trylock 失败后是否阻塞加锁（异步模式下总是不阻塞）
    pub force_lock: bool,
    /// 遇到回写中的页是否等待
    pub wait_writeback: bool,
}

fn lock_page(page: &Arc<Page>, may_block: bool) -> Result<PageLock, Errno> {
    match page.trylock() {
        Some(guard) => Ok(guard),
        None if may_block => Ok(page.lock()),
        None => Err(Errno::TryAgain),
    }
}

/// 计数与快照一致；有等待者时允许多出临时引用
fn counts_match(count: i32, mapcount: i32, now: &Page) -> bool {
    let count_ok = if now.test_flag(PageFlag::Waiters) {
        count < now.refcount()
    } else {
        count == now.refcount()
    };
    count_ok && mapcount == now.mapcount()
}

impl PageExchanger {
    /// 拆除一页的页表项，返回是否确实拆除过
    ///
    /// 没有归属却挂着私有数据的孤儿页只尝试释放私有数据，本轮放弃。
    fn unmap_one(&self, page: &Page) -> Result<bool, Errno> {
        if page.mapping().is_none() {
            if page.has_private() {
                try_to_free_buffers(page);
                return Err(Errno::TryAgain);
            }
            return Ok(false);
        }
        if page.is_mapped() {
            self.rmap.unmap_for_migration(page);
            return Ok(true);
        }
        Ok(false)
    }

    /// 加锁两页并拆除它们的页表项
    ///
    /// 成功时 pair 持有两把页锁和 anon_vma 引用；失败时已拆除的页表项
    /// 恢复原样，锁全部释放。
    pub(super) fn lock_and_unmap(
        &self,
        pair: &mut ExchangePair,
        mode: MigrateMode,
        policy: UnmapPolicy,
    ) -> Result<(), Errno> {
        let from = pair.from.clone();
        let to = pair.to.clone();
        let may_block = policy.force_lock && !mode.is_async();

        pair.from_lock = Some(lock_page(&from, may_block)?);
        match lock_page(&to, may_block) {
            Ok(guard) => pair.to_lock = Some(guard),
            Err(err) => {
                pair.unlock();
                return Err(err);
            }
        }

        for page in [&from, &to] {
            if page.is_writeback() {
                if !policy.wait_writeback {
                    pair.unlock();
                    return Err(Errno::DeviceOrResourceBusy);
                }
                page.wait_on_writeback();
            }
        }

        // 拆除页表项后 mapcount 归零，anon_vma 引用保证恢复映射前它不被释放
        pair.from_anon_vma = page_get_anon_vma(&from);
        pair.to_anon_vma = page_get_anon_vma(&to);
        pair.from_index = from.index();
        pair.to_index = to.index();
        pair.before = CountSnapshot::take(&from, &to);
        pair.from_was_mapped = false;
        pair.to_was_mapped = false;

        match self.unmap_one(&from) {
            Ok(was_mapped) => pair.from_was_mapped = was_mapped,
            Err(err) => {
                pair.unlock();
                return Err(err);
            }
        }
        match self.unmap_one(&to) {
            Ok(was_mapped) => pair.to_was_mapped = was_mapped,
            Err(err) => {
                self.remap_pair(pair, false);
                pair.unlock();
                return Err(err);
            }
        }
        Ok(())
    }

    /// 用 `old` 交换前的 index 恢复指向 `new` 的页表项
    ///
    /// 反向映射按 `new` 的 `(mapping, index)` 找地址，按 `old` 的 index
    /// 算子页，所以 `old` 的 index 要临时还原成交换前的值。
    fn remap_with_index(&self, old: &Arc<Page>, new: &Arc<Page>, old_index: usize) {
        let cur = old.index();
        old.set_index(old_index);
        self.rmap.remap_after_migration(old, new);
        old.set_index(cur);
    }

    /// 恢复页表项：交换成功时指向对方页，否则指回自己（先 to 后 from）
    pub(super) fn remap_pair(&self, pair: &ExchangePair, exchanged: bool) {
        if pair.to_was_mapped {
            if exchanged {
                self.remap_with_index(&pair.to, &pair.from, pair.to_index);
            } else {
                self.rmap.remap_after_migration(&pair.to, &pair.to);
            }
        }
        if pair.from_was_mapped {
            if exchanged {
                self.remap_with_index(&pair.from, &pair.to, pair.from_index);
            } else {
                self.rmap.remap_after_migration(&pair.from, &pair.from);
            }
        }
    }

    /// 交换后检查计数是否已经互换，只记录日志
    ///
    /// 容忍两种情况：没有 migratepage 的页缓存页少一个缓存引用，以及
    /// 有等待者的页多出临时引用。
    pub(super) fn check_counts(&self, pair: &ExchangePair, exchanged: bool) {
        let before = pair.before;
        // 成功时 from 的旧身份在 to 上，to 的旧身份在 from 上
        let (from_now, to_now) = if exchanged {
            (&pair.to, &pair.from)
        } else {
            (&pair.from, &pair.to)
        };

        if before.from_count == from_now.refcount()
            && before.from_mapcount == from_now.mapcount()
            && before.to_count == to_now.refcount()
            && before.to_mapcount == to_now.mapcount()
        {
            return;
        }

        let opless_file = to_now
            .page_mapping()
            .map_or(false, |mapping| mapping.migrate_op() == MigrateOp::None)
            && before.to_count == to_now.refcount() + 1
            && before.to_mapcount == to_now.mapcount()
            && before.from_count == from_now.refcount()
            && before.from_mapcount == from_now.mapcount();
        let with_waiters = counts_match(before.to_count, before.to_mapcount, to_now)
            && counts_match(before.from_count, before.from_mapcount, from_now);
        if opless_file || with_waiters {
            return;
        }

        log::debug!(
            "exchange: count mismatch (exchanged: {}): from_was_mapped: {}, to_was_mapped: {}",
            exchanged,
            pair.from_was_mapped,
            pair.to_was_mapped
        );
        log::debug!(
            "exchange: before: from count {} mapcount {} flags {:#x}, to count {} mapcount {} flags {:#x}",
            before.from_count,
            before.from_mapcount,
            before.from_flags,
            before.to_count,
            before.to_mapcount,
            before.to_flags
        );
        dump_page(&pair.from, "after exchange: from");
        dump_page(&pair.to, "after exchange: to");
    }

    /// 交换一对页的内容：先试加速后端，不可用时逐页单线程交换
    pub(super) fn exchange_content(&self, to: &Arc<Page>, from: &Arc<Page>, mode: MigrateMode) {
        let rc = self.copy.copy_pages(
            slice::from_ref(to),
            slice::from_ref(from),
            CopyMode::Exchange,
            mode.flags,
        );
        if let Err(err) = rc {
            if mode.multithread() || mode.dma() {
                log::debug!("exchange: parallel copy unavailable ({}), fallback", err);
            }
            copy_page_single(to, from, CopyMode::Exchange);
        }
    }

    /// 交换身份、内容和标志（exchange_from_to_pages）
    ///
    /// 两页都已加锁且都没有页表项。from 必须是匿名页，to 可以是匿名页
    /// 或页缓存页。
    pub(super) fn exchange_from_to_pages(
        &self,
        to: &Arc<Page>,
        from: &Arc<Page>,
        mode: MigrateMode,
    ) -> Result<(), Errno> {
        assert!(from.is_locked() && to.is_locked());
        assert!(from.page_mapping().is_none(), "exchange: from page must be anonymous");
        assert!(!from.is_writeback() && !to.is_writeback());

        dump_page(from, "exchange anonymous page: from");

        let mut locked_buffers = None;
        match to.page_mapping() {
            None => {
                dump_page(to, "exchange anonymous page: to");
                rebind(&self.topology, to, from, None, mode.sync, ExtraRefs::default())?;
            }
            Some(mapping) => match mapping.migrate_op() {
                MigrateOp::Buffer => {
                    dump_page(to, "exchange has migratepage: to");
                    match to.buffers() {
                        None => {
                            rebind(&self.topology, to, from, None, mode.sync, ExtraRefs::default())?;
                        }
                        Some(ring) => {
                            rebind(
                                &self.topology,
                                to,
                                from,
                                Some(&ring),
                                mode.sync,
                                ExtraRefs::default(),
                            )?;
                            // 异步模式在冻结期间已经加锁
                            if !mode.is_async() {
                                assert!(ring.lock_all(mode.sync));
                            }

                            to.clear_flag(PageFlag::Private);
                            from.set_buffers(to.take_buffers());
                            to.put_page();
                            from.get_page();
                            ring.repoint(from.pfn());
                            from.set_flag(PageFlag::Private);
                            locked_buffers = Some(ring);
                        }
                    }
                }
                MigrateOp::None => {
                    dump_page(to, "exchange no migratepage: to");
                    if to.is_dirty() {
                        if !mode.is_sync() {
                            return Err(Errno::DeviceOrResourceBusy);
                        }
                        return Err(mapping.writeout(to, &self.topology));
                    }
                    if to.has_private() && !try_to_free_buffers(to) {
                        return Err(Errno::TryAgain);
                    }
                    rebind(&self.topology, to, from, None, mode.sync, ExtraRefs::default())?;
                }
                MigrateOp::Generic => {
                    log::debug!(
                        "exchange: mapping {} has its own migratepage, page {:#x} skipped",
                        mapping.id(),
                        to.pfn()
                    );
                    return Err(Errno::DeviceOrResourceBusy);
                }
            },
        }

        self.exchange_content(to, from, mode);

        // buffer_head 地址空间：私有数据已经从 to 转到 from
        assert!(
            !to.has_private(),
            "exchange: private data left on page {:#x}",
            to.pfn()
        );
        exchange_page_flags(to, from);

        dump_page(from, "after exchange: from");
        dump_page(to, "after exchange: to");

        if let Some(ring) = locked_buffers {
            ring.unlock_all();
        }
        Ok(())
    }

    /// 完整交换一对页（unmap_and_exchange）
    ///
    /// 返回时两页都已解锁，页表项指向正确的页；是否放回 LRU 由调用者
    /// 决定。
    pub(super) fn unmap_and_exchange(
        &self,
        pair: &mut ExchangePair,
        mode: MigrateMode,
    ) -> Result<(), Errno> {
        let policy = UnmapPolicy {
            force_lock: true,
            wait_writeback: mode.is_sync(),
        };
        self.lock_and_unmap(pair, mode, policy)?;

        let rc = if !pair.from.is_mapped() && !pair.to.is_mapped() {
            self.exchange_from_to_pages(&pair.to, &pair.from, mode)
        } else {
            Err(Errno::TryAgain)
        };
        log::debug!(
            "exchange: from {:#x} to {:#x}: {:?}",
            pair.from.pfn(),
            pair.to.pfn(),
            rc
        );

        self.remap_pair(pair, rc.is_ok());
        self.check_counts(pair, rc.is_ok());
        pair.unlock();
        rc
    }

    /// 逐对串行交换（exchange_pages）
    ///
    /// 遇到 `EAGAIN` 时整对重试，最多重试 `retries` 次。返回时每个页都已
    /// 放回 LRU 或释放。
    pub fn exchange_pages(&self, pairs: Vec<ExchangePair>, mode: MigrateMode) -> ExchangeStats {
        let mut stats = ExchangeStats::default();
        let max_retries = self.retries();

        'pairs: for mut pair in pairs {
            let mut retry = 0;
            let rc = loop {
                if self.release_if_freed(&pair.from, &pair.to) {
                    continue 'pairs;
                }
                // from 必须是匿名页，to 允许是页缓存页
                if !can_be_exchanged(&pair.from, &pair.to) || pair.from.page_mapping().is_some() {
                    break Err(Errno::InvalidArgument);
                }

                let rc = self.unmap_and_exchange(&mut pair, mode);
                if rc == Err(Errno::TryAgain) && retry < max_retries {
                    retry += 1;
                    continue;
                }
                break rc;
            };

            match rc {
                Ok(()) => stats.nr_succeeded += 1,
                Err(err) => {
                    log::debug!("exchange: pair {:?} failed: {}", pair, err);
                    stats.nr_failed += 1;
                }
            }
            let (from, to) = pair.into_pages();
            self.putback(from);
            self.putback(to);
        }
        stats
    }
}
