//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 批量并发交换
//!
//! 每一轮按阶段处理全部待交换页对：
//!
//! 1. 拆除映射：已被释放的页对直接丢弃；复合页和页缓存页对放入串行
//!    列表；其余页对加锁并拆除页表项，`EAGAIN` 留到下一轮
//! 2. 批量交换身份
//! 3. 一次性并行交换全部内容
//! 4. 批量交换标志、恢复页表项、解锁、放回 LRU
//!
//! 每个阶段都是屏障：全部页对完成第 N 阶段后才开始第 N+1 阶段。
//! 轮次结束后仍未完成的页对记为失败，串行列表交给逐对交换处理。

use std::collections::TryReserveError;
use std::mem;
use std::sync::Arc;

use super::{exchange_page_flags, rebind, ExchangePair, ExtraRefs, PageExchanger};
use super::pair::UnmapPolicy;
use crate::config::CONCUR_FORCE_LOCK_PASS;
use crate::errno::Errno;
use crate::mm::copy_page::{copy_page_single, CopyMode};
use crate::mm::migrate::MigrateMode;
use crate::mm::page_desc::Page;

/// 取出批量拷贝用的页列表
fn page_lists(pairs: &[ExchangePair]) -> Result<(Vec<Arc<Page>>, Vec<Arc<Page>>), TryReserveError> {
    let mut to = Vec::new();
    let mut from = Vec::new();
    to.try_reserve_exact(pairs.len())?;
    from.try_reserve_exact(pairs.len())?;
    for pair in pairs {
        to.push(pair.to.clone());
        from.push(pair.from.clone());
    }
    Ok((to, from))
}

impl PageExchanger {
    /// 把一对页放回 LRU 并丢弃记录
    fn putback_pair(&self, pair: ExchangePair) {
        let (from, to) = pair.into_pages();
        self.putback(from);
        self.putback(to);
    }

    /// 第 2 阶段：逐对交换身份，失败的页对恢复映射后放回
    fn rebind_unmapped(&self, unmapped: Vec<ExchangePair>, mode: MigrateMode) -> (Vec<ExchangePair>, usize) {
        let mut rebound = Vec::with_capacity(unmapped.len());
        let mut nr_failed = 0;

        for mut pair in unmapped {
            assert!(pair.is_locked());
            assert!(pair.from.page_mapping().is_none() && pair.to.page_mapping().is_none());
            assert!(!pair.from.is_writeback() && !pair.to.is_writeback());

            let rc = if !pair.from.is_mapped() && !pair.to.is_mapped() {
                rebind(&self.topology, &pair.to, &pair.from, None, mode.sync, ExtraRefs::default())
            } else {
                Err(Errno::DeviceOrResourceBusy)
            };
            match rc {
                Ok(()) => rebound.push(pair),
                Err(err) => {
                    log::debug!("exchange: concurrent rebind of {:?} failed: {}", pair, err);
                    self.remap_pair(&pair, false);
                    pair.unlock();
                    self.putback_pair(pair);
                    nr_failed += 1;
                }
            }
        }
        (rebound, nr_failed)
    }

    /// 第 3 阶段：一次性交换全部页对的内容，然后交换标志
    fn exchange_data_concur(&self, rebound: &[ExchangePair], mode: MigrateMode) {
        if rebound.is_empty() {
            return;
        }
        let rc = match page_lists(rebound) {
            Ok((to, from)) => self.copy.copy_pages(&to, &from, CopyMode::Exchange, mode.flags),
            Err(_) => {
                log::warn!("exchange: no memory for {} page lists, copy one by one", rebound.len());
                Err(Errno::OutOfMemory)
            }
        };
        if let Err(err) = rc {
            if mode.multithread() || mode.dma() {
                log::debug!("exchange: batch copy unavailable ({}), fallback", err);
            }
            for pair in rebound {
                copy_page_single(&pair.to, &pair.from, CopyMode::Exchange);
            }
        }
        for pair in rebound {
            exchange_page_flags(&pair.to, &pair.from);
        }
    }

    /// 第 4 阶段：恢复页表项、解锁、放回 LRU
    fn remap_exchanged(&self, rebound: Vec<ExchangePair>) {
        for mut pair in rebound {
            self.remap_pair(&pair, true);
            self.check_counts(&pair, true);
            pair.unlock();
            self.putback_pair(pair);
        }
    }

    /// 批量并发交换（exchange_pages_concur）
    ///
    /// 全部页对最终（含串行回退）都成功时返回 Ok，否则返回聚合错误
    /// `EFAULT`。返回时每个页都已放回 LRU 或释放。
    pub fn exchange_pages_concur(&self, pairs: Vec<ExchangePair>, mode: MigrateMode) -> Result<(), Errno> {
        let passes = self.concur_passes();
        let mut pending = pairs;
        let mut serialized = Vec::new();
        let mut nr_failed = 0;
        let mut nr_succeeded = 0;

        let mut pass = 0;
        while pass < passes && !pending.is_empty() {
            // 前几轮只 trylock，之后（以及最后一轮）允许阻塞加锁
            let policy = UnmapPolicy {
                force_lock: pass >= CONCUR_FORCE_LOCK_PASS || pass + 1 == passes,
                wait_writeback: false,
            };
            let mut unmapped = Vec::new();
            let mut retry = Vec::new();

            for mut pair in mem::take(&mut pending) {
                if self.release_if_freed(&pair.from, &pair.to) {
                    continue;
                }
                let rc = if pair.from.is_compound()
                    || pair.to.is_compound()
                    || pair.from.page_mapping().is_some()
                    || pair.to.page_mapping().is_some()
                {
                    Err(Errno::NoSuchDevice)
                } else {
                    self.lock_and_unmap(&mut pair, mode, policy)
                };

                match rc {
                    Ok(()) => unmapped.push(pair),
                    Err(Errno::TryAgain) => retry.push(pair),
                    Err(Errno::NoSuchDevice) => serialized.push(pair),
                    Err(err) => {
                        log::debug!("exchange: {:?} demoted to serial path: {}", pair, err);
                        serialized.push(pair);
                    }
                }
            }

            let (rebound, failed) = self.rebind_unmapped(unmapped, mode);
            nr_failed += failed;
            self.exchange_data_concur(&rebound, mode);
            nr_succeeded += rebound.len();
            self.remap_exchanged(rebound);

            pending = retry;
            pass += 1;
        }

        if !pending.is_empty() {
            log::debug!("exchange: {} pairs still busy after {} passes", pending.len(), pass);
            nr_failed += pending.len();
            for pair in pending {
                self.putback_pair(pair);
            }
        }

        let serial = self.exchange_pages(serialized, mode);
        nr_failed += serial.nr_failed;
        nr_succeeded += serial.nr_succeeded;
        log::debug!(
            "exchange: concurrent exchange done, {} succeeded, {} failed",
            nr_succeeded,
            nr_failed
        );

        if nr_failed > 0 {
            Err(Errno::BadAddress)
        } else {
            Ok(())
        }
    }
}
