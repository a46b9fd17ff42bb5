//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 交换两页的 `(mapping, index)` 身份
//!
//! 支持两种组合：
//! - 匿名 ↔ 匿名：两页都已解除映射，页锁足以保护身份字段
//! - 匿名 (from) ↔ 页缓存 (to)：持有 to 所在地址空间的 i_pages 锁，
//!   冻结 to 的引用计数阻断并发查找，再把 from 装进 to 的槽位
//!
//! 页缓存 ↔ 匿名总是由调用者调整为上面的第二种；两页都属于页缓存
//! 属于上游的前提被破坏，直接 panic。
//!
//! 引用计数期望值：
//! - 匿名页：`1 + extra`（隔离引用）
//! - 页缓存页：再加上缓存持有的 `nr_pages` 个引用，挂有 buffer_head
//!   时再加 1

use std::sync::Arc;

use crate::errno::Errno;
use crate::mm::filemap::BufferRing;
use crate::mm::migrate::MigrateSync;
use crate::mm::numa::{NodeStatItem, NumaTopology};
use crate::mm::page_desc::{Page, PageFlag};

/// 调用者额外持有的引用数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtraRefs {
    pub to: i32,
    pub from: i32,
}

fn swap_identity(to: &Page, from: &Page) {
    let to_mapping = to.mapping();
    let to_index = to.index();
    to.set_mapping(from.mapping());
    to.set_index(from.index());
    from.set_mapping(to_mapping);
    from.set_index(to_index);
}

/// 交换两页的地址空间身份（exchange_page_move_mapping）
///
/// 返回 `EAGAIN` 表示引用计数不符、槽位已变或异步模式下 buffer 加锁
/// 失败，调用者可以重试整对页。失败时两页都保持原样。
///
/// `to_buffers` 只在 to 属于 buffer_head 地址空间时给出；异步模式下
/// buffer 在冻结期间加锁，其他模式由调用者在返回后加锁。
pub fn rebind(
    topology: &NumaTopology,
    to: &Page,
    from: &Arc<Page>,
    to_buffers: Option<&BufferRing>,
    sync: MigrateSync,
    extra: ExtraRefs,
) -> Result<(), Errno> {
    assert_eq!(
        to.is_compound(),
        from.is_compound(),
        "exchange: compound mismatch {:#x} <-> {:#x}",
        to.pfn(),
        from.pfn()
    );
    let to_mapping = to.page_mapping();
    let from_mapping = from.page_mapping();
    let mut to_expected = 1 + extra.to;
    let from_expected = 1 + extra.from;

    if to_mapping.is_none() && to.refcount() != to_expected {
        return Err(Errno::TryAgain);
    }
    if from_mapping.is_none() && from.refcount() != from_expected {
        return Err(Errno::TryAgain);
    }

    let to_swap_backed = to.is_swap_backed();
    let from_swap_backed = from.is_swap_backed();

    match (from_mapping, to_mapping) {
        (None, None) => {
            swap_identity(to, from);
            from.clear_flag(PageFlag::SwapBacked);
            if to_swap_backed {
                from.set_flag(PageFlag::SwapBacked);
            }
            to.clear_flag(PageFlag::SwapBacked);
            if from_swap_backed {
                to.set_flag(PageFlag::SwapBacked);
            }
            Ok(())
        }
        (None, Some(to_mapping)) => {
            let nr_pages = to.nr_pages() as i32;
            let to_index = to.index();
            let mut slots = to_mapping.lock_index();

            to_expected += nr_pages + i32::from(to.has_private());
            if to.refcount() != to_expected || !slots.holds(to_index, to) {
                return Err(Errno::TryAgain);
            }
            let mut frozen = to.try_freeze(to_expected).map_err(|_| {
                log::debug!("exchange: cannot freeze page {:#x}", to.pfn());
                Errno::TryAgain
            })?;
            if sync == MigrateSync::Async {
                if let Some(buffers) = to_buffers {
                    if !buffers.lock_all(sync) {
                        log::debug!("exchange: cannot lock buffers of {:#x}", to.pfn());
                        return Err(Errno::TryAgain);
                    }
                }
            }

            // 已冻结，此后不会失败
            from.clear_flag(PageFlag::SwapBacked);
            to.clear_flag(PageFlag::SwapBacked);
            swap_identity(to, from);

            from.page_ref_add(nr_pages);
            if to_swap_backed {
                from.set_flag(PageFlag::SwapBacked);
            } else {
                assert!(!to.is_swap_cache(), "exchange: file page {:#x} in swap cache", to.pfn());
            }
            if from_swap_backed {
                to.set_flag(PageFlag::SwapBacked);
            } else {
                assert!(!from.is_swap_cache(), "exchange: anon page {:#x} in swap cache", from.pfn());
            }

            let dirty = to.is_dirty();
            slots.store(to_index, from.clone());
            frozen.unfreeze_to(to_expected - nr_pages);
            drop(frozen);
            drop(slots);

            if to.nid() != from.nid() {
                let nr = nr_pages as isize;
                topology.mod_node_state(to.nid(), NodeStatItem::FilePages, -nr);
                topology.mod_node_state(from.nid(), NodeStatItem::FilePages, nr);
                if from.is_swap_backed() && !from.is_swap_cache() {
                    topology.mod_node_state(to.nid(), NodeStatItem::Shmem, -nr);
                    topology.mod_node_state(from.nid(), NodeStatItem::Shmem, nr);
                }
                if dirty && to_mapping.cap_account_dirty() {
                    for item in [NodeStatItem::FileDirty, NodeStatItem::ZoneWritePending] {
                        topology.mod_node_state(to.nid(), item, -nr);
                        topology.mod_node_state(from.nid(), item, nr);
                    }
                }
            }
            Ok(())
        }
        (Some(_), _) => panic!(
            "exchange: from page {:#x} belongs to a file mapping",
            from.pfn()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::filemap::{attach_page_buffers, AddressSpace, MigrateOp};
    use crate::mm::page_desc::{Mapping, MemMap};
    use crate::mm::rmap::AnonVma;

    fn anon_page(mem_map: &MemMap, nid: usize, av: &Arc<AnonVma>, index: usize) -> Arc<Page> {
        let page = mem_map.alloc_page(nid, 0);
        page.set_mapping(Mapping::Anon(av.clone()));
        page.set_index(index);
        page.set_flag(PageFlag::SwapBacked);
        page
    }

    #[test]
    fn test_anon_anon() {
        let topo = NumaTopology::new(vec![vec![0], vec![1]]);
        let mem_map = MemMap::new(0);
        let (av1, av2) = (AnonVma::new(1), AnonVma::new(2));
        let from = anon_page(&mem_map, 0, &av1, 10);
        let to = anon_page(&mem_map, 1, &av2, 20);

        rebind(&topo, &to, &from, None, MigrateSync::Sync, ExtraRefs::default()).unwrap();
        assert!(from.mapping().same_as(&Mapping::Anon(av2)));
        assert!(to.mapping().same_as(&Mapping::Anon(av1)));
        assert_eq!((from.index(), to.index()), (20, 10));
        assert!(from.is_swap_backed() && to.is_swap_backed());
    }

    #[test]
    fn test_refcount_mismatch_retries() {
        let topo = NumaTopology::new(vec![vec![0], vec![1]]);
        let mem_map = MemMap::new(0);
        let av = AnonVma::new(1);
        let from = anon_page(&mem_map, 0, &av, 10);
        let to = anon_page(&mem_map, 1, &av, 20);
        to.get_page();

        assert_eq!(
            rebind(&topo, &to, &from, None, MigrateSync::Sync, ExtraRefs::default()),
            Err(Errno::TryAgain)
        );
        assert_eq!(from.index(), 10);
        rebind(&topo, &to, &from, None, MigrateSync::Sync, ExtraRefs { to: 1, from: 0 }).unwrap();
        assert_eq!(from.index(), 20);
    }

    #[test]
    fn test_anon_file_with_buffers() {
        let topo = NumaTopology::new(vec![vec![0], vec![1]]);
        let mem_map = MemMap::new(0);
        let file = AddressSpace::new(9, MigrateOp::Buffer, true);
        let to = mem_map.alloc_page(1, 0);
        file.add_to_page_cache(&to, 3, &topo).unwrap();
        file.set_page_dirty(&to, &topo);
        let ring = BufferRing::new(&to, 1024);
        attach_page_buffers(&to, ring.clone());
        // 1 隔离 + 1 缓存 + 1 buffer
        assert_eq!(to.refcount(), 3);

        let av = AnonVma::new(1);
        let from = anon_page(&mem_map, 0, &av, 77);

        rebind(&topo, &to, &from, Some(&ring), MigrateSync::Async, ExtraRefs::default()).unwrap();
        assert!(file.lock_index().holds(3, &from));
        assert_eq!(from.index(), 3);
        assert!(from.page_mapping().is_some());
        assert!(to.is_anon());
        assert_eq!(to.index(), 77);
        assert_eq!(from.refcount(), 2);
        assert_eq!(to.refcount(), 2);
        assert!(!from.is_swap_backed());
        assert!(to.is_swap_backed());
        assert!(ring.heads().iter().all(|bh| bh.is_locked()));
        ring.unlock_all();

        assert_eq!(topo.node_page_state(1, NodeStatItem::FilePages), 0);
        assert_eq!(topo.node_page_state(0, NodeStatItem::FilePages), 1);
        assert_eq!(topo.node_page_state(0, NodeStatItem::FileDirty), 1);
        assert_eq!(topo.node_page_state(1, NodeStatItem::ZoneWritePending), 0);
    }

    #[test]
    fn test_stale_slot_retries() {
        let topo = NumaTopology::new(vec![vec![0], vec![1]]);
        let mem_map = MemMap::new(0);
        let file = AddressSpace::new(9, MigrateOp::None, false);
        let to = mem_map.alloc_page(1, 0);
        file.add_to_page_cache(&to, 3, &topo).unwrap();
        to.set_index(4);
        let from = anon_page(&mem_map, 0, &AnonVma::new(1), 1);
        assert_eq!(
            rebind(&topo, &to, &from, None, MigrateSync::Sync, ExtraRefs::default()),
            Err(Errno::TryAgain)
        );
        assert_eq!(to.refcount(), 2);
    }

    #[test]
    #[should_panic]
    fn test_file_file_is_fatal() {
        let topo = NumaTopology::new(vec![vec![0], vec![1]]);
        let mem_map = MemMap::new(0);
        let file = AddressSpace::new(9, MigrateOp::None, false);
        let a = mem_map.alloc_page(0, 0);
        let b = mem_map.alloc_page(1, 0);
        file.add_to_page_cache(&a, 1, &topo).unwrap();
        file.add_to_page_cache(&b, 2, &topo).unwrap();
        let _ = rebind(&topo, &b, &a, None, MigrateSync::Sync, ExtraRefs::default());
    }
}
