//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 匿名页与页缓存页交换

use std::sync::Arc;

use super::{filled_with, Fixture, BASE, VMA_SIZE};
use crate::mm::filemap::{attach_page_buffers, AddressSpace, BufferRing, MigrateOp};
use crate::mm::migrate::MigrateMode;
use crate::mm::numa::NodeStatItem;
use crate::mm::page_desc::Page;
use crate::mm::rmap::Vma;

const FILE_BASE: usize = BASE + VMA_SIZE;

/// 在节点 1 上建一个映射到 FILE_BASE 的页缓存页（文件偏移 0）
fn map_file_page(fx: &Fixture, file: &Arc<AddressSpace>, fill: u8) -> Arc<Page> {
    fx.mm
        .add_vma(Vma::new_file(FILE_BASE, FILE_BASE + VMA_SIZE, 0, file.clone()))
        .unwrap();
    let page = fx.mem_map.alloc_page(1, 0);
    page.set_mem_cgroup(Some(fx.memcg.clone()));
    page.fill(fill);
    file.add_to_page_cache(&page, 0, &fx.topology).unwrap();
    fx.mm.map_page(FILE_BASE, &page).unwrap();
    page.put_page();
    fx.lru.add(&page);
    page
}

#[test]
fn test_exchange_with_buffer_page() {
    let fx = Fixture::new();
    let file = AddressSpace::new(7, MigrateOp::Buffer, true);
    let to = map_file_page(&fx, &file, 0x33);
    let ring = BufferRing::new(&to, 1024);
    attach_page_buffers(&to, ring.clone());
    file.set_page_dirty(&to, &fx.topology);
    // 缓存 + buffer + 页表项
    assert_eq!(to.refcount(), 3);
    assert_eq!(fx.topology.node_page_state(1, NodeStatItem::FileDirty), 1);

    let from = fx.map_anon(BASE, 0, 0, 0xcc, false);
    let pair = fx.isolated_pair(&from, &to);
    let stats = fx.exchanger.exchange_pages(vec![pair], MigrateMode::SYNC);
    assert_eq!((stats.nr_succeeded, stats.nr_failed), (1, 0));

    // 测试 1: from 接管缓存槽位和 buffer_head
    assert!(file.lock_index().holds(0, &from));
    assert!(from.page_mapping().is_some());
    assert!(to.is_anon());
    assert!(from.has_private() && !to.has_private());
    assert!(to.buffers().is_none());
    assert!(ring.heads().iter().all(|bh| bh.page_pfn() == from.pfn()));
    assert!(ring
        .heads()
        .iter()
        .all(|bh| bh.is_dirty() && !bh.is_locked() && bh.count() == 0));

    // 测试 2: 脏页统计跟随页缓存页换到节点 0
    assert!(from.is_dirty() && !to.is_dirty());
    assert_eq!(fx.topology.node_page_state(0, NodeStatItem::FileDirty), 1);
    assert_eq!(fx.topology.node_page_state(1, NodeStatItem::FileDirty), 0);
    assert_eq!(fx.topology.node_page_state(0, NodeStatItem::FilePages), 1);
    assert_eq!(fx.topology.node_page_state(1, NodeStatItem::FilePages), 0);

    // 测试 3: 两个地址都指向持有原内容的页
    assert_eq!(fx.mm.translate(FILE_BASE), Some(from.pfn()));
    assert_eq!(fx.mm.translate(BASE), Some(to.pfn()));
    assert!(filled_with(&from, 0x33));
    assert!(filled_with(&to, 0xcc));
    assert_eq!(from.refcount(), 3);
    assert_eq!(to.refcount(), 1);
    assert_eq!(fx.nr_isolated(), 0);
}

#[test]
fn test_dirty_page_without_migratepage_is_written_out() {
    let fx = Fixture::new();
    let file = AddressSpace::new(8, MigrateOp::None, true);
    let to = map_file_page(&fx, &file, 0x44);
    file.set_page_dirty(&to, &fx.topology);

    let from = fx.map_anon(BASE, 0, 0, 0x99, false);
    let pair = fx.isolated_pair(&from, &to);

    // 第一次尝试回写后返回 EAGAIN，重试时页已干净
    let stats = fx.exchanger.exchange_pages(vec![pair], MigrateMode::SYNC);
    assert_eq!(stats.nr_succeeded, 1);
    assert!(!from.is_dirty() && !to.is_dirty());
    assert_eq!(fx.topology.node_page_state(1, NodeStatItem::FileDirty), 0);
    assert!(file.lock_index().holds(0, &from));
    assert_eq!(fx.mm.translate(FILE_BASE), Some(from.pfn()));
}

#[test]
fn test_dirty_page_without_migratepage_in_light_mode() {
    let fx = Fixture::new();
    let file = AddressSpace::new(8, MigrateOp::None, true);
    let to = map_file_page(&fx, &file, 0x44);
    file.set_page_dirty(&to, &fx.topology);

    let from = fx.map_anon(BASE, 0, 0, 0x99, false);
    let pair = fx.isolated_pair(&from, &to);

    let stats = fx.exchanger.exchange_pages(vec![pair], MigrateMode::SYNC_LIGHT);
    assert_eq!(stats.nr_failed, 1);
    assert!(to.is_dirty());
    assert!(file.lock_index().holds(0, &to));
    assert_eq!(fx.mm.translate(FILE_BASE), Some(to.pfn()));
    assert_eq!(fx.mm.translate(BASE), Some(from.pfn()));
    assert_eq!(fx.nr_isolated(), 0);
}

#[test]
fn test_own_migratepage_is_refused() {
    let fx = Fixture::new();
    let file = AddressSpace::new(9, MigrateOp::Generic, false);
    let to = map_file_page(&fx, &file, 0x44);
    let from = fx.map_anon(BASE, 0, 0, 0x99, false);
    let pair = fx.isolated_pair(&from, &to);

    let stats = fx.exchanger.exchange_pages(vec![pair], MigrateMode::SYNC);
    assert_eq!(stats.nr_failed, 1);
    assert!(file.lock_index().holds(0, &to));
    assert!(filled_with(&to, 0x44));
    assert!(fx.lru.contains(&to) && fx.lru.contains(&from));
    assert_eq!((from.refcount(), to.refcount()), (1, 2));
}

#[test]
fn test_file_backed_from_page_is_rejected() {
    let fx = Fixture::new();
    let file = AddressSpace::new(10, MigrateOp::Buffer, false);
    let from = map_file_page(&fx, &file, 0x44);
    let to = fx.map_anon(BASE, 0, 0, 0x99, false);
    let pair = fx.isolated_pair(&from, &to);

    let stats = fx.exchanger.exchange_pages(vec![pair], MigrateMode::SYNC);
    assert_eq!(stats.nr_failed, 1);
    assert!(file.lock_index().holds(0, &from));
    assert_eq!(fx.nr_isolated(), 0);
}
