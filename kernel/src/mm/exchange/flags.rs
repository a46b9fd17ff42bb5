//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 页标志交换
//!
//! 两页内容交换完成后，把随内容走的瞬时状态（脏、活跃、访问位等）、
//! NUMA 访问提示和 memcg 归属交叉搬到对方页上。memcg 只是改标签，
//! 不做 charge/uncharge。

use bitflags::bitflags;

use crate::mm::page_desc::{Page, PageFlag};

bitflags! {
    /// 一页在交换时刻的瞬时标志快照
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlagsSnapshot: u32 {
        const ERROR = 1 << 0;
        const REFERENCED = 1 << 1;
        const UPTODATE = 1 << 2;
        const ACTIVE = 1 << 3;
        const UNEVICTABLE = 1 << 4;
        const CHECKED = 1 << 5;
        const MAPPED_TO_DISK = 1 << 6;
        const DIRTY = 1 << 7;
        const YOUNG = 1 << 8;
        const IDLE = 1 << 9;
        const SWAP_CACHE = 1 << 10;
        const WRITEBACK = 1 << 11;
        const DOUBLE_MAP = 1 << 12;
    }
}

/// 快照位与页标志位的对应关系；Active/Unevictable/SwapCache 单独处理
const TRANSFERRED: [(PageFlagsSnapshot, PageFlag); 10] = [
    (PageFlagsSnapshot::ERROR, PageFlag::Error),
    (PageFlagsSnapshot::REFERENCED, PageFlag::Referenced),
    (PageFlagsSnapshot::UPTODATE, PageFlag::UpToDate),
    (PageFlagsSnapshot::CHECKED, PageFlag::Checked),
    (PageFlagsSnapshot::MAPPED_TO_DISK, PageFlag::MappedToDisk),
    (PageFlagsSnapshot::DIRTY, PageFlag::Dirty),
    (PageFlagsSnapshot::YOUNG, PageFlag::Young),
    (PageFlagsSnapshot::IDLE, PageFlag::Idle),
    (PageFlagsSnapshot::WRITEBACK, PageFlag::Writeback),
    (PageFlagsSnapshot::DOUBLE_MAP, PageFlag::DoubleMap),
];

impl PageFlagsSnapshot {
    /// 读取并清除页上的瞬时标志
    ///
    /// SwapCache 只读不清，交叉设置时统一处理。
    pub fn take(page: &Page) -> Self {
        let mut snapshot = Self::empty();
        for (bit, flag) in TRANSFERRED {
            snapshot.set(bit, page.test_and_clear_flag(flag));
        }
        snapshot.set(Self::ACTIVE, page.test_and_clear_flag(PageFlag::Active));
        snapshot.set(
            Self::UNEVICTABLE,
            page.test_and_clear_flag(PageFlag::Unevictable),
        );
        snapshot.set(Self::SWAP_CACHE, page.is_swap_cache());
        snapshot
    }

    /// 把快照设置到 `page` 上（不含 SwapCache）
    fn apply(self, page: &Page) {
        for (bit, flag) in TRANSFERRED {
            if self.contains(bit) {
                page.set_flag(flag);
            }
        }
        if self.contains(Self::ACTIVE) {
            assert!(
                !self.contains(Self::UNEVICTABLE),
                "exchange: page {:#x} would be both active and unevictable",
                page.pfn()
            );
            page.set_flag(PageFlag::Active);
        } else if self.contains(Self::UNEVICTABLE) {
            page.set_flag(PageFlag::Unevictable);
        }
    }
}

/// 交叉交换两页的瞬时状态（exchange_page_flags）
///
/// 调用时两页都已加锁，内容已交换，映射已解除或已交换。
pub fn exchange_page_flags(to: &Page, from: &Page) {
    let from_cpupid = from.cpupid_xchg_last(-1);
    let from_flags = PageFlagsSnapshot::take(from);

    let to_cpupid = to.cpupid_xchg_last(-1);
    let to_flags = PageFlagsSnapshot::take(to);

    from_flags.apply(to);
    to_flags.apply(from);

    to.cpupid_xchg_last(from_cpupid);
    from.cpupid_xchg_last(to_cpupid);

    to.clear_flag(PageFlag::SwapCache);
    from.clear_flag(PageFlag::SwapCache);
    if from_flags.contains(PageFlagsSnapshot::SWAP_CACHE) {
        to.set_flag(PageFlag::SwapCache);
    }
    if to_flags.contains(PageFlagsSnapshot::SWAP_CACHE) {
        from.set_flag(PageFlag::SwapCache);
    }

    let to_memcg = to.mem_cgroup();
    let from_memcg = from.mem_cgroup();
    to.set_mem_cgroup(from_memcg);
    from.set_mem_cgroup(to_memcg);
}
