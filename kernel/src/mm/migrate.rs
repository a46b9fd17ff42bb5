//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 迁移模式与单向迁移接口
//!
//! 页交换和单向迁移共用同一套模式：同步级别（MIGRATE_ASYNC /
//! MIGRATE_SYNC_LIGHT / MIGRATE_SYNC）加上拷贝方式修饰位
//! （多线程、DMA、并发批量）。

use std::sync::Arc;

use bitflags::bitflags;

use crate::errno::Errno;
use crate::mm::numa::NodeId;
use crate::mm::page_desc::Page;

/// 同步级别（MIGRATE_MODE_MASK 部分）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateSync {
    /// 不阻塞
    Async,
    /// 可以阻塞，但不等待回写
    SyncLight,
    /// 完全同步
    Sync,
}

bitflags! {
    /// 拷贝方式修饰位
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MigrateFlags: u32 {
        /// 多线程拷贝
        const MT = 1 << 0;
        /// DMA 拷贝
        const DMA = 1 << 1;
        /// 并发批量处理
        const CONCUR = 1 << 2;
    }
}

/// 迁移模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrateMode {
    pub sync: MigrateSync,
    pub flags: MigrateFlags,
}

impl MigrateMode {
    pub const ASYNC: Self = Self::new(MigrateSync::Async);
    pub const SYNC_LIGHT: Self = Self::new(MigrateSync::SyncLight);
    pub const SYNC: Self = Self::new(MigrateSync::Sync);

    pub const fn new(sync: MigrateSync) -> Self {
        Self {
            sync,
            flags: MigrateFlags::empty(),
        }
    }

    /// 加上修饰位
    pub fn with(self, flags: MigrateFlags) -> Self {
        Self {
            sync: self.sync,
            flags: self.flags | flags,
        }
    }

    /// 去掉修饰位
    pub fn without(self, flags: MigrateFlags) -> Self {
        Self {
            sync: self.sync,
            flags: self.flags - flags,
        }
    }

    #[inline]
    pub fn is_async(&self) -> bool {
        self.sync == MigrateSync::Async
    }

    #[inline]
    pub fn is_sync(&self) -> bool {
        self.sync == MigrateSync::Sync
    }

    #[inline]
    pub fn multithread(&self) -> bool {
        self.flags.contains(MigrateFlags::MT)
    }

    #[inline]
    pub fn dma(&self) -> bool {
        self.flags.contains(MigrateFlags::DMA)
    }

    #[inline]
    pub fn concur(&self) -> bool {
        self.flags.contains(MigrateFlags::CONCUR)
    }
}

/// 物理页分配器
pub trait FrameAllocator: Send + Sync {
    /// 在节点上分配一个 order 阶的页（alloc_new_node_page）
    fn alloc_page_on_node(&self, nid: NodeId, order: u32) -> Option<Arc<Page>>;
}

/// 单向迁移（migrate_pages / migrate_pages_concur）
///
/// 迁移成功的页从 `pages` 中移除；失败的页留在 `pages` 中并保持隔离
/// 状态，由调用者放回 LRU。
pub trait PageMigrator: Send + Sync {
    /// 返回迁移失败的页数
    fn migrate_pages(
        &self,
        pages: &mut Vec<Arc<Page>>,
        target: NodeId,
        mode: MigrateMode,
    ) -> Result<usize, Errno>;
}
