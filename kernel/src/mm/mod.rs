//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 内存管理模块
//!
//! 页描述符与其协作者（NUMA 拓扑、memcg、页缓存、反向映射、LRU）的
//! 内存内模型，以及建立在它们之上的页交换与节点平衡。

pub mod copy_page;
pub mod dma;
pub mod exchange;
pub mod filemap;
pub mod lru;
pub mod manage;
pub mod memcg;
pub mod migrate;
pub mod numa;
pub mod page_desc;
pub mod rmap;

pub use crate::config::{PAGE_SHIFT, PAGE_SIZE};
pub use copy_page::{CopyEngine, CopyMode};
pub use exchange::{ExchangePair, ExchangeStats, PageExchanger};
pub use manage::{ManageFlags, ManageStats, NodeBalancer};
pub use migrate::{FrameAllocator, MigrateFlags, MigrateMode, MigrateSync, PageMigrator};
pub use numa::{NodeId, NodeStatItem, NumaTopology};
pub use page_desc::{dump_page, Mapping, MemMap, Page, PageFlag, PageFlags, PageLock, Pfn};
