//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 内存 cgroup
//!
//! 只建模页交换需要的部分：cgroup 身份（页的计费对象）和每个节点上
//! 允许占用的最大页数。cgroup 在各节点上的实际占用由 LRU 统计给出。

use std::collections::BTreeMap;
use std::sync::Arc;

use spin::Mutex;

use crate::mm::numa::NodeId;

/// 内存 cgroup
#[derive(Debug)]
pub struct MemCgroup {
    id: u64,
    name: String,
    root: bool,
    /// 每节点最大页数，缺省表示不限
    node_max: Mutex<BTreeMap<NodeId, usize>>,
}

impl MemCgroup {
    /// 创建普通 cgroup
    pub fn new(id: u64, name: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.to_string(),
            root: false,
            node_max: Mutex::new(BTreeMap::new()),
        })
    }

    /// 创建根 cgroup（root_mem_cgroup）
    pub fn new_root() -> Arc<Self> {
        Arc::new(Self {
            id: 0,
            name: String::from("/"),
            root: true,
            node_max: Mutex::new(BTreeMap::new()),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.root
    }

    /// 设置节点上的最大页数，`None` 表示不限
    pub fn set_max_size_node(&self, nid: NodeId, max: Option<usize>) {
        let mut node_max = self.node_max.lock();
        match max {
            Some(max) => {
                node_max.insert(nid, max);
            }
            None => {
                node_max.remove(&nid);
            }
        }
    }

    /// 节点上的最大页数（memcg_max_size_node），`None` 表示不限
    pub fn max_size_node(&self, nid: NodeId) -> Option<usize> {
        self.node_max.lock().get(&nid).copied()
    }
}

/// 节点预算：cgroup 在某节点上的当前占用和上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeBudget {
    pub nid: NodeId,
    /// 当前占用页数
    pub nr_pages: usize,
    /// 上限，`None` 表示不限
    pub max_pages: Option<usize>,
}

impl NodeBudget {
    /// 剩余可用页数，可能为负（已超限），不限时为 `isize::MAX`
    pub fn nr_free(&self) -> isize {
        match self.max_pages {
            Some(max) => max as isize - self.nr_pages as isize,
            None => isize::MAX,
        }
    }

    /// 是否设置了上限
    #[inline]
    pub fn is_limited(&self) -> bool {
        self.max_pages.is_some()
    }
}
