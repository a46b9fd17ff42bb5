//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! NUMA 拓扑与节点统计
//!
//! 每个节点记录本地 CPU 列表（cpumask_of_node）和一组节点级 vm 计数器
//! （NR_ISOLATED_ANON 等）。每个节点只建模一个 zone，因此 zone 级的
//! 计数器（NR_ZONE_WRITE_PENDING）也挂在节点上。

use core::sync::atomic::{AtomicIsize, Ordering};

use crate::mm::page_desc::Page;

/// NUMA 节点号
pub type NodeId = usize;

/// 最大节点数
pub const MAX_NUMNODES: usize = 64;

/// 节点级 vm 统计项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum NodeStatItem {
    /// 被隔离的匿名页
    IsolatedAnon = 0,
    /// 被隔离的文件页
    IsolatedFile = 1,
    /// 页缓存页
    FilePages = 2,
    /// 共享内存页
    Shmem = 3,
    /// 脏文件页
    FileDirty = 4,
    /// 等待回写的页（zone 级）
    ZoneWritePending = 5,
}

const NR_VM_NODE_STAT_ITEMS: usize = 6;

impl NodeStatItem {
    /// NR_ISOLATED_ANON + page_is_file_cache(page)
    #[inline]
    pub fn isolated_for(page: &Page) -> Self {
        if page.is_file_cache() {
            NodeStatItem::IsolatedFile
        } else {
            NodeStatItem::IsolatedAnon
        }
    }
}

/// 单个节点的数据（pg_data_t 的子集）
#[derive(Debug)]
pub struct NodeData {
    nid: NodeId,
    cpus: Vec<usize>,
    vm_stat: [AtomicIsize; NR_VM_NODE_STAT_ITEMS],
}

impl NodeData {
    fn new(nid: NodeId, cpus: Vec<usize>) -> Self {
        Self {
            nid,
            cpus,
            vm_stat: Default::default(),
        }
    }

    #[inline]
    pub fn nid(&self) -> NodeId {
        self.nid
    }

    /// 本节点的 CPU 列表
    #[inline]
    pub fn cpus(&self) -> &[usize] {
        &self.cpus
    }
}

/// NUMA 拓扑
#[derive(Debug)]
pub struct NumaTopology {
    nodes: Vec<NodeData>,
}

impl NumaTopology {
    /// 按节点给出 CPU 列表创建拓扑，第 i 项即节点 i
    pub fn new(cpus_per_node: Vec<Vec<usize>>) -> Self {
        assert!(cpus_per_node.len() <= MAX_NUMNODES, "too many numa nodes");
        let nodes = cpus_per_node
            .into_iter()
            .enumerate()
            .map(|(nid, cpus)| NodeData::new(nid, cpus))
            .collect();
        Self { nodes }
    }

    /// 把本机可用的 CPU 平均分到 `nr_nodes` 个节点上
    pub fn split_host(nr_nodes: usize) -> Self {
        let nr_nodes = nr_nodes.max(1);
        let nr_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let mut cpus_per_node = vec![Vec::new(); nr_nodes];
        for cpu in 0..nr_cpus.max(nr_nodes) {
            cpus_per_node[cpu % nr_nodes].push(cpu % nr_cpus);
        }
        Self::new(cpus_per_node)
    }

    /// 节点数
    #[inline]
    pub fn nr_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// 节点是否在线
    #[inline]
    pub fn node_online(&self, nid: NodeId) -> bool {
        nid < self.nodes.len()
    }

    /// 节点数据（NODE_DATA）
    pub fn node(&self, nid: NodeId) -> Option<&NodeData> {
        self.nodes.get(nid)
    }

    /// 节点本地 CPU（cpumask_of_node），节点不存在时为空
    pub fn cpus_of_node(&self, nid: NodeId) -> &[usize] {
        self.nodes.get(nid).map_or(&[], |node| node.cpus())
    }

    /// 节点本地 CPU 数（cpumask_weight）
    #[inline]
    pub fn cpumask_weight(&self, nid: NodeId) -> usize {
        self.cpus_of_node(nid).len()
    }

    /// 修改节点计数器
    pub fn mod_node_state(&self, nid: NodeId, item: NodeStatItem, delta: isize) {
        match self.nodes.get(nid) {
            Some(node) => {
                node.vm_stat[item as usize].fetch_add(delta, Ordering::Relaxed);
            }
            None => log::warn!("numa: stat update on offline node {}", nid),
        }
    }

    /// 按页所在节点修改隔离计数（mod_node_page_state）
    pub fn mod_isolated(&self, page: &Page, delta: isize) {
        self.mod_node_state(page.nid(), NodeStatItem::isolated_for(page), delta);
    }

    /// 读取节点计数器
    pub fn node_page_state(&self, nid: NodeId, item: NodeStatItem) -> isize {
        self.nodes
            .get(nid)
            .map_or(0, |node| node.vm_stat[item as usize].load(Ordering::Relaxed))
    }
}
