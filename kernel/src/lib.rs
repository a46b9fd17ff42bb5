//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! NUMA 页交换子系统
//!
//! 在 NUMA 节点之间原地交换两个正在使用的物理页，或者把一批页迁移到
//! 目标节点，同时保持页标志、地址空间映射、页表项、memcg 计费、节点
//! 统计以及 buffer_head 关联不变。
//!
//! 模块结构（自底向上）：
//! - `mm::copy_page` / `mm::dma`: 多线程/多通道并行拷贝
//! - `mm::exchange`: 页对交换协议与批量并发交换
//! - `mm::manage`: 节点间页平衡
//! - `syscall`: exchange_pages / mm_manage 系统调用入口

pub mod config;
pub mod errno;
pub mod mm;
pub mod syscall;

#[cfg(test)]
mod tests;
