//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 系统调用入口
//!
//! - `exchange_pages(pid, nr_pages, from_pages, to_pages, status, flags)`:
//!   按用户虚拟地址成对交换页，逐项返回状态
//! - `mm_manage(pid, nr_pages, maxnode, old_nodes, new_nodes, flags)`:
//!   在两个节点之间按预算平衡进程的页
//!
//! 用户空间数组在这里用切片表示，越界访问视为 `copy_from_user` /
//! `put_user` 失败，返回 `EFAULT`。

use std::collections::BTreeMap;
use std::sync::Arc;

use bitflags::bitflags;
use spin::Mutex;

use crate::errno::Errno;
use crate::mm::exchange::{ExchangePair, PageExchanger};
use crate::mm::manage::{ManageFlags, ManageStats, NodeBalancer};
use crate::mm::numa::NodeId;
use crate::mm::page_desc::{Page, Pfn};
use crate::mm::rmap::Mm;

pub type Pid = u32;
pub type Uid = u32;

bitflags! {
    /// 进程能力（只列出用到的）
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u64 {
        const SYS_NICE = 1 << 23;
    }
}

/// 进程凭据
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cred {
    pub uid: Uid,
    pub euid: Uid,
    pub suid: Uid,
    pub caps: Capabilities,
}

impl Cred {
    /// 普通用户，三个 uid 相同，没有额外能力
    pub fn user(uid: Uid) -> Self {
        Self {
            uid,
            euid: uid,
            suid: uid,
            caps: Capabilities::empty(),
        }
    }

    /// 超级用户
    pub fn root() -> Self {
        Self {
            caps: Capabilities::all(),
            ..Self::user(0)
        }
    }

    #[inline]
    pub fn capable(&self, cap: Capabilities) -> bool {
        self.caps.contains(cap)
    }

    /// 是否有权移动 `target` 的内存
    ///
    /// 调用者的 uid/euid 与目标的 uid/suid 有一个相同，或者具有
    /// CAP_SYS_NICE。
    pub fn may_move_memory_of(&self, target: &Cred) -> bool {
        self.euid == target.suid
            || self.euid == target.uid
            || self.uid == target.suid
            || self.uid == target.uid
            || self.capable(Capabilities::SYS_NICE)
    }
}

/// 进程（task_struct 的子集）
#[derive(Debug)]
pub struct Task {
    pid: Pid,
    cred: Cred,
    mm: Option<Arc<Mm>>,
    /// mm_manage 累计统计
    stats: Mutex<ManageStats>,
}

impl Task {
    pub fn new(pid: Pid, cred: Cred, mm: Option<Arc<Mm>>) -> Arc<Self> {
        Arc::new(Self {
            pid,
            cred,
            mm,
            stats: Mutex::new(ManageStats::default()),
        })
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    pub fn cred(&self) -> &Cred {
        &self.cred
    }

    /// get_task_mm，内核线程没有 mm
    pub fn mm(&self) -> Option<Arc<Mm>> {
        self.mm.clone()
    }

    /// 当前的 mm_manage 统计
    pub fn manage_stats(&self) -> ManageStats {
        *self.stats.lock()
    }
}

/// pid → 进程
#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: Mutex<BTreeMap<Pid, Arc<Task>>>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: Arc<Task>) {
        self.tasks.lock().insert(task.pid(), task);
    }

    /// find_task_by_vpid
    pub fn find(&self, pid: Pid) -> Option<Arc<Task>> {
        self.tasks.lock().get(&pid).cloned()
    }
}

/// 节点掩码（nodemask_t）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeMask(u64);

impl NodeMask {
    /// 从用户空间的位图读取前 `maxnode - 1` 位（get_nodes）
    ///
    /// 位图比 `maxnode` 短时返回 `EFAULT`，设置了超出 MAX_NUMNODES 的
    /// 位时返回 `EINVAL`。
    pub fn from_user(words: &[u64], maxnode: usize) -> Result<Self, Errno> {
        let nbits = maxnode.saturating_sub(1);
        if nbits == 0 {
            return Ok(Self::default());
        }
        let nr_words = nbits.div_ceil(64);
        let words = words.get(..nr_words).ok_or(Errno::BadAddress)?;

        let mut mask = 0;
        for (i, &word) in words.iter().enumerate() {
            let valid = nbits - i * 64;
            let word = if valid < 64 { word & ((1u64 << valid) - 1) } else { word };
            if i == 0 {
                mask = word;
            } else if word != 0 {
                return Err(Errno::InvalidArgument);
            }
        }
        Ok(Self(mask))
    }

    #[inline]
    pub fn weight(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn first_node(&self) -> Option<NodeId> {
        (self.0 != 0).then(|| self.0.trailing_zeros() as NodeId)
    }

    /// 只包含一个节点时返回该节点
    fn only_node(&self) -> Result<NodeId, Errno> {
        match self.first_node() {
            Some(nid) if self.weight() == 1 => Ok(nid),
            _ => Err(Errno::InvalidArgument),
        }
    }
}

/// mm_manage 期间持有的 MMF_MM_MANAGE 标记
struct ManageGuard<'a>(&'a Mm);

impl<'a> ManageGuard<'a> {
    fn try_new(mm: &'a Mm) -> Option<Self> {
        mm.try_begin_manage().then_some(Self(mm))
    }
}

impl Drop for ManageGuard<'_> {
    fn drop(&mut self) {
        self.0.end_manage();
    }
}

/// 已加入当前批次的一项
struct BatchEntry {
    /// 在用户数组中的下标
    index: usize,
    from_addr: usize,
    to_pfn: Pfn,
}

/// 把 `value` 写入 `status[start..start + nr]`（store_status）
fn store_status(status: &mut [i32], start: usize, value: i32, nr: usize) -> Result<(), Errno> {
    let end = start.checked_add(nr).ok_or(Errno::BadAddress)?;
    status
        .get_mut(start..end)
        .ok_or(Errno::BadAddress)?
        .fill(value);
    Ok(())
}

/// 转换为系统调用返回值
pub fn syscall_ret(result: Result<(), Errno>) -> i64 {
    match result {
        Ok(()) => 0,
        Err(err) => err.as_neg_i32() as i64,
    }
}

/// exchange_pages 和 mm_manage 的实现
pub struct MmSyscalls {
    tasks: Arc<TaskTable>,
    balancer: NodeBalancer,
}

impl MmSyscalls {
    pub fn new(tasks: Arc<TaskTable>, balancer: NodeBalancer) -> Self {
        Self { tasks, balancer }
    }

    #[inline]
    fn exchanger(&self) -> &Arc<PageExchanger> {
        self.balancer.exchanger()
    }

    /// pid 为 0 表示当前进程；返回有权操作的目标进程
    fn find_target(&self, current: &Arc<Task>, pid: Pid) -> Result<Arc<Task>, Errno> {
        let task = if pid == 0 {
            current.clone()
        } else {
            self.tasks.find(pid).ok_or(Errno::NoSuchProcess)?
        };
        if !current.cred().may_move_memory_of(task.cred()) {
            return Err(Errno::OperationNotPermitted);
        }
        Ok(task)
    }

    /// exchange_pages 系统调用
    ///
    /// `status[i]` 为 0 表示第 i 对已交换，负数为该对的错误码。
    pub fn sys_exchange_pages(
        &self,
        current: &Arc<Task>,
        pid: Pid,
        from_pages: &[usize],
        to_pages: &[usize],
        status: &mut [i32],
        flags: u32,
    ) -> Result<(), Errno> {
        let allowed = ManageFlags::MOVE
            | ManageFlags::MOVE_ALL
            | ManageFlags::MOVE_MT
            | ManageFlags::MOVE_CONCUR;
        let flags = ManageFlags::from_bits(flags)
            .filter(|flags| allowed.contains(*flags))
            .ok_or(Errno::InvalidArgument)?;
        if flags.contains(ManageFlags::MOVE_ALL) && !current.cred().capable(Capabilities::SYS_NICE) {
            return Err(Errno::OperationNotPermitted);
        }

        let task = self.find_target(current, pid)?;
        let mm = task.mm().ok_or(Errno::InvalidArgument)?;
        self.do_pages_exchange(&mm, from_pages, to_pages, status, flags)
    }

    fn do_pages_exchange(
        &self,
        mm: &Mm,
        from_pages: &[usize],
        to_pages: &[usize],
        status: &mut [i32],
        flags: ManageFlags,
    ) -> Result<(), Errno> {
        let migrate_all = flags.contains(ManageFlags::MOVE_ALL);
        let mut from_list = Vec::new();
        let mut to_list = Vec::new();
        let mut batch = Vec::new();
        let mut i = 0;
        let mut err = Ok(());

        while i < from_pages.len() {
            let Some(&to_addr) = to_pages.get(i) else {
                err = Err(Errno::BadAddress);
                break;
            };
            let from_addr = from_pages[i];

            // 查找和隔离的错误只记录在 status 中
            match self.add_page_for_exchange(mm, from_addr, to_addr, &mut from_list, &mut to_list, migrate_all) {
                Ok(to_pfn) => batch.push(BatchEntry {
                    index: i,
                    from_addr,
                    to_pfn,
                }),
                Err(rc) => {
                    if let Err(e) = store_status(status, i, rc.as_neg_i32(), 1) {
                        err = Err(e);
                        break;
                    }
                    let rc = self.exchange_batch(mm, &mut batch, &mut from_list, &mut to_list, status, flags);
                    err = err.and(rc);
                }
            }
            i += 1;
        }

        let rc = self.exchange_batch(mm, &mut batch, &mut from_list, &mut to_list, status, flags);
        err.and(rc)
    }

    /// 交换已收集的一批页对，并为其中每一项写入状态
    ///
    /// 整批失败时逐项确认：`from_addr` 已经映射到原 to 页的项算作成功，
    /// 其余项写入聚合错误码。返回整批的结果。
    fn exchange_batch(
        &self,
        mm: &Mm,
        batch: &mut Vec<BatchEntry>,
        from_list: &mut Vec<Arc<Page>>,
        to_list: &mut Vec<Arc<Page>>,
        status: &mut [i32],
        flags: ManageFlags,
    ) -> Result<(), Errno> {
        let rc = self.do_exchange_page_list(from_list, to_list, flags);
        for entry in batch.drain(..) {
            let value = match rc {
                Err(err) if mm.translate(entry.from_addr) != Some(entry.to_pfn) => err.as_neg_i32(),
                _ => 0,
            };
            store_status(status, entry.index, value, 1)?;
        }
        rc
    }

    /// 查找并隔离用户地址处的页
    ///
    /// 成功时页已隔离，持有隔离引用；follow_page 的引用在返回前释放。
    fn isolate_user_page(&self, mm: &Mm, addr: usize, migrate_all: bool) -> Result<Arc<Page>, Errno> {
        mm.find_vma(addr)
            .filter(|vma| vma.contains(addr) && vma.migratable)
            .ok_or(Errno::BadAddress)?;
        let page = mm.follow_page(addr).ok_or(Errno::NoSuchFileOrDirectory)?;

        let rc = if page.mapcount() > 1 && !migrate_all {
            Err(Errno::PermissionDenied)
        } else if page.is_huge() {
            Err(Errno::DeviceOrResourceBusy)
        } else if page.is_compound() && mm.translate(addr) != Some(page.pfn()) {
            // 指向大页的尾页
            Err(Errno::PermissionDenied)
        } else {
            self.exchanger().lru().isolate_page(&page).map(|()| {
                self.exchanger()
                    .topology()
                    .mod_isolated(&page, page.nr_pages() as isize);
            })
        };
        page.put_page();
        rc.map(|()| page)
    }

    /// 隔离一对页并加入待交换列表（add_page_for_exchange）
    ///
    /// 成功时返回 to 页的页帧号。
    fn add_page_for_exchange(
        &self,
        mm: &Mm,
        from_addr: usize,
        to_addr: usize,
        from_list: &mut Vec<Arc<Page>>,
        to_list: &mut Vec<Arc<Page>>,
        migrate_all: bool,
    ) -> Result<Pfn, Errno> {
        let from_page = self.isolate_user_page(mm, from_addr, migrate_all)?;
        let to_page = match self.isolate_user_page(mm, to_addr, migrate_all) {
            Ok(page) => page,
            Err(err) => {
                self.exchanger().putback(from_page);
                return Err(err);
            }
        };

        if from_page.is_trans_huge() != to_page.is_trans_huge() || from_page.order() != to_page.order() {
            self.exchanger().putback(from_page);
            self.exchanger().putback(to_page);
            return Err(Errno::InvalidArgument);
        }
        let to_pfn = to_page.pfn();
        from_list.push(from_page);
        to_list.push(to_page);
        Ok(to_pfn)
    }

    /// 交换已收集的页对，列表随后清空（do_exchange_page_list）
    fn do_exchange_page_list(
        &self,
        from_list: &mut Vec<Arc<Page>>,
        to_list: &mut Vec<Arc<Page>>,
        flags: ManageFlags,
    ) -> Result<(), Errno> {
        let exchanger = self.exchanger();
        let nr = from_list.len().min(to_list.len());
        let mut pairs = Vec::new();

        let rc = if pairs.try_reserve_exact(nr).is_err() {
            log::warn!("exchange_pages: no memory for {} pairs", nr);
            Err(Errno::OutOfMemory)
        } else {
            pairs.extend(
                from_list
                    .drain(..nr)
                    .zip(to_list.drain(..nr))
                    .map(|(from, to)| ExchangePair::new(from, to)),
            );
            let mode = (flags & (ManageFlags::MOVE_MT | ManageFlags::MOVE_CONCUR)).migrate_mode();
            if pairs.is_empty() {
                Ok(())
            } else {
                exchanger.exchange_page_list(pairs, mode)
            }
        };

        for page in from_list.drain(..).chain(to_list.drain(..)) {
            exchanger.putback(page);
        }
        rc
    }

    /// mm_manage 系统调用
    pub fn sys_mm_manage(
        &self,
        current: &Arc<Task>,
        pid: Pid,
        nr_pages: usize,
        maxnode: usize,
        old_nodes: &[u64],
        new_nodes: &[u64],
        flags: u32,
    ) -> Result<(), Errno> {
        let old = NodeMask::from_user(old_nodes, maxnode)?;
        let new = NodeMask::from_user(new_nodes, maxnode)?;
        let flags = ManageFlags::from_bits(flags).ok_or(Errno::InvalidArgument)?;

        let task = self.find_target(current, pid)?;
        let mm = task.mm().ok_or(Errno::InvalidArgument)?;
        let from_nid = old.only_node()?;
        let to_nid = new.only_node()?;

        let Some(_guard) = ManageGuard::try_new(&mm) else {
            log::debug!("mm_manage: mm {} is already being managed", mm.id());
            return Ok(());
        };
        // 没有 memcg 的进程属于根 cgroup，不做处理
        let Some(memcg) = mm.mem_cgroup() else {
            return Ok(());
        };

        let mut stats = task.stats.lock();
        self.balancer
            .mm_manage(memcg, from_nid, to_nid, nr_pages, flags, &mut stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cred_permission() {
        let alice = Cred::user(1000);
        let bob = Cred::user(1001);
        assert!(alice.may_move_memory_of(&alice));
        assert!(!alice.may_move_memory_of(&bob));
        assert!(Cred::root().may_move_memory_of(&bob));

        let setuid = Cred {
            suid: 1000,
            ..Cred::user(1001)
        };
        assert!(alice.may_move_memory_of(&setuid));
    }

    #[test]
    fn test_node_mask_from_user() {
        let mask = NodeMask::from_user(&[0b10], 3).unwrap();
        assert_eq!(mask.first_node(), Some(1));
        assert_eq!(mask.only_node(), Ok(1));

        // maxnode - 1 位之外的位被忽略
        let mask = NodeMask::from_user(&[0b110], 3).unwrap();
        assert_eq!(mask.weight(), 1);

        assert_eq!(NodeMask::from_user(&[1], 0), Ok(NodeMask::default()));
        assert_eq!(NodeMask::from_user(&[1], 70), Err(Errno::BadAddress));
        assert_eq!(NodeMask::from_user(&[1, 1], 70), Err(Errno::InvalidArgument));
        assert_eq!(NodeMask::from_user(&[0b11], 3).unwrap().only_node(), Err(Errno::InvalidArgument));
    }

    #[test]
    fn test_store_status() {
        let mut status = [7; 4];
        store_status(&mut status, 1, 0, 2).unwrap();
        assert_eq!(status, [7, 0, 0, 7]);
        assert_eq!(store_status(&mut status, 3, 0, 2), Err(Errno::BadAddress));
        assert_eq!(syscall_ret(Err(Errno::NoSuchProcess)), -3);
    }
}
