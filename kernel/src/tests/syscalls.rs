//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! exchange_pages 与 mm_manage 系统调用

use std::sync::Arc;

use super::{filled_with, Fixture, RecordingMigrator, BASE, HPAGE_SIZE, VMA_SIZE};
use crate::config::PAGE_SIZE;
use crate::errno::Errno;
use crate::mm::filemap::{AddressSpace, MigrateOp};
use crate::mm::manage::{ManageFlags, NodeBalancer};
use crate::mm::rmap::{Mm, Vma};
use crate::syscall::{syscall_ret, Cred, MmSyscalls, Task, TaskTable};

const PID: u32 = 100;

struct Env {
    fx: Fixture,
    tasks: Arc<TaskTable>,
    task: Arc<Task>,
    sys: MmSyscalls,
}

fn env() -> Env {
    let fx = Fixture::new();
    let tasks = Arc::new(TaskTable::new());
    let task = Task::new(PID, Cred::user(1000), Some(fx.mm.clone()));
    tasks.insert(task.clone());
    let balancer = NodeBalancer::new(fx.exchanger.clone(), RecordingMigrator::new(&fx, false));
    let sys = MmSyscalls::new(tasks.clone(), balancer);
    Env { fx, tasks, task, sys }
}

#[test]
fn test_exchange_pages_status() {
    let env = env();
    let fx = &env.fx;
    let a0 = fx.map_anon(BASE, 0, 0, 0x10, false);
    let a1 = fx.map_anon(BASE + PAGE_SIZE, 0, 0, 0x11, false);
    let b0 = fx.map_anon(BASE + HPAGE_SIZE, 1, 0, 0x20, false);
    let b1 = fx.map_anon(BASE + HPAGE_SIZE + PAGE_SIZE, 1, 0, 0x21, false);
    let unmapped = BASE + 2 * PAGE_SIZE;
    let outside = 0x1000;

    let from = [BASE, unmapped, BASE + PAGE_SIZE, outside];
    let to = [BASE + HPAGE_SIZE, BASE + HPAGE_SIZE + PAGE_SIZE, BASE + HPAGE_SIZE + PAGE_SIZE, BASE + HPAGE_SIZE];
    let mut status = [1; 4];
    env.sys
        .sys_exchange_pages(&env.task, 0, &from, &to, &mut status, ManageFlags::MOVE.bits())
        .unwrap();

    // 失败项各自带错误码，其余项为 0
    assert_eq!(
        status,
        [
            0,
            Errno::NoSuchFileOrDirectory.as_neg_i32(),
            0,
            Errno::BadAddress.as_neg_i32()
        ]
    );
    assert_eq!(fx.mm.translate(BASE), Some(b0.pfn()));
    assert_eq!(fx.mm.translate(BASE + PAGE_SIZE), Some(b1.pfn()));
    assert_eq!(fx.mm.translate(BASE + HPAGE_SIZE), Some(a0.pfn()));
    assert!(filled_with(&b0, 0x10) && filled_with(&a1, 0x21));
    assert_eq!(fx.nr_isolated(), 0);
}

#[test]
fn test_exchange_pages_failed_pair_in_batch() {
    let env = env();
    let fx = &env.fx;
    // from 为页缓存页的一对在交换时失败
    let file_base = BASE + VMA_SIZE;
    let file = AddressSpace::new(11, MigrateOp::Buffer, false);
    fx.mm
        .add_vma(Vma::new_file(file_base, file_base + VMA_SIZE, 0, file.clone()))
        .unwrap();
    let cached = fx.mem_map.alloc_page(0, 0);
    cached.set_mem_cgroup(Some(fx.memcg.clone()));
    cached.fill(0x30);
    file.add_to_page_cache(&cached, 0, &fx.topology).unwrap();
    fx.mm.map_page(file_base, &cached).unwrap();
    cached.put_page();
    fx.lru.add(&cached);

    let anon = fx.map_anon(BASE + HPAGE_SIZE, 1, 0, 0x31, false);
    let a = fx.map_anon(BASE, 0, 0, 0x40, false);
    let b = fx.map_anon(BASE + HPAGE_SIZE + PAGE_SIZE, 1, 0, 0x41, false);

    let from = [file_base, BASE + PAGE_SIZE, BASE];
    let to = [BASE + HPAGE_SIZE, BASE + HPAGE_SIZE, BASE + HPAGE_SIZE + PAGE_SIZE];
    let mut status = [12345; 3];
    let rc = env
        .sys
        .sys_exchange_pages(&env.task, 0, &from, &to, &mut status, ManageFlags::MOVE.bits());

    // 测试 1: 聚合错误不影响后面的项，每一项都有状态
    assert_eq!(rc, Err(Errno::BadAddress));
    assert_eq!(
        status,
        [
            Errno::BadAddress.as_neg_i32(),
            Errno::NoSuchFileOrDirectory.as_neg_i32(),
            0
        ]
    );

    // 测试 2: 失败的一对保持原样，后面的一对已交换
    assert_eq!(fx.mm.translate(file_base), Some(cached.pfn()));
    assert_eq!(fx.mm.translate(BASE + HPAGE_SIZE), Some(anon.pfn()));
    assert!(file.lock_index().holds(0, &cached));
    assert_eq!(fx.mm.translate(BASE), Some(b.pfn()));
    assert_eq!(fx.mm.translate(BASE + HPAGE_SIZE + PAGE_SIZE), Some(a.pfn()));
    assert!(filled_with(&b, 0x40) && filled_with(&a, 0x41));
    assert_eq!(fx.nr_isolated(), 0);
}

#[test]
fn test_exchange_pages_mismatched_sizes() {
    let env = env();
    let fx = &env.fx;
    let small = fx.map_anon(BASE, 0, 0, 0x10, false);
    let huge = fx.map_anon(BASE + HPAGE_SIZE, 1, 9, 0x20, false);

    let mut status = [1];
    env.sys
        .sys_exchange_pages(&env.task, PID, &[BASE], &[BASE + HPAGE_SIZE], &mut status, 0)
        .unwrap();
    assert_eq!(status, [Errno::InvalidArgument.as_neg_i32()]);
    assert!(small.is_lru() && huge.is_lru());
    assert_eq!(fx.nr_isolated(), 0);
}

#[test]
fn test_shared_page_needs_move_all() {
    let env = env();
    let fx = &env.fx;
    // 第二个进程共享同一个 anon_vma 和页
    let mm2 = Mm::new(2, Some(fx.memcg.clone()));
    fx.rmap.register(&mm2);
    mm2.add_vma(Vma::new_anon(BASE, BASE + VMA_SIZE, fx.anon_vma.clone()))
        .unwrap();
    let shared = fx.map_anon(BASE, 0, 0, 0x10, false);
    mm2.map_page(BASE, &shared).unwrap();
    let other = fx.map_anon(BASE + HPAGE_SIZE, 1, 0, 0x20, false);
    assert_eq!(shared.mapcount(), 2);

    // 测试 1: 普通调用拒绝共享页
    let mut status = [1];
    env.sys
        .sys_exchange_pages(&env.task, 0, &[BASE], &[BASE + HPAGE_SIZE], &mut status, ManageFlags::MOVE.bits())
        .unwrap();
    assert_eq!(status, [Errno::PermissionDenied.as_neg_i32()]);

    // 测试 2: MOVE_ALL 需要 CAP_SYS_NICE
    let flags = (ManageFlags::MOVE | ManageFlags::MOVE_ALL).bits();
    assert_eq!(
        env.sys
            .sys_exchange_pages(&env.task, 0, &[BASE], &[BASE + HPAGE_SIZE], &mut status, flags),
        Err(Errno::OperationNotPermitted)
    );

    // 测试 3: root 代为交换，两个进程的页表项都指向新页
    let root = Task::new(1, Cred::root(), None);
    env.sys
        .sys_exchange_pages(&root, PID, &[BASE], &[BASE + HPAGE_SIZE], &mut status, flags)
        .unwrap();
    assert_eq!(status, [0]);
    assert_eq!(fx.mm.translate(BASE), Some(other.pfn()));
    assert_eq!(mm2.translate(BASE), Some(other.pfn()));
    assert_eq!(other.mapcount(), 2);
    assert_eq!(shared.mapcount(), 1);
    assert_eq!(fx.nr_isolated(), 0);
}

#[test]
fn test_exchange_pages_permission() {
    let env = env();
    let from = [BASE];
    let to = [BASE + HPAGE_SIZE];
    let mut status = [1];

    let stranger = Task::new(200, Cred::user(2000), None);
    let rc = env.sys.sys_exchange_pages(&stranger, PID, &from, &to, &mut status, 0);
    assert_eq!(rc, Err(Errno::OperationNotPermitted));
    assert_eq!(syscall_ret(rc), -1);

    assert_eq!(
        env.sys.sys_exchange_pages(&env.task, 999, &from, &to, &mut status, 0),
        Err(Errno::NoSuchProcess)
    );
    assert_eq!(
        env.sys
            .sys_exchange_pages(&env.task, 0, &from, &to, &mut status, ManageFlags::EXCHANGE.bits()),
        Err(Errno::InvalidArgument)
    );

    // 内核线程没有 mm
    env.tasks.insert(Task::new(300, Cred::user(1000), None));
    assert_eq!(
        env.sys.sys_exchange_pages(&env.task, 300, &from, &to, &mut status, 0),
        Err(Errno::InvalidArgument)
    );
    assert_eq!(status, [1]);
}

#[test]
fn test_mm_manage_exchanges_and_records_stats() {
    let env = env();
    let fx = &env.fx;
    for i in 0..4 {
        fx.map_anon(BASE + i * PAGE_SIZE, 0, 0, i as u8, true);
        fx.map_anon(BASE + HPAGE_SIZE + i * PAGE_SIZE, 1, 0, 0x80, false);
    }
    fx.memcg.set_max_size_node(1, Some(4));

    let flags = (ManageFlags::MOVE | ManageFlags::EXCHANGE).bits();
    env.sys
        .sys_mm_manage(&env.task, 0, 16, 3, &[0b01], &[0b10], flags)
        .unwrap();
    let stats = env.task.manage_stats();
    assert_eq!(stats.nr_exchanges, 1);
    assert_eq!(stats.nr_exchange_base_pages, 4);

    // 统计跨调用累积；节点 0 已没有热页，第二次不再交换
    env.sys
        .sys_mm_manage(&env.task, 0, 16, 3, &[0b01], &[0b10], flags)
        .unwrap();
    let stats = env.task.manage_stats();
    assert_eq!(stats.s2f.nr_migrations, 2);
    assert_eq!(stats.nr_exchanges, 1);
    assert_eq!(fx.nr_isolated(), 0);
}

#[test]
fn test_mm_manage_arguments() {
    let env = env();
    let flags = ManageFlags::MOVE.bits();

    // 测试 1: 掩码必须各含一个节点
    assert_eq!(
        env.sys.sys_mm_manage(&env.task, 0, 16, 3, &[0b11], &[0b10], flags),
        Err(Errno::InvalidArgument)
    );
    assert_eq!(
        env.sys.sys_mm_manage(&env.task, 0, 16, 3, &[0b01], &[0], flags),
        Err(Errno::InvalidArgument)
    );
    // 测试 2: 掩码比 maxnode 短
    assert_eq!(
        env.sys.sys_mm_manage(&env.task, 0, 16, 129, &[0b01], &[0b10], flags),
        Err(Errno::BadAddress)
    );
    // 测试 3: 未知标志位
    assert_eq!(
        env.sys.sys_mm_manage(&env.task, 0, 16, 3, &[0b01], &[0b10], 1 << 31),
        Err(Errno::InvalidArgument)
    );
    // 测试 4: 节点不在线
    assert_eq!(
        env.sys.sys_mm_manage(&env.task, 0, 16, 8, &[0b01], &[0b100], flags),
        Err(Errno::InvalidArgument)
    );
}

#[test]
fn test_mm_manage_is_not_reentrant() {
    let env = env();
    let fx = &env.fx;
    for i in 0..4 {
        fx.map_anon(BASE + i * PAGE_SIZE, 0, 0, 0, true);
        fx.map_anon(BASE + HPAGE_SIZE + i * PAGE_SIZE, 1, 0, 0, false);
    }
    fx.memcg.set_max_size_node(1, Some(4));
    let flags = (ManageFlags::MOVE | ManageFlags::EXCHANGE).bits();

    assert!(fx.mm.try_begin_manage());
    env.sys
        .sys_mm_manage(&env.task, 0, 16, 3, &[0b01], &[0b10], flags)
        .unwrap();
    assert_eq!(env.task.manage_stats().nr_exchanges, 0);
    fx.mm.end_manage();

    // 标记在调用结束后清除
    env.sys
        .sys_mm_manage(&env.task, 0, 16, 3, &[0b01], &[0b10], flags)
        .unwrap();
    assert_eq!(env.task.manage_stats().nr_exchanges, 1);
    assert!(fx.mm.try_begin_manage());
    fx.mm.end_manage();
}
