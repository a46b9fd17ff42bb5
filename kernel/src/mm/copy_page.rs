//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 并行页拷贝
//!
//! 把一页（或一批页）的拷贝/交换切成若干块，分给绑定在目标节点本地
//! CPU 上的工作线程，全部完成后才返回。另一个后端把字节分给 DMA
//! 通道。
//!
//! 工作线程数的确定：
//! - 单页：`min(limit_mt_num, 目标节点 CPU 数)`，大于 1 时向下取偶数，
//!   每个线程处理 `size / n` 字节，不能整除时拒绝
//! - 页列表：`min(limit_mt_num, 目标节点 CPU 数, 页数)`，每个线程处理
//!   一段连续的整页
//!
//! 线程数不在 `1..=MAX_COPY_THREADS` 内时返回 `ENODEV`。

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use spin::{Mutex, MutexGuard};

use crate::config::{ExchangeConfig, MAX_COPY_THREADS, PAGE_SIZE};
use crate::errno::Errno;
use crate::mm::dma::{ChannelPool, DmaProvider};
use crate::mm::migrate::MigrateFlags;
use crate::mm::numa::NumaTopology;
use crate::mm::page_desc::Page;

/// 拷贝方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// 单向拷贝 from → to
    Copy,
    /// 交换两边的内容
    Exchange,
}

/// 交给一个工作线程的一段字节
#[derive(Debug)]
pub struct CopyWorkItem<'a> {
    to: &'a mut [u8],
    from: &'a mut [u8],
}

impl<'a> CopyWorkItem<'a> {
    pub fn new(to: &'a mut [u8], from: &'a mut [u8]) -> Self {
        debug_assert_eq!(to.len(), from.len());
        Self { to, from }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.to.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.to.is_empty()
    }

    fn run(self, mode: CopyMode) {
        match mode {
            CopyMode::Copy => self.to.copy_from_slice(self.from),
            CopyMode::Exchange => self.to.swap_with_slice(self.from),
        }
    }
}

/// 单线程处理一对页，按基本页逐个进行（copy_highpage / exchange_huge_page）
pub fn copy_page_single(to: &Page, from: &Page, mode: CopyMode) {
    assert_eq!(to.size(), from.size(), "copy: page size mismatch");
    let mut to_data = to.data();
    let mut from_data = from.data();
    for (t, f) in to_data
        .chunks_mut(PAGE_SIZE)
        .zip(from_data.chunks_mut(PAGE_SIZE))
    {
        CopyWorkItem::new(t, f).run(mode);
    }
}

/// 把当前线程绑定到 `cpu`，失败只记录日志
#[cfg(target_os = "linux")]
fn pin_current_thread(cpu: usize) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    let pinned = set
        .set(cpu)
        .and_then(|_| sched_setaffinity(Pid::from_raw(0), &set));
    if let Err(err) = pinned {
        log::debug!("copy: cannot pin kcopy worker to cpu {}: {}", cpu, err);
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_current_thread(_cpu: usize) {}

type Bucket<'a> = Mutex<Option<Vec<CopyWorkItem<'a>>>>;

fn run_bucket(bucket: &Bucket<'_>, mode: CopyMode) {
    if let Some(items) = bucket.lock().take() {
        for item in items {
            item.run(mode);
        }
    }
}

/// 每个桶交给一个绑定到 `cpus[i]` 的工作线程，等待全部完成
///
/// 线程创建失败时由当前线程处理该桶。
fn dispatch(cpus: &[usize], buckets: Vec<Vec<CopyWorkItem<'_>>>, mode: CopyMode) {
    let slots: Vec<Bucket<'_>> = buckets.into_iter().map(|b| Mutex::new(Some(b))).collect();

    thread::scope(|s| {
        for (slot, &cpu) in slots.iter().zip(cpus.iter().cycle()) {
            let spawned = thread::Builder::new()
                .name(format!("kcopy/{}", cpu))
                .spawn_scoped(s, move || {
                    pin_current_thread(cpu);
                    run_bucket(slot, mode);
                });
            if let Err(err) = spawned {
                log::warn!("copy: cannot spawn worker for cpu {}: {}", cpu, err);
                run_bucket(slot, mode);
            }
        }
    });
}

/// 并行拷贝引擎
pub struct CopyEngine {
    topology: Arc<NumaTopology>,
    limit_mt_num: AtomicUsize,
    dma: ChannelPool,
}

impl CopyEngine {
    /// 按配置创建；配置启用 DMA 时立即申请通道
    pub fn new(
        topology: Arc<NumaTopology>,
        dma_provider: Arc<dyn DmaProvider>,
        config: &ExchangeConfig,
    ) -> Self {
        let engine = Self {
            topology,
            limit_mt_num: AtomicUsize::new(config.copy.limit_mt_num),
            dma: ChannelPool::new(dma_provider, config.dma.max_channels),
        };
        if config.dma.enabled {
            engine.dma.acquire_all();
        }
        engine
    }

    #[inline]
    pub fn topology(&self) -> &Arc<NumaTopology> {
        &self.topology
    }

    pub fn limit_mt_num(&self) -> usize {
        self.limit_mt_num.load(Ordering::Acquire)
    }

    /// 修改线程数上限（sysctl limit_mt_num）
    pub fn set_limit_mt_num(&self, limit: usize) -> Result<(), Errno> {
        if limit == 0 || limit > MAX_COPY_THREADS {
            return Err(Errno::InvalidArgument);
        }
        self.limit_mt_num.store(limit, Ordering::Release);
        Ok(())
    }

    /// 启用或停用 DMA 后端，切换时申请或释放全部通道
    pub fn set_dma_enabled(&self, enabled: bool) {
        if enabled == self.dma.is_enabled() {
            return;
        }
        if enabled {
            self.dma.acquire_all();
        } else {
            self.dma.release_all();
        }
    }

    /// DMA 通道池
    #[inline]
    pub fn dma(&self) -> &ChannelPool {
        &self.dma
    }

    /// 多线程处理一对页（copy_page_multithread / exchange_page_mthread）
    pub fn copy_page_mt(&self, to: &Page, from: &Page, mode: CopyMode) -> Result<(), Errno> {
        if core::ptr::eq(to, from) || to.size() != from.size() {
            return Err(Errno::InvalidArgument);
        }
        let cpus = self.topology.cpus_of_node(to.nid());
        let mut nr_threads = self.limit_mt_num().min(cpus.len());
        if nr_threads > 1 {
            nr_threads = (nr_threads / 2) * 2;
        }
        if nr_threads < 1 || nr_threads > MAX_COPY_THREADS {
            return Err(Errno::NoSuchDevice);
        }
        let size = from.size();
        if size % nr_threads != 0 {
            return Err(Errno::InvalidArgument);
        }
        let chunk_size = size / nr_threads;

        let mut to_data = to.data();
        let mut from_data = from.data();
        let buckets = to_data
            .chunks_mut(chunk_size)
            .zip(from_data.chunks_mut(chunk_size))
            .map(|(t, f)| vec![CopyWorkItem::new(t, f)])
            .collect();
        dispatch(&cpus[..nr_threads], buckets, mode);
        Ok(())
    }

    /// 多线程处理一批页对（exchange_page_lists_mthread）
    ///
    /// 所有页必须同 order；每个线程处理一段连续的整页。
    pub fn copy_page_lists_mt(
        &self,
        to: &[Arc<Page>],
        from: &[Arc<Page>],
        mode: CopyMode,
    ) -> Result<(), Errno> {
        if to.len() != from.len() {
            return Err(Errno::InvalidArgument);
        }
        let Some(first) = from.first() else {
            return Ok(());
        };
        let order = first.order();
        if to.iter().chain(from.iter()).any(|p| p.order() != order) {
            return Err(Errno::InvalidArgument);
        }

        let nr_pages = from.len();
        let cpus = self.topology.cpus_of_node(to[0].nid());
        let nr_threads = self.limit_mt_num().min(cpus.len()).min(nr_pages);
        if nr_threads < 1 || nr_threads > MAX_COPY_THREADS {
            return Err(Errno::NoSuchDevice);
        }

        let mut to_guards: Vec<MutexGuard<'_, Box<[u8]>>> = Vec::with_capacity(nr_pages);
        let mut from_guards: Vec<MutexGuard<'_, Box<[u8]>>> = Vec::with_capacity(nr_pages);
        for (t, f) in to.iter().zip(from.iter()) {
            if Arc::ptr_eq(t, f) {
                return Err(Errno::InvalidArgument);
            }
            to_guards.push(t.data());
            from_guards.push(f.data());
        }

        let mut items = to_guards
            .iter_mut()
            .zip(from_guards.iter_mut())
            .map(|(t, f)| CopyWorkItem::new(&mut t[..], &mut f[..]));

        // 第 i 个线程处理 [i*K/n, (i+1)*K/n)
        let buckets = (0..nr_threads)
            .map(|i| {
                let len = (i + 1) * nr_pages / nr_threads - i * nr_pages / nr_threads;
                items.by_ref().take(len).collect::<Vec<_>>()
            })
            .collect();
        dispatch(&cpus[..nr_threads], buckets, mode);
        Ok(())
    }

    /// 用 DMA 通道拷贝一批页对，只支持单向拷贝
    pub fn copy_page_lists_dma(
        &self,
        to: &[Arc<Page>],
        from: &[Arc<Page>],
        mode: CopyMode,
    ) -> Result<(), Errno> {
        if mode == CopyMode::Exchange || !self.dma.is_enabled() {
            return Err(Errno::NoSuchDevice);
        }
        if to.len() != from.len() {
            return Err(Errno::InvalidArgument);
        }
        for (t, f) in to.iter().zip(from.iter()) {
            if Arc::ptr_eq(t, f) || t.size() != f.size() {
                return Err(Errno::InvalidArgument);
            }
            let mut to_data = t.data();
            let from_data = f.data();
            self.dma.copy(&mut to_data, &from_data)?;
        }
        Ok(())
    }

    /// 按修饰位选择后端处理一批页对
    ///
    /// 先试 DMA（若要求），再试多线程（若要求）。返回 `ENODEV` 表示
    /// 没有可用的加速后端，调用者应逐页单线程处理。
    pub fn copy_pages(
        &self,
        to: &[Arc<Page>],
        from: &[Arc<Page>],
        mode: CopyMode,
        flags: MigrateFlags,
    ) -> Result<(), Errno> {
        let mut rc = Err(Errno::NoSuchDevice);
        if flags.contains(MigrateFlags::DMA) {
            rc = self.copy_page_lists_dma(to, from, mode);
        }
        if rc.is_err() && flags.contains(MigrateFlags::MT) {
            rc = match (to, from) {
                ([t], [f]) => self.copy_page_mt(t, f, mode),
                _ => self.copy_page_lists_mt(to, from, mode),
            };
        }
        rc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::dma::SoftwareDma;
    use crate::mm::page_desc::MemMap;

    fn engine(cpus: usize, limit: usize) -> CopyEngine {
        let topo = Arc::new(NumaTopology::new(vec![(0..cpus).collect(), (0..cpus).collect()]));
        let mut config = ExchangeConfig::default();
        config.copy.limit_mt_num = limit;
        CopyEngine::new(topo, SoftwareDma::new(4), &config)
    }

    fn pattern(page: &Page, seed: u8) {
        let mut data = page.data();
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(31).wrapping_add(seed);
        }
    }

    #[test]
    fn test_single_page_worker_counts() {
        let mem_map = MemMap::new(0);
        for (cpus, limit) in [(1, 1), (2, 2), (4, 4), (8, 3)] {
            let engine = engine(cpus, limit);
            let from = mem_map.alloc_page(0, 0);
            let to = mem_map.alloc_page(1, 0);
            pattern(&from, 7);
            let expected = from.read_all();

            engine.copy_page_mt(&to, &from, CopyMode::Copy).unwrap();
            assert_eq!(to.read_all(), expected);
        }
    }

    #[test]
    fn test_single_page_exchange() {
        let mem_map = MemMap::new(0);
        let engine = engine(4, 4);
        let a = mem_map.alloc_page(0, 0);
        let b = mem_map.alloc_page(1, 0);
        pattern(&a, 1);
        pattern(&b, 2);
        let (old_a, old_b) = (a.read_all(), b.read_all());

        engine.copy_page_mt(&b, &a, CopyMode::Exchange).unwrap();
        assert_eq!(a.read_all(), old_b);
        assert_eq!(b.read_all(), old_a);
    }

    #[test]
    fn test_indivisible_length_rejected() {
        // 6 个 CPU 得到 6 个线程，4096 不能被 6 整除
        let mem_map = MemMap::new(0);
        let engine = engine(6, 6);
        let from = mem_map.alloc_page(0, 0);
        let to = mem_map.alloc_page(1, 0);
        pattern(&from, 3);
        assert_eq!(
            engine.copy_page_mt(&to, &from, CopyMode::Copy),
            Err(Errno::InvalidArgument)
        );
        assert!(to.read_all().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_no_cpus_is_no_device() {
        let topo = Arc::new(NumaTopology::new(vec![vec![0], vec![]]));
        let engine = CopyEngine::new(topo, SoftwareDma::new(0), &ExchangeConfig::default());
        let mem_map = MemMap::new(0);
        let from = mem_map.alloc_page(0, 0);
        let to = mem_map.alloc_page(1, 0);
        assert_eq!(
            engine.copy_page_mt(&to, &from, CopyMode::Copy),
            Err(Errno::NoSuchDevice)
        );
        assert_eq!(
            engine.copy_pages(&[to], &[from], CopyMode::Copy, MigrateFlags::empty()),
            Err(Errno::NoSuchDevice)
        );
    }

    #[test]
    fn test_page_lists() {
        let mem_map = MemMap::new(0);
        let engine = engine(4, 4);
        let from: Vec<_> = (0..7).map(|_| mem_map.alloc_page(0, 0)).collect();
        let to: Vec<_> = (0..7).map(|_| mem_map.alloc_page(1, 0)).collect();
        for (i, (f, t)) in from.iter().zip(to.iter()).enumerate() {
            pattern(f, i as u8);
            pattern(t, 100 + i as u8);
        }
        let old_from: Vec<_> = from.iter().map(|p| p.read_all()).collect();
        let old_to: Vec<_> = to.iter().map(|p| p.read_all()).collect();

        engine
            .copy_page_lists_mt(&to, &from, CopyMode::Exchange)
            .unwrap();
        for i in 0..7 {
            assert_eq!(from[i].read_all(), old_to[i]);
            assert_eq!(to[i].read_all(), old_from[i]);
        }

        let huge = mem_map.alloc_page(1, 9);
        let mut mixed_to = to.clone();
        mixed_to[0] = huge;
        assert_eq!(
            engine.copy_page_lists_mt(&mixed_to, &from, CopyMode::Copy),
            Err(Errno::InvalidArgument)
        );
    }

    #[test]
    fn test_dma_backend() {
        let mem_map = MemMap::new(0);
        let engine = engine(2, 2);
        let from = vec![mem_map.alloc_page(0, 0)];
        let to = vec![mem_map.alloc_page(1, 0)];
        pattern(&from[0], 9);

        assert_eq!(
            engine.copy_page_lists_dma(&to, &from, CopyMode::Copy),
            Err(Errno::NoSuchDevice)
        );
        engine.set_dma_enabled(true);
        assert_eq!(engine.dma().nr_channels(), 4);
        assert_eq!(
            engine.copy_page_lists_dma(&to, &from, CopyMode::Exchange),
            Err(Errno::NoSuchDevice)
        );
        engine
            .copy_pages(&to, &from, CopyMode::Copy, MigrateFlags::DMA)
            .unwrap();
        assert_eq!(to[0].read_all(), from[0].read_all());
        engine.set_dma_enabled(false);
        assert!(!engine.dma().is_enabled());
    }

    #[test]
    fn test_single_threaded_huge_page() {
        let mem_map = MemMap::new(0);
        let a = mem_map.alloc_page(0, 9);
        let b = mem_map.alloc_page(1, 9);
        a.fill(0xaa);
        b.fill(0x55);
        copy_page_single(&b, &a, CopyMode::Exchange);
        assert!(a.read_all().iter().all(|&x| x == 0x55));
        assert!(b.read_all().iter().all(|&x| x == 0xaa));
    }
}
