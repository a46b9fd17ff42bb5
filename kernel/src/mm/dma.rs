//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! DMA 拷贝通道池
//!
//! 通道由 [`DmaProvider`] 提供（硬件驱动或软件实现）。通道池在启用时
//! 一次性申请至多 `max_channels` 个通道，停用时全部释放。一次拷贝把
//! 字节平均分给当前持有的通道（通道数向下取 2 的幂），各通道同时提交，
//! 全部完成后才返回。没有通道时返回 `ENODEV`，调用者改用 CPU 拷贝。

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use spin::Mutex;

use crate::errno::Errno;

/// DMA 通道
pub trait DmaChannel: Send + Sync {
    fn name(&self) -> &str;

    /// 提交一次 memcpy 并等待完成
    fn memcpy_sync(&self, dst: &mut [u8], src: &[u8]) -> Result<(), Errno>;
}

/// DMA 通道提供者（dma_request_channel）
pub trait DmaProvider: Send + Sync {
    /// 申请第 `index` 个通道，没有更多通道时返回 None
    fn request_channel(&self, index: usize) -> Option<Arc<dyn DmaChannel>>;
}

/// 用 CPU 完成 memcpy 的软件通道
#[derive(Debug)]
pub struct SoftwareChannel {
    name: String,
}

impl DmaChannel for SoftwareChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn memcpy_sync(&self, dst: &mut [u8], src: &[u8]) -> Result<(), Errno> {
        if dst.len() != src.len() {
            return Err(Errno::InvalidArgument);
        }
        dst.copy_from_slice(src);
        Ok(())
    }
}

/// 软件 DMA 提供者，最多提供 `nr_channels` 个通道
#[derive(Debug)]
pub struct SoftwareDma {
    nr_channels: usize,
}

impl SoftwareDma {
    pub fn new(nr_channels: usize) -> Arc<Self> {
        Arc::new(Self { nr_channels })
    }
}

impl DmaProvider for SoftwareDma {
    fn request_channel(&self, index: usize) -> Option<Arc<dyn DmaChannel>> {
        if index >= self.nr_channels {
            return None;
        }
        Some(Arc::new(SoftwareChannel {
            name: format!("dma{}chan{}", index / 8, index % 8),
        }))
    }
}

/// 不大于 n 的最大 2 的幂，n 为 0 时返回 0
#[inline]
fn rounddown_pow_of_two(n: usize) -> usize {
    if n == 0 {
        0
    } else {
        1 << (usize::BITS - 1 - n.leading_zeros())
    }
}

/// DMA 通道池
pub struct ChannelPool {
    provider: Arc<dyn DmaProvider>,
    channels: Mutex<Vec<Arc<dyn DmaChannel>>>,
    max_channels: AtomicUsize,
}

impl ChannelPool {
    pub fn new(provider: Arc<dyn DmaProvider>, max_channels: usize) -> Self {
        Self {
            provider,
            channels: Mutex::new(Vec::new()),
            max_channels: AtomicUsize::new(max_channels),
        }
    }

    /// 申请全部通道，返回持有的通道数
    pub fn acquire_all(&self) -> usize {
        let max = self.max_channels.load(Ordering::Acquire);
        let mut channels = self.channels.lock();
        while channels.len() < max {
            match self.provider.request_channel(channels.len()) {
                Some(chan) => channels.push(chan),
                None => break,
            }
        }
        log::info!("dma: {} channels acquired", channels.len());
        channels.len()
    }

    /// 释放全部通道
    pub fn release_all(&self) {
        let mut channels = self.channels.lock();
        if !channels.is_empty() {
            log::info!("dma: {} channels released", channels.len());
        }
        channels.clear();
    }

    /// 是否持有通道
    pub fn is_enabled(&self) -> bool {
        !self.channels.lock().is_empty()
    }

    /// 持有的通道数
    pub fn nr_channels(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn max_channels(&self) -> usize {
        self.max_channels.load(Ordering::Acquire)
    }

    /// 修改通道数上限；已启用时按新上限重新申请
    pub fn set_max_channels(&self, max: usize) {
        self.max_channels.store(max, Ordering::Release);
        if self.is_enabled() {
            self.release_all();
            self.acquire_all();
        }
    }

    /// 用当前持有的通道拷贝 `src` 到 `dst`
    pub fn copy(&self, dst: &mut [u8], src: &[u8]) -> Result<(), Errno> {
        if dst.len() != src.len() {
            return Err(Errno::InvalidArgument);
        }
        let channels: Vec<Arc<dyn DmaChannel>> = self.channels.lock().clone();
        let nr = rounddown_pow_of_two(channels.len());
        if nr == 0 {
            return Err(Errno::NoSuchDevice);
        }
        if dst.len() % nr != 0 {
            return Err(Errno::InvalidArgument);
        }
        let chunk = dst.len() / nr;
        if chunk == 0 {
            return Err(Errno::InvalidArgument);
        }

        // 每个通道一个提交者，等待全部完成后汇总第一个错误
        let results: Vec<Result<(), Errno>> = thread::scope(|scope| {
            let handles: Vec<_> = channels
                .iter()
                .zip(dst.chunks_mut(chunk))
                .zip(src.chunks(chunk))
                .map(|((chan, d), s)| scope.spawn(move || (chan.name().to_owned(), chan.memcpy_sync(d, s))))
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok((_, Ok(()))) => Ok(()),
                    Ok((name, Err(err))) => {
                        log::warn!("dma: {} failed: {}", name, err);
                        Err(err)
                    }
                    Err(_) => Err(Errno::IoError),
                })
                .collect()
        });
        results.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounddown_pow_of_two() {
        assert_eq!(rounddown_pow_of_two(0), 0);
        assert_eq!(rounddown_pow_of_two(1), 1);
        assert_eq!(rounddown_pow_of_two(3), 2);
        assert_eq!(rounddown_pow_of_two(16), 16);
        assert_eq!(rounddown_pow_of_two(17), 16);
    }

    #[test]
    fn test_channel_pool_lifecycle() {
        let pool = ChannelPool::new(SoftwareDma::new(6), 16);
        let src: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let mut dst = vec![0u8; 4096];

        assert_eq!(pool.copy(&mut dst, &src), Err(Errno::NoSuchDevice));
        assert_eq!(pool.acquire_all(), 6);
        pool.copy(&mut dst, &src).unwrap();
        assert_eq!(dst, src);

        pool.set_max_channels(2);
        assert_eq!(pool.nr_channels(), 2);
        pool.release_all();
        assert!(!pool.is_enabled());
    }

    /// 记录同时在拷贝的通道数，等到全部通道都提交后才完成
    struct GatedChannel {
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        expected: usize,
    }

    impl DmaChannel for GatedChannel {
        fn name(&self) -> &str {
            "gated"
        }

        fn memcpy_sync(&self, dst: &mut [u8], src: &[u8]) -> Result<(), Errno> {
            let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
            self.peak.fetch_max(now, Ordering::AcqRel);
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
            while self.peak.load(Ordering::Acquire) < self.expected && std::time::Instant::now() < deadline {
                thread::yield_now();
            }
            dst.copy_from_slice(src);
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            Ok(())
        }
    }

    struct GatedDma {
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        nr_channels: usize,
    }

    impl DmaProvider for GatedDma {
        fn request_channel(&self, index: usize) -> Option<Arc<dyn DmaChannel>> {
            (index < self.nr_channels).then(|| {
                Arc::new(GatedChannel {
                    in_flight: self.in_flight.clone(),
                    peak: self.peak.clone(),
                    expected: self.nr_channels,
                }) as Arc<dyn DmaChannel>
            })
        }
    }

    #[test]
    fn test_channels_copy_in_parallel() {
        let peak = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(GatedDma {
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: peak.clone(),
            nr_channels: 4,
        });
        let pool = ChannelPool::new(provider, 4);
        assert_eq!(pool.acquire_all(), 4);

        let src: Vec<u8> = (0..4096u32).map(|i| (i % 13) as u8).collect();
        let mut dst = vec![0u8; 4096];
        pool.copy(&mut dst, &src).unwrap();

        // 四个通道同时在拷贝
        assert_eq!(peak.load(Ordering::Acquire), 4);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_channel_error_is_reported() {
        struct Broken;
        impl DmaChannel for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            fn memcpy_sync(&self, _dst: &mut [u8], _src: &[u8]) -> Result<(), Errno> {
                Err(Errno::IoError)
            }
        }
        struct OneBroken;
        impl DmaProvider for OneBroken {
            fn request_channel(&self, index: usize) -> Option<Arc<dyn DmaChannel>> {
                match index {
                    0 => Some(Arc::new(SoftwareChannel { name: "ok".into() })),
                    1 => Some(Arc::new(Broken)),
                    _ => None,
                }
            }
        }

        let pool = ChannelPool::new(Arc::new(OneBroken), 8);
        assert_eq!(pool.acquire_all(), 2);
        let src = vec![7u8; 4096];
        let mut dst = vec![0u8; 4096];
        assert_eq!(pool.copy(&mut dst, &src), Err(Errno::IoError));
        // 正常通道的那一半照样完成
        assert!(dst[..2048].iter().all(|&b| b == 7));
    }
}
