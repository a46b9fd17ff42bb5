//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 页交换子系统配置
//!
//! 编译期常量放在本文件顶部；运行时可调的参数（相当于 sysctl）由
//! [`ExchangeConfig`] 描述，可以从 TOML 文本加载：
//!
//! ```toml
//! [copy]
//! limit_mt_num = 4
//!
//! [dma]
//! enabled = false
//! max_channels = 16
//!
//! [exchange]
//! batch_size = 16
//! retries = 3
//! concur_passes = 10
//! ```

use core::fmt;

use serde::Deserialize;

// ============================================================
// 内存配置
// ============================================================

/// 页大小
pub const PAGE_SIZE: usize = 4096;

/// 页大小位移
pub const PAGE_SHIFT: usize = 12;

/// PMD 大页的 order（2MB）
pub const HPAGE_PMD_ORDER: u32 = 9;

/// PMD 大页包含的基本页数
pub const HPAGE_PMD_NR: usize = 1 << HPAGE_PMD_ORDER;

// ============================================================
// 并行拷贝配置
// ============================================================

/// 单次拷贝最多使用的工作线程数
pub const MAX_COPY_THREADS: usize = 32;

/// 默认拷贝线程数上限（limit_mt_num）
pub const DEFAULT_LIMIT_MT_NUM: usize = 4;

/// 默认 DMA 通道数上限
pub const DEFAULT_DMA_CHANNELS: usize = 16;

// ============================================================
// 页交换配置
// ============================================================

/// 每批并发交换的页对数（migration_batch_size）
pub const DEFAULT_MIGRATION_BATCH_SIZE: usize = 16;

/// 串行路径遇到 EAGAIN 时的重试次数
pub const DEFAULT_EXCHANGE_RETRIES: usize = 3;

/// 并发交换的最大轮数
pub const DEFAULT_CONCUR_PASSES: usize = 10;

/// 并发交换中从 trylock 升级为阻塞加锁的轮次
pub const CONCUR_FORCE_LOCK_PASS: usize = 2;

/// 并行拷贝配置
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CopyConfig {
    /// 拷贝线程数上限，实际值还受目标节点 CPU 数限制
    pub limit_mt_num: usize,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            limit_mt_num: DEFAULT_LIMIT_MT_NUM,
        }
    }
}

/// DMA 后端配置
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DmaConfig {
    /// 是否启用 DMA 通道（切换时获取/释放全部通道）
    pub enabled: bool,
    /// 最多持有的通道数
    pub max_channels: usize,
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_channels: DEFAULT_DMA_CHANNELS,
        }
    }
}

/// 页交换配置
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExchangeParams {
    /// 并发交换每批的页对数，0 表示不分批
    pub batch_size: usize,
    /// 串行路径 EAGAIN 重试次数
    pub retries: usize,
    /// 并发路径最多执行的轮数
    pub concur_passes: usize,
}

impl Default for ExchangeParams {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_MIGRATION_BATCH_SIZE,
            retries: DEFAULT_EXCHANGE_RETRIES,
            concur_passes: DEFAULT_CONCUR_PASSES,
        }
    }
}

/// 页交换子系统的全部运行时参数
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExchangeConfig {
    pub copy: CopyConfig,
    pub dma: DmaConfig,
    pub exchange: ExchangeParams,
}

/// 配置加载错误
#[derive(Debug)]
pub enum ConfigError {
    /// TOML 语法或字段错误
    Parse(toml::de::Error),
    /// 字段取值非法
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse(e) => write!(f, "配置解析失败: {}", e),
            ConfigError::Invalid(what) => write!(f, "配置取值非法: {}", what),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Parse(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Parse(err)
    }
}

impl ExchangeConfig {
    /// 从 TOML 文本加载配置，缺省字段取默认值
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ExchangeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 检查取值范围
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.copy.limit_mt_num == 0 || self.copy.limit_mt_num > MAX_COPY_THREADS {
            return Err(ConfigError::Invalid("copy.limit_mt_num 必须在 1..=32"));
        }
        if self.exchange.concur_passes == 0 {
            return Err(ConfigError::Invalid("exchange.concur_passes 不能为 0"));
        }
        Ok(())
    }
}
