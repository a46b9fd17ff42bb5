//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 标准错误代码定义
//!
//! 和 include/uapi/asm-generic/errno-base.h 保持一致，只保留页交换路径
//! 实际会返回的错误码。
//!
//! 页交换路径中错误码的含义：
//! - `EAGAIN`: 暂时性失败（引用计数不符、锁竞争），可以重试
//! - `EBUSY`: 本轮不可处理（回写中、异步模式不能等待）
//! - `ENODEV`: 没有可用的拷贝线程/DMA 通道，或该页对不能走并发路径
//! - `EFAULT`: 批量交换中至少有一对失败（聚合错误）

use core::fmt;

/// 标准错误代码
///
/// 使用方法：
/// ```
/// use mm_exchange::errno::Errno;
///
/// // 系统调用风格，返回负数
/// assert_eq!(Errno::TryAgain.as_neg_i32(), -11);
/// ```
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Errno {
    /// Operation not permitted (EPERM, 1)
    OperationNotPermitted = 1,

    /// No such file or directory (ENOENT, 2)
    NoSuchFileOrDirectory = 2,

    /// No such process (ESRCH, 3)
    NoSuchProcess = 3,

    /// I/O error (EIO, 5)
    IoError = 5,

    /// Try again (EAGAIN, 11)
    TryAgain = 11,

    /// Out of memory (ENOMEM, 12)
    OutOfMemory = 12,

    /// Permission denied (EACCES, 13)
    PermissionDenied = 13,

    /// Bad address (EFAULT, 14)
    BadAddress = 14,

    /// Device or resource busy (EBUSY, 16)
    DeviceOrResourceBusy = 16,

    /// No such device (ENODEV, 19)
    NoSuchDevice = 19,

    /// Invalid argument (EINVAL, 22)
    InvalidArgument = 22,

    /// Function not implemented (ENOSYS, 38)
    FunctionNotImplemented = 38,
}

impl Errno {
    /// 获取错误代码的正数值（用于比较）
    #[inline]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// 获取错误代码的负数值（用于系统调用返回和 status 数组）
    #[inline]
    pub const fn as_neg_i32(self) -> i32 {
        -(self as i32)
    }

    /// 错误码的符号名
    pub const fn name(self) -> &'static str {
        match self {
            Errno::OperationNotPermitted => "EPERM",
            Errno::NoSuchFileOrDirectory => "ENOENT",
            Errno::NoSuchProcess => "ESRCH",
            Errno::IoError => "EIO",
            Errno::TryAgain => "EAGAIN",
            Errno::OutOfMemory => "ENOMEM",
            Errno::PermissionDenied => "EACCES",
            Errno::BadAddress => "EFAULT",
            Errno::DeviceOrResourceBusy => "EBUSY",
            Errno::NoSuchDevice => "ENODEV",
            Errno::InvalidArgument => "EINVAL",
            Errno::FunctionNotImplemented => "ENOSYS",
        }
    }

    /// 是否为可重试的暂时性错误
    #[inline]
    pub const fn is_transient(self) -> bool {
        matches!(self, Errno::TryAgain)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_neg_i32())
    }
}

impl std::error::Error for Errno {}

/// 常用的错误代码常量
pub const EPERM: i32 = 1;
pub const ENOENT: i32 = 2;
pub const ESRCH: i32 = 3;
pub const EIO: i32 = 5;
pub const EAGAIN: i32 = 11;
pub const ENOMEM: i32 = 12;
pub const EACCES: i32 = 13;
pub const EFAULT: i32 = 14;
pub const EBUSY: i32 = 16;
pub const ENODEV: i32 = 19;
pub const EINVAL: i32 = 22;
pub const ENOSYS: i32 = 38;

/// 页迁移成功（对应 MIGRATEPAGE_SUCCESS）
pub const MIGRATEPAGE_SUCCESS: i32 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_values() {
        assert_eq!(Errno::TryAgain.as_i32(), EAGAIN);
        assert_eq!(Errno::DeviceOrResourceBusy.as_neg_i32(), -EBUSY);
        assert_eq!(Errno::NoSuchDevice.name(), "ENODEV");
        assert!(Errno::TryAgain.is_transient());
        assert!(!Errno::DeviceOrResourceBusy.is_transient());
    }
}
