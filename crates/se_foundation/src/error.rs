// crates/se_foundation/src/error.rs

//! 错误处理模块，定义调度器统一错误类型
//!
//! 提供 `SeError` 枚举和 `SeResult` 类型别名。
//!
//! # 错误分类
//!
//! | 类别 | 含义 | 处理 |
//! |------|------|------|
//! | [`TopologyError`] | 输入河网拓扑不合法 | 初始化失败 |
//! | [`PartitionError`] | 进程数或分组结果不合法 | 初始化失败 |
//! | `MissingUpstream` | 计算时缺少上游交换数据 | 当前时间步失败，不重试 |
//! | `StepFailure` | 子流域计算失败 | 整个运行失败，不跳过 |
//!
//! 调度器本身不做任何自动重试，数值不收敛的重试由计算模块负责。
//!
//! # 示例
//!
//! ```
//! use se_foundation::error::{SeError, SeResult};
//! use se_foundation::SubbasinId;
//!
//! fn check() -> SeResult<()> {
//!     Err(SeError::step_failure(SubbasinId(3), 10, "不收敛"))
//! }
//!
//! let err = check().unwrap_err();
//! assert_eq!(err.kind(), "StepFailure");
//! assert_eq!(err.subbasin(), Some(SubbasinId(3)));
//! assert_eq!(err.timestep(), Some(10));
//! ```

use crate::id::{RankId, SubbasinId};
use std::path::PathBuf;
use thiserror::Error;

/// 统一结果类型
pub type SeResult<T> = Result<T, SeError>;

// ============================================================================
// 拓扑错误
// ============================================================================

/// 河网拓扑错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// 输入为空
    #[error("拓扑输入为空")]
    Empty,

    /// 子流域 ID 使用了保留值 0
    #[error("子流域 ID 不能为 0 (0 保留为出口哨兵)")]
    ReservedId,

    /// 重复 ID
    #[error("重复的子流域 ID: {0}")]
    DuplicateId(SubbasinId),

    /// 下游指向不存在的子流域
    #[error("子流域 {id} 的下游 {downstream} 不存在")]
    UnknownDownstream {
        /// 子流域
        id: SubbasinId,
        /// 引用的下游
        downstream: SubbasinId,
    },

    /// 存在环
    #[error("检测到环路，涉及子流域: {ids:?}")]
    Cycle {
        /// 位于环上 (或只能经由环到达出口) 的子流域
        ids: Vec<SubbasinId>,
    },

    /// 多个出口但未启用多出口模式
    #[error("存在多个出口 {outlets:?}，但未启用多出口模式")]
    MultipleOutlets {
        /// 所有出口
        outlets: Vec<SubbasinId>,
    },

    /// 声明的上游列表与下游指针反推结果不一致
    #[error("子流域 {id} 声明的上游 {declared:?} 与推导结果 {derived:?} 不一致")]
    InconsistentUpstream {
        /// 子流域
        id: SubbasinId,
        /// 声明的上游
        declared: Vec<SubbasinId>,
        /// 由下游指针推导的上游
        derived: Vec<SubbasinId>,
    },
}

// ============================================================================
// 分区错误
// ============================================================================

/// 任务分区错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    /// 进程数为 0
    #[error("进程数必须大于 0")]
    ZeroProcesses,

    /// 进程数超过子流域数
    #[error("进程数 {processes} 超过子流域数 {nodes}")]
    TooManyProcesses {
        /// 进程数
        processes: usize,
        /// 子流域数
        nodes: usize,
    },

    /// 子流域未被分配
    #[error("子流域 {0} 未被分配到任何进程")]
    Unassigned(SubbasinId),

    /// 分组为空
    #[error("分组 {0} 没有任何子流域")]
    EmptyGroup(RankId),

    /// 分组提示超出范围
    #[error("子流域 {id} 的分组提示 {group} 超出进程数 {processes}")]
    GroupOutOfRange {
        /// 子流域
        id: SubbasinId,
        /// 分组提示
        group: usize,
        /// 进程数
        processes: usize,
    },

    /// 缺少分组提示
    #[error("子流域 {0} 缺少分组提示")]
    MissingGroupHint(SubbasinId),
}

// ============================================================================
// 统一错误
// ============================================================================

/// 调度器错误类型
#[derive(Error, Debug)]
pub enum SeError {
    /// 拓扑错误
    #[error("拓扑错误: {0}")]
    Topology(#[from] TopologyError),

    /// 分区错误
    #[error("分区错误: {0}")]
    Partition(#[from] PartitionError),

    /// 缺少上游交换数据
    #[error("时间步 {timestep}: 子流域 {subbasin} 缺少上游数据 {missing:?}")]
    MissingUpstream {
        /// 等待数据的子流域 (按层等待时为该层首个受影响子流域)
        subbasin: SubbasinId,
        /// 时间步
        timestep: u64,
        /// 缺失的上游子流域
        missing: Vec<SubbasinId>,
    },

    /// 子流域计算失败
    #[error("时间步 {timestep}: 子流域 {subbasin} 计算失败: {reason}")]
    StepFailure {
        /// 失败的子流域
        subbasin: SubbasinId,
        /// 时间步
        timestep: u64,
        /// 失败原因
        reason: String,
    },

    /// 管理操作失败
    #[error("时间步 {timestep}: 子流域 {subbasin} 执行管理操作 '{operation}' 失败: {reason}")]
    Management {
        /// 子流域
        subbasin: SubbasinId,
        /// 时间步
        timestep: u64,
        /// 操作名称
        operation: String,
        /// 失败原因
        reason: String,
    },

    /// 进程间传输错误
    #[error("传输错误: {message}")]
    Transport {
        /// 具体错误信息
        message: String,
    },

    /// 配置错误
    #[error("配置错误: {message}")]
    Config {
        /// 具体错误信息
        message: String,
    },

    /// IO 错误
    #[error("IO错误: {message}")]
    Io {
        /// 描述性错误信息
        message: String,
        #[source]
        /// 可选的底层 IO 错误
        source: Option<std::io::Error>,
    },

    /// 文件解析错误
    #[error("文件解析错误: {file}: {message}")]
    Parse {
        /// 文件路径
        file: PathBuf,
        /// 错误信息
        message: String,
    },

    /// 运行被取消
    #[error("运行已取消")]
    Cancelled,

    /// 内部错误
    #[error("内部错误: {message}")]
    Internal {
        /// 内部错误描述
        message: String,
    },
}

// ========================================================================
// 便捷构造方法
// ========================================================================

impl SeError {
    /// 缺少上游数据
    pub fn missing_upstream(subbasin: SubbasinId, timestep: u64, missing: Vec<SubbasinId>) -> Self {
        Self::MissingUpstream {
            subbasin,
            timestep,
            missing,
        }
    }

    /// 计算失败
    pub fn step_failure(subbasin: SubbasinId, timestep: u64, reason: impl Into<String>) -> Self {
        Self::StepFailure {
            subbasin,
            timestep,
            reason: reason.into(),
        }
    }

    /// 管理操作失败
    pub fn management(
        subbasin: SubbasinId,
        timestep: u64,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Management {
            subbasin,
            timestep,
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// 传输错误
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// 配置错误
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// IO 错误
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
            source: None,
        }
    }

    /// 解析错误
    pub fn parse(file: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Parse {
            file: file.into(),
            message: message.into(),
        }
    }

    /// 内部错误
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

// ========================================================================
// 失败报告访问器
// ========================================================================

impl SeError {
    /// 错误类别名称
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Topology(_) => "TopologyError",
            Self::Partition(_) => "PartitionError",
            Self::MissingUpstream { .. } => "MissingUpstream",
            Self::StepFailure { .. } => "StepFailure",
            Self::Management { .. } => "ManagementFailure",
            Self::Transport { .. } => "TransportError",
            Self::Config { .. } => "ConfigError",
            Self::Io { .. } => "IoError",
            Self::Parse { .. } => "ParseError",
            Self::Cancelled => "Cancelled",
            Self::Internal { .. } => "InternalError",
        }
    }

    /// 相关子流域
    pub fn subbasin(&self) -> Option<SubbasinId> {
        match self {
            Self::MissingUpstream { subbasin, .. }
            | Self::StepFailure { subbasin, .. }
            | Self::Management { subbasin, .. } => Some(*subbasin),
            _ => None,
        }
    }

    /// 相关时间步
    pub fn timestep(&self) -> Option<u64> {
        match self {
            Self::MissingUpstream { timestep, .. }
            | Self::StepFailure { timestep, .. }
            | Self::Management { timestep, .. } => Some(*timestep),
            _ => None,
        }
    }

    /// 是否为初始化阶段错误
    pub fn is_initialization(&self) -> bool {
        matches!(self, Self::Topology(_) | Self::Partition(_) | Self::Config { .. })
    }
}

// ========================================================================
// 标准库错误转换
// ========================================================================

impl From<std::io::Error> for SeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl<T> From<std::sync::mpsc::SendError<T>> for SeError {
    fn from(_: std::sync::mpsc::SendError<T>) -> Self {
        Self::transport("通道发送失败: 接收端已关闭")
    }
}

// ========================================================================
// 宏
// ========================================================================

/// 条件不满足时返回错误
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err.into());
        }
    };
}

/// 从 `Option` 取值，为 `None` 时返回错误
#[macro_export]
macro_rules! require {
    ($opt:expr, $err:expr) => {
        match $opt {
            Some(v) => v,
            None => return Err($err.into()),
        }
    };
}

// ========================================================================
// 测试
// ========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SeError::config("进程数无效");
        assert!(err.to_string().contains("配置错误"));

        let err: SeError = TopologyError::Cycle {
            ids: vec![SubbasinId(1), SubbasinId(2)],
        }
        .into();
        assert!(err.to_string().contains("环路"));
        assert_eq!(err.kind(), "TopologyError");
    }

    #[test]
    fn test_failure_report_accessors() {
        let err = SeError::missing_upstream(SubbasinId(3), 7, vec![SubbasinId(1)]);
        assert_eq!(err.kind(), "MissingUpstream");
        assert_eq!(err.subbasin(), Some(SubbasinId(3)));
        assert_eq!(err.timestep(), Some(7));
        assert!(!err.is_initialization());

        let err: SeError = PartitionError::ZeroProcesses.into();
        assert_eq!(err.subbasin(), None);
        assert!(err.is_initialization());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let err: SeError = io_err.into();
        assert!(matches!(err, SeError::Io { .. }));
    }

    #[test]
    fn test_send_error_conversion() {
        let (tx, rx) = std::sync::mpsc::channel::<u8>();
        drop(rx);
        let err: SeError = tx.send(1).unwrap_err().into();
        assert_eq!(err.kind(), "TransportError");
    }

    #[test]
    fn test_ensure_macro() {
        fn check(value: usize) -> SeResult<()> {
            ensure!(value > 0, PartitionError::ZeroProcesses);
            Ok(())
        }

        assert!(check(1).is_ok());
        assert!(matches!(
            check(0),
            Err(SeError::Partition(PartitionError::ZeroProcesses))
        ));
    }

    #[test]
    fn test_require_macro() {
        fn get_value(opt: Option<u32>) -> SeResult<u32> {
            let v = require!(opt, SeError::internal("value"));
            Ok(v)
        }

        assert_eq!(get_value(Some(42)).unwrap(), 42);
        assert!(get_value(None).is_err());
    }
}
