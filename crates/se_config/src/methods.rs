// crates/se_config/src/methods.rs

//! 分层、分组与调度方法枚举

use serde::{Deserialize, Serialize};
use std::fmt;

/// 分层方法
///
/// 决定驱动逐层计算的拓扑序：
/// - `UpDown`: 从源头子流域向下游剥离 (自底向上序)
/// - `DownUp`: 从出口向上游按深度分层后反转 (自顶向下序)
///
/// 两种序都保证上游子流域的层号严格小于下游。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LayeringMethod {
    /// 自底向上
    #[default]
    UpDown,
    /// 自顶向下
    DownUp,
}

impl fmt::Display for LayeringMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpDown => write!(f, "UP_DOWN"),
            Self::DownUp => write!(f, "DOWN_UP"),
        }
    }
}

/// 分组策略
///
/// 负载均衡质量是可调策略而非正确性要求，
/// 所有策略都保证每个子流域恰好属于一个分组。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// 按上游优先深度遍历序切分加权连续块，尽量保持河段链在同一进程
    #[default]
    SubtreeBlock,
    /// 按自底向上序轮询分配
    LayerRoundRobin,
    /// 使用拓扑描述中声明的分组提示 (如预处理阶段的 METIS 结果)
    Hinted,
}

impl fmt::Display for PartitionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SubtreeBlock => write!(f, "SubtreeBlock"),
            Self::LayerRoundRobin => write!(f, "LayerRoundRobin"),
            Self::Hinted => write!(f, "Hinted"),
        }
    }
}

/// 逐层计算的调度方法
///
/// - `Spatial`: 每个时间步内按层推进，完成全部层后进入下一时间步
/// - `TemporoSpatial`: 按时间错层流水，第 `s` 轮中第 `k` 层计算时间步
///   `s + (ilyr - k)`，上游层可以领先下游层若干时间步
///
/// 两种方法对每个子流域的输入与执行顺序相同，结果一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMethod {
    /// 空间调度
    #[default]
    Spatial,
    /// 时空调度
    TemporoSpatial,
}

impl fmt::Display for ScheduleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spatial => write!(f, "SPATIAL"),
            Self::TemporoSpatial => write!(f, "TEMPOROSPATIAL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(LayeringMethod::default(), LayeringMethod::UpDown);
        assert_eq!(PartitionStrategy::default(), PartitionStrategy::SubtreeBlock);
        assert_eq!(ScheduleMethod::default(), ScheduleMethod::Spatial);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&LayeringMethod::DownUp).unwrap();
        assert_eq!(json, "\"down_up\"");
        let parsed: PartitionStrategy = serde_json::from_str("\"layer_round_robin\"").unwrap();
        assert_eq!(parsed, PartitionStrategy::LayerRoundRobin);
        let parsed: ScheduleMethod = serde_json::from_str("\"temporo_spatial\"").unwrap();
        assert_eq!(parsed, ScheduleMethod::TemporoSpatial);
        assert_eq!(parsed.to_string(), "TEMPOROSPATIAL");
    }
}
