// crates/se_config/src/management.rs

//! 管理操作计划配置
//!
//! 描述低频的管理措施 (种植、施肥、收割等情景操作) 在哪些时间步、
//! 对哪些子流域执行。这里只定义数据，执行逻辑在 `se_schedule::management`。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use se_foundation::SubbasinId;

use crate::error::ConfigError;

/// 触发条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// 周期触发：`timestep >= offset` 且 `(timestep - offset) % interval == 0`
    Every {
        /// 周期 (时间步数)
        interval: u64,
        /// 起始偏移
        #[serde(default)]
        offset: u64,
    },
    /// 指定时间步触发
    At {
        /// 触发的时间步
        timesteps: Vec<u64>,
    },
}

impl Trigger {
    /// 给定时间步是否触发
    pub fn fires_at(&self, timestep: u64) -> bool {
        match self {
            Self::Every { interval, offset } => {
                *interval > 0 && timestep >= *offset && (timestep - offset) % interval == 0
            }
            Self::At { timesteps } => timesteps.contains(&timestep),
        }
    }
}

/// 计划管理操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledOperation {
    /// 操作名称
    pub name: String,

    /// 操作参数
    #[serde(default)]
    pub parameters: BTreeMap<String, f64>,

    /// 触发条件
    pub trigger: Trigger,

    /// 目标子流域，`None` 表示全部子流域
    #[serde(default)]
    pub subbasins: Option<Vec<SubbasinId>>,
}

impl ScheduledOperation {
    /// 创建作用于全部子流域的操作
    pub fn new(name: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            name: name.into(),
            parameters: BTreeMap::new(),
            trigger,
            subbasins: None,
        }
    }

    /// 设置参数
    pub fn with_parameter(mut self, key: impl Into<String>, value: f64) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// 限定目标子流域
    pub fn with_subbasins(mut self, ids: impl IntoIterator<Item = SubbasinId>) -> Self {
        self.subbasins = Some(ids.into_iter().collect());
        self
    }

    /// 是否作用于该子流域
    pub fn targets(&self, id: SubbasinId) -> bool {
        match &self.subbasins {
            Some(ids) => ids.contains(&id),
            None => true,
        }
    }
}

/// 管理过程配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagementConfig {
    /// 计划操作列表，按声明顺序执行
    #[serde(default)]
    pub operations: Vec<ScheduledOperation>,
}

impl ManagementConfig {
    /// 验证配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, op) in self.operations.iter().enumerate() {
            if op.name.trim().is_empty() {
                return Err(ConfigError::Missing(format!(
                    "management.operations[{}].name",
                    i
                )));
            }
            if let Trigger::Every { interval: 0, .. } = op.trigger {
                return Err(ConfigError::invalid(
                    format!("management.operations[{}].trigger.interval", i),
                    0,
                    "周期必须为正",
                ));
            }
        }
        Ok(())
    }
}
