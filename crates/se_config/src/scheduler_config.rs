// crates/se_config/src/scheduler_config.rs

//! SchedulerConfig - 调度器配置
//!
//! 定义拓扑构建、任务分区、逐层计算和管理过程的全部参数，
//! 以 JSON 形式读写。

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::management::ManagementConfig;
use crate::methods::{LayeringMethod, PartitionStrategy, ScheduleMethod};

/// 调度器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 进程 (分组) 数
    #[serde(default = "default_process_count")]
    pub process_count: usize,

    /// 分层方法
    #[serde(default)]
    pub layering: LayeringMethod,

    /// 分组策略
    #[serde(default)]
    pub partition: PartitionStrategy,

    /// 是否允许多个出口 (多棵汇流树组成的森林)
    #[serde(default)]
    pub allow_multiple_outlets: bool,

    /// 逐层计算配置
    #[serde(default)]
    pub stepper: StepperConfig,

    /// 管理过程配置
    #[serde(default)]
    pub management: ManagementConfig,
}

fn default_process_count() -> usize { 1 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            process_count: default_process_count(),
            layering: LayeringMethod::default(),
            partition: PartitionStrategy::default(),
            allow_multiple_outlets: false,
            stepper: StepperConfig::default(),
            management: ManagementConfig::default(),
        }
    }
}

/// 逐层计算配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepperConfig {
    /// 同层本地子流域是否并行计算
    #[serde(default = "default_parallel_layers")]
    pub parallel_layers: bool,

    /// 启用并行的最小同层子流域数
    #[serde(default = "default_min_parallel_layer")]
    pub min_parallel_layer: usize,

    /// 每个河道步之前的坡面子步数 (dt_channel / dt_hillslope)
    #[serde(default = "default_hillslope_substeps")]
    pub hillslope_substeps: u32,

    /// 交换边界等待上游数据的超时 [ms]
    #[serde(default = "default_exchange_timeout_ms")]
    pub exchange_timeout_ms: u64,

    /// 调度方法
    #[serde(default)]
    pub schedule: ScheduleMethod,

    /// 进程间同步周期的倍数
    ///
    /// 每 `time_slices × 全局最大层` 个时间步全部进程同步一次，
    /// 任一进程最多领先其他进程一个同步周期。
    #[serde(default = "default_time_slices")]
    pub time_slices: u32,
}

fn default_parallel_layers() -> bool { true }
fn default_min_parallel_layer() -> usize { 4 }
fn default_hillslope_substeps() -> u32 { 1 }
fn default_exchange_timeout_ms() -> u64 { 30_000 }
fn default_time_slices() -> u32 { 2 }

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            parallel_layers: default_parallel_layers(),
            min_parallel_layer: default_min_parallel_layer(),
            hillslope_substeps: default_hillslope_substeps(),
            exchange_timeout_ms: default_exchange_timeout_ms(),
            schedule: ScheduleMethod::default(),
            time_slices: default_time_slices(),
        }
    }
}

impl StepperConfig {
    /// 交换超时
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    /// 同步周期 (时间步数)
    pub fn sync_period(&self, global_max_layer: u32) -> u64 {
        u64::from(self.time_slices.max(1)) * u64::from(global_max_layer.max(1))
    }
}

impl SchedulerConfig {
    /// 指定进程数的默认配置
    pub fn with_processes(process_count: usize) -> Self {
        Self {
            process_count,
            ..Default::default()
        }
    }

    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;

        let config: SchedulerConfig = serde_json::from_str(&content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.process_count == 0 {
            return Err(ConfigError::invalid(
                "process_count",
                self.process_count,
                "进程数必须为正",
            ));
        }

        if self.stepper.hillslope_substeps == 0 {
            return Err(ConfigError::invalid(
                "stepper.hillslope_substeps",
                self.stepper.hillslope_substeps,
                "坡面子步数必须为正",
            ));
        }

        if self.stepper.exchange_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "stepper.exchange_timeout_ms",
                self.stepper.exchange_timeout_ms,
                "交换超时必须为正，调度器不允许无限期阻塞",
            ));
        }

        if self.stepper.time_slices == 0 {
            return Err(ConfigError::invalid(
                "stepper.time_slices",
                self.stepper.time_slices,
                "同步周期倍数必须为正",
            ));
        }

        self.management.validate()
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
