// crates/se_config/src/lib.rs

//! SEIMS-RS Config Layer
//!
//! 配置层，提供调度器、逐层计算与管理过程的可序列化配置。
//!
//! # 模块概览
//!
//! - [`scheduler_config`]: SchedulerConfig 调度器配置
//! - [`methods`]: 分层方法、分组策略与调度方法
//! - [`management`]: 管理操作计划
//! - [`error`]: 配置错误类型
//!
//! # 层级架构
//!
//! ```text
//! Layer 3: se_schedule   ─> uses SchedulerConfig
//! Layer 2: se_config     ─> SchedulerConfig, ManagementConfig (本层)
//! Layer 1: se_foundation
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod management;
pub mod methods;
pub mod scheduler_config;

// 重导出核心类型
pub use error::ConfigError;
pub use management::{ManagementConfig, ScheduledOperation, Trigger};
pub use methods::{LayeringMethod, PartitionStrategy, ScheduleMethod};
pub use scheduler_config::{SchedulerConfig, StepperConfig};
