// crates/se_schedule/src/lib.rs

//! SEIMS-RS Schedule Layer
//!
//! 分布式河网拓扑任务调度：把子流域网络划分到多个工作进程，
//! 计算满足依赖的执行顺序，并在每个时间步的层边界交换跨进程数据，
//! 保证每个子流域都在其全部上游产生本步输出之后才计算。
//!
//! # 模块概览
//!
//! - [`topology`]: 河网拓扑构建与验证
//! - [`partition`]: 分层排序、分组策略与任务生成
//! - [`exchange`]: 交换缓冲、进程间消息与传输层
//! - [`compute`]: 子流域计算契约
//! - [`stepper`]: 逐层计算驱动 (状态机 + 交换轮次)
//! - [`management`]: 管理过程
//! - [`runner`]: 多进程运行器
//! - [`events`]: 调度事件
//! - [`metrics`]: 性能指标
//!
//! # 层级架构
//!
//! ```text
//! Layer 3: se_schedule   ─> Topology, Task, Stepper, WatershedRunner (本层)
//! Layer 2: se_config     ─> SchedulerConfig
//! Layer 1: se_foundation ─> SubbasinId, RankId, SeError
//! ```
//!
//! # 示例
//!
//! ```
//! use se_config::SchedulerConfig;
//! use se_foundation::SubbasinId;
//! use se_schedule::compute::{AccumulateModel, SubbasinModel};
//! use se_schedule::partition::LocalSubbasin;
//! use se_schedule::{build_topology, WatershedRunner};
//!
//! let mut graph = build_topology(&[(1, 3), (2, 3), (3, 0)]).unwrap();
//! let runner = WatershedRunner::new(SchedulerConfig::with_processes(2)).unwrap();
//! let factory = |_: &LocalSubbasin| -> Box<dyn SubbasinModel> { Box::new(AccumulateModel::new(1.0)) };
//!
//! let report = runner.run(&mut graph, factory, 2).unwrap();
//! assert_eq!(report.outlet(SubbasinId(3)).unwrap(), &[vec![3.0], vec![3.0]]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compute;
pub mod events;
pub mod exchange;
pub mod management;
pub mod metrics;
pub mod partition;
pub mod runner;
pub mod stepper;
pub mod topology;

// 重导出核心类型
pub use compute::{ComputeError, FnModel, StepContext, SubbasinModel, UpstreamContribution};
pub use events::{EventDispatcher, EventListener, LoggingListener, SchedulerEvent};
pub use exchange::{channel_mesh, ChannelTransport, ExchangeBuffer, ExchangeMessage, ExchangeRecord, Transport};
pub use management::{ManagementProcess, ManagementReport};
pub use metrics::StepMetrics;
pub use partition::{assign_tasks, LocalSubbasin, PartitionOptions, PartitionSummary, Task};
pub use runner::{RunHandle, RunReport, WatershedRunner};
pub use stepper::{NodeStatus, StepReport, Stepper};
pub use topology::{build_topology, SubbasinNode, Topology, TopologyDescriptor, TopologyOptions};
