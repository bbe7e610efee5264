// crates/se_schedule/src/events.rs

//! 调度事件模块
//!
//! 提供调度事件的定义和分发机制。

use parking_lot::RwLock;
use se_foundation::{RankId, SubbasinId};
use std::sync::Arc;

/// 调度事件
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// 任务已分配
    TasksAssigned {
        /// 进程数
        process_count: usize,
        /// 子流域总数
        subbasins: usize,
        /// 跨进程边数
        cut_edges: usize,
    },
    /// 进程开始运行
    RunStarted {
        /// 进程编号
        rank: RankId,
        /// 本地子流域数
        subbasins: usize,
        /// 计划时间步数
        timesteps: u64,
    },
    /// 时间步开始
    TimestepStarted {
        /// 进程编号
        rank: RankId,
        /// 时间步
        timestep: u64,
    },
    /// 完成一次交换轮次
    ExchangeRound {
        /// 进程编号
        rank: RankId,
        /// 时间步
        timestep: u64,
        /// 层
        layer: u32,
        /// 发送记录数
        sent: usize,
        /// 接收记录数
        received: usize,
    },
    /// 时间步完成
    TimestepCompleted {
        /// 进程编号
        rank: RankId,
        /// 时间步
        timestep: u64,
        /// 计算的子流域数
        computed: usize,
    },
    /// 管理操作已执行
    ManagementApplied {
        /// 进程编号
        rank: RankId,
        /// 时间步
        timestep: u64,
        /// 执行的 (操作, 子流域) 次数
        applications: usize,
    },
    /// 时间步失败
    StepFailed {
        /// 进程编号
        rank: RankId,
        /// 时间步
        timestep: u64,
        /// 失败子流域
        subbasin: Option<SubbasinId>,
        /// 错误信息
        error: String,
    },
    /// 进程运行结束
    RunCompleted {
        /// 进程编号
        rank: RankId,
        /// 完成的时间步数
        timesteps: u64,
        /// 运行时长 (秒)
        duration_secs: f64,
    },
    /// 运行被取消
    RunCancelled {
        /// 进程编号
        rank: RankId,
        /// 取消时的时间步
        timestep: u64,
    },
}

impl SchedulerEvent {
    /// 事件对应的进程，全局事件返回 `None`
    pub fn rank(&self) -> Option<RankId> {
        match self {
            Self::TasksAssigned { .. } => None,
            Self::RunStarted { rank, .. }
            | Self::TimestepStarted { rank, .. }
            | Self::ExchangeRound { rank, .. }
            | Self::TimestepCompleted { rank, .. }
            | Self::ManagementApplied { rank, .. }
            | Self::StepFailed { rank, .. }
            | Self::RunCompleted { rank, .. }
            | Self::RunCancelled { rank, .. } => Some(*rank),
        }
    }

    /// 获取事件名称
    pub fn name(&self) -> &'static str {
        match self {
            Self::TasksAssigned { .. } => "TasksAssigned",
            Self::RunStarted { .. } => "RunStarted",
            Self::TimestepStarted { .. } => "TimestepStarted",
            Self::ExchangeRound { .. } => "ExchangeRound",
            Self::TimestepCompleted { .. } => "TimestepCompleted",
            Self::ManagementApplied { .. } => "ManagementApplied",
            Self::StepFailed { .. } => "StepFailed",
            Self::RunCompleted { .. } => "RunCompleted",
            Self::RunCancelled { .. } => "RunCancelled",
        }
    }
}

/// 事件监听器trait
pub trait EventListener: Send + Sync {
    /// 处理事件
    fn on_event(&self, event: &SchedulerEvent);

    /// 获取监听器名称 (用于调试)
    fn name(&self) -> &str {
        "anonymous"
    }
}

/// 函数式事件监听器
pub struct FnListener<F>
where
    F: Fn(&SchedulerEvent) + Send + Sync,
{
    name: String,
    handler: F,
}

impl<F> FnListener<F>
where
    F: Fn(&SchedulerEvent) + Send + Sync,
{
    /// 创建函数式监听器
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

impl<F> EventListener for FnListener<F>
where
    F: Fn(&SchedulerEvent) + Send + Sync,
{
    fn on_event(&self, event: &SchedulerEvent) {
        (self.handler)(event);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 日志事件监听器
///
/// 默认只输出运行级事件，详细模式下逐时间步输出。
pub struct LoggingListener {
    prefix: String,
    verbose: bool,
}

impl LoggingListener {
    /// 创建日志监听器
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            verbose: false,
        }
    }

    /// 设置详细模式
    pub fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }
}

impl EventListener for LoggingListener {
    fn on_event(&self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::TasksAssigned {
                process_count,
                subbasins,
                cut_edges,
            } => {
                tracing::info!(
                    "{}: {} subbasins assigned to {} processes ({} cut edges)",
                    self.prefix,
                    subbasins,
                    process_count,
                    cut_edges
                );
            }
            SchedulerEvent::RunStarted {
                rank,
                subbasins,
                timesteps,
            } => {
                tracing::info!(
                    "{}: rank {} started with {} subbasins, {} timesteps",
                    self.prefix,
                    rank,
                    subbasins,
                    timesteps
                );
            }
            SchedulerEvent::StepFailed {
                rank,
                timestep,
                subbasin,
                error,
            } => {
                tracing::error!(
                    "{}: rank {} failed at timestep {} (subbasin {:?}): {}",
                    self.prefix,
                    rank,
                    timestep,
                    subbasin,
                    error
                );
            }
            SchedulerEvent::RunCompleted {
                rank,
                timesteps,
                duration_secs,
            } => {
                tracing::info!(
                    "{}: rank {} completed {} timesteps in {:.2}s",
                    self.prefix,
                    rank,
                    timesteps,
                    duration_secs
                );
            }
            SchedulerEvent::RunCancelled { rank, timestep } => {
                tracing::warn!(
                    "{}: rank {} cancelled at timestep {}",
                    self.prefix,
                    rank,
                    timestep
                );
            }
            _ if self.verbose => {
                tracing::debug!("{}: {:?}", self.prefix, event);
            }
            _ => {}
        }
    }

    fn name(&self) -> &str {
        "LoggingListener"
    }
}

/// 事件分发器
#[derive(Default)]
pub struct EventDispatcher {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventDispatcher {
    /// 创建新的事件分发器
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// 添加监听器
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        let name = listener.name().to_string();
        self.listeners.write().push(listener);
        tracing::debug!("Added event listener: {}", name);
    }

    /// 添加函数式监听器
    pub fn add_fn_listener<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&SchedulerEvent) + Send + Sync + 'static,
    {
        self.add_listener(Arc::new(FnListener::new(name, handler)));
    }

    /// 清除所有监听器
    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    /// 分发事件
    pub fn emit(&self, event: SchedulerEvent) {
        let listeners = self.listeners.read();
        tracing::trace!("Emitting event: {}", event.name());
        for listener in listeners.iter() {
            listener.on_event(&event);
        }
    }

    /// 获取监听器数量
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listener_count", &self.listener_count())
            .finish()
    }
}
