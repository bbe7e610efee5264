// crates/se_schedule/src/runner.rs

//! 流域运行器
//!
//! 把任务分配、传输网格、逐层计算和管理过程串起来：
//! 每个分组一个工作线程，各自构建本地模型，然后逐时间步执行
//! 取消检查 → 逐层计算 (管理过程由逐层计算驱动在子流域计算前执行)。
//!
//! 任一进程失败时其余进程在下一个时间步边界停止，
//! 返回给调用者的是最早 (时间步, 进程) 的原发错误。

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use se_config::SchedulerConfig;
use se_foundation::{RankId, SeError, SeResult, SubbasinId};

use crate::compute::SubbasinModel;
use crate::events::{EventDispatcher, SchedulerEvent};
use crate::exchange::{channel_mesh, Transport};
use crate::management::ManagementProcess;
use crate::metrics::StepMetrics;
use crate::partition::{assign_tasks, LocalSubbasin, PartitionOptions, PartitionSummary, Task};
use crate::stepper::Stepper;
use crate::topology::Topology;

/// 运行结果
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// 进程数
    pub process_count: usize,
    /// 完成的时间步数
    pub timesteps: u64,
    /// 各出口逐时间步的输出
    pub outlet_series: BTreeMap<SubbasinId, Vec<Vec<f64>>>,
    /// 跨进程归约后的指标
    pub metrics: StepMetrics,
    /// 各进程指标
    pub rank_metrics: Vec<StepMetrics>,
    /// 分配统计
    pub summary: PartitionSummary,
    /// 墙钟耗时
    pub duration: Duration,
}

impl RunReport {
    /// 某出口的输出序列
    pub fn outlet(&self, id: SubbasinId) -> Option<&[Vec<f64>]> {
        self.outlet_series.get(&id).map(Vec::as_slice)
    }
}

/// 运行句柄，可在其他线程取消运行
#[derive(Debug, Clone)]
pub struct RunHandle {
    cancelled: Arc<AtomicBool>,
}

impl RunHandle {
    /// 请求取消
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// 是否已请求取消
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// 单个工作线程的结果
struct WorkerOutcome {
    rank: RankId,
    result: SeResult<BTreeMap<SubbasinId, Vec<Vec<f64>>>>,
    metrics: StepMetrics,
    /// 失败由其他进程的中止消息引起
    derived: bool,
}

/// 流域运行器
pub struct WatershedRunner {
    config: SchedulerConfig,
    events: Arc<EventDispatcher>,
    cancelled: Arc<AtomicBool>,
}

impl WatershedRunner {
    /// 创建运行器
    pub fn new(config: SchedulerConfig) -> SeResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            events: Arc::new(EventDispatcher::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// 从配置文件创建
    pub fn from_file<P: AsRef<Path>>(path: P) -> SeResult<Self> {
        Self::new(SchedulerConfig::from_file(path)?)
    }

    /// 配置
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// 事件分发器
    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    /// 获取运行句柄
    pub fn handle(&self) -> RunHandle {
        RunHandle {
            cancelled: Arc::clone(&self.cancelled),
        }
    }

    /// 计算排序并分配任务
    pub fn prepare(&self, graph: &mut Topology) -> SeResult<(Vec<Task>, PartitionSummary)> {
        let options = PartitionOptions::from(&self.config);
        let tasks = assign_tasks(graph, self.config.process_count, &options)?;
        let summary = PartitionSummary::from_topology(graph, self.config.process_count, options.layering);
        self.events.emit(SchedulerEvent::TasksAssigned {
            process_count: self.config.process_count,
            subbasins: graph.len(),
            cut_edges: summary.cut_edges,
        });
        Ok((tasks, summary))
    }

    /// 运行 `timesteps` 个时间步
    ///
    /// `factory` 在各工作线程中为每个本地子流域创建计算模型。
    pub fn run<F>(&self, graph: &mut Topology, factory: F, timesteps: u64) -> SeResult<RunReport>
    where
        F: Fn(&LocalSubbasin) -> Box<dyn SubbasinModel> + Sync,
    {
        let start = Instant::now();
        let (tasks, summary) = self.prepare(graph)?;
        let process_count = tasks.len();

        let transports: Vec<Option<Box<dyn Transport>>> = if process_count > 1 {
            channel_mesh(process_count)
                .into_iter()
                .map(|t| Some(Box::new(t) as Box<dyn Transport>))
                .collect()
        } else {
            vec![None]
        };

        let management = Arc::new(ManagementProcess::new(&self.config.management));
        let halt = Arc::new(AtomicBool::new(false));
        let outcomes = Mutex::new(Vec::with_capacity(process_count));

        tracing::info!(
            "Running {} timesteps on {} processes ({} subbasins)",
            timesteps,
            process_count,
            graph.len()
        );

        std::thread::scope(|scope| {
            for (task, transport) in tasks.into_iter().zip(transports) {
                let factory = &factory;
                let management = &management;
                let outcomes = &outcomes;
                let halt = Arc::clone(&halt);
                scope.spawn(move || {
                    let outcome =
                        self.run_worker(Arc::new(task), transport, factory, management, &halt, timesteps);
                    if outcome.result.is_err() {
                        halt.store(true, Ordering::SeqCst);
                    }
                    outcomes.lock().push(outcome);
                });
            }
        });

        let mut outcomes = outcomes.into_inner();
        outcomes.sort_by_key(|o| o.rank);

        if let Some(err) = select_error(&mut outcomes) {
            tracing::error!("Run failed: {}", err);
            return Err(err);
        }

        let mut report = RunReport {
            process_count,
            timesteps,
            outlet_series: BTreeMap::new(),
            metrics: StepMetrics::default(),
            rank_metrics: Vec::with_capacity(process_count),
            summary,
            duration: start.elapsed(),
        };
        for outcome in outcomes {
            report.metrics.merge_max(&outcome.metrics);
            report.rank_metrics.push(outcome.metrics);
            if let Ok(series) = outcome.result {
                report.outlet_series.extend(series);
            }
        }

        tracing::info!(
            "Run completed: {} timesteps in {:.2}s, {} exchange rounds",
            timesteps,
            report.duration.as_secs_f64(),
            report.metrics.exchange_rounds
        );
        Ok(report)
    }

    fn run_worker<F>(
        &self,
        task: Arc<Task>,
        transport: Option<Box<dyn Transport>>,
        factory: &F,
        management: &Arc<ManagementProcess>,
        halt: &Arc<AtomicBool>,
        timesteps: u64,
    ) -> WorkerOutcome
    where
        F: Fn(&LocalSubbasin) -> Box<dyn SubbasinModel> + Sync,
    {
        let rank = task.rank;
        let models: Vec<(SubbasinId, Box<dyn SubbasinModel>)> =
            task.subbasins.values().map(|s| (s.id, factory(s))).collect();

        let stepper = Stepper::new(Arc::clone(&task), models, self.config.stepper.clone(), transport);
        let mut stepper = match stepper {
            Ok(stepper) => stepper
                .with_events(Arc::clone(&self.events))
                .with_cancel_token(Arc::clone(&self.cancelled))
                .with_cancel_token(Arc::clone(halt))
                .with_management(Arc::clone(management))
                .with_horizon(timesteps),
            Err(e) => {
                return WorkerOutcome {
                    rank,
                    result: Err(e),
                    metrics: StepMetrics::default(),
                    derived: false,
                }
            }
        };

        self.events.emit(SchedulerEvent::RunStarted {
            rank,
            subbasins: task.len(),
            timesteps,
        });
        let start = Instant::now();
        let mut series: BTreeMap<SubbasinId, Vec<Vec<f64>>> = BTreeMap::new();

        let result = (|| -> SeResult<()> {
            for t in 0..timesteps {
                if self.cancelled.load(Ordering::SeqCst) {
                    self.events.emit(SchedulerEvent::RunCancelled { rank, timestep: t });
                    return Err(SeError::Cancelled);
                }
                if halt.load(Ordering::SeqCst) {
                    tracing::debug!("Rank {} stopping at timestep {}: peer failed", rank, t);
                    return Err(SeError::Cancelled);
                }


                let report = stepper.run_timestep(t)?;
                for (id, values) in report.outlet_outputs {
                    series.entry(id).or_default().push(values);
                }
            }
            Ok(())
        })();

        let derived = result.is_err() && stepper.abort_origin().is_some();
        if result.is_ok() {
            self.events.emit(SchedulerEvent::RunCompleted {
                rank,
                timesteps,
                duration_secs: start.elapsed().as_secs_f64(),
            });
        }

        WorkerOutcome {
            rank,
            result: result.map(|()| series),
            metrics: stepper.metrics().clone(),
            derived,
        }
    }
}

/// 选择返回给调用者的错误
///
/// 优先级：原发错误 > 收到中止引起的错误 > 取消；同级取 (时间步, 进程) 最小者。
fn select_error(outcomes: &mut [WorkerOutcome]) -> Option<SeError> {
    let priority = |o: &WorkerOutcome| match &o.result {
        Ok(_) => None,
        Err(SeError::Cancelled) => Some(2),
        Err(_) if o.derived => Some(1),
        Err(_) => Some(0),
    };
    let chosen = outcomes
        .iter()
        .enumerate()
        .filter_map(|(i, o)| {
            let p = priority(o)?;
            let timestep = o.result.as_ref().err().and_then(SeError::timestep).unwrap_or(u64::MAX);
            Some(((p, timestep, o.rank), i))
        })
        .min_by_key(|(key, _)| *key)
        .map(|(_, i)| i)?;

    let outcome = &mut outcomes[chosen];
    let result = std::mem::replace(&mut outcome.result, Ok(BTreeMap::new()));
    result.err()
}

impl std::fmt::Debug for WatershedRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatershedRunner")
            .field("process_count", &self.config.process_count)
            .field("cancelled", &self.cancelled.load(Ordering::SeqCst))
            .finish()
    }
}
