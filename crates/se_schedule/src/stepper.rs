// crates/se_schedule/src/stepper.rs

//! 逐层计算驱动
//!
//! 每个时间步内，每个本地子流域经历状态机：
//!
//! ```text
//! Pending ──> LocalReady ──> Exchanging ──> Complete
//!                  │                           ^
//!                  └───────────────────────────┘ (下游在本进程)
//! ```
//!
//! - `LocalReady`: 全部本地上游 `Complete`，全部远程上游记录已收到
//! - `Exchanging`: 已计算且输出已暂存，等待发送
//! - `Complete`: 输出已对下游可用
//!
//! 每个时间步的状态、输出与统计保存在一个帧中。两种调度方法：
//!
//! - `Spatial`: 管理过程 (到期时) → 坡面阶段 → 对 1..=全局最大层 `L`
//!   计算本层就绪子流域，然后执行一次交换轮次 (drain → 发送 → 等待本层应收记录)；
//!   无收发时跳过该轮
//! - `TemporoSpatial`: 第 `s` 轮对 `ilyr = 1..=L`、`lag = 0..ilyr` 计算时间步
//!   `s + lag` 的第 `ilyr - lag` 层，已完成的层跳过；每层计算前执行该层的
//!   管理过程与坡面子步。远程输入缺失时先发出已暂存记录再等待，
//!   每个 `ilyr` 结束时发送全部暂存记录。第 `s` 轮结束时时间步 `s` 全部完成
//!
//! 每 `time_slices × L` 个时间步，全部进程在时间步开始前同步一次，
//! 任一进程 (包括只有上游的进程) 最多领先其他进程一个同步周期。
//!
//! 任一子流域计算或管理操作失败时向所有进程广播中止消息，本进程返回原错误，
//! 其他进程收到中止后返回相同子流域与时间步的 `StepFailure`。

use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use se_config::{ScheduleMethod, StepperConfig};
use se_foundation::{require, RankId, SeError, SeResult, SubbasinId};

use crate::compute::{ComputeError, StepContext, SubbasinModel, UpstreamContribution};
use crate::events::{EventDispatcher, SchedulerEvent};
use crate::exchange::{ExchangeBuffer, ExchangeMessage, ExchangeRecord, Transport};
use crate::management::{ManagementProcess, ManagementReport};
use crate::metrics::StepMetrics;
use crate::partition::Task;

/// 等待交换数据时单次阻塞的最长时间，用于及时响应取消
const POLL_SLICE: Duration = Duration::from_millis(20);

/// 子流域在某个时间步的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    /// 等待依赖
    Pending,
    /// 依赖已满足
    LocalReady,
    /// 已计算，输出等待跨进程发送
    Exchanging,
    /// 已完成
    Complete,
}

/// 单个时间步的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepReport {
    /// 时间步
    pub timestep: u64,
    /// 计算的子流域数
    pub computed: usize,
    /// 实际执行的交换轮次
    pub exchange_rounds: usize,
    /// 发送记录数
    pub records_sent: usize,
    /// 接收记录数
    pub records_received: usize,
    /// 本地出口的输出
    pub outlet_outputs: Vec<(SubbasinId, Vec<f64>)>,
}

struct NodeSlot {
    id: SubbasinId,
    layer: u32,
    model: Box<dyn SubbasinModel>,
}

/// 一个时间步的计算帧
struct Frame {
    timestep: u64,
    /// 与 `slots` 同序
    status: Vec<NodeStatus>,
    outputs: HashMap<SubbasinId, Vec<f64>>,
    report: StepReport,
}

impl Frame {
    fn new(timestep: u64, nodes: usize) -> Self {
        Self {
            timestep,
            status: vec![NodeStatus::Pending; nodes],
            outputs: HashMap::with_capacity(nodes),
            report: StepReport {
                timestep,
                ..Default::default()
            },
        }
    }
}

/// 时空调度中一个 `ilyr` 的交换统计
#[derive(Debug, Default)]
struct RoundTally {
    sent: usize,
    received: usize,
    waited: Duration,
}

/// 上游输入：(上游, 输出, 是否远程)
type UpstreamInputs = Vec<(SubbasinId, Vec<f64>, bool)>;

/// 单进程逐层计算驱动 (CalculateProcess)
pub struct Stepper {
    task: Arc<Task>,
    config: StepperConfig,
    /// 按 (层, ID) 排序
    slots: Vec<NodeSlot>,
    slot_index: HashMap<SubbasinId, usize>,
    buffer: ExchangeBuffer,
    transport: Option<Box<dyn Transport>>,
    /// 未完成的帧，时间步递增
    frames: VecDeque<Frame>,
    /// 最近完成的帧
    retired: Option<Frame>,
    /// 最近一次 `run_timestep` 的时间步
    current: Option<u64>,
    management: Option<Arc<ManagementProcess>>,
    /// 运行的时间步总数，时空调度不会提前计算范围之外的时间步
    horizon: Option<u64>,
    /// 时空调度下一轮
    next_sweep: u64,
    /// 各同步点已到达的其他进程
    sync_marks: BTreeMap<u64, BTreeSet<RankId>>,
    metrics: StepMetrics,
    events: Option<Arc<EventDispatcher>>,
    cancel_tokens: Vec<Arc<AtomicBool>>,
    /// 本时间步收到的中止消息来源
    abort_origin: Option<RankId>,
}

impl Stepper {
    /// 创建驱动
    ///
    /// `models` 必须恰好覆盖任务中的全部本地子流域；
    /// 任务存在跨进程依赖时必须提供传输层。
    pub fn new<I>(
        task: Arc<Task>,
        models: I,
        config: StepperConfig,
        transport: Option<Box<dyn Transport>>,
    ) -> SeResult<Self>
    where
        I: IntoIterator<Item = (SubbasinId, Box<dyn SubbasinModel>)>,
    {
        let mut by_id: BTreeMap<SubbasinId, Box<dyn SubbasinModel>> = BTreeMap::new();
        for (id, model) in models {
            if !task.contains(id) {
                return Err(SeError::config(format!(
                    "子流域 {} 不属于进程 {}",
                    id, task.rank
                )));
            }
            if by_id.insert(id, model).is_some() {
                return Err(SeError::config(format!("子流域 {} 的模型重复", id)));
            }
        }

        let mut slots = Vec::with_capacity(task.len());
        for local in task.subbasins.values() {
            let model = require!(
                by_id.remove(&local.id),
                SeError::config(format!("子流域 {} 缺少计算模型", local.id))
            );
            slots.push(NodeSlot {
                id: local.id,
                layer: local.layer,
                model,
            });
        }
        slots.sort_by_key(|s| (s.layer, s.id));
        let slot_index = slots.iter().enumerate().map(|(i, s)| (s.id, i)).collect();

        match &transport {
            None if task.has_remote_links() => {
                return Err(SeError::config(format!(
                    "进程 {} 存在跨进程依赖但未提供传输层",
                    task.rank
                )));
            }
            Some(t) if t.rank() != task.rank || t.process_count() != task.process_count => {
                return Err(SeError::config(format!(
                    "传输层 ({}/{}) 与任务 ({}/{}) 不匹配",
                    t.rank(),
                    t.process_count(),
                    task.rank,
                    task.process_count
                )));
            }
            _ => {}
        }

        Ok(Self {
            buffer: ExchangeBuffer::with_capacity(task.transfer_capacity),
            task,
            config,
            slots,
            slot_index,
            transport,
            frames: VecDeque::new(),
            retired: None,
            current: None,
            management: None,
            horizon: None,
            next_sweep: 0,
            sync_marks: BTreeMap::new(),
            metrics: StepMetrics::default(),
            events: None,
            cancel_tokens: Vec::new(),
            abort_origin: None,
        })
    }

    /// 设置事件分发器
    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = Some(events);
        self
    }

    /// 添加取消标志，任一标志置位时等待中的交换立即返回 `Cancelled`
    pub fn with_cancel_token(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel_tokens.push(cancel);
        self
    }

    /// 设置管理过程，到期操作在子流域计算该时间步之前执行
    pub fn with_management(mut self, process: Arc<ManagementProcess>) -> Self {
        self.management = Some(process);
        self
    }

    /// 设置运行的时间步总数
    pub fn with_horizon(mut self, timesteps: u64) -> Self {
        self.horizon = Some(timesteps);
        self
    }

    /// 进程编号
    pub fn rank(&self) -> RankId {
        self.task.rank
    }

    /// 任务
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// 调度方法
    pub fn schedule(&self) -> ScheduleMethod {
        self.config.schedule
    }

    /// 同步周期 (时间步数)
    pub fn sync_period(&self) -> u64 {
        self.config.sync_period(self.task.global_max_layer)
    }

    /// 累计指标
    pub fn metrics(&self) -> &StepMetrics {
        &self.metrics
    }

    /// 子流域在最近一次 `run_timestep` 的时间步中的状态
    pub fn status(&self, id: SubbasinId) -> Option<NodeStatus> {
        let &i = self.slot_index.get(&id)?;
        let frame = self.current.and_then(|t| {
            self.frames
                .iter()
                .chain(self.retired.as_ref())
                .find(|f| f.timestep == t)
        });
        Some(frame.map_or(NodeStatus::Pending, |f| f.status[i]))
    }

    /// 最近一次失败是否由其他进程的中止消息引起
    pub fn abort_origin(&self) -> Option<RankId> {
        self.abort_origin
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_tokens.iter().any(|c| c.load(Ordering::SeqCst))
    }

    /// 某层在 `slots` 中的下标范围
    fn layer_range(&self, layer: u32) -> Range<usize> {
        let begin = self.slots.partition_point(|s| s.layer < layer);
        let end = self.slots.partition_point(|s| s.layer <= layer);
        begin..end
    }

    // ========================================================================
    // 管理过程
    // ========================================================================

    /// 对全部本地子流域执行到期的管理操作
    pub fn apply_management(
        &mut self,
        process: &ManagementProcess,
        timestep: u64,
    ) -> SeResult<ManagementReport> {
        self.manage(process, timestep, 0..self.slots.len())
    }

    fn manage(
        &mut self,
        process: &ManagementProcess,
        timestep: u64,
        range: Range<usize>,
    ) -> SeResult<ManagementReport> {
        let start = Instant::now();
        let report = {
            let mut targets: Vec<(SubbasinId, &mut dyn SubbasinModel)> = self.slots[range]
                .iter_mut()
                .map(|s| (s.id, s.model.as_mut() as &mut dyn SubbasinModel))
                .collect();
            process.apply(timestep, &mut targets)?
        };
        self.metrics.record_management(start.elapsed());

        self.emit(SchedulerEvent::ManagementApplied {
            rank: self.task.rank,
            timestep,
            applications: report.applications,
        });
        Ok(report)
    }

    /// 执行已设置的管理过程中到期的操作
    fn manage_due(&mut self, timestep: u64, range: Range<usize>) -> SeResult<()> {
        let Some(process) = self.management.clone() else {
            return Ok(());
        };
        if !range.is_empty() && process.is_due(timestep) {
            self.manage(&process, timestep, range)?;
        }
        Ok(())
    }

    /// 向其他进程广播中止消息，发送失败只记录日志
    pub fn abort_peers(&self, subbasin: SubbasinId, timestep: u64, reason: &str) {
        let Some(transport) = &self.transport else {
            return;
        };
        let message = ExchangeMessage::Abort {
            from: self.task.rank,
            subbasin,
            timestep,
            reason: reason.to_string(),
        };
        if let Err(e) = transport.broadcast(&message) {
            tracing::warn!("Rank {}: failed to broadcast abort: {}", self.task.rank, e);
        }
    }

    // ========================================================================
    // 时间步
    // ========================================================================

    /// 执行一个时间步
    ///
    /// 时空调度要求时间步从 0 起连续推进；返回时该时间步全部完成，
    /// 后续时间步的上游层可能已经算完。
    pub fn run_timestep(&mut self, timestep: u64) -> SeResult<StepReport> {
        self.abort_origin = None;
        self.current = Some(timestep);
        let result = match self.config.schedule {
            ScheduleMethod::Spatial => self.run_spatial(timestep),
            ScheduleMethod::TemporoSpatial => self.run_sweep(timestep),
        };
        if let Err(err) = &result {
            self.report_failure(timestep, err);
        }
        result
    }

    fn report_failure(&self, timestep: u64, err: &SeError) {
        if self.abort_origin.is_none() {
            match err {
                SeError::StepFailure {
                    subbasin,
                    timestep: failed,
                    reason,
                } => self.abort_peers(*subbasin, *failed, reason),
                SeError::Management {
                    subbasin,
                    timestep: failed,
                    ..
                } => self.abort_peers(*subbasin, *failed, &err.to_string()),
                _ => {}
            }
        }
        if !matches!(err, SeError::Cancelled) {
            self.emit(SchedulerEvent::StepFailed {
                rank: self.task.rank,
                timestep,
                subbasin: err.subbasin(),
                error: err.to_string(),
            });
        }
    }

    fn run_spatial(&mut self, timestep: u64) -> SeResult<StepReport> {
        self.synchronize(timestep)?;
        self.frames.clear();
        self.buffer.begin_timestep(timestep);
        self.open_frame(timestep);

        let all = 0..self.slots.len();
        self.manage_due(timestep, all.clone())?;
        self.run_hillslope(timestep, all)?;

        for layer in 1..=self.task.global_max_layer {
            self.poll_inbox()?;
            self.compute_layer(0, layer)?;
            self.exchange_round(timestep, layer)?;
        }
        self.retire_front()
    }

    fn run_sweep(&mut self, sweep: u64) -> SeResult<StepReport> {
        if sweep != self.next_sweep {
            return Err(SeError::internal(format!(
                "时空调度须连续推进: 期望时间步 {}，收到 {}",
                self.next_sweep, sweep
            )));
        }
        if self.horizon.is_some_and(|h| sweep >= h) {
            return Err(SeError::internal(format!(
                "时间步 {} 超出运行范围 {:?}",
                sweep, self.horizon
            )));
        }
        self.synchronize(sweep)?;
        self.buffer.begin_timestep(sweep);
        self.frame_index(sweep)?;

        for ilyr in 1..=self.task.global_max_layer {
            self.poll_inbox()?;
            let mut tally = RoundTally::default();
            for lag in 0..ilyr {
                let timestep = sweep + u64::from(lag);
                if self.horizon.is_some_and(|h| timestep >= h) {
                    break;
                }
                self.compute_lagged(timestep, ilyr - lag, &mut tally)?;
            }

            let start = Instant::now();
            tally.sent += self.flush()?;
            tally.waited += start.elapsed();
            if tally.sent > 0 || tally.received > 0 {
                self.metrics
                    .record_exchange(tally.sent, tally.received, tally.waited);
                self.emit(SchedulerEvent::ExchangeRound {
                    rank: self.task.rank,
                    timestep: sweep,
                    layer: ilyr,
                    sent: tally.sent,
                    received: tally.received,
                });
            }
        }

        let report = self.retire_front()?;
        self.next_sweep = sweep + 1;
        Ok(report)
    }

    /// 时空调度中计算时间步 `timestep` 的第 `layer` 层，已完成时跳过
    fn compute_lagged(
        &mut self,
        timestep: u64,
        layer: u32,
        tally: &mut RoundTally,
    ) -> SeResult<()> {
        let range = self.layer_range(layer);
        if range.is_empty() {
            return Ok(());
        }
        let fi = self.frame_index(timestep)?;
        if self.frames[fi].status[range.start] != NodeStatus::Pending {
            return Ok(());
        }

        let remote: Vec<SubbasinId> = self.slots[range.clone()]
            .iter()
            .flat_map(|s| self.task.remote_upstream_of(s.id).iter().copied())
            .collect();
        if !self.buffer.missing_at(timestep, &remote).is_empty() {
            let start = Instant::now();
            tally.sent += self.flush()?;
            self.wait_for(timestep, &remote)?;
            tally.waited += start.elapsed();
        }

        self.manage_due(timestep, range.clone())?;
        self.run_hillslope(timestep, range)?;
        let staged = self.buffer.staged();
        self.compute_layer(fi, layer)?;

        let report = &mut self.frames[fi].report;
        if !remote.is_empty() || self.buffer.staged() > staged {
            report.exchange_rounds += 1;
        }
        report.records_received += remote.len();
        tally.received += remote.len();
        Ok(())
    }

    /// 帧下标，必要时依次打开后续时间步的帧
    fn frame_index(&mut self, timestep: u64) -> SeResult<usize> {
        let first = self.frames.front().map_or(timestep, |f| f.timestep);
        if timestep < first {
            return Err(SeError::internal(format!(
                "时间步 {} 早于进行中的时间步 {}",
                timestep, first
            )));
        }
        while self.frames.back().map_or(true, |f| f.timestep < timestep) {
            let next = self.frames.back().map_or(timestep, |f| f.timestep + 1);
            self.open_frame(next);
        }
        Ok((timestep - first) as usize)
    }

    fn open_frame(&mut self, timestep: u64) {
        self.frames.push_back(Frame::new(timestep, self.slots.len()));
        self.emit(SchedulerEvent::TimestepStarted {
            rank: self.task.rank,
            timestep,
        });
    }

    /// 完成最早的帧
    fn retire_front(&mut self) -> SeResult<StepReport> {
        let front = require!(self.frames.front(), SeError::internal("没有进行中的时间步"));
        if let Some(i) = front.status.iter().position(|s| *s != NodeStatus::Complete) {
            return Err(SeError::internal(format!(
                "时间步 {} 结束时子流域 {} 处于 {:?}",
                front.timestep, self.slots[i].id, front.status[i]
            )));
        }
        let mut frame = require!(self.frames.pop_front(), SeError::internal("没有进行中的时间步"));
        let report = std::mem::take(&mut frame.report);

        self.metrics.record_timestep();
        self.emit(SchedulerEvent::TimestepCompleted {
            rank: self.task.rank,
            timestep: frame.timestep,
            computed: report.computed,
        });
        self.retired = Some(frame);
        Ok(report)
    }

    fn run_hillslope(&mut self, timestep: u64, range: Range<usize>) -> SeResult<()> {
        let substeps = self.config.hillslope_substeps;
        if substeps == 0 || range.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let parallel = self.use_parallel(range.len());
        let slots = &mut self.slots[range];

        let run = |slot: &mut NodeSlot| -> Result<(), ComputeError> {
            for substep in 1..=substeps {
                let ctx = StepContext {
                    subbasin: slot.id,
                    timestep,
                    layer: slot.layer,
                    substep,
                };
                slot.model.hillslope(&ctx)?;
            }
            Ok(())
        };

        let results: Vec<Result<(), ComputeError>> = if parallel {
            slots.par_iter_mut().map(run).collect()
        } else {
            slots.iter_mut().map(run).collect()
        };

        for (slot, result) in slots.iter().zip(results) {
            if let Err(e) = result {
                return Err(SeError::step_failure(
                    slot.id,
                    timestep,
                    format!("坡面过程: {}", e),
                ));
            }
        }
        self.metrics.record_hillslope(start.elapsed());
        Ok(())
    }

    #[inline]
    fn use_parallel(&self, nodes: usize) -> bool {
        self.config.parallel_layers && nodes >= self.config.min_parallel_layer.max(2)
    }

    /// 在第 `fi` 帧计算一层，返回计算的子流域数
    fn compute_layer(&mut self, fi: usize, layer: u32) -> SeResult<usize> {
        let range = self.layer_range(layer);
        if range.is_empty() {
            return Ok(0);
        }
        let start = Instant::now();
        let timestep = self.frames[fi].timestep;

        // 依赖检查并收集上游输入
        let mut inputs: Vec<UpstreamInputs> = Vec::with_capacity(range.len());
        for i in range.clone() {
            let id = self.slots[i].id;
            let local = require!(
                self.task.subbasin(id),
                SeError::internal(format!("任务中缺少子流域 {}", id))
            );
            let frame = &self.frames[fi];

            let pending: Vec<SubbasinId> = local
                .local_upstream
                .iter()
                .copied()
                .filter(|u| {
                    self.slot_index
                        .get(u)
                        .map_or(true, |&j| frame.status[j] != NodeStatus::Complete)
                })
                .collect();
            if !pending.is_empty() {
                return Err(SeError::missing_upstream(id, timestep, pending));
            }

            let mut upstream: UpstreamInputs = Vec::with_capacity(local.upstream.len());
            for &u in &local.local_upstream {
                let values = frame.outputs.get(&u).cloned().unwrap_or_default();
                upstream.push((u, values, false));
            }
            let remote = self
                .buffer
                .take_upstream_at(timestep, id, &local.remote_upstream)?;
            for record in remote {
                upstream.push((record.subbasin, record.values, true));
            }
            upstream.sort_by_key(|(u, _, _)| *u);
            inputs.push(upstream);

            self.frames[fi].status[i] = NodeStatus::LocalReady;
        }

        let parallel = self.use_parallel(range.len());
        let layer_slots = &mut self.slots[range.clone()];
        let results: Vec<Result<Vec<f64>, ComputeError>> = if parallel {
            layer_slots
                .par_iter_mut()
                .zip(inputs.par_iter())
                .map(|(slot, upstream)| compute_slot(slot, upstream, timestep, layer))
                .collect()
        } else {
            layer_slots
                .iter_mut()
                .zip(inputs.iter())
                .map(|(slot, upstream)| compute_slot(slot, upstream, timestep, layer))
                .collect()
        };

        let computed = results.len();
        for (offset, result) in results.into_iter().enumerate() {
            let i = range.start + offset;
            let id = self.slots[i].id;
            let values = result.map_err(|e| SeError::step_failure(id, timestep, e.to_string()))?;

            let local = require!(
                self.task.subbasin(id),
                SeError::internal(format!("任务中缺少子流域 {}", id))
            );
            let frame = &mut self.frames[fi];
            if local.is_outlet() {
                frame.report.outlet_outputs.push((id, values.clone()));
            }
            if local.sends_remote() {
                self.buffer.stage_at(timestep, id, values.clone())?;
                frame.status[i] = NodeStatus::Exchanging;
            } else {
                frame.status[i] = NodeStatus::Complete;
            }
            frame.outputs.insert(id, values);
        }
        self.frames[fi].report.computed += computed;

        tracing::trace!(
            "Rank {} timestep {} layer {}: computed {} subbasins (parallel: {})",
            self.task.rank,
            timestep,
            layer,
            computed,
            parallel
        );
        self.metrics.record_channel(computed, start.elapsed());
        Ok(computed)
    }

    // ========================================================================
    // 交换
    // ========================================================================

    /// 非阻塞收取已到达的消息
    fn poll_inbox(&mut self) -> SeResult<()> {
        loop {
            let polled = match &self.transport {
                Some(transport) => transport.try_recv(),
                None => return Ok(()),
            };
            match polled {
                Ok(Some(message)) => {
                    self.handle_message(message)?;
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    // 对端全部退出，缺失数据会在等待时报告
                    tracing::debug!("Rank {}: poll failed: {}", self.task.rank, e);
                    return Ok(());
                }
            }
        }
    }

    /// 处理一条消息，返回安装到当前时间步的记录数
    ///
    /// 提前到达的后续时间步记录与同步消息都先保存，不计入返回值。
    fn handle_message(&mut self, message: ExchangeMessage) -> SeResult<usize> {
        match message {
            ExchangeMessage::Records { records, .. } => self.buffer.receive(records),
            ExchangeMessage::Abort {
                from,
                subbasin,
                timestep,
                reason,
            } => {
                self.abort_origin = Some(from);
                Err(SeError::step_failure(
                    subbasin,
                    timestep,
                    format!("进程 {} 中止: {}", from, reason),
                ))
            }
            ExchangeMessage::Sync { from, epoch } => {
                self.sync_marks.entry(epoch).or_default().insert(from);
                Ok(0)
            }
        }
    }

    /// 发送全部暂存记录，按 (时间步, 层, 目标进程) 分批，返回发送数
    fn flush(&mut self) -> SeResult<usize> {
        if self.buffer.staged() == 0 {
            return Ok(0);
        }
        let task = Arc::clone(&self.task);
        let records = self.buffer.drain();
        let sent = records.len();

        let mut batches: BTreeMap<(u64, u32, RankId), Vec<ExchangeRecord>> = BTreeMap::new();
        for record in records {
            let local = require!(
                task.subbasin(record.subbasin),
                SeError::internal(format!("任务中缺少子流域 {}", record.subbasin))
            );
            let rank = require!(
                local.downstream_rank,
                SeError::internal(format!("子流域 {} 没有远程下游", record.subbasin))
            );
            batches
                .entry((record.timestep, local.layer, rank))
                .or_default()
                .push(record);
        }

        let transport = require!(
            self.transport.as_ref(),
            SeError::internal("存在待发送记录但未提供传输层")
        );
        for ((timestep, layer, rank), records) in batches {
            if let Some(frame) = self.frames.iter_mut().find(|f| f.timestep == timestep) {
                for record in &records {
                    if let Some(&i) = self.slot_index.get(&record.subbasin) {
                        frame.status[i] = NodeStatus::Complete;
                    }
                }
                frame.report.records_sent += records.len();
            }
            transport.send(
                rank,
                ExchangeMessage::Records {
                    from: task.rank,
                    timestep,
                    layer,
                    records,
                },
            )?;
        }
        Ok(sent)
    }

    /// 空间调度的层边界交换轮次
    fn exchange_round(&mut self, timestep: u64, layer: u32) -> SeResult<()> {
        let task = Arc::clone(&self.task);
        let expected = task.expected_at(layer);
        if self.buffer.staged() == 0 && expected.is_empty() {
            return Ok(());
        }
        let start = Instant::now();

        let sent = self.flush()?;
        // 等待本层应收记录
        self.wait_for(timestep, expected)?;

        let received = expected.len();
        if let Some(frame) = self.frames.front_mut() {
            frame.report.exchange_rounds += 1;
            frame.report.records_received += received;
        }
        self.metrics
            .record_exchange(sent, received, start.elapsed());
        self.emit(SchedulerEvent::ExchangeRound {
            rank: task.rank,
            timestep,
            layer,
            sent,
            received,
        });
        Ok(())
    }

    /// 等待某时间步的一组远程上游记录全部到达
    fn wait_for(&mut self, timestep: u64, ids: &[SubbasinId]) -> SeResult<()> {
        let deadline = Instant::now() + self.config.exchange_timeout();
        loop {
            let missing = self.buffer.missing_at(timestep, ids);
            if missing.is_empty() {
                return Ok(());
            }
            if self.is_cancelled() {
                return Err(SeError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(self.missing_error(timestep, missing));
            }

            let transport = require!(
                self.transport.as_ref(),
                SeError::internal("等待远程记录但未提供传输层")
            );
            match transport.recv_timeout((deadline - now).min(POLL_SLICE)) {
                Ok(Some(message)) => {
                    self.handle_message(message)?;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Rank {}: exchange receive failed: {}", self.task.rank, e);
                    return Err(self.missing_error(timestep, missing));
                }
            }
        }
    }

    /// 同步点：每个同步周期开始时广播到达消息，并等待其他全部进程到达
    fn synchronize(&mut self, timestep: u64) -> SeResult<()> {
        if timestep == 0 || timestep % self.sync_period() != 0 {
            return Ok(());
        }
        let Some(transport) = self.transport.as_ref().filter(|t| t.process_count() > 1) else {
            return Ok(());
        };
        let peers = transport.process_count() - 1;
        transport.broadcast(&ExchangeMessage::Sync {
            from: self.task.rank,
            epoch: timestep,
        })?;

        let start = Instant::now();
        let deadline = start + self.config.exchange_timeout();
        loop {
            let arrived = self.sync_marks.get(&timestep).map_or(0, BTreeSet::len);
            if arrived >= peers {
                break;
            }
            if self.is_cancelled() {
                return Err(SeError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SeError::transport(format!(
                    "进程 {} 在时间步 {} 的同步点超时: {}/{} 个进程到达",
                    self.task.rank, timestep, arrived, peers
                )));
            }

            let transport = require!(
                self.transport.as_ref(),
                SeError::internal("同步点缺少传输层")
            );
            if let Some(message) = transport.recv_timeout((deadline - now).min(POLL_SLICE))? {
                self.handle_message(message)?;
            }
        }

        self.sync_marks = self.sync_marks.split_off(&(timestep + 1));
        tracing::debug!(
            "Rank {} passed sync point at timestep {} after {:?}",
            self.task.rank,
            timestep,
            start.elapsed()
        );
        Ok(())
    }

    /// 以首个受影响的本地子流域报告缺失
    fn missing_error(&self, timestep: u64, missing: Vec<SubbasinId>) -> SeError {
        let waiting = self
            .task
            .subbasins
            .values()
            .find(|s| s.remote_upstream.iter().any(|u| missing.contains(u)))
            .map_or(SubbasinId::OUTLET, |s| s.id);
        SeError::missing_upstream(waiting, timestep, missing)
    }
}

fn compute_slot(
    slot: &mut NodeSlot,
    upstream: &UpstreamInputs,
    timestep: u64,
    layer: u32,
) -> Result<Vec<f64>, ComputeError> {
    let contributions: Vec<UpstreamContribution<'_>> = upstream
        .iter()
        .map(|(subbasin, values, remote)| UpstreamContribution {
            subbasin: *subbasin,
            values,
            remote: *remote,
        })
        .collect();
    let ctx = StepContext {
        subbasin: slot.id,
        timestep,
        layer,
        substep: 0,
    };
    slot.model.compute(&ctx, &contributions)
}

impl std::fmt::Debug for Stepper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stepper")
            .field("rank", &self.task.rank)
            .field("subbasins", &self.slots.len())
            .field("schedule", &self.config.schedule)
            .field("has_transport", &self.transport.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{AccumulateModel, FnModel};
    use crate::exchange::channel_mesh;
    use crate::partition::{assign_tasks, PartitionOptions};
    use crate::topology::build_topology;
    use se_config::{PartitionStrategy, ScheduledOperation, Trigger};
    use std::sync::atomic::AtomicU32;

    fn tasks(pairs: &[(u32, u32)], processes: usize, strategy: PartitionStrategy) -> Vec<Arc<Task>> {
        let mut graph = build_topology(pairs).unwrap();
        let options = PartitionOptions::default().strategy(strategy);
        assign_tasks(&mut graph, processes, &options)
            .unwrap()
            .into_iter()
            .map(Arc::new)
            .collect()
    }

    fn accumulate(task: &Task, local_yield: f64) -> Vec<(SubbasinId, Box<dyn SubbasinModel>)> {
        task.local_ids()
            .map(|id| {
                let model: Box<dyn SubbasinModel> = Box::new(AccumulateModel::new(local_yield));
                (id, model)
            })
            .collect()
    }

    fn fast_config() -> StepperConfig {
        StepperConfig {
            exchange_timeout_ms: 200,
            ..Default::default()
        }
    }

    #[test]
    fn test_single_node_no_exchange() {
        let task = tasks(&[(1, 0)], 1, PartitionStrategy::SubtreeBlock).remove(0);
        let models = accumulate(&task, 2.0);
        let mut stepper = Stepper::new(task, models, fast_config(), None).unwrap();

        let report = stepper.run_timestep(0).unwrap();
        assert_eq!(report.computed, 1);
        assert_eq!(report.exchange_rounds, 0);
        assert_eq!(report.outlet_outputs, vec![(SubbasinId(1), vec![2.0])]);
        assert_eq!(stepper.status(SubbasinId(1)), Some(NodeStatus::Complete));
        assert_eq!(stepper.metrics().exchange_rounds, 0);
    }

    #[test]
    fn test_local_accumulation() {
        let task = tasks(&[(1, 3), (2, 3), (3, 5), (4, 5), (5, 0)], 1, PartitionStrategy::SubtreeBlock)
            .remove(0);
        let models = accumulate(&task, 1.0);
        let mut stepper = Stepper::new(task, models, fast_config(), None).unwrap();
        for t in 0..3 {
            let report = stepper.run_timestep(t).unwrap();
            assert_eq!(report.outlet_outputs, vec![(SubbasinId(5), vec![5.0])]);
        }
        assert_eq!(stepper.metrics().timesteps, 3);
        assert_eq!(stepper.metrics().nodes_computed, 15);
    }

    #[test]
    fn test_parallel_layer_matches_sequential() {
        let pairs: Vec<(u32, u32)> = (1..=8).map(|i| (i, 9)).chain([(9, 0)]).collect();
        let run = |parallel: bool| {
            let task = tasks(&pairs, 1, PartitionStrategy::SubtreeBlock).remove(0);
            let models = accumulate(&task, 0.5);
            let config = StepperConfig {
                parallel_layers: parallel,
                min_parallel_layer: 2,
                ..fast_config()
            };
            let mut stepper = Stepper::new(task, models, config, None).unwrap();
            stepper.run_timestep(0).unwrap().outlet_outputs
        };
        assert_eq!(run(true), run(false));
        assert_eq!(run(true), vec![(SubbasinId(9), vec![4.5])]);
    }

    #[test]
    fn test_hillslope_substeps() {
        let task = tasks(&[(1, 2), (2, 0)], 1, PartitionStrategy::SubtreeBlock).remove(0);
        let counter = Arc::new(AtomicU32::new(0));

        struct Counting(Arc<AtomicU32>);
        impl SubbasinModel for Counting {
            fn hillslope(&mut self, ctx: &StepContext) -> Result<(), ComputeError> {
                assert!(ctx.substep >= 1);
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            fn compute(
                &mut self,
                _ctx: &StepContext,
                _upstream: &[UpstreamContribution<'_>],
            ) -> Result<Vec<f64>, ComputeError> {
                Ok(vec![0.0])
            }
        }

        let models: Vec<(SubbasinId, Box<dyn SubbasinModel>)> = task
            .local_ids()
            .map(|id| {
                let model: Box<dyn SubbasinModel> = Box::new(Counting(counter.clone()));
                (id, model)
            })
            .collect();
        let config = StepperConfig {
            hillslope_substeps: 4,
            ..fast_config()
        };
        let mut stepper = Stepper::new(task, models, config, None).unwrap();
        stepper.run_timestep(0).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_compute_failure() {
        let task = tasks(&[(1, 2), (2, 0)], 1, PartitionStrategy::SubtreeBlock).remove(0);
        let models: Vec<(SubbasinId, Box<dyn SubbasinModel>)> = task
            .local_ids()
            .map(|id| {
                let model: Box<dyn SubbasinModel> = Box::new(FnModel::new(
                    move |ctx: &StepContext, _: &[UpstreamContribution<'_>]| {
                        if ctx.subbasin == SubbasinId(1) && ctx.timestep == 2 {
                            Err(ComputeError::NonConvergence { iterations: 50 })
                        } else {
                            Ok(vec![1.0])
                        }
                    },
                ));
                (id, model)
            })
            .collect();
        let mut stepper = Stepper::new(task, models, fast_config(), None).unwrap();
        stepper.run_timestep(0).unwrap();
        stepper.run_timestep(1).unwrap();

        let err = stepper.run_timestep(2).unwrap_err();
        assert_eq!(err.kind(), "StepFailure");
        assert_eq!(err.subbasin(), Some(SubbasinId(1)));
        assert_eq!(err.timestep(), Some(2));
        // 下游不会被计算
        assert_eq!(stepper.status(SubbasinId(2)), Some(NodeStatus::Pending));
    }

    #[test]
    fn test_two_ranks_exchange() {
        // 轮转: 1, 3 在进程 0；2 在进程 1
        let tasks = tasks(&[(1, 3), (2, 3), (3, 0)], 2, PartitionStrategy::LayerRoundRobin);
        let mut mesh = channel_mesh(2);
        let t1 = mesh.pop().unwrap();
        let t0 = mesh.pop().unwrap();

        let models0 = accumulate(&tasks[0], 1.0);
        let models1 = accumulate(&tasks[1], 10.0);
        let mut s0 = Stepper::new(tasks[0].clone(), models0, fast_config(), Some(Box::new(t0))).unwrap();
        let mut s1 = Stepper::new(tasks[1].clone(), models1, fast_config(), Some(Box::new(t1))).unwrap();

        let (r0, r1) = std::thread::scope(|scope| {
            let h = scope.spawn(move || {
                let reports: Vec<StepReport> = (0..3).map(|t| s1.run_timestep(t).unwrap()).collect();
                reports
            });
            let r0: Vec<StepReport> = (0..3).map(|t| s0.run_timestep(t).unwrap()).collect();
            (r0, h.join().unwrap())
        });

        for report in &r0 {
            assert_eq!(report.outlet_outputs, vec![(SubbasinId(3), vec![12.0])]);
            assert_eq!(report.records_received, 1);
            assert_eq!(report.exchange_rounds, 1);
        }
        for report in &r1 {
            assert_eq!(report.records_sent, 1);
            assert!(report.outlet_outputs.is_empty());
        }
    }

    #[test]
    fn test_missing_upstream_times_out() {
        let tasks = tasks(&[(1, 3), (2, 3), (3, 0)], 2, PartitionStrategy::LayerRoundRobin);
        let mut mesh = channel_mesh(2);
        let _idle_peer = mesh.pop().unwrap();
        let t0 = mesh.pop().unwrap();

        let config = StepperConfig {
            exchange_timeout_ms: 50,
            ..Default::default()
        };
        let models = accumulate(&tasks[0], 1.0);
        let mut stepper = Stepper::new(tasks[0].clone(), models, config, Some(Box::new(t0))).unwrap();

        let started = Instant::now();
        let err = stepper.run_timestep(0).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            SeError::MissingUpstream {
                subbasin,
                timestep,
                missing,
            } => {
                assert_eq!(subbasin, SubbasinId(3));
                assert_eq!(timestep, 0);
                assert_eq!(missing, vec![SubbasinId(2)]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cancel_while_waiting() {
        let tasks = tasks(&[(1, 3), (2, 3), (3, 0)], 2, PartitionStrategy::LayerRoundRobin);
        let mut mesh = channel_mesh(2);
        let _idle_peer = mesh.pop().unwrap();
        let t0 = mesh.pop().unwrap();

        let cancel = Arc::new(AtomicBool::new(true));
        let models = accumulate(&tasks[0], 1.0);
        let mut stepper = Stepper::new(tasks[0].clone(), models, StepperConfig::default(), Some(Box::new(t0)))
            .unwrap()
            .with_cancel_token(cancel);
        assert!(matches!(stepper.run_timestep(0), Err(SeError::Cancelled)));
    }

    #[test]
    fn test_abort_received_from_peer() {
        let tasks = tasks(&[(1, 3), (2, 3), (3, 0)], 2, PartitionStrategy::LayerRoundRobin);
        let mut mesh = channel_mesh(2);
        let peer = mesh.pop().unwrap();
        let t0 = mesh.pop().unwrap();
        peer.send(
            RankId(0),
            ExchangeMessage::Abort {
                from: RankId(1),
                subbasin: SubbasinId(2),
                timestep: 0,
                reason: "不收敛".into(),
            },
        )
        .unwrap();

        let models = accumulate(&tasks[0], 1.0);
        let mut stepper = Stepper::new(tasks[0].clone(), models, fast_config(), Some(Box::new(t0))).unwrap();
        let err = stepper.run_timestep(0).unwrap_err();
        assert_eq!(err.kind(), "StepFailure");
        assert_eq!(err.subbasin(), Some(SubbasinId(2)));
        assert_eq!(stepper.abort_origin(), Some(RankId(1)));
        // 收到中止的进程不再转播
        assert_eq!(peer.try_recv().unwrap(), None);
    }

    #[test]
    fn test_management_before_step() {
        let task = tasks(&[(1, 2), (2, 0)], 1, PartitionStrategy::SubtreeBlock).remove(0);
        let models = accumulate(&task, 1.0);
        let mut stepper = Stepper::new(task, models, fast_config(), None).unwrap();
        let process = ManagementProcess::new(&se_config::ManagementConfig {
            operations: vec![ScheduledOperation::new("irrigate", Trigger::At { timesteps: vec![1] })
                .with_parameter("adjustment", 2.0)
                .with_subbasins([SubbasinId(1)])],
        });

        assert_eq!(stepper.apply_management(&process, 0).unwrap().applications, 0);
        assert_eq!(stepper.run_timestep(0).unwrap().outlet_outputs[0].1, vec![2.0]);
        assert_eq!(stepper.apply_management(&process, 1).unwrap().applications, 1);
        assert_eq!(stepper.run_timestep(1).unwrap().outlet_outputs[0].1, vec![4.0]);
    }

    #[test]
    fn test_model_coverage_checked() {
        let task = tasks(&[(1, 2), (2, 0)], 1, PartitionStrategy::SubtreeBlock).remove(0);
        let mut models = accumulate(&task, 1.0);
        models.pop();
        let err = Stepper::new(task.clone(), models, fast_config(), None).unwrap_err();
        assert_eq!(err.kind(), "ConfigError");

        let mut models = accumulate(&task, 1.0);
        models.push((SubbasinId(9), Box::new(AccumulateModel::new(0.0)) as Box<dyn SubbasinModel>));
        assert!(Stepper::new(task, models, fast_config(), None).is_err());
    }

    #[test]
    fn test_transport_required_for_remote_links() {
        let tasks = tasks(&[(1, 3), (2, 3), (3, 0)], 2, PartitionStrategy::LayerRoundRobin);
        let models = accumulate(&tasks[0], 1.0);
        let err = Stepper::new(tasks[0].clone(), models, fast_config(), None).unwrap_err();
        assert_eq!(err.kind(), "ConfigError");

        let mut mesh = channel_mesh(2);
        let wrong_rank = mesh.pop().unwrap();
        let models = accumulate(&tasks[0], 1.0);
        assert!(Stepper::new(tasks[0].clone(), models, fast_config(), Some(Box::new(wrong_rank))).is_err());
    }

    fn run_pair(config: StepperConfig, timesteps: u64) -> (Vec<StepReport>, Vec<StepReport>) {
        let tasks = tasks(&[(1, 3), (2, 3), (3, 0)], 2, PartitionStrategy::LayerRoundRobin);
        let mut mesh = channel_mesh(2);
        let t1 = mesh.pop().unwrap();
        let t0 = mesh.pop().unwrap();

        let models0 = accumulate(&tasks[0], 1.0);
        let models1 = accumulate(&tasks[1], 10.0);
        let mut s0 = Stepper::new(tasks[0].clone(), models0, config.clone(), Some(Box::new(t0)))
            .unwrap()
            .with_horizon(timesteps);
        let mut s1 = Stepper::new(tasks[1].clone(), models1, config, Some(Box::new(t1)))
            .unwrap()
            .with_horizon(timesteps);

        std::thread::scope(|scope| {
            let h = scope.spawn(move || {
                let reports: Vec<StepReport> =
                    (0..timesteps).map(|t| s1.run_timestep(t).unwrap()).collect();
                reports
            });
            let r0: Vec<StepReport> = (0..timesteps).map(|t| s0.run_timestep(t).unwrap()).collect();
            (r0, h.join().unwrap())
        })
    }

    #[test]
    fn test_upstream_rank_blocks_at_sync_point() {
        // 进程 1 只有上游子流域 2，从不等待记录
        let tasks = tasks(&[(1, 3), (2, 3), (3, 0)], 2, PartitionStrategy::LayerRoundRobin);
        let mut mesh = channel_mesh(2);
        let t1 = mesh.pop().unwrap();
        let idle_peer = mesh.pop().unwrap();

        let config = StepperConfig {
            time_slices: 2,
            exchange_timeout_ms: 100,
            ..Default::default()
        };
        let models = accumulate(&tasks[1], 1.0);
        let mut stepper = Stepper::new(tasks[1].clone(), models, config, Some(Box::new(t1))).unwrap();
        assert_eq!(stepper.sync_period(), 4);

        let mut completed = 0;
        let err = loop {
            match stepper.run_timestep(completed) {
                Ok(_) => completed += 1,
                Err(e) => break e,
            }
            assert!(completed < 100, "上游进程没有在同步点停下");
        };
        assert_eq!(completed, 4);
        assert_eq!(err.kind(), "TransportError");

        let mut records = 0;
        let mut epochs = Vec::new();
        while let Some(message) = idle_peer.try_recv().unwrap() {
            match message {
                ExchangeMessage::Records { .. } => records += 1,
                ExchangeMessage::Sync { epoch, .. } => epochs.push(epoch),
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert_eq!(records, 4);
        assert_eq!(epochs, vec![4]);
    }

    #[test]
    fn test_sync_points_with_peer() {
        for schedule in [ScheduleMethod::Spatial, ScheduleMethod::TemporoSpatial] {
            let config = StepperConfig {
                time_slices: 1,
                schedule,
                ..fast_config()
            };
            let (r0, r1) = run_pair(config, 7);
            assert_eq!(r0.len(), 7);
            for (t, report) in r0.iter().enumerate() {
                assert_eq!(report.timestep, t as u64);
                assert_eq!(report.outlet_outputs, vec![(SubbasinId(3), vec![12.0])]);
                assert_eq!(report.records_received, 1);
            }
            assert_eq!(r1.iter().map(|r| r.records_sent).sum::<usize>(), 7);
        }
    }

    /// 检查调用顺序：时间步严格递增，每步先管理与坡面，后河道
    struct OrderedModel {
        local_yield: f64,
        adjustment: f64,
        computed: Option<u64>,
        hillslope: Option<u64>,
    }

    impl OrderedModel {
        fn next_timestep(&self) -> u64 {
            self.computed.map_or(0, |t| t + 1)
        }
    }

    impl SubbasinModel for OrderedModel {
        fn hillslope(&mut self, ctx: &StepContext) -> Result<(), ComputeError> {
            if ctx.timestep != self.next_timestep() {
                return Err(ComputeError::InvalidState(format!("坡面时间步 {}", ctx.timestep)));
            }
            self.hillslope = Some(ctx.timestep);
            Ok(())
        }

        fn compute(
            &mut self,
            ctx: &StepContext,
            upstream: &[UpstreamContribution<'_>],
        ) -> Result<Vec<f64>, ComputeError> {
            if self.hillslope != Some(ctx.timestep) {
                return Err(ComputeError::InvalidState(format!("河道时间步 {}", ctx.timestep)));
            }
            self.computed = Some(ctx.timestep);
            let inflow: f64 = upstream.iter().map(|c| c.values[0]).sum();
            Ok(vec![self.local_yield * (ctx.timestep + 1) as f64 + self.adjustment + inflow])
        }

        fn manage(&mut self, operation: &ScheduledOperation, timestep: u64) -> Result<(), ComputeError> {
            if timestep != self.next_timestep() {
                return Err(ComputeError::InvalidState(format!("管理时间步 {}", timestep)));
            }
            self.adjustment += operation.parameters.get("adjustment").copied().unwrap_or(0.0);
            Ok(())
        }
    }

    fn ordered(task: &Task) -> Vec<(SubbasinId, Box<dyn SubbasinModel>)> {
        task.local_ids()
            .map(|id| {
                let model: Box<dyn SubbasinModel> = Box::new(OrderedModel {
                    local_yield: id.get() as f64,
                    adjustment: 0.0,
                    computed: None,
                    hillslope: None,
                });
                (id, model)
            })
            .collect()
    }

    #[test]
    fn test_temporo_spatial_matches_spatial() {
        let pairs = [(1, 3), (2, 3), (3, 5), (4, 5), (5, 6), (6, 0)];
        let process = Arc::new(ManagementProcess::new(&se_config::ManagementConfig {
            operations: vec![ScheduledOperation::new("fertilize", Trigger::Every { interval: 3, offset: 1 })
                .with_parameter("adjustment", 0.5)
                .with_subbasins([SubbasinId(1), SubbasinId(5)])],
        }));
        let run = |schedule: ScheduleMethod| {
            let task = tasks(&pairs, 1, PartitionStrategy::SubtreeBlock).remove(0);
            let models = ordered(&task);
            let config = StepperConfig {
                schedule,
                hillslope_substeps: 2,
                ..fast_config()
            };
            let mut stepper = Stepper::new(task, models, config, None)
                .unwrap()
                .with_management(Arc::clone(&process))
                .with_horizon(8);
            let outputs: Vec<Vec<(SubbasinId, Vec<f64>)>> = (0..8)
                .map(|t| stepper.run_timestep(t).unwrap().outlet_outputs)
                .collect();
            assert_eq!(stepper.metrics().timesteps, 8);
            assert_eq!(stepper.metrics().nodes_computed, 48);
            outputs
        };

        let spatial = run(ScheduleMethod::Spatial);
        assert_eq!(spatial[0], vec![(SubbasinId(6), vec![21.0])]);
        // 时间步 1 起 1 和 5 各修正 0.5
        assert_eq!(spatial[1], vec![(SubbasinId(6), vec![43.0])]);
        assert_eq!(run(ScheduleMethod::TemporoSpatial), spatial);
    }

    #[test]
    fn test_temporo_spatial_runs_ahead() {
        let task = tasks(&[(1, 2), (2, 0)], 1, PartitionStrategy::SubtreeBlock).remove(0);
        let models = accumulate(&task, 1.0);
        let config = StepperConfig {
            schedule: ScheduleMethod::TemporoSpatial,
            ..fast_config()
        };
        let mut stepper = Stepper::new(task, models, config, None).unwrap().with_horizon(3);

        // 第 0 轮同时算完时间步 1 的第 1 层
        let report = stepper.run_timestep(0).unwrap();
        assert_eq!(report.outlet_outputs, vec![(SubbasinId(2), vec![2.0])]);
        assert_eq!(report.computed, 2);
        assert_eq!(stepper.metrics().nodes_computed, 3);

        assert_eq!(stepper.run_timestep(2).unwrap_err().kind(), "InternalError");
        assert_eq!(stepper.run_timestep(1).unwrap().computed, 2);
        assert_eq!(stepper.status(SubbasinId(2)), Some(NodeStatus::Complete));
        stepper.run_timestep(2).unwrap();
        assert_eq!(stepper.metrics().nodes_computed, 6);
        assert_eq!(stepper.run_timestep(3).unwrap_err().kind(), "InternalError");
    }

    #[test]
    fn test_management_failure_aborts_peers() {
        struct Unmanageable;
        impl SubbasinModel for Unmanageable {
            fn compute(
                &mut self,
                _ctx: &StepContext,
                _upstream: &[UpstreamContribution<'_>],
            ) -> Result<Vec<f64>, ComputeError> {
                Ok(vec![1.0])
            }
            fn manage(&mut self, _operation: &ScheduledOperation, _timestep: u64) -> Result<(), ComputeError> {
                Err(ComputeError::Failed("缺少作物参数".into()))
            }
        }

        let tasks = tasks(&[(1, 3), (2, 3), (3, 0)], 2, PartitionStrategy::LayerRoundRobin);
        let mut mesh = channel_mesh(2);
        let t1 = mesh.pop().unwrap();
        let t0 = mesh.pop().unwrap();
        let process = Arc::new(ManagementProcess::new(&se_config::ManagementConfig {
            operations: vec![ScheduledOperation::new("plant", Trigger::At { timesteps: vec![0] })
                .with_subbasins([SubbasinId(2)])],
        }));

        let model: Box<dyn SubbasinModel> = Box::new(Unmanageable);
        let models1 = vec![(SubbasinId(2), model)];
        let models0 = accumulate(&tasks[0], 1.0);
        let mut s0 = Stepper::new(tasks[0].clone(), models0, fast_config(), Some(Box::new(t0))).unwrap();
        let mut s1 = Stepper::new(tasks[1].clone(), models1, fast_config(), Some(Box::new(t1)))
            .unwrap()
            .with_management(process);

        let (e0, e1) = std::thread::scope(|scope| {
            let h = scope.spawn(move || s1.run_timestep(0).unwrap_err());
            let e0 = s0.run_timestep(0).unwrap_err();
            (e0, h.join().unwrap())
        });
        assert_eq!(e1.kind(), "ManagementFailure");
        assert_eq!(e0.kind(), "StepFailure");
        assert_eq!(e0.subbasin(), Some(SubbasinId(2)));
        assert_eq!(e0.timestep(), Some(0));
    }
}
