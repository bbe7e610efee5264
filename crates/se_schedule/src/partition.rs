// crates/se_schedule/src/partition.rs

//! 分层排序与任务分配
//!
//! 对已验证的拓扑：
//!
//! 1. 自底向上序：Kahn 式逐层剥离，源头为第 1 层，
//!    每个节点的序严格大于其所有上游
//! 2. 自顶向下序：从出口做广度优先分层，`order = max_depth - depth + 1`，
//!    每个节点的序严格小于其下游
//! 3. 按分组策略把每个子流域分配到 P 个进程之一
//! 4. 为每个进程生成 [`Task`]
//!
//! 分组只影响负载均衡，不影响正确性；两套排序与分组结果无关。

use std::collections::{BTreeMap, VecDeque};

use se_config::{LayeringMethod, PartitionStrategy, SchedulerConfig};
use se_foundation::{PartitionError, RankId, SubbasinId};

use crate::topology::Topology;

// ============================================================
// 选项
// ============================================================

/// 任务分配选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionOptions {
    /// 分组策略
    pub strategy: PartitionStrategy,
    /// 分层方法
    pub layering: LayeringMethod,
}

impl PartitionOptions {
    /// 设置分组策略
    pub fn strategy(mut self, strategy: PartitionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// 设置分层方法
    pub fn layering(mut self, layering: LayeringMethod) -> Self {
        self.layering = layering;
        self
    }
}

impl From<&SchedulerConfig> for PartitionOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            strategy: config.partition,
            layering: config.layering,
        }
    }
}

// ============================================================
// 任务
// ============================================================

/// 驻留在某进程中的子流域
#[derive(Debug, Clone, PartialEq)]
pub struct LocalSubbasin {
    /// 子流域 ID
    pub id: SubbasinId,
    /// 下游子流域
    pub downstream: Option<SubbasinId>,
    /// 下游位于其他进程时的目标进程
    pub downstream_rank: Option<RankId>,
    /// 全部上游
    pub upstream: Vec<SubbasinId>,
    /// 同进程上游
    pub local_upstream: Vec<SubbasinId>,
    /// 其他进程上游，需经交换边界接收
    pub remote_upstream: Vec<SubbasinId>,
    /// 执行层
    pub layer: u32,
    /// 自底向上序
    pub bottom_up_order: u32,
    /// 自顶向下序
    pub top_down_order: u32,
    /// 负载权重
    pub weight: f64,
}

impl LocalSubbasin {
    /// 输出是否需要跨进程发送
    #[inline]
    pub fn sends_remote(&self) -> bool {
        self.downstream_rank.is_some()
    }

    /// 是否为流域出口
    #[inline]
    pub fn is_outlet(&self) -> bool {
        self.downstream.is_none()
    }
}

/// 单进程任务描述
///
/// 一次构建，运行期间只读，通过 `Arc<Task>` 在本进程线程间共享。
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// 进程编号
    pub rank: RankId,
    /// 进程总数
    pub process_count: usize,
    /// 分层方法
    pub layering: LayeringMethod,
    /// 驻留子流域
    pub subbasins: BTreeMap<SubbasinId, LocalSubbasin>,
    /// 本地子流域按层分组 (层内 ID 升序)
    pub layers: BTreeMap<u32, Vec<SubbasinId>>,
    /// 全局最大层
    pub global_max_layer: u32,
    /// 本地最大层
    pub max_layer: u32,
    /// 需要跨越等待的最大层差 (本地节点层 - 远程上游层 的最大值)
    pub max_layer_depth: u32,
    /// 各层交换轮次结束时应收到的远程上游记录
    pub expected: BTreeMap<u32, Vec<SubbasinId>>,
    /// 传输缓冲预分配容量 (发送 + 接收记录数)
    pub transfer_capacity: usize,
}

impl Task {
    /// 本地子流域数
    pub fn len(&self) -> usize {
        self.subbasins.len()
    }

    /// 是否没有本地子流域
    pub fn is_empty(&self) -> bool {
        self.subbasins.is_empty()
    }

    /// 是否驻留该子流域
    pub fn contains(&self, id: SubbasinId) -> bool {
        self.subbasins.contains_key(&id)
    }

    /// 查找本地子流域
    pub fn subbasin(&self, id: SubbasinId) -> Option<&LocalSubbasin> {
        self.subbasins.get(&id)
    }

    /// 本地子流域 ID (升序)
    pub fn local_ids(&self) -> impl Iterator<Item = SubbasinId> + '_ {
        self.subbasins.keys().copied()
    }

    /// 某层的本地子流域
    pub fn layer(&self, layer: u32) -> &[SubbasinId] {
        self.layers.get(&layer).map_or(&[], Vec::as_slice)
    }

    /// 某层交换轮次应收到的远程记录
    pub fn expected_at(&self, layer: u32) -> &[SubbasinId] {
        self.expected.get(&layer).map_or(&[], Vec::as_slice)
    }

    /// 本地子流域的远程上游
    pub fn remote_upstream_of(&self, id: SubbasinId) -> &[SubbasinId] {
        self.subbasins
            .get(&id)
            .map_or(&[], |s| s.remote_upstream.as_slice())
    }

    /// 某层需要跨进程发送输出的本地子流域数
    pub fn sends_at(&self, layer: u32) -> usize {
        self.layer(layer)
            .iter()
            .filter(|id| self.subbasins.get(*id).is_some_and(LocalSubbasin::sends_remote))
            .count()
    }

    /// 是否存在跨进程依赖
    pub fn has_remote_links(&self) -> bool {
        self.subbasins
            .values()
            .any(|s| s.sends_remote() || !s.remote_upstream.is_empty())
    }

    /// 本地驻留的流域出口
    pub fn local_outlets(&self) -> Vec<SubbasinId> {
        self.subbasins
            .values()
            .filter(|s| s.is_outlet())
            .map(|s| s.id)
            .collect()
    }
}

// ============================================================
// 分配统计
// ============================================================

/// 分配结果统计
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionSummary {
    /// 进程数
    pub process_count: usize,
    /// 各进程子流域数
    pub node_counts: Vec<usize>,
    /// 各进程权重和
    pub weights: Vec<f64>,
    /// 跨进程的上下游边数
    pub cut_edges: usize,
    /// 全局最大层
    pub max_layer: u32,
}

impl PartitionSummary {
    /// 由已分配的拓扑统计
    ///
    /// 拓扑中的分组多于 `process_count` 时按实际分组数统计。
    pub fn from_topology(graph: &Topology, process_count: usize, layering: LayeringMethod) -> Self {
        let process_count = graph
            .nodes()
            .iter()
            .filter_map(|n| n.group)
            .map(|g| g.index() + 1)
            .fold(process_count, usize::max);
        let mut node_counts = vec![0; process_count];
        let mut weights = vec![0.0; process_count];
        let mut cut_edges = 0;
        let mut max_layer = 0;

        for node in graph.nodes() {
            if let Some(group) = node.group {
                node_counts[group.index()] += 1;
                weights[group.index()] += node.weight;
            }
            max_layer = max_layer.max(layer_of(node.bottom_up_order, node.top_down_order, layering));
            let down_group = node
                .downstream
                .and_then(|d| graph.node(d))
                .and_then(|d| d.group);
            if down_group.is_some() && down_group != node.group {
                cut_edges += 1;
            }
        }

        Self {
            process_count,
            node_counts,
            weights,
            cut_edges,
            max_layer,
        }
    }

    /// 负载不均衡度：最大权重 / 平均权重
    pub fn imbalance(&self) -> f64 {
        let total: f64 = self.weights.iter().sum();
        if total <= 0.0 || self.process_count == 0 {
            return 1.0;
        }
        let mean = total / self.process_count as f64;
        self.weights.iter().copied().fold(0.0, f64::max) / mean
    }
}

// ============================================================
// 排序
// ============================================================

#[inline]
fn layer_of(bottom_up: u32, top_down: u32, layering: LayeringMethod) -> u32 {
    match layering {
        LayeringMethod::UpDown => bottom_up,
        LayeringMethod::DownUp => top_down,
    }
}

/// 计算自底向上序 (Kahn 逐层剥离)，返回最大层
pub fn compute_bottom_up_order(graph: &mut Topology) -> u32 {
    let mut pending: Vec<usize> = graph.nodes().iter().map(|n| n.upstream.len()).collect();
    let downstream: Vec<Option<usize>> = graph
        .nodes()
        .iter()
        .map(|n| n.downstream.and_then(|d| graph.index_of(d)))
        .collect();

    let mut frontier: Vec<usize> = (0..pending.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = vec![0u32; pending.len()];
    let mut level = 0;

    while !frontier.is_empty() {
        level += 1;
        let mut next = Vec::new();
        for &i in &frontier {
            order[i] = level;
            if let Some(d) = downstream[i] {
                pending[d] -= 1;
                if pending[d] == 0 {
                    next.push(d);
                }
            }
        }
        next.sort_unstable();
        frontier = next;
    }

    for (node, o) in graph.nodes_mut().iter_mut().zip(order) {
        node.bottom_up_order = o;
    }
    level
}

/// 计算自顶向下序 (从出口广度优先)，返回最大层
pub fn compute_top_down_order(graph: &mut Topology) -> u32 {
    let n = graph.len();
    let mut depth = vec![0u32; n];
    let mut queue: VecDeque<usize> = graph
        .outlets()
        .iter()
        .filter_map(|&id| graph.index_of(id))
        .collect();
    let mut max_depth = 0;

    while let Some(i) = queue.pop_front() {
        let d = depth[i];
        max_depth = max_depth.max(d);
        for up in &graph.nodes()[i].upstream {
            if let Some(u) = graph.index_of(*up) {
                depth[u] = d + 1;
                queue.push_back(u);
            }
        }
    }

    for (node, d) in graph.nodes_mut().iter_mut().zip(depth) {
        node.top_down_order = max_depth - d + 1;
    }
    max_depth + 1
}

// ============================================================
// 分组策略
// ============================================================

/// 上游优先的深度优先后序：每个节点排在其全部上游之后，支流整段连续
fn upstream_first_sequence(graph: &Topology) -> Vec<usize> {
    let mut sequence = Vec::with_capacity(graph.len());
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for outlet in graph.outlets() {
        let Some(root) = graph.index_of(*outlet) else {
            continue;
        };
        stack.push((root, 0));
        while let Some(top) = stack.last_mut() {
            let (i, child) = *top;
            let upstream = &graph.nodes()[i].upstream;
            if child < upstream.len() {
                top.1 += 1;
                if let Some(u) = graph.index_of(upstream[child]) {
                    stack.push((u, 0));
                }
            } else {
                sequence.push(i);
                stack.pop();
            }
        }
    }
    sequence
}

/// 加权连续分块：节点权重中点越过当前组的累计目标时开新组
fn assign_subtree_blocks(graph: &Topology, process_count: usize) -> Vec<usize> {
    let sequence = upstream_first_sequence(graph);
    let total: f64 = graph.nodes().iter().map(|n| n.weight).sum();
    let target = total / process_count as f64;

    let mut groups = vec![0; graph.len()];
    let mut group = 0;
    let mut acc = 0.0;
    let mut in_group = 0;

    for (pos, &i) in sequence.iter().enumerate() {
        let remaining = sequence.len() - pos;
        let later_groups = process_count - 1 - group;
        let weight = graph.nodes()[i].weight;
        let reached = acc + 0.5 * weight >= target * (group + 1) as f64;
        if in_group > 0 && later_groups > 0 && (reached || remaining == later_groups) {
            group += 1;
            in_group = 0;
        }
        groups[i] = group;
        acc += weight;
        in_group += 1;
    }
    groups
}

/// 按自底向上序轮转分配
fn assign_layer_round_robin(graph: &Topology, process_count: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..graph.len()).collect();
    indices.sort_by_key(|&i| (graph.nodes()[i].bottom_up_order, graph.nodes()[i].id));

    let mut groups = vec![0; graph.len()];
    for (k, i) in indices.into_iter().enumerate() {
        groups[i] = k % process_count;
    }
    groups
}

/// 使用预处理给出的分组提示
fn assign_hinted(graph: &Topology, process_count: usize) -> Result<Vec<usize>, PartitionError> {
    graph
        .nodes()
        .iter()
        .map(|n| {
            let group = n.group_hint.ok_or(PartitionError::MissingGroupHint(n.id))?;
            if group >= process_count {
                return Err(PartitionError::GroupOutOfRange {
                    id: n.id,
                    group,
                    processes: process_count,
                });
            }
            Ok(group)
        })
        .collect()
}

// ============================================================
// 任务分配
// ============================================================

/// 计算排序、分组并生成每个进程的任务
///
/// 成功后拓扑中每个节点的 `group`、`bottom_up_order`、`top_down_order` 均已填写。
///
/// # 错误
///
/// - `P == 0` 或 `P` 超过子流域数
/// - 分组提示缺失或越界 (`Hinted` 策略)
/// - 有子流域未分配或有分组为空
pub fn assign_tasks(
    graph: &mut Topology,
    process_count: usize,
    options: &PartitionOptions,
) -> Result<Vec<Task>, PartitionError> {
    // 失败时拓扑保持未分配状态
    for node in graph.nodes_mut() {
        node.group = None;
    }
    if process_count == 0 {
        return Err(PartitionError::ZeroProcesses);
    }
    if process_count > graph.len() {
        return Err(PartitionError::TooManyProcesses {
            processes: process_count,
            nodes: graph.len(),
        });
    }

    let bottom_up_max = compute_bottom_up_order(graph);
    let top_down_max = compute_top_down_order(graph);
    tracing::debug!(
        "Orders computed: bottom-up max {}, top-down max {}",
        bottom_up_max,
        top_down_max
    );

    let groups = match options.strategy {
        PartitionStrategy::SubtreeBlock => assign_subtree_blocks(graph, process_count),
        PartitionStrategy::LayerRoundRobin => assign_layer_round_robin(graph, process_count),
        PartitionStrategy::Hinted => assign_hinted(graph, process_count)?,
    };

    // 覆盖性检查，通过后才写入拓扑
    let mut counts = vec![0usize; process_count];
    for (i, node) in graph.nodes().iter().enumerate() {
        let group = groups.get(i).copied().ok_or(PartitionError::Unassigned(node.id))?;
        let count = counts
            .get_mut(group)
            .ok_or(PartitionError::Unassigned(node.id))?;
        *count += 1;
    }
    if let Some(empty) = counts.iter().position(|&c| c == 0) {
        return Err(PartitionError::EmptyGroup(RankId(empty)));
    }

    for (node, group) in graph.nodes_mut().iter_mut().zip(groups) {
        node.group = Some(RankId(group));
    }

    let tasks = build_tasks(graph, process_count, options.layering);

    let summary = PartitionSummary::from_topology(graph, process_count, options.layering);
    tracing::info!(
        "Assigned {} subbasins to {} processes ({:?}, {}): counts {:?}, cut edges {}, imbalance {:.2}",
        graph.len(),
        process_count,
        options.strategy,
        options.layering,
        summary.node_counts,
        summary.cut_edges,
        summary.imbalance()
    );

    Ok(tasks)
}

fn build_tasks(graph: &Topology, process_count: usize, layering: LayeringMethod) -> Vec<Task> {
    let group_of = |id: SubbasinId| graph.node(id).and_then(|n| n.group);
    let layer_by_id = |id: SubbasinId| {
        graph
            .node(id)
            .map_or(0, |n| layer_of(n.bottom_up_order, n.top_down_order, layering))
    };
    let global_max_layer = graph
        .nodes()
        .iter()
        .map(|n| layer_of(n.bottom_up_order, n.top_down_order, layering))
        .max()
        .unwrap_or(0);

    let mut tasks: Vec<Task> = (0..process_count)
        .map(|p| Task {
            rank: RankId(p),
            process_count,
            layering,
            subbasins: BTreeMap::new(),
            layers: BTreeMap::new(),
            global_max_layer,
            max_layer: 0,
            max_layer_depth: 0,
            expected: BTreeMap::new(),
            transfer_capacity: 0,
        })
        .collect();

    for node in graph.nodes() {
        let Some(rank) = node.group else {
            continue;
        };
        let layer = layer_of(node.bottom_up_order, node.top_down_order, layering);
        let (local_upstream, remote_upstream): (Vec<SubbasinId>, Vec<SubbasinId>) = node
            .upstream
            .iter()
            .copied()
            .partition(|&u| group_of(u) == Some(rank));
        let downstream_rank = node
            .downstream
            .and_then(group_of)
            .filter(|&r| r != rank);

        let task = &mut tasks[rank.index()];
        for &u in &remote_upstream {
            let up_layer = layer_by_id(u);
            task.expected.entry(up_layer).or_default().push(u);
            task.max_layer_depth = task.max_layer_depth.max(layer.saturating_sub(up_layer));
        }
        task.transfer_capacity += remote_upstream.len() + usize::from(downstream_rank.is_some());
        task.max_layer = task.max_layer.max(layer);
        task.layers.entry(layer).or_default().push(node.id);
        task.subbasins.insert(
            node.id,
            LocalSubbasin {
                id: node.id,
                downstream: node.downstream,
                downstream_rank,
                upstream: node.upstream.clone(),
                local_upstream,
                remote_upstream,
                layer,
                bottom_up_order: node.bottom_up_order,
                top_down_order: node.top_down_order,
                weight: node.weight,
            },
        );
    }

    for task in &mut tasks {
        for ids in task.expected.values_mut() {
            ids.sort_unstable();
        }
        tracing::debug!(
            "Task {}: {} subbasins, layers 1..={}, {} remote inputs, wait depth {}",
            task.rank,
            task.len(),
            task.max_layer,
            task.expected.values().map(Vec::len).sum::<usize>(),
            task.max_layer_depth
        );
    }
    tasks
}
