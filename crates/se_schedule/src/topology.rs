// crates/se_schedule/src/topology.rs

//! 河网拓扑构建
//!
//! 由 (子流域, 下游) 对构建子流域有向图，并验证其为汇聚森林：
//! 除出口外每个子流域恰有一个下游，无环，每条下游链都终止于出口。
//!
//! 图以 arena 形式存储：节点按 ID 升序排列在 `Vec` 中，
//! 上下游关系只保存 ID 列表，不存在指针环。
//!
//! # 示例
//!
//! ```
//! use se_schedule::topology::build_topology;
//! use se_foundation::SubbasinId;
//!
//! // 1 → 3, 2 → 3, 3 → 出口
//! let graph = build_topology(&[(1, 3), (2, 3), (3, 0)]).unwrap();
//! assert_eq!(graph.outlet(), SubbasinId(3));
//! assert_eq!(graph.node(SubbasinId(3)).unwrap().upstream, vec![SubbasinId(1), SubbasinId(2)]);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use se_foundation::{RankId, SeError, SeResult, SubbasinId, TopologyError};

// ============================================================
// 节点
// ============================================================

/// 子流域节点
#[derive(Debug, Clone, PartialEq)]
pub struct SubbasinNode {
    /// 子流域 ID
    pub id: SubbasinId,
    /// 下游子流域，`None` 表示出口
    pub downstream: Option<SubbasinId>,
    /// 上游子流域 (升序)
    pub upstream: Vec<SubbasinId>,
    /// 所属分组，由任务分配填写
    pub group: Option<RankId>,
    /// 预处理阶段给出的分组提示
    pub group_hint: Option<usize>,
    /// 负载权重 (如栅格单元数)
    pub weight: f64,
    /// 自底向上序，0 表示尚未计算
    pub bottom_up_order: u32,
    /// 自顶向下序，0 表示尚未计算
    pub top_down_order: u32,
}

impl SubbasinNode {
    fn new(id: SubbasinId, downstream: Option<SubbasinId>) -> Self {
        Self {
            id,
            downstream,
            upstream: Vec::new(),
            group: None,
            group_hint: None,
            weight: 1.0,
            bottom_up_order: 0,
            top_down_order: 0,
        }
    }

    /// 是否为出口
    #[inline]
    pub fn is_outlet(&self) -> bool {
        self.downstream.is_none()
    }

    /// 是否为源头子流域 (无上游)
    #[inline]
    pub fn is_source(&self) -> bool {
        self.upstream.is_empty()
    }
}

// ============================================================
// 拓扑描述 (预处理产物)
// ============================================================

/// 单个子流域的拓扑记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubbasinRecord {
    /// 子流域 ID
    pub id: u32,
    /// 下游 ID，0 为出口
    #[serde(default)]
    pub downstream: u32,
    /// 声明的上游 ID，提供时需与下游指针一致
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Vec<u32>>,
    /// 分组提示
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<usize>,
    /// 负载权重
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

/// 静态拓扑描述
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologyDescriptor {
    /// 子流域记录
    pub subbasins: Vec<SubbasinRecord>,
}

impl TopologyDescriptor {
    /// 由 (子流域, 下游) 对创建
    pub fn from_pairs(pairs: &[(u32, u32)]) -> Self {
        Self {
            subbasins: pairs
                .iter()
                .map(|&(id, downstream)| SubbasinRecord {
                    id,
                    downstream,
                    upstream: None,
                    group: None,
                    weight: None,
                })
                .collect(),
        }
    }

    /// 从 JSON 文件加载
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> SeResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| SeError::parse(path, e.to_string()))
    }

    /// 保存为 JSON 文件
    pub fn save_json_file<P: AsRef<Path>>(&self, path: P) -> SeResult<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).map_err(|e| SeError::parse(path, e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ============================================================
// 构建选项
// ============================================================

/// 拓扑构建选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopologyOptions {
    /// 允许多个出口
    pub allow_multiple_outlets: bool,
}

impl From<&se_config::SchedulerConfig> for TopologyOptions {
    fn from(config: &se_config::SchedulerConfig) -> Self {
        Self {
            allow_multiple_outlets: config.allow_multiple_outlets,
        }
    }
}

// ============================================================
// 拓扑图
// ============================================================

/// 已验证的河网拓扑
#[derive(Debug, Clone)]
pub struct Topology {
    /// 节点，按 ID 升序
    nodes: Vec<SubbasinNode>,
    /// ID -> 节点下标
    index: HashMap<SubbasinId, usize>,
    /// 出口 (升序)
    outlets: Vec<SubbasinId>,
}

/// 由 (子流域, 下游) 对构建单出口拓扑
pub fn build_topology(pairs: &[(u32, u32)]) -> Result<Topology, TopologyError> {
    Topology::from_pairs(pairs, TopologyOptions::default())
}

impl Topology {
    /// 由 (子流域, 下游) 对构建
    pub fn from_pairs(pairs: &[(u32, u32)], options: TopologyOptions) -> Result<Self, TopologyError> {
        Self::from_descriptor(&TopologyDescriptor::from_pairs(pairs), options)
    }

    /// 由拓扑描述构建
    pub fn from_descriptor(
        descriptor: &TopologyDescriptor,
        options: TopologyOptions,
    ) -> Result<Self, TopologyError> {
        if descriptor.subbasins.is_empty() {
            return Err(TopologyError::Empty);
        }

        let mut records: Vec<&SubbasinRecord> = descriptor.subbasins.iter().collect();
        records.sort_by_key(|r| r.id);

        // ID 合法性
        let mut seen = HashSet::with_capacity(records.len());
        for record in &records {
            if record.id == 0 {
                return Err(TopologyError::ReservedId);
            }
            if !seen.insert(record.id) {
                return Err(TopologyError::DuplicateId(SubbasinId(record.id)));
            }
        }

        let mut nodes: Vec<SubbasinNode> = records
            .iter()
            .map(|r| {
                let mut node =
                    SubbasinNode::new(SubbasinId(r.id), SubbasinId::downstream_from_raw(r.downstream));
                node.group_hint = r.group;
                match r.weight {
                    Some(w) if w.is_finite() && w > 0.0 => node.weight = w,
                    Some(w) => tracing::warn!("Subbasin {}: ignoring invalid weight {}", r.id, w),
                    None => {}
                }
                node
            })
            .collect();
        let index: HashMap<SubbasinId, usize> =
            nodes.iter().enumerate().map(|(i, n)| (n.id, i)).collect();

        // 下游存在性 + 反推上游
        for i in 0..nodes.len() {
            if let Some(down) = nodes[i].downstream {
                let &d = index.get(&down).ok_or(TopologyError::UnknownDownstream {
                    id: nodes[i].id,
                    downstream: down,
                })?;
                let id = nodes[i].id;
                nodes[d].upstream.push(id);
            }
        }
        // 节点按 ID 升序遍历，上游列表天然有序

        // 声明的上游必须与推导一致
        for (record, node) in records.iter().zip(nodes.iter()) {
            if let Some(declared) = &record.upstream {
                let mut declared: Vec<SubbasinId> = declared.iter().map(|&u| SubbasinId(u)).collect();
                declared.sort();
                if declared != node.upstream {
                    return Err(TopologyError::InconsistentUpstream {
                        id: node.id,
                        declared,
                        derived: node.upstream.clone(),
                    });
                }
            }
        }

        detect_cycle(&nodes, &index)?;

        let outlets: Vec<SubbasinId> = nodes.iter().filter(|n| n.is_outlet()).map(|n| n.id).collect();
        if outlets.len() > 1 && !options.allow_multiple_outlets {
            return Err(TopologyError::MultipleOutlets { outlets });
        }

        tracing::debug!(
            "Topology built: {} subbasins, outlets {:?}",
            nodes.len(),
            outlets
        );

        Ok(Self {
            nodes,
            index,
            outlets,
        })
    }

    /// 子流域数
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// 是否为空 (已验证的拓扑总是非空)
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 全部节点，按 ID 升序
    pub fn nodes(&self) -> &[SubbasinNode] {
        &self.nodes
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut [SubbasinNode] {
        &mut self.nodes
    }

    /// 节点下标
    pub fn index_of(&self, id: SubbasinId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    /// 查找节点
    pub fn node(&self, id: SubbasinId) -> Option<&SubbasinNode> {
        self.index_of(id).map(|i| &self.nodes[i])
    }

    /// 是否包含子流域
    pub fn contains(&self, id: SubbasinId) -> bool {
        self.index.contains_key(&id)
    }

    /// 主出口 (多出口时为 ID 最小者)
    pub fn outlet(&self) -> SubbasinId {
        self.outlets[0]
    }

    /// 全部出口
    pub fn outlets(&self) -> &[SubbasinId] {
        &self.outlets
    }

    /// 源头子流域
    pub fn sources(&self) -> Vec<SubbasinId> {
        self.nodes.iter().filter(|n| n.is_source()).map(|n| n.id).collect()
    }

    /// 从给定子流域沿下游走到出口的路径 (含起点与出口)
    pub fn downstream_chain(&self, id: SubbasinId) -> Vec<SubbasinId> {
        let mut chain = Vec::new();
        let mut current = self.node(id);
        while let Some(node) = current {
            chain.push(node.id);
            // 已验证无环，最多 len() 跳
            if chain.len() > self.nodes.len() {
                break;
            }
            current = node.downstream.and_then(|d| self.node(d));
        }
        chain
    }

    /// `upstream` 是否为 `downstream` 的 (间接) 上游
    pub fn is_ancestor(&self, upstream: SubbasinId, downstream: SubbasinId) -> bool {
        upstream != downstream && self.downstream_chain(upstream).contains(&downstream)
    }

    /// 是否已完成任务分配
    pub fn is_assigned(&self) -> bool {
        self.nodes.iter().all(|n| n.group.is_some())
    }

    /// 转换回拓扑描述
    pub fn to_descriptor(&self) -> TopologyDescriptor {
        TopologyDescriptor {
            subbasins: self
                .nodes
                .iter()
                .map(|n| SubbasinRecord {
                    id: n.id.get(),
                    downstream: n.downstream.map_or(0, SubbasinId::get),
                    upstream: Some(n.upstream.iter().map(|u| u.get()).collect()),
                    group: n.group_hint,
                    weight: Some(n.weight),
                })
                .collect(),
        }
    }
}

/// 沿下游指针三色遍历检测环
fn detect_cycle(
    nodes: &[SubbasinNode],
    index: &HashMap<SubbasinId, usize>,
) -> Result<(), TopologyError> {
    const UNVISITED: u8 = 0;
    const ON_PATH: u8 = 1;
    const DONE: u8 = 2;

    let mut state = vec![UNVISITED; nodes.len()];
    let mut path: Vec<usize> = Vec::new();

    for start in 0..nodes.len() {
        if state[start] != UNVISITED {
            continue;
        }
        path.clear();
        let mut current = Some(start);
        while let Some(i) = current {
            match state[i] {
                DONE => break,
                ON_PATH => {
                    // 路径中从 i 开始的部分构成环
                    let pos = path.iter().position(|&p| p == i).unwrap_or(0);
                    let mut ids: Vec<SubbasinId> = path[pos..].iter().map(|&p| nodes[p].id).collect();
                    ids.sort();
                    return Err(TopologyError::Cycle { ids });
                }
                _ => {
                    state[i] = ON_PATH;
                    path.push(i);
                    current = nodes[i].downstream.and_then(|d| index.get(&d).copied());
                }
            }
        }
        for &p in &path {
            state[p] = DONE;
        }
    }
    Ok(())
}
