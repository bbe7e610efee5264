// crates/se_schedule/src/exchange.rs

//! 跨进程交换缓冲与传输
//!
//! 每个时间步中，下游位于其他进程的子流域完成计算后把输出 `stage` 到发送缓冲；
//! 层边界处 `drain` 出全部记录交给传输层，目标进程 `receive` 后才可见。
//!
//! # 可见性
//!
//! - 接收窗口从当前时间步开始，提前到达的后续时间步记录一并保存
//! - 过期记录丢弃
//! - 同一时间步同一子流域的记录只能安装一次，重复的批次整批拒绝

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use se_foundation::{RankId, SeError, SeResult, SubbasinId};

// ============================================================
// 交换记录
// ============================================================

/// 交换记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    /// 产生记录的上游子流域
    pub subbasin: SubbasinId,
    /// 时间步
    pub timestep: u64,
    /// 传递量 (流量、泥沙、营养物负荷等)，长度可随时间步变化
    pub values: Vec<f64>,
}

impl ExchangeRecord {
    /// 创建记录
    pub fn new(subbasin: SubbasinId, timestep: u64, values: Vec<f64>) -> Self {
        Self {
            subbasin,
            timestep,
            values,
        }
    }

    /// 传递量个数
    #[inline]
    pub fn count(&self) -> usize {
        self.values.len()
    }
}

// ============================================================
// 交换缓冲
// ============================================================

/// 单进程交换缓冲
///
/// 接收侧按时间步保存记录，窗口起点之前的记录视为过期。
#[derive(Debug, Default)]
pub struct ExchangeBuffer {
    /// 窗口起点 (当前时间步)
    timestep: u64,
    /// 待发送记录
    outgoing: Vec<ExchangeRecord>,
    /// 窗口内已接收的记录
    incoming: BTreeMap<u64, HashMap<SubbasinId, ExchangeRecord>>,
}

impl ExchangeBuffer {
    /// 按预计记录数预分配
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            timestep: 0,
            outgoing: Vec::with_capacity(capacity),
            incoming: BTreeMap::new(),
        }
    }

    /// 当前时间步
    pub fn timestep(&self) -> u64 {
        self.timestep
    }

    /// 开始新时间步
    ///
    /// 丢弃未发送的记录和早于 `timestep` 的接收记录，
    /// 提前到达的本步及后续记录保留。
    pub fn begin_timestep(&mut self, timestep: u64) {
        if !self.outgoing.is_empty() {
            tracing::warn!(
                "Discarding {} undrained records from timestep {}",
                self.outgoing.len(),
                self.timestep
            );
            self.outgoing.clear();
        }
        self.timestep = timestep;

        let kept = self.incoming.split_off(&timestep);
        let retired = std::mem::replace(&mut self.incoming, kept);
        let unused: usize = retired.values().map(HashMap::len).sum();
        if unused > 0 {
            tracing::debug!(
                "Dropping {} unused records for timesteps {:?}",
                unused,
                retired.keys().collect::<Vec<_>>()
            );
        }
    }

    /// 暂存本地子流域当前时间步的输出，等待交换时发送
    pub fn stage(&mut self, subbasin: SubbasinId, values: Vec<f64>) -> SeResult<()> {
        self.stage_at(self.timestep, subbasin, values)
    }

    /// 暂存本地子流域指定时间步的输出
    pub fn stage_at(&mut self, timestep: u64, subbasin: SubbasinId, values: Vec<f64>) -> SeResult<()> {
        if self
            .outgoing
            .iter()
            .any(|r| r.subbasin == subbasin && r.timestep == timestep)
        {
            return Err(SeError::internal(format!(
                "子流域 {} 在时间步 {} 重复暂存",
                subbasin, timestep
            )));
        }
        self.outgoing
            .push(ExchangeRecord::new(subbasin, timestep, values));
        Ok(())
    }

    /// 取出全部待发送记录
    pub fn drain(&mut self) -> Vec<ExchangeRecord> {
        std::mem::take(&mut self.outgoing)
    }

    /// 待发送记录数
    pub fn staged(&self) -> usize {
        self.outgoing.len()
    }

    /// 安装一批接收记录，返回属于当前时间步的数量
    ///
    /// 过期记录丢弃。批内或与已安装记录存在相同 (时间步, 子流域) 时
    /// 整批拒绝，缓冲保持不变。
    pub fn receive<I>(&mut self, records: I) -> SeResult<usize>
    where
        I: IntoIterator<Item = ExchangeRecord>,
    {
        let mut accepted: Vec<ExchangeRecord> = Vec::new();
        let mut seen: HashSet<(u64, SubbasinId)> = HashSet::new();
        for record in records {
            if record.timestep < self.timestep {
                tracing::warn!(
                    "Rejecting stale record of subbasin {} (timestep {}, current {})",
                    record.subbasin,
                    record.timestep,
                    self.timestep
                );
                continue;
            }
            let installed = self
                .incoming
                .get(&record.timestep)
                .is_some_and(|m| m.contains_key(&record.subbasin));
            if installed || !seen.insert((record.timestep, record.subbasin)) {
                return Err(SeError::transport(format!(
                    "时间步 {} 重复收到子流域 {} 的记录",
                    record.timestep, record.subbasin
                )));
            }
            accepted.push(record);
        }

        let current = accepted
            .iter()
            .filter(|r| r.timestep == self.timestep)
            .count();
        for record in accepted {
            self.incoming
                .entry(record.timestep)
                .or_default()
                .insert(record.subbasin, record);
        }
        Ok(current)
    }

    /// 当前时间步是否已收到该上游记录
    pub fn contains(&self, subbasin: SubbasinId) -> bool {
        self.contains_at(self.timestep, subbasin)
    }

    /// 指定时间步是否已收到该上游记录
    pub fn contains_at(&self, timestep: u64, subbasin: SubbasinId) -> bool {
        self.incoming
            .get(&timestep)
            .is_some_and(|m| m.contains_key(&subbasin))
    }

    /// 查看当前时间步已收到的记录
    pub fn get(&self, subbasin: SubbasinId) -> Option<&ExchangeRecord> {
        self.incoming.get(&self.timestep)?.get(&subbasin)
    }

    /// 当前时间步尚未收到的上游
    pub fn missing(&self, ids: &[SubbasinId]) -> Vec<SubbasinId> {
        self.missing_at(self.timestep, ids)
    }

    /// 指定时间步尚未收到的上游
    pub fn missing_at(&self, timestep: u64, ids: &[SubbasinId]) -> Vec<SubbasinId> {
        ids.iter()
            .copied()
            .filter(|id| !self.contains_at(timestep, *id))
            .collect()
    }

    /// 取出某子流域当前时间步所需的全部远程上游记录
    ///
    /// 缺任何一条时不取出任何记录，返回 `MissingUpstream`。
    pub fn take_upstream(
        &mut self,
        subbasin: SubbasinId,
        ids: &[SubbasinId],
    ) -> SeResult<Vec<ExchangeRecord>> {
        self.take_upstream_at(self.timestep, subbasin, ids)
    }

    /// 取出某子流域指定时间步所需的全部远程上游记录
    pub fn take_upstream_at(
        &mut self,
        timestep: u64,
        subbasin: SubbasinId,
        ids: &[SubbasinId],
    ) -> SeResult<Vec<ExchangeRecord>> {
        let missing = self.missing_at(timestep, ids);
        if !missing.is_empty() {
            return Err(SeError::missing_upstream(subbasin, timestep, missing));
        }
        let Some(records) = self.incoming.get_mut(&timestep) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| records.remove(id)).collect())
    }

    /// 暂存的后续时间步记录数
    pub fn deferred_len(&self) -> usize {
        self.incoming
            .range(self.timestep.saturating_add(1)..)
            .map(|(_, m)| m.len())
            .sum()
    }
}

// ============================================================
// 进程间消息
// ============================================================

/// 进程间消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExchangeMessage {
    /// 一个交换轮次的记录
    Records {
        /// 发送进程
        from: RankId,
        /// 时间步
        timestep: u64,
        /// 层
        layer: u32,
        /// 记录
        records: Vec<ExchangeRecord>,
    },
    /// 中止当前时间步
    Abort {
        /// 发送进程
        from: RankId,
        /// 失败子流域
        subbasin: SubbasinId,
        /// 时间步
        timestep: u64,
        /// 原因
        reason: String,
    },
    /// 到达同步点
    Sync {
        /// 发送进程
        from: RankId,
        /// 同步点所在时间步
        epoch: u64,
    },
}

impl ExchangeMessage {
    /// 发送进程
    pub fn from_rank(&self) -> RankId {
        match self {
            Self::Records { from, .. } | Self::Abort { from, .. } | Self::Sync { from, .. } => {
                *from
            }
        }
    }

    /// 时间步
    pub fn timestep(&self) -> u64 {
        match self {
            Self::Records { timestep, .. } | Self::Abort { timestep, .. } => *timestep,
            Self::Sync { epoch, .. } => *epoch,
        }
    }
}

// ============================================================
// 传输层
// ============================================================

/// 进程间传输能力
pub trait Transport: Send {
    /// 本进程编号
    fn rank(&self) -> RankId;

    /// 进程总数
    fn process_count(&self) -> usize;

    /// 点对点发送
    fn send(&self, to: RankId, message: ExchangeMessage) -> SeResult<()>;

    /// 阻塞接收，超时返回 `Ok(None)`
    fn recv_timeout(&self, timeout: Duration) -> SeResult<Option<ExchangeMessage>>;

    /// 非阻塞接收
    fn try_recv(&self) -> SeResult<Option<ExchangeMessage>>;

    /// 发送给除自身外的所有进程，返回第一个发送错误
    fn broadcast(&self, message: &ExchangeMessage) -> SeResult<()> {
        let mut first_error = None;
        for peer in (0..self.process_count()).map(RankId) {
            if peer == self.rank() {
                continue;
            }
            if let Err(e) = self.send(peer, message.clone()) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// 基于 `mpsc` 通道的进程内点对点传输
pub struct ChannelTransport {
    rank: RankId,
    /// 各进程的发送端，自身位置为 `None`
    peers: Vec<Option<Sender<ExchangeMessage>>>,
    inbox: Receiver<ExchangeMessage>,
}

/// 创建 `process_count` 个全连接的通道传输
pub fn channel_mesh(process_count: usize) -> Vec<ChannelTransport> {
    let (senders, receivers): (Vec<_>, Vec<_>) =
        (0..process_count).map(|_| mpsc::channel()).unzip();

    receivers
        .into_iter()
        .enumerate()
        .map(|(rank, inbox)| ChannelTransport {
            rank: RankId(rank),
            peers: senders
                .iter()
                .enumerate()
                .map(|(peer, tx)| (peer != rank).then(|| tx.clone()))
                .collect(),
            inbox,
        })
        .collect()
}

impl Transport for ChannelTransport {
    fn rank(&self) -> RankId {
        self.rank
    }

    fn process_count(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, to: RankId, message: ExchangeMessage) -> SeResult<()> {
        let sender = self
            .peers
            .get(to.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| SeError::transport(format!("进程 {} 无法发送到 {}", self.rank, to)))?;
        sender.send(message)?;
        Ok(())
    }

    fn recv_timeout(&self, timeout: Duration) -> SeResult<Option<ExchangeMessage>> {
        match self.inbox.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SeError::transport(format!(
                "进程 {} 的所有对端已断开",
                self.rank
            ))),
        }
    }

    fn try_recv(&self) -> SeResult<Option<ExchangeMessage>> {
        match self.inbox.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(SeError::transport(format!(
                "进程 {} 的所有对端已断开",
                self.rank
            ))),
        }
    }
}

impl std::fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("rank", &self.rank)
            .field("process_count", &self.peers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_drain_receive() {
        let mut sender = ExchangeBuffer::with_capacity(2);
        let mut receiver = ExchangeBuffer::with_capacity(2);
        sender.begin_timestep(4);
        receiver.begin_timestep(4);

        sender.stage(SubbasinId(1), vec![1.5, 0.25, 3.0]).unwrap();
        assert_eq!(sender.staged(), 1);
        let records = sender.drain();
        assert_eq!(sender.staged(), 0);

        assert_eq!(receiver.receive(records).unwrap(), 1);
        let record = receiver.get(SubbasinId(1)).unwrap();
        assert_eq!(record.timestep, 4);
        assert_eq!(record.values, vec![1.5, 0.25, 3.0]);
        assert_eq!(record.count(), 3);
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let mut buffer = ExchangeBuffer::default();
        buffer.stage(SubbasinId(1), vec![1.0]).unwrap();
        assert!(buffer.stage(SubbasinId(1), vec![2.0]).is_err());
    }

    #[test]
    fn test_early_record_deferred() {
        let mut buffer = ExchangeBuffer::default();
        buffer.begin_timestep(1);
        let installed = buffer
            .receive(vec![ExchangeRecord::new(SubbasinId(2), 2, vec![9.0])])
            .unwrap();
        assert_eq!(installed, 0);
        assert!(!buffer.contains(SubbasinId(2)));
        assert_eq!(buffer.deferred_len(), 1);

        buffer.begin_timestep(2);
        assert_eq!(buffer.get(SubbasinId(2)).unwrap().values, vec![9.0]);
        assert_eq!(buffer.deferred_len(), 0);
    }

    #[test]
    fn test_stale_and_duplicate_records() {
        let mut buffer = ExchangeBuffer::default();
        buffer.begin_timestep(3);
        let stale = ExchangeRecord::new(SubbasinId(1), 2, vec![1.0]);
        assert_eq!(buffer.receive(vec![stale]).unwrap(), 0);
        assert!(!buffer.contains(SubbasinId(1)));

        let record = ExchangeRecord::new(SubbasinId(1), 3, vec![1.0]);
        buffer.receive(vec![record.clone()]).unwrap();
        assert!(buffer.receive(vec![record]).is_err());
    }

    #[test]
    fn test_duplicate_batch_installs_nothing() {
        let mut buffer = ExchangeBuffer::default();
        buffer.begin_timestep(1);
        buffer
            .receive(vec![ExchangeRecord::new(SubbasinId(1), 1, vec![1.0])])
            .unwrap();

        // 第二条与已安装记录重复，第一条也不能安装
        let batch = vec![
            ExchangeRecord::new(SubbasinId(2), 1, vec![2.0]),
            ExchangeRecord::new(SubbasinId(1), 1, vec![9.0]),
        ];
        assert_eq!(buffer.receive(batch).unwrap_err().kind(), "TransportError");
        assert!(!buffer.contains(SubbasinId(2)));
        assert_eq!(buffer.get(SubbasinId(1)).unwrap().values, vec![1.0]);

        // 批内重复同样整批拒绝
        let batch = vec![
            ExchangeRecord::new(SubbasinId(3), 2, vec![3.0]),
            ExchangeRecord::new(SubbasinId(3), 2, vec![4.0]),
        ];
        assert!(buffer.receive(batch).is_err());
        assert_eq!(buffer.deferred_len(), 0);
    }

    #[test]
    fn test_duplicate_early_record_rejected() {
        let mut buffer = ExchangeBuffer::default();
        buffer.begin_timestep(0);
        let early = ExchangeRecord::new(SubbasinId(5), 2, vec![1.0]);
        buffer.receive(vec![early.clone()]).unwrap();

        let mut again = early;
        again.values = vec![7.0];
        assert!(buffer.receive(vec![again]).is_err());

        buffer.begin_timestep(2);
        assert_eq!(buffer.get(SubbasinId(5)).unwrap().values, vec![1.0]);
    }

    #[test]
    fn test_window_across_timesteps() {
        let mut buffer = ExchangeBuffer::default();
        buffer.begin_timestep(3);
        buffer.stage_at(3, SubbasinId(1), vec![1.0]).unwrap();
        buffer.stage_at(4, SubbasinId(1), vec![2.0]).unwrap();
        assert!(buffer.stage_at(4, SubbasinId(1), vec![3.0]).is_err());
        let staged = buffer.drain();
        assert_eq!(buffer.receive(staged).unwrap(), 1);

        assert_eq!(buffer.missing_at(4, &[SubbasinId(1), SubbasinId(2)]), vec![SubbasinId(2)]);
        let records = buffer.take_upstream_at(4, SubbasinId(9), &[SubbasinId(1)]).unwrap();
        assert_eq!(records[0].values, vec![2.0]);
        assert!(buffer.contains(SubbasinId(1)));
        assert!(!buffer.contains_at(4, SubbasinId(1)));
    }

    #[test]
    fn test_records_cleared_between_timesteps() {
        let mut buffer = ExchangeBuffer::default();
        buffer.begin_timestep(0);
        buffer
            .receive(vec![ExchangeRecord::new(SubbasinId(1), 0, vec![1.0])])
            .unwrap();
        buffer.begin_timestep(1);
        assert!(!buffer.contains(SubbasinId(1)));
    }

    #[test]
    fn test_take_upstream() {
        let mut buffer = ExchangeBuffer::default();
        buffer.begin_timestep(5);
        buffer
            .receive(vec![ExchangeRecord::new(SubbasinId(1), 5, vec![1.0])])
            .unwrap();

        let err = buffer
            .take_upstream(SubbasinId(3), &[SubbasinId(1), SubbasinId(2)])
            .unwrap_err();
        match err {
            SeError::MissingUpstream {
                subbasin,
                timestep,
                missing,
            } => {
                assert_eq!(subbasin, SubbasinId(3));
                assert_eq!(timestep, 5);
                assert_eq!(missing, vec![SubbasinId(2)]);
            }
            other => panic!("unexpected error: {other}"),
        }
        // 失败时不取出任何记录
        assert!(buffer.contains(SubbasinId(1)));

        buffer
            .receive(vec![ExchangeRecord::new(SubbasinId(2), 5, vec![2.0, 2.5])])
            .unwrap();
        let records = buffer
            .take_upstream(SubbasinId(3), &[SubbasinId(1), SubbasinId(2)])
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].values, vec![2.0, 2.5]);
        assert!(!buffer.contains(SubbasinId(1)));
    }

    #[test]
    fn test_channel_mesh() {
        let mesh = channel_mesh(3);
        assert_eq!(mesh.len(), 3);
        assert_eq!(mesh[1].rank(), RankId(1));
        assert_eq!(mesh[1].process_count(), 3);

        let message = ExchangeMessage::Records {
            from: RankId(0),
            timestep: 1,
            layer: 1,
            records: vec![ExchangeRecord::new(SubbasinId(4), 1, vec![0.5])],
        };
        mesh[0].send(RankId(2), message.clone()).unwrap();
        assert_eq!(mesh[2].try_recv().unwrap(), Some(message));
        assert_eq!(mesh[2].try_recv().unwrap(), None);
        assert!(mesh[0].send(RankId(0), ExchangeMessage::Abort {
            from: RankId(0),
            subbasin: SubbasinId(1),
            timestep: 0,
            reason: String::new(),
        })
        .is_err());
    }

    #[test]
    fn test_broadcast_and_timeout() {
        let mesh = channel_mesh(3);
        let abort = ExchangeMessage::Abort {
            from: RankId(1),
            subbasin: SubbasinId(7),
            timestep: 2,
            reason: "不收敛".into(),
        };
        mesh[1].broadcast(&abort).unwrap();
        assert_eq!(mesh[0].try_recv().unwrap().map(|m| m.from_rank()), Some(RankId(1)));
        assert_eq!(mesh[2].try_recv().unwrap().map(|m| m.timestep()), Some(2));
        assert_eq!(mesh[1].recv_timeout(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn test_disconnected_peer() {
        let mut mesh = channel_mesh(2);
        let survivor = mesh.remove(0);
        drop(mesh);
        assert!(survivor.recv_timeout(Duration::from_millis(10)).is_err());
        assert!(survivor.send(RankId(1), ExchangeMessage::Abort {
            from: RankId(0),
            subbasin: SubbasinId(1),
            timestep: 0,
            reason: String::new(),
        })
        .is_err());
    }

    #[test]
    fn test_message_serde() {
        let message = ExchangeMessage::Records {
            from: RankId(1),
            timestep: 3,
            layer: 2,
            records: vec![ExchangeRecord::new(SubbasinId(8), 3, vec![1.0, 2.0])],
        };
        let json = serde_json::to_string(&message).unwrap();
        let back: ExchangeMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);

        let sync = ExchangeMessage::Sync { from: RankId(2), epoch: 8 };
        assert_eq!(sync.from_rank(), RankId(2));
        assert_eq!(sync.timestep(), 8);
    }
}
