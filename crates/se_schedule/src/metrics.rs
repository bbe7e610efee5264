// crates/se_schedule/src/metrics.rs

//! 调度性能指标

use std::time::Duration;

/// 单进程调度指标
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepMetrics {
    /// 完成的时间步数
    pub timesteps: u64,
    /// 完成计算的子流域次数
    pub nodes_computed: u64,
    /// 实际执行的交换轮次
    pub exchange_rounds: u64,
    /// 发送记录数
    pub records_sent: u64,
    /// 接收记录数
    pub records_received: u64,
    /// 坡面过程耗时
    pub hillslope_time: Duration,
    /// 河道计算耗时
    pub channel_time: Duration,
    /// 交换 (含等待) 耗时
    pub exchange_time: Duration,
    /// 管理过程耗时
    pub management_time: Duration,
}

impl StepMetrics {
    /// 记录坡面阶段
    pub fn record_hillslope(&mut self, duration: Duration) {
        self.hillslope_time += duration;
    }

    /// 记录一层河道计算
    pub fn record_channel(&mut self, nodes: usize, duration: Duration) {
        self.nodes_computed += nodes as u64;
        self.channel_time += duration;
    }

    /// 记录一次交换轮次
    pub fn record_exchange(&mut self, sent: usize, received: usize, duration: Duration) {
        self.exchange_rounds += 1;
        self.records_sent += sent as u64;
        self.records_received += received as u64;
        self.exchange_time += duration;
    }

    /// 记录管理过程
    pub fn record_management(&mut self, duration: Duration) {
        self.management_time += duration;
    }

    /// 记录完成一个时间步
    pub fn record_timestep(&mut self) {
        self.timesteps += 1;
    }

    /// 总耗时
    pub fn total_time(&self) -> Duration {
        self.hillslope_time + self.channel_time + self.exchange_time + self.management_time
    }

    /// 交换耗时占比
    pub fn exchange_fraction(&self) -> f64 {
        let total = self.total_time().as_secs_f64();
        if total > 0.0 {
            self.exchange_time.as_secs_f64() / total
        } else {
            0.0
        }
    }

    /// 跨进程归约：计数取和，耗时取最大 (最慢进程决定墙钟时间)
    pub fn merge_max(&mut self, other: &StepMetrics) {
        self.timesteps = self.timesteps.max(other.timesteps);
        self.nodes_computed += other.nodes_computed;
        self.exchange_rounds += other.exchange_rounds;
        self.records_sent += other.records_sent;
        self.records_received += other.records_received;
        self.hillslope_time = self.hillslope_time.max(other.hillslope_time);
        self.channel_time = self.channel_time.max(other.channel_time);
        self.exchange_time = self.exchange_time.max(other.exchange_time);
        self.management_time = self.management_time.max(other.management_time);
    }

    /// 重置指标
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
