// crates/se_schedule/src/compute.rs

//! 子流域计算契约
//!
//! 调度器不关心水文过程本身，每个子流域由一个实现 [`SubbasinModel`]
//! 的对象承载状态和计算，调度器只负责按依赖顺序调用它。

use se_config::ScheduledOperation;
use se_foundation::SubbasinId;
use thiserror::Error;

/// 计算错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputeError {
    /// 数值不收敛
    #[error("迭代 {iterations} 次后仍不收敛")]
    NonConvergence {
        /// 已迭代次数
        iterations: u32,
    },

    /// 状态非法
    #[error("状态非法: {0}")]
    InvalidState(String),

    /// 其他失败
    #[error("{0}")]
    Failed(String),
}

/// 计算上下文
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepContext {
    /// 子流域
    pub subbasin: SubbasinId,
    /// 时间步
    pub timestep: u64,
    /// 执行层
    pub layer: u32,
    /// 坡面子步序号 (河道计算时为 0)
    pub substep: u32,
}

/// 一个上游的贡献
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpstreamContribution<'a> {
    /// 上游子流域
    pub subbasin: SubbasinId,
    /// 上游本步输出
    pub values: &'a [f64],
    /// 是否经交换边界接收
    pub remote: bool,
}

/// 单个子流域的计算能力
pub trait SubbasinModel: Send {
    /// 坡面过程子步，与上游无关，在本步河道计算之前执行
    fn hillslope(&mut self, ctx: &StepContext) -> Result<(), ComputeError> {
        let _ = ctx;
        Ok(())
    }

    /// 河道计算：给定全部上游贡献，返回传给下游的量
    fn compute(
        &mut self,
        ctx: &StepContext,
        upstream: &[UpstreamContribution<'_>],
    ) -> Result<Vec<f64>, ComputeError>;

    /// 执行管理操作
    fn manage(&mut self, operation: &ScheduledOperation, timestep: u64) -> Result<(), ComputeError> {
        let _ = (operation, timestep);
        Ok(())
    }
}

/// 函数式模型
///
/// 只提供河道计算，坡面和管理过程为空操作。
pub struct FnModel<F>
where
    F: FnMut(&StepContext, &[UpstreamContribution<'_>]) -> Result<Vec<f64>, ComputeError> + Send,
{
    handler: F,
}

impl<F> FnModel<F>
where
    F: FnMut(&StepContext, &[UpstreamContribution<'_>]) -> Result<Vec<f64>, ComputeError> + Send,
{
    /// 创建函数式模型
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> SubbasinModel for FnModel<F>
where
    F: FnMut(&StepContext, &[UpstreamContribution<'_>]) -> Result<Vec<f64>, ComputeError> + Send,
{
    fn compute(
        &mut self,
        ctx: &StepContext,
        upstream: &[UpstreamContribution<'_>],
    ) -> Result<Vec<f64>, ComputeError> {
        (self.handler)(ctx, upstream)
    }
}

/// 汇流求和模型：输出 = 本地产流 + 全部上游第一个分量之和
///
/// 常用于测试和调度开销评估。
#[derive(Debug, Clone, Default)]
pub struct AccumulateModel {
    /// 每步本地产流
    pub local_yield: f64,
    /// 管理操作累积的修正
    pub adjustment: f64,
}

impl AccumulateModel {
    /// 创建模型
    pub fn new(local_yield: f64) -> Self {
        Self {
            local_yield,
            adjustment: 0.0,
        }
    }
}

impl SubbasinModel for AccumulateModel {
    fn compute(
        &mut self,
        _ctx: &StepContext,
        upstream: &[UpstreamContribution<'_>],
    ) -> Result<Vec<f64>, ComputeError> {
        let inflow: f64 = upstream
            .iter()
            .map(|c| c.values.first().copied().unwrap_or(0.0))
            .sum();
        Ok(vec![self.local_yield + self.adjustment + inflow])
    }

    fn manage(&mut self, operation: &ScheduledOperation, _timestep: u64) -> Result<(), ComputeError> {
        if let Some(delta) = operation.parameters.get("adjustment") {
            self.adjustment += delta;
        }
        Ok(())
    }
}
