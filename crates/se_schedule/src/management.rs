// crates/se_schedule/src/management.rs

//! 管理过程
//!
//! 按各自的触发计划对本地子流域执行管理操作 (种植、施肥、收割等)。
//! 管理过程只修改子流域自身状态，不参与排序和交换；
//! 在同一进程内总是在该时间步的逐层计算之前完成。

use rayon::prelude::*;

use se_config::{ManagementConfig, ScheduledOperation};
use se_foundation::{SeError, SeResult, SubbasinId};

use crate::compute::SubbasinModel;

/// 一次管理过程的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagementReport {
    /// 时间步
    pub timestep: u64,
    /// 到期的操作名称，按声明顺序
    pub operations: Vec<String>,
    /// 实际执行的 (操作, 子流域) 次数
    pub applications: usize,
}

/// 管理过程
#[derive(Debug, Clone, Default)]
pub struct ManagementProcess {
    operations: Vec<ScheduledOperation>,
}

impl ManagementProcess {
    /// 由配置创建
    pub fn new(config: &ManagementConfig) -> Self {
        Self {
            operations: config.operations.clone(),
        }
    }

    /// 是否没有任何计划操作
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// 该时间步是否有到期操作
    pub fn is_due(&self, timestep: u64) -> bool {
        self.operations.iter().any(|op| op.trigger.fires_at(timestep))
    }

    /// 该时间步到期的操作
    pub fn due_operations(&self, timestep: u64) -> Vec<&ScheduledOperation> {
        self.operations
            .iter()
            .filter(|op| op.trigger.fires_at(timestep))
            .collect()
    }

    /// 对本地子流域执行到期操作
    ///
    /// 子流域之间相互独立，并行执行；每个子流域内部按声明顺序执行操作。
    /// 目标列表中不属于本进程的子流域直接忽略。
    /// 多个子流域失败时返回 ID 最小者的错误。
    pub fn apply(
        &self,
        timestep: u64,
        targets: &mut [(SubbasinId, &mut dyn SubbasinModel)],
    ) -> SeResult<ManagementReport> {
        let due = self.due_operations(timestep);
        let mut report = ManagementReport {
            timestep,
            operations: due.iter().map(|op| op.name.clone()).collect(),
            applications: 0,
        };
        if due.is_empty() {
            return Ok(report);
        }

        let results: Vec<SeResult<usize>> = targets
            .par_iter_mut()
            .map(|(id, model)| {
                let mut applied = 0;
                for op in due.iter().filter(|op| op.targets(*id)) {
                    model.manage(op, timestep).map_err(|e| {
                        SeError::management(*id, timestep, op.name.clone(), e.to_string())
                    })?;
                    applied += 1;
                }
                Ok(applied)
            })
            .collect();

        let mut first_error: Option<SeError> = None;
        for result in results {
            match result {
                Ok(applied) => report.applications += applied,
                Err(e) => {
                    if first_error
                        .as_ref()
                        .map_or(true, |prev| e.subbasin() < prev.subbasin())
                    {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        tracing::debug!(
            "Management at timestep {}: {:?} applied {} times",
            timestep,
            report.operations,
            report.applications
        );
        Ok(report)
    }
}
