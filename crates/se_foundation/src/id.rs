// crates/se_foundation/src/id.rs

//! 强类型标识符
//!
//! 子流域 ID 与进程编号 (rank) 使用各自的新类型，避免在调度代码中混用。
//!
//! # 约定
//!
//! - 子流域 ID 为正整数，`0` 保留为流域出口哨兵 ([`SubbasinId::OUTLET`])
//! - Rank 从 0 开始连续编号

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// 宏：生成标识符类型
// ============================================================================

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $inner:ty) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            /// 创建新标识符
            #[inline]
            pub const fn new(raw: $inner) -> Self {
                Self(raw)
            }

            /// 获取原始值
            #[inline]
            pub const fn get(self) -> $inner {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$inner> for $name {
            #[inline]
            fn from(raw: $inner) -> Self {
                Self(raw)
            }
        }

        impl From<$name> for $inner {
            #[inline]
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(
    /// 子流域 ID
    ///
    /// 流域划分的原子空间单元编号。`0` 不是合法子流域，而是"无下游"的哨兵值。
    SubbasinId,
    u32
);

define_id!(
    /// 进程 (分组) 编号
    RankId,
    usize
);

impl SubbasinId {
    /// 出口哨兵：下游 ID 为此值表示该子流域为流域出口
    pub const OUTLET: Self = Self(0);

    /// 是否为出口哨兵
    #[inline]
    pub const fn is_outlet_sentinel(self) -> bool {
        self.0 == 0
    }

    /// 将原始下游 ID 转换为 `Option`，哨兵映射为 `None`
    #[inline]
    pub fn downstream_from_raw(raw: u32) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }
}

impl RankId {
    /// 主进程编号
    pub const MASTER: Self = Self(0);

    /// 作为数组下标
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}
