// crates/se_foundation/src/lib.rs

//! SEIMS-RS Foundation Layer
//!
//! 基础层，提供子流域/进程标识符与调度器统一错误类型。
//!
//! # 模块概览
//!
//! - [`id`]: 强类型标识符 (`SubbasinId`, `RankId`)
//! - [`error`]: 统一错误类型与 `ensure!` / `require!` 宏
//!
//! # 示例
//!
//! ```
//! use se_foundation::{SubbasinId, SeError, SeResult};
//!
//! fn outlet_only(id: SubbasinId) -> SeResult<()> {
//!     se_foundation::ensure!(!id.is_outlet_sentinel(), SeError::internal("保留 ID"));
//!     Ok(())
//! }
//!
//! assert!(outlet_only(SubbasinId(1)).is_ok());
//! assert!(outlet_only(SubbasinId::OUTLET).is_err());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod id;

// 重导出常用类型
pub use error::{PartitionError, SeError, SeResult, TopologyError};
pub use id::{RankId, SubbasinId};

/// Prelude 模块，包含常用类型
pub mod prelude {
    pub use crate::error::{PartitionError, SeError, SeResult, TopologyError};
    pub use crate::id::{RankId, SubbasinId};
    pub use crate::{ensure, require};
}
