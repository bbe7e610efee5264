// crates/se_config/src/error.rs

//! 配置层错误类型

use se_foundation::SeError;

/// 配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 解析错误
    #[error("解析错误: {0}")]
    Parse(String),

    /// 无效值
    #[error("无效值 '{key}': {value} - {reason}")]
    InvalidValue {
        /// 配置键
        key: String,
        /// 配置值
        value: String,
        /// 原因
        reason: String,
    },

    /// 缺失配置
    #[error("缺失配置: {0}")]
    Missing(String),
}

impl ConfigError {
    /// 无效值
    pub fn invalid(key: impl Into<String>, value: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<ConfigError> for SeError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Io(source) => SeError::Io {
                message: source.to_string(),
                source: Some(source),
            },
            other => SeError::config(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("process_count", 0, "必须为正");
        assert!(err.to_string().contains("process_count"));
    }

    #[test]
    fn test_into_se_error() {
        let err: SeError = ConfigError::Missing("stepper".into()).into();
        assert_eq!(err.kind(), "ConfigError");
        assert!(err.is_initialization());
    }
}
