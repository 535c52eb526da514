//! 错误分类

use serde::Serialize;
use thiserror::Error;

/// 单个配置项校验错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: &'static str,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "options.{} undefined: {}", self.field, self.message)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// 缺少必填配置，所有缺失项一并报告
    #[error("配置无效: {}", join_fields(.0))]
    Configuration(Vec<FieldError>),

    #[error("远程地址无效 {reference}: {cause}")]
    InvalidReference { reference: String, cause: String },

    #[error("远程认证失败: {0}")]
    Authentication(String),

    #[error("远程键无效: {0:?}")]
    InvalidKey(String),

    #[error("会话尚未认证")]
    NotAuthenticated,

    /// 单个文件 / 键的读写失败，可恢复
    #[error("传输失败 {target}: {cause}")]
    Transfer { target: String, cause: String },

    #[error("文件监听注册失败: {0}")]
    WatchSetup(String),

    #[error("远程订阅注册失败: {0}")]
    SubscriptionSetup(String),

    #[error("未找到: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn transfer(target: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        SyncError::Transfer {
            target: target.into(),
            cause: format!("{:#}", cause),
        }
    }

    /// 是否为致命错误（整个调用失败）
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SyncError::Transfer { .. } | SyncError::NotFound(_))
    }
}

fn join_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_lists_all_fields() {
        let err = SyncError::Configuration(vec![
            FieldError {
                field: "reference",
                message: "a",
            },
            FieldError {
                field: "token",
                message: "b",
            },
        ]);
        let text = err.to_string();
        assert!(text.contains("options.reference undefined: a"));
        assert!(text.contains("options.token undefined: b"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_transfer_error_is_not_fatal() {
        let err = SyncError::transfer("notes", anyhow::anyhow!("disk full"));
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "传输失败 notes: disk full");
    }
}
