use thiserror::Error;

/// FLUX Monitor 统一错误类型
///
/// 校验错误同步返回给调用方且不重试；查询、投递错误只在所属的评估或发送任务内记录，
/// 不会影响其他规则或告警。
#[derive(Error, Debug)]
pub enum FluxError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Query error: {0}")]
    Query(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, FluxError>;

impl FluxError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// 错误类别名称，用于 API 响应
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Query(_) => "query",
            Self::Delivery(_) => "delivery",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Config(_) => "config",
            Self::Serialization(_) | Self::Io(_) | Self::Database(_) | Self::Internal(_) => "internal",
        }
    }

    /// 对应的 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Query(_) => 422,
            Self::Delivery(_) => 502,
            Self::Config(_)
            | Self::Serialization(_)
            | Self::Io(_)
            | Self::Database(_)
            | Self::Internal(_) => 500,
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Validation { field, .. } => field.as_deref(),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Delivery(_) | Self::Io(_) | Self::Database(_))
    }
}

impl From<anyhow::Error> for FluxError {
    fn from(err: anyhow::Error) -> Self {
        FluxError::Internal(err.to_string())
    }
}

impl From<tokio::task::JoinError> for FluxError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            FluxError::Internal(format!("task panicked: {}", err))
        } else {
            FluxError::Internal(format!("task cancelled: {}", err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(FluxError::validation("bad name").status_code(), 400);
        assert_eq!(FluxError::NotFound("rule".into()).status_code(), 404);
        assert_eq!(FluxError::Query("parse".into()).status_code(), 422);
        assert_eq!(FluxError::Delivery("timeout".into()).status_code(), 502);
        assert_eq!(FluxError::Internal("boom".into()).status_code(), 500);
    }

    #[test]
    fn test_validation_field() {
        let err = FluxError::invalid_field("name", "metric name must match [a-zA-Z_:][a-zA-Z0-9_:]*");
        assert_eq!(err.kind(), "validation");
        assert_eq!(err.field(), Some("name"));
        assert!(!err.is_retryable());
        assert!(FluxError::Delivery("503".into()).is_retryable());
    }
}
