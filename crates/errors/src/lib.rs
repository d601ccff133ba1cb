//! strata-errors - 统一错误处理
//!
//! 数据访问层的错误分类：参数错误、未找到、引擎错误、序列化错误、资源所有权错误

use thiserror::Error;

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 参数非法（在任何 I/O 之前失败）
    InvalidArgument,
    /// 资源不存在
    NotFound,
    /// 约束冲突或底层引擎错误（原样透传）
    Engine,
    /// 审计快照序列化失败（整个提交失败）
    Serialization,
    /// 资源所有权 / 生命周期误用
    Ownership,
    /// 操作被取消
    Cancelled,
    /// 配置错误
    Configuration,
    /// 内部错误
    Internal,
}

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to serialize field `{field}` of `{table}`: {source}")]
    Serialization {
        table: String,
        field: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Database context has been disposed")]
    ContextDisposed,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn serialization(
        table: impl Into<String>,
        field: impl Into<String>,
        source: serde_json::Error,
    ) -> Self {
        Self::Serialization {
            table: table.into(),
            field: field.into(),
            source,
        }
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// 错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) | Self::Database(_) => ErrorKind::Engine,
            Self::Serialization { .. } => ErrorKind::Serialization,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::InvalidOperation(_) | Self::ContextDisposed => ErrorKind::Ownership,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// 是否为数据库约束冲突（唯一键、外键、非空、检查约束）
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db_err)) => !matches!(
                db_err.kind(),
                sqlx::error::ErrorKind::Other
            ),
            _ => false,
        }
    }

    /// 是否为唯一键冲突
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            Self::Database(sqlx::Error::Database(db_err)) if db_err.is_unique_violation()
        )
    }
}

/// Result 类型别名
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            AppError::invalid_argument("key").kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(AppError::not_found("x").kind(), ErrorKind::NotFound);
        assert_eq!(AppError::conflict("stale").kind(), ErrorKind::Engine);
        assert_eq!(
            AppError::Database(sqlx::Error::RowNotFound).kind(),
            ErrorKind::Engine
        );
        assert_eq!(AppError::ContextDisposed.kind(), ErrorKind::Ownership);
        assert_eq!(AppError::cancelled("commit").kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_serialization_error_message() {
        let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = AppError::serialization("teachers", "address", source);

        assert_eq!(err.kind(), ErrorKind::Serialization);
        assert!(err.to_string().contains("`address`"));
        assert!(err.to_string().contains("`teachers`"));
    }

    #[test]
    fn test_non_database_errors_are_not_constraint_violations() {
        assert!(!AppError::conflict("stale").is_constraint_violation());
        assert!(!AppError::Database(sqlx::Error::RowNotFound).is_constraint_violation());
        assert!(!AppError::Database(sqlx::Error::RowNotFound).is_unique_violation());
    }
}
