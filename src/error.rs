//! Fanline Core 错误工具模块
//!
//! - 统一的错误码与错误类型
//! - 基础设施层使用 `ErrorBuilder` 构建带详情的错误

use std::fmt;

use thiserror::Error;

/// 错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// 参数无效
    InvalidParameter,
    /// 配置错误
    ConfigurationError,
    /// 未认证
    Unauthorized,
    /// 无权限
    PermissionDenied,
    /// 资源不存在
    NotFound,
    /// 资源冲突
    Conflict,
    /// 等待超时
    Timeout,
    /// 依赖服务不可用（Kafka、Redis 等）
    ServiceUnavailable,
    /// 存储读写失败
    DatabaseError,
    /// 序列化失败
    SerializationError,
    /// 反序列化失败
    DeserializationError,
    /// 内部错误
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
            ErrorCode::DeserializationError => "DESERIALIZATION_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// 调用方是否可以自行重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout | ErrorCode::ServiceUnavailable | ErrorCode::DatabaseError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 统一错误类型
#[derive(Debug, Clone, Error)]
#[error("[{code}] {reason}{}", fmt_details(.details))]
pub struct FanlineError {
    pub code: ErrorCode,
    pub reason: String,
    pub details: Option<String>,
}

fn fmt_details(details: &Option<String>) -> String {
    details
        .as_deref()
        .map(|d| format!(": {d}"))
        .unwrap_or_default()
}

impl FanlineError {
    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

pub type Result<T> = std::result::Result<T, FanlineError>;

/// 错误构建器
///
/// ```rust
/// use fanline_core::error::{ErrorBuilder, ErrorCode};
///
/// let err = ErrorBuilder::new(ErrorCode::ServiceUnavailable, "failed to open redis connection")
///     .details("connection refused")
///     .build_error();
/// assert_eq!(err.code, ErrorCode::ServiceUnavailable);
/// ```
#[derive(Debug)]
pub struct ErrorBuilder {
    code: ErrorCode,
    reason: String,
    details: Option<String>,
}

impl ErrorBuilder {
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            details: None,
        }
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn build_error(self) -> FanlineError {
        FanlineError {
            code: self.code,
            reason: self.reason,
            details: self.details,
        }
    }
}

/// 将任意基础设施错误映射为指定错误码
pub fn map_infra_error<E: fmt::Display>(err: E, code: ErrorCode, reason: &str) -> FanlineError {
    ErrorBuilder::new(code, reason)
        .details(err.to_string())
        .build_error()
}
