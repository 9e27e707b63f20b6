//! 错误类型
//!
//! 与 API 边界配合：NotFound 映射为 404，其余一律映射为通用服务端错误，细节只写入服务端日志。

use std::time::Duration;

use thiserror::Error;

/// 代理底座中可能出现的错误（对象缺失、后端模式、认证超时、后端调用失败等）
#[derive(Error, Debug)]
pub enum BrokerError {
    /// 会话 / 对象不存在，直接交给调用方处理
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// 未知或尚未实现的发布订阅后端（构造时即失败）
    #[error("Pub/sub mode {0} is not supported")]
    UnsupportedMode(String),

    #[error("Object subtype {0} is not supported")]
    UnsupportedSubtype(String),

    /// 传输层内部错误，只触发重连，不向应用层暴露
    #[error("Authentication not acknowledged within {0:?}")]
    AuthTimeout(Duration),

    /// 缓存 / 发布订阅后端调用失败（瞬时错误）
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Subject {0} is already registered with a different payload type")]
    SubjectTypeMismatch(String),

    #[error("Transport closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),
}

impl BrokerError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// API 边界上的状态码
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            _ => 500,
        }
    }

    /// 可返回给客户端的消息；非 NotFound 错误不泄露细节
    pub fn public_message(&self) -> String {
        match self {
            Self::NotFound { .. } => self.to_string(),
            _ => "Internal server error".to_string(),
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        Self::Backend(e.to_string())
    }
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for BrokerError {
    fn from(e: sqlx::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

impl From<config::ConfigError> for BrokerError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        let missing = BrokerError::not_found("conversation", "te-1");
        assert_eq!(missing.status_code(), 404);
        assert_eq!(missing.public_message(), "conversation te-1 not found");

        let backend = BrokerError::Backend("connection refused on 10.0.0.4".to_string());
        assert_eq!(backend.status_code(), 500);
        assert!(!backend.public_message().contains("10.0.0.4"));
    }
}
