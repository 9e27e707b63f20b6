//! 自动重连的 WebSocket 客户端传输
//!
//! - 连接建立后延迟发送 `{token}`，在认证超时内未收到确认则关闭连接并重连
//! - 未认证期间的发送进入预认证队列，认证成功后按原顺序冲刷
//! - 认证之后的入站帧交给 [`FrameHandler`] 做类型化分发

mod client;

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::TransportSection;

pub use client::SocketTransport;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// 已连接，等待认证确认
    Authenticating,
    /// 已认证，可直接发送
    Connected,
}

/// 服务端对 token 的确认帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// 客户端发送的认证帧
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthMessage {
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub token: Option<String>,
    /// 匿名连接建立即视为已认证，不做握手
    pub anonymous: bool,
    pub token_delay: Duration,
    pub auth_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self::from_section(url, &TransportSection::default())
    }

    pub fn from_section(url: impl Into<String>, section: &TransportSection) -> Self {
        Self {
            url: url.into(),
            token: None,
            anonymous: false,
            token_delay: section.token_delay(),
            auth_timeout: section.auth_timeout(),
            reconnect_delay: section.reconnect_delay(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }
}

/// 认证后入站帧的处理者
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle_frame(&self, frame: serde_json::Value) -> anyhow::Result<()>;
}

/// 把入站帧反序列化为 M 后交给闭包
pub struct TypedHandler<M, F> {
    callback: F,
    _message: PhantomData<fn(M)>,
}

impl<M, F> TypedHandler<M, F> {
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<M, F, Fut> FrameHandler for TypedHandler<M, F>
where
    M: DeserializeOwned + Send + 'static,
    F: Fn(M) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle_frame(&self, frame: serde_json::Value) -> anyhow::Result<()> {
        let message: M = serde_json::from_value(frame)?;
        (self.callback)(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_response_without_message() {
        let resp: AuthResponse = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert!(resp.success);
        assert_eq!(resp.message, None);
    }

    #[test]
    fn test_config_defaults_follow_section() {
        let config = TransportConfig::new("ws://localhost:8080/socket").with_token("t");
        assert_eq!(config.token_delay, Duration::from_secs(5));
        assert_eq!(config.auth_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert!(!config.anonymous);
    }

    #[tokio::test]
    async fn test_typed_handler_rejects_malformed_frame() {
        #[derive(Deserialize)]
        struct Chat {
            #[allow(dead_code)]
            text: String,
        }
        let handler = TypedHandler::new(|_: Chat| async { Ok(()) });
        assert!(handler.handle_frame(serde_json::json!({"text": "hi"})).await.is_ok());
        assert!(handler.handle_frame(serde_json::json!({"other": 1})).await.is_err());
    }
}
