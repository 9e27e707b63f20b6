//! Redis 后端：PUBLISH / SUBSCRIBE，负载以 JSON 文本传输

use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, IntoConnectionInfo};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::subject::{Link, Subject};
use super::{Payload, PubSubMode};
use crate::config::BrokerSection;
use crate::error::{BrokerError, Result};

pub(super) struct RedisLink {
    publisher: MultiplexedConnection,
    shutdown: CancellationToken,
}

impl RedisLink {
    pub(super) async fn publish<T: Serialize>(&self, channel: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        let mut con = self.publisher.clone();
        let _: i64 = con.publish(channel, payload).await.map_err(|e| {
            tracing::error!(subject = %channel, error = %e, "Redis publish failed");
            BrokerError::from(e)
        })?;
        Ok(())
    }

    pub(super) fn close(&self) {
        self.shutdown.cancel();
    }
}

/// 根据配置构建 Redis 客户端（用户名 / 密码覆盖 URI 中的凭据）
pub(super) fn client_from_section(section: &BrokerSection) -> Result<redis::Client> {
    let uri = section
        .uri
        .as_deref()
        .ok_or_else(|| BrokerError::Config("broker.uri is required for redis mode".to_string()))?;
    let mut info = uri.into_connection_info()?;
    if let Some(username) = &section.username {
        info.redis.username = Some(username.clone());
    }
    if let Some(password) = &section.password {
        info.redis.password = Some(password.clone());
    }
    Ok(redis::Client::open(info)?)
}

/// 建立发布连接与订阅连接，并启动监听任务
pub(super) async fn redis_subject<T: Payload>(client: &redis::Client, name: String) -> Result<Subject<T>> {
    let publisher = client.get_multiplexed_async_connection().await?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(&name).await?;

    let shutdown = CancellationToken::new();
    let subject = Subject::with_link(
        name.clone(),
        PubSubMode::Redis,
        Link::Redis(RedisLink {
            publisher,
            shutdown: shutdown.clone(),
        }),
    );

    let weak = subject.downgrade();
    tokio::spawn(async move {
        let mut messages = pubsub.into_on_message();
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = messages.next() => match msg {
                    Some(msg) => msg,
                    None => {
                        tracing::warn!(subject = %name, "Redis subscription stream ended");
                        break;
                    }
                },
            };
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(subject = %name, error = %e, "Dropping non-text redis message");
                    continue;
                }
            };
            match serde_json::from_str::<T>(&payload) {
                Ok(value) => inner.deliver(value),
                Err(e) => {
                    tracing::warn!(subject = %name, error = %e, "Dropping undecodable redis message");
                }
            }
        }
        tracing::debug!(subject = %name, "Redis listener stopped");
    });

    tracing::info!(subject = %subject.name(), "Redis subject created");
    Ok(subject)
}
