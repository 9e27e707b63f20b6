//! Redis 缓存：值以 JSON 文本存储，写入时设置过期时间

use std::sync::Arc;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, IntoConnectionInfo};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{AsyncCache, Namespace};
use crate::config::CacheSection;
use crate::error::{BrokerError, Result};

const SCAN_BATCH: usize = 100;

/// 工厂级共享连接（首次使用时建立，可被多个进程实例同时访问）
pub(super) struct RedisPool {
    client: ::redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    ttl_secs: u64,
}

impl RedisPool {
    pub(super) fn from_section(section: &CacheSection) -> Result<Self> {
        let uri = section
            .uri
            .as_deref()
            .ok_or_else(|| BrokerError::Config("cache.uri is required for redis mode".to_string()))?;
        let mut info = uri.into_connection_info()?;
        if let Some(username) = &section.username {
            info.redis.username = Some(username.clone());
        }
        if let Some(password) = &section.password {
            info.redis.password = Some(password.clone());
        }
        Ok(Self {
            client: ::redis::Client::open(info)?,
            connection: Mutex::new(None),
            ttl_secs: section.ttl_secs,
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(con) = guard.as_ref() {
            return Ok(con.clone());
        }
        let con = self.client.get_multiplexed_async_connection().await?;
        *guard = Some(con.clone());
        Ok(con)
    }

    pub(super) async fn disconnect(&self) {
        if self.connection.lock().await.take().is_some() {
            tracing::info!("Redis cache connection released");
        }
    }
}

pub struct RedisCache {
    namespace: Namespace,
    pool: Arc<RedisPool>,
}

impl RedisCache {
    pub(super) fn new(namespace: Namespace, pool: Arc<RedisPool>) -> Self {
        Self { namespace, pool }
    }

    fn backend_error(&self, op: &str, e: ::redis::RedisError) -> BrokerError {
        tracing::error!(namespace = %self.namespace, op, error = %e, "Redis cache operation failed");
        BrokerError::from(e)
    }
}

#[async_trait]
impl AsyncCache for RedisCache {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn has(&self, key: &str) -> Result<bool> {
        let mut con = self.pool.connection().await?;
        con.exists(self.namespace.key(key))
            .await
            .map_err(|e| self.backend_error("has", e))
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut con = self.pool.connection().await?;
        let raw: Option<String> = con
            .get(self.namespace.key(key))
            .await
            .map_err(|e| self.backend_error("get", e))?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let payload = serde_json::to_string(&value)?;
        let mut con = self.pool.connection().await?;
        con.set_ex::<_, _, ()>(self.namespace.key(key), payload, self.pool.ttl_secs)
            .await
            .map_err(|e| self.backend_error("set", e))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut con = self.pool.connection().await?;
        con.del::<_, ()>(self.namespace.key(key))
            .await
            .map_err(|e| self.backend_error("delete", e))
    }

    async fn destroy(&self) -> Result<()> {
        let pattern = self.namespace.match_pattern();
        let mut con = self.pool.connection().await?;
        let mut cursor: u64 = 0;
        let mut removed = 0usize;
        loop {
            let (next, keys): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut con)
                .await
                .map_err(|e| self.backend_error("scan", e))?;
            if !keys.is_empty() {
                removed += keys.len();
                con.del::<_, ()>(keys)
                    .await
                    .map_err(|e| self.backend_error("destroy", e))?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        tracing::debug!(namespace = %self.namespace, removed, "Redis cache destroyed");
        Ok(())
    }
}
