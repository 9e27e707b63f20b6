//! 异步键值缓存抽象层
//!
//! 定义统一的缓存接口，支持内存和 Redis 两种实现；所有键在访问后端前被改写为
//! `table:objectId:key`，不同 (table, objectId) 的缓存即使共享后端也不会冲突。
//! table 与 objectId 中的 `\` 和 `:` 以 `\` 转义，因此分段始终唯一。

mod memory;
#[cfg(feature = "redis")]
mod redis;
mod session;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::config::CacheSection;
use crate::error::{BrokerError, Result};

pub use memory::MemoryCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisCache;
pub use session::{SessionCache, CHANNEL_CACHES};

/// 缓存命名空间
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub table: String,
    pub object_id: String,
}

impl Namespace {
    pub fn new(table: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            object_id: object_id.into(),
        }
    }

    /// 后端中的实际键
    pub fn key(&self, key: &str) -> String {
        let mut full = self.prefix();
        full.push_str(key);
        full
    }

    /// 命名空间内所有键共享的前缀
    pub fn prefix(&self) -> String {
        format!("{}:{}:", escape_segment(&self.table), escape_segment(&self.object_id))
    }

    /// Redis SCAN MATCH 模式：前缀中的 glob 元字符按字面匹配
    #[cfg_attr(not(feature = "redis"), allow(dead_code))]
    fn match_pattern(&self) -> String {
        let prefix = self.prefix();
        let mut pattern = String::with_capacity(prefix.len() + 1);
        for c in prefix.chars() {
            if matches!(c, '\\' | '*' | '?' | '[' | ']') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('*');
        pattern
    }
}

fn escape_segment(segment: &str) -> String {
    let mut escaped = String::with_capacity(segment.len());
    for c in segment.chars() {
        if c == '\\' || c == ':' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.object_id)
    }
}

/// 异步缓存接口
#[async_trait]
pub trait AsyncCache: Send + Sync {
    fn namespace(&self) -> &Namespace;

    async fn has(&self, key: &str) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// 删除本命名空间下的所有键
    async fn destroy(&self) -> Result<()>;
}

/// 类型化读写
#[async_trait]
pub trait AsyncCacheExt: AsyncCache {
    async fn get_as<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn set_as<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value).await
    }
}

impl<C: AsyncCache + ?Sized> AsyncCacheExt for C {}

/// 缓存后端模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    InMemory,
    Redis,
}

impl CacheMode {
    /// 解析模式；未知值回退到内存（缓存失败开放）
    pub fn parse_or_default(s: &str) -> Self {
        s.parse().unwrap_or_else(|_| {
            tracing::warn!(mode = %s, "Unknown cache mode, falling back to in-memory");
            CacheMode::InMemory
        })
    }
}

impl FromStr for CacheMode {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in-memory" => Ok(CacheMode::InMemory),
            "redis" => Ok(CacheMode::Redis),
            other => Err(BrokerError::UnsupportedMode(other.to_string())),
        }
    }
}

enum Backend {
    Memory(Arc<RwLock<HashMap<String, Value>>>),
    #[cfg(feature = "redis")]
    Redis(Arc<self::redis::RedisPool>),
}

/// 缓存工厂：同一工厂创建的缓存共享同一后端
pub struct CacheFactory {
    backend: Backend,
}

impl CacheFactory {
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(RwLock::new(HashMap::new()))),
        }
    }

    /// 根据 [cache] 配置创建；Redis 不可用时回退到内存
    pub fn from_config(section: &CacheSection) -> Self {
        match CacheMode::parse_or_default(&section.mode) {
            CacheMode::InMemory => {
                tracing::info!("Using in-memory cache");
                Self::in_memory()
            }
            #[cfg(feature = "redis")]
            CacheMode::Redis => match self::redis::RedisPool::from_section(section) {
                Ok(pool) => {
                    tracing::info!(ttl_secs = section.ttl_secs, "Using redis cache");
                    Self {
                        backend: Backend::Redis(Arc::new(pool)),
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to create redis cache, falling back to memory: {}", e);
                    Self::in_memory()
                }
            },
            #[cfg(not(feature = "redis"))]
            CacheMode::Redis => {
                tracing::warn!("Redis cache requested but redis feature not enabled, using memory cache");
                Self::in_memory()
            }
        }
    }

    pub fn mode(&self) -> CacheMode {
        match &self.backend {
            Backend::Memory(_) => CacheMode::InMemory,
            #[cfg(feature = "redis")]
            Backend::Redis(_) => CacheMode::Redis,
        }
    }

    /// 为 (table, objectId) 创建缓存
    pub fn for_object(&self, table: &str, object_id: &str) -> Arc<dyn AsyncCache> {
        let namespace = Namespace::new(table, object_id);
        match &self.backend {
            Backend::Memory(store) => Arc::new(MemoryCache::new(namespace, Arc::clone(store))),
            #[cfg(feature = "redis")]
            Backend::Redis(pool) => Arc::new(RedisCache::new(namespace, Arc::clone(pool))),
        }
    }

    /// 释放后端（关停时调用）
    pub async fn destroy(&self) {
        match &self.backend {
            Backend::Memory(store) => store.write().await.clear(),
            #[cfg(feature = "redis")]
            Backend::Redis(pool) => pool.disconnect().await,
        }
    }
}

impl Default for CacheFactory {
    fn default() -> Self {
        Self::in_memory()
    }
}
