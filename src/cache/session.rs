//! 组合会话缓存：一个对象拥有多个可独立销毁的命名缓存

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{AsyncCache, CacheFactory};
use crate::error::{BrokerError, Result};

/// 渠道对象使用的命名缓存
pub const CHANNEL_CACHES: &[&str] = &[
    "usernamesToWorkerIds",
    "workerIdsToChannelUserIds",
    "userIdsToWorkerIds",
    "sessionThreads",
    "threadSessions",
    "messageBuffers",
    "messageImages",
    "channelMessageIdsToImplementationIds",
];

pub struct SessionCache {
    table: String,
    object_id: String,
    caches: BTreeMap<String, Arc<dyn AsyncCache>>,
}

impl SessionCache {
    /// 为对象创建一组命名缓存，命名空间为 (table, `{objectId}:{name}`)
    pub fn for_object(factory: &CacheFactory, table: &str, object_id: &str, names: &[&str]) -> Self {
        let caches = names
            .iter()
            .map(|name| {
                let scoped = format!("{}:{}", object_id, name);
                (name.to_string(), factory.for_object(table, &scoped))
            })
            .collect();
        Self {
            table: table.to_string(),
            object_id: object_id.to_string(),
            caches,
        }
    }

    pub fn cache(&self, name: &str) -> Option<Arc<dyn AsyncCache>> {
        self.caches.get(name).cloned()
    }

    /// 获取命名缓存，不存在则返回 NotFound
    pub fn require(&self, name: &str) -> Result<Arc<dyn AsyncCache>> {
        self.cache(name)
            .ok_or_else(|| BrokerError::not_found("cache", format!("{}:{}:{}", self.table, self.object_id, name)))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.caches.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    /// 销毁所有命名缓存；逐个尝试，返回最后一个错误
    pub async fn destroy(&self) -> Result<()> {
        let mut last_error = None;
        for (name, cache) in &self.caches {
            if let Err(e) = cache.destroy().await {
                tracing::warn!(object_id = %self.object_id, cache = %name, error = %e, "Failed to destroy cache");
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
