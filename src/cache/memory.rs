//! 进程内缓存

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{AsyncCache, Namespace};
use crate::error::Result;

/// 内存缓存：同一工厂的所有命名空间共享一张表
pub struct MemoryCache {
    namespace: Namespace,
    store: Arc<RwLock<HashMap<String, Value>>>,
}

impl MemoryCache {
    pub fn new(namespace: Namespace, store: Arc<RwLock<HashMap<String, Value>>>) -> Self {
        Self { namespace, store }
    }

    /// 独立存储的缓存（测试用）
    pub fn standalone(table: &str, object_id: &str) -> Self {
        Self::new(Namespace::new(table, object_id), Arc::new(RwLock::new(HashMap::new())))
    }
}

#[async_trait]
impl AsyncCache for MemoryCache {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.store.read().await.contains_key(&self.namespace.key(key)))
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.store.read().await.get(&self.namespace.key(key)).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.store.write().await.insert(self.namespace.key(key), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.write().await.remove(&self.namespace.key(key));
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let prefix = self.namespace.prefix();
        let mut store = self.store.write().await;
        let before = store.len();
        store.retain(|k, _| !k.starts_with(&prefix));
        tracing::debug!(namespace = %self.namespace, removed = before - store.len(), "Memory cache destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let cache = MemoryCache::standalone("worker", "w-1");
        cache.set("a", json!({"n": 1})).await.unwrap();
        cache.destroy().await.unwrap();
        cache.destroy().await.unwrap();
        assert!(!cache.has("a").await.unwrap());
    }
}
