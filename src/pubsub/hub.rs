//! PubSubHub：按名称记忆 Subject
//!
//! 同名 Subject 在完成之前始终返回同一实例；完成时通过完成钩子从注册表移除，
//! 之后再次创建会得到全新的实例。

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::subject::{Link, Subject};
use super::{Payload, PubSubMode};
use crate::config::BrokerSection;
use crate::error::{BrokerError, Result};

struct Entry {
    handle: Arc<dyn Any + Send + Sync>,
    completer: Arc<dyn Fn() + Send + Sync>,
    instance_id: u64,
}

type Registry = Arc<Mutex<HashMap<String, Entry>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, Entry>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Subject 注册中心
pub struct PubSubHub {
    subjects: Registry,
    #[cfg(feature = "redis")]
    redis: Option<redis::Client>,
}

impl PubSubHub {
    /// 进程内 Hub（不连接任何外部后端）
    pub fn in_memory() -> Self {
        Self {
            subjects: Arc::new(Mutex::new(HashMap::new())),
            #[cfg(feature = "redis")]
            redis: None,
        }
    }

    /// 根据 [broker] 配置构建；redis 模式下需要提供 uri
    pub fn from_config(section: &BrokerSection) -> Result<Self> {
        let mode: PubSubMode = section.mode.parse()?;
        let hub = Self::in_memory();
        #[cfg(feature = "redis")]
        let hub = if mode == PubSubMode::Redis {
            Self {
                redis: Some(super::redis::client_from_section(section)?),
                ..hub
            }
        } else {
            hub
        };
        #[cfg(not(feature = "redis"))]
        if mode == PubSubMode::Redis {
            return Err(BrokerError::UnsupportedMode(format!(
                "{} (crate built without the redis feature)",
                mode
            )));
        }
        tracing::info!(mode = %mode, "PubSubHub initialized");
        Ok(hub)
    }

    /// 获取或创建指定名称的 Subject
    ///
    /// - 已存在且未完成：返回同一实例（负载类型不同则报 SubjectTypeMismatch）
    /// - kafka：UnsupportedMode
    /// - google-pub-sub：在进程内投递
    pub async fn create_subject<T: Payload>(&self, name: &str, mode: PubSubMode) -> Result<Subject<T>> {
        if let Some(existing) = self.lookup::<T>(name)? {
            return Ok(existing);
        }

        let subject = self.build_subject::<T>(name, mode).await?;

        let mut subjects = lock(&self.subjects);
        if let Some(entry) = subjects.get(name) {
            let winner = entry
                .handle
                .downcast_ref::<Subject<T>>()
                .cloned()
                .ok_or_else(|| BrokerError::SubjectTypeMismatch(name.to_string()));
            drop(subjects);
            subject.complete();
            return winner;
        }

        let instance_id = subject.id();
        let completer_subject = subject.clone();
        subjects.insert(
            name.to_string(),
            Entry {
                handle: Arc::new(subject.clone()),
                completer: Arc::new(move || completer_subject.complete()),
                instance_id,
            },
        );
        drop(subjects);

        let registry = Arc::downgrade(&self.subjects);
        let key = name.to_string();
        subject.on_complete(move || {
            if let Some(registry) = registry.upgrade() {
                let mut subjects = lock(&registry);
                if subjects.get(&key).map(|e| e.instance_id) == Some(instance_id) {
                    subjects.remove(&key);
                    tracing::debug!(subject = %key, "Subject evicted from hub");
                }
            }
        });

        Ok(subject)
    }

    fn lookup<T: Payload>(&self, name: &str) -> Result<Option<Subject<T>>> {
        let subjects = lock(&self.subjects);
        match subjects.get(name) {
            Some(entry) => entry
                .handle
                .downcast_ref::<Subject<T>>()
                .cloned()
                .map(Some)
                .ok_or_else(|| BrokerError::SubjectTypeMismatch(name.to_string())),
            None => Ok(None),
        }
    }

    async fn build_subject<T: Payload>(&self, name: &str, mode: PubSubMode) -> Result<Subject<T>> {
        match mode {
            PubSubMode::InMemory => Ok(Subject::with_link(name.to_string(), mode, Link::Local)),
            PubSubMode::GooglePubSub => {
                tracing::warn!(subject = %name, "google-pub-sub mode delivers in-process only");
                Ok(Subject::with_link(name.to_string(), mode, Link::Local))
            }
            PubSubMode::Kafka => Err(BrokerError::UnsupportedMode(mode.to_string())),
            PubSubMode::Redis => self.build_redis_subject(name).await,
        }
    }

    #[cfg(feature = "redis")]
    async fn build_redis_subject<T: Payload>(&self, name: &str) -> Result<Subject<T>> {
        let client = self
            .redis
            .as_ref()
            .ok_or_else(|| BrokerError::Config("redis pub/sub is not configured".to_string()))?;
        super::redis::redis_subject(client, name.to_string()).await
    }

    #[cfg(not(feature = "redis"))]
    async fn build_redis_subject<T: Payload>(&self, _name: &str) -> Result<Subject<T>> {
        Err(BrokerError::UnsupportedMode(PubSubMode::Redis.to_string()))
    }

    /// 完成所有已注册的 Subject（关停时调用）
    pub fn complete_all(&self) {
        let completers: Vec<_> = lock(&self.subjects)
            .values()
            .map(|e| Arc::clone(&e.completer))
            .collect();
        let count = completers.len();
        for complete in completers {
            complete();
        }
        tracing::info!(count, "Completed all subjects");
    }

    pub fn contains(&self, name: &str) -> bool {
        lock(&self.subjects).contains_key(name)
    }

    pub fn len(&self) -> usize {
        lock(&self.subjects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PubSubHub {
    fn default() -> Self {
        Self::in_memory()
    }
}
