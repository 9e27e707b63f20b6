//! 对象代理：活动对象的注册表与路由
//!
//! - 注册表只在 register / destroy 时修改，新条目完整构建后才对读者可见
//! - 每个对象拥有一个输出 Subject（`{kind}.{id}.events`），会话订阅在其上按会话 / 发送者 / 事件类型过滤
//! - 对象执行失败（错误或 panic）交给失败回调，不会越过代理边界；配置了工厂时失败对象会按存储的配置重建
//! - register / destroy / sync 串行执行，销毁过程中到达的注册要等旧实例的输出流与缓存释放完毕

mod factory;
mod object;

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::{Mutex, RwLock};

use crate::cache::{CacheFactory, SessionCache};
use crate::error::{BrokerError, Result};
use crate::event_bus::{EventBus, OutboxEventType};
use crate::pubsub::{PubSubHub, PubSubMode, Subject, Subscription};

pub use factory::{ObjectConfig, ObjectFactory, ObjectKind};
pub use object::{BrokerObject, Emitter, ObjectContext, ObjectEvent};

/// 失败回调：(objectId, error)
pub type FailureHandler = Arc<dyn Fn(&str, &anyhow::Error) + Send + Sync>;

struct Registered<A: BrokerObject> {
    object: Arc<A>,
    outputs: Subject<A::Event>,
    cache: Arc<SessionCache>,
    config: Option<ObjectConfig>,
}

pub struct ObjectBroker<A: BrokerObject> {
    kind: ObjectKind,
    mode: PubSubMode,
    hub: Arc<PubSubHub>,
    caches: Arc<CacheFactory>,
    objects: RwLock<HashMap<String, Arc<Registered<A>>>>,
    lifecycle: Mutex<()>,
    on_failure: FailureHandler,
    factory: Option<Arc<ObjectFactory<A>>>,
}

impl<A: BrokerObject> ObjectBroker<A> {
    pub fn new(kind: ObjectKind, mode: PubSubMode, hub: Arc<PubSubHub>, caches: Arc<CacheFactory>) -> Self {
        Self {
            kind,
            mode,
            hub,
            caches,
            objects: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(()),
            factory: None,
            on_failure: Arc::new(move |object_id: &str, error: &anyhow::Error| {
                tracing::error!(kind = %kind, object_id = %object_id, error = %error, "Object had a critical failure");
            }),
        }
    }

    /// 替换失败回调
    pub fn with_failure_handler(mut self, handler: impl Fn(&str, &anyhow::Error) + Send + Sync + 'static) -> Self {
        self.on_failure = Arc::new(handler);
        self
    }

    /// 失败的对象被移除后按存储的配置重建；重建失败则保持移除
    pub fn with_resync(mut self, factory: Arc<ObjectFactory<A>>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// 注册对象（按 id 覆盖，旧实例被销毁，输出流与缓存保留）
    pub async fn register(&self, object: Arc<A>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.insert(object, None).await
    }

    async fn insert(&self, object: Arc<A>, config: Option<ObjectConfig>) -> Result<()> {
        let id = object.id().to_string();
        let subject_name = format!("{}.{}.events", self.kind.as_str(), id);
        let outputs = self.hub.create_subject::<A::Event>(&subject_name, self.mode).await?;
        let cache = Arc::new(SessionCache::for_object(&self.caches, self.kind.as_str(), &id, A::CACHE_NAMES));
        let entry = Arc::new(Registered {
            object,
            outputs,
            cache,
            config,
        });

        let previous = self.objects.write().await.insert(id.clone(), Arc::clone(&entry));
        tracing::info!(kind = %self.kind, object_id = %id, replaced = previous.is_some(), "Registered object");

        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous.object, &entry.object) {
                if let Err(e) = previous.object.destroy().await {
                    tracing::warn!(kind = %self.kind, object_id = %id, error = %e, "Failed to destroy replaced object");
                }
            }
        }
        Ok(())
    }

    /// 获取对象；不存在返回 None
    pub async fn get_object(&self, object_id: &str) -> Option<Arc<A>> {
        self.objects
            .read()
            .await
            .get(object_id)
            .map(|entry| Arc::clone(&entry.object))
    }

    async fn entry(&self, object_id: &str) -> Result<Arc<Registered<A>>> {
        self.objects
            .read()
            .await
            .get(object_id)
            .cloned()
            .ok_or_else(|| BrokerError::not_found(self.kind.as_str(), object_id))
    }

    /// 会话订阅：只投递属于该会话、非该参与者自己发出、且类型在过滤列表中的事件
    pub async fn subscribe<F, Fut>(
        &self,
        object_id: &str,
        session_id: &str,
        actor_id: &str,
        event_types: &[&str],
        callback: F,
    ) -> Result<Subscription>
    where
        F: Fn(A::Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let entry = self.entry(object_id).await?;
        tracing::debug!(kind = %self.kind, object_id = %object_id, session_id = %session_id, "Subscribing to session");

        let session_id = session_id.to_string();
        let actor_id = actor_id.to_string();
        let event_types: Vec<String> = event_types.iter().map(|t| t.to_string()).collect();
        let callback = Arc::new(callback);
        Ok(entry.outputs.subscribe(move |event: A::Event| {
            let matched = event.session_id() == Some(session_id.as_str())
                && event.sender_id() != actor_id
                && event_types.iter().any(|t| t == event.event_type());
            if !matched {
                tracing::debug!(
                    session_id = %session_id,
                    event_session = ?event.session_id(),
                    "Event not matched for session"
                );
            }
            let callback = Arc::clone(&callback);
            async move {
                if matched {
                    callback(event).await
                } else {
                    Ok(())
                }
            }
        }))
    }

    /// 对象级订阅：只投递不属于任何会话的事件
    pub async fn subscribe_object<F, Fut>(&self, object_id: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(A::Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let entry = self.entry(object_id).await?;
        let callback = Arc::new(callback);
        Ok(entry.outputs.subscribe(move |event: A::Event| {
            let callback = Arc::clone(&callback);
            async move {
                if event.session_id().is_none() {
                    callback(event).await
                } else {
                    Ok(())
                }
            }
        }))
    }

    /// 调用对象处理请求
    ///
    /// 对象不存在返回 NotFound；对象自身的错误或 panic 交给失败回调，调用本身返回 Ok。
    pub async fn execute(&self, object_id: &str, request: A::Request) -> Result<()> {
        let entry = self.entry(object_id).await?;
        let ctx = ObjectContext {
            object_id: object_id.to_string(),
            emitter: Emitter::new(entry.outputs.clone()),
            cache: Arc::clone(&entry.cache),
        };

        let outcome = AssertUnwindSafe(entry.object.execute(request, ctx))
            .catch_unwind()
            .await;
        let error = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(_) => anyhow::anyhow!("{} {} panicked during execute", self.kind, object_id),
        };
        (self.on_failure)(object_id, &error);
        if let Some(factory) = &self.factory {
            self.resync_failed(object_id, &entry, factory).await;
        }
        Ok(())
    }

    /// 移除失败的实例并按其配置重建（期间已被替换或移除则不做处理）
    async fn resync_failed(&self, object_id: &str, failed: &Arc<Registered<A>>, factory: &ObjectFactory<A>) {
        let _lifecycle = self.lifecycle.lock().await;
        let still_current = self
            .objects
            .read()
            .await
            .get(object_id)
            .map_or(false, |current| Arc::ptr_eq(current, failed));
        if !still_current {
            return;
        }

        if let Err(e) = self.remove(object_id).await {
            tracing::warn!(kind = %self.kind, object_id = %object_id, error = %e, "Failed to release cache of failed object");
        }
        let Some(config) = failed.config.clone() else {
            tracing::warn!(kind = %self.kind, object_id = %object_id, "Failed object has no stored config, released");
            return;
        };
        tracing::info!(kind = %self.kind, object_id = %object_id, "Resyncing failed object");
        if let Err(e) = self.build_and_insert(config, factory).await {
            tracing::error!(kind = %self.kind, object_id = %object_id, error = %e, "Resync failed, object released");
        }
    }

    /// 销毁对象：释放对象、会话缓存并完成其输出流；不存在时为空操作
    pub async fn destroy(&self, object_id: &str) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.remove(object_id).await
    }

    async fn remove(&self, object_id: &str) -> Result<()> {
        let Some(entry) = self.objects.write().await.remove(object_id) else {
            return Ok(());
        };
        tracing::info!(kind = %self.kind, object_id = %object_id, "Destroying object");

        if let Err(e) = entry.object.destroy().await {
            tracing::error!(kind = %self.kind, object_id = %object_id, error = %e, "Object destroy failed");
        }
        let cache_result = entry.cache.destroy().await;
        entry.outputs.complete();
        cache_result
    }

    pub async fn destroy_all(&self) {
        for id in self.ids().await {
            if let Err(e) = self.destroy(&id).await {
                tracing::warn!(kind = %self.kind, object_id = %id, error = %e, "Failed to destroy object");
            }
        }
    }

    /// 按配置同步对象：配置未变化时不做任何事，否则重建并注册；返回是否发生了替换
    pub async fn sync_object(&self, config: ObjectConfig, factory: &ObjectFactory<A>) -> Result<bool> {
        let _lifecycle = self.lifecycle.lock().await;
        let current = self.objects.read().await.get(&config.id).and_then(|e| e.config.clone());
        if current.as_ref() == Some(&config) {
            return Ok(false);
        }
        tracing::info!(kind = %self.kind, object_id = %config.id, "Object config changed, updating");
        self.build_and_insert(config, factory).await?;
        Ok(true)
    }

    async fn build_and_insert(&self, config: ObjectConfig, factory: &ObjectFactory<A>) -> Result<()> {
        let object = factory.create(&config)?;
        if object.id() != config.id {
            return Err(BrokerError::Config(format!(
                "constructed object id {} does not match config id {}",
                object.id(),
                config.id
            )));
        }
        self.insert(object, Some(config)).await
    }

    /// 监听 outbox：本类别对象的 delete 事件会销毁对应的活动对象
    pub fn watch_outbox(self: &Arc<Self>, bus: &EventBus) -> Subscription {
        let broker = Arc::downgrade(self);
        let kind = self.kind;
        bus.subscribe(move |event| {
            let broker = broker.clone();
            async move {
                if event.event_type != OutboxEventType::Delete || event.object_type != kind.as_str() {
                    return Ok(());
                }
                if let Some(broker) = broker.upgrade() {
                    broker.destroy(&event.object_id).await?;
                }
                Ok(())
            }
        })
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn ids(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }
}
