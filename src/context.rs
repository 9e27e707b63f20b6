//! BrokerContext：显式构造的运行时上下文
//!
//! 持有配置、PubSubHub、缓存工厂、会话管理器与按需创建的 EventBus。
//! 每个上下文相互独立，测试可以各自创建而不会共享状态。
//! 上下文启动的队列冲刷任务在 [`BrokerContext::shutdown`] 或父级关闭 token 取消时停止。

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admission::{AdmissionQueue, MemoryWorkRequestStore, WorkRequest, WorkRequestStore};
use crate::broker::{BrokerObject, ObjectBroker, ObjectKind};
use crate::cache::CacheFactory;
use crate::config::AppConfig;
use crate::conversation::ConversationManager;
use crate::error::Result;
use crate::event_bus::EventBus;
use crate::pubsub::{PubSubHub, PubSubMode};
use crate::transport::TransportConfig;

pub struct BrokerContext {
    config: AppConfig,
    mode: PubSubMode,
    hub: Arc<PubSubHub>,
    caches: Arc<CacheFactory>,
    conversations: Arc<ConversationManager>,
    event_bus: OnceCell<Arc<EventBus>>,
    shutdown: CancellationToken,
    flushers: Mutex<Vec<JoinHandle<()>>>,
}

impl BrokerContext {
    /// 按配置构建；pub/sub 模式无法识别时直接失败
    pub fn new(config: AppConfig) -> Result<Self> {
        let mode: PubSubMode = config.broker.mode.parse()?;
        let hub = Arc::new(PubSubHub::from_config(&config.broker)?);
        let caches = Arc::new(CacheFactory::from_config(&config.cache));
        let conversations = Arc::new(ConversationManager::new(config.conversation.release_delay()));
        tracing::info!(mode = %mode, cache = ?caches.mode(), "Broker context ready");
        Ok(Self {
            config,
            mode,
            hub,
            caches,
            conversations,
            event_bus: OnceCell::new(),
            shutdown: CancellationToken::new(),
            flushers: Mutex::new(Vec::new()),
        })
    }

    /// 全部使用进程内后端与默认时序
    pub fn in_memory() -> Self {
        let config = AppConfig::default();
        Self {
            mode: PubSubMode::InMemory,
            hub: Arc::new(PubSubHub::in_memory()),
            caches: Arc::new(CacheFactory::in_memory()),
            conversations: Arc::new(ConversationManager::new(config.conversation.release_delay())),
            event_bus: OnceCell::new(),
            shutdown: CancellationToken::new(),
            flushers: Mutex::new(Vec::new()),
            config,
        }
    }

    /// 挂到进程级关闭 token 下：父级取消时本上下文的后台任务一并停止
    pub fn with_shutdown_token(mut self, parent: &CancellationToken) -> Self {
        self.shutdown = parent.child_token();
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn mode(&self) -> PubSubMode {
        self.mode
    }

    pub fn hub(&self) -> &Arc<PubSubHub> {
        &self.hub
    }

    pub fn caches(&self) -> &Arc<CacheFactory> {
        &self.caches
    }

    pub fn conversations(&self) -> &Arc<ConversationManager> {
        &self.conversations
    }

    /// 首次调用时创建 EventBus，之后返回同一实例
    pub async fn event_bus(&self) -> Result<Arc<EventBus>> {
        let bus = self
            .event_bus
            .get_or_try_init(|| async { EventBus::new(&self.hub, self.mode).await.map(Arc::new) })
            .await?;
        Ok(Arc::clone(bus))
    }

    /// 为某一类对象创建代理，共享本上下文的 Hub 与缓存
    pub fn broker<A: BrokerObject>(&self, kind: ObjectKind) -> ObjectBroker<A> {
        ObjectBroker::new(kind, self.mode, Arc::clone(&self.hub), Arc::clone(&self.caches))
    }

    pub fn admission_queue(&self, store: Arc<dyn WorkRequestStore>) -> AdmissionQueue {
        AdmissionQueue::new(store)
    }

    pub fn memory_admission_queue(&self) -> AdmissionQueue {
        self.admission_queue(Arc::new(MemoryWorkRequestStore::new()))
    }

    /// 按 [admission] 段的 WIP 上限与间隔为 worker 启动队列冲刷
    pub fn spawn_flusher<F, Fut>(&self, queue: &Arc<AdmissionQueue>, worker_id: impl Into<String>, dispatch: F)
    where
        F: Fn(WorkRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let worker_id = worker_id.into();
        let section = &self.config.admission;
        tracing::info!(
            worker_id = %worker_id,
            wip_limit = section.default_wip_limit,
            interval = ?section.flush_interval(),
            "Starting queue flusher"
        );
        let handle = queue.spawn_flusher(
            worker_id,
            section.default_wip_limit,
            section.flush_interval(),
            self.shutdown.child_token(),
            dispatch,
        );
        let mut flushers = self.flushers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        flushers.retain(|h| !h.is_finished());
        flushers.push(handle);
    }

    /// 使用 [transport] 段时序的传输配置
    pub fn transport_config(&self, url: impl Into<String>) -> TransportConfig {
        TransportConfig::from_section(url, &self.config.transport)
    }

    /// 停止冲刷任务，完成所有 Subject、关闭会话并释放缓存后端
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down broker context");
        self.shutdown.cancel();
        let flushers = std::mem::take(&mut *self.flushers.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        for handle in flushers {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Queue flusher ended abnormally");
            }
        }
        self.conversations.close_all().await;
        self.hub.complete_all();
        self.caches.destroy().await;
    }
}
