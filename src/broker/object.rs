//! 代理对象契约

use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::SessionCache;
use crate::error::Result;
use crate::pubsub::{Payload, Subject};

/// 对象输出事件：代理据此做会话过滤
pub trait ObjectEvent: Payload {
    /// 所属会话（任务执行 ID）；None 表示不属于任何会话
    fn session_id(&self) -> Option<&str>;

    fn sender_id(&self) -> &str;

    fn event_type(&self) -> &str;
}

/// 可注册到 ObjectBroker 的活动对象
#[async_trait]
pub trait BrokerObject: Send + Sync + 'static {
    type Request: Send + 'static;
    type Event: ObjectEvent;

    /// 对象拥有的命名缓存
    const CACHE_NAMES: &'static [&'static str] = &[];

    fn id(&self) -> &str;

    /// 处理一条请求；输出通过 `ctx.emitter` 发布
    async fn execute(&self, request: Self::Request, ctx: ObjectContext<Self::Event>) -> anyhow::Result<()>;

    /// 释放对象持有的外部资源
    async fn destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 对象输出发布器，可克隆到延迟任务中
pub struct Emitter<E> {
    subject: Subject<E>,
}

impl<E> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Self {
            subject: self.subject.clone(),
        }
    }
}

impl<E: ObjectEvent> Emitter<E> {
    pub(super) fn new(subject: Subject<E>) -> Self {
        Self { subject }
    }

    pub async fn emit(&self, event: E) -> Result<()> {
        self.subject.next(event).await
    }
}

/// execute 调用时交给对象的上下文
pub struct ObjectContext<E> {
    pub object_id: String,
    pub emitter: Emitter<E>,
    pub cache: Arc<SessionCache>,
}

impl<E> Clone for ObjectContext<E> {
    fn clone(&self) -> Self {
        Self {
            object_id: self.object_id.clone(),
            emitter: self.emitter.clone(),
            cache: Arc::clone(&self.cache),
        }
    }
}
