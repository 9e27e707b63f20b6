//! EventBus：对象变更通知（outbox）
//!
//! 写入主存储的代码只需 `next(OutboxEvent)`，下游反应（缓存失效、销毁活动对象等）通过订阅完成，
//! 订阅者之间、订阅者与发布者之间的错误互不影响。

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::pubsub::{subjects, PubSubHub, PubSubMode, Subject, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxEventType {
    Update,
    Delete,
}

/// 一条对象变更事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub object_type: String,
    pub object_id: String,
    pub event_type: OutboxEventType,
}

impl OutboxEvent {
    pub fn update(object_type: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self::new(object_type, object_id, OutboxEventType::Update)
    }

    pub fn delete(object_type: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self::new(object_type, object_id, OutboxEventType::Delete)
    }

    fn new(object_type: impl Into<String>, object_id: impl Into<String>, event_type: OutboxEventType) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            object_type: object_type.into(),
            object_id: object_id.into(),
            event_type,
        }
    }
}

pub struct EventBus {
    subject: Subject<OutboxEvent>,
}

impl EventBus {
    pub async fn new(hub: &PubSubHub, mode: PubSubMode) -> Result<Self> {
        let subject = hub.create_subject(subjects::OUTBOX, mode).await?;
        Ok(Self { subject })
    }

    pub async fn next(&self, event: OutboxEvent) -> Result<()> {
        tracing::debug!(
            object_type = %event.object_type,
            object_id = %event.object_id,
            event_type = ?event.event_type,
            "Publishing outbox event"
        );
        self.subject.next(event).await
    }

    /// 订阅变更事件；回调失败只记录日志
    pub fn subscribe<F, Fut>(&self, callback: F) -> Subscription
    where
        F: Fn(OutboxEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        tracing::info!("Subscribing to outbox");
        let callback = Arc::new(callback);
        self.subject.subscribe(move |event: OutboxEvent| {
            tracing::debug!(event_id = %event.event_id, object_id = %event.object_id, "Received outbox event");
            let callback = Arc::clone(&callback);
            async move { callback(event).await }
        })
    }

    pub fn subject(&self) -> &Subject<OutboxEvent> {
        &self.subject
    }
}
