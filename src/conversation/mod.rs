//! 会话管理：按任务执行 ID 组织的多方消息线程
//!
//! 每个会话有三条相互独立的信号流（消息 / 中断 / 释放）。release 之后会话状态保留一个宽限期，
//! 让慢速消费者有机会观察到释放信号，宽限期结束后才被移除。

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{BrokerError, Result};
use crate::pubsub::{Subject, Subscription};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub task_execution_id: String,
    pub sender_id: String,
    pub message: String,
    pub timestamp: i64,
}

impl ConversationMessage {
    pub fn new(task_execution_id: impl Into<String>, sender_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            task_execution_id: task_execution_id.into(),
            sender_id: sender_id.into(),
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 会话快照
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSnapshot {
    pub task_execution_id: String,
    pub workers: Vec<String>,
    pub messages: Vec<ConversationMessage>,
}

struct Conversation {
    generation: u64,
    workers: Vec<String>,
    messages: Vec<ConversationMessage>,
    message_stream: Subject<ConversationMessage>,
    interrupt_stream: Subject<bool>,
    release_stream: Subject<bool>,
    /// listener_id -> 该参与者持有的订阅
    listeners: HashMap<String, Vec<Subscription>>,
}

impl Conversation {
    fn new(task_execution_id: &str, generation: u64) -> Self {
        Self {
            generation,
            workers: Vec::new(),
            messages: Vec::new(),
            message_stream: Subject::local(format!("conversation.{}.messages", task_execution_id)),
            interrupt_stream: Subject::local(format!("conversation.{}.interrupt", task_execution_id)),
            release_stream: Subject::local(format!("conversation.{}.release", task_execution_id)),
            listeners: HashMap::new(),
        }
    }

    fn close(&self) {
        self.message_stream.complete();
        self.interrupt_stream.complete();
        self.release_stream.complete();
    }
}

type ConversationMap = Arc<RwLock<HashMap<String, Conversation>>>;

/// 会话管理器
pub struct ConversationManager {
    conversations: ConversationMap,
    release_delay: Duration,
    next_generation: AtomicU64,
}

impl ConversationManager {
    pub fn new(release_delay: Duration) -> Self {
        Self {
            conversations: Arc::new(RwLock::new(HashMap::new())),
            release_delay,
            next_generation: AtomicU64::new(0),
        }
    }

    /// 创建（或重建）会话；已有的同名会话会被完成并替换
    pub async fn set_conversation(&self, task_execution_id: &str) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .conversations
            .write()
            .await
            .insert(task_execution_id.to_string(), Conversation::new(task_execution_id, generation));
        if let Some(previous) = previous {
            tracing::warn!(task_execution_id = %task_execution_id, "Replacing existing conversation");
            previous.close();
        }
        tracing::debug!(task_execution_id = %task_execution_id, "Conversation created");
    }

    pub async fn get_conversation(&self, task_execution_id: &str) -> Result<ConversationSnapshot> {
        let conversations = self.conversations.read().await;
        let conversation = conversations
            .get(task_execution_id)
            .ok_or_else(|| not_found(task_execution_id))?;
        Ok(ConversationSnapshot {
            task_execution_id: task_execution_id.to_string(),
            workers: conversation.workers.clone(),
            messages: conversation.messages.clone(),
        })
    }

    pub async fn contains(&self, task_execution_id: &str) -> bool {
        self.conversations.read().await.contains_key(task_execution_id)
    }

    pub async fn join(&self, task_execution_id: &str, worker_id: &str) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(task_execution_id)
            .ok_or_else(|| not_found(task_execution_id))?;
        if !conversation.workers.iter().any(|w| w == worker_id) {
            conversation.workers.push(worker_id.to_string());
        }
        tracing::debug!(task_execution_id = %task_execution_id, worker_id = %worker_id, "Worker joined conversation");
        Ok(())
    }

    /// 离开会话，并撤销该参与者的全部订阅（已投递的消息不受影响）
    pub async fn leave(&self, task_execution_id: &str, worker_id: &str) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(task_execution_id)
            .ok_or_else(|| not_found(task_execution_id))?;
        conversation.workers.retain(|w| w != worker_id);
        if let Some(subscriptions) = conversation.listeners.remove(worker_id) {
            for subscription in subscriptions {
                subscription.unsubscribe();
            }
        }
        tracing::debug!(task_execution_id = %task_execution_id, worker_id = %worker_id, "Worker left conversation");
        Ok(())
    }

    pub async fn listen<F, Fut>(&self, task_execution_id: &str, listener_id: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(ConversationMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.attach(task_execution_id, listener_id, |c| c.message_stream.subscribe(callback))
            .await
    }

    pub async fn listen_for_interrupt<F, Fut>(
        &self,
        task_execution_id: &str,
        listener_id: &str,
        callback: F,
    ) -> Result<Subscription>
    where
        F: Fn(bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.attach(task_execution_id, listener_id, |c| c.interrupt_stream.subscribe(callback))
            .await
    }

    pub async fn listen_for_release<F, Fut>(
        &self,
        task_execution_id: &str,
        listener_id: &str,
        callback: F,
    ) -> Result<Subscription>
    where
        F: Fn(bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.attach(task_execution_id, listener_id, |c| c.release_stream.subscribe(callback))
            .await
    }

    async fn attach(
        &self,
        task_execution_id: &str,
        listener_id: &str,
        subscribe: impl FnOnce(&Conversation) -> Subscription,
    ) -> Result<Subscription> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(task_execution_id)
            .ok_or_else(|| not_found(task_execution_id))?;
        let subscription = subscribe(conversation);
        conversation
            .listeners
            .entry(listener_id.to_string())
            .or_default()
            .push(subscription.clone());
        Ok(subscription)
    }

    /// 追加消息并广播给当前所有监听者
    pub async fn send_message(&self, message: ConversationMessage) -> Result<()> {
        let stream = {
            let mut conversations = self.conversations.write().await;
            let conversation = conversations
                .get_mut(&message.task_execution_id)
                .ok_or_else(|| not_found(&message.task_execution_id))?;
            conversation.messages.push(message.clone());
            conversation.message_stream.clone()
        };
        stream.next(message).await
    }

    /// 协作式中断信号（不强制终止）
    pub async fn interrupt(&self, task_execution_id: &str) -> Result<()> {
        let stream = {
            let conversations = self.conversations.read().await;
            conversations
                .get(task_execution_id)
                .map(|c| c.interrupt_stream.clone())
                .ok_or_else(|| not_found(task_execution_id))?
        };
        tracing::info!(task_execution_id = %task_execution_id, "Conversation interrupted");
        stream.next(true).await
    }

    /// 广播释放信号，并在宽限期后移除会话；会话不存在时为空操作
    pub async fn release(&self, task_execution_id: &str) -> Result<()> {
        let (generation, stream) = {
            let conversations = self.conversations.read().await;
            match conversations.get(task_execution_id) {
                Some(c) => (c.generation, c.release_stream.clone()),
                None => return Ok(()),
            }
        };
        stream.next(true).await?;

        let conversations = Arc::clone(&self.conversations);
        let delay = self.release_delay;
        let key = task_execution_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut conversations = conversations.write().await;
            if conversations.get(&key).map(|c| c.generation) == Some(generation) {
                if let Some(conversation) = conversations.remove(&key) {
                    conversation.close();
                    tracing::debug!(task_execution_id = %key, "Released conversation removed");
                }
            }
        });
        tracing::info!(task_execution_id = %task_execution_id, delay_secs = delay.as_secs(), "Conversation released");
        Ok(())
    }

    /// 关停时完成并移除所有会话
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.conversations.write().await.drain().collect();
        for (_, conversation) in &drained {
            conversation.close();
        }
        tracing::info!(count = drained.len(), "Closed all conversations");
    }

    pub async fn len(&self) -> usize {
        self.conversations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn not_found(task_execution_id: &str) -> BrokerError {
    BrokerError::not_found("conversation", task_execution_id)
}
