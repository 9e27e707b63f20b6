//! MockChannel：按脚本回复的渠道，供端到端测试使用
//!
//! 变量：
//! - `endCount`：第几条（或其前一条）回复为最终消息，默认 0
//! - `messages`：依次回复的脚本消息，用完后回复一次最终消息
//! - `finalMessage`：最终消息文本，默认 `mock-final-message`

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ChannelMessageEvent, MessageRequest};
use crate::broker::{BrokerObject, ObjectConfig, ObjectContext};
use crate::cache::CHANNEL_CACHES;

const DEFAULT_FINAL_MESSAGE: &str = "mock-final-message";
const DEFAULT_EMIT_DELAY: Duration = Duration::from_millis(100);

pub struct MockChannel {
    id: String,
    end_count: usize,
    messages: Option<Vec<String>>,
    final_message: String,
    emit_delay: Duration,
    count: Mutex<usize>,
}

impl MockChannel {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            end_count: 0,
            messages: None,
            final_message: DEFAULT_FINAL_MESSAGE.to_string(),
            emit_delay: DEFAULT_EMIT_DELAY,
            count: Mutex::new(0),
        }
    }

    pub fn from_config(config: &ObjectConfig) -> Self {
        let mut channel = Self::new(config.id.clone());
        if let Some(end_count) = config.variable("endCount").and_then(|v| v.as_u64()) {
            channel.end_count = end_count as usize;
        }
        if let Some(messages) = config.variable("messages").and_then(|v| v.as_array()) {
            channel.messages = Some(
                messages
                    .iter()
                    .filter_map(|m| m.as_str().map(str::to_string))
                    .collect(),
            );
        }
        if let Some(final_message) = config
            .variable("finalMessage")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
        {
            channel.final_message = final_message.to_string();
        }
        channel
    }

    pub fn with_end_count(mut self, end_count: usize) -> Self {
        self.end_count = end_count;
        self
    }

    pub fn with_messages(mut self, messages: Vec<String>) -> Self {
        self.messages = Some(messages);
        self
    }

    pub fn with_emit_delay(mut self, delay: Duration) -> Self {
        self.emit_delay = delay;
        self
    }

    /// 决定第 n 条回复的文本；None 表示不再回复
    fn reply_for(&self, count: usize) -> Option<String> {
        match &self.messages {
            Some(messages) if count < messages.len() => return Some(messages[count].clone()),
            Some(messages) if count == messages.len() => return Some(self.final_message.clone()),
            _ => {}
        }
        if count > self.end_count {
            return None;
        }
        if count == self.end_count || count + 1 == self.end_count {
            return Some(self.final_message.clone());
        }
        Some(format!("mock-message-{}", count))
    }
}

#[async_trait]
impl BrokerObject for MockChannel {
    type Request = MessageRequest;
    type Event = ChannelMessageEvent;

    const CACHE_NAMES: &'static [&'static str] = CHANNEL_CACHES;

    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, request: MessageRequest, ctx: ObjectContext<ChannelMessageEvent>) -> anyhow::Result<()> {
        tracing::debug!(channel_id = %self.id, message_id = %request.message_id, "Mock channel received message");
        if request.sender_id == self.id {
            return Ok(());
        }

        let reply = {
            let mut count = self.count.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let Some(reply) = self.reply_for(*count) else {
                return Ok(());
            };
            *count += 1;
            reply
        };

        let event = ChannelMessageEvent {
            channel_id: self.id.clone(),
            sender_id: self.id.clone(),
            message_id: request.message_id,
            message: reply,
            users: vec![request.sender_id],
            task_execution_id: Some(request.task_execution_id),
            message_type: request.message_type,
            image: None,
        };

        let emitter = ctx.emitter.clone();
        let delay = self.emit_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = emitter.emit(event).await {
                tracing::warn!(error = %e, "Mock channel failed to emit reply");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_replies_once_with_final_message() {
        let channel = MockChannel::new("ch-1");
        assert_eq!(channel.reply_for(0).as_deref(), Some("mock-final-message"));
        assert_eq!(channel.reply_for(1), None);
    }

    #[test]
    fn test_end_count_and_script() {
        let channel = MockChannel::new("ch-1").with_end_count(3);
        assert_eq!(channel.reply_for(0).as_deref(), Some("mock-message-0"));
        assert_eq!(channel.reply_for(1).as_deref(), Some("mock-message-1"));
        assert_eq!(channel.reply_for(2).as_deref(), Some("mock-final-message"));
        assert_eq!(channel.reply_for(3).as_deref(), Some("mock-final-message"));
        assert_eq!(channel.reply_for(4), None);

        let scripted = MockChannel::new("ch-1").with_messages(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(scripted.reply_for(0).as_deref(), Some("a"));
        assert_eq!(scripted.reply_for(1).as_deref(), Some("b"));
        assert_eq!(scripted.reply_for(2).as_deref(), Some("mock-final-message"));
        assert_eq!(scripted.reply_for(3), None);
    }

    #[test]
    fn test_from_config_reads_variables() {
        let config = ObjectConfig::new("ch-9", crate::broker::ObjectKind::Channel, "mock").with_variables(
            serde_json::json!({"endCount": 2, "finalMessage": "done", "messages": ["one"]}),
        );
        let channel = MockChannel::from_config(&config);
        assert_eq!(channel.id(), "ch-9");
        assert_eq!(channel.end_count, 2);
        assert_eq!(channel.reply_for(1).as_deref(), Some("done"));
    }
}
