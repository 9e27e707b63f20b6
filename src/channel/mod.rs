//! 渠道消息模型
//!
//! MessageRequest 是发往渠道对象的请求，ChannelMessageEvent 是渠道对象的输出事件。

mod mock;

use serde::{Deserialize, Serialize};

use crate::broker::{ObjectEvent, ObjectFactory};

pub use mock::MockChannel;

/// 未声明消息类型时的默认值
pub const DEFAULT_MESSAGE_TYPE: &str = "chat-message";

/// 渠道 subtype
pub const MOCK_SUBTYPE: &str = "mock";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    pub channel_id: String,
    pub worker_id: String,
    pub task_execution_id: String,
    pub sender_id: String,
    pub message_id: String,
    pub message: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl MessageRequest {
    pub fn new(
        channel_id: impl Into<String>,
        worker_id: impl Into<String>,
        task_execution_id: impl Into<String>,
        sender_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            worker_id: worker_id.into(),
            task_execution_id: task_execution_id.into(),
            sender_id: sender_id.into(),
            message_id: uuid::Uuid::new_v4().to_string(),
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            message_type: None,
            image: None,
        }
    }

    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessageEvent {
    pub channel_id: String,
    pub sender_id: String,
    pub message_id: String,
    pub message: String,
    pub users: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl ChannelMessageEvent {
    /// 转换为发往指定 worker 的会话请求
    pub fn to_request(&self, session_id: &str, worker_id: &str) -> MessageRequest {
        MessageRequest {
            channel_id: self.channel_id.clone(),
            worker_id: worker_id.to_string(),
            task_execution_id: session_id.to_string(),
            sender_id: self.sender_id.clone(),
            message_id: self.message_id.clone(),
            message: self.message.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            message_type: None,
            image: self.image.clone(),
        }
    }
}

impl ObjectEvent for ChannelMessageEvent {
    fn session_id(&self) -> Option<&str> {
        self.task_execution_id.as_deref()
    }

    fn sender_id(&self) -> &str {
        &self.sender_id
    }

    fn event_type(&self) -> &str {
        self.message_type.as_deref().unwrap_or(DEFAULT_MESSAGE_TYPE)
    }
}

/// 渠道对象工厂（当前只有 mock 实现）
pub fn channel_factory() -> ObjectFactory<MockChannel> {
    ObjectFactory::new().register(MOCK_SUBTYPE, |config| Ok(MockChannel::from_config(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_defaults_to_chat_message() {
        let event = ChannelMessageEvent {
            channel_id: "ch-1".to_string(),
            sender_id: "user".to_string(),
            message_id: "m-1".to_string(),
            message: "hi".to_string(),
            users: vec![],
            task_execution_id: None,
            message_type: None,
            image: None,
        };
        assert_eq!(event.event_type(), "chat-message");
        assert_eq!(event.session_id(), None);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["channelId"], "ch-1");
        assert!(json.get("taskExecutionId").is_none());
    }
}
