//! 发布订阅层
//!
//! - **Subject**：命名的多播流（无回放、显式完成），每个订阅者按发布顺序收到消息
//! - **PubSubHub**：按名称记忆 Subject，Subject 完成时自动从注册表移除
//! - **PubSubMode**：后端模式（in-memory / redis / google-pub-sub / kafka）

mod hub;
#[cfg(feature = "redis")]
mod redis;
mod subject;

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::BrokerError;

pub use hub::PubSubHub;
pub use subject::{Subject, Subscription};

/// 系统内使用的 Subject 名称
pub mod subjects {
    pub const CHANNEL_REQUEST: &str = "channel.request";
    pub const CHANNEL_MESSAGE: &str = "channel.message";
    pub const DOCUMENT_REPOSITORY_SEARCH_REQUEST: &str = "document-repository.search.request";
    pub const DOCUMENT_REPOSITORY_SEARCH_RESPONSE: &str = "document-repository.search.response";
    pub const RESOURCE_WRITE: &str = "resource.write";
    pub const RESOURCE_VERSION: &str = "resource.version";
    pub const TASK_EXECUTION_REQUEST: &str = "task.execution.request";
    pub const TASK_EXECUTION_RESPONSE: &str = "task.execution.response";
    pub const WORK_REQUEST: &str = "worker.request";
    pub const WORK_RESPONSE: &str = "worker.response";
    pub const REMOVE_TASK_EXECUTION: &str = "task.execution.remove";
    pub const OUTBOX: &str = "outbox";
}

/// 可经由 Subject 传递的负载：需可克隆（多播）且可序列化（跨进程后端）
pub trait Payload: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Payload for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// 发布订阅后端模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PubSubMode {
    /// 进程内投递
    InMemory,
    /// Redis PUBLISH / SUBSCRIBE
    Redis,
    /// 声明的 Google Pub/Sub 模式，目前在进程内投递
    GooglePubSub,
    /// 声明但未实现，创建 Subject 时直接失败
    Kafka,
}

impl PubSubMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PubSubMode::InMemory => "in-memory",
            PubSubMode::Redis => "redis",
            PubSubMode::GooglePubSub => "google-pub-sub",
            PubSubMode::Kafka => "kafka",
        }
    }
}

impl fmt::Display for PubSubMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PubSubMode {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in-memory" => Ok(PubSubMode::InMemory),
            "redis" => Ok(PubSubMode::Redis),
            "google-pub-sub" => Ok(PubSubMode::GooglePubSub),
            "kafka" => Ok(PubSubMode::Kafka),
            other => Err(BrokerError::UnsupportedMode(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("in-memory".parse::<PubSubMode>().unwrap(), PubSubMode::InMemory);
        assert_eq!("google-pub-sub".parse::<PubSubMode>().unwrap(), PubSubMode::GooglePubSub);
        assert_eq!("kafka".parse::<PubSubMode>().unwrap(), PubSubMode::Kafka);

        let err = "nats".parse::<PubSubMode>().unwrap_err();
        assert!(matches!(err, BrokerError::UnsupportedMode(ref m) if m == "nats"));
    }
}
