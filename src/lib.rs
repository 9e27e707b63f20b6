//! Workforce Broker - 编排后端的消息 / 代理底座
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **error**: 错误类型与对外状态码映射
//! - **observability**: tracing 初始化
//! - **shutdown**: 信号监听与有序清理
//! - **pubsub**: Subject（多播、无回放、显式完成）与 PubSubHub
//! - **event_bus**: 对象变更（outbox）事件总线
//! - **cache**: 命名空间化的异步缓存（内存 / Redis）与 SessionCache
//! - **broker**: 活动对象协议、ObjectBroker 与构造器注册表
//! - **channel**: 渠道请求 / 事件模型与 MockChannel
//! - **admission**: 按 WIP 上限准入的工作请求队列
//! - **conversation**: 多方会话（消息、中断、释放）
//! - **transport**: 带 token 握手的自动重连 WebSocket 客户端
//! - **context**: BrokerContext，显式构造、显式关停

pub mod admission;
pub mod broker;
pub mod cache;
pub mod channel;
pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod event_bus;
pub mod observability;
pub mod pubsub;
pub mod shutdown;
pub mod transport;

pub use context::BrokerContext;
pub use error::{BrokerError, Result};
