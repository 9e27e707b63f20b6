//! 工作请求存储接口与内存实现

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{BrokerError, Result};

/// 工作请求状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkStatus {
    Queued,
    InProgress,
    Complete,
    Error,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Queued => "queued",
            WorkStatus::InProgress => "in-progress",
            WorkStatus::Complete => "complete",
            WorkStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(WorkStatus::Queued),
            "in-progress" => Some(WorkStatus::InProgress),
            "complete" => Some(WorkStatus::Complete),
            "error" => Some(WorkStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 工作请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRequest {
    pub id: String,
    pub worker_id: String,
    pub task_execution_id: String,
    pub status: WorkStatus,
    /// 派发给对象的请求体；缺失的请求在冲刷时被标记为 error
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
}

impl WorkRequest {
    pub fn new(worker_id: impl Into<String>, task_execution_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            worker_id: worker_id.into(),
            task_execution_id: task_execution_id.into(),
            status: WorkStatus::Queued,
            payload: Some(payload),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 工作请求的持久化端口
#[async_trait]
pub trait WorkRequestStore: Send + Sync {
    async fn insert(&self, request: WorkRequest) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<WorkRequest>>;

    /// 指定 worker、指定状态中创建时间最早的请求
    async fn oldest_with_status(&self, worker_id: &str, status: WorkStatus) -> Result<Option<WorkRequest>>;

    async fn count_with_status(&self, worker_id: &str, status: WorkStatus) -> Result<usize>;

    /// 更新状态；请求不存在返回 NotFound
    async fn set_status(&self, id: &str, status: WorkStatus) -> Result<()>;
}

/// 内存工作请求存储
#[derive(Default)]
pub struct MemoryWorkRequestStore {
    requests: RwLock<HashMap<String, WorkRequest>>,
}

impl MemoryWorkRequestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkRequestStore for MemoryWorkRequestStore {
    async fn insert(&self, request: WorkRequest) -> Result<()> {
        self.requests.write().await.insert(request.id.clone(), request);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<WorkRequest>> {
        Ok(self.requests.read().await.get(id).cloned())
    }

    async fn oldest_with_status(&self, worker_id: &str, status: WorkStatus) -> Result<Option<WorkRequest>> {
        let requests = self.requests.read().await;
        Ok(requests
            .values()
            .filter(|r| r.worker_id == worker_id && r.status == status)
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .cloned())
    }

    async fn count_with_status(&self, worker_id: &str, status: WorkStatus) -> Result<usize> {
        let requests = self.requests.read().await;
        Ok(requests
            .values()
            .filter(|r| r.worker_id == worker_id && r.status == status)
            .count())
    }

    async fn set_status(&self, id: &str, status: WorkStatus) -> Result<()> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(id)
            .ok_or_else(|| BrokerError::not_found("work request", id))?;
        request.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        assert_eq!(serde_json::to_string(&WorkStatus::InProgress).unwrap(), "\"in-progress\"");
        assert_eq!(WorkStatus::parse("in-progress"), Some(WorkStatus::InProgress));
        assert_eq!(WorkStatus::parse("running"), None);
    }

    #[tokio::test]
    async fn test_set_status_on_missing_request() {
        let store = MemoryWorkRequestStore::new();
        let err = store.set_status("nope", WorkStatus::Complete).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
