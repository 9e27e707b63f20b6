//! 准入队列：每个 worker 一条按创建时间排序的 FIFO 队列，以 WIP 上限作为背压闸门
//!
//! in-progress 计数查询失败时按 0 处理（失败开放），后端故障期间可能过量准入。

#[cfg(feature = "async-sqlite")]
mod sqlite;
mod store;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteWorkRequestStore;
pub use store::{MemoryWorkRequestStore, WorkRequest, WorkRequestStore, WorkStatus};

pub struct AdmissionQueue {
    store: Arc<dyn WorkRequestStore>,
}

impl AdmissionQueue {
    pub fn new(store: Arc<dyn WorkRequestStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn WorkRequestStore> {
        &self.store
    }

    /// 入队一条请求
    pub async fn enqueue(&self, request: WorkRequest) -> Result<()> {
        tracing::debug!(worker_id = %request.worker_id, task_execution_id = %request.task_execution_id, "Enqueue work request");
        self.store.insert(request).await
    }

    /// 该 worker 最早的 queued 请求
    pub async fn get_next(&self, worker_id: &str) -> Result<Option<WorkRequest>> {
        self.store.oldest_with_status(worker_id, WorkStatus::Queued).await
    }

    /// in-progress 数量严格小于 wip_limit 时可用；计数失败按 0 处理
    pub async fn is_available(&self, worker_id: &str, wip_limit: usize) -> bool {
        let wip = match self.in_progress_count(worker_id).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(worker_id = %worker_id, error = %e, "In-progress count failed, treating as 0");
                0
            }
        };
        wip < wip_limit
    }

    pub async fn in_progress_count(&self, worker_id: &str) -> Result<usize> {
        self.store.count_with_status(worker_id, WorkStatus::InProgress).await
    }

    pub async fn queued_count(&self, worker_id: &str) -> Result<usize> {
        self.store.count_with_status(worker_id, WorkStatus::Queued).await
    }

    /// 可用度：低于容量时为剩余容量，否则按排队数量继续扣减
    pub async fn availability(&self, worker_id: &str, capacity: usize) -> Result<f64> {
        let capacity = capacity.max(1) as f64;
        let wip = self.in_progress_count(worker_id).await? as f64;
        if wip < capacity {
            return Ok(capacity - wip);
        }
        let queued = self.queued_count(worker_id).await? as f64;
        Ok(capacity - wip - queued * (1.0 / capacity))
    }

    /// 在 (worker_id, capacity) 候选中选出可用度最高的一个（相同时取先出现者）
    pub async fn best_available<'a>(&self, candidates: &'a [(String, usize)]) -> Result<Option<&'a str>> {
        let mut best: Option<(&str, f64)> = None;
        for (worker_id, capacity) in candidates {
            let score = self.availability(worker_id, *capacity).await?;
            if best.map_or(true, |(_, current)| score > current) {
                best = Some((worker_id.as_str(), score));
            }
        }
        Ok(best.map(|(id, _)| id))
    }

    /// 冲刷队列：可用时依次取出最早的请求、标记为 in-progress 并派发
    ///
    /// 队列为空、遇到非 queued 状态或同一任务执行在本轮已处理过时停止；
    /// 缺少请求体或派发失败的请求标记为 error。返回派发成功的数量。
    pub async fn flush<F, Fut>(&self, worker_id: &str, wip_limit: usize, mut dispatch: F) -> Result<usize>
    where
        F: FnMut(WorkRequest) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let mut processed: HashSet<String> = HashSet::new();
        let mut dispatched = 0;

        while self.is_available(worker_id, wip_limit).await {
            let Some(request) = self.get_next(worker_id).await? else {
                break;
            };
            if request.status != WorkStatus::Queued || processed.contains(&request.task_execution_id) {
                break;
            }
            processed.insert(request.task_execution_id.clone());

            if request.payload.is_none() {
                tracing::warn!(worker_id = %worker_id, request_id = %request.id, "Work request has no payload");
                self.store.set_status(&request.id, WorkStatus::Error).await?;
                continue;
            }

            tracing::debug!(
                worker_id = %worker_id,
                task_execution_id = %request.task_execution_id,
                "Dispatching work request"
            );
            self.store.set_status(&request.id, WorkStatus::InProgress).await?;
            let request_id = request.id.clone();
            match dispatch(request).await {
                Ok(()) => dispatched += 1,
                Err(e) => {
                    tracing::error!(worker_id = %worker_id, request_id = %request_id, error = %e, "Dispatch failed");
                    self.store.set_status(&request_id, WorkStatus::Error).await?;
                }
            }
        }
        Ok(dispatched)
    }

    /// 周期性冲刷，直到 shutdown 被取消
    pub fn spawn_flusher<F, Fut>(
        self: &Arc<Self>,
        worker_id: String,
        wip_limit: usize,
        interval: Duration,
        shutdown: CancellationToken,
        dispatch: F,
    ) -> JoinHandle<()>
    where
        F: Fn(WorkRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = queue.flush(&worker_id, wip_limit, &dispatch).await {
                            tracing::error!(worker_id = %worker_id, error = %e, "Error flushing queue");
                        }
                    }
                }
            }
            tracing::debug!(worker_id = %worker_id, "Queue flusher stopped");
        })
    }
}
