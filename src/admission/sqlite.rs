//! SQLite 工作请求存储（sqlx）

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use super::store::{WorkRequest, WorkRequestStore, WorkStatus};
use crate::error::{BrokerError, Result};

pub struct SqliteWorkRequestStore {
    pool: SqlitePool,
}

impl SqliteWorkRequestStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(3)
            .connect(&db_url)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS work_requests (
                id TEXT PRIMARY KEY,
                worker_id TEXT NOT NULL,
                task_execution_id TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_work_requests_worker_status ON work_requests(worker_id, status)")
            .execute(&pool)
            .await?;

        tracing::info!(path = %db_path.as_ref().display(), "SQLite work request store ready");
        Ok(Self { pool })
    }

    fn from_row(row: &SqliteRow) -> Result<WorkRequest> {
        let status: String = row.get("status");
        let payload: Option<String> = row.get("payload");
        Ok(WorkRequest {
            id: row.get("id"),
            worker_id: row.get("worker_id"),
            task_execution_id: row.get("task_execution_id"),
            status: WorkStatus::parse(&status)
                .ok_or_else(|| BrokerError::Backend(format!("unknown work request status {}", status)))?,
            payload: payload.map(|p| serde_json::from_str(&p)).transpose()?,
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl WorkRequestStore for SqliteWorkRequestStore {
    async fn insert(&self, request: WorkRequest) -> Result<()> {
        let payload = request.payload.as_ref().map(|v| v.to_string());
        sqlx::query(
            "INSERT OR REPLACE INTO work_requests (id, worker_id, task_execution_id, status, payload, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.id)
        .bind(&request.worker_id)
        .bind(&request.task_execution_id)
        .bind(request.status.as_str())
        .bind(payload)
        .bind(request.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<WorkRequest>> {
        let row = sqlx::query(
            "SELECT id, worker_id, task_execution_id, status, payload, created_at FROM work_requests WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn oldest_with_status(&self, worker_id: &str, status: WorkStatus) -> Result<Option<WorkRequest>> {
        let row = sqlx::query(
            "SELECT id, worker_id, task_execution_id, status, payload, created_at
             FROM work_requests
             WHERE worker_id = ? AND status = ?
             ORDER BY created_at ASC, id ASC
             LIMIT 1",
        )
        .bind(worker_id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn count_with_status(&self, worker_id: &str, status: WorkStatus) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM work_requests WHERE worker_id = ? AND status = ?")
            .bind(worker_id)
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    async fn set_status(&self, id: &str, status: WorkStatus) -> Result<()> {
        let result = sqlx::query("UPDATE work_requests SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BrokerError::not_found("work request", id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_store_orders_by_creation() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteWorkRequestStore::new(dir.path().join("work.db")).await.unwrap();

        let mut late = WorkRequest::new("w-1", "te-2", serde_json::json!({"n": 2}));
        late.created_at = 200;
        let mut early = WorkRequest::new("w-1", "te-1", serde_json::json!({"n": 1}));
        early.created_at = 100;
        store.insert(late).await.unwrap();
        store.insert(early.clone()).await.unwrap();

        let next = store.oldest_with_status("w-1", WorkStatus::Queued).await.unwrap().unwrap();
        assert_eq!(next, early);

        store.set_status(&early.id, WorkStatus::InProgress).await.unwrap();
        assert_eq!(store.count_with_status("w-1", WorkStatus::InProgress).await.unwrap(), 1);
        assert_eq!(store.count_with_status("w-1", WorkStatus::Queued).await.unwrap(), 1);
        assert!(store.set_status("missing", WorkStatus::Error).await.unwrap_err().is_not_found());
    }
}
