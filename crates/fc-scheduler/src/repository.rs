//! Dispatch job persistence port
//!
//! The poller, block-on-error checker and stale recovery poller never touch a
//! database driver directly - they go through `DispatchJobRepository`. This
//! keeps the scheduler's dispatch logic portable across whatever store a
//! deployment actually uses for dispatch jobs; the workspace ships a SQLite
//! implementation for local development and tests plus an in-memory one for
//! the crate's own unit tests.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};

use crate::{DispatchJob, DispatchMode, DispatchStatus, SchedulerError};

/// Persistence port for dispatch jobs.
#[async_trait]
pub trait DispatchJobRepository: Send + Sync {
    /// Load up to `limit` PENDING jobs whose `scheduled_for` has arrived,
    /// ordered by `(sequence ASC, created_at ASC)`.
    async fn find_pending(&self, limit: usize) -> Result<Vec<DispatchJob>, SchedulerError>;

    /// Among `groups`, return those currently holding a `BLOCK_ON_ERROR` job
    /// in `ERROR` status.
    async fn find_by_group_in_error(
        &self,
        groups: &HashSet<String>,
    ) -> Result<HashSet<String>, SchedulerError>;

    /// Transition a job from `PENDING` to `QUEUED` after a successful publish.
    async fn mark_queued(&self, job_id: &str) -> Result<(), SchedulerError>;

    /// Reset jobs stuck in `QUEUED` past `stale_threshold` back to `PENDING`.
    /// Returns the number of jobs reset.
    async fn mark_stale_reset(&self, stale_threshold: Duration) -> Result<usize, SchedulerError>;

    /// Count jobs currently in `QUEUED` status.
    async fn count_queued(&self) -> Result<u64, SchedulerError>;
}

/// SQLite-backed reference implementation, built on the `sqlx` dependency the
/// embedded queue already pulls in.
pub struct SqliteDispatchJobRepository {
    pool: Pool<Sqlite>,
}

impl SqliteDispatchJobRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), SchedulerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dispatch_jobs (
                id TEXT PRIMARY KEY,
                message_group TEXT,
                dispatch_pool_id TEXT,
                sequence INTEGER NOT NULL DEFAULT 99,
                status TEXT NOT NULL,
                mode TEXT NOT NULL,
                target_url TEXT,
                payload_ref TEXT,
                max_retries INTEGER NOT NULL DEFAULT 0,
                timeout_seconds INTEGER NOT NULL DEFAULT 30,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                scheduled_for INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER,
                queued_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SchedulerError::DatabaseError(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dispatch_jobs_status ON dispatch_jobs (status, scheduled_for, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SchedulerError::DatabaseError(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dispatch_jobs_group ON dispatch_jobs (message_group, status, mode)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SchedulerError::DatabaseError(e.to_string()))?;

        info!("dispatch_jobs schema initialized");
        Ok(())
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<DispatchJob, SchedulerError> {
        let status_str: String = row.get("status");
        let mode_str: String = row.get("mode");
        let created_at_ts: i64 = row.get("created_at");
        let updated_at_ts: Option<i64> = row.get("updated_at");
        let queued_at_ts: Option<i64> = row.get("queued_at");
        let scheduled_for_ts: Option<i64> = row.get("scheduled_for");

        Ok(DispatchJob {
            id: row.get("id"),
            message_group: row.get("message_group"),
            dispatch_pool_id: row.get("dispatch_pool_id"),
            sequence: row.get("sequence"),
            status: DispatchStatus::from(status_str.as_str()),
            mode: DispatchMode::from(mode_str.as_str()),
            target_url: row.get("target_url"),
            payload_ref: row.get("payload_ref"),
            max_retries: row.get("max_retries"),
            timeout_seconds: row.get("timeout_seconds"),
            attempt_count: row.get("attempt_count"),
            last_error: row.get("last_error"),
            scheduled_for: scheduled_for_ts.and_then(timestamp_to_datetime),
            created_at: timestamp_to_datetime(created_at_ts).unwrap_or_else(Utc::now),
            updated_at: updated_at_ts.and_then(timestamp_to_datetime),
            queued_at: queued_at_ts.and_then(timestamp_to_datetime),
        })
    }
}

fn timestamp_to_datetime(ts: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
}

#[async_trait]
impl DispatchJobRepository for SqliteDispatchJobRepository {
    async fn find_pending(&self, limit: usize) -> Result<Vec<DispatchJob>, SchedulerError> {
        let now = Utc::now().timestamp();

        let rows = sqlx::query(
            r#"
            SELECT * FROM dispatch_jobs
            WHERE status = 'PENDING' AND (scheduled_for IS NULL OR scheduled_for <= ?)
            ORDER BY sequence ASC, created_at ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SchedulerError::DatabaseError(e.to_string()))?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn find_by_group_in_error(
        &self,
        groups: &HashSet<String>,
    ) -> Result<HashSet<String>, SchedulerError> {
        if groups.is_empty() {
            return Ok(HashSet::new());
        }

        let placeholders = groups.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT DISTINCT message_group FROM dispatch_jobs WHERE status = 'ERROR' AND mode = 'BLOCK_ON_ERROR' AND message_group IN ({})",
            placeholders
        );

        let mut query = sqlx::query(&sql);
        for group in groups {
            query = query.bind(group);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SchedulerError::DatabaseError(e.to_string()))?;

        Ok(rows
            .iter()
            .filter_map(|row| row.get::<Option<String>, _>("message_group"))
            .collect())
    }

    async fn mark_queued(&self, job_id: &str) -> Result<(), SchedulerError> {
        let now = Utc::now().timestamp();
        sqlx::query(
            "UPDATE dispatch_jobs SET status = 'QUEUED', queued_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| SchedulerError::DatabaseError(e.to_string()))?;

        debug!(job_id = %job_id, "Job marked QUEUED");
        Ok(())
    }

    async fn mark_stale_reset(&self, stale_threshold: Duration) -> Result<usize, SchedulerError> {
        let threshold_ts = Utc::now().timestamp() - stale_threshold.as_secs() as i64;

        let result = sqlx::query(
            r#"
            UPDATE dispatch_jobs
            SET status = 'PENDING', queued_at = NULL, updated_at = ?
            WHERE status = 'QUEUED' AND queued_at < ?
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(threshold_ts)
        .execute(&self.pool)
        .await
        .map_err(|e| SchedulerError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected() as usize)
    }

    async fn count_queued(&self) -> Result<u64, SchedulerError> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM dispatch_jobs WHERE status = 'QUEUED'")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SchedulerError::DatabaseError(e.to_string()))?;

        Ok(row.get::<i64, _>("count") as u64)
    }
}

/// In-memory reference implementation used by the crate's own unit tests.
#[derive(Default)]
pub struct InMemoryDispatchJobRepository {
    jobs: RwLock<HashMap<String, DispatchJob>>,
}

impl InMemoryDispatchJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a job directly, bypassing the repository port (test helper).
    pub fn seed(&self, job: DispatchJob) {
        self.jobs.write().insert(job.id.clone(), job);
    }

    /// Fetch a job directly, bypassing the repository port (test helper).
    pub fn get(&self, job_id: &str) -> Option<DispatchJob> {
        self.jobs.read().get(job_id).cloned()
    }
}

#[async_trait]
impl DispatchJobRepository for InMemoryDispatchJobRepository {
    async fn find_pending(&self, limit: usize) -> Result<Vec<DispatchJob>, SchedulerError> {
        let now = Utc::now();
        let mut pending: Vec<DispatchJob> = self
            .jobs
            .read()
            .values()
            .filter(|j| {
                j.status == DispatchStatus::Pending
                    && j.scheduled_for.map(|s| s <= now).unwrap_or(true)
            })
            .cloned()
            .collect();

        pending.sort_by_key(|j| (j.sequence, j.created_at));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn find_by_group_in_error(
        &self,
        groups: &HashSet<String>,
    ) -> Result<HashSet<String>, SchedulerError> {
        if groups.is_empty() {
            return Ok(HashSet::new());
        }

        let blocked = self
            .jobs
            .read()
            .values()
            .filter(|j| j.status == DispatchStatus::Error && j.mode == DispatchMode::BlockOnError)
            .filter_map(|j| j.message_group.clone())
            .filter(|g| groups.contains(g))
            .collect();

        Ok(blocked)
    }

    async fn mark_queued(&self, job_id: &str) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.write();
        if let Some(job) = jobs.get_mut(job_id) {
            job.status = DispatchStatus::Queued;
            job.queued_at = Some(Utc::now());
            job.updated_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_stale_reset(&self, stale_threshold: Duration) -> Result<usize, SchedulerError> {
        let threshold = Utc::now() - chrono::Duration::from_std(stale_threshold)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));

        let mut jobs = self.jobs.write();
        let mut count = 0;
        for job in jobs.values_mut() {
            if job.status == DispatchStatus::Queued
                && job.queued_at.map(|q| q < threshold).unwrap_or(false)
            {
                job.status = DispatchStatus::Pending;
                job.queued_at = None;
                job.updated_at = Some(Utc::now());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn count_queued(&self) -> Result<u64, SchedulerError> {
        Ok(self
            .jobs
            .read()
            .values()
            .filter(|j| j.status == DispatchStatus::Queued)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DispatchJob;

    fn sample_job(id: &str, group: &str, mode: DispatchMode) -> DispatchJob {
        sample_job_with_sequence(id, group, mode, 99)
    }

    fn sample_job_with_sequence(id: &str, group: &str, mode: DispatchMode, sequence: i32) -> DispatchJob {
        DispatchJob {
            id: id.to_string(),
            message_group: Some(group.to_string()),
            dispatch_pool_id: None,
            sequence,
            status: DispatchStatus::Pending,
            mode,
            target_url: None,
            payload_ref: None,
            max_retries: 0,
            timeout_seconds: 30,
            attempt_count: 0,
            last_error: None,
            scheduled_for: None,
            created_at: Utc::now(),
            updated_at: None,
            queued_at: None,
        }
    }

    #[tokio::test]
    async fn in_memory_finds_pending_and_marks_queued() {
        let repo = InMemoryDispatchJobRepository::new();
        repo.seed(sample_job("job-1", "group-a", DispatchMode::Immediate));

        let pending = repo.find_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);

        repo.mark_queued("job-1").await.unwrap();
        let pending = repo.find_pending(10).await.unwrap();
        assert!(pending.is_empty());
        assert_eq!(repo.count_queued().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn in_memory_orders_pending_by_sequence_then_created_at() {
        let repo = InMemoryDispatchJobRepository::new();

        // Seeded out of order; lower sequence must win regardless of insertion
        // or created_at order, and created_at breaks ties within a sequence.
        let mut low_seq_older = sample_job_with_sequence("job-b", "group-a", DispatchMode::Immediate, 1);
        low_seq_older.created_at = Utc::now() - chrono::Duration::seconds(10);
        let mut low_seq_newer = sample_job_with_sequence("job-c", "group-a", DispatchMode::Immediate, 1);
        low_seq_newer.created_at = Utc::now();
        let high_seq = sample_job_with_sequence("job-a", "group-a", DispatchMode::Immediate, 99);

        repo.seed(high_seq);
        repo.seed(low_seq_newer.clone());
        repo.seed(low_seq_older.clone());

        let pending = repo.find_pending(10).await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["job-b", "job-c", "job-a"]);
    }

    #[tokio::test]
    async fn in_memory_flags_block_on_error_groups() {
        let repo = InMemoryDispatchJobRepository::new();
        let mut errored = sample_job("job-err", "group-a", DispatchMode::BlockOnError);
        errored.status = DispatchStatus::Error;
        repo.seed(errored);

        let groups: HashSet<String> = ["group-a".to_string(), "group-b".to_string()].into();
        let blocked = repo.find_by_group_in_error(&groups).await.unwrap();
        assert!(blocked.contains("group-a"));
        assert!(!blocked.contains("group-b"));
    }

    #[tokio::test]
    async fn in_memory_resets_stale_queued_jobs() {
        let repo = InMemoryDispatchJobRepository::new();
        let mut job = sample_job("job-stale", "group-a", DispatchMode::Immediate);
        job.status = DispatchStatus::Queued;
        job.queued_at = Some(Utc::now() - chrono::Duration::hours(1));
        repo.seed(job);

        let reset = repo.mark_stale_reset(Duration::from_secs(60)).await.unwrap();
        assert_eq!(reset, 1);
        assert_eq!(repo.get("job-stale").unwrap().status, DispatchStatus::Pending);
    }
}
