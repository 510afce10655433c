//! FlowCatalyst Dispatch Scheduler
//!
//! This crate provides the dispatch scheduler functionality:
//! - PendingJobPoller: Polls for PENDING dispatch jobs
//! - BlockOnErrorChecker: Checks for blocked message groups
//! - GroupDispatcher: Serializes dispatch per message group under a global cap
//! - JobDispatcher: Dispatches a single job to the message queue
//! - StaleQueuedJobPoller: Recovers jobs stuck in QUEUED status
//!
//! Persistence goes through the `DispatchJobRepository` port (see
//! `repository.rs`) rather than a specific database driver.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{error, info, warn};

pub mod auth;
pub mod dispatcher;
pub mod group_dispatcher;
pub mod poller;
pub mod repository;
pub mod stale_recovery;

pub use auth::{AuthError, DispatchAuthService};
pub use dispatcher::JobDispatcher;
pub use group_dispatcher::GroupDispatcher;
pub use poller::PendingJobPoller;
pub use repository::{DispatchJobRepository, InMemoryDispatchJobRepository, SqliteDispatchJobRepository};
pub use stale_recovery::StaleQueuedJobPoller;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Queue error: {0}")]
    QueueError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchMode {
    Immediate,
    NextOnError,
    BlockOnError,
}

impl Default for DispatchMode {
    fn default() -> Self { Self::Immediate }
}

impl From<&str> for DispatchMode {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "NEXT_ON_ERROR" => Self::NextOnError,
            "BLOCK_ON_ERROR" => Self::BlockOnError,
            _ => Self::Immediate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchStatus {
    Pending,
    Queued,
    InProgress,
    Completed,
    Error,
    Cancelled,
}

impl From<&str> for DispatchStatus {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "QUEUED" => Self::Queued,
            "IN_PROGRESS" => Self::InProgress,
            "COMPLETED" => Self::Completed,
            "ERROR" => Self::Error,
            "CANCELLED" => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

/// A persisted dispatch job, materialized into a `MessagePointer` on the broker.
///
/// Status transitions: `PENDING -> QUEUED -> IN_PROGRESS -> COMPLETED`; from
/// `IN_PROGRESS` either `ERROR` (terminal once retries are exhausted) or back
/// to `QUEUED` (retry). `CANCELLED` is reachable from any non-terminal state.
/// This crate only drives the `PENDING -> QUEUED` and `QUEUED -> PENDING`
/// (stale reset) edges; the rest belong to whatever processes the resulting
/// pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchJob {
    pub id: String,
    pub message_group: Option<String>,
    pub dispatch_pool_id: Option<String>,
    /// Smaller sorts first; default 99.
    pub sequence: i32,
    pub status: DispatchStatus,
    pub mode: DispatchMode,
    pub target_url: Option<String>,
    pub payload_ref: Option<String>,
    pub max_retries: i32,
    pub timeout_seconds: i32,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub queued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub stale_threshold: Duration,
    pub default_dispatch_mode: DispatchMode,
    pub default_pool_code: String,
    pub processing_endpoint: String,
    /// App key for HMAC auth token generation
    pub app_key: Option<String>,
    /// Global cap on in-flight dispatches across all message groups
    pub max_concurrent_dispatches: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
            stale_threshold: Duration::from_secs(15 * 60),
            default_dispatch_mode: DispatchMode::Immediate,
            default_pool_code: "default".to_string(),
            processing_endpoint: "http://localhost:8080/api/router/process".to_string(),
            max_concurrent_dispatches: 20,
            app_key: None,
        }
    }
}

/// Checks whether a message group currently holds a `BLOCK_ON_ERROR` job in
/// `ERROR` state, in which case the entire group is skipped this cycle.
pub struct BlockOnErrorChecker {
    repository: Arc<dyn DispatchJobRepository>,
}

impl BlockOnErrorChecker {
    pub fn new(repository: Arc<dyn DispatchJobRepository>) -> Self {
        Self { repository }
    }

    pub async fn get_blocked_groups(&self, groups: &HashSet<String>) -> Result<HashSet<String>, SchedulerError> {
        self.repository.find_by_group_in_error(groups).await
    }
}

#[async_trait::async_trait]
pub trait QueuePublisher: Send + Sync {
    async fn publish(&self, message: QueueMessage) -> Result<(), SchedulerError>;
    fn is_healthy(&self) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub message_group: Option<String>,
    pub deduplication_id: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePointer {
    pub job_id: String,
    pub dispatch_pool_id: String,
    pub auth_token: String,
    pub mediation_type: String,
    pub processing_endpoint: String,
    pub message_group: Option<String>,
    pub batch_id: Option<String>,
}

pub struct DispatchScheduler {
    config: SchedulerConfig,
    poller: PendingJobPoller,
    stale_poller: StaleQueuedJobPoller,
    running: Arc<RwLock<bool>>,
}

impl DispatchScheduler {
    pub fn new(
        config: SchedulerConfig,
        repository: Arc<dyn DispatchJobRepository>,
        queue_publisher: Arc<dyn QueuePublisher>,
    ) -> Self {
        let auth_service = DispatchAuthService::new(config.app_key.clone());
        let poller = PendingJobPoller::new(config.clone(), repository.clone(), queue_publisher, auth_service);
        let stale_poller = StaleQueuedJobPoller::new(config.clone(), repository);
        Self { config, poller, stale_poller, running: Arc::new(RwLock::new(false)) }
    }

    pub async fn start(&self) {
        if !self.config.enabled {
            info!("Dispatch scheduler is disabled");
            return;
        }

        let mut running = self.running.write().await;
        if *running {
            warn!("Scheduler already running");
            return;
        }
        *running = true;
        drop(running);

        info!(poll_interval_ms = self.config.poll_interval.as_millis(), batch_size = self.config.batch_size, "Starting dispatch scheduler");

        let poller = self.poller.clone();
        let poll_interval = self.config.poll_interval;
        let running_clone = self.running.clone();

        tokio::spawn(async move {
            let mut interval = interval(poll_interval);
            loop {
                interval.tick().await;
                if !*running_clone.read().await { break; }
                if let Err(e) = poller.poll().await {
                    error!(error = %e, "Error in pending job poller");
                }
            }
        });

        let stale_poller = self.stale_poller.clone();
        let running_clone2 = self.running.clone();

        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                if !*running_clone2.read().await { break; }
                if let Err(e) = stale_poller.recover_stale_jobs().await {
                    error!(error = %e, "Error in stale job recovery");
                }
            }
        });
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        info!("Dispatch scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}
