//! Job dispatcher - builds a `MessagePointer` for a single dispatch job and
//! publishes it to the message queue

use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::auth::DispatchAuthService;
use crate::{DispatchJob, DispatchJobRepository, MessagePointer, QueueMessage, QueuePublisher, SchedulerConfig, SchedulerError};

/// Builds and publishes the `MessagePointer` for a single dispatch job,
/// advancing its status to `QUEUED` on success. Leaves the job `PENDING` on
/// failure so the next poll cycle retries it.
pub struct JobDispatcher {
    config: SchedulerConfig,
    repository: Arc<dyn DispatchJobRepository>,
    queue_publisher: Arc<dyn QueuePublisher>,
    auth_service: DispatchAuthService,
}

impl JobDispatcher {
    pub fn new(
        config: SchedulerConfig,
        repository: Arc<dyn DispatchJobRepository>,
        queue_publisher: Arc<dyn QueuePublisher>,
        auth_service: DispatchAuthService,
    ) -> Self {
        Self {
            config,
            repository,
            queue_publisher,
            auth_service,
        }
    }

    /// Dispatch an already-loaded job to the message queue. Returns `Ok(true)`
    /// on successful publish, `Ok(false)` if the publish itself failed (job
    /// stays `PENDING`).
    pub async fn dispatch_job(&self, job: &DispatchJob) -> Result<bool, SchedulerError> {
        let auth_token = match self.auth_service.generate_auth_token(&job.id) {
            Ok(token) => token,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to generate auth token, using fallback");
                format!("dev_{}", job.id)
            }
        };

        let pointer = MessagePointer {
            job_id: job.id.clone(),
            dispatch_pool_id: job
                .dispatch_pool_id
                .clone()
                .unwrap_or_else(|| self.config.default_pool_code.clone()),
            auth_token,
            mediation_type: "HTTP".to_string(),
            processing_endpoint: self.config.processing_endpoint.clone(),
            message_group: job.message_group.clone(),
            batch_id: None,
        };

        let message = QueueMessage {
            id: job.id.clone(),
            message_group: job.message_group.clone(),
            deduplication_id: job.id.clone(),
            body: serde_json::to_string(&pointer)?,
        };

        metrics::counter!("scheduler.jobs.dispatched_total").increment(1);

        match self.queue_publisher.publish(message).await {
            Ok(_) => {
                self.repository.mark_queued(&job.id).await?;
                debug!(job_id = %job.id, "Job dispatched successfully");
                metrics::counter!("scheduler.jobs.queued_total").increment(1);
                Ok(true)
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to dispatch job");
                metrics::counter!("scheduler.jobs.dispatch_errors_total").increment(1);
                Ok(false)
            }
        }
    }

    /// Check if the queue publisher is healthy
    pub fn is_healthy(&self) -> bool {
        self.queue_publisher.is_healthy()
    }

    /// Check if auth service is configured
    pub fn is_auth_configured(&self) -> bool {
        self.auth_service.is_configured()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatcher_auth_configured() {
        let auth = DispatchAuthService::new(Some("test-key".to_string()));
        assert!(auth.is_configured());
    }
}
