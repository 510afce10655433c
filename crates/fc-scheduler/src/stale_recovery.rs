//! Stale job recovery - finds jobs stuck in QUEUED status and resets them

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{DispatchJobRepository, SchedulerConfig, SchedulerError};

#[derive(Clone)]
pub struct StaleQueuedJobPoller {
    config: SchedulerConfig,
    repository: Arc<dyn DispatchJobRepository>,
}

impl StaleQueuedJobPoller {
    pub fn new(config: SchedulerConfig, repository: Arc<dyn DispatchJobRepository>) -> Self {
        Self { config, repository }
    }

    /// Recover jobs stuck in QUEUED status beyond the stale threshold
    pub async fn recover_stale_jobs(&self) -> Result<usize, SchedulerError> {
        let count = self.repository.mark_stale_reset(self.config.stale_threshold).await?;

        metrics::counter!("scheduler.stale_jobs.recovered_total").increment(count as u64);
        metrics::gauge!("scheduler.stale_jobs.last_recovery_count").set(count as f64);

        if count > 0 {
            info!(count = count, threshold_mins = self.config.stale_threshold.as_secs() / 60, "Recovered stale QUEUED jobs");
        } else {
            debug!("No stale jobs to recover");
        }

        Ok(count)
    }

    /// Count jobs currently in QUEUED status (for monitoring)
    pub async fn count_queued_jobs(&self) -> Result<u64, SchedulerError> {
        let count = self.repository.count_queued().await?;
        metrics::gauge!("scheduler.queued_jobs_total").set(count as f64);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stale_threshold_conversion() {
        let config = SchedulerConfig {
            stale_threshold: Duration::from_secs(15 * 60),
            ..Default::default()
        };

        assert_eq!(config.stale_threshold.as_secs(), 15 * 60);
    }
}
