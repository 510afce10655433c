//! Pending job poller

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::auth::DispatchAuthService;
use crate::{
    BlockOnErrorChecker, DispatchJob, DispatchJobRepository, DispatchMode, GroupDispatcher,
    JobDispatcher, QueuePublisher, SchedulerConfig, SchedulerError,
};

const DEFAULT_MESSAGE_GROUP: &str = "default";

#[derive(Clone)]
pub struct PendingJobPoller {
    config: SchedulerConfig,
    repository: Arc<dyn DispatchJobRepository>,
    block_checker: Arc<BlockOnErrorChecker>,
    group_dispatcher: Arc<GroupDispatcher>,
}

impl PendingJobPoller {
    pub fn new(
        config: SchedulerConfig,
        repository: Arc<dyn DispatchJobRepository>,
        queue_publisher: Arc<dyn QueuePublisher>,
        auth_service: DispatchAuthService,
    ) -> Self {
        let block_checker = Arc::new(BlockOnErrorChecker::new(repository.clone()));
        let job_dispatcher = Arc::new(JobDispatcher::new(
            config.clone(),
            repository.clone(),
            queue_publisher,
            auth_service,
        ));
        let group_dispatcher = Arc::new(GroupDispatcher::new(
            job_dispatcher,
            config.max_concurrent_dispatches,
        ));

        Self {
            config,
            repository,
            block_checker,
            group_dispatcher,
        }
    }

    pub async fn poll(&self) -> Result<(), SchedulerError> {
        let pending_jobs = self.repository.find_pending(self.config.batch_size).await?;
        if pending_jobs.is_empty() {
            trace!("No pending jobs found");
            return Ok(());
        }

        debug!(count = pending_jobs.len(), "Found pending jobs to process");
        metrics::gauge!("scheduler.pending_jobs").set(pending_jobs.len() as f64);

        let jobs_by_group = self.group_by_message_group(pending_jobs);
        let groups: HashSet<String> = jobs_by_group.keys().cloned().collect();
        let blocked_groups = self.block_checker.get_blocked_groups(&groups).await?;

        metrics::gauge!("scheduler.blocked_groups").set(blocked_groups.len() as f64);

        for (group, jobs) in jobs_by_group {
            if blocked_groups.contains(&group) {
                debug!(group = %group, count = jobs.len(), "Message group blocked, skipping");
                metrics::counter!("scheduler.jobs.blocked_total").increment(jobs.len() as u64);
                continue;
            }

            let dispatchable = self.filter_by_dispatch_mode(&group, jobs, &blocked_groups);
            if !dispatchable.is_empty() {
                debug!(group = %group, count = dispatchable.len(), "Dispatching jobs");
                self.group_dispatcher.dispatch_group(&group, dispatchable).await;
            }
        }
        Ok(())
    }

    fn group_by_message_group(&self, jobs: Vec<DispatchJob>) -> HashMap<String, Vec<DispatchJob>> {
        let mut grouped: HashMap<String, Vec<DispatchJob>> = HashMap::new();
        for job in jobs {
            let group = job.message_group.clone().unwrap_or_else(|| DEFAULT_MESSAGE_GROUP.to_string());
            grouped.entry(group).or_default().push(job);
        }
        grouped
    }

    fn filter_by_dispatch_mode(&self, group: &str, jobs: Vec<DispatchJob>, blocked_groups: &HashSet<String>) -> Vec<DispatchJob> {
        jobs.into_iter()
            .filter(|job| match job.mode {
                DispatchMode::Immediate => true,
                DispatchMode::NextOnError | DispatchMode::BlockOnError => !blocked_groups.contains(group),
            })
            .collect()
    }
}
