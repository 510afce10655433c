//! Group dispatcher - guarantees at most one in-flight dispatch per message
//! group while letting dispatches across different groups run in parallel,
//! up to a global concurrency cap.
//!
//! `IMMEDIATE` jobs bypass the per-group serializer entirely (still bounded by
//! the global semaphore); `NEXT_ON_ERROR` and `BLOCK_ON_ERROR` jobs are queued
//! onto a per-group worker task, mirroring the per-message-group worker
//! pattern the router's processing pool uses for FIFO ordering.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, warn};

use crate::{DispatchJob, DispatchMode, JobDispatcher};

pub struct GroupDispatcher {
    job_dispatcher: Arc<JobDispatcher>,
    semaphore: Arc<Semaphore>,
    group_senders: DashMap<Arc<str>, mpsc::UnboundedSender<DispatchJob>>,
}

impl GroupDispatcher {
    pub fn new(job_dispatcher: Arc<JobDispatcher>, max_concurrent_dispatches: usize) -> Self {
        Self {
            job_dispatcher,
            semaphore: Arc::new(Semaphore::new(max_concurrent_dispatches.max(1))),
            group_senders: DashMap::new(),
        }
    }

    /// Dispatch a batch of already-filtered, dispatchable jobs belonging to
    /// one message group, honoring each job's mode.
    pub async fn dispatch_group(&self, group: &str, jobs: Vec<DispatchJob>) {
        let (immediate, serialized): (Vec<_>, Vec<_>) =
            jobs.into_iter().partition(|j| j.mode == DispatchMode::Immediate);

        for job in immediate {
            self.spawn_direct(job);
        }

        if !serialized.is_empty() {
            self.enqueue_serialized(group, serialized);
        }
    }

    fn spawn_direct(&self, job: DispatchJob) {
        let dispatcher = self.job_dispatcher.clone();
        let semaphore = self.semaphore.clone();

        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if let Err(e) = dispatcher.dispatch_job(&job).await {
                error!(job_id = %job.id, error = %e, "Immediate dispatch failed");
            }
        });
    }

    fn enqueue_serialized(&self, group: &str, jobs: Vec<DispatchJob>) {
        let key: Arc<str> = Arc::from(group);
        let sender = self
            .group_senders
            .entry(key.clone())
            .or_insert_with(|| self.spawn_group_worker(key.clone()))
            .clone();

        for job in jobs {
            if sender.send(job).is_err() {
                warn!(group = %key, "Group worker channel closed, dropping job for this cycle");
            }
        }
    }

    fn spawn_group_worker(&self, group: Arc<str>) -> mpsc::UnboundedSender<DispatchJob> {
        let (tx, mut rx) = mpsc::unbounded_channel::<DispatchJob>();
        let dispatcher = self.job_dispatcher.clone();
        let semaphore = self.semaphore.clone();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                if let Err(e) = dispatcher.dispatch_job(&job).await {
                    warn!(group = %group, job_id = %job.id, error = %e, "Serialized dispatch failed");
                }
            }
        });

        tx
    }
}
