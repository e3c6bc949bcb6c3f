//! JobQueue: the authoritative list of replication jobs, one per bucket.
//!
//! Every mutation (arm, claim, finish) happens under one lock. The transfer
//! itself runs outside it: [`JobQueue::claim_next`] hands out an owned copy
//! of the job and the worker reports back through [`JobQueue::complete`] or
//! [`JobQueue::fail`].

use super::clock::Clock;
use crate::models::{
    bucket::BucketName,
    replication_job::{JobStatus, ReplicationJob},
};
use chrono::{DateTime, TimeDelta, Utc};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::debug;

/// Fixed delay before a failed job may be selected again.
pub const RETRY_BACKOFF: TimeDelta = TimeDelta::minutes(5);

pub struct JobQueue {
    jobs: Mutex<HashMap<BucketName, ReplicationJob>>,
    clock: Arc<dyn Clock>,
}

impl JobQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BucketName, ReplicationJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `file` for transfer, creating or re-arming the bucket's job.
    pub fn add_job(&self, bucket: &BucketName, file: PathBuf) {
        let now = self.clock.now();
        let mut jobs = self.lock();
        match jobs.get_mut(bucket) {
            Some(job) => {
                job.rearm(file, now);
                debug!(bucket = %bucket, status = ?job.status, "replication job re-armed");
            }
            None => {
                debug!(bucket = %bucket, "replication job created");
                jobs.insert(bucket.clone(), ReplicationJob::new(bucket.clone(), file, now));
            }
        }
    }

    /// Select the most overdue eligible job and mark it Running.
    ///
    /// Eligible jobs are Pending or Error with `next_eligible_at <= now`;
    /// the earliest `next_eligible_at` wins. Returns an owned copy.
    pub fn claim_next(&self) -> Option<ReplicationJob> {
        let now = self.clock.now();
        let mut jobs = self.lock();
        let job = jobs
            .values_mut()
            .filter(|job| job.is_eligible(now))
            .min_by_key(|job| job.next_eligible_at)?;
        job.status = JobStatus::Running;
        job.last_start = Some(now);
        Some(job.clone())
    }

    /// Record a successful transfer of the job claimed at `generation`.
    ///
    /// If a newer export re-armed the job while it was running, the job goes
    /// back to Pending so the newer file is shipped too.
    pub fn complete(&self, bucket: &BucketName, generation: u64) {
        let now = self.clock.now();
        let mut jobs = self.lock();
        if let Some(job) = jobs.get_mut(bucket) {
            job.last_end = Some(now);
            job.message.clear();
            if job.generation == generation {
                job.status = JobStatus::Complete;
            } else {
                job.status = JobStatus::Pending;
                job.next_eligible_at = now;
            }
        }
    }

    /// Record a failed transfer; the job becomes eligible again after
    /// [`RETRY_BACKOFF`]. Returns that time.
    pub fn fail(&self, bucket: &BucketName, message: impl Into<String>) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        let mut jobs = self.lock();
        let job = jobs.get_mut(bucket)?;
        job.status = JobStatus::Error;
        job.message = message.into();
        job.last_end = Some(now);
        job.next_eligible_at = now + RETRY_BACKOFF;
        Some(job.next_eligible_at)
    }

    pub fn get(&self, bucket: &BucketName) -> Option<ReplicationJob> {
        self.lock().get(bucket).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Owned copy of every job, sorted by bucket name.
    pub fn snapshot(&self) -> Vec<ReplicationJob> {
        let mut jobs: Vec<_> = self.lock().values().cloned().collect();
        jobs.sort_by(|a, b| a.bucket.cmp(&b.bucket));
        jobs
    }
}
