//! ReplicationWorker: drains the job queue one transfer per tick.

use super::{
    clock::Clock,
    guard::guarded,
    job_queue::JobQueue,
    naming::{SuffixPolicy, backup_file_name, zip_file_name},
    status_registry::StatusRegistry,
    transfer::Transport,
};
use crate::models::bucket::BucketName;
use std::{sync::Arc, time::Duration};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How remote filenames are derived.
#[derive(Clone, Copy, Debug, Default)]
pub struct RemoteNaming {
    pub suffix: SuffixPolicy,
    /// Append `.zip` because local files are compressed.
    pub zip: bool,
}

impl RemoteNaming {
    pub fn file_name(&self, bucket: &BucketName, clock: &dyn Clock) -> String {
        let name = backup_file_name(bucket, self.suffix, clock.local_now());
        if self.zip { zip_file_name(&name) } else { name }
    }
}

pub struct ReplicationWorker<T> {
    jobs: Arc<JobQueue>,
    statuses: Arc<StatusRegistry>,
    transport: Arc<T>,
    clock: Arc<dyn Clock>,
    naming: RemoteNaming,
}

impl<T: Transport> ReplicationWorker<T> {
    pub fn new(
        jobs: Arc<JobQueue>,
        statuses: Arc<StatusRegistry>,
        transport: Arc<T>,
        clock: Arc<dyn Clock>,
        naming: RemoteNaming,
    ) -> Self {
        Self {
            jobs,
            statuses,
            transport,
            clock,
            naming,
        }
    }

    /// Run at most one transfer. Returns whether a job was picked up.
    pub async fn tick(&self) -> bool {
        let Some(job) = self.jobs.claim_next() else {
            return false;
        };

        // Named at send time, so a transfer that crosses midnight carries the
        // new day's suffix.
        let remote_name = self.naming.file_name(&job.bucket, &*self.clock);
        info!(
            bucket = %job.bucket,
            file = %job.source_file.display(),
            remote = %remote_name,
            "replication started"
        );

        let outcome = match guarded(self.transport.send(&job.source_file, &remote_name)).await {
            Ok(result) => result.map_err(|err| err.to_string()),
            Err(panic) => Err(format!("transfer panicked: {panic}")),
        };

        match outcome {
            Ok(()) => {
                self.jobs.complete(&job.bucket, job.generation);
                self.statuses.clear_transfer_error(&job.bucket);
                info!(bucket = %job.bucket, remote = %remote_name, "replication completed");
            }
            Err(message) => {
                self.statuses.mark_transfer_error(&job.bucket, message.clone());
                if let Some(retry_at) = self.jobs.fail(&job.bucket, message.clone()) {
                    warn!(
                        bucket = %job.bucket,
                        retry_at = %retry_at,
                        "replication failed: {message}"
                    );
                }
            }
        }
        true
    }

    /// Tick every `every` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, every: Duration, shutdown: CancellationToken) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(every_secs = every.as_secs(), "replication loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(panic) = guarded(self.tick()).await {
                        error!("replication tick panicked: {panic}");
                    }
                }
            }
        }
        info!("replication loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{backup_status::BackupState, replication_job::JobStatus},
        services::{
            clock::ManualClock,
            job_queue::RETRY_BACKOFF,
            status_registry::ExportOutput,
            testing::{FakeTransport, test_clock},
        },
    };
    use chrono::TimeDelta;
    use std::path::PathBuf;

    struct Harness {
        clock: Arc<ManualClock>,
        jobs: Arc<JobQueue>,
        statuses: Arc<StatusRegistry>,
        transport: Arc<FakeTransport>,
        worker: ReplicationWorker<FakeTransport>,
    }

    fn harness(naming: RemoteNaming) -> Harness {
        let clock = test_clock(3);
        let jobs = Arc::new(JobQueue::new(clock.clone()));
        let statuses = Arc::new(StatusRegistry::new());
        let transport = Arc::new(FakeTransport::new());
        let worker = ReplicationWorker::new(
            jobs.clone(),
            statuses.clone(),
            transport.clone(),
            clock.clone(),
            naming,
        );
        Harness {
            clock,
            jobs,
            statuses,
            transport,
            worker,
        }
    }

    fn exported(h: &Harness, bucket: &BucketName, path: &str) {
        h.statuses.register(bucket);
        h.statuses.mark_running(bucket, h.clock.now());
        h.statuses.mark_completed(
            bucket,
            h.clock.now(),
            &ExportOutput {
                path: path.into(),
                bytes: 1,
                digest: "00".into(),
            },
        );
        h.jobs.add_job(bucket, path.into());
    }

    #[tokio::test]
    async fn idle_tick_does_nothing() {
        let h = harness(RemoteNaming::default());
        assert!(!h.worker.tick().await);
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn successful_transfer_completes_job() {
        let h = harness(RemoteNaming::default());
        let bucket = BucketName::from("alpha");
        exported(&h, &bucket, "/b/alpha.bak");

        assert!(h.worker.tick().await);

        assert_eq!(
            h.transport.sent(),
            vec![(PathBuf::from("/b/alpha.bak"), "alpha.bak".to_string())]
        );
        let job = h.jobs.get(&bucket).unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert!(job.message.is_empty());
        assert_eq!(job.last_end, Some(h.clock.now()));
    }

    #[tokio::test]
    async fn failure_backs_off_and_flags_bucket() {
        let h = harness(RemoteNaming::default());
        let bucket = BucketName::from("alpha");
        exported(&h, &bucket, "/b/alpha.bak");
        h.transport.set_failing(true);

        assert!(h.worker.tick().await);

        let job = h.jobs.get(&bucket).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.message.contains("connection reset by peer"));
        assert_eq!(job.next_eligible_at, h.clock.now() + RETRY_BACKOFF);
        let status = h.statuses.get(&bucket).unwrap();
        assert_eq!(status.status, BackupState::TransferError);
        assert!(status.last_message.contains("connection reset by peer"));

        h.transport.set_failing(false);
        assert!(!h.worker.tick().await, "retried inside the back-off window");

        h.clock.advance(RETRY_BACKOFF);
        assert!(h.worker.tick().await);
        assert_eq!(h.jobs.get(&bucket).unwrap().status, JobStatus::Complete);
        assert_eq!(
            h.statuses.get(&bucket).unwrap().status,
            BackupState::Completed
        );
    }

    #[tokio::test]
    async fn panicking_transport_counts_as_failure() {
        let h = harness(RemoteNaming::default());
        let bucket = BucketName::from("alpha");
        exported(&h, &bucket, "/b/alpha.bak");
        h.transport.set_panicking(true);

        assert!(h.worker.tick().await);

        let job = h.jobs.get(&bucket).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.message.contains("ssh client crashed"));
        assert_eq!(job.next_eligible_at, h.clock.now() + RETRY_BACKOFF);
    }

    #[tokio::test]
    async fn remote_name_uses_send_time_suffixes() {
        let h = harness(RemoteNaming {
            suffix: SuffixPolicy {
                day: true,
                hour: true,
            },
            zip: true,
        });
        let bucket = BucketName::from("alpha");
        exported(&h, &bucket, "/b/alpha_01_03.bak.zip");
        h.clock.advance(TimeDelta::hours(2));

        h.worker.tick().await;

        assert_eq!(h.transport.sent()[0].1, "alpha_01_05.bak.zip");
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let h = harness(RemoteNaming::default());
        let bucket = BucketName::from("alpha");
        exported(&h, &bucket, "/b/alpha.bak");

        let token = CancellationToken::new();
        let worker = Arc::new(h.worker);
        let handle = tokio::spawn(worker.run(Duration::from_millis(5), token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(h.transport.sent().len(), 1);
        assert_eq!(h.jobs.get(&bucket).unwrap().status, JobStatus::Complete);
    }
}
