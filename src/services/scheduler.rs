//! BackupScheduler: fires one export pass per configured (hour, day).

use super::{
    clock::Clock,
    export_service::{ExportPipeline, ExportSource},
    guard::guarded,
};
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::Serialize;
use std::{
    collections::BTreeSet,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SchedulerState {
    pub last_triggered_hour: Option<u32>,
    pub last_triggered_day: Option<NaiveDate>,
    /// Last time the loop looked at the clock.
    pub last_tick: Option<DateTime<Utc>>,
    /// Start of the most recent export pass.
    pub last_pass_start: Option<DateTime<Utc>>,
}

/// Shared trigger bookkeeping, readable by the status surface.
#[derive(Debug, Default)]
pub struct SchedulerTracker {
    state: RwLock<SchedulerState>,
}

impl SchedulerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tick and decide whether it starts a pass.
    ///
    /// Fires when `hour` is configured and `(hour, day)` differs from the
    /// last pair that fired. The pair is recorded before returning true.
    pub fn try_trigger(
        &self,
        hour: u32,
        day: NaiveDate,
        hours: &BTreeSet<u32>,
        now: DateTime<Utc>,
    ) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.last_tick = Some(now);
        if !hours.contains(&hour) {
            return false;
        }
        if state.last_triggered_hour == Some(hour) && state.last_triggered_day == Some(day) {
            return false;
        }
        state.last_triggered_hour = Some(hour);
        state.last_triggered_day = Some(day);
        state.last_pass_start = Some(now);
        true
    }

    pub fn snapshot(&self) -> SchedulerState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct BackupScheduler<S> {
    pipeline: Arc<ExportPipeline<S>>,
    hours: BTreeSet<u32>,
    tracker: Arc<SchedulerTracker>,
    clock: Arc<dyn Clock>,
}

impl<S: ExportSource> BackupScheduler<S> {
    pub fn new(
        pipeline: Arc<ExportPipeline<S>>,
        hours: BTreeSet<u32>,
        tracker: Arc<SchedulerTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pipeline,
            hours,
            tracker,
            clock,
        }
    }

    /// Check the clock and, when due, export every bucket in turn.
    /// Returns whether a pass ran.
    pub async fn tick(&self) -> bool {
        let local = self.clock.local_now();
        let now = self.clock.now();
        if !self
            .tracker
            .try_trigger(local.hour(), local.date(), &self.hours, now)
        {
            return false;
        }

        let buckets = match self.pipeline.source().list_buckets().await {
            Ok(buckets) => buckets,
            Err(err) => {
                error!("backup pass aborted, cannot list buckets: {err}");
                return true;
            }
        };
        info!(
            hour = local.hour(),
            buckets = buckets.len(),
            "backup pass started"
        );

        let statuses = self.pipeline.statuses();
        for bucket in &buckets {
            statuses.register(bucket);
        }
        for bucket in &buckets {
            if let Err(panic) = guarded(self.pipeline.export_bucket(bucket)).await {
                error!(bucket = %bucket, "backup panicked: {panic}");
                statuses.mark_failed(
                    bucket,
                    self.clock.now(),
                    format!("backup panicked: {panic}"),
                );
            }
        }
        debug!("backup pass finished");
        true
    }

    /// Tick every `every` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, every: Duration, shutdown: CancellationToken) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            hours = ?self.hours,
            every_secs = every.as_secs(),
            "backup scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(panic) = guarded(self.tick()).await {
                        warn!("backup tick panicked: {panic}");
                    }
                }
            }
        }
        info!("backup scheduler stopped");
    }
}
