//! Daily batch jobs and the background tasks that drive them.

pub mod maintenance;
pub mod reminders;

pub use maintenance::MaintenanceSweep;
pub use reminders::ReminderScheduler;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use tracing::{info, warn};

use crate::config::JobConfig;
use crate::engine::{now_ms, Engine};
use crate::model::Ms;

/// Outcome of one job run. Per-entity failures are counted here rather
/// than aborting the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobReport {
    pub processed: usize,
    pub failed: usize,
    pub steps: Vec<(&'static str, usize)>,
}

impl JobReport {
    pub fn step(&mut self, name: &'static str, count: usize) {
        self.processed += count;
        self.steps.push((name, count));
    }

    pub fn count(&self, name: &str) -> usize {
        self.steps
            .iter()
            .find(|(n, _)| *n == name)
            .map_or(0, |(_, c)| *c)
    }
}

#[async_trait]
pub trait BatchJob: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, config: &JobConfig) -> JobReport;
}

/// Run a job once, logging and recording its report.
pub async fn run_job(job: &dyn BatchJob, config: &JobConfig) -> JobReport {
    let started = std::time::Instant::now();
    let report = job.run(config).await;
    let name = job.name();
    metrics::counter!(crate::observability::JOB_RUNS_TOTAL, "job" => name).increment(1);
    metrics::counter!(crate::observability::JOB_ITEMS_TOTAL, "job" => name, "result" => "processed")
        .increment(report.processed as u64);
    metrics::counter!(crate::observability::JOB_ITEMS_TOTAL, "job" => name, "result" => "failed")
        .increment(report.failed as u64);
    metrics::histogram!(crate::observability::JOB_DURATION_SECONDS, "job" => name)
        .record(started.elapsed().as_secs_f64());
    if report.failed > 0 {
        warn!(
            "{name}: processed {} with {} failures {:?}",
            report.processed, report.failed, report.steps
        );
    } else {
        info!("{name}: processed {} {:?}", report.processed, report.steps);
    }
    report
}

/// Milliseconds from `now` until the next `run_at_hour:00` in clinic time.
pub fn until_next_run(now: Ms, config: &JobConfig) -> Ms {
    let offset = config.utc_offset_minutes as Ms * 60_000;
    let local_now = now + offset;
    let today = config.local_date(now);
    let at = NaiveTime::from_hms_opt(config.run_at_hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let mut next = today.and_time(at).and_utc().timestamp_millis();
    if next <= local_now {
        next += crate::model::MS_PER_DAY;
    }
    next - local_now
}

/// Run `jobs` in order once a day at the configured local hour.
pub async fn run_daily(jobs: Vec<Arc<dyn BatchJob>>, config: JobConfig) {
    loop {
        let wait = until_next_run(now_ms(), &config);
        let when = DateTime::<Utc>::from_timestamp_millis(now_ms() + wait).unwrap_or_default();
        info!("next job run at {when}");
        tokio::time::sleep(Duration::from_millis(wait as u64)).await;
        for job in &jobs {
            run_job(job.as_ref(), &config).await;
        }
    }
}

/// Compact the WAL whenever enough appends have piled up, and drop
/// day-feed channels nobody listens to.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        engine.notify.prune();
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
