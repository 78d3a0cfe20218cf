//! Background jobs: key revival, a daily full health sweep, and the daily
//! client-quota reset.
//!
//! Each job runs in its own task on a fixed interval. A missed tick is
//! skipped rather than caught up, and a job always finishes its current
//! run before the next tick can fire. All jobs share one cancellation
//! token so shutdown stops the lot.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::pool::KeyPool;
use crate::store::Store;

const DAILY: Duration = Duration::from_secs(24 * 60 * 60);

pub struct Scheduler {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn start(pool: Arc<KeyPool>, store: Store, cfg: &Config) -> Self {
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        let revival_interval = cfg.scheduler.key_revival_interval();
        info!(
            interval_secs = revival_interval.as_secs(),
            "Scheduling key revival job"
        );
        {
            let pool = pool.clone();
            handles.push(tokio::spawn(run_job(
                "key_revival",
                revival_interval,
                cancel.clone(),
                move || {
                    let pool = pool.clone();
                    async move { pool.revive_disabled_keys().await }
                },
            )));
        }

        handles.push(tokio::spawn(run_job(
            "daily_health_check",
            DAILY,
            cancel.clone(),
            move || {
                let pool = pool.clone();
                async move { pool.check_all_keys_health().await }
            },
        )));

        handles.push(tokio::spawn(run_job(
            "daily_client_quota_reset",
            DAILY,
            cancel.clone(),
            move || {
                let store = store.clone();
                async move {
                    info!("Running daily job: resetting all client key usage counts");
                    if let Err(e) = store.reset_all_client_key_usage().await {
                        error!("Failed to reset client key usage: {}", e);
                    }
                }
            },
        )));

        Self { cancel, handles }
    }

    /// Cancel all jobs and wait for them to wind down. In-flight probes are
    /// allowed to finish their current run.
    pub async fn stop(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Scheduled job panicked: {}", e);
            }
        }
        info!("Scheduler stopped");
    }
}

async fn run_job<F, Fut>(name: &'static str, period: Duration, cancel: CancellationToken, job: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; jobs should wait a full period.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(job = name, "Stopping scheduled job");
                break;
            }
            _ = interval.tick() => {
                debug!(job = name, "Running scheduled job");
                job().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_job_runs_on_interval_and_stops_on_cancel() {
        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let counter = runs.clone();
        let handle = tokio::spawn(run_job(
            "test_job",
            Duration::from_millis(20),
            cancel.clone(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        ));

        tokio::time::sleep(Duration::from_millis(110)).await;
        cancel.cancel();
        handle.await.unwrap();

        let count = runs.load(Ordering::SeqCst);
        assert!(count >= 3, "expected several runs, got {count}");

        // No further runs after cancellation.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), count);
    }

    #[tokio::test]
    async fn test_job_does_not_fire_immediately() {
        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let counter = runs.clone();
        let handle = tokio::spawn(run_job(
            "test_job",
            Duration::from_secs(60),
            cancel.clone(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
