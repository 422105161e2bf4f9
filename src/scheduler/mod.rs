//! Queue scheduler: delayed job promotion and the stalled-job reaper.
//!
//! Both loops only call atomic store operations, so any number of
//! schedulers may run against the same queue. The reaper pass is guarded by
//! a store-side marker; the promotion pass moves each due job exactly once.

pub mod repeat;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::settings::SchedulerConfig;
use crate::error::{QueueError, QueueResult};
use crate::events::{EventCursor, EventSubscription, QueueEvent, QueueEvents};
use crate::store::{AtomicStore, Promotion, StalledReport};
use crate::utils::{millis_until, now_ms};

pub use repeat::{Repeat, RepeatableJob, next_millis, repeat_job_id, repeat_key};

/// Delayed jobs moved per promotion call.
const PROMOTE_BATCH: usize = 1000;

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Runs the promotion and reaper loops of one queue.
#[derive(Clone)]
pub struct QueueScheduler {
    store: Arc<dyn AtomicStore>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
}

impl QueueScheduler {
    /// Fails fast on a configuration the loops cannot run with.
    pub fn new(store: Arc<dyn AtomicStore>, config: SchedulerConfig) -> QueueResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    /// Promotes every due delayed job. Returns the number promoted and the
    /// due time of the earliest job left.
    pub async fn promote_due(&self) -> QueueResult<Promotion> {
        let mut total = Promotion::default();
        loop {
            let promotion = self.store.promote_delayed(now_ms(), PROMOTE_BATCH).await?;
            total.promoted += promotion.promoted;
            total.next_due = promotion.next_due;
            if promotion.promoted < PROMOTE_BATCH as u64 {
                return Ok(total);
            }
        }
    }

    /// One reaper pass.
    pub async fn reap_stalled(&self) -> QueueResult<StalledReport> {
        let report = self
            .store
            .reap_stalled(
                self.config.max_stalled_count,
                now_ms(),
                self.config.stalled_interval_ms,
            )
            .await?;

        for job_id in &report.stalled {
            warn!(queue = %self.store.queue_name(), job_id = %job_id, "Job stalled, moved back to waiting");
        }
        for job_id in &report.failed {
            error!(queue = %self.store.queue_name(), job_id = %job_id, "Job stalled too many times, failed");
        }
        Ok(report)
    }

    /// Runs both loops until [`QueueScheduler::close`] is called.
    pub async fn run(&self) -> QueueResult<()> {
        info!(
            queue = %self.store.queue_name(),
            stalled_interval_ms = self.config.stalled_interval_ms,
            max_stalled_count = self.config.max_stalled_count,
            "Scheduler started"
        );

        let events = QueueEvents::new(Arc::clone(&self.store));
        let subscription = events.subscribe(EventCursor::Latest).await?;

        tokio::join!(self.promotion_loop(subscription), self.reaper_loop());
        events.close();

        info!(queue = %self.store.queue_name(), "Scheduler stopped");
        Ok(())
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    async fn promotion_loop(&self, mut subscription: EventSubscription) {
        let max_wait = Duration::from_millis(self.config.max_delay_poll_ms);
        loop {
            let wait = match self.promote_due().await {
                Ok(promotion) => {
                    if promotion.promoted > 0 {
                        debug!(
                            queue = %self.store.queue_name(),
                            promoted = promotion.promoted,
                            "Promoted delayed jobs"
                        );
                    }
                    promotion
                        .next_due
                        .map(|due| Duration::from_millis(millis_until(due)).min(max_wait))
                        .unwrap_or(max_wait)
                }
                Err(e) => {
                    self.log_error("promote delayed jobs", &e);
                    ERROR_BACKOFF
                }
            };

            let deadline = Instant::now() + wait;
            let deadline_ms = now_ms() + wait.as_millis() as i64;
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => break,
                    delivered = subscription.recv() => match delivered {
                        // A job due before the current wake-up moves it forward.
                        Some(event) => match event.event {
                            QueueEvent::Delayed { due, .. } if due < deadline_ms => break,
                            _ => continue,
                        },
                        None => {
                            tokio::select! {
                                _ = self.shutdown.cancelled() => return,
                                _ = tokio::time::sleep_until(deadline) => break,
                            }
                        }
                    },
                }
            }
        }
    }

    async fn reaper_loop(&self) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.stalled_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_stalled().await {
                        self.log_error("reap stalled jobs", &e);
                    }
                }
            }
        }
    }

    fn log_error(&self, operation: &str, error: &QueueError) {
        if error.is_transient() {
            warn!(queue = %self.store.queue_name(), operation, error = %error, "Store unavailable, retrying");
        } else {
            error!(queue = %self.store.queue_name(), operation, error = %error, "Scheduler operation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Job, JobOptions, JobState};
    use crate::store::{AdmitRequest, MemoryStore, STALLED_FAILURE_REASON};
    use serde_json::json;

    fn scheduler_config() -> SchedulerConfig {
        SchedulerConfig {
            stalled_interval_ms: 50,
            max_stalled_count: 1,
            max_delay_poll_ms: 200,
        }
    }

    #[test]
    fn test_zero_stalled_interval_is_rejected() {
        let store = Arc::new(MemoryStore::new("sched", 100));
        let config = SchedulerConfig {
            stalled_interval_ms: 0,
            ..scheduler_config()
        };
        let err = QueueScheduler::new(store, config).err().unwrap();
        assert!(matches!(err, QueueError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_delayed_job_promoted_not_before_due() {
        let store = Arc::new(MemoryStore::new("sched", 100));
        let scheduler = QueueScheduler::new(store.clone(), scheduler_config()).unwrap();
        let added = now_ms();
        let job_id = store
            .enqueue(&Job::new("a", json!({}), JobOptions::default().with_delay(300)))
            .await
            .unwrap();

        let runner = scheduler.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        let mut seen_waiting_at = None;
        for _ in 0..100 {
            if store.get_state(&job_id).await.unwrap() == JobState::Waiting {
                seen_waiting_at = Some(now_ms());
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        scheduler.close();
        handle.await.unwrap().unwrap();

        let at = seen_waiting_at.expect("job was never promoted");
        assert!(at >= added + 300);
    }

    #[tokio::test]
    async fn test_reaper_reclaims_then_fails() {
        let store = Arc::new(MemoryStore::new("sched", 100));
        let scheduler = QueueScheduler::new(store.clone(), scheduler_config()).unwrap();
        let job_id = store
            .enqueue(&Job::new("a", json!({}), JobOptions::default()))
            .await
            .unwrap();

        let admit = |token: &str| AdmitRequest {
            token: token.to_string(),
            lease_ms: 1,
            job_id: None,
            limiter: None,
            now: now_ms(),
        };

        // Admitted with a lease that expires at once and is never renewed.
        store.admit_next(&admit("w1")).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut stalled = Vec::new();
        for _ in 0..4 {
            stalled.extend(scheduler.reap_stalled().await.unwrap().stalled);
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
        assert_eq!(stalled, vec![job_id.clone()]);
        assert_eq!(store.get_state(&job_id).await.unwrap(), JobState::Waiting);

        store.admit_next(&admit("w2")).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut failed = Vec::new();
        for _ in 0..4 {
            failed.extend(scheduler.reap_stalled().await.unwrap().failed);
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
        assert_eq!(failed, vec![job_id.clone()]);
        let job = store.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.failed_reason.as_deref(), Some(STALLED_FAILURE_REASON));
    }
}
