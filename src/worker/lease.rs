//! Per-worker lease renewal timers.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::jobs::JobId;
use crate::store::AtomicStore;

struct LeaseTimer {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Renews the lease of every job this worker is processing.
///
/// Each entry is a task that extends the lease every `renew_every` while the
/// worker's token still owns it. When an extension finds the lease gone the
/// entry's `lost` token is cancelled and the timer stops.
pub struct LeaseRegistry {
    store: Arc<dyn AtomicStore>,
    lease_ms: u64,
    renew_every: Duration,
    timers: DashMap<JobId, LeaseTimer>,
}

impl LeaseRegistry {
    pub fn new(store: Arc<dyn AtomicStore>, lease_ms: u64, renew_every_ms: u64) -> Self {
        Self {
            store,
            lease_ms,
            renew_every: Duration::from_millis(renew_every_ms),
            timers: DashMap::new(),
        }
    }

    /// Starts renewing `job_id` under `token`. The returned token is
    /// cancelled if the lease is found missing.
    pub fn start(&self, job_id: &str, token: &str) -> CancellationToken {
        let lost = CancellationToken::new();
        let stop = CancellationToken::new();

        let store = Arc::clone(&self.store);
        let (lease_ms, renew_every) = (self.lease_ms, self.renew_every);
        let (job_id_owned, token) = (job_id.to_string(), token.to_string());
        let (task_stop, task_lost) = (stop.clone(), lost.clone());

        let task = tokio::spawn(async move {
            let job_id = job_id_owned;
            loop {
                tokio::select! {
                    _ = task_stop.cancelled() => return,
                    _ = tokio::time::sleep(renew_every) => {}
                }
                match store.extend_lease(&job_id, &token, lease_ms).await {
                    Ok(true) => debug!(job_id = %job_id, "Lease extended"),
                    Ok(false) => {
                        warn!(job_id = %job_id, "Lease lost, abandoning job");
                        task_lost.cancel();
                        return;
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Failed to extend lease");
                    }
                }
            }
        });

        if let Some(previous) = self.timers.insert(job_id.to_string(), LeaseTimer { stop, task }) {
            previous.stop.cancel();
        }
        lost
    }

    /// Stops renewing `job_id`.
    pub fn cancel(&self, job_id: &str) {
        if let Some((_, timer)) = self.timers.remove(job_id) {
            timer.stop.cancel();
        }
    }

    /// Stops every timer, aborting extensions already in flight.
    pub fn cancel_all(&self) {
        let job_ids: Vec<JobId> = self.timers.iter().map(|t| t.key().clone()).collect();
        for job_id in job_ids {
            if let Some((_, timer)) = self.timers.remove(&job_id) {
                timer.stop.cancel();
                timer.task.abort();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl Drop for LeaseRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
