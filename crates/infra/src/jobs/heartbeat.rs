//! Periodic heartbeat renewal for a running job.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::store::JobStore;
use super::types::ClaimToken;

/// Keeps a claimed job's `heartbeat_at` fresh while its handler runs.
///
/// The first renewal happens one interval after [`start`](Self::start); the
/// claim itself already stamped the heartbeat. Renewal errors are logged and
/// retried on the next tick. If the store reports the claim gone, the task
/// stops on its own. Dropping the handle cancels the task.
#[derive(Debug)]
pub struct Heartbeat {
    shutdown: Arc<Notify>,
    renewals: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn start<S>(store: S, claim: ClaimToken, interval: Duration) -> Self
    where
        S: JobStore + 'static,
    {
        let shutdown = Arc::new(Notify::new());
        let renewals = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            let renewals = renewals.clone();
            async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = shutdown.notified() => break,
                        _ = ticker.tick() => {
                            match store.renew_heartbeat(claim).await {
                                Ok(true) => {
                                    renewals.fetch_add(1, Ordering::Relaxed);
                                    debug!(job_id = %claim.job_id, attempt = claim.attempt, "heartbeat renewed");
                                }
                                Ok(false) => {
                                    warn!(
                                        job_id = %claim.job_id,
                                        attempt = claim.attempt,
                                        "claim lost; stopping heartbeat"
                                    );
                                    break;
                                }
                                Err(e) => {
                                    warn!(
                                        job_id = %claim.job_id,
                                        attempt = claim.attempt,
                                        error = %e,
                                        "heartbeat renewal failed"
                                    );
                                }
                            }
                        }
                    }
                }
            }
        });

        Self {
            shutdown,
            renewals,
            task: Some(task),
        }
    }

    /// Successful renewals so far.
    pub fn renewals(&self) -> u64 {
        self.renewals.load(Ordering::Relaxed)
    }

    /// Stop renewing and wait for the task to exit.
    ///
    /// A renewal already in flight finishes first, so no renewal can land
    /// after this returns.
    pub async fn stop(mut self) -> u64 {
        self.shutdown.notify_one();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(error = %e, "heartbeat task panicked");
                }
            }
        }
        self.renewals()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
