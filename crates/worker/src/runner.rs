//! The periodic tick loop.

use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::info;

use ingestq_infra::jobs::{JobQueue, JobStore};

/// Tick `queue` every `period` until `shutdown` resolves.
///
/// Ticks never overlap within this loop: a tick that overruns its period
/// delays the next one rather than stacking up. A tick in progress when
/// `shutdown` fires runs to completion first. Returns the number of ticks run.
pub async fn run_until<S, F>(queue: &JobQueue<S>, period: Duration, shutdown: F) -> u64
where
    S: JobStore + Clone + 'static,
    F: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    let mut ticks = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!(ticks, "shutdown requested; leaving tick loop");
                break;
            }
            _ = ticker.tick() => {
                queue.tick().await;
                ticks += 1;
            }
        }
    }
    ticks
}
