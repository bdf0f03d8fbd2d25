//! End-to-end queue behavior against the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use ingestq_core::{JobStatus, JobType, NewJob, ProgressScope, STALE_REQUEUED_ERROR};
use ingestq_infra::jobs::{
    Claimer, HandlerError, HandlerRegistry, InMemoryJobStore, JobQueue, JobStore, QueueConfig,
    StaleRecovery,
};
use proptest::prelude::*;
use serde_json::json;

type MemQueue = JobQueue<Arc<InMemoryJobStore>>;

fn queue_with(registry: HandlerRegistry) -> MemQueue {
    JobQueue::new(Arc::new(InMemoryJobStore::new()), registry, QueueConfig::default()).unwrap()
}

/// Handler for `url_ingest` that fails until it has been called `succeed_on`
/// times. `None` never succeeds.
fn flaky(succeed_on: Option<u32>) -> (HandlerRegistry, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register_fn(JobType::url_ingest(), {
        let calls = calls.clone();
        move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                match succeed_on {
                    Some(k) if n >= k => Ok(()),
                    _ => Err(HandlerError::failed(format!("fetch failed on call {n}"))),
                }
            }
        }
    });
    (registry, calls)
}

fn url_job(max_attempts: u32) -> NewJob {
    NewJob::new(JobType::url_ingest(), json!({"url": "https://example.com/report.pdf"}))
        .with_max_attempts(max_attempts)
}

#[tokio::test]
async fn always_failing_job_fails_after_max_attempts() {
    let (registry, calls) = flaky(None);
    let queue = queue_with(registry);
    let id = queue.enqueue(url_job(3)).await.unwrap();

    for tick in 1..=3u32 {
        let report = queue.tick().await;
        assert_eq!(report.claimed, 1, "tick {tick}");
        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, tick);
        let expected = if tick < 3 { JobStatus::Pending } else { JobStatus::Failed };
        assert_eq!(job.status, expected, "tick {tick}");
    }

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_error.as_deref(), Some("fetch failed on call 3"));
    assert!(job.completed_at.is_some());

    assert_eq!(queue.tick().await.claimed, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn job_succeeding_on_second_attempt_completes() {
    let (registry, _calls) = flaky(Some(2));
    let queue = queue_with(registry);
    let id = queue.enqueue(url_job(3)).await.unwrap();

    assert_eq!(queue.tick().await.requeued, 1);
    assert_eq!(queue.tick().await.completed, 1);

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);
    assert!(job.heartbeat_at.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_claims_split_the_queue() {
    let store = Arc::new(InMemoryJobStore::new());
    let queue = JobQueue::new(store.clone(), HandlerRegistry::new(), QueueConfig::default()).unwrap();
    for _ in 0..8 {
        queue.enqueue(url_job(3)).await.unwrap();
    }

    let a = Claimer::new(store.clone(), 5);
    let b = Claimer::new(store.clone(), 5);
    let (left, right) = tokio::join!(a.claim(), b.claim());
    let (left, right) = (left.unwrap(), right.unwrap());

    let ids: HashSet<_> = left.iter().chain(right.iter()).map(|j| j.id).collect();
    assert_eq!(left.len() + right.len(), 8);
    assert_eq!(ids.len(), 8);

    let progress = queue.get_progress(&ProgressScope::default()).await.unwrap();
    assert_eq!(progress.pending, 0);
    assert_eq!(progress.processing, 8);
}

#[tokio::test]
async fn crashed_worker_job_is_recovered() {
    let store = Arc::new(InMemoryJobStore::new());
    let queue = JobQueue::new(store.clone(), HandlerRegistry::new(), QueueConfig::default()).unwrap();
    let id = queue.enqueue(url_job(3)).await.unwrap();

    // Claim and walk away without running or heartbeating.
    let claimed = Claimer::new(store.clone(), 1).claim().await.unwrap();
    assert_eq!(claimed[0].attempts, 1);

    let recovery = StaleRecovery::new(store.clone(), Duration::from_millis(20));
    assert!(recovery.recover_stale().await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let report = recovery.recover_stale().await.unwrap();
    assert_eq!(report.requeued, vec![id]);

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some(STALE_REQUEUED_ERROR));

    assert!(recovery.recover_stale().await.unwrap().is_empty());
}

#[tokio::test]
async fn unregistered_type_fails_on_first_claim() {
    let (registry, _calls) = flaky(Some(1));
    let queue = queue_with(registry);
    let id = queue
        .enqueue(
            NewJob::new(JobType::new("audio_transcribe").unwrap(), json!({"file": "a.mp3"}))
                .with_max_attempts(5),
        )
        .await
        .unwrap();

    let report = queue.tick().await;
    assert_eq!(report.claimed, 1);
    assert_eq!(report.failed, 1);

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.unwrap().contains("audio_transcribe"));

    assert_eq!(queue.tick().await.claimed, 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// With periodic ticking every job ends up terminal, and a job fails
    /// exactly when its attempts reach `max_attempts`.
    #[test]
    fn every_job_reaches_a_terminal_state(
        jobs in prop::collection::vec((1u32..5, prop::option::of(1u32..6)), 1..12)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut registry = HandlerRegistry::new();
            let attempts_needed: Arc<std::collections::HashMap<String, Option<u32>>> = Arc::new(
                jobs.iter()
                    .enumerate()
                    .map(|(i, (_, succeed_on))| (i.to_string(), *succeed_on))
                    .collect(),
            );
            registry.register_fn(JobType::url_ingest(), {
                let attempts_needed = attempts_needed.clone();
                move |inv| {
                    let key = inv.payload["key"].as_str().unwrap_or_default().to_string();
                    let needed = attempts_needed.get(&key).copied().flatten();
                    async move {
                        match needed {
                            Some(k) if inv.attempt >= k => Ok(()),
                            _ => Err(HandlerError::failed("not yet")),
                        }
                    }
                }
            });
            let queue = queue_with(registry);

            let mut ids = Vec::new();
            for (i, (max_attempts, _)) in jobs.iter().enumerate() {
                let job = NewJob::new(JobType::url_ingest(), json!({ "key": i.to_string() }))
                    .with_max_attempts(*max_attempts);
                ids.push(queue.enqueue(job).await.unwrap());
            }

            let bound = jobs.len() * 5 + 1;
            for _ in 0..bound {
                if queue.get_progress(&ProgressScope::default()).await.unwrap().is_finished() {
                    break;
                }
                queue.tick().await;
            }
            prop_assert!(queue.get_progress(&ProgressScope::default()).await.unwrap().is_finished());

            for (id, (max_attempts, succeed_on)) in ids.iter().zip(&jobs) {
                let job = queue.get(*id).await.unwrap().unwrap();
                match succeed_on {
                    Some(k) if k <= max_attempts => {
                        prop_assert_eq!(job.status, JobStatus::Completed);
                        prop_assert_eq!(job.attempts, *k);
                    }
                    _ => {
                        prop_assert_eq!(job.status, JobStatus::Failed);
                        prop_assert_eq!(job.attempts, *max_attempts);
                    }
                }
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}

#[tokio::test]
async fn store_is_shared_between_queues() {
    let store = Arc::new(InMemoryJobStore::new());
    let (registry, _) = flaky(Some(1));
    let producer = JobQueue::new(store.clone(), HandlerRegistry::new(), QueueConfig::default()).unwrap();
    let worker = JobQueue::new(store.clone(), registry, QueueConfig::default()).unwrap();

    let id = producer.enqueue(url_job(3)).await.unwrap();
    assert_eq!(worker.tick().await.completed, 1);
    assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Completed);
}
