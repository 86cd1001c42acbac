use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{Reconciler, ReconcileLoop, Requeue, WorkQueue, MAX_RETRIES};

#[tokio::test(start_paused = true)]
async fn test_add_makes_key_ready_immediately() {
    let queue = WorkQueue::new();
    queue.add("a".to_string());

    assert_eq!(queue.next().await, Some("a".to_string()));
    assert!(queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_add_after_honors_delay() {
    let queue: Arc<WorkQueue<String>> = Arc::new(WorkQueue::new());
    queue.add_after("a".to_string(), Duration::from_secs(30));

    let waiter = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.next().await })
    };

    // Not ready before the deadline.
    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(!waiter.is_finished());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(waiter.await.unwrap(), Some("a".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_earliest_deadline_wins_per_key() {
    let queue: WorkQueue<String> = WorkQueue::new();
    queue.add_after("a".to_string(), Duration::from_secs(600));
    queue.add("a".to_string());

    // Deduplicated: one pending entry, ready now.
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.next().await, Some("a".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_later_deadline_does_not_postpone() {
    let queue: WorkQueue<String> = WorkQueue::new();
    queue.add("a".to_string());
    queue.add_after("a".to_string(), Duration::from_secs(600));

    assert_eq!(queue.next().await, Some("a".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_keys_come_out_in_deadline_order() {
    let queue: WorkQueue<&'static str> = WorkQueue::new();
    queue.add_after("slow", Duration::from_secs(10));
    queue.add("fast");

    assert_eq!(queue.next().await, Some("fast"));
    assert_eq!(queue.next().await, Some("slow"));
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_and_caps() {
    let queue: WorkQueue<String> = WorkQueue::with_backoff(
        Duration::from_secs(1),
        Duration::from_secs(60),
    );
    let key = "a".to_string();

    for expected_attempt in 1..=8 {
        assert_eq!(queue.requeue_backoff(&key), expected_attempt);
        // Drain so the next requeue schedules fresh.
        assert_eq!(queue.next().await, Some(key.clone()));
    }
    assert_eq!(queue.retries(&key), 8);

    queue.forget(&key);
    assert_eq!(queue.retries(&key), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_unblocks_waiters() {
    let queue: Arc<WorkQueue<String>> = Arc::new(WorkQueue::new());

    let waiter = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.next().await })
    };
    tokio::task::yield_now().await;

    queue.shut_down();
    assert_eq!(waiter.await.unwrap(), None);

    // Adds after shutdown are discarded.
    queue.add("late".to_string());
    assert_eq!(queue.next().await, None);
}

struct CountingReconciler {
    calls: Arc<AtomicU32>,
    verdict: fn(u32) -> anyhow::Result<Requeue>,
}

#[async_trait]
impl Reconciler for CountingReconciler {
    type Key = String;

    async fn reconcile(&self, _key: &String) -> anyhow::Result<Requeue> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        (self.verdict)(call)
    }
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_loop_requeues_after_delay() {
    let queue = Arc::new(WorkQueue::new());
    let calls = Arc::new(AtomicU32::new(0));
    let reconciler = CountingReconciler {
        calls: calls.clone(),
        verdict: |call| {
            if call < 3 {
                Ok(Requeue::After(Duration::from_secs(5)))
            } else {
                Ok(Requeue::Forget)
            }
        },
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    queue.add("a".to_string());
    let handle = tokio::spawn(ReconcileLoop::new(queue.clone(), reconciler).run(shutdown_rx));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_loop_drops_key_after_retry_ceiling() {
    let queue = Arc::new(WorkQueue::with_backoff(
        Duration::from_millis(1),
        Duration::from_millis(1),
    ));
    let calls = Arc::new(AtomicU32::new(0));
    let reconciler = CountingReconciler {
        calls: calls.clone(),
        verdict: |_| anyhow::bail!("boom"),
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    queue.add("a".to_string());
    let handle = tokio::spawn(ReconcileLoop::new(queue.clone(), reconciler).run(shutdown_rx));

    tokio::time::sleep(Duration::from_secs(60)).await;
    // First attempt plus MAX_RETRIES backoff attempts, then dropped.
    assert_eq!(calls.load(Ordering::SeqCst), MAX_RETRIES + 1);
    assert!(queue.is_empty());

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_retry_counter() {
    let queue: WorkQueue<String> = WorkQueue::new();
    let key = "a".to_string();

    queue.requeue_backoff(&key);
    queue.requeue_backoff(&key);
    assert_eq!(queue.retries(&key), 2);

    queue.forget(&key);
    assert_eq!(queue.retries(&key), 0);
}
