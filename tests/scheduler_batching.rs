use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fabmon::config::SchedulerConfig;
use fabmon::scheduler::TaskScheduler;
use fabmon::task::batched::{Batch, BatchedCallback};
use fabmon::task::{producer, Callback, CallbackRef, FnCallback, Producer, Task, TaskKey, TaskKind};
use parking_lot::Mutex;

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        recurring_pool_size: 4,
        background_pool_size: 8,
        background_queue_size: 16,
        task_timeout: Duration::from_secs(30),
        shutdown_grace: Duration::from_secs(1),
    }
}

/// Producer that sleeps `latency` and returns its cycle number.
fn cycle_counter(latency: Duration) -> Producer<u64> {
    let cycle = Arc::new(AtomicU64::new(0));
    producer(move || {
        let cycle = Arc::clone(&cycle);
        async move {
            let n = cycle.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(latency).await;
            Ok(n)
        }
    })
}

#[derive(Default)]
struct BatchLog {
    batches: Mutex<Vec<Vec<u64>>>,
}

impl Callback<Batch<u64>> for BatchLog {
    fn on_done(&self, result: Arc<Batch<u64>>) -> anyhow::Result<()> {
        self.batches.lock().push(result.iter().map(|v| **v).collect());
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_source_batches_stay_aligned() {
    let sched = TaskScheduler::new(scheduler_config(), Duration::from_secs(5), None);
    let list = sched.task_list::<u64>("sources");

    let log = Arc::new(BatchLog::default());
    let batch = BatchedCallback::new("a+b", 2, Arc::clone(&log) as CallbackRef<Batch<u64>>)
        .expect("non-empty batch");

    sched
        .schedule_task(
            &list,
            Task::new(TaskKind::Custom(1), TaskKey::Name("a".into()), "fast source"),
            batch.member(0).expect("source a"),
            cycle_counter(Duration::from_secs(1)),
        )
        .expect("schedule a");
    sched
        .schedule_task(
            &list,
            Task::new(TaskKind::Custom(1), TaskKey::Name("b".into()), "slow source"),
            batch.member(1).expect("source b"),
            cycle_counter(Duration::from_secs(6)),
        )
        .expect("schedule b");

    // The slow source finishes once every two cycles; the fast one has to
    // wait for it instead of racing ahead.
    tokio::time::sleep(Duration::from_millis(15_500)).await;
    let early = log.batches.lock().len();
    assert!(early >= 1, "no batch delivered");
    assert!(early <= 3, "too many batches after 15s: {early}");

    tokio::time::sleep(Duration::from_millis(45_000)).await;

    let batches = log.batches.lock().clone();
    assert!(batches.len() >= 3, "too few batches after 60s: {batches:?}");
    assert_eq!(batches[0], vec![1, 1]);
    for b in &batches {
        assert_eq!(b.len(), 2);
        assert_eq!(b[0], b[1], "batch mixes cycles: {batches:?}");
    }
    assert!(
        batches.windows(2).all(|w| w[0][0] < w[1][0]),
        "cycles out of order: {batches:?}"
    );
    assert!(batch.late_arrivals() >= 1);

    sched.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shared_identity_polls_once_and_shares_result() {
    let sched = TaskScheduler::new(scheduler_config(), Duration::from_secs(10), None);
    let list = sched.task_list::<u64>("shared");
    let runs = Arc::new(AtomicUsize::new(0));

    let seen: Arc<Mutex<Vec<Arc<u64>>>> = Arc::new(Mutex::new(Vec::new()));
    let subscriber = |seen: &Arc<Mutex<Vec<Arc<u64>>>>| {
        let seen = Arc::clone(seen);
        FnCallback::new(move |v: Arc<u64>| {
            seen.lock().push(v);
            Ok(())
        })
        .into_ref()
    };

    for _ in 0..2 {
        let runs = Arc::clone(&runs);
        sched
            .schedule_task(
                &list,
                Task::new(TaskKind::PortCounters, TaskKey::Port { lid: 7, port: 1 }, "port 7:1"),
                subscriber(&seen),
                producer(move || {
                    let runs = Arc::clone(&runs);
                    async move { Ok(runs.fetch_add(1, Ordering::SeqCst) as u64) }
                }),
            )
            .expect("schedule");
    }

    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(list.len(), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert!(Arc::ptr_eq(&seen[0], &seen[1]));
    drop(seen);

    sched.shutdown().await;
}
