use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::export::health::HealthMetrics;

/// Cancellable handle to one fixed-rate timer.
#[derive(Debug, Clone)]
pub struct ScheduleHandle {
    token: CancellationToken,
    pool: u64,
}

impl ScheduleHandle {
    /// Stops future ticks. An execution already running is left to finish.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Id of the pool this timer runs on.
    pub fn pool_id(&self) -> u64 {
        self.pool
    }
}

/// Pool driving recurring fixed-rate timers at one period.
///
/// Every timer is a spawned loop; a semaphore bounds how many of them run
/// their job at the same time. `stop` prevents further ticks, `kill` aborts
/// jobs still running once the shutdown grace period has elapsed.
pub struct ExecutionPool {
    id: u64,
    period: Duration,
    tracker: TaskTracker,
    stop: CancellationToken,
    kill: CancellationToken,
    permits: Arc<Semaphore>,
}

impl fmt::Debug for ExecutionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionPool")
            .field("id", &self.id)
            .field("period", &self.period)
            .field("timers", &self.tracker.len())
            .finish()
    }
}

impl ExecutionPool {
    pub fn new(id: u64, period: Duration, size: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            period,
            tracker: TaskTracker::new(),
            stop: CancellationToken::new(),
            kill: CancellationToken::new(),
            permits: Arc::new(Semaphore::new(size.max(1))),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Number of timer loops still alive on this pool.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Runs `job` immediately and then once per period until the handle is
    /// cancelled, the pool stops, or `job` resolves to `false`.
    pub fn schedule_at_fixed_rate<F, Fut>(&self, name: String, mut job: F) -> ScheduleHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let token = self.stop.child_token();
        let handle = ScheduleHandle {
            token: token.clone(),
            pool: self.id,
        };

        let kill = self.kill.clone();
        let permits = Arc::clone(&self.permits);
        let period = self.period;
        let pool = self.id;

        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let permit = tokio::select! {
                    _ = token.cancelled() => break,
                    p = Arc::clone(&permits).acquire_owned() => p,
                };
                let Ok(_permit) = permit else {
                    break;
                };

                let keep_going = tokio::select! {
                    _ = kill.cancelled() => {
                        warn!(timer = %name, pool, "execution aborted by pool shutdown");
                        break;
                    }
                    keep = job() => keep,
                };

                if !keep_going {
                    token.cancel();
                    break;
                }
            }

            debug!(timer = %name, pool, "timer stopped");
        });

        handle
    }

    /// Stops all timers, waits up to `grace` for running jobs, then aborts them.
    pub async fn shutdown(&self, grace: Duration) {
        self.tracker.close();
        self.stop.cancel();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                pool = self.id,
                remaining = self.tracker.len(),
                "pool did not drain within grace period, aborting",
            );
            self.kill.cancel();
            self.tracker.wait().await;
        }

        debug!(pool = self.id, "execution pool drained");
    }
}

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Bounded pool for one-shot background work.
///
/// Submissions land in a fixed-size queue; a dispatcher hands them to
/// workers bounded by a semaphore. A full queue rejects the submission.
pub struct BackgroundPool {
    tx: mpsc::Sender<(String, Job)>,
    tracker: TaskTracker,
    stop: CancellationToken,
    kill: CancellationToken,
    size: usize,
    metrics: Option<Arc<HealthMetrics>>,
}

impl fmt::Debug for BackgroundPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundPool")
            .field("size", &self.size)
            .field("queued", &(self.tx.max_capacity() - self.tx.capacity()))
            .finish()
    }
}

impl BackgroundPool {
    pub fn new(size: usize, queue_size: usize, metrics: Option<Arc<HealthMetrics>>) -> Self {
        let size = size.max(1);
        let (tx, mut rx) = mpsc::channel::<(String, Job)>(queue_size.max(1));
        let tracker = TaskTracker::new();
        let stop = CancellationToken::new();
        let kill = CancellationToken::new();
        let permits = Arc::new(Semaphore::new(size));

        let workers = tracker.clone();
        let stop_rx = stop.clone();
        let kill_rx = kill.clone();

        tracker.spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = stop_rx.cancelled() => None,
                    job = rx.recv() => job,
                };
                let Some((name, job)) = next else {
                    break;
                };
                spawn_job(&workers, &permits, &kill_rx, name, job).await;
            }

            // Work accepted before shutdown still runs.
            rx.close();
            while let Some((name, job)) = rx.recv().await {
                spawn_job(&workers, &permits, &kill_rx, name, job).await;
            }
        });

        Self {
            tx,
            tracker,
            stop,
            kill,
            size,
            metrics,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues `job`. Returns false if the queue is full or the pool is shut down.
    pub fn submit<F>(&self, name: impl Into<String>, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        if self.stop.is_cancelled() {
            debug!(job = %name, "background pool shut down, job dropped");
            return false;
        }

        match self.tx.try_send((name, Box::pin(job))) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full((name, _))) => {
                warn!(job = %name, "background queue full, rejecting job");
                if let Some(m) = &self.metrics {
                    m.background_rejected.inc();
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed((name, _))) => {
                debug!(job = %name, "background pool closed, job dropped");
                false
            }
        }
    }

    /// Stops accepting work, runs what is queued, and aborts whatever is
    /// still running after `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.stop.cancel();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!("background pool did not drain within grace period, aborting");
            self.kill.cancel();
            self.tracker.wait().await;
        }
    }
}

async fn spawn_job(
    workers: &TaskTracker,
    permits: &Arc<Semaphore>,
    kill: &CancellationToken,
    name: String,
    job: Job,
) {
    let permit = tokio::select! {
        _ = kill.cancelled() => return,
        p = Arc::clone(permits).acquire_owned() => p,
    };
    let Ok(permit) = permit else {
        return;
    };

    let kill = kill.clone();
    workers.spawn(async move {
        let _permit = permit;
        tokio::select! {
            _ = kill.cancelled() => warn!(job = %name, "background job aborted"),
            _ = job => debug!(job = %name, "background job finished"),
        }
    });
}
