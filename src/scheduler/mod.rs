//! Periodic task scheduler.
//!
//! Tasks live in [`TaskList`] registries, one per subscriber. Each
//! registered task owns one fixed-rate timer on the current
//! [`ExecutionPool`]. Changing the refresh rate replaces the pool: every
//! list re-registers its tasks on the new pool and the old one is drained
//! in the background.

pub mod pool;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{ErrorClass, FetchError, SchedulerError};
use crate::export::health::HealthMetrics;
use crate::task::{CallbackRef, Producer, Task, TaskId};

use self::pool::{BackgroundPool, ExecutionPool, ScheduleHandle};

/// Receives each task stopped by an unrecoverable error, once per stop.
pub type FatalSink = Arc<dyn Fn(&TaskId, &FetchError) + Send + Sync>;

type RateListener = Box<dyn Fn(Duration) + Send + Sync>;

/// Observable lifecycle of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Rescheduling,
    ShuttingDown,
}

/// Everything a timer loop needs to execute a task.
struct ExecContext {
    task_timeout: Duration,
    fatal: Mutex<Option<FatalSink>>,
    metrics: Option<Arc<HealthMetrics>>,
}

impl ExecContext {
    fn report_fatal(&self, id: &TaskId, err: &FetchError) {
        if let Some(m) = &self.metrics {
            m.fatal_task_stops.inc();
        }
        let sink = self.fatal.lock().clone();
        if let Some(sink) = sink {
            sink(id, err);
        }
    }
}

/// A registry the scheduler can move between pools.
trait Reschedulable: Send + Sync {
    fn name(&self) -> &str;
    fn len(&self) -> usize;
    /// Cancels every timer and restarts it on `pool`, atomically per list.
    fn move_to(&self, ctx: &Arc<ExecContext>, pool: &ExecutionPool);
    fn cancel_all(&self);
}

/// Registry of same-kind tasks sharing registration and rescheduling.
pub struct TaskList<R> {
    name: String,
    tasks: Mutex<Vec<Arc<Task<R>>>>,
}

impl<R> fmt::Debug for TaskList<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskList")
            .field("name", &self.name)
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}

impl<R: Send + Sync + 'static> TaskList<R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    pub fn get(&self, id: &TaskId) -> Option<Arc<Task<R>>> {
        self.tasks.lock().iter().find(|t| t.id() == id).cloned()
    }

    pub fn tasks(&self) -> Vec<Arc<Task<R>>> {
        self.tasks.lock().clone()
    }
}

impl<R: Send + Sync + 'static> Reschedulable for TaskList<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    fn move_to(&self, ctx: &Arc<ExecContext>, pool: &ExecutionPool) {
        let tasks = self.tasks.lock();
        for task in tasks.iter() {
            if let Some(old) = task.replace_handle(None) {
                old.cancel();
            }
            task.reset_callbacks();
        }
        for task in tasks.iter() {
            let handle = start_timer(ctx, pool, task);
            task.replace_handle(Some(handle));
        }
    }

    fn cancel_all(&self) {
        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            if let Some(handle) = task.replace_handle(None) {
                handle.cancel();
            }
        }
    }
}

/// Owns the recurring and background pools and every task registry.
pub struct TaskScheduler {
    cfg: SchedulerConfig,
    ctx: Arc<ExecContext>,
    pool: ArcSwap<ExecutionPool>,
    background: BackgroundPool,
    lists: Mutex<Vec<Weak<dyn Reschedulable>>>,
    rate_listeners: Mutex<Vec<RateListener>>,
    reschedule: tokio::sync::Mutex<()>,
    rescheduling: AtomicBool,
    shutting_down: AtomicBool,
    next_pool_id: AtomicU64,
    drains: TaskTracker,
    metrics: Option<Arc<HealthMetrics>>,
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("refresh_rate", &self.refresh_rate())
            .field("state", &self.state())
            .finish()
    }
}

impl TaskScheduler {
    /// Creates a scheduler polling at `refresh_rate`. Must be called from
    /// within a tokio runtime.
    pub fn new(
        cfg: SchedulerConfig,
        refresh_rate: Duration,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let background = BackgroundPool::new(
            cfg.background_pool_size,
            cfg.background_queue_size,
            metrics.clone(),
        );
        let pool = ExecutionPool::new(1, refresh_rate, cfg.recurring_pool_size);

        if let Some(m) = &metrics {
            m.refresh_rate_seconds.set(refresh_rate.as_secs_f64());
        }

        info!(
            refresh_rate = ?refresh_rate,
            recurring = cfg.recurring_pool_size,
            background = cfg.background_pool_size,
            "task scheduler created",
        );

        Self {
            ctx: Arc::new(ExecContext {
                task_timeout: cfg.task_timeout,
                fatal: Mutex::new(None),
                metrics: metrics.clone(),
            }),
            cfg,
            pool: ArcSwap::new(pool),
            background,
            lists: Mutex::new(Vec::new()),
            rate_listeners: Mutex::new(Vec::new()),
            reschedule: tokio::sync::Mutex::new(()),
            rescheduling: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            next_pool_id: AtomicU64::new(2),
            drains: TaskTracker::new(),
            metrics,
        }
    }

    /// Creates an empty registry whose tasks follow refresh-rate changes.
    pub fn task_list<R: Send + Sync + 'static>(&self, name: impl Into<String>) -> Arc<TaskList<R>> {
        let list = Arc::new(TaskList {
            name: name.into(),
            tasks: Mutex::new(Vec::new()),
        });
        let weak: Weak<dyn Reschedulable> = Arc::downgrade(&list) as Weak<dyn Reschedulable>;
        let mut lists = self.lists.lock();
        lists.retain(|l| l.strong_count() > 0);
        lists.push(weak);
        list
    }

    /// Subscribes `callback` to the task identified by `task`.
    ///
    /// If `list` already holds a task with the same identity the callback is
    /// attached to it, `producer` is dropped and the existing task returned.
    /// Otherwise the task is stored with `producer` and its timer started.
    pub fn schedule_task<R: Send + Sync + 'static>(
        &self,
        list: &TaskList<R>,
        task: Task<R>,
        callback: CallbackRef<R>,
        producer: Producer<R>,
    ) -> Result<Arc<Task<R>>, SchedulerError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }

        let mut tasks = list.tasks.lock();
        if let Some(existing) = tasks.iter().find(|t| t.id() == task.id()) {
            existing.add_callback(callback);
            debug!(
                task = %existing.id(),
                callbacks = existing.callback_count(),
                "attached callback to existing task",
            );
            return Ok(Arc::clone(existing));
        }

        let task = Arc::new(task);
        task.set_producer(producer);
        task.add_callback(callback);

        let pool = self.pool.load_full();
        let handle = start_timer(&self.ctx, &pool, &task);
        task.replace_handle(Some(handle));
        tasks.push(Arc::clone(&task));

        if let Some(m) = &self.metrics {
            m.tasks_registered
                .with_label_values(&[task.id().kind.as_str()])
                .inc();
        }
        debug!(task = %task.id(), list = %list.name, "task scheduled");

        Ok(task)
    }

    /// Detaches `callback` from the task `id`. When no callbacks remain the
    /// timer is cancelled and the task dropped from `list`. Returns false if
    /// the task or the callback was not registered.
    pub fn remove_task<R: Send + Sync + 'static>(
        &self,
        list: &TaskList<R>,
        id: &TaskId,
        callback: &CallbackRef<R>,
    ) -> bool {
        let mut tasks = list.tasks.lock();
        let Some(pos) = tasks.iter().position(|t| t.id() == id) else {
            return false;
        };
        if !tasks[pos].remove_callback(callback) {
            return false;
        }

        if !tasks[pos].has_callbacks() {
            let task = tasks.remove(pos);
            if let Some(handle) = task.replace_handle(None) {
                handle.cancel();
            }
            if let Some(m) = &self.metrics {
                m.tasks_registered
                    .with_label_values(&[task.id().kind.as_str()])
                    .dec();
            }
            debug!(task = %task.id(), list = %list.name, "task removed");
        }

        true
    }

    pub fn refresh_rate(&self) -> Duration {
        self.pool.load().period()
    }

    /// Moves every registered task onto a new pool ticking at `rate`.
    ///
    /// Each list cancels its timers and restarts them on the new pool while
    /// holding its lock; the per-task run lock keeps an execution still
    /// running on the old pool from overlapping the first new tick. The old
    /// pool is drained in the background.
    pub async fn update_refresh_rate(&self, rate: Duration) -> Result<(), SchedulerError> {
        let _guard = self.reschedule.lock().await;

        if self.shutting_down.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }
        if rate.is_zero() {
            warn!("refresh rate must be positive, keeping current rate");
            return Ok(());
        }
        if rate == self.refresh_rate() {
            debug!(refresh_rate = ?rate, "refresh rate unchanged");
            return Ok(());
        }

        self.rescheduling.store(true, Ordering::Release);

        let id = self.next_pool_id.fetch_add(1, Ordering::Relaxed);
        let new_pool = ExecutionPool::new(id, rate, self.cfg.recurring_pool_size);
        let old_pool = self.pool.swap(Arc::clone(&new_pool));
        let previous = old_pool.period();

        let lists = self.live_lists();
        let mut moved = 0;
        for list in &lists {
            list.move_to(&self.ctx, &new_pool);
            moved += list.len();
            debug!(list = list.name(), "list rescheduled");
        }

        for listener in self.rate_listeners.lock().iter() {
            listener(rate);
        }

        if let Some(m) = &self.metrics {
            m.refresh_rate_seconds.set(rate.as_secs_f64());
            m.reschedules.inc();
        }

        let grace = self.cfg.shutdown_grace;
        self.drains.spawn(async move {
            old_pool.shutdown(grace).await;
        });

        self.rescheduling.store(false, Ordering::Release);

        info!(
            refresh_rate = ?rate,
            previous = ?previous,
            tasks = moved,
            pool = id,
            "refresh rate updated",
        );

        Ok(())
    }

    /// Registers a listener notified after every refresh-rate change.
    pub fn on_refresh_rate_changed(&self, listener: impl Fn(Duration) + Send + Sync + 'static) {
        self.rate_listeners.lock().push(Box::new(listener));
    }

    /// Installs the sink notified when a task stops on an unrecoverable error.
    pub fn set_fatal_sink(&self, sink: FatalSink) {
        *self.ctx.fatal.lock() = Some(sink);
    }

    /// Queues one-shot work on the background pool.
    pub fn submit_background<F>(&self, name: impl Into<String>, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.background.submit(name, job)
    }

    pub fn background(&self) -> &BackgroundPool {
        &self.background
    }

    /// Total number of tasks across all registries.
    pub fn task_count(&self) -> usize {
        self.live_lists().iter().map(|l| l.len()).sum()
    }

    pub fn state(&self) -> SchedulerState {
        if self.shutting_down.load(Ordering::Acquire) {
            SchedulerState::ShuttingDown
        } else if self.rescheduling.load(Ordering::Acquire) {
            SchedulerState::Rescheduling
        } else if self.task_count() > 0 {
            SchedulerState::Running
        } else {
            SchedulerState::Idle
        }
    }

    /// Cancels every task, then drains both pools within the grace period.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = self.reschedule.lock().await;

        for list in self.live_lists() {
            list.cancel_all();
        }

        let grace = self.cfg.shutdown_grace;
        self.pool.load_full().shutdown(grace).await;

        self.drains.close();
        self.drains.wait().await;

        self.background.shutdown(grace).await;

        info!("task scheduler stopped");
    }

    fn live_lists(&self) -> Vec<Arc<dyn Reschedulable>> {
        let mut lists = self.lists.lock();
        lists.retain(|l| l.strong_count() > 0);
        lists.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Starts `task`'s fixed-rate timer on `pool`.
fn start_timer<R: Send + Sync + 'static>(
    ctx: &Arc<ExecContext>,
    pool: &ExecutionPool,
    task: &Arc<Task<R>>,
) -> ScheduleHandle {
    let weak = Arc::downgrade(task);
    let ctx = Arc::clone(ctx);

    pool.schedule_at_fixed_rate(task.id().to_string(), move || {
        let task = weak.upgrade();
        let ctx = Arc::clone(&ctx);
        async move {
            match task {
                Some(task) => run_once(&ctx, &task).await,
                None => false,
            }
        }
    })
}

/// Executes one cycle of `task`. Returns false when the task must stop.
async fn run_once<R: Send + Sync + 'static>(ctx: &ExecContext, task: &Task<R>) -> bool {
    let _run = task.lock_run().await;

    if !task.has_callbacks() {
        return true;
    }
    let Some(producer) = task.producer() else {
        return false;
    };

    let kind = task.id().kind.as_str();
    let start = Instant::now();
    let outcome = match tokio::time::timeout(ctx.task_timeout, producer()).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout {
            after: ctx.task_timeout,
        }),
    };

    if let Some(m) = &ctx.metrics {
        m.producer_runs.with_label_values(&[kind]).inc();
        m.producer_duration
            .with_label_values(&[kind])
            .observe(start.elapsed().as_secs_f64());
    }

    match outcome {
        Ok(value) => {
            let failures = task.on_done(Arc::new(value));
            if failures > 0 {
                if let Some(m) = &ctx.metrics {
                    m.callback_failures.inc_by(failures as f64);
                }
            }
            true
        }
        Err(err) => {
            let class = err.class();
            if let Some(m) = &ctx.metrics {
                m.producer_errors
                    .with_label_values(&[kind, class.as_str()])
                    .inc();
            }
            task.on_error(&err);

            match class {
                ErrorClass::Cancelled => {
                    debug!(task = %task.id(), "request cancelled");
                    true
                }
                ErrorClass::Recoverable => {
                    warn!(task = %task.id(), error = %err, "task failed, retrying next cycle");
                    true
                }
                ErrorClass::Unrecoverable => {
                    error!(task = %task.id(), error = %err, "task stopped on unrecoverable error");
                    ctx.report_fatal(task.id(), &err);
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::task::tests::Recorder;
    use crate::task::{producer, TaskKey, TaskKind};

    fn cfg() -> SchedulerConfig {
        SchedulerConfig {
            recurring_pool_size: 2,
            background_pool_size: 4,
            background_queue_size: 8,
            task_timeout: Duration::from_secs(3),
            shutdown_grace: Duration::from_secs(1),
        }
    }

    fn counting(runs: &Arc<AtomicUsize>, value: u32) -> Producer<u32> {
        let runs = Arc::clone(runs);
        producer(move || {
            let runs = Arc::clone(&runs);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            }
        })
    }

    fn task(key: u64) -> Task<u32> {
        Task::new(TaskKind::Custom(1), TaskKey::Number(key), "test")
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_identity_shares_one_timer() {
        let sched = TaskScheduler::new(cfg(), Duration::from_secs(10), None);
        let list = sched.task_list::<u32>("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        let runs = Arc::new(AtomicUsize::new(0));

        let a = sched
            .schedule_task(&list, task(1), Arc::new(Recorder::new("a", &log)), counting(&runs, 5))
            .expect("scheduled");
        let b = sched
            .schedule_task(&list, task(1), Arc::new(Recorder::new("b", &log)), counting(&runs, 9))
            .expect("scheduled");

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(list.len(), 1);
        assert_eq!(a.callback_count(), 2);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let log = log.lock();
        assert_eq!(log.iter().filter(|l| *l == "a:done:5").count(), 2);
        assert_eq!(log.iter().filter(|l| *l == "b:done:5").count(), 2);
        assert!(!log.iter().any(|l| l.ends_with(":9")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_last_callback_stops_timer() {
        let sched = TaskScheduler::new(cfg(), Duration::from_secs(10), None);
        let list = sched.task_list::<u32>("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        let runs = Arc::new(AtomicUsize::new(0));

        let a: CallbackRef<u32> = Arc::new(Recorder::new("a", &log));
        let b: CallbackRef<u32> = Arc::new(Recorder::new("b", &log));
        let t = sched
            .schedule_task(&list, task(1), Arc::clone(&a), counting(&runs, 1))
            .expect("scheduled");
        sched
            .schedule_task(&list, task(1), Arc::clone(&b), counting(&runs, 1))
            .expect("scheduled");
        assert_eq!(sched.state(), SchedulerState::Running);

        assert!(sched.remove_task(&list, t.id(), &a));
        assert!(t.is_scheduled());
        assert!(sched.remove_task(&list, t.id(), &b));
        assert!(!sched.remove_task(&list, t.id(), &b));
        assert!(list.is_empty());
        assert_eq!(sched.state(), SchedulerState::Idle);

        let before = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(runs.load(Ordering::SeqCst), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_rate_hand_off() {
        let sched = TaskScheduler::new(cfg(), Duration::from_secs(10), None);
        let list = sched.task_list::<u32>("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        let runs = Arc::new(AtomicUsize::new(0));
        let notified = Arc::new(Mutex::new(Vec::new()));

        let n = Arc::clone(&notified);
        sched.on_refresh_rate_changed(move |rate| n.lock().push(rate));

        sched
            .schedule_task(&list, task(1), Arc::new(Recorder::new("a", &log)), counting(&runs, 1))
            .expect("scheduled");

        // t=0 run on the first pool.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        sched
            .update_refresh_rate(Duration::from_secs(2))
            .await
            .expect("rescheduled");
        assert_eq!(sched.refresh_rate(), Duration::from_secs(2));
        assert_eq!(*notified.lock(), vec![Duration::from_secs(2)]);

        // New pool ticks at t=5, 7 and 9; the old t=10 tick never fires.
        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 4);

        assert!(list.tasks()[0].is_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecoverable_error_stops_only_that_task() {
        let sched = TaskScheduler::new(cfg(), Duration::from_secs(1), None);
        let list = sched.task_list::<u32>("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        let fatal = Arc::new(Mutex::new(Vec::new()));

        let f = Arc::clone(&fatal);
        sched.set_fatal_sink(Arc::new(move |id: &TaskId, err: &FetchError| {
            f.lock().push((id.clone(), err.kind_str()));
        }));

        let io_runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&io_runs);
        let failing = producer(move || {
            let r = Arc::clone(&r);
            async move {
                r.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>(FetchError::Io("connection refused".into()))
            }
        });
        let healthy_runs = Arc::new(AtomicUsize::new(0));

        let bad = sched
            .schedule_task(&list, task(1), Arc::new(Recorder::new("bad", &log)), failing)
            .expect("scheduled");
        sched
            .schedule_task(
                &list,
                task(2),
                Arc::new(Recorder::new("good", &log)),
                counting(&healthy_runs, 3),
            )
            .expect("scheduled");

        tokio::time::sleep(Duration::from_millis(4500)).await;

        assert_eq!(io_runs.load(Ordering::SeqCst), 1);
        assert_eq!(healthy_runs.load(Ordering::SeqCst), 5);
        assert!(!bad.is_scheduled());
        assert_eq!(fatal.lock().len(), 1);
        assert_eq!(fatal.lock()[0].1, "io");
        assert!(log.lock().contains(&"bad:error:io".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recoverable_error_keeps_running() {
        let sched = TaskScheduler::new(cfg(), Duration::from_secs(1), None);
        let list = sched.task_list::<u32>("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        let slow = producer(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1u32)
        });
        sched
            .schedule_task(&list, task(1), Arc::new(Recorder::new("a", &log)), slow)
            .expect("scheduled");

        tokio::time::sleep(Duration::from_secs(8)).await;

        let timeouts = log.lock().iter().filter(|l| *l == "a:error:timeout").count();
        assert!(timeouts >= 2, "expected repeated timeouts, got {timeouts}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_error_propagates_unchanged() {
        let sched = TaskScheduler::new(cfg(), Duration::from_secs(10), None);
        let list = sched.task_list::<u32>("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        let cancelled = producer(|| async { Err::<u32, _>(FetchError::Cancelled) });
        let t = sched
            .schedule_task(&list, task(1), Arc::new(Recorder::new("a", &log)), cancelled)
            .expect("scheduled");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*log.lock(), vec!["a:error:cancelled", "a:finally"]);
        assert!(t.is_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_registration() {
        let sched = TaskScheduler::new(cfg(), Duration::from_secs(10), None);
        let list = sched.task_list::<u32>("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        let runs = Arc::new(AtomicUsize::new(0));

        sched
            .schedule_task(&list, task(1), Arc::new(Recorder::new("a", &log)), counting(&runs, 1))
            .expect("scheduled");
        sched.shutdown().await;

        assert_eq!(sched.state(), SchedulerState::ShuttingDown);
        assert!(list.is_empty());
        let err = sched
            .schedule_task(&list, task(2), Arc::new(Recorder::new("b", &log)), counting(&runs, 1))
            .unwrap_err();
        assert_eq!(err, SchedulerError::ShutDown);
        assert_eq!(
            sched.update_refresh_rate(Duration::from_secs(1)).await,
            Err(SchedulerError::ShutDown)
        );
    }
}
