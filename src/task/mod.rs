//! Recurring metric tasks and the callbacks interested in their results.
//!
//! A [`Task`] is identified by a `(kind, key)` pair. It owns the producer
//! that fetches one result per cycle and an ordered list of callbacks that
//! receive that result. Fan-out is synchronous and strictly in registration
//! order; a failing callback never prevents delivery to the ones after it.

pub mod batched;
pub mod single;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::FetchError;
use crate::scheduler::pool::ScheduleHandle;

/// Category of metric a task polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKind {
    ImageInfo,
    GroupList,
    GroupInfo,
    VfList,
    VfInfo,
    PortCounters,
    Notices,
    /// Collaborator-defined kind.
    Custom(u32),
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImageInfo => "image_info",
            Self::GroupList => "group_list",
            Self::GroupInfo => "group_info",
            Self::VfList => "vf_list",
            Self::VfInfo => "vf_info",
            Self::PortCounters => "port_counters",
            Self::Notices => "notices",
            Self::Custom(_) => "custom",
        }
    }
}

/// Key distinguishing tasks of the same kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKey {
    None,
    Name(String),
    Port { lid: u32, port: u8 },
    Number(u64),
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("-"),
            Self::Name(name) => f.write_str(name),
            Self::Port { lid, port } => write!(f, "{lid}:{port}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// Identity of a task. Two tasks with equal ids share one schedule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    pub kind: TaskKind,
    pub key: TaskKey,
}

impl TaskId {
    pub fn new(kind: TaskKind, key: TaskKey) -> Self {
        Self { kind, key }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TaskKind::Custom(n) => write!(f, "custom{n}/{}", self.key),
            kind => write!(f, "{}/{}", kind.as_str(), self.key),
        }
    }
}

/// Future returned by one producer invocation.
pub type ProducerFuture<R> = Pin<Box<dyn Future<Output = Result<R, FetchError>> + Send>>;

/// Callable producing one result per cycle.
pub type Producer<R> = Arc<dyn Fn() -> ProducerFuture<R> + Send + Sync>;

/// Wraps an async closure as a [`Producer`].
pub fn producer<R, F, Fut>(f: F) -> Producer<R>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, FetchError>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// Receiver of a task's per-cycle outcome.
///
/// Callbacks are compared by reference identity, never by value: the same
/// `Arc` may be attached twice and is then detached one instance at a time.
pub trait Callback<R>: Send + Sync {
    /// Handles a successful result. Returning `Err` (or panicking) turns
    /// into an `on_error` delivery to this same callback.
    fn on_done(&self, result: Arc<R>) -> anyhow::Result<()>;

    fn on_error(&self, _error: &FetchError) {}

    /// Runs after every `on_done`/`on_error`, whatever their outcome.
    fn on_finally(&self) {}

    fn on_progress(&self, _fraction: f64) {}

    /// Clears per-cycle state, e.g. when the task is moved to a new schedule.
    fn reset(&self) {}
}

/// Shared handle to a callback.
pub type CallbackRef<R> = Arc<dyn Callback<R>>;

/// Reference identity comparison for callback handles.
pub fn same_callback<R>(a: &CallbackRef<R>, b: &CallbackRef<R>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

type DoneFn<R> = Box<dyn Fn(Arc<R>) -> anyhow::Result<()> + Send + Sync>;
type ErrorFn = Box<dyn Fn(&FetchError) + Send + Sync>;

/// Closure-backed [`Callback`].
pub struct FnCallback<R> {
    done: DoneFn<R>,
    error: Option<ErrorFn>,
}

impl<R: Send + Sync + 'static> FnCallback<R> {
    pub fn new(done: impl Fn(Arc<R>) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        Self {
            done: Box::new(done),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Fn(&FetchError) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(error));
        self
    }

    pub fn into_ref(self) -> CallbackRef<R> {
        Arc::new(self)
    }
}

impl<R: Send + Sync> Callback<R> for FnCallback<R> {
    fn on_done(&self, result: Arc<R>) -> anyhow::Result<()> {
        (self.done)(result)
    }

    fn on_error(&self, error: &FetchError) {
        if let Some(f) = &self.error {
            f(error);
        }
    }
}

/// A named, recurring unit of work.
pub struct Task<R> {
    id: TaskId,
    description: String,
    callbacks: Mutex<Vec<CallbackRef<R>>>,
    producer: Mutex<Option<Producer<R>>>,
    handle: Mutex<Option<ScheduleHandle>>,
    /// Serializes executions of this task across schedule hand-offs.
    run_lock: tokio::sync::Mutex<()>,
}

impl<R> fmt::Debug for Task<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("callbacks", &self.callbacks.lock().len())
            .finish()
    }
}

impl<R: Send + Sync + 'static> Task<R> {
    pub fn new(kind: TaskKind, key: TaskKey, description: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(kind, key),
            description: description.into(),
            callbacks: Mutex::new(Vec::with_capacity(2)),
            producer: Mutex::new(None),
            handle: Mutex::new(None),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Snapshot of the attached callbacks in fan-out order.
    pub fn callbacks(&self) -> Vec<CallbackRef<R>> {
        self.callbacks.lock().clone()
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn has_callbacks(&self) -> bool {
        !self.callbacks.lock().is_empty()
    }

    pub(crate) fn add_callback(&self, callback: CallbackRef<R>) {
        self.callbacks.lock().push(callback);
    }

    /// Detaches one instance of `callback`. Returns false if it was not attached.
    pub(crate) fn remove_callback(&self, callback: &CallbackRef<R>) -> bool {
        let mut callbacks = self.callbacks.lock();
        match callbacks.iter().position(|cb| same_callback(cb, callback)) {
            Some(pos) => {
                callbacks.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_producer(&self, producer: Producer<R>) {
        *self.producer.lock() = Some(producer);
    }

    pub(crate) fn producer(&self) -> Option<Producer<R>> {
        self.producer.lock().clone()
    }

    /// Installs a new schedule handle, returning the previous one.
    pub(crate) fn replace_handle(&self, handle: Option<ScheduleHandle>) -> Option<ScheduleHandle> {
        std::mem::replace(&mut *self.handle.lock(), handle)
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_cancelled())
    }

    pub(crate) async fn lock_run(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.run_lock.lock().await
    }

    /// Delivers `result` to every callback in registration order.
    ///
    /// Returns the number of callbacks that failed handling it.
    pub fn on_done(&self, result: Arc<R>) -> usize {
        self.callbacks()
            .iter()
            .filter(|cb| !deliver_result(&self.id, cb, Arc::clone(&result)))
            .count()
    }

    /// Delivers `error` to every callback in registration order.
    pub fn on_error(&self, error: &FetchError) {
        for cb in &self.callbacks() {
            deliver_error(&self.id, cb, error);
            run_finally(&self.id, cb);
        }
    }

    /// Resets every attached callback.
    pub fn reset_callbacks(&self) {
        for cb in &self.callbacks() {
            if panic::catch_unwind(AssertUnwindSafe(|| cb.reset())).is_err() {
                warn!(task = %self.id, "callback panicked during reset");
            }
        }
    }
}

/// Hands `result` to one callback, converting a failure into an `on_error`
/// delivery, then runs `on_finally`. Returns false if the callback failed.
pub(crate) fn deliver_result<R>(
    label: &dyn fmt::Display,
    cb: &CallbackRef<R>,
    result: Arc<R>,
) -> bool {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| cb.on_done(result)));
    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(FetchError::Callback(format!("{e:#}"))),
        Err(payload) => Some(FetchError::Callback(panic_message(payload.as_ref()))),
    };

    if let Some(err) = &failure {
        warn!(task = %label, error = %err, "callback failed handling result");
        deliver_error(label, cb, err);
    }

    run_finally(label, cb);
    failure.is_none()
}

pub(crate) fn deliver_error<R>(id: &dyn fmt::Display, cb: &CallbackRef<R>, error: &FetchError) {
    if panic::catch_unwind(AssertUnwindSafe(|| cb.on_error(error))).is_err() {
        warn!(task = %id, error = %error, "callback panicked handling error");
    }
}

fn run_finally<R>(id: &dyn fmt::Display, cb: &CallbackRef<R>) {
    if panic::catch_unwind(AssertUnwindSafe(|| cb.on_finally())).is_err() {
        warn!(task = %id, "callback panicked in on_finally");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records every callback invocation into a shared log.
    pub(crate) struct Recorder {
        pub name: &'static str,
        pub log: Arc<Mutex<Vec<String>>>,
        pub fail: bool,
        pub panic: bool,
    }

    impl Recorder {
        pub(crate) fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                log: Arc::clone(log),
                fail: false,
                panic: false,
            }
        }
    }

    impl Callback<u32> for Recorder {
        fn on_done(&self, result: Arc<u32>) -> anyhow::Result<()> {
            self.log.lock().push(format!("{}:done:{result}", self.name));
            if self.panic {
                panic!("recorder {} exploded", self.name);
            }
            if self.fail {
                anyhow::bail!("recorder {} rejected result", self.name);
            }
            Ok(())
        }

        fn on_error(&self, error: &FetchError) {
            self.log
                .lock()
                .push(format!("{}:error:{}", self.name, error.kind_str()));
        }

        fn on_finally(&self) {
            self.log.lock().push(format!("{}:finally", self.name));
        }
    }

    fn task() -> Task<u32> {
        Task::new(TaskKind::Custom(1), TaskKey::None, "test task")
    }

    #[test]
    fn test_fan_out_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let t = task();
        for name in ["a", "b", "c"] {
            t.add_callback(Arc::new(Recorder::new(name, &log)));
        }

        assert_eq!(t.on_done(Arc::new(7)), 0);

        assert_eq!(
            *log.lock(),
            vec![
                "a:done:7", "a:finally", "b:done:7", "b:finally", "c:done:7", "c:finally"
            ]
        );
    }

    #[test]
    fn test_failing_callback_gets_error_and_finally() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let t = task();
        let mut a = Recorder::new("a", &log);
        a.fail = true;
        t.add_callback(Arc::new(a));
        t.add_callback(Arc::new(Recorder::new("b", &log)));

        assert_eq!(t.on_done(Arc::new(1)), 1);

        assert_eq!(
            *log.lock(),
            vec![
                "a:done:1",
                "a:error:callback",
                "a:finally",
                "b:done:1",
                "b:finally"
            ]
        );
    }

    #[test]
    fn test_panicking_callback_does_not_break_fan_out() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let t = task();
        let mut a = Recorder::new("a", &log);
        a.panic = true;
        t.add_callback(Arc::new(a));
        t.add_callback(Arc::new(Recorder::new("b", &log)));

        assert_eq!(t.on_done(Arc::new(2)), 1);

        let log = log.lock();
        assert_eq!(log[1], "a:error:callback");
        assert_eq!(log[2], "a:finally");
        assert_eq!(log[3], "b:done:2");
    }

    #[test]
    fn test_on_error_reaches_every_callback() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let t = task();
        t.add_callback(Arc::new(Recorder::new("a", &log)));
        t.add_callback(Arc::new(Recorder::new("b", &log)));

        t.on_error(&FetchError::Runtime("bad gateway".into()));

        assert_eq!(
            *log.lock(),
            vec!["a:error:runtime", "a:finally", "b:error:runtime", "b:finally"]
        );
    }

    #[test]
    fn test_remove_by_identity_one_instance_at_a_time() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let t = task();
        let a: CallbackRef<u32> = Arc::new(Recorder::new("a", &log));
        let twin: CallbackRef<u32> = Arc::new(Recorder::new("a", &log));

        t.add_callback(Arc::clone(&a));
        t.add_callback(Arc::clone(&a));
        assert_eq!(t.callback_count(), 2);

        assert!(!t.remove_callback(&twin));
        assert!(t.remove_callback(&a));
        assert_eq!(t.callback_count(), 1);
        assert!(t.remove_callback(&a));
        assert!(!t.has_callbacks());
    }

    #[test]
    fn test_task_id_display() {
        let id = TaskId::new(TaskKind::PortCounters, TaskKey::Port { lid: 12, port: 3 });
        assert_eq!(id.to_string(), "port_counters/12:3");
        let id = TaskId::new(TaskKind::Custom(9), TaskKey::Name("x".into()));
        assert_eq!(id.to_string(), "custom9/x");
    }
}
