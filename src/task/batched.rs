//! Reconciliation barrier combining results from several independently
//! scheduled tasks into one same-cycle batch.
//!
//! Each source gets a member callback bound to its index. Every arrival
//! bumps that source's sequence counter; only an arrival whose sequence
//! equals the batch target is accepted. An arrival past the target means a
//! source completed a whole cycle before the others finished theirs: it is
//! counted and logged, and the rebase on completion realigns that source so
//! the next batch again combines values from one nominal cycle.
//!
//! The rebase assumes a source never runs more than one cycle ahead.

use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{FetchError, SchedulerError};
use crate::export::health::HealthMetrics;

use super::{deliver_error, deliver_result, Callback, CallbackRef};

/// A completed batch: one value per source, in source-index order.
pub type Batch<E> = Vec<Arc<E>>;

struct BatchState<E> {
    sequence: Vec<i64>,
    target: i64,
    max_observed: i64,
    slots: Vec<Option<Arc<E>>>,
    completed: usize,
    seen_errors: HashSet<String>,
}

impl<E> BatchState<E> {
    fn new(size: usize) -> Self {
        Self {
            sequence: vec![0; size],
            target: 1,
            max_observed: 1,
            slots: vec![None; size],
            completed: 0,
            seen_errors: HashSet::new(),
        }
    }
}

/// Barrier delivering exactly one combined result per completed cycle.
pub struct BatchedCallback<E> {
    name: String,
    size: usize,
    state: Mutex<BatchState<E>>,
    final_callback: CallbackRef<Batch<E>>,
    late_arrivals: AtomicU64,
    delivered: AtomicU64,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<E> fmt::Debug for BatchedCallback<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchedCallback")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("delivered", &self.delivered.load(Ordering::Relaxed))
            .finish()
    }
}

impl<E: Send + Sync + 'static> BatchedCallback<E> {
    /// Creates a barrier for `size` sources. Fails with
    /// [`SchedulerError::EmptyBatch`] when `size` is zero.
    pub fn new(
        name: impl Into<String>,
        size: usize,
        final_callback: CallbackRef<Batch<E>>,
    ) -> Result<Arc<Self>, SchedulerError> {
        Self::build(name.into(), size, final_callback, None)
    }

    /// Like [`BatchedCallback::new`], recording batch and late-arrival metrics.
    pub fn with_metrics(
        name: impl Into<String>,
        size: usize,
        final_callback: CallbackRef<Batch<E>>,
        metrics: Arc<HealthMetrics>,
    ) -> Result<Arc<Self>, SchedulerError> {
        Self::build(name.into(), size, final_callback, Some(metrics))
    }

    fn build(
        name: String,
        size: usize,
        final_callback: CallbackRef<Batch<E>>,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Result<Arc<Self>, SchedulerError> {
        if size == 0 {
            return Err(SchedulerError::EmptyBatch);
        }
        Ok(Arc::new(Self {
            name,
            size,
            state: Mutex::new(BatchState::new(size)),
            final_callback,
            late_arrivals: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            metrics,
        }))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of results that arrived ahead of their batch.
    pub fn late_arrivals(&self) -> u64 {
        self.late_arrivals.load(Ordering::Relaxed)
    }

    /// Number of batches handed to the final callback.
    pub fn batches_delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Member callback feeding source `index`, or `None` past the last source.
    pub fn member(self: &Arc<Self>, index: usize) -> Option<CallbackRef<E>> {
        (index < self.size).then(|| self.member_unchecked(index))
    }

    /// Member callbacks for every source, in index order.
    pub fn members(self: &Arc<Self>) -> Vec<CallbackRef<E>> {
        (0..self.size).map(|i| self.member_unchecked(i)).collect()
    }

    fn member_unchecked(self: &Arc<Self>, index: usize) -> CallbackRef<E> {
        Arc::new(Member {
            batch: Arc::clone(self),
            index,
        })
    }

    /// Records `value` as source `index`'s result for its current cycle.
    pub fn add_result(&self, index: usize, value: Arc<E>) {
        let mut st = self.state.lock();

        let Some(seq) = st.sequence.get_mut(index) else {
            warn!(batch = %self.name, source = index, "result for unknown source ignored");
            return;
        };
        *seq += 1;
        let seq = *seq;

        if seq > st.target {
            st.max_observed = st.max_observed.max(seq);
            self.late_arrivals.fetch_add(1, Ordering::Relaxed);
            if let Some(m) = &self.metrics {
                m.batch_late_arrivals.inc();
            }
            warn!(
                batch = %self.name,
                source = index,
                sequence = seq,
                target = st.target,
                "result arrived ahead of its batch, refresh rate may be too short for source latency",
            );
            return;
        }

        if seq < st.target {
            debug!(
                batch = %self.name,
                source = index,
                sequence = seq,
                "stale result discarded while realigning",
            );
            return;
        }

        st.slots[index] = Some(value);
        st.completed += 1;
        let progress = st.completed as f64 / self.size as f64;
        if panic::catch_unwind(AssertUnwindSafe(|| self.final_callback.on_progress(progress)))
            .is_err()
        {
            warn!(batch = %self.name, "final callback panicked reporting progress");
        }

        if st.completed < self.size {
            return;
        }

        let slots = std::mem::replace(&mut st.slots, vec![None; self.size]);
        let batch: Batch<E> = slots.into_iter().flatten().collect();
        st.completed = 0;
        let rebase = st.max_observed;
        for s in st.sequence.iter_mut() {
            *s -= rebase;
        }
        st.max_observed = 1;
        st.target = 1;
        st.seen_errors.clear();

        self.delivered.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.batches_delivered.inc();
        }

        // Delivered under the state lock so two batches never interleave.
        deliver_result(&self.name, &self.final_callback, Arc::new(batch));
    }

    /// Forwards `error` to the final callback unless this batch already saw it.
    pub fn add_error(&self, error: &FetchError) {
        let mut st = self.state.lock();
        if st.seen_errors.insert(error.to_string()) {
            deliver_error(&self.name, &self.final_callback, error);
        }
    }

    /// Drops any partial batch and realigns every source to the first cycle.
    pub fn reset(&self) {
        let mut st = self.state.lock();
        *st = BatchState::new(self.size);
        if panic::catch_unwind(AssertUnwindSafe(|| self.final_callback.reset())).is_err() {
            warn!(batch = %self.name, "final callback panicked during reset");
        }
    }
}

struct Member<E> {
    batch: Arc<BatchedCallback<E>>,
    index: usize,
}

impl<E: Send + Sync + 'static> Callback<E> for Member<E> {
    fn on_done(&self, result: Arc<E>) -> anyhow::Result<()> {
        self.batch.add_result(self.index, result);
        Ok(())
    }

    fn on_error(&self, error: &FetchError) {
        self.batch.add_error(error);
    }

    fn reset(&self) {
        self.batch.reset();
    }
}
