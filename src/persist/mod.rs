//! Bounded sample buffers and throttled persistence.
//!
//! Producers push samples into a [`SampleHistory`] on every tick. A
//! [`ThrottledSaver`] submits at most one drain-and-save job per throttle
//! window to the background pool. Save failures are logged and counted,
//! never propagated to the polling path.

pub mod history;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::export::health::HealthMetrics;
use crate::scheduler::pool::BackgroundPool;

pub use self::history::SampleHistory;

/// Destination for drained sample batches.
pub trait SampleStore<T>: Send + Sync + 'static {
    fn save(&self, buffer: &str, batch: Vec<T>) -> impl Future<Output = Result<()>> + Send;
}

/// Appends samples as newline-delimited JSON records.
#[derive(Debug)]
pub struct NdjsonStore {
    path: PathBuf,
    write: tokio::sync::Mutex<()>,
}

impl NdjsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Serialize)]
struct Record<'a, T> {
    buffer: &'a str,
    saved_at: u64,
    sample: &'a T,
}

impl<T: Serialize + Send + Sync + 'static> SampleStore<T> for NdjsonStore {
    async fn save(&self, buffer: &str, batch: Vec<T>) -> Result<()> {
        let saved_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut out = Vec::with_capacity(batch.len() * 128);
        for sample in &batch {
            serde_json::to_writer(
                &mut out,
                &Record {
                    buffer,
                    saved_at,
                    sample,
                },
            )
            .context("encoding sample")?;
            out.push(b'\n');
        }

        let _guard = self.write.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(&out)
            .await
            .with_context(|| format!("writing {}", self.path.display()))?;
        file.flush().await.context("flushing sample file")?;

        Ok(())
    }
}

/// Saves a history at most once per throttle window.
///
/// The window is claimed with a compare-and-swap on the last submission
/// time, so concurrent producers never submit twice for one window.
pub struct ThrottledSaver<T, S> {
    history: Arc<SampleHistory<T>>,
    store: Arc<S>,
    throttle: Duration,
    origin: Instant,
    /// Milliseconds since `origin` plus one; zero means never submitted.
    last_submit: AtomicU64,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<T, S> ThrottledSaver<T, S>
where
    T: Send + Sync + 'static,
    S: SampleStore<T>,
{
    pub fn new(history: Arc<SampleHistory<T>>, store: Arc<S>, throttle: Duration) -> Self {
        Self {
            history,
            store,
            throttle,
            origin: Instant::now(),
            last_submit: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn history(&self) -> &Arc<SampleHistory<T>> {
        &self.history
    }

    /// Buffers `sample` and submits a save if the window allows one.
    pub fn record(&self, sample: T, pool: &BackgroundPool) -> bool {
        self.history.push(sample);
        self.maybe_save(pool)
    }

    /// Submits a drain-and-save job unless one was already submitted in
    /// the current throttle window. Returns true if a job was queued.
    pub fn maybe_save(&self, pool: &BackgroundPool) -> bool {
        let now = self.origin.elapsed().as_millis() as u64 + 1;
        let last = self.last_submit.load(Ordering::Acquire);
        let throttle = self.throttle.as_millis() as u64;

        if last != 0 && now.saturating_sub(last) < throttle {
            self.throttled();
            return false;
        }
        if self
            .last_submit
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.throttled();
            return false;
        }

        let history = Arc::clone(&self.history);
        let store = Arc::clone(&self.store);
        let metrics = self.metrics.clone();
        let name = format!("save {}", history.name());

        pool.submit(name, async move {
            save_batch(&history, store.as_ref(), metrics.as_deref()).await;
        })
    }

    /// Saves whatever is buffered right now, ignoring the throttle.
    pub async fn flush(&self) {
        save_batch(&self.history, self.store.as_ref(), self.metrics.as_deref()).await;
    }

    fn throttled(&self) {
        if let Some(m) = &self.metrics {
            m.persistence_throttled.inc();
        }
    }
}

async fn save_batch<T, S: SampleStore<T>>(
    history: &SampleHistory<T>,
    store: &S,
    metrics: Option<&HealthMetrics>,
) {
    let batch = history.drain();
    if batch.is_empty() {
        return;
    }
    let n = batch.len();

    match store.save(history.name(), batch).await {
        Ok(()) => {
            if let Some(m) = metrics {
                m.persistence_saves.inc();
            }
            debug!(buffer = history.name(), samples = n, "samples saved");
        }
        Err(e) => {
            if let Some(m) = metrics {
                m.persistence_failures.inc();
            }
            warn!(buffer = history.name(), samples = n, error = %e, "failed to save samples");
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct MemoryStore {
        batches: Mutex<Vec<Vec<u32>>>,
        fail: bool,
    }

    impl SampleStore<u32> for MemoryStore {
        async fn save(&self, _buffer: &str, batch: Vec<u32>) -> Result<()> {
            if self.fail {
                anyhow::bail!("disk full");
            }
            self.batches.lock().push(batch);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_submission_per_window() {
        let pool = BackgroundPool::new(2, 8, None);
        let store = Arc::new(MemoryStore::default());
        let history = Arc::new(SampleHistory::new("ports", 100));
        let saver = ThrottledSaver::new(Arc::clone(&history), Arc::clone(&store), Duration::from_secs(30));

        assert!(saver.record(1, &pool));
        assert!(!saver.record(2, &pool));
        assert!(!saver.record(3, &pool));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(saver.record(4, &pool));

        pool.shutdown(Duration::from_secs(5)).await;

        let batches = store.batches.lock();
        let saved: Vec<u32> = batches.iter().flatten().copied().collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(saved.len(), 4);
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_is_swallowed() {
        let pool = BackgroundPool::new(1, 4, None);
        let store = Arc::new(MemoryStore {
            fail: true,
            ..Default::default()
        });
        let history = Arc::new(SampleHistory::new("ports", 10));
        let saver = ThrottledSaver::new(Arc::clone(&history), store, Duration::from_secs(30));

        assert!(saver.record(1, &pool));
        pool.shutdown(Duration::from_secs(5)).await;
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_ndjson_store_appends_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("samples.ndjson");
        let store = NdjsonStore::new(&path);

        SampleStore::<u32>::save(&store, "ports", vec![1, 2]).await.expect("save");
        SampleStore::<u32>::save(&store, "ports", vec![3]).await.expect("save");

        let text = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2]["sample"], 3);
        assert_eq!(lines[0]["buffer"], "ports");
    }
}
