use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "fabmon";

/// Prometheus metrics for the poller.
///
/// All metrics use the "fabmon" namespace. Organized by subsystem:
/// - Scheduler: task registrations, producer runs and failures
/// - Batches: combined deliveries and late arrivals
/// - Caches: hits, misses, refreshes and invalidations per cache
/// - Events: health score and node state counts
/// - Persistence and fabric requests
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    bound: parking_lot::Mutex<Option<SocketAddr>>,

    // === Scheduler ===
    /// Registered tasks by kind.
    pub tasks_registered: GaugeVec,
    /// Producer executions by task kind.
    pub producer_runs: CounterVec,
    /// Producer failures by task kind and error class.
    pub producer_errors: CounterVec,
    /// Producer duration by task kind.
    pub producer_duration: HistogramVec,
    /// Callbacks that failed handling a result.
    pub callback_failures: Counter,
    /// Current refresh rate in seconds.
    pub refresh_rate_seconds: Gauge,
    /// Completed refresh-rate changes.
    pub reschedules: Counter,
    /// Task schedules stopped by unrecoverable errors.
    pub fatal_task_stops: Counter,
    /// One-shot jobs rejected because the background queue was full.
    pub background_rejected: Counter,

    // === Batches ===
    pub batches_delivered: Counter,
    /// Results that arrived ahead of their batch.
    pub batch_late_arrivals: Counter,

    // === Caches ===
    pub cache_hits: CounterVec,
    pub cache_misses: CounterVec,
    pub cache_refreshes: CounterVec,
    pub cache_invalidations: CounterVec,

    // === Events ===
    /// Latest fabric health score (0-100).
    pub health_score: Gauge,
    /// Switches per overall severity in the current window.
    pub switch_states: GaugeVec,
    /// HFIs per overall severity in the current window.
    pub hfi_states: GaugeVec,
    pub events_ingested: Counter,

    // === Persistence ===
    pub persistence_saves: Counter,
    pub persistence_failures: Counter,
    /// Save attempts skipped inside a throttle window.
    pub persistence_throttled: Counter,

    // === Fabric requests ===
    /// Fabric API requests by endpoint and status.
    pub fabric_requests_total: CounterVec,
    /// Fabric request duration by endpoint.
    pub fabric_request_duration: HistogramVec,
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Scheduler ===
        let tasks_registered = GaugeVec::new(
            opts("tasks_registered", "Number of registered recurring tasks by kind."),
            &["kind"],
        )?;
        let producer_runs = CounterVec::new(
            opts("producer_runs_total", "Total producer executions by task kind."),
            &["kind"],
        )?;
        let producer_errors = CounterVec::new(
            opts(
                "producer_errors_total",
                "Total producer failures by task kind and error class.",
            ),
            &["kind", "class"],
        )?;
        let producer_duration = HistogramVec::new(
            HistogramOpts::new(
                "producer_duration_seconds",
                "Time to produce one task result by kind.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
            &["kind"],
        )?;
        let callback_failures = Counter::with_opts(opts(
            "callback_failures_total",
            "Total callbacks that failed handling a result.",
        ))?;
        let refresh_rate_seconds = Gauge::with_opts(opts(
            "refresh_rate_seconds",
            "Current poll interval of recurring tasks.",
        ))?;
        let reschedules = Counter::with_opts(opts(
            "reschedules_total",
            "Total refresh-rate changes applied.",
        ))?;
        let fatal_task_stops = Counter::with_opts(opts(
            "fatal_task_stops_total",
            "Total task schedules stopped by unrecoverable errors.",
        ))?;
        let background_rejected = Counter::with_opts(opts(
            "background_rejected_total",
            "Total one-shot jobs rejected by a full background queue.",
        ))?;

        // === Batches ===
        let batches_delivered = Counter::with_opts(opts(
            "batches_delivered_total",
            "Total combined batches delivered.",
        ))?;
        let batch_late_arrivals = Counter::with_opts(opts(
            "batch_late_arrivals_total",
            "Total results that arrived ahead of their batch.",
        ))?;

        // === Caches ===
        let cache_hits = CounterVec::new(
            opts("cache_hits_total", "Total cache reads served from a ready value."),
            &["cache"],
        )?;
        let cache_misses = CounterVec::new(
            opts("cache_misses_total", "Total cache reads that needed a refresh."),
            &["cache"],
        )?;
        let cache_refreshes = CounterVec::new(
            opts("cache_refreshes_total", "Total successful cache refreshes."),
            &["cache"],
        )?;
        let cache_invalidations = CounterVec::new(
            opts("cache_invalidations_total", "Total cache entries marked stale."),
            &["cache"],
        )?;

        // === Events ===
        let health_score = Gauge::with_opts(opts("health_score", "Fabric health score (0-100)."))?;
        let switch_states = GaugeVec::new(
            opts("switch_states", "Switches with events in the window by severity."),
            &["severity"],
        )?;
        let hfi_states = GaugeVec::new(
            opts("hfi_states", "HFIs with events in the window by severity."),
            &["severity"],
        )?;
        let events_ingested = Counter::with_opts(opts(
            "events_ingested_total",
            "Total fabric events ingested.",
        ))?;

        // === Persistence ===
        let persistence_saves = Counter::with_opts(opts(
            "persistence_saves_total",
            "Total sample batches saved.",
        ))?;
        let persistence_failures = Counter::with_opts(opts(
            "persistence_failures_total",
            "Total sample batches that failed to save.",
        ))?;
        let persistence_throttled = Counter::with_opts(opts(
            "persistence_throttled_total",
            "Total save attempts skipped inside a throttle window.",
        ))?;

        // === Fabric requests ===
        let fabric_requests_total = CounterVec::new(
            opts(
                "fabric_requests_total",
                "Total fabric API requests by endpoint and status.",
            ),
            &["endpoint", "status"],
        )?;
        let fabric_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "fabric_request_duration_seconds",
                "Fabric API request duration by endpoint.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["endpoint"],
        )?;

        // Scheduler
        registry.register(Box::new(tasks_registered.clone()))?;
        registry.register(Box::new(producer_runs.clone()))?;
        registry.register(Box::new(producer_errors.clone()))?;
        registry.register(Box::new(producer_duration.clone()))?;
        registry.register(Box::new(callback_failures.clone()))?;
        registry.register(Box::new(refresh_rate_seconds.clone()))?;
        registry.register(Box::new(reschedules.clone()))?;
        registry.register(Box::new(fatal_task_stops.clone()))?;
        registry.register(Box::new(background_rejected.clone()))?;

        // Batches
        registry.register(Box::new(batches_delivered.clone()))?;
        registry.register(Box::new(batch_late_arrivals.clone()))?;

        // Caches
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(cache_refreshes.clone()))?;
        registry.register(Box::new(cache_invalidations.clone()))?;

        // Events
        registry.register(Box::new(health_score.clone()))?;
        registry.register(Box::new(switch_states.clone()))?;
        registry.register(Box::new(hfi_states.clone()))?;
        registry.register(Box::new(events_ingested.clone()))?;

        // Persistence and fabric requests
        registry.register(Box::new(persistence_saves.clone()))?;
        registry.register(Box::new(persistence_failures.clone()))?;
        registry.register(Box::new(persistence_throttled.clone()))?;
        registry.register(Box::new(fabric_requests_total.clone()))?;
        registry.register(Box::new(fabric_request_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            bound: parking_lot::Mutex::new(None),
            tasks_registered,
            producer_runs,
            producer_errors,
            producer_duration,
            callback_failures,
            refresh_rate_seconds,
            reschedules,
            fatal_task_stops,
            background_rejected,
            batches_delivered,
            batch_late_arrivals,
            cache_hits,
            cache_misses,
            cache_refreshes,
            cache_invalidations,
            health_score,
            switch_states,
            hfi_states,
            events_ingested,
            persistence_saves,
            persistence_failures,
            persistence_throttled,
            fabric_requests_total,
            fabric_request_duration,
        })
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Address the server is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;
        *self.bound.lock() = Some(local_addr);

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
