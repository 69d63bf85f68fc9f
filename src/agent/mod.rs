use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::FabricCache;
use crate::config::Config;
use crate::event::{EventCalculator, Severity, Summary};
use crate::export::health::HealthMetrics;
use crate::fabric::{GroupConfig, GroupInfo, HttpSource, ImageInfo, Notice};
use crate::perf::{GroupBatch, PerfService};
use crate::persist::{NdjsonStore, SampleHistory, ThrottledSaver};
use crate::scheduler::TaskScheduler;
use crate::task::batched::Batch;
use crate::task::single::{Completion, SingleTaskManager};
use crate::task::FnCallback;

type GroupSaver = ThrottledSaver<GroupInfo, NdjsonStore>;
type ConfigWarmups = SingleTaskManager<String, Arc<GroupConfig>>;

/// Agent wires the fabric source, scheduler, event calculator and exporters.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    calculator: Arc<EventCalculator>,
    scheduler: Option<Arc<TaskScheduler>>,
    perf: Option<Arc<PerfService<HttpSource>>>,
    warmups: Option<Arc<ConfigWarmups>>,
    saver: Option<Arc<GroupSaver>>,
    group_batch: Option<GroupBatch>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let calculator = Arc::new(
            EventCalculator::new(
                cfg.events.window,
                cfg.events.worst_nodes,
                cfg.events.weights.settings(),
            )
            .with_metrics(Arc::clone(&health)),
        );

        Ok(Self {
            cfg,
            health,
            calculator,
            scheduler: None,
            perf: None,
            warmups: None,
            saver: None,
            group_batch: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Latest event summary and health score.
    pub fn summary(&self) -> Summary {
        self.calculator.summary()
    }

    pub fn scheduler(&self) -> Option<&Arc<TaskScheduler>> {
        self.scheduler.as_ref()
    }

    /// Start all components and begin polling.
    pub async fn start(&mut self) -> Result<()> {
        let start = Instant::now();

        // 0. Start health metrics server so probes respond during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Scheduler and fabric source.
        let scheduler = Arc::new(TaskScheduler::new(
            self.cfg.scheduler.clone(),
            self.cfg.refresh_rate,
            Some(Arc::clone(&self.health)),
        ));
        scheduler.set_fatal_sink(Arc::new(|task, err| {
            error!(
                task = %task,
                error = %err,
                "task schedule stopped, it restarts on the next refresh-rate change",
            );
        }));

        let source = self.create_fabric_source()?;
        let perf = Arc::new(PerfService::new(
            Arc::new(source),
            Arc::clone(&scheduler),
            FabricCache::new(
                self.cfg.cache.capacity,
                self.cfg.cache.ttl,
                Some(Arc::clone(&self.health)),
            ),
            Some(Arc::clone(&self.health)),
        ));

        // 2. Config warm-ups after notices, one in flight per group.
        let (warmups, completions) = ConfigWarmups::new(self.cfg.monitor.groups.len().max(1) * 2);
        let warmups = Arc::new(warmups);
        self.spawn_warmup_consumer(completions);

        // 3. Persistence of group samples.
        if self.cfg.persistence.enabled {
            let history = Arc::new(SampleHistory::new(
                "group_info",
                self.cfg.persistence.history_capacity,
            ));
            let store = Arc::new(NdjsonStore::new(&self.cfg.persistence.path));
            let saver = ThrottledSaver::new(history, store, self.cfg.persistence.throttle)
                .with_metrics(Arc::clone(&self.health));
            info!(
                path = %self.cfg.persistence.path.display(),
                throttle = ?self.cfg.persistence.throttle,
                "sample persistence enabled",
            );
            self.saver = Some(Arc::new(saver));
        }

        // 4. Subscriptions.
        self.subscribe_image_info(&perf)?;
        self.subscribe_notices(&perf, &warmups)?;
        self.subscribe_groups(&perf, &scheduler)?;

        // 5. Periodic summary.
        self.spawn_summary_reporter();

        self.scheduler = Some(scheduler);
        self.perf = Some(perf);
        self.warmups = Some(warmups);

        info!(
            endpoint = %self.cfg.fabric.endpoint,
            refresh_rate = ?self.cfg.refresh_rate,
            groups = self.cfg.monitor.groups.len(),
            duration = ?start.elapsed(),
            "agent fully started",
        );

        Ok(())
    }

    /// Applies a reloaded configuration.
    ///
    /// The refresh rate and event settings take effect immediately; other
    /// changes need a restart.
    pub async fn reload(&mut self, cfg: Config) -> Result<()> {
        if cfg.fabric.endpoint != self.cfg.fabric.endpoint
            || cfg.monitor.groups != self.cfg.monitor.groups
            || cfg.health.addr != self.cfg.health.addr
            || cfg.persistence.enabled != self.cfg.persistence.enabled
        {
            warn!("fabric, monitor, health and persistence changes require a restart, ignoring them");
        }

        if let Some(scheduler) = &self.scheduler {
            scheduler
                .update_refresh_rate(cfg.refresh_rate)
                .await
                .context("applying refresh rate")?;
        }
        self.cfg.refresh_rate = cfg.refresh_rate;

        self.calculator.reconfigure(
            cfg.events.window,
            cfg.events.worst_nodes,
            cfg.events.weights.settings(),
        );
        self.cfg.events = cfg.events;

        info!(
            refresh_rate = ?self.cfg.refresh_rate,
            window = ?self.cfg.events.window,
            worst_nodes = self.cfg.events.worst_nodes,
            "configuration reloaded",
        );

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        if let (Some(perf), Some(batch)) = (&self.perf, self.group_batch.take()) {
            perf.unsubscribe_groups(&batch);
        }

        // Cancels every timer and drains both pools.
        if let Some(scheduler) = &self.scheduler {
            scheduler.shutdown().await;
        }

        if let Some(warmups) = &self.warmups {
            warmups.shutdown().await;
        }

        // Save whatever the throttle held back.
        if let Some(saver) = &self.saver {
            saver.flush().await;
        }

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }

    /// Create a fabric client with metrics callback.
    fn create_fabric_source(&self) -> Result<HttpSource> {
        let source = HttpSource::new(&self.cfg.fabric).context("creating fabric client")?;

        let health = Arc::clone(&self.health);
        let source = source.with_metrics(Box::new(move |endpoint, status, duration| {
            health
                .fabric_requests_total
                .with_label_values(&[endpoint, status])
                .inc();
            health
                .fabric_request_duration
                .with_label_values(&[endpoint])
                .observe(duration.as_secs_f64());
        }));

        Ok(source)
    }

    /// Feeds each sweep's node, port and link counts into the health score.
    fn subscribe_image_info(&self, perf: &PerfService<HttpSource>) -> Result<()> {
        let calculator = Arc::clone(&self.calculator);
        let callback = FnCallback::new(move |info: Arc<ImageInfo>| {
            calculator.update_counts(info.health_counts());
            debug!(image = %info.image_id, switches = info.num_switch_nodes, "image info updated");
            Ok(())
        })
        .with_error(|e| warn!(error = %e, "image info unavailable"))
        .into_ref();

        perf.subscribe_image_info(callback)
            .context("subscribing to image info")?;
        Ok(())
    }

    /// Feeds notices into the event window and re-fetches the configs of
    /// monitored groups once notices invalidated them.
    fn subscribe_notices(
        &self,
        perf: &Arc<PerfService<HttpSource>>,
        warmups: &Arc<ConfigWarmups>,
    ) -> Result<()> {
        let calculator = Arc::clone(&self.calculator);
        let groups = self.cfg.monitor.groups.clone();
        let perf_ref = Arc::clone(perf);
        let warmups = Arc::clone(warmups);

        let callback = FnCallback::new(move |notices: Arc<Vec<Notice>>| {
            if notices.is_empty() {
                return Ok(());
            }
            let events: Vec<_> = notices.iter().map(Notice::to_event).collect();
            calculator.on_new_event(&events);

            for group in &groups {
                let perf = Arc::clone(&perf_ref);
                let name = group.clone();
                warmups.submit(group.clone(), move |_cancel| async move {
                    perf.group_config(&name).await
                });
            }
            Ok(())
        })
        .with_error(|e| warn!(error = %e, "notice poll failed"))
        .into_ref();

        perf.subscribe_notices(callback)
            .context("subscribing to notices")?;
        Ok(())
    }

    /// Polls every monitored group into one batch per cycle.
    fn subscribe_groups(
        &mut self,
        perf: &PerfService<HttpSource>,
        scheduler: &Arc<TaskScheduler>,
    ) -> Result<()> {
        if self.cfg.monitor.groups.is_empty() {
            info!("no monitored groups configured");
            return Ok(());
        }

        let saver = self.saver.clone();
        let scheduler = Arc::clone(scheduler);
        let callback = FnCallback::new(move |batch: Arc<Batch<GroupInfo>>| {
            for group in batch.iter() {
                debug!(
                    group = %group.name,
                    image = %group.image_id,
                    internal_mbps = group.internal_util.total_mbps,
                    integrity_errors = group.internal_errors.integrity_errors,
                    "group sample",
                );
                if let Some(saver) = &saver {
                    saver.record(GroupInfo::clone(group), scheduler.background());
                }
            }
            Ok(())
        })
        .with_error(|e| warn!(error = %e, "group batch failed"))
        .into_ref();

        let handle = perf
            .subscribe_groups("monitored_groups", &self.cfg.monitor.groups, callback)
            .context("subscribing to monitored groups")?;
        self.group_batch = Some(handle);
        Ok(())
    }

    /// Spawn the consumer of config warm-up completions.
    fn spawn_warmup_consumer(&self, mut completions: mpsc::Receiver<Completion<String, Arc<GroupConfig>>>) {
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let completion = tokio::select! {
                    _ = cancel.cancelled() => return,
                    c = completions.recv() => match c {
                        Some(c) => c,
                        None => return,
                    },
                };

                match completion.result {
                    Ok(cfg) => debug!(
                        group = %completion.key,
                        generation = completion.generation,
                        members = cfg.members.len(),
                        "group config refreshed",
                    ),
                    Err(e) if e.is_cancelled() => {
                        debug!(group = %completion.key, "group config refresh cancelled");
                    }
                    Err(e) => {
                        warn!(group = %completion.key, error = %e, "group config refresh failed");
                    }
                }
            }
        });
    }

    /// Spawn background summary reporter.
    fn spawn_summary_reporter(&self) {
        let cancel = self.cancel.clone();
        let calculator = Arc::clone(&self.calculator);
        let interval = self.cfg.monitor.summary_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        calculator.sweep();
                        let summary = calculator.summary();

                        info!(
                            health_score = summary.health_score,
                            switches_with_events = summary.switch_states.total(),
                            hfis_with_events = summary.hfi_states.total(),
                            critical_switches = summary.switch_states[Severity::Critical],
                            critical_hfis = summary.hfi_states[Severity::Critical],
                            "fabric summary",
                        );

                        for node in &summary.worst_nodes {
                            debug!(
                                lid = node.lid,
                                node = %node.node_desc,
                                severity = node.severity.as_str(),
                                "  worst node",
                            );
                        }
                    }
                }
            }
        });
    }
}
