use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::event::WeightSetting;

/// Top-level configuration for the fabmon poller.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Fabric performance service connection.
    #[serde(default)]
    pub fabric: FabricConfig,

    /// Poll interval shared by every recurring task. Default: 10s.
    #[serde(default = "default_refresh_rate", with = "humantime_serde")]
    pub refresh_rate: Duration,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Sliding-window event aggregation and health scoring.
    #[serde(default)]
    pub events: EventsConfig,

    /// Configuration caches.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Sample persistence.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// What the agent polls.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Fabric performance service connection.
#[derive(Debug, Clone, Deserialize)]
pub struct FabricConfig {
    /// Base URL (e.g., "http://fm-host:3245").
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_fabric_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Pool sizing and deadlines for the task scheduler.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Concurrent producer runs across recurring tasks. Default: 4.
    #[serde(default = "default_recurring_pool_size")]
    pub recurring_pool_size: usize,

    /// Concurrent one-shot jobs. Raised to twice the recurring size if
    /// smaller. Default: 8.
    #[serde(default = "default_background_pool_size")]
    pub background_pool_size: usize,

    /// Pending one-shot jobs before submissions are rejected. Default: 64.
    #[serde(default = "default_background_queue_size")]
    pub background_queue_size: usize,

    /// Per-producer deadline. Default: 30s.
    #[serde(default = "default_task_timeout", with = "humantime_serde")]
    pub task_timeout: Duration,

    /// How long pools drain before in-flight work is cancelled. Default: 5s.
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Events older than this are swept out. Default: 300s.
    #[serde(default = "default_event_window", with = "humantime_serde")]
    pub window: Duration,

    /// Number of worst nodes listed, ranked across all node types. Default: 10.
    #[serde(default = "default_worst_nodes")]
    pub worst_nodes: usize,

    #[serde(default)]
    pub weights: WeightsConfig,
}

/// Health-score weight per attribute, a number or "auto".
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct WeightsConfig {
    #[serde(default)]
    pub switches: WeightSetting,
    #[serde(default)]
    pub hfis: WeightSetting,
    #[serde(default)]
    pub switch_ports: WeightSetting,
    #[serde(default)]
    pub hfi_ports: WeightSetting,
    #[serde(default)]
    pub inter_switch_links: WeightSetting,
    #[serde(default)]
    pub hfi_links: WeightSetting,
}

impl WeightsConfig {
    /// Settings in health attribute order.
    pub fn settings(&self) -> [WeightSetting; 6] {
        [
            self.switches,
            self.hfis,
            self.switch_ports,
            self.hfi_ports,
            self.inter_switch_links,
            self.hfi_links,
        ]
    }

    fn settings_mut(&mut self) -> [(&'static str, &mut WeightSetting); 6] {
        [
            ("switches", &mut self.switches),
            ("hfis", &mut self.hfis),
            ("switch_ports", &mut self.switch_ports),
            ("hfi_ports", &mut self.hfi_ports),
            ("inter_switch_links", &mut self.inter_switch_links),
            ("hfi_links", &mut self.hfi_links),
        ]
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Keyed cache bound; least recently used entries are evicted. Default: 256.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Entry time-to-live. Default: 5m.
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub ttl: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub enabled: bool,

    /// NDJSON output file. Default: "fabmon-samples.ndjson".
    #[serde(default = "default_persistence_path")]
    pub path: PathBuf,

    /// At most one save per buffer per window. Default: 30s.
    #[serde(default = "default_persistence_throttle", with = "humantime_serde")]
    pub throttle: Duration,

    /// Samples kept in memory between saves. Default: 1024.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Groups polled together into one batched summary. Default: ["All"].
    #[serde(default = "default_groups")]
    pub groups: Vec<String>,

    /// How often the event window is swept and summarized. Default: 60s.
    #[serde(default = "default_summary_interval", with = "humantime_serde")]
    pub summary_interval: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_fabric_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_refresh_rate() -> Duration {
    Duration::from_secs(10)
}

fn default_recurring_pool_size() -> usize {
    4
}

fn default_background_pool_size() -> usize {
    8
}

fn default_background_queue_size() -> usize {
    64
}

fn default_task_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_event_window() -> Duration {
    Duration::from_secs(300)
}

fn default_worst_nodes() -> usize {
    10
}

fn default_cache_capacity() -> usize {
    256
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_persistence_path() -> PathBuf {
    PathBuf::from("fabmon-samples.ndjson")
}

fn default_persistence_throttle() -> Duration {
    Duration::from_secs(30)
}

fn default_history_capacity() -> usize {
    1024
}

fn default_groups() -> Vec<String> {
    vec!["All".to_string()]
}

fn default_summary_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            fabric: FabricConfig::default(),
            refresh_rate: default_refresh_rate(),
            scheduler: SchedulerConfig::default(),
            events: EventsConfig::default(),
            cache: CacheConfig::default(),
            persistence: PersistenceConfig::default(),
            monitor: MonitorConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_fabric_timeout(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            recurring_pool_size: default_recurring_pool_size(),
            background_pool_size: default_background_pool_size(),
            background_queue_size: default_background_queue_size(),
            task_timeout: default_task_timeout(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            window: default_event_window(),
            worst_nodes: default_worst_nodes(),
            weights: WeightsConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl: default_cache_ttl(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_persistence_path(),
            throttle: default_persistence_throttle(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            groups: default_groups(),
            summary_interval: default_summary_interval(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::parse(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse, validate and normalize a YAML document.
    pub fn parse(data: &str) -> Result<Self> {
        let mut cfg: Config = serde_yaml::from_str(data)?;

        cfg.validate()?;
        cfg.normalize();

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.fabric.endpoint.trim().is_empty() {
            bail!("fabric.endpoint is required");
        }

        if !self.fabric.endpoint.starts_with("http://")
            && !self.fabric.endpoint.starts_with("https://")
        {
            bail!(
                "fabric.endpoint must be an http(s) URL, got {}",
                self.fabric.endpoint
            );
        }

        for (i, group) in self.monitor.groups.iter().enumerate() {
            if group.trim().is_empty() {
                bail!("monitor.groups[{i}] must not be empty");
            }
        }

        if self.persistence.enabled && self.persistence.path.as_os_str().is_empty() {
            bail!("persistence.path is required when persistence is enabled");
        }

        Ok(())
    }

    /// Replace invalid numeric settings with their defaults.
    ///
    /// Bad tuning never fails startup: each fallback is logged and the
    /// documented default is used instead.
    pub fn normalize(&mut self) {
        fallback_duration(&mut self.refresh_rate, "refresh_rate", default_refresh_rate());
        fallback_duration(
            &mut self.fabric.timeout,
            "fabric.timeout",
            default_fabric_timeout(),
        );

        let s = &mut self.scheduler;
        fallback_count(
            &mut s.recurring_pool_size,
            "scheduler.recurring_pool_size",
            default_recurring_pool_size(),
        );
        fallback_count(
            &mut s.background_queue_size,
            "scheduler.background_queue_size",
            default_background_queue_size(),
        );
        fallback_duration(
            &mut s.task_timeout,
            "scheduler.task_timeout",
            default_task_timeout(),
        );
        let min_background = s.recurring_pool_size * 2;
        if s.background_pool_size < min_background {
            warn!(
                configured = s.background_pool_size,
                using = min_background,
                "scheduler.background_pool_size must be at least twice the recurring pool size",
            );
            s.background_pool_size = min_background;
        }

        fallback_duration(
            &mut self.events.window,
            "events.window",
            default_event_window(),
        );
        fallback_count(
            &mut self.events.worst_nodes,
            "events.worst_nodes",
            default_worst_nodes(),
        );
        for (name, setting) in self.events.weights.settings_mut() {
            if let WeightSetting::Fixed(w) = *setting {
                if !w.is_finite() || w < 0.0 {
                    warn!(
                        attribute = name,
                        configured = w,
                        "health weight must be a non-negative number, using auto",
                    );
                    *setting = WeightSetting::Auto;
                }
            }
        }

        fallback_count(
            &mut self.cache.capacity,
            "cache.capacity",
            default_cache_capacity(),
        );
        fallback_duration(&mut self.cache.ttl, "cache.ttl", default_cache_ttl());

        fallback_duration(
            &mut self.persistence.throttle,
            "persistence.throttle",
            default_persistence_throttle(),
        );
        fallback_count(
            &mut self.persistence.history_capacity,
            "persistence.history_capacity",
            default_history_capacity(),
        );

        fallback_duration(
            &mut self.monitor.summary_interval,
            "monitor.summary_interval",
            default_summary_interval(),
        );
    }
}

fn fallback_duration(value: &mut Duration, key: &str, default: Duration) {
    if value.is_zero() {
        warn!(key, default = ?default, "setting must be positive, using default");
        *value = default;
    }
}

fn fallback_count(value: &mut usize, key: &str, default: usize) {
    if *value == 0 {
        warn!(key, default, "setting must be positive, using default");
        *value = default;
    }
}
