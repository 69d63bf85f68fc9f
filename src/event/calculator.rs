use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::export::health::HealthMetrics;

use super::health::{HealthCounts, HealthScoreState, WeightSetting};
use super::{EventItem, FabricEvent, NodeEvents, NodeType, Severity, SeverityCounts};

/// One row of the worst-nodes list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSummary {
    pub lid: u32,
    pub node_desc: String,
    pub node_type: NodeType,
    /// Severity of the node's most recent event.
    pub severity: Severity,
    pub time: u64,
}

/// Immutable snapshot published after every ingest or sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventImage {
    pub generated_at: u64,
    pub health_score: f64,
    pub switch_states: SeverityCounts,
    pub hfi_states: SeverityCounts,
    pub worst_nodes: Vec<NodeSummary>,
    pub events: Vec<NodeEvents>,
}

/// What collaborators read from the calculator.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub health_score: f64,
    pub switch_states: SeverityCounts,
    pub hfi_states: SeverityCounts,
    pub worst_nodes: Vec<NodeSummary>,
    pub events: Vec<NodeEvents>,
}

struct CalcState {
    nodes: HashMap<u32, NodeEvents>,
    switch_states: SeverityCounts,
    hfi_states: SeverityCounts,
    window: Duration,
    worst_nodes: usize,
    health: HealthScoreState,
}

impl CalcState {
    fn states_mut(&mut self, node_type: NodeType) -> &mut SeverityCounts {
        match node_type {
            NodeType::Switch => &mut self.switch_states,
            NodeType::Hfi => &mut self.hfi_states,
        }
    }

    /// Moves a node between per-severity buckets when its overall severity changes.
    fn shift(&mut self, node_type: NodeType, old: Option<Severity>, new: Option<Severity>) {
        if old == new {
            return;
        }
        let states = self.states_mut(node_type);
        if let Some(s) = old {
            states[s] = states[s].saturating_sub(1);
        }
        if let Some(s) = new {
            states[s] += 1;
        }
    }

    fn ingest(&mut self, event: &FabricEvent) {
        let node = self.nodes.entry(event.lid).or_insert_with(|| {
            NodeEvents::new(event.lid, event.node_desc.clone(), event.node_type)
        });
        if !event.node_desc.is_empty() && node.node_desc != event.node_desc {
            node.node_desc = event.node_desc.clone();
        }

        let node_type = node.node_type;
        let old = node.overall_severity();
        node.add(EventItem {
            time: event.time,
            kind: event.kind.clone(),
            severity: event.severity,
        });
        let new = node.overall_severity();
        self.shift(node_type, old, new);
    }

    fn sweep(&mut self, now: u64) -> usize {
        let cutoff = now.saturating_sub(self.window.as_secs());
        let mut shifts = Vec::new();
        let mut removed = 0;

        self.nodes.retain(|_, node| {
            let old = node.overall_severity();
            node.clear(cutoff);
            let new = node.overall_severity();
            if old != new {
                shifts.push((node.node_type, old, new));
            }
            if node.is_empty() {
                removed += 1;
                false
            } else {
                true
            }
        });

        for (node_type, old, new) in shifts {
            self.shift(node_type, old, new);
        }
        removed
    }

    fn image(&self, now: u64) -> EventImage {
        let mut ranked: Vec<&NodeEvents> = self.nodes.values().collect();
        ranked.sort_by(|a, b| {
            let ka = a.latest().map(|e| (e.severity, e.time));
            let kb = b.latest().map(|e| (e.severity, e.time));
            kb.cmp(&ka).then(a.lid.cmp(&b.lid))
        });

        let worst_nodes = ranked
            .iter()
            .take(self.worst_nodes)
            .filter_map(|n| {
                n.latest().map(|e| NodeSummary {
                    lid: n.lid,
                    node_desc: n.node_desc.clone(),
                    node_type: n.node_type,
                    severity: e.severity,
                    time: e.time,
                })
            })
            .collect();

        EventImage {
            generated_at: now,
            health_score: self.health.score(&self.switch_states, &self.hfi_states),
            switch_states: self.switch_states,
            hfi_states: self.hfi_states,
            worst_nodes,
            events: ranked.into_iter().cloned().collect(),
        }
    }
}

/// Sliding-window aggregation of fabric events into a health score.
///
/// Writers serialize on an internal lock. Readers only load the last
/// published [`EventImage`] and never block writers.
pub struct EventCalculator {
    state: Mutex<CalcState>,
    image: ArcSwap<EventImage>,
    metrics: Option<Arc<HealthMetrics>>,
}

impl EventCalculator {
    pub fn new(window: Duration, worst_nodes: usize, weights: [WeightSetting; 6]) -> Self {
        Self {
            state: Mutex::new(CalcState {
                nodes: HashMap::new(),
                switch_states: SeverityCounts::default(),
                hfi_states: SeverityCounts::default(),
                window,
                worst_nodes,
                health: HealthScoreState::new(weights),
            }),
            image: ArcSwap::from_pointee(EventImage {
                health_score: 100.0,
                ..EventImage::default()
            }),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Ingests `events`, sweeps expired ones and publishes a new image.
    pub fn on_new_event(&self, events: &[FabricEvent]) {
        self.on_new_event_at(events, unix_now());
    }

    pub fn on_new_event_at(&self, events: &[FabricEvent], now: u64) {
        let mut st = self.state.lock();
        for event in events {
            st.ingest(event);
        }
        if let Some(m) = &self.metrics {
            m.events_ingested.inc_by(events.len() as f64);
        }
        st.sweep(now);
        self.publish(&st, now);
    }

    /// Drops events that left the window and republishes.
    pub fn sweep(&self) {
        self.sweep_at(unix_now());
    }

    pub fn sweep_at(&self, now: u64) {
        let mut st = self.state.lock();
        let removed = st.sweep(now);
        if removed > 0 {
            debug!(removed, "nodes left the event window");
        }
        self.publish(&st, now);
    }

    /// Feeds the latest per-attribute counts, e.g. from a sweep image.
    pub fn update_counts(&self, counts: HealthCounts) {
        let mut st = self.state.lock();
        if st.health.update_values(counts) {
            debug!(baseline = ?st.health.baseline(), "health baseline grew");
        }
        let now = self.image.load().generated_at;
        self.publish(&st, now);
    }

    /// Applies new window, worst-node and weight settings.
    pub fn reconfigure(&self, window: Duration, worst_nodes: usize, weights: [WeightSetting; 6]) {
        let mut st = self.state.lock();
        st.window = window;
        st.worst_nodes = worst_nodes;
        st.health.set_weights(weights);
        let now = unix_now();
        st.sweep(now);
        self.publish(&st, now);
    }

    fn publish(&self, st: &CalcState, now: u64) {
        let image = st.image(now);
        if let Some(m) = &self.metrics {
            m.health_score.set(image.health_score);
            for (severity, n) in image.switch_states.iter() {
                m.switch_states
                    .with_label_values(&[severity.as_str()])
                    .set(n as f64);
            }
            for (severity, n) in image.hfi_states.iter() {
                m.hfi_states
                    .with_label_values(&[severity.as_str()])
                    .set(n as f64);
            }
        }
        self.image.store(Arc::new(image));
    }

    /// Last published snapshot.
    pub fn image(&self) -> Arc<EventImage> {
        self.image.load_full()
    }

    pub fn health_score(&self) -> f64 {
        self.image.load().health_score
    }

    pub fn summary(&self) -> Summary {
        let image = self.image.load_full();
        Summary {
            health_score: image.health_score,
            switch_states: image.switch_states,
            hfi_states: image.hfi_states,
            worst_nodes: image.worst_nodes.clone(),
            events: image.events.clone(),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
