//! Fabric fault events and the sliding-window health score.

pub mod calculator;
pub mod health;

use std::fmt;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

pub use self::calculator::{EventCalculator, EventImage, NodeSummary, Summary};
pub use self::health::{HealthAttribute, HealthCounts, HealthScoreState, WeightSetting};

/// Event severity, least to most severe. The declaration order is the
/// ordering used for comparisons and for [`SeverityCounts`] indices.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [Self::Info, Self::Warning, Self::Error, Self::Critical];

    pub const fn index(self) -> usize {
        match self {
            Self::Info => 0,
            Self::Warning => 1,
            Self::Error => 2,
            Self::Critical => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    /// Fraction of a node counted as unhealthy at this severity.
    pub fn penalty(self) -> f64 {
        match self {
            Self::Info => 0.0,
            Self::Warning => 0.25,
            Self::Error => 0.5,
            Self::Critical => 1.0,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node counts per severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeverityCounts([u64; 4]);

impl SeverityCounts {
    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Severity, u64)> + '_ {
        Severity::ALL.iter().map(move |s| (*s, self.0[s.index()]))
    }
}

impl Index<Severity> for SeverityCounts {
    type Output = u64;

    fn index(&self, s: Severity) -> &u64 {
        &self.0[s.index()]
    }
}

impl IndexMut<Severity> for SeverityCounts {
    fn index_mut(&mut self, s: Severity) -> &mut u64 {
        &mut self.0[s.index()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    #[default]
    Switch,
    Hfi,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Switch => "switch",
            Self::Hfi => "hfi",
        }
    }
}

/// One event in a node's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventItem {
    /// Unix seconds.
    pub time: u64,
    pub kind: String,
    pub severity: Severity,
}

/// An event as ingested, naming the node it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricEvent {
    pub lid: u32,
    #[serde(default)]
    pub node_desc: String,
    pub node_type: NodeType,
    pub time: u64,
    pub kind: String,
    pub severity: Severity,
}

/// Event history of one node, in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeEvents {
    pub lid: u32,
    pub node_desc: String,
    pub node_type: NodeType,
    events: Vec<EventItem>,
    overall: Option<Severity>,
}

impl NodeEvents {
    pub fn new(lid: u32, node_desc: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            lid,
            node_desc: node_desc.into(),
            node_type,
            events: Vec::new(),
            overall: None,
        }
    }

    pub fn events(&self) -> &[EventItem] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Highest severity currently in the history.
    pub fn overall_severity(&self) -> Option<Severity> {
        self.overall
    }

    pub fn latest(&self) -> Option<&EventItem> {
        self.events.last()
    }

    pub fn add(&mut self, item: EventItem) {
        self.overall = Some(self.overall.map_or(item.severity, |s| s.max(item.severity)));
        self.events.push(item);
    }

    /// Drops events at or before `cutoff` and recomputes the overall severity
    /// from what remains.
    pub fn clear(&mut self, cutoff: u64) {
        self.events.retain(|e| e.time > cutoff);
        self.overall = self.events.iter().map(|e| e.severity).max();
    }
}
