//! Data model of the fabric performance service and the retrieval interface.

pub mod http;

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::event::{FabricEvent, HealthAttribute, HealthCounts, NodeType, Severity};

pub use self::http::HttpSource;

/// Identifies a sweep image: an image number plus an offset from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ImageId {
    pub number: u64,
    pub offset: i32,
}

impl ImageId {
    /// The most recent image.
    pub const LATEST: ImageId = ImageId {
        number: 0,
        offset: 0,
    };

    pub fn is_latest(&self) -> bool {
        *self == Self::LATEST
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.number, self.offset)
    }
}

/// Summary of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub image_id: ImageId,
    /// Unix seconds at which the sweep started.
    pub sweep_start: u64,
    pub sweep_duration_us: u64,
    pub num_switch_nodes: u64,
    pub num_hfi_nodes: u64,
    pub num_switch_ports: u64,
    pub num_hfi_ports: u64,
    /// Links between two switches.
    pub num_links: u64,
    pub num_hfi_links: u64,
    #[serde(default)]
    pub num_unexpected_clear_ports: u64,
}

impl ImageInfo {
    /// Node, port and link counts in health-score attribute order.
    pub fn health_counts(&self) -> HealthCounts {
        let mut counts = HealthCounts::default();
        counts.set(HealthAttribute::Switches, self.num_switch_nodes);
        counts.set(HealthAttribute::Hfis, self.num_hfi_nodes);
        counts.set(HealthAttribute::SwitchPorts, self.num_switch_ports);
        counts.set(HealthAttribute::HfiPorts, self.num_hfi_ports);
        counts.set(HealthAttribute::InterSwitchLinks, self.num_links);
        counts.set(HealthAttribute::HfiLinks, self.num_hfi_links);
        counts
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtilStats {
    pub total_mbps: u64,
    pub total_kpps: u64,
    pub avg_mbps: u32,
    pub min_mbps: u32,
    pub max_mbps: u32,
    pub avg_kpps: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub integrity_errors: u32,
    pub congestion: u32,
    pub sma_congestion: u32,
    pub bubble: u32,
    pub security_errors: u32,
    pub routing_errors: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name: String,
    pub image_id: ImageId,
    pub num_internal_ports: u32,
    pub num_external_ports: u32,
    pub internal_util: UtilStats,
    pub send_util: UtilStats,
    pub recv_util: UtilStats,
    pub internal_errors: ErrorSummary,
    pub external_errors: ErrorSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VfInfo {
    pub name: String,
    pub image_id: ImageId,
    pub num_ports: u32,
    pub internal_util: UtilStats,
    pub internal_errors: ErrorSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCounters {
    pub lid: u32,
    pub port: u8,
    pub image_id: ImageId,
    pub xmit_data: u64,
    pub rcv_data: u64,
    pub xmit_pkts: u64,
    pub rcv_pkts: u64,
    pub xmit_wait: u64,
    pub symbol_errors: u64,
    pub link_error_recovery: u32,
    pub link_downed: u32,
    pub rcv_errors: u64,
    pub xmit_discards: u64,
    pub congestion_discards: u64,
}

/// A port belonging to a group or virtual fabric.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMember {
    pub lid: u32,
    pub port: u8,
    #[serde(default)]
    pub node_desc: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub members: Vec<PortMember>,
}

impl GroupConfig {
    pub fn contains_node(&self, lid: u32) -> bool {
        self.members.iter().any(|m| m.lid == lid)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfConfig {
    pub name: String,
    pub members: Vec<PortMember>,
}

impl VfConfig {
    pub fn contains_node(&self, lid: u32) -> bool {
        self.members.iter().any(|m| m.lid == lid)
    }
}

/// Performance manager settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PmConfig {
    pub sweep_interval_secs: u32,
    pub max_clients: u32,
    pub total_images: u32,
    pub freeze_frame_images: u32,
    pub freeze_frame_lease_secs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    NodeAppeared,
    NodeDisappeared,
    NodeChanged,
    LinkChanged,
    Other,
}

impl NoticeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NodeAppeared => "node_appeared",
            Self::NodeDisappeared => "node_disappeared",
            Self::NodeChanged => "node_changed",
            Self::LinkChanged => "link_changed",
            Self::Other => "other",
        }
    }
}

/// Asynchronous change event reported by the fabric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub id: u64,
    /// Unix seconds.
    pub time: u64,
    pub kind: NoticeKind,
    pub severity: Severity,
    pub node_type: NodeType,
    /// Affected node; 0 when the notice names none.
    #[serde(default)]
    pub lid: u32,
    #[serde(default)]
    pub node_desc: String,
}

impl Notice {
    pub fn affected_node(&self) -> Option<u32> {
        (self.lid != 0).then_some(self.lid)
    }

    pub fn to_event(&self) -> FabricEvent {
        FabricEvent {
            lid: self.lid,
            node_desc: self.node_desc.clone(),
            node_type: self.node_type,
            time: self.time,
            kind: self.kind.as_str().to_string(),
            severity: self.severity,
        }
    }
}

/// Retrieval interface of the fabric performance service.
pub trait PerformanceSource: Send + Sync + 'static {
    fn image_info(
        &self,
        image: ImageId,
    ) -> impl Future<Output = Result<ImageInfo, FetchError>> + Send;

    fn group_list(&self) -> impl Future<Output = Result<Vec<String>, FetchError>> + Send;

    fn group_info(
        &self,
        group: &str,
        image: ImageId,
    ) -> impl Future<Output = Result<GroupInfo, FetchError>> + Send;

    fn group_config(
        &self,
        group: &str,
    ) -> impl Future<Output = Result<GroupConfig, FetchError>> + Send;

    fn vf_list(&self) -> impl Future<Output = Result<Vec<String>, FetchError>> + Send;

    fn vf_info(
        &self,
        vf: &str,
        image: ImageId,
    ) -> impl Future<Output = Result<VfInfo, FetchError>> + Send;

    fn vf_config(&self, vf: &str) -> impl Future<Output = Result<VfConfig, FetchError>> + Send;

    fn port_counters(
        &self,
        lid: u32,
        port: u8,
        image: ImageId,
    ) -> impl Future<Output = Result<PortCounters, FetchError>> + Send;

    fn pm_config(&self) -> impl Future<Output = Result<PmConfig, FetchError>> + Send;

    /// Notices raised since the previous call.
    fn notices(&self) -> impl Future<Output = Result<Vec<Notice>, FetchError>> + Send;
}
