//! Data model shared by every pipeline stage and the persisted result.
//!
//! Field names of [`AnalysisResult`] and everything below it are the output
//! schema; bump [`SCHEMA_VERSION`] when they change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: u32 = 1;

/// Id of the reserved top-level leaf collecting noise tickets.
pub const NOISE_NODE_ID: &str = "noise";

/// One support record. Immutable input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub system: String,
    pub requester: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_email: Option<String>,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subarea: Option<String>,
    pub status: String,
    pub opened_at: DateTime<Utc>,
    pub title: String,
    pub description: String,
}

/// Cleaned comparison string of one ticket plus its content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedText {
    pub ticket_id: String,
    pub text: String,
    /// Hex SHA-256 of `text`.
    pub fingerprint: String,
    /// Title and description were empty after cleaning; never vectorized.
    pub empty: bool,
}

/// Assignment of one ticket by the micro-cluster engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClusterLabel {
    Cluster(usize),
    Noise,
}

impl ClusterLabel {
    pub fn is_noise(&self) -> bool {
        matches!(self, Self::Noise)
    }
}

/// A dense group found by the first clustering pass.
#[derive(Debug, Clone, PartialEq)]
pub struct MicroCluster {
    pub label: usize,
    /// Sorted ticket ids.
    pub ticket_ids: Vec<String>,
    /// Mean of the member vectors.
    pub centroid: Vec<f32>,
}

/// One `(key, count)` entry of a breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Count {
    pub key: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthCount {
    /// `YYYY-MM`
    pub month: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekdayCount {
    /// `Mon` .. `Sun`
    pub day: String,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendKind {
    Rising,
    Stable,
    Falling,
}

/// Last ISO week with tickets against the calendar week before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub kind: TrendKind,
    pub change_pct: f64,
    pub last_week: usize,
    pub previous_week: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcentrationKind {
    /// Few requesters open most of the tickets.
    Concentrated,
    Normal,
    /// Almost every ticket comes from a different requester.
    Widespread,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concentration {
    pub kind: ConcentrationKind,
    /// unique requesters / volume
    pub ratio: f64,
    pub unique_requesters: usize,
}

/// Exact statistics of a node, computed from the raw tickets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub volume: usize,
    pub by_service: Vec<Count>,
    pub by_subarea: Vec<Count>,
    pub by_requester: Vec<Count>,
    pub by_status: Vec<Count>,
    pub timeline: Vec<MonthCount>,
    pub weekdays: Vec<WeekdayCount>,
    pub trend: Trend,
    pub concentration: Concentration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelStatus {
    /// Not yet labeled; never present in a persisted result.
    Pending,
    Labeled,
    Inconclusive,
    Failed,
    /// Fixed label that is never generated (the noise leaf).
    Fixed,
}

/// Leaf or parent payload of a node. A node is never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Members {
    Leaf { ticket_ids: Vec<String> },
    Parent { children: Vec<ClusterNode> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: String,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub keywords: Vec<String>,
    pub label_status: LabelStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_error: Option<String>,
    pub metrics: Metrics,
    #[serde(flatten)]
    pub members: Members,
}

impl ClusterNode {
    pub fn is_leaf(&self) -> bool {
        matches!(self.members, Members::Leaf { .. })
    }

    pub fn is_noise(&self) -> bool {
        self.id == NOISE_NODE_ID
    }

    pub fn children(&self) -> &[ClusterNode] {
        match &self.members {
            Members::Parent { children } => children,
            Members::Leaf { .. } => &[],
        }
    }

    /// Ticket ids of this node: direct for a leaf, unioned over children for a parent.
    pub fn ticket_ids(&self) -> Vec<&str> {
        match &self.members {
            Members::Leaf { ticket_ids } => ticket_ids.iter().map(String::as_str).collect(),
            Members::Parent { children } => {
                children.iter().flat_map(|c| c.ticket_ids()).collect()
            }
        }
    }

    /// Number of nodes in this subtree, this one included.
    pub fn node_count(&self) -> usize {
        1 + self.children().iter().map(|c| c.node_count()).sum::<usize>()
    }
}

/// Effective clustering parameters of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringParams {
    pub min_cluster_size: usize,
    pub min_samples: usize,
    pub outlier_threshold: f64,
    pub macro_linkage: String,
    pub macro_merge_distance: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub external_calls: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub schema_version: u32,
    pub run_id: String,
    pub system: String,
    pub window_days: u32,
    pub generated_at: DateTime<Utc>,
    pub total_tickets: usize,
    /// Tickets with no usable text after cleaning.
    pub excluded_tickets: usize,
    pub embedding_failures: usize,
    /// Every node of the tree, children included.
    pub total_nodes: usize,
    pub noise_ratio: f64,
    pub clustering: ClusteringParams,
    pub config_hash: String,
    pub cache: CacheStats,
}

/// Persisted output of one run. Superseded, never edited, by the next run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub metadata: RunMetadata,
    pub nodes: Vec<ClusterNode>,
}
