//! Hierarchy builder: groups micro-clusters into macro-groups by
//! agglomerative clustering of their centroids.
//!
//! The tree has a fixed depth of two. A macro-group with one member is
//! flattened into a top-level leaf, and noise tickets go into a single
//! reserved leaf that is always listed last.

use std::collections::BTreeMap;

use tracing::info;

use crate::algo::clustering::{cosine_distance_matrix, cut_at_distance, hac, Linkage};
use crate::micro::MicroPartition;
use crate::model::{MicroCluster, NOISE_NODE_ID};

/// Membership of one leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafGroup {
    pub id: String,
    pub ticket_ids: Vec<String>,
}

/// Top-level entry of the tree. Children of a parent are always leaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Group {
    Leaf(LeafGroup),
    Parent { id: String, children: Vec<LeafGroup> },
}

impl Group {
    pub fn id(&self) -> &str {
        match self {
            Self::Leaf(leaf) => &leaf.id,
            Self::Parent { id, .. } => id,
        }
    }

    pub fn volume(&self) -> usize {
        match self {
            Self::Leaf(leaf) => leaf.ticket_ids.len(),
            Self::Parent { children, .. } => children.iter().map(|c| c.ticket_ids.len()).sum(),
        }
    }
}

/// Membership tree of a run. Ordered: largest groups first, noise last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hierarchy {
    pub groups: Vec<Group>,
    pub noise: Option<LeafGroup>,
}

impl Hierarchy {
    /// Top-level groups followed by the noise leaf, if any.
    pub fn top_level(&self) -> impl Iterator<Item = Group> + '_ {
        self.groups
            .iter()
            .cloned()
            .chain(self.noise.iter().cloned().map(Group::Leaf))
    }
}

#[derive(Debug, Clone)]
pub struct HierarchyBuilder {
    linkage: Linkage,
    merge_distance: f64,
}

impl HierarchyBuilder {
    pub fn new(linkage: Linkage, merge_distance: f64) -> Self {
        Self {
            linkage,
            merge_distance,
        }
    }

    /// Macro-group index of every micro-cluster, numbered by first appearance.
    pub fn macro_groups(&self, clusters: &[MicroCluster]) -> Vec<usize> {
        let centroids: Vec<&[f32]> = clusters.iter().map(|c| c.centroid.as_slice()).collect();
        let distances = cosine_distance_matrix(&centroids);
        let dendrogram = hac(&distances, centroids.len(), self.linkage);
        cut_at_distance(&dendrogram, self.merge_distance)
    }

    pub fn build(&self, partition: &MicroPartition) -> Hierarchy {
        let assignment = self.macro_groups(&partition.clusters);

        let mut grouped: BTreeMap<usize, Vec<LeafGroup>> = BTreeMap::new();
        for (cluster, macro_idx) in partition.clusters.iter().zip(assignment) {
            grouped.entry(macro_idx).or_default().push(LeafGroup {
                id: format!("micro-{}", cluster.label),
                ticket_ids: cluster.ticket_ids.clone(),
            });
        }

        let mut groups: Vec<Group> = grouped
            .into_iter()
            .map(|(macro_idx, mut children)| {
                if children.len() == 1 {
                    return Group::Leaf(children.remove(0));
                }
                children.sort_by(|a, b| {
                    b.ticket_ids
                        .len()
                        .cmp(&a.ticket_ids.len())
                        .then_with(|| a.id.cmp(&b.id))
                });
                Group::Parent {
                    id: format!("macro-{macro_idx}"),
                    children,
                }
            })
            .collect();
        groups.sort_by(|a, b| {
            b.volume()
                .cmp(&a.volume())
                .then_with(|| a.id().cmp(b.id()))
        });

        let noise = (!partition.noise.is_empty()).then(|| LeafGroup {
            id: NOISE_NODE_ID.to_string(),
            ticket_ids: partition.noise.clone(),
        });

        info!(
            micro = partition.clusters.len(),
            top_level = groups.len(),
            parents = groups
                .iter()
                .filter(|g| matches!(g, Group::Parent { .. }))
                .count(),
            noise = partition.noise.len(),
            "hierarchy built"
        );
        Hierarchy { groups, noise }
    }
}
