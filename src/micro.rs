//! Micro-cluster engine: HDBSCAN over the cosine distances of the resolved
//! ticket vectors.

use std::collections::BTreeMap;

use tracing::info;

use crate::algo::clustering::{centroid, cosine_distance_matrix};
use crate::algo::hdbscan::{hdbscan, HdbscanParams};
use crate::model::{ClusterLabel, MicroCluster};

/// Flat partition of a run's tickets.
#[derive(Debug, Clone, Default)]
pub struct MicroPartition {
    /// Label of every input ticket, vectorized or not.
    pub assignments: BTreeMap<String, ClusterLabel>,
    pub clusters: Vec<MicroCluster>,
    /// Sorted ids of the noise tickets.
    pub noise: Vec<String>,
}

impl MicroPartition {
    pub fn noise_ratio(&self) -> f64 {
        if self.assignments.is_empty() {
            0.0
        } else {
            self.noise.len() as f64 / self.assignments.len() as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct MicroClusterEngine {
    params: HdbscanParams,
}

impl MicroClusterEngine {
    pub fn new(params: HdbscanParams) -> Self {
        Self { params }
    }

    /// Cluster `(ticket_id, vector)` points. Tickets in `unresolved` (no
    /// vector) are always noise. Points are ordered by ticket id first, so
    /// the partition does not depend on input order.
    pub fn cluster(&self, points: &[(String, Vec<f32>)], unresolved: &[String]) -> MicroPartition {
        let mut order: Vec<&(String, Vec<f32>)> = points.iter().collect();
        order.sort_by(|a, b| a.0.cmp(&b.0));

        let vectors: Vec<&[f32]> = order.iter().map(|(_, v)| v.as_slice()).collect();
        let distances = cosine_distance_matrix(&vectors);
        let labels = hdbscan(&distances, vectors.len(), &self.params);

        let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut partition = MicroPartition::default();
        for (idx, label) in labels.iter().enumerate() {
            let id = order[idx].0.clone();
            match label {
                Some(l) => {
                    members.entry(*l).or_default().push(idx);
                    partition.assignments.insert(id, ClusterLabel::Cluster(*l));
                }
                None => {
                    partition.assignments.insert(id.clone(), ClusterLabel::Noise);
                    partition.noise.push(id);
                }
            }
        }
        for id in unresolved {
            partition.assignments.insert(id.clone(), ClusterLabel::Noise);
            partition.noise.push(id.clone());
        }
        partition.noise.sort();
        partition.noise.dedup();

        partition.clusters = members
            .into_iter()
            .map(|(label, idxs)| {
                let member_vectors: Vec<&[f32]> = idxs.iter().map(|&i| vectors[i]).collect();
                MicroCluster {
                    label,
                    ticket_ids: idxs.iter().map(|&i| order[i].0.clone()).collect(),
                    centroid: centroid(&member_vectors),
                }
            })
            .collect();

        info!(
            points = vectors.len(),
            unresolved = unresolved.len(),
            clusters = partition.clusters.len(),
            noise = partition.noise.len(),
            min_cluster_size = self.params.min_cluster_size,
            "micro-clustering done"
        );
        partition
    }
}
