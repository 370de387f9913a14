//! Density-based hierarchical clustering (HDBSCAN) over a condensed distance
//! matrix.
//!
//! Pipeline:
//! 1. Core distance of each point (distance to its `min_samples`-th neighbour, self included)
//! 2. Mutual reachability graph, minimum spanning tree (Prim, O(n^2))
//! 3. Single-linkage tree from the sorted MST edges
//! 4. Condensed tree: splits smaller than `min_cluster_size` become points falling out
//! 5. Excess-of-mass selection of the most stable clusters
//! 6. Labelling: points outside every selected cluster are noise
//!
//! Every step breaks ties by index, so labels are a pure function of the
//! matrix and the parameters.

use rayon::prelude::*;

use super::clustering::pair_distance;

/// Distances below this are treated as this value when converted to lambda = 1/d.
const MIN_DISTANCE: f64 = 1e-6;

/// Outlier score above which a point leaves a single root cluster. 0.5 means
/// the point joins at more than twice the distance that holds the typical
/// member.
pub const DEFAULT_OUTLIER_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HdbscanParams {
    /// Smallest group of points promoted to a cluster (at least 2).
    pub min_cluster_size: usize,
    /// Neighbourhood size for core distances (at least 1).
    pub min_samples: usize,
    /// When the whole data set forms a single cluster, points whose outlier
    /// score `1 - lambda_p / median_lambda` exceeds this become noise.
    /// `lambda_p` is the density at which the point leaves the cluster.
    pub outlier_threshold: f64,
}

impl Default for HdbscanParams {
    fn default() -> Self {
        Self {
            min_cluster_size: 5,
            min_samples: 5,
            outlier_threshold: DEFAULT_OUTLIER_THRESHOLD,
        }
    }
}

/// Run HDBSCAN. Returns one label per point: `Some(cluster)` with clusters
/// numbered 0.. in order of first appearance, or `None` for noise.
pub fn hdbscan(distances: &[f64], n: usize, params: &HdbscanParams) -> Vec<Option<usize>> {
    let min_cluster_size = params.min_cluster_size.max(2);
    if n < min_cluster_size {
        return vec![None; n];
    }

    let core = core_distances(distances, n, params.min_samples.max(1));
    let edges = mutual_reachability_mst(distances, n, &core);
    let tree = SingleLinkage::from_edges(n, edges);
    let clusters = condense(&tree, min_cluster_size);
    let selected = select_clusters(&clusters);
    label_points(&clusters, &selected, n, params.outlier_threshold)
}

/// Distance from every point to its k-th nearest neighbour (self counts as the first).
pub fn core_distances(distances: &[f64], n: usize, min_samples: usize) -> Vec<f64> {
    let k = (min_samples - 1).min(n.saturating_sub(1));
    if k == 0 {
        return vec![0.0; n];
    }
    (0..n)
        .into_par_iter()
        .map(|i| {
            let mut row: Vec<f64> = (0..n)
                .filter(|&j| j != i)
                .map(|j| pair_distance(distances, i, j, n))
                .collect();
            let (_, kth, _) = row.select_nth_unstable_by(k - 1, |a, b| {
                a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
            });
            *kth
        })
        .collect()
}

/// Prim's algorithm on the complete mutual reachability graph.
/// Edges are returned sorted by (weight, lower index, higher index).
fn mutual_reachability_mst(distances: &[f64], n: usize, core: &[f64]) -> Vec<(usize, usize, f64)> {
    let reach = |i: usize, j: usize| -> f64 {
        pair_distance(distances, i, j, n).max(core[i]).max(core[j])
    };

    let mut in_tree = vec![false; n];
    let mut best = vec![f64::INFINITY; n];
    let mut from = vec![0usize; n];
    let mut edges = Vec::with_capacity(n.saturating_sub(1));
    let mut current = 0;
    in_tree[0] = true;

    for _ in 1..n {
        for j in 0..n {
            if in_tree[j] {
                continue;
            }
            let d = reach(current, j);
            if d < best[j] {
                best[j] = d;
                from[j] = current;
            }
        }

        let mut next: Option<usize> = None;
        for j in 0..n {
            if in_tree[j] {
                continue;
            }
            match next {
                Some(k) if best[j] >= best[k] => {}
                _ => next = Some(j),
            }
        }
        let Some(next) = next else { break };

        edges.push((from[next].min(next), from[next].max(next), best[next]));
        in_tree[next] = true;
        current = next;
    }

    edges.sort_by(|a, b| {
        a.2.partial_cmp(&b.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
            .then(a.1.cmp(&b.1))
    });
    edges
}

/// Single-linkage tree. Node ids below `n` are points; merge `m` is node `n + m`.
struct SingleLinkage {
    n: usize,
    left: Vec<usize>,
    right: Vec<usize>,
    distance: Vec<f64>,
    size: Vec<usize>,
}

impl SingleLinkage {
    fn from_edges(n: usize, edges: Vec<(usize, usize, f64)>) -> Self {
        let total = n + edges.len();
        let mut parent: Vec<usize> = (0..total).collect();
        let mut size = vec![1usize; total];
        let mut left = Vec::with_capacity(edges.len());
        let mut right = Vec::with_capacity(edges.len());
        let mut distance = Vec::with_capacity(edges.len());

        fn find(parent: &mut [usize], mut x: usize) -> usize {
            while parent[x] != x {
                parent[x] = parent[parent[x]];
                x = parent[x];
            }
            x
        }

        for (m, (a, b, w)) in edges.into_iter().enumerate() {
            let ra = find(&mut parent, a);
            let rb = find(&mut parent, b);
            let id = n + m;
            parent[ra] = id;
            parent[rb] = id;
            size[id] = size[ra] + size[rb];
            left.push(ra);
            right.push(rb);
            distance.push(w);
        }

        Self {
            n,
            left,
            right,
            distance,
            size,
        }
    }

    fn root(&self) -> usize {
        self.n + self.left.len() - 1
    }

    fn leaves(&self, node: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(x) = stack.pop() {
            if x < self.n {
                out.push(x);
            } else {
                stack.push(self.right[x - self.n]);
                stack.push(self.left[x - self.n]);
            }
        }
        out
    }
}

/// A cluster of the condensed tree.
#[derive(Debug, Clone)]
struct CondensedCluster {
    parent: Option<usize>,
    birth: f64,
    children: Vec<usize>,
    /// Points whose last cluster is this one, with the lambda they left at.
    points: Vec<(usize, f64)>,
    stability: f64,
}

impl CondensedCluster {
    fn new(parent: Option<usize>, birth: f64) -> Self {
        Self {
            parent,
            birth,
            children: vec![],
            points: vec![],
            stability: 0.0,
        }
    }
}

fn lambda(distance: f64) -> f64 {
    1.0 / distance.max(MIN_DISTANCE)
}

/// Walk the single-linkage tree top-down. Cluster ids grow with depth, so a
/// child always has a larger id than its parent.
fn condense(tree: &SingleLinkage, min_cluster_size: usize) -> Vec<CondensedCluster> {
    let mut clusters = vec![CondensedCluster::new(None, 0.0)];
    let mut stack = vec![(tree.root(), 0usize)];

    while let Some((node, cluster)) = stack.pop() {
        let m = node - tree.n;
        let lam = lambda(tree.distance[m]);
        let (l, r) = (tree.left[m], tree.right[m]);
        let l_big = tree.size[l] >= min_cluster_size;
        let r_big = tree.size[r] >= min_cluster_size;

        match (l_big, r_big) {
            (true, true) => {
                for child in [l, r] {
                    let id = clusters.len();
                    clusters.push(CondensedCluster::new(Some(cluster), lam));
                    clusters[cluster].children.push(id);
                    stack.push((child, id));
                }
            }
            (true, false) => {
                fall_out(tree, r, lam, &mut clusters[cluster]);
                stack.push((l, cluster));
            }
            (false, true) => {
                fall_out(tree, l, lam, &mut clusters[cluster]);
                stack.push((r, cluster));
            }
            (false, false) => {
                fall_out(tree, l, lam, &mut clusters[cluster]);
                fall_out(tree, r, lam, &mut clusters[cluster]);
            }
        }
    }

    for c in (0..clusters.len()).rev() {
        let birth = clusters[c].birth;
        let own: f64 = clusters[c].points.iter().map(|(_, lp)| lp - birth).sum();
        let from_children: f64 = clusters[c]
            .children
            .iter()
            .map(|&ch| {
                let child_size = subtree_size(&clusters, ch);
                child_size as f64 * (clusters[ch].birth - birth)
            })
            .sum();
        clusters[c].stability = own + from_children;
    }

    clusters
}

fn fall_out(tree: &SingleLinkage, node: usize, lam: f64, cluster: &mut CondensedCluster) {
    for p in tree.leaves(node) {
        cluster.points.push((p, lam));
    }
}

fn subtree_size(clusters: &[CondensedCluster], c: usize) -> usize {
    clusters[c].points.len()
        + clusters[c]
            .children
            .iter()
            .map(|&ch| subtree_size(clusters, ch))
            .sum::<usize>()
}

/// Excess-of-mass selection. The root is only eligible when it never splits.
fn select_clusters(clusters: &[CondensedCluster]) -> Vec<bool> {
    let k = clusters.len();
    let mut selected = vec![false; k];
    let mut subtree_stability = vec![0.0; k];

    for c in (1..k).rev() {
        let own = clusters[c].stability;
        if clusters[c].children.is_empty() {
            selected[c] = true;
            subtree_stability[c] = own;
            continue;
        }
        let children_sum: f64 = clusters[c]
            .children
            .iter()
            .map(|&ch| subtree_stability[ch])
            .sum();
        if own >= children_sum {
            selected[c] = true;
            subtree_stability[c] = own;
            let mut stack = clusters[c].children.clone();
            while let Some(d) = stack.pop() {
                selected[d] = false;
                stack.extend(clusters[d].children.iter().copied());
            }
        } else {
            subtree_stability[c] = children_sum;
        }
    }

    selected[0] = clusters[0].children.is_empty();
    selected
}

fn label_points(
    clusters: &[CondensedCluster],
    selected: &[bool],
    n: usize,
    outlier_threshold: f64,
) -> Vec<Option<usize>> {
    // nearest selected ancestor-or-self, resolved top-down
    let mut owner: Vec<Option<usize>> = vec![None; clusters.len()];
    for c in 0..clusters.len() {
        owner[c] = if selected[c] {
            Some(c)
        } else {
            clusters[c].parent.and_then(|p| owner[p])
        };
    }

    let mut assignment: Vec<Option<usize>> = vec![None; n];
    for (c, cluster) in clusters.iter().enumerate() {
        for &(p, _) in &cluster.points {
            assignment[p] = owner[c];
        }
    }

    if selected[0] {
        for p in root_outliers(&clusters[0], outlier_threshold) {
            assignment[p] = None;
        }
    }

    let mut relabel: Vec<Option<usize>> = vec![None; clusters.len()];
    let mut next = 0;
    assignment
        .into_iter()
        .map(|a| {
            a.map(|c| {
                *relabel[c].get_or_insert_with(|| {
                    let l = next;
                    next += 1;
                    l
                })
            })
        })
        .collect()
}

/// Points of a never-splitting root that fall out far earlier than its
/// typical member, scored against the median fall-out lambda.
fn root_outliers(root: &CondensedCluster, threshold: f64) -> Vec<usize> {
    let mut lambdas: Vec<f64> = root.points.iter().map(|(_, l)| *l).collect();
    if lambdas.is_empty() {
        return Vec::new();
    }
    lambdas.sort_by(|a, b| a.total_cmp(b));
    let median = lambdas[lambdas.len() / 2];
    root.points
        .iter()
        .filter(|(_, lp)| 1.0 - lp / median > threshold)
        .map(|&(p, _)| p)
        .collect()
}
