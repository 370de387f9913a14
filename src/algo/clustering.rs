use rayon::prelude::*;

/// How the distance between two groups is derived from their members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// Closest pair of members.
    Single,
    /// Farthest pair of members.
    Complete,
    /// Mean over all member pairs (UPGMA).
    Average,
    /// Smallest increase of within-group variance.
    Ward,
}

impl Linkage {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Some(Self::Single),
            "complete" => Some(Self::Complete),
            "average" | "upgma" => Some(Self::Average),
            "ward" => Some(Self::Ward),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Complete => "complete",
            Self::Average => "average",
            Self::Ward => "ward",
        }
    }

    /// Lance-Williams recurrence: distance from `k` to the union of `i` and
    /// `j`, given the distances before the merge and the group sizes.
    fn merged_distance(&self, d_ik: f64, d_jk: f64, d_ij: f64, sizes: (f64, f64, f64)) -> f64 {
        let (ni, nj, nk) = sizes;
        match self {
            Self::Single => d_ik.min(d_jk),
            Self::Complete => d_ik.max(d_jk),
            Self::Average => (ni * d_ik + nj * d_jk) / (ni + nj),
            Self::Ward => ((ni + nk) * d_ik + (nj + nk) * d_jk - nk * d_ij) / (ni + nj + nk),
        }
    }
}

/// Merge history of an agglomerative run.
///
/// Merge `m` creates group id `n + m`; ids below `n` are the input items.
#[derive(Debug, Clone)]
pub struct Dendrogram {
    pub merges: Vec<Merge>,
    pub n: usize,
}

#[derive(Debug, Clone)]
pub struct Merge {
    pub cluster_a: usize,
    pub cluster_b: usize,
    pub distance: f64,
    /// Items under the new group.
    pub size: usize,
}

/// Live group during agglomeration, stored in the slot of its lowest item.
#[derive(Debug, Clone, Copy)]
struct Slot {
    id: usize,
    size: usize,
}

/// Agglomerative clustering over a condensed distance matrix of `n` items.
///
/// Always merges the closest pair of live groups; ties go to the pair with
/// the lowest slot indices, so the result depends on the matrix only.
pub fn hac(distances: &[f64], n: usize, linkage: Linkage) -> Dendrogram {
    let mut merges = Vec::with_capacity(n.saturating_sub(1));
    if n < 2 {
        return Dendrogram { merges, n };
    }

    let mut work = distances.to_vec();
    let mut slots: Vec<Option<Slot>> = (0..n).map(|id| Some(Slot { id, size: 1 })).collect();

    for step in 0..n - 1 {
        let mut closest: Option<(usize, usize, f64)> = None;
        for i in 0..n {
            if slots[i].is_none() {
                continue;
            }
            for j in (i + 1)..n {
                if slots[j].is_none() {
                    continue;
                }
                let d = work[condensed_index(i, j, n)];
                if closest.map_or(true, |(_, _, best)| d < best) {
                    closest = Some((i, j, d));
                }
            }
        }
        let Some((i, j, d_ij)) = closest else { break };
        let (Some(a), Some(b)) = (slots[i], slots[j]) else { break };

        for k in 0..n {
            let Some(other) = slots[k] else { continue };
            if k == i || k == j {
                continue;
            }
            let d_ik = pair_distance(&work, i, k, n);
            let d_jk = pair_distance(&work, j, k, n);
            let merged = linkage.merged_distance(
                d_ik,
                d_jk,
                d_ij,
                (a.size as f64, b.size as f64, other.size as f64),
            );
            let (lo, hi) = if i < k { (i, k) } else { (k, i) };
            work[condensed_index(lo, hi, n)] = merged;
        }

        let size = a.size + b.size;
        merges.push(Merge {
            cluster_a: a.id,
            cluster_b: b.id,
            distance: d_ij,
            size,
        });
        slots[i] = Some(Slot { id: n + step, size });
        slots[j] = None;
    }

    Dendrogram { merges, n }
}

/// Cut the dendrogram at a distance threshold: every merge at or below
/// `max_distance` is applied. Returns a label per original item, numbered
/// 0.. in order of first appearance.
pub fn cut_at_distance(dendrogram: &Dendrogram, max_distance: f64) -> Vec<usize> {
    let n = dendrogram.n;
    let total_ids = n + dendrogram.merges.len();
    let mut parent: Vec<Option<usize>> = vec![None; total_ids];

    // Merge distances are non-decreasing for all supported linkages,
    // so the applied merges form a prefix.
    for (m, merge) in dendrogram
        .merges
        .iter()
        .enumerate()
        .take_while(|(_, merge)| merge.distance <= max_distance)
    {
        parent[merge.cluster_a] = Some(n + m);
        parent[merge.cluster_b] = Some(n + m);
    }

    let find_root = |mut id: usize| -> usize {
        while let Some(p) = parent[id] {
            id = p;
        }
        id
    };

    let mut label_of_root: Vec<Option<usize>> = vec![None; total_ids];
    let mut next_label = 0;
    (0..n)
        .map(|item| {
            let root = find_root(item);
            *label_of_root[root].get_or_insert_with(|| {
                let l = next_label;
                next_label += 1;
                l
            })
        })
        .collect()
}

/// Cosine distance matrix (condensed form) over dense vectors.
///
/// A zero vector is at distance 1.0 from everything. Rows are computed in
/// parallel; the result does not depend on the thread count.
pub fn cosine_distance_matrix(vectors: &[&[f32]]) -> Vec<f64> {
    let n = vectors.len();
    if n < 2 {
        return vec![];
    }
    let norms: Vec<f64> = vectors.iter().map(|v| norm(v)).collect();

    let rows: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            ((i + 1)..n)
                .map(|j| {
                    if norms[i] == 0.0 || norms[j] == 0.0 {
                        return 1.0;
                    }
                    let sim = dot(vectors[i], vectors[j]) / (norms[i] * norms[j]);
                    (1.0 - sim).clamp(0.0, 2.0)
                })
                .collect()
        })
        .collect();

    rows.into_iter().flatten().collect()
}

/// Distance between items `i` and `j` in a condensed matrix of `n` items.
pub fn pair_distance(distances: &[f64], i: usize, j: usize, n: usize) -> f64 {
    match i.cmp(&j) {
        std::cmp::Ordering::Equal => 0.0,
        std::cmp::Ordering::Less => distances[condensed_index(i, j, n)],
        std::cmp::Ordering::Greater => distances[condensed_index(j, i, n)],
    }
}

/// Component-wise mean of a set of vectors of equal length.
pub fn centroid(vectors: &[&[f32]]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return vec![];
    };
    let mut sum = vec![0.0f64; first.len()];
    for v in vectors {
        for (acc, x) in sum.iter_mut().zip(v.iter()) {
            *acc += *x as f64;
        }
    }
    let count = vectors.len() as f64;
    sum.into_iter().map(|x| (x / count) as f32).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum()
}

fn norm(v: &[f32]) -> f64 {
    v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt()
}

/// Index into a condensed distance matrix for pair (i, j) where i < j.
pub fn condensed_index(i: usize, j: usize, n: usize) -> usize {
    debug_assert!(i < j);
    i * n - i * (i + 1) / 2 + j - i - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two tight pairs far apart: {0, 1} at 0.1 and {2, 3} at 0.2.
    fn two_pairs() -> (Vec<f64>, usize) {
        // (0,1) (0,2) (0,3) (1,2) (1,3) (2,3)
        (vec![0.1, 0.9, 0.8, 0.7, 0.95, 0.2], 4)
    }

    #[test]
    fn pairs_merge_first() {
        let (d, n) = two_pairs();
        for linkage in [Linkage::Single, Linkage::Complete, Linkage::Average, Linkage::Ward] {
            let dend = hac(&d, n, linkage);
            assert_eq!(dend.merges.len(), 3);
            assert_eq!((dend.merges[0].cluster_a, dend.merges[0].cluster_b), (0, 1));
            assert_eq!((dend.merges[1].cluster_a, dend.merges[1].cluster_b), (2, 3));
            assert_eq!(dend.merges[2].size, 4);
        }
    }

    #[test]
    fn final_distance_depends_on_linkage() {
        let (d, n) = two_pairs();
        let last = |l| hac(&d, n, l).merges[2].distance;
        assert!((last(Linkage::Single) - 0.7).abs() < 1e-12);
        assert!((last(Linkage::Complete) - 0.95).abs() < 1e-12);
        // mean of 0.9, 0.8, 0.7, 0.95
        assert!((last(Linkage::Average) - 0.8375).abs() < 1e-12);
    }

    #[test]
    fn equal_distances_merge_lowest_pair() {
        let d = vec![0.5; 6];
        let dend = hac(&d, 4, Linkage::Average);
        assert_eq!((dend.merges[0].cluster_a, dend.merges[0].cluster_b), (0, 1));
    }

    #[test]
    fn fewer_than_two_items_never_merge() {
        assert!(hac(&[], 0, Linkage::Average).merges.is_empty());
        assert!(hac(&[], 1, Linkage::Average).merges.is_empty());
    }

    #[test]
    fn cut_keeps_far_groups_apart() {
        let (d, n) = two_pairs();
        let dend = hac(&d, n, Linkage::Average);
        assert_eq!(cut_at_distance(&dend, 0.05), vec![0, 1, 2, 3]);
        assert_eq!(cut_at_distance(&dend, 0.1), vec![0, 0, 1, 2]);
        assert_eq!(cut_at_distance(&dend, 0.35), vec![0, 0, 1, 1]);
        assert_eq!(cut_at_distance(&dend, 1.0), vec![0, 0, 0, 0]);
        assert_eq!(cut_at_distance(&hac(&[], 1, Linkage::Average), 1.0), vec![0]);
    }

    #[test]
    fn cosine_identical_and_orthogonal() {
        let a = [1.0f32, 0.0];
        let b = [1.0f32, 0.0];
        let c = [0.0f32, 1.0];
        let d = cosine_distance_matrix(&[&a, &b, &c]);
        assert_eq!(d.len(), 3);
        assert!(d[0].abs() < 1e-10);
        assert!((d[1] - 1.0).abs() < 1e-10);
        assert!((d[2] - 1.0).abs() < 1e-10);
    }

    #[test]
    fn cosine_zero_vector_is_far() {
        let a = [0.0f32, 0.0];
        let b = [1.0f32, 0.0];
        assert_eq!(cosine_distance_matrix(&[&a, &b]), vec![1.0]);
    }

    #[test]
    fn pair_distance_is_symmetric() {
        let (d, n) = two_pairs();
        assert_eq!(pair_distance(&d, 1, 3, n), 0.95);
        assert_eq!(pair_distance(&d, 3, 1, n), 0.95);
        assert_eq!(pair_distance(&d, 2, 2, n), 0.0);
    }

    #[test]
    fn centroid_is_mean() {
        let a = [1.0f32, 3.0];
        let b = [3.0f32, 5.0];
        assert_eq!(centroid(&[&a, &b]), vec![2.0, 4.0]);
        assert!(centroid(&[]).is_empty());
    }

    #[test]
    fn linkage_names_round_trip() {
        for name in ["single", "COMPLETE", " Average", "ward", "upgma"] {
            let l = Linkage::from_str(name).unwrap();
            assert_eq!(Linkage::from_str(l.as_str()), Some(l));
        }
        assert!(Linkage::from_str("unknown").is_none());
    }
}
