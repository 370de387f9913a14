use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;

/// How the label sample of a node is drawn from its member tickets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Seeded uniform sample (partial Fisher-Yates).
    Random,
    /// Texts containing most of the node's keywords first, ties in seeded random order.
    Representative,
}

impl Strategy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "random" => Some(Self::Random),
            "representative" => Some(Self::Representative),
            _ => None,
        }
    }
}

/// Derive a per-key seed so that every node gets its own stable sample.
pub fn keyed_seed(key: &str, seed: u64) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(seed, 0);
    key.hash(&mut hasher);
    hasher.finish()
}

/// Random sample of `size` indices from `total` using a seeded PRNG.
pub fn random_sample(total: usize, size: usize, seed: u64) -> Vec<usize> {
    if size >= total {
        return (0..total).collect();
    }
    let mut indices = shuffled(total, size, seed);
    indices.sort_unstable();
    indices
}

/// Pick `size` indices, preferring the highest `scores`; equal scores are
/// ordered by a seeded shuffle. The result keeps score order.
pub fn top_scored_sample(scores: &[usize], size: usize, seed: u64) -> Vec<usize> {
    let mut order = shuffled(scores.len(), scores.len(), seed);
    // stable sort keeps the shuffled order within equal scores
    order.sort_by(|&a, &b| scores[b].cmp(&scores[a]));
    order.truncate(size);
    order
}

/// Partial Fisher-Yates: the first `size` positions of a seeded permutation.
fn shuffled(total: usize, size: usize, seed: u64) -> Vec<usize> {
    let size = size.min(total);
    let mut indices: Vec<usize> = (0..total).collect();
    let mut rng = LcgRng::new(seed);
    for i in 0..size {
        let j = i + (rng.next() as usize % (total - i));
        indices.swap(i, j);
    }
    indices.truncate(size);
    indices
}

/// Simple Linear Congruential Generator for deterministic sampling.
struct LcgRng {
    state: u64,
}

impl LcgRng {
    fn new(seed: u64) -> Self {
        Self {
            state: seed.wrapping_add(1),
        }
    }

    fn next(&mut self) -> u64 {
        // LCG constants from Numerical Recipes; high bits have the longest period
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state >> 16
    }
}
