//! Offline capabilities: no network, fully deterministic.
//!
//! `HashingEmbedder` maps tokens and token bigrams into a fixed number of
//! buckets (feature hashing, signed), then L2-normalizes. `KeywordSummarizer`
//! titles a node from the terms that recur across its sample.

use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use serde_json::{json, Value};
use siphasher::sip::SipHasher13;

use crate::algo::tokenizer::tokenize;
use crate::embedding::Embedder;
use crate::error::CapabilityError;
use crate::label::{LabelRequest, Summarizer};

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let tokens = tokenize(text);
        let mut v = vec![0.0f32; self.dimensions];
        let bigrams = tokens.windows(2).map(|w| format!("{} {}", w[0], w[1]));
        for feature in tokens.iter().cloned().chain(bigrams) {
            let mut hasher = SipHasher13::new();
            feature.hash(&mut hasher);
            let h = hasher.finish();
            let bucket = (h % self.dimensions as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_id(&self) -> String {
        format!("hashing-sip13/{}", self.dimensions)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Titles a node from its recurring terms. Answers with the inconclusive
/// sentinel when fewer than `min_terms` terms recur in at least half of the
/// samples.
#[derive(Debug, Clone)]
pub struct KeywordSummarizer {
    min_terms: usize,
}

impl Default for KeywordSummarizer {
    fn default() -> Self {
        Self { min_terms: 1 }
    }
}

impl KeywordSummarizer {
    pub fn new(min_terms: usize) -> Self {
        Self {
            min_terms: min_terms.max(1),
        }
    }

    fn recurring_terms(&self, samples: &[String], keywords: &[String]) -> Vec<String> {
        let mut doc_freq: BTreeMap<String, usize> = BTreeMap::new();
        for sample in samples {
            let unique: HashSet<String> = tokenize(sample).into_iter().collect();
            for term in unique {
                *doc_freq.entry(term).or_insert(0) += 1;
            }
        }
        let needed = samples.len().div_ceil(2).max(if samples.len() > 1 { 2 } else { 1 });
        let rank = |term: &str| keywords.iter().position(|k| k == term).unwrap_or(usize::MAX);

        let mut terms: Vec<(String, usize)> =
            doc_freq.into_iter().filter(|(_, df)| *df >= needed).collect();
        // most frequent first; then keyword rank; then alphabetical
        terms.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| rank(&a.0).cmp(&rank(&b.0)))
                .then_with(|| a.0.cmp(&b.0))
        });
        terms.into_iter().map(|(t, _)| t).collect()
    }
}

#[async_trait]
impl Summarizer for KeywordSummarizer {
    async fn summarize(&self, request: &LabelRequest) -> Result<Value, CapabilityError> {
        let terms = self.recurring_terms(&request.samples, &request.keywords);
        if terms.len() < self.min_terms {
            return Ok(json!({ "inconclusive": true }));
        }
        let head: Vec<String> = terms.iter().take(3).map(|t| capitalize(t)).collect();
        Ok(json!({
            "title": head.join(" / "),
            "description": format!(
                "Recurring terms across {} sampled tickets: {}.",
                request.samples.len(),
                terms.iter().take(8).cloned().collect::<Vec<_>>().join(", ")
            ),
            "tags": terms.iter().take(5).collect::<Vec<_>>(),
        }))
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
