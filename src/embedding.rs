//! Embedding cache: (embedder identity, content fingerprint) -> vector.
//!
//! The store is write-once per key and injected into the pipeline; there is
//! no process-wide cache. Keys carry the [`Embedder::model_id`], so vectors
//! of different models or dimensionalities never mix, even in a shared file.
//! Misses are deduplicated, batched and sent to the [`Embedder`] under a
//! concurrency cap. A failing batch is bisected so that only the texts the
//! capability actually rejects are reported.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{CapabilityError, StoreError};
use crate::model::CacheStats;

/// External embedding capability: one vector per input text, same order.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identity of the vector space: provider, model and dimensionality.
    /// Two embedders with the same id must produce interchangeable vectors.
    fn model_id(&self) -> String;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingEntry {
    pub model: String,
    pub fingerprint: String,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// Persistent key-value contract of the cache, keyed by `(model, fingerprint)`.
///
/// `put` must keep the first vector stored for a key; a second `put` for the
/// same key is a no-op. `replace` overwrites, and is only used for entries
/// the cache found unusable.
pub trait EmbeddingStore: Send + Sync {
    fn get(&self, model: &str, fingerprint: &str) -> Result<Option<EmbeddingEntry>, StoreError>;
    fn put(&self, entry: &EmbeddingEntry) -> Result<(), StoreError>;
    fn replace(&self, entry: &EmbeddingEntry) -> Result<(), StoreError>;
    fn len(&self) -> Result<usize, StoreError>;

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

type StoreKey = (String, String);

/// In-process store, used by tests and `--no-cache` runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<StoreKey, EmbeddingEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(entry: &EmbeddingEntry) -> StoreKey {
    (entry.model.clone(), entry.fingerprint.clone())
}

impl EmbeddingStore for MemoryStore {
    fn get(&self, model: &str, fingerprint: &str) -> Result<Option<EmbeddingEntry>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::Poisoned)?;
        Ok(entries
            .get(&(model.to_string(), fingerprint.to_string()))
            .cloned())
    }

    fn put(&self, entry: &EmbeddingEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        entries.entry(key(entry)).or_insert_with(|| entry.clone());
        Ok(())
    }

    fn replace(&self, entry: &EmbeddingEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key(entry), entry.clone());
        Ok(())
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entries.read().map_err(|_| StoreError::Poisoned)?.len())
    }
}

/// Outcome of resolving a set of fingerprints.
#[derive(Debug, Default)]
pub struct Resolution {
    pub vectors: HashMap<String, Vec<f32>>,
    /// fingerprint -> failure reason
    pub failed: BTreeMap<String, String>,
    pub stats: CacheStats,
}

type Embedded = BTreeMap<String, Result<Vec<f32>, String>>;

#[derive(Clone)]
pub struct EmbeddingCache {
    store: Arc<dyn EmbeddingStore>,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    concurrency: usize,
    dimensions: Option<usize>,
}

impl EmbeddingCache {
    pub fn new(store: Arc<dyn EmbeddingStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            store,
            embedder,
            batch_size: 100,
            concurrency: 4,
            dimensions: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Reject vectors whose length differs from `dimensions`.
    pub fn with_dimensions(mut self, dimensions: Option<usize>) -> Self {
        self.dimensions = dimensions;
        self
    }

    /// Resolve `(fingerprint, text)` pairs to vectors.
    ///
    /// Store read/write errors degrade to a miss or a skipped write; they never
    /// fail the resolution. Without a configured dimensionality the run's is
    /// taken from fresh vectors first (fingerprint order), and only from the
    /// most common cached size when nothing was embedded. Cached vectors of
    /// another size are re-embedded and overwritten.
    pub async fn resolve(&self, requests: &[(String, String)]) -> Resolution {
        let unique: BTreeMap<&str, &str> = requests
            .iter()
            .map(|(fp, text)| (fp.as_str(), text.as_str()))
            .collect();
        let model = self.embedder.model_id();

        let mut resolution = Resolution::default();
        let mut cached: Vec<(&str, &str, Vec<f32>)> = Vec::new();
        let mut misses: Vec<(String, String)> = Vec::new();
        for (&fp, &text) in &unique {
            match self.store.get(&model, fp) {
                Ok(Some(entry)) => cached.push((fp, text, entry.vector)),
                Ok(None) => misses.push((fp.to_string(), text.to_string())),
                Err(e) => {
                    warn!(fingerprint = fp, error = %e, "embedding store read failed, treating as miss");
                    misses.push((fp.to_string(), text.to_string()));
                }
            }
        }

        let mut embedded = self.embed_all(&misses, &mut resolution.stats).await;
        let expected = self
            .dimensions
            .or_else(|| first_dims(&embedded))
            .or_else(|| dominant_dims(cached.iter().map(|(_, _, v)| v.len())));

        let mut stale: Vec<(String, String)> = Vec::new();
        for (fp, text, vector) in cached {
            if expected.map_or(true, |d| d == vector.len()) {
                resolution.stats.hits += 1;
                resolution.vectors.insert(fp.to_string(), vector);
            } else {
                stale.push((fp.to_string(), text.to_string()));
            }
        }
        if !stale.is_empty() {
            warn!(
                model = %model,
                entries = stale.len(),
                expected = expected.unwrap_or_default(),
                "cached vectors have another dimensionality, re-embedding"
            );
            embedded.append(&mut self.embed_all(&stale, &mut resolution.stats).await);
        }
        resolution.stats.misses = misses.len() + stale.len();
        let stale: BTreeSet<String> = stale.into_iter().map(|(fp, _)| fp).collect();

        let now = Utc::now();
        for (fp, result) in embedded {
            let vector = match result {
                Ok(v) if v.is_empty() => Err("empty vector".to_string()),
                Ok(v) if expected.is_some_and(|d| d != v.len()) => Err(format!(
                    "vector has {} dimensions, expected {}",
                    v.len(),
                    expected.unwrap_or_default()
                )),
                other => other,
            };
            match vector {
                Ok(vector) => {
                    let entry = EmbeddingEntry {
                        model: model.clone(),
                        fingerprint: fp,
                        vector,
                        created_at: now,
                    };
                    let written = if stale.contains(&entry.fingerprint) {
                        self.store.replace(&entry)
                    } else {
                        self.store.put(&entry)
                    };
                    if let Err(e) = written {
                        warn!(fingerprint = %entry.fingerprint, error = %e, "embedding store write failed");
                    }
                    resolution.vectors.insert(entry.fingerprint, entry.vector);
                }
                Err(reason) => {
                    resolution.failed.insert(fp, reason);
                }
            }
        }
        resolution.stats.failures = resolution.failed.len();
        debug!(
            model = %model,
            hits = resolution.stats.hits,
            misses = resolution.stats.misses,
            calls = resolution.stats.external_calls,
            failures = resolution.stats.failures,
            "embedding resolution done"
        );
        resolution
    }

    /// Embed `(fingerprint, text)` pairs in bounded concurrent batches. Every
    /// input fingerprint gets an entry in the returned map.
    async fn embed_all(&self, pending: &[(String, String)], stats: &mut CacheStats) -> Embedded {
        let mut embedded = Embedded::new();
        if pending.is_empty() {
            return embedded;
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for batch in pending.chunks(self.batch_size) {
            let batch = batch.to_vec();
            let embedder = Arc::clone(&self.embedder);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                embed_isolating(embedder.as_ref(), batch).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    stats.external_calls += outcome.calls;
                    for (fp, result) in outcome.results {
                        embedded.insert(fp, result.map_err(|e| e.to_string()));
                    }
                }
                Err(e) => warn!(error = %e, "embedding task aborted"),
            }
        }
        for (fp, _) in pending {
            embedded
                .entry(fp.clone())
                .or_insert_with(|| Err("embedding task aborted".to_string()));
        }
        embedded
    }
}

/// Length of the first usable fresh vector, in fingerprint order.
fn first_dims(embedded: &Embedded) -> Option<usize> {
    embedded
        .values()
        .filter_map(|r| r.as_ref().ok())
        .map(Vec::len)
        .find(|&len| len > 0)
}

/// Most common length; ties go to the smaller one.
fn dominant_dims(lengths: impl Iterator<Item = usize>) -> Option<usize> {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for len in lengths.filter(|&len| len > 0) {
        *counts.entry(len).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(len, _)| len)
}

struct BatchOutcome {
    results: Vec<(String, Result<Vec<f32>, CapabilityError>)>,
    calls: usize,
}

/// Embed a batch; on failure split it in halves until the failing texts are
/// isolated. A batch that fails whole costs at most `2n - 1` calls.
async fn embed_isolating(embedder: &dyn Embedder, batch: Vec<(String, String)>) -> BatchOutcome {
    let mut results = Vec::with_capacity(batch.len());
    let mut calls = 0;
    let mut pending = vec![batch];

    while let Some(mut chunk) = pending.pop() {
        calls += 1;
        let texts: Vec<String> = chunk.iter().map(|(_, text)| text.clone()).collect();
        let outcome = match embedder.embed(&texts).await {
            Ok(vectors) if vectors.len() == chunk.len() => Ok(vectors),
            Ok(vectors) => Err(CapabilityError::Malformed(format!(
                "{} vectors for {} texts",
                vectors.len(),
                chunk.len()
            ))),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(vectors) => {
                results.extend(
                    chunk
                        .into_iter()
                        .zip(vectors)
                        .map(|((fp, _), v)| (fp, Ok(v))),
                );
            }
            Err(e) if chunk.len() > 1 => {
                debug!(size = chunk.len(), error = %e, "embedding batch failed, splitting");
                let right = chunk.split_off(chunk.len() / 2);
                pending.push(right);
                pending.push(chunk);
            }
            Err(e) => {
                if let Some((fp, _)) = chunk.pop() {
                    results.push((fp, Err(e)));
                }
            }
        }
    }
    BatchOutcome { results, calls }
}
