//! Single forward pass: normalize, embed, micro-cluster, build the hierarchy,
//! aggregate, label, validate and persist.
//!
//! A run can be cancelled between stages; nothing is written in that case.
//! The write itself is atomic and guarded by a per-window lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::aggregate::Aggregator;
use crate::config::PipelineConfig;
use crate::embedding::{Embedder, EmbeddingCache, EmbeddingStore};
use crate::error::{ConfigError, PipelineError};
use crate::hierarchy::HierarchyBuilder;
use crate::label::{Labeler, Summarizer};
use crate::micro::MicroClusterEngine;
use crate::model::{AnalysisResult, RunMetadata, Ticket, SCHEMA_VERSION};
use crate::normalize::Normalizer;
use crate::output::{result_path, window_stem, write_atomic, RunLock};
use crate::source::TicketSource;
use crate::validate::validate;

/// Cooperative cancellation flag, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A persisted run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub path: PathBuf,
    pub result: AnalysisResult,
}

pub struct Pipeline {
    config: PipelineConfig,
    normalizer: Normalizer,
    store: Arc<dyn EmbeddingStore>,
    embedder: Arc<dyn Embedder>,
    summarizer: Arc<dyn Summarizer>,
    cancel: CancelToken,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn EmbeddingStore>,
        embedder: Arc<dyn Embedder>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let normalizer =
            Normalizer::new(&config.boilerplate_patterns).map_err(|e| ConfigError::Invalid {
                field: "boilerplate_patterns",
                reason: e.to_string(),
            })?;
        Ok(Self {
            config,
            normalizer,
            store,
            embedder,
            summarizer,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn checkpoint(&self, stage: &'static str) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            warn!(stage, "run cancelled");
            return Err(PipelineError::Cancelled { stage });
        }
        Ok(())
    }

    /// Fetch, analyze and persist one window. Holds the window lock for the
    /// whole run; the previous result is only replaced by a validated one.
    pub async fn run(
        &self,
        source: &dyn TicketSource,
        system: &str,
        window_days: u32,
    ) -> Result<RunOutcome, PipelineError> {
        let _lock = RunLock::acquire(&self.config.output_dir, system, window_days)?;
        self.checkpoint("fetch")?;
        let tickets = source.fetch_tickets(system, window_days)?;
        info!(system, window_days, tickets = tickets.len(), "tickets fetched");

        let result = self.analyze(system, window_days, tickets).await?;

        self.checkpoint("write")?;
        let path = result_path(&self.config.output_dir, system, window_days);
        write_atomic(&path, &result)?;
        info!(path = %path.display(), nodes = result.metadata.total_nodes, "result persisted");
        Ok(RunOutcome { path, result })
    }

    /// Build and validate the result for a ticket set without persisting it.
    pub async fn analyze(
        &self,
        system: &str,
        window_days: u32,
        mut tickets: Vec<Ticket>,
    ) -> Result<AnalysisResult, PipelineError> {
        tickets.sort_by(|a, b| a.id.cmp(&b.id));
        let total = tickets.len();

        self.checkpoint("normalize")?;
        let normalized = self.normalizer.normalize_batch(&tickets);
        let excluded: Vec<&str> = normalized
            .iter()
            .filter(|n| n.empty)
            .map(|n| n.ticket_id.as_str())
            .collect();
        if !excluded.is_empty() {
            warn!(tickets = ?excluded, "tickets without usable text routed to noise");
        }
        info!(tickets = total, excluded = excluded.len(), "normalization done");

        self.checkpoint("embed")?;
        let requests: Vec<(String, String)> = normalized
            .iter()
            .filter(|n| !n.empty)
            .map(|n| (n.fingerprint.clone(), n.text.clone()))
            .collect();
        let cache = EmbeddingCache::new(Arc::clone(&self.store), Arc::clone(&self.embedder))
            .with_batch_size(self.config.embed_batch_size)
            .with_concurrency(self.config.embed_concurrency)
            .with_dimensions(self.config.embedding_dimensions);
        let mut resolution = cache.resolve(&requests).await;
        info!(
            hits = resolution.stats.hits,
            misses = resolution.stats.misses,
            external_calls = resolution.stats.external_calls,
            failures = resolution.stats.failures,
            "embedding done"
        );

        let mut points = Vec::new();
        let mut unresolved = Vec::new();
        let mut failed_by_reason: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for n in &normalized {
            if n.empty {
                unresolved.push(n.ticket_id.clone());
            } else if let Some(vector) = resolution.vectors.get(&n.fingerprint) {
                points.push((n.ticket_id.clone(), vector.clone()));
            } else {
                let reason = resolution
                    .failed
                    .get(&n.fingerprint)
                    .map(String::as_str)
                    .unwrap_or("no vector");
                failed_by_reason.entry(reason).or_default().push(&n.ticket_id);
                unresolved.push(n.ticket_id.clone());
            }
        }
        let embedding_failures: usize = failed_by_reason.values().map(Vec::len).sum();
        for (reason, ids) in &failed_by_reason {
            warn!(tickets = ?ids, reason = %reason, "embedding failed, routed to noise for this run");
        }
        resolution.vectors.clear();

        self.checkpoint("cluster")?;
        let params = self.config.hdbscan_params(total);
        let partition = MicroClusterEngine::new(params).cluster(&points, &unresolved);
        drop(points);

        self.checkpoint("hierarchy")?;
        let hierarchy =
            HierarchyBuilder::new(self.config.linkage(), self.config.macro_merge_distance)
                .build(&partition);

        self.checkpoint("aggregate")?;
        let mut nodes = Aggregator::new(&hierarchy, &tickets, &normalized).build(&hierarchy);

        self.checkpoint("label")?;
        let texts: HashMap<String, String> = normalized
            .iter()
            .filter(|n| !n.empty)
            .map(|n| (n.ticket_id.clone(), n.text.clone()))
            .collect();
        Labeler::new(Arc::clone(&self.summarizer))
            .with_sample_size(self.config.label_sample_size())
            .with_concurrency(self.config.label_concurrency)
            .with_strategy(self.config.sample_strategy, self.config.seed)
            .label_all(&mut nodes, &texts)
            .await;

        let generated_at = Utc::now();
        let result = AnalysisResult {
            metadata: RunMetadata {
                schema_version: SCHEMA_VERSION,
                run_id: format!(
                    "{}-{}",
                    window_stem(system, window_days),
                    generated_at.format("%Y%m%dT%H%M%SZ")
                ),
                system: system.to_string(),
                window_days,
                generated_at,
                total_tickets: total,
                excluded_tickets: excluded.len(),
                embedding_failures,
                total_nodes: nodes.iter().map(|n| n.node_count()).sum(),
                noise_ratio: partition.noise_ratio(),
                clustering: self.config.clustering_params(total),
                config_hash: self.config.config_hash(),
                cache: resolution.stats,
            },
            nodes,
        };

        let input_ids: BTreeSet<String> = tickets.iter().map(|t| t.id.clone()).collect();
        if let Err(e) = validate(&result, &input_ids) {
            error!(error = %e, "result failed consistency checks, nothing persisted");
            return Err(e.into());
        }
        info!(
            total_tickets = total,
            nodes = result.metadata.total_nodes,
            noise_ratio = result.metadata.noise_ratio,
            "analysis done"
        );
        Ok(result)
    }
}
