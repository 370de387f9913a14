//! Run configuration.
//!
//! Resolution order for the config file:
//! 1. explicit path (`--config`)
//! 2. `$TICKET_TOPOLOGY_CONFIG`
//! 3. `$XDG_CONFIG_HOME/ticket-topology/config.json`
//! 4. `~/.config/ticket-topology/config.json`
//! 5. built-in defaults
//!
//! An explicit path must exist and parse. The implicit locations are only
//! read when present.

use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;

use crate::algo::clustering::Linkage;
use crate::algo::hdbscan::{HdbscanParams, DEFAULT_OUTLIER_THRESHOLD};
use crate::algo::sampling::Strategy;
use crate::error::ConfigError;
use crate::model::ClusteringParams;

const ENV_CONFIG: &str = "TICKET_TOPOLOGY_CONFIG";
const APP_DIR: &str = "ticket-topology";

/// Hard bounds of the label sample.
pub const MAX_LABEL_SAMPLE: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub min_cluster_size: usize,
    /// Defaults to the effective min cluster size.
    pub min_samples: Option<usize>,
    /// Derive the min cluster size from the ticket count.
    pub auto_tune: bool,
    pub outlier_threshold: f64,
    pub macro_linkage: String,
    pub macro_merge_distance: f64,
    pub embed_batch_size: usize,
    pub embed_concurrency: usize,
    pub embedding_dimensions: Option<usize>,
    pub label_sample_size: usize,
    pub label_concurrency: usize,
    pub sample_strategy: Strategy,
    pub seed: u64,
    /// Extra regexes; matching text is removed before comparison.
    pub boilerplate_patterns: Vec<String>,
    pub output_dir: PathBuf,
    pub cache_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: 5,
            min_samples: None,
            auto_tune: false,
            outlier_threshold: DEFAULT_OUTLIER_THRESHOLD,
            macro_linkage: "average".into(),
            macro_merge_distance: 0.35,
            embed_batch_size: 100,
            embed_concurrency: 4,
            embedding_dimensions: None,
            label_sample_size: 8,
            label_concurrency: 4,
            sample_strategy: Strategy::Representative,
            seed: 42,
            boilerplate_patterns: Vec::new(),
            output_dir: PathBuf::from("analysis"),
            cache_path: None,
        }
    }
}

impl PipelineConfig {
    /// Load the config following the resolution order above.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match implicit_config_path() {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_cluster_size < 2 {
            return Err(invalid("min_cluster_size", "must be at least 2"));
        }
        if self.min_samples == Some(0) {
            return Err(invalid("min_samples", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.outlier_threshold) {
            return Err(invalid("outlier_threshold", "must be within 0..=1"));
        }
        if Linkage::from_str(&self.macro_linkage).is_none() {
            return Err(invalid(
                "macro_linkage",
                "expected single, complete, average or ward",
            ));
        }
        if !(0.0..=2.0).contains(&self.macro_merge_distance) {
            return Err(invalid("macro_merge_distance", "must be within 0..=2"));
        }
        if self.embed_batch_size == 0 {
            return Err(invalid("embed_batch_size", "must be positive"));
        }
        if self.embed_concurrency == 0 || self.label_concurrency == 0 {
            return Err(invalid("concurrency", "must be positive"));
        }
        if self.embedding_dimensions == Some(0) {
            return Err(invalid("embedding_dimensions", "must be positive"));
        }
        for pattern in &self.boilerplate_patterns {
            regex::Regex::new(pattern).map_err(|e| invalid("boilerplate_patterns", e))?;
        }
        Ok(())
    }

    /// Min cluster size used for a run over `ticket_count` tickets.
    pub fn effective_min_cluster_size(&self, ticket_count: usize) -> usize {
        if self.auto_tune {
            (ticket_count / 100).clamp(5, 10)
        } else {
            self.min_cluster_size
        }
    }

    pub fn hdbscan_params(&self, ticket_count: usize) -> HdbscanParams {
        let min_cluster_size = self.effective_min_cluster_size(ticket_count);
        HdbscanParams {
            min_cluster_size,
            min_samples: self.min_samples.unwrap_or(min_cluster_size),
            outlier_threshold: self.outlier_threshold,
        }
    }

    pub fn linkage(&self) -> Linkage {
        Linkage::from_str(&self.macro_linkage).unwrap_or(Linkage::Average)
    }

    pub fn label_sample_size(&self) -> usize {
        self.label_sample_size.clamp(1, MAX_LABEL_SAMPLE)
    }

    /// Effective clustering parameters, as recorded in run metadata.
    pub fn clustering_params(&self, ticket_count: usize) -> ClusteringParams {
        let hdbscan = self.hdbscan_params(ticket_count);
        ClusteringParams {
            min_cluster_size: hdbscan.min_cluster_size,
            min_samples: hdbscan.min_samples,
            outlier_threshold: hdbscan.outlier_threshold,
            macro_linkage: self.linkage().as_str().to_string(),
            macro_merge_distance: self.macro_merge_distance,
        }
    }

    /// SipHash of the serialized config; changes whenever any knob changes.
    pub fn config_hash(&self) -> String {
        let mut hasher = SipHasher13::new();
        serde_json::to_string(self)
            .unwrap_or_default()
            .hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

fn invalid(field: &'static str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

fn implicit_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(ENV_CONFIG) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }
    xdg_config_path().filter(|p| p.exists())
}

/// Return the XDG config path for ticket-topology.
fn xdg_config_path() -> Option<PathBuf> {
    let config_home = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        })?;
    Some(config_home.join(APP_DIR).join("config.json"))
}

/// Settings of the OpenAI-compatible HTTP capabilities, from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenAiSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub embedding_model: String,
    pub chat_model: String,
}

impl OpenAiSettings {
    pub fn from_env() -> Self {
        let var = |name: &str, default: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            api_key: std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            base_url: var("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            embedding_model: var("OPENAI_EMBEDDING_MODEL", "text-embedding-3-small"),
            chat_model: var("OPENAI_CHAT_MODEL", "gpt-4o-mini"),
        }
    }
}
