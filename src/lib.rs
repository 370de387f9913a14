//! Batch clustering of support tickets into a two-level hierarchy of
//! recurring problems, with per-node metrics and generated labels.

pub mod aggregate;
pub mod algo;
pub mod config;
pub mod embedding;
pub mod error;
pub mod hierarchy;
pub mod label;
pub mod local;
pub mod micro;
pub mod model;
pub mod normalize;
#[cfg(feature = "openai")]
pub mod openai;
pub mod output;
pub mod pipeline;
pub mod source;
pub mod validate;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use model::{AnalysisResult, ClusterNode, Ticket};
pub use pipeline::{CancelToken, Pipeline, RunOutcome};
