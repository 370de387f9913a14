//! Error types of the pipeline.
//!
//! Capability and per-item failures are recovered locally by the stage that
//! sees them; only [`PipelineError`] aborts a run.

use std::path::PathBuf;

use thiserror::Error;

/// Failure of an external capability (embedding or summarization).
#[derive(Debug, Clone, Error)]
pub enum CapabilityError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("remote returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("capability not configured: {0}")]
    NotConfigured(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "cache")]
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt entry for {fingerprint}: {reason}")]
    Corrupt { fingerprint: String, reason: String },
    #[error("store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid ticket data: {0}")]
    Parse(String),
    #[error("duplicate ticket id {0}")]
    DuplicateId(String),
    #[cfg(feature = "cache")]
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// A result that breaks one of the tree invariants. Never persisted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConsistencyError {
    #[error("ticket {0} appears in more than one leaf")]
    DuplicateTicket(String),
    #[error("ticket {0} is missing from the result")]
    MissingTicket(String),
    #[error("ticket {0} is not part of the input")]
    UnknownTicket(String),
    #[error("node {id}: volume {volume} does not match {expected} member tickets")]
    VolumeMismatch {
        id: String,
        volume: usize,
        expected: usize,
    },
    #[error("parent {0} has fewer than two children")]
    SingleChildParent(String),
    #[error("node {0} is nested deeper than two levels")]
    TooDeep(String),
    #[error("node {0} has no member tickets")]
    EmptyNode(String),
    #[error("node {0} was never labeled")]
    Unlabeled(String),
    #[error("node id {0} is used twice")]
    DuplicateNodeId(String),
    #[error("noise leaf is not the last top-level node")]
    NoiseNotLast,
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("another run holds the lock at {0}")]
    Locked(PathBuf),
    #[error("io on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("serialize result: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Run-level failure. The previous persisted result stays untouched.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("ticket source: {0}")]
    Source(#[from] SourceError),
    #[error("embedding store: {0}")]
    Store(#[from] StoreError),
    #[error("inconsistent result: {0}")]
    Consistency(#[from] ConsistencyError),
    #[error("output: {0}")]
    Output(#[from] OutputError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("run cancelled before {stage}")]
    Cancelled { stage: &'static str },
}
