//! Labeler: short human-readable title, description and tags per node.
//!
//! The text-generation capability only ever sees a bounded sample of member
//! texts. Its answer is validated against a fixed schema at the boundary and
//! attached to the node; metrics and membership are never touched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::algo::sampling::{keyed_seed, random_sample, top_scored_sample, Strategy};
use crate::algo::tokenizer::tokenize;
use crate::error::CapabilityError;
use crate::model::{ClusterNode, LabelStatus};

const MAX_TITLE_CHARS: usize = 120;
const MAX_DESCRIPTION_CHARS: usize = 600;
const MAX_TAGS: usize = 8;

pub const NOISE_TITLE: &str = "Unassigned / dispersed";
const NOISE_DESCRIPTION: &str =
    "Tickets that match no recurring pattern, plus tickets without usable text or embedding.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Parent,
}

/// Input of one summarization call.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelRequest {
    pub node_id: String,
    pub kind: NodeKind,
    /// Cleaned member texts, or child labels for a parent.
    pub samples: Vec<String>,
    /// Node keywords, as a hint.
    pub keywords: Vec<String>,
}

/// External text-generation capability.
///
/// Expected answer: `{"title": str, "description": str, "tags": [str]}`, or
/// `{"inconclusive": true}` when the sample is too generic.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, request: &LabelRequest) -> Result<Value, CapabilityError>;
}

/// Validated outcome of a summarization call.
#[derive(Debug, Clone, PartialEq)]
pub enum Label {
    Labeled {
        title: String,
        description: String,
        tags: Vec<String>,
    },
    Inconclusive,
    Failed(String),
}

impl Label {
    pub fn from_response(response: Result<Value, CapabilityError>) -> Self {
        match response {
            Ok(value) => Self::parse(&value),
            Err(e) => Self::Failed(e.to_string()),
        }
    }

    /// Validate a raw answer against the label schema.
    pub fn parse(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::Failed("answer is not a JSON object".into());
        };
        if obj.get("inconclusive").and_then(Value::as_bool) == Some(true) {
            return Self::Inconclusive;
        }

        let title = match obj.get("title").and_then(Value::as_str).map(str::trim) {
            Some(t) if t.eq_ignore_ascii_case("inconclusive") => return Self::Inconclusive,
            Some(t) if !t.is_empty() => truncate_chars(t, MAX_TITLE_CHARS),
            _ => return Self::Failed("missing or empty title".into()),
        };
        let description = match obj.get("description").and_then(Value::as_str) {
            Some(d) => truncate_chars(d.trim(), MAX_DESCRIPTION_CHARS),
            None => return Self::Failed("missing description".into()),
        };
        let tags = match obj.get("tags") {
            Some(Value::Array(items)) => {
                let mut seen = HashSet::new();
                let mut tags = Vec::new();
                for item in items {
                    let Some(tag) = item.as_str().map(str::trim) else {
                        return Self::Failed("tags must be strings".into());
                    };
                    if !tag.is_empty() && seen.insert(tag.to_lowercase()) {
                        tags.push(tag.to_string());
                    }
                }
                tags.truncate(MAX_TAGS);
                tags
            }
            Some(_) => return Self::Failed("tags must be an array".into()),
            None => Vec::new(),
        };
        Self::Labeled {
            title,
            description,
            tags,
        }
    }

    /// Attach to a node, replacing only the label fields.
    pub fn apply(self, node: &mut ClusterNode) {
        match self {
            Self::Labeled {
                title,
                description,
                tags,
            } => {
                node.title = title;
                node.description = description;
                node.tags = tags;
                node.label_status = LabelStatus::Labeled;
                node.label_error = None;
            }
            Self::Inconclusive => {
                node.title = format!("Inconclusive group ({})", node.id);
                node.description = "The sampled tickets are too generic to summarize.".into();
                node.tags = node.keywords.iter().take(3).cloned().collect();
                node.label_status = LabelStatus::Inconclusive;
                node.label_error = None;
            }
            Self::Failed(reason) => {
                node.title = format!("Unlabeled group ({})", node.id);
                node.description = "Automatic labeling failed; metrics are exact.".into();
                node.tags = node.keywords.iter().take(3).cloned().collect();
                node.label_status = LabelStatus::Failed;
                node.label_error = Some(reason);
            }
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Fixed label of the noise leaf. Never generated.
pub fn apply_noise_label(node: &mut ClusterNode) {
    node.title = NOISE_TITLE.to_string();
    node.description = NOISE_DESCRIPTION.to_string();
    node.tags = vec!["unassigned".into(), "dispersed".into()];
    node.label_status = LabelStatus::Fixed;
    node.label_error = None;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LabelReport {
    pub labeled: usize,
    pub inconclusive: usize,
    pub failed: usize,
}

impl LabelReport {
    fn count(&mut self, label: &Label) {
        match label {
            Label::Labeled { .. } => self.labeled += 1,
            Label::Inconclusive => self.inconclusive += 1,
            Label::Failed(_) => self.failed += 1,
        }
    }
}

/// Position of a node: top-level index and, for a child, its index.
type NodePath = (usize, Option<usize>);

pub struct Labeler {
    summarizer: Arc<dyn Summarizer>,
    sample_size: usize,
    concurrency: usize,
    strategy: Strategy,
    seed: u64,
}

impl Labeler {
    pub fn new(summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            summarizer,
            sample_size: 8,
            concurrency: 4,
            strategy: Strategy::Representative,
            seed: 42,
        }
    }

    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy, seed: u64) -> Self {
        self.strategy = strategy;
        self.seed = seed;
        self
    }

    /// Label every node. Leaves go first; a parent whose children all got a
    /// label is then described from those labels, otherwise from a sample of
    /// its member texts.
    ///
    /// `texts` maps ticket id to cleaned text; tickets with no usable text
    /// must be absent.
    pub async fn label_all(
        &self,
        nodes: &mut [ClusterNode],
        texts: &HashMap<String, String>,
    ) -> LabelReport {
        let mut report = LabelReport::default();

        let mut leaf_requests = Vec::new();
        for (i, node) in nodes.iter_mut().enumerate() {
            if node.is_noise() {
                apply_noise_label(node);
                continue;
            }
            if node.is_leaf() {
                leaf_requests.push(((i, None), self.sample_request(node, NodeKind::Leaf, texts)));
            } else {
                for (j, child) in node.children().iter().enumerate() {
                    leaf_requests.push((
                        (i, Some(j)),
                        self.sample_request(child, NodeKind::Leaf, texts),
                    ));
                }
            }
        }
        for (path, label) in self.run(leaf_requests).await {
            report.count(&label);
            if let Some(node) = node_at(nodes, path) {
                log_outcome(&node.id, &label);
                label.apply(node);
            }
        }

        let parent_requests: Vec<_> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.is_leaf())
            .map(|(i, n)| ((i, None), self.parent_request(n, texts)))
            .collect();
        for (path, label) in self.run(parent_requests).await {
            report.count(&label);
            if let Some(node) = node_at(nodes, path) {
                log_outcome(&node.id, &label);
                label.apply(node);
            }
        }

        info!(
            labeled = report.labeled,
            inconclusive = report.inconclusive,
            failed = report.failed,
            "labeling done"
        );
        report
    }

    fn parent_request(&self, node: &ClusterNode, texts: &HashMap<String, String>) -> LabelRequest {
        let children = node.children();
        if children
            .iter()
            .all(|c| c.label_status == LabelStatus::Labeled)
        {
            LabelRequest {
                node_id: node.id.clone(),
                kind: NodeKind::Parent,
                samples: children
                    .iter()
                    .take(self.sample_size.max(2))
                    .map(|c| format!("{}: {}", c.title, c.description))
                    .collect(),
                keywords: node.keywords.clone(),
            }
        } else {
            self.sample_request(node, NodeKind::Parent, texts)
        }
    }

    /// Bounded sample of member texts, stable for a given node id and seed.
    fn sample_request(
        &self,
        node: &ClusterNode,
        kind: NodeKind,
        texts: &HashMap<String, String>,
    ) -> LabelRequest {
        let candidates: Vec<&String> = node
            .ticket_ids()
            .into_iter()
            .filter_map(|id| texts.get(id))
            .collect();
        let seed = keyed_seed(&node.id, self.seed);
        let picked = match self.strategy {
            Strategy::Random => random_sample(candidates.len(), self.sample_size, seed),
            Strategy::Representative => {
                let keywords: HashSet<&str> = node.keywords.iter().map(String::as_str).collect();
                let scores: Vec<usize> = candidates
                    .iter()
                    .map(|text| {
                        tokenize(text)
                            .into_iter()
                            .collect::<HashSet<_>>()
                            .iter()
                            .filter(|t| keywords.contains(t.as_str()))
                            .count()
                    })
                    .collect();
                top_scored_sample(&scores, self.sample_size, seed)
            }
        };
        LabelRequest {
            node_id: node.id.clone(),
            kind,
            samples: picked.into_iter().map(|i| candidates[i].clone()).collect(),
            keywords: node.keywords.clone(),
        }
    }

    async fn run(&self, requests: Vec<(NodePath, LabelRequest)>) -> Vec<(NodePath, Label)> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut results = Vec::with_capacity(requests.len());
        let mut expected: Vec<NodePath> = Vec::with_capacity(requests.len());

        for (path, request) in requests {
            expected.push(path);
            if request.samples.is_empty() {
                results.push((path, Label::Inconclusive));
                continue;
            }
            let summarizer = Arc::clone(&self.summarizer);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (path, Label::from_response(summarizer.summarize(&request).await))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "labeling task aborted"),
            }
        }
        // a panicked task still leaves its node with a placeholder
        for path in expected {
            if !results.iter().any(|(p, _)| *p == path) {
                results.push((path, Label::Failed("labeling task aborted".into())));
            }
        }
        results.sort_by_key(|(path, _)| *path);
        results
    }
}

fn node_at(nodes: &mut [ClusterNode], (top, child): NodePath) -> Option<&mut ClusterNode> {
    let node = nodes.get_mut(top)?;
    match child {
        None => Some(node),
        Some(j) => match &mut node.members {
            crate::model::Members::Parent { children } => children.get_mut(j),
            crate::model::Members::Leaf { .. } => None,
        },
    }
}

fn log_outcome(node_id: &str, label: &Label) {
    match label {
        Label::Labeled { .. } => {}
        Label::Inconclusive => info!(node = node_id, "label inconclusive"),
        Label::Failed(reason) => warn!(node = node_id, reason = %reason, "labeling failed"),
    }
}
