use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use ticket_topology::embedding::{Embedder, EmbeddingStore, MemoryStore};
use ticket_topology::error::{CapabilityError, OutputError, PipelineError};
use ticket_topology::label::{LabelRequest, Summarizer};
use ticket_topology::model::{LabelStatus, Members, Ticket, NOISE_NODE_ID};
use ticket_topology::output::{read_result, RunLock};
use ticket_topology::source::TicketSource;
use ticket_topology::validate::validate_structure;
use ticket_topology::{AnalysisResult, CancelToken, Pipeline, PipelineConfig};

/// Maps texts to fixed vectors by topic word. Batches containing "poison"
/// fail as a whole.
#[derive(Default)]
struct TopicEmbedder {
    calls: AtomicUsize,
    embedded: AtomicUsize,
}

fn topic_vector(text: &str) -> Option<Vec<f32>> {
    let text = text.to_lowercase();
    let table: [(&str, [f32; 3]); 4] = [
        ("login", [1.0, 0.3, 0.0]),
        ("payroll", [1.0, -0.3, 0.0]),
        ("printer", [0.0, 0.0, 1.0]),
        ("vpn", [0.0, 1.0, 0.0]),
    ];
    table
        .iter()
        .find(|(word, _)| text.contains(word))
        .map(|(_, v)| v.to_vec())
}

#[async_trait]
impl Embedder for TopicEmbedder {
    fn model_id(&self) -> String {
        "topic/3".into()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if texts.iter().any(|t| t.to_lowercase().contains("poison")) {
            return Err(CapabilityError::Status {
                status: 500,
                body: "upstream rejected the batch".into(),
            });
        }
        let vectors = texts
            .iter()
            .map(|t| topic_vector(t).ok_or_else(|| CapabilityError::Malformed(t.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        self.embedded.fetch_add(vectors.len(), Ordering::SeqCst);
        Ok(vectors)
    }
}

/// Places "number N" texts on a jittered spoke around a shared axis and
/// "axis N" texts far out on their own axis.
struct SpokeEmbedder;

const SPOKE_DIMS: usize = 13;

fn spoke(axis: usize, spread: f64) -> Vec<f32> {
    let mut v = vec![0.0f32; SPOKE_DIMS];
    v[0] = 1.0;
    v[axis] = spread.sqrt() as f32;
    v
}

fn number_after(text: &str, key: &str) -> Option<usize> {
    let rest = &text[text.find(key)? + key.len()..];
    rest.split_whitespace().next()?.parse().ok()
}

#[async_trait]
impl Embedder for SpokeEmbedder {
    fn model_id(&self) -> String {
        format!("spoke/{SPOKE_DIMS}")
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        texts
            .iter()
            .map(|t| {
                let t = t.to_lowercase();
                if let Some(n) = number_after(&t, "number ") {
                    Ok(spoke(n + 1, 0.40 + 0.01 * n as f64))
                } else if let Some(axis) = number_after(&t, "axis ") {
                    Ok(spoke(axis, 8.0))
                } else {
                    Err(CapabilityError::Malformed(t.clone()))
                }
            })
            .collect()
    }
}

/// Labels every node after its id.
struct EchoSummarizer;

#[async_trait]
impl Summarizer for EchoSummarizer {
    async fn summarize(&self, request: &LabelRequest) -> Result<Value, CapabilityError> {
        Ok(json!({
            "title": format!("Group {}", request.node_id),
            "description": format!("{} samples", request.samples.len()),
            "tags": ["support"],
        }))
    }
}

struct VecSource(Vec<Ticket>);

impl TicketSource for VecSource {
    fn fetch_tickets(
        &self,
        system: &str,
        _since_days: u32,
    ) -> Result<Vec<Ticket>, ticket_topology::error::SourceError> {
        Ok(self.0.iter().filter(|t| t.system == system).cloned().collect())
    }
}

fn ticket(id: &str, title: &str, description: &str, requester: &str, day: u32) -> Ticket {
    Ticket {
        id: id.into(),
        system: "ERP".into(),
        requester: requester.into(),
        requester_email: None,
        service: "Portal".into(),
        subarea: None,
        status: "open".into(),
        opened_at: Utc.with_ymd_and_hms(2024, 3, day, 9, 0, 0).unwrap(),
        title: title.into(),
        description: description.into(),
    }
}

fn topic_tickets(prefix: &str, topic: &str, count: usize) -> Vec<Ticket> {
    (0..count)
        .map(|i| {
            ticket(
                &format!("{prefix}-{i:02}"),
                &format!("{topic} issue number {i}"),
                &format!("reported by desk {}", i % 3),
                &format!("user{}", i % 4),
                1 + (i % 28) as u32,
            )
        })
        .collect()
}

fn config(dir: &std::path::Path) -> PipelineConfig {
    PipelineConfig {
        output_dir: dir.to_path_buf(),
        ..PipelineConfig::default()
    }
}

fn pipeline(
    dir: &std::path::Path,
    store: Arc<dyn EmbeddingStore>,
    embedder: Arc<TopicEmbedder>,
) -> Pipeline {
    Pipeline::new(config(dir), store, embedder, Arc::new(EchoSummarizer)).unwrap()
}

fn leaf_ids(result: &AnalysisResult, node: usize) -> Vec<&str> {
    result.nodes[node].ticket_ids()
}

#[tokio::test]
async fn dense_group_and_outliers() {
    let dir = tempfile::tempdir().unwrap();
    let mut tickets = topic_tickets("login", "Login timeout", 10);
    tickets.push(ticket("x-printer", "Printer jam", "tray 2", "ana", 3));
    tickets.push(ticket("x-vpn", "VPN drops", "every hour", "bob", 4));

    let p = pipeline(dir.path(), Arc::new(MemoryStore::new()), Arc::default());
    let result = p.analyze("ERP", 30, tickets).await.unwrap();

    assert_eq!(result.nodes.len(), 2);
    let cluster = &result.nodes[0];
    assert!(cluster.is_leaf());
    assert_eq!(cluster.metrics.volume, 10);
    assert!(leaf_ids(&result, 0).iter().all(|id| id.starts_with("login-")));
    assert_eq!(cluster.label_status, LabelStatus::Labeled);
    assert_eq!(cluster.title, format!("Group {}", cluster.id));

    let noise = &result.nodes[1];
    assert_eq!(noise.id, NOISE_NODE_ID);
    assert_eq!(noise.label_status, LabelStatus::Fixed);
    assert_eq!(leaf_ids(&result, 1), vec!["x-printer", "x-vpn"]);

    let meta = &result.metadata;
    assert_eq!(meta.total_tickets, 12);
    assert_eq!(meta.total_nodes, 2);
    assert!((meta.noise_ratio - 2.0 / 12.0).abs() < 1e-9);
    assert_eq!(meta.clustering.min_cluster_size, 5);
    assert_eq!(meta.run_id.split('-').next(), Some("ERP_30d"));
    validate_structure(&result).unwrap();
}

#[tokio::test]
async fn near_duplicates_keep_distant_strays_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut tickets = topic_tickets("login", "Login timeout", 10);
    tickets.push(ticket("x-a", "Report axis 11", "export", "ana", 3));
    tickets.push(ticket("x-b", "Report axis 12", "export", "bob", 4));

    let p = Pipeline::new(
        config(dir.path()),
        Arc::new(MemoryStore::new()),
        Arc::new(SpokeEmbedder),
        Arc::new(EchoSummarizer),
    )
    .unwrap();
    let result = p.analyze("ERP", 30, tickets).await.unwrap();

    assert_eq!(result.nodes.len(), 2, "{:#?}", result.nodes);
    assert!(result.nodes[0].is_leaf());
    assert_eq!(result.nodes[0].metrics.volume, 10);
    assert_eq!(result.nodes[1].id, NOISE_NODE_ID);
    assert_eq!(leaf_ids(&result, 1), vec!["x-a", "x-b"]);
    validate_structure(&result).unwrap();
}

#[tokio::test]
async fn failed_embeddings_go_to_noise() {
    let dir = tempfile::tempdir().unwrap();
    let mut tickets = topic_tickets("login", "Login timeout", 47);
    tickets.extend(topic_tickets("bad", "Login poison", 3));
    let embedder = Arc::new(TopicEmbedder::default());

    let p = pipeline(dir.path(), Arc::new(MemoryStore::new()), embedder.clone());
    let result = p.analyze("ERP", 30, tickets).await.unwrap();

    assert_eq!(result.metadata.total_tickets, 50);
    assert_eq!(result.metadata.embedding_failures, 3);
    assert_eq!(result.metadata.cache.failures, 3);
    assert_eq!(result.nodes[0].metrics.volume, 47);
    let noise = result.nodes.last().unwrap();
    assert_eq!(noise.id, NOISE_NODE_ID);
    assert_eq!(noise.ticket_ids(), vec!["bad-00", "bad-01", "bad-02"]);
    // every good text is embedded exactly once despite the bisection
    assert_eq!(embedder.embedded.load(Ordering::SeqCst), 47);
}

#[tokio::test]
async fn empty_tickets_are_excluded_not_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let mut tickets = topic_tickets("login", "Login timeout", 6);
    tickets.push(ticket("blank", "", "<p>&nbsp;</p>", "eve", 5));

    let p = pipeline(dir.path(), Arc::new(MemoryStore::new()), Arc::default());
    let result = p.analyze("ERP", 30, tickets).await.unwrap();

    assert_eq!(result.metadata.excluded_tickets, 1);
    assert_eq!(result.metadata.total_tickets, 7);
    assert_eq!(result.nodes.last().unwrap().ticket_ids(), vec!["blank"]);
}

#[tokio::test]
async fn close_groups_share_a_parent() {
    let dir = tempfile::tempdir().unwrap();
    let mut tickets = topic_tickets("a", "Login failure", 6);
    tickets.extend(topic_tickets("b", "Payroll export", 6));
    tickets.extend(topic_tickets("c", "Printer offline", 6));

    let p = pipeline(dir.path(), Arc::new(MemoryStore::new()), Arc::default());
    let result = p.analyze("ERP", 30, tickets).await.unwrap();

    assert_eq!(result.nodes.len(), 2, "{:#?}", result.nodes);
    let parent = &result.nodes[0];
    assert!(parent.id.starts_with("macro-"));
    assert_eq!(parent.metrics.volume, 12);
    let Members::Parent { children } = &parent.members else {
        panic!("expected a parent, got {parent:#?}");
    };
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|c| c.is_leaf() && c.metrics.volume == 6));
    assert_eq!(parent.label_status, LabelStatus::Labeled);

    let standalone = &result.nodes[1];
    assert!(standalone.is_leaf());
    assert!(standalone.ticket_ids().iter().all(|id| id.starts_with("c-")));
    assert_eq!(result.metadata.total_nodes, 4);
    assert_eq!(result.metadata.noise_ratio, 0.0);
}

#[tokio::test]
async fn second_run_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn EmbeddingStore> = Arc::new(MemoryStore::new());
    let embedder = Arc::new(TopicEmbedder::default());
    let tickets = topic_tickets("login", "Login timeout", 12);

    let p = pipeline(dir.path(), store.clone(), embedder.clone());
    let first = p.analyze("ERP", 30, tickets.clone()).await.unwrap();
    let second = p.analyze("ERP", 30, tickets).await.unwrap();

    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.metadata.cache.misses, 12);
    assert_eq!(second.metadata.cache.hits, 12);
    assert_eq!(second.metadata.cache.external_calls, 0);
    assert_eq!(store.len().unwrap(), 12);
    // same input, same config: identical tree
    assert_eq!(first.nodes, second.nodes);
    assert_eq!(first.metadata.config_hash, second.metadata.config_hash);
}

#[tokio::test]
async fn run_persists_result_and_releases_lock() {
    let dir = tempfile::tempdir().unwrap();
    let mut tickets = topic_tickets("login", "Login timeout", 8);
    tickets.push(ticket("crm-1", "Login timeout", "other system", "zed", 2));
    tickets.last_mut().unwrap().system = "CRM".into();

    let p = pipeline(dir.path(), Arc::new(MemoryStore::new()), Arc::default());
    let outcome = p.run(&VecSource(tickets), "ERP", 30).await.unwrap();

    assert_eq!(outcome.path, dir.path().join("ERP_30d.json"));
    let persisted = read_result(&outcome.path).unwrap();
    assert_eq!(persisted.metadata.run_id, outcome.result.metadata.run_id);
    assert_eq!(persisted.metadata.total_tickets, 8);
    assert_eq!(persisted.nodes.len(), outcome.result.nodes.len());
    assert_eq!(persisted.nodes[0].ticket_ids().len(), 8);
    assert!(!dir.path().join("ERP_30d.lock").exists());
}

#[tokio::test]
async fn inconsistent_result_keeps_previous_file() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path(), Arc::new(MemoryStore::new()), Arc::default());
    let tickets = topic_tickets("login", "Login timeout", 8);
    let first = p.run(&VecSource(tickets.clone()), "ERP", 30).await.unwrap();
    let before = std::fs::read(&first.path).unwrap();

    // the source hands back one ticket twice
    let mut duplicated = tickets;
    duplicated.push(duplicated[0].clone());
    let err = p.run(&VecSource(duplicated), "ERP", 30).await.unwrap_err();

    assert!(matches!(err, PipelineError::Consistency(_)), "{err:?}");
    assert_eq!(std::fs::read(&first.path).unwrap(), before);
    let mut files: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    assert_eq!(files, vec!["ERP_30d.json"]);
}

#[tokio::test]
async fn held_lock_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let _held = RunLock::acquire(dir.path(), "ERP", 30).unwrap();

    let p = pipeline(dir.path(), Arc::new(MemoryStore::new()), Arc::default());
    let err = p
        .run(&VecSource(topic_tickets("login", "Login", 6)), "ERP", 30)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Output(OutputError::Locked(_))));
    assert!(!dir.path().join("ERP_30d.json").exists());
}

#[tokio::test]
async fn cancelled_run_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();

    let p = pipeline(dir.path(), Arc::new(MemoryStore::new()), Arc::default()).with_cancel(cancel);
    let err = p
        .run(&VecSource(topic_tickets("login", "Login", 6)), "ERP", 30)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled { stage: "fetch" }));
    assert!(!dir.path().join("ERP_30d.json").exists());
    assert!(!dir.path().join("ERP_30d.lock").exists());
}

#[tokio::test]
async fn no_tickets_yields_empty_result() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(dir.path(), Arc::new(MemoryStore::new()), Arc::default());
    let result = p.analyze("ERP", 30, Vec::new()).await.unwrap();
    assert!(result.nodes.is_empty());
    assert_eq!(result.metadata.total_tickets, 0);
    assert_eq!(result.metadata.noise_ratio, 0.0);
}
