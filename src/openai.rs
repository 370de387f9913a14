//! OpenAI-compatible HTTP capabilities (embeddings and chat completions).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::OpenAiSettings;
use crate::embedding::Embedder;
use crate::error::CapabilityError;
use crate::label::{LabelRequest, NodeKind, Summarizer};

const TIMEOUT: Duration = Duration::from_secs(60);
const MAX_RETRIES: usize = 4;

const LEAF_PROMPT: &str = "You analyse groups of IT support tickets that describe the same recurring problem. \
Given sample tickets of one group, answer with a JSON object \
{\"title\": string (at most 8 words), \"description\": string (one or two sentences on the technical problem), \"tags\": [3 to 5 short strings]}. \
If the samples are too generic or unrelated to name a single problem, answer {\"inconclusive\": true}.";

const PARENT_PROMPT: &str = "You consolidate related groups of IT support tickets into one broader theme. \
Given the titles and descriptions of the sub-groups (or sample tickets), answer with a JSON object \
{\"title\": string (at most 6 words, naming the shared area), \"description\": string (one sentence), \"tags\": [3 to 5 short strings]}. \
If no common theme exists, answer {\"inconclusive\": true}.";

fn build_client(api_key: &str) -> Result<Client, CapabilityError> {
    let mut headers = HeaderMap::new();
    let auth = format!("Bearer {}", api_key.trim());
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&auth)
            .map_err(|_| CapabilityError::NotConfigured("invalid OpenAI API key".into()))?,
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Client::builder()
        .timeout(TIMEOUT)
        .default_headers(headers)
        .build()
        .map_err(|e| CapabilityError::NotConfigured(format!("http client: {e}")))
}

fn require_key(settings: &OpenAiSettings) -> Result<&str, CapabilityError> {
    settings
        .api_key
        .as_deref()
        .ok_or_else(|| CapabilityError::NotConfigured("OPENAI_API_KEY is not set".into()))
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

/// POST `body` with retries on 429, 5xx and transient transport errors.
async fn post_json<B: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
    client: &Client,
    endpoint: &str,
    body: &B,
) -> Result<R, CapabilityError> {
    let mut attempt = 0usize;
    loop {
        match client.post(endpoint).json(body).send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    return resp
                        .json::<R>()
                        .await
                        .map_err(|e| CapabilityError::Malformed(e.to_string()));
                }
                let body = resp
                    .text()
                    .await
                    .unwrap_or_else(|_| "<body unavailable>".to_string());
                if should_retry(status) && attempt + 1 < MAX_RETRIES {
                    attempt += 1;
                    debug!(%status, attempt, "retrying OpenAI request");
                    tokio::time::sleep(retry_backoff(attempt)).await;
                    continue;
                }
                return Err(CapabilityError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            Err(err) => {
                if is_retryable_error(&err) && attempt + 1 < MAX_RETRIES {
                    attempt += 1;
                    debug!(error = %err, attempt, "retrying OpenAI request");
                    tokio::time::sleep(retry_backoff(attempt)).await;
                    continue;
                }
                return Err(CapabilityError::Request(err.to_string()));
            }
        }
    }
}

/// Embeddings client for OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: Option<usize>,
}

impl OpenAiEmbedder {
    pub fn new(settings: &OpenAiSettings, dimensions: Option<usize>) -> Result<Self, CapabilityError> {
        let client = build_client(require_key(settings)?)?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", settings.base_url.trim_end_matches('/')),
            model: settings.embedding_model.clone(),
            dimensions,
        })
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    /// Endpoint, model and requested dimensions: a vector from one of them
    /// is never reused for another.
    fn model_id(&self) -> String {
        let dims = self
            .dimensions
            .map_or_else(|| "native".to_string(), |d| d.to_string());
        format!("{}#{}/{}", self.endpoint, self.model, dims)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.dimensions,
        };
        let mut parsed: EmbeddingResponse =
            post_json(&self.client, &self.endpoint, &request).await?;
        parsed.data.sort_by_key(|entry| entry.index);
        if parsed.data.len() != texts.len() {
            return Err(CapabilityError::Malformed(format!(
                "{} embeddings for {} inputs",
                parsed.data.len(),
                texts.len()
            )));
        }
        Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
    }
}

/// Chat-completions client producing JSON labels.
#[derive(Clone)]
pub struct OpenAiSummarizer {
    client: Client,
    endpoint: String,
    model: String,
}

impl OpenAiSummarizer {
    pub fn new(settings: &OpenAiSettings) -> Result<Self, CapabilityError> {
        let client = build_client(require_key(settings)?)?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/chat/completions",
                settings.base_url.trim_end_matches('/')
            ),
            model: settings.chat_model.clone(),
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    response_format: ResponseFormat,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}

/// User message: keywords hint plus numbered samples.
fn render_prompt(request: &LabelRequest) -> String {
    let mut prompt = String::new();
    if !request.keywords.is_empty() {
        prompt.push_str("Frequent terms: ");
        prompt.push_str(&request.keywords.join(", "));
        prompt.push_str("\n\n");
    }
    let heading = match request.kind {
        NodeKind::Leaf => "Sample tickets",
        NodeKind::Parent => "Sub-groups",
    };
    prompt.push_str(heading);
    prompt.push_str(":\n");
    for (i, sample) in request.samples.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, sample));
    }
    prompt
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    async fn summarize(&self, request: &LabelRequest) -> Result<Value, CapabilityError> {
        let system = match request.kind {
            NodeKind::Leaf => LEAF_PROMPT,
            NodeKind::Parent => PARENT_PROMPT,
        };
        let user = render_prompt(request);
        let body = ChatRequest {
            model: &self.model,
            temperature: 0.0,
            response_format: ResponseFormat {
                kind: "json_object",
            },
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: &user,
                },
            ],
        };
        let parsed: ChatResponse = post_json(&self.client, &self.endpoint, &body).await?;
        let content = parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .ok_or_else(|| CapabilityError::Malformed("no message content".into()))?;
        serde_json::from_str(&content)
            .map_err(|e| CapabilityError::Malformed(format!("label is not JSON: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(key: Option<&str>) -> OpenAiSettings {
        OpenAiSettings {
            api_key: key.map(String::from),
            base_url: "http://localhost:9/v1/".into(),
            embedding_model: "text-embedding-3-small".into(),
            chat_model: "gpt-4o-mini".into(),
        }
    }

    #[test]
    fn missing_key_is_not_configured() {
        assert!(matches!(
            OpenAiEmbedder::new(&settings(None), None),
            Err(CapabilityError::NotConfigured(_))
        ));
        assert!(OpenAiSummarizer::new(&settings(None)).is_err());
    }

    #[test]
    fn endpoints_trim_trailing_slash() {
        let e = OpenAiEmbedder::new(&settings(Some("sk-test")), Some(256)).unwrap();
        assert_eq!(e.endpoint, "http://localhost:9/v1/embeddings");
        let s = OpenAiSummarizer::new(&settings(Some("sk-test"))).unwrap();
        assert_eq!(s.endpoint, "http://localhost:9/v1/chat/completions");
    }

    #[test]
    fn model_id_names_endpoint_model_and_dimensions() {
        let sized = OpenAiEmbedder::new(&settings(Some("sk-test")), Some(256)).unwrap();
        let native = OpenAiEmbedder::new(&settings(Some("sk-test")), None).unwrap();
        assert_eq!(
            sized.model_id(),
            "http://localhost:9/v1/embeddings#text-embedding-3-small/256"
        );
        assert!(native.model_id().ends_with("/native"));
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(retry_backoff(1), Duration::from_millis(1000));
        assert_eq!(retry_backoff(9), retry_backoff(5));
    }

    #[test]
    fn prompt_lists_samples() {
        let prompt = render_prompt(&LabelRequest {
            node_id: "micro-0".into(),
            kind: NodeKind::Leaf,
            samples: vec!["first".into(), "second".into()],
            keywords: vec!["login".into()],
        });
        assert_eq!(
            prompt,
            "Frequent terms: login\n\nSample tickets:\n1. first\n2. second\n"
        );
    }
}
