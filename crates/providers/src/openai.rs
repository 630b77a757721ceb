use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::future::{AbortHandle, Abortable};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::agent_api::{ChatRequest, ModelInfo, StreamEvent, Usage, WireMessage};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use url::Url;

use crate::sse::{DataLine, SseParser};
use crate::ModelSource;

// ── Request types ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [WireMessage],
    stream: bool,
}

// ── Streaming response types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

// ── Model listing ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// `org/Some-Model-4bit` is shown as `Some-Model-4bit`.
fn display_name(id: &str) -> String {
    id.rsplit('/').next().unwrap_or(id).to_string()
}

// ── Client ───────────────────────────────────────────────────────────

/// Remote model source speaking the OpenAI chat completions protocol.
pub struct OpenAIClient {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
    in_flight: Mutex<Option<AbortHandle>>,
}

impl OpenAIClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let base_url = parse_base_url(base_url)?;
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(2)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            in_flight: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid endpoint path {path}"))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn stream_inner(
        &self,
        request: &ChatRequest,
        tx: &UnboundedSender<StreamEvent>,
    ) -> Result<()> {
        let url = self.endpoint("v1/chat/completions")?;
        let body = CompletionRequest {
            model: &request.model,
            messages: &request.messages,
            stream: true,
        };
        let resp = self
            .authorize(self.http.post(url))
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow!("connection failed: {}", e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let detail: String = body.chars().take(800).collect();
            if detail.trim().is_empty() {
                return Err(anyhow!("server error: {}", status));
            }
            return Err(anyhow!("server error: {}\n{}", status, detail));
        }

        let mut parser = SseParser::new();
        let mut stream = resp.bytes_stream();
        let mut finish_reason: Option<String> = None;

        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    let _ = tx.send(StreamEvent::Error(format!("stream read error: {}", e)));
                    return Ok(());
                }
            };
            for line in parser.feed(&bytes) {
                if !forward_line(line, &mut finish_reason, tx) {
                    return Ok(());
                }
            }
        }
        if let Some(line) = parser.finish() {
            if !forward_line(line, &mut finish_reason, tx) {
                return Ok(());
            }
        }

        // Server closed the connection without [DONE]; treat as end of stream.
        let _ = tx.send(StreamEvent::Done { finish_reason });
        Ok(())
    }
}

fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim()).with_context(|| format!("invalid server URL '{raw}'"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(anyhow!("server URL must use http or https: {raw}"));
    }
    // Url::join replaces the last segment unless the path ends with '/'
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Forward one decoded line. Returns `false` once the stream is finished.
fn forward_line(
    line: DataLine,
    finish_reason: &mut Option<String>,
    tx: &UnboundedSender<StreamEvent>,
) -> bool {
    let payload = match line {
        DataLine::Done => {
            let _ = tx.send(StreamEvent::Done {
                finish_reason: finish_reason.take(),
            });
            return false;
        }
        DataLine::Payload(payload) => payload,
    };

    let chunk = match serde_json::from_str::<StreamChunk>(&payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::warn!("malformed stream chunk: {}", e);
            let _ = tx.send(StreamEvent::Error(format!("malformed stream chunk: {}", e)));
            return false;
        }
    };

    if let Some(choice) = chunk.choices.first() {
        if let Some(content) = choice.delta.as_ref().and_then(|d| d.content.as_ref()) {
            if !content.is_empty() {
                let _ = tx.send(StreamEvent::Delta(content.clone()));
            }
        }
        if let Some(reason) = &choice.finish_reason {
            *finish_reason = Some(reason.clone());
        }
    }
    if let Some(usage) = chunk.usage {
        let _ = tx.send(StreamEvent::Usage(usage));
    }
    true
}

#[async_trait]
impl ModelSource for OpenAIClient {
    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = self.endpoint("v1/models")?;
        let resp = self
            .authorize(self.http.get(url))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| anyhow!("connection failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(anyhow!("server error: {}", resp.status()));
        }
        let list: ModelList = resp.json().await.context("invalid model list")?;
        Ok(list
            .data
            .into_iter()
            .map(|m| ModelInfo {
                display_name: display_name(&m.id),
                id: m.id,
            })
            .collect())
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
        tx: UnboundedSender<StreamEvent>,
    ) -> Result<()> {
        let (handle, registration) = AbortHandle::new_pair();
        if let Some(previous) = self.in_flight.lock().replace(handle) {
            previous.abort();
        }

        tracing::debug!(model = %request.model, messages = request.messages.len(), "streaming chat completion");
        let result = Abortable::new(self.stream_inner(&request, &tx), registration).await;
        match result {
            Ok(inner) => inner,
            Err(_aborted) => {
                tracing::debug!("chat completion aborted");
                Ok(())
            }
        }
    }

    fn cancel(&self) {
        if let Some(handle) = self.in_flight.lock().take() {
            handle.abort();
        }
    }
}
