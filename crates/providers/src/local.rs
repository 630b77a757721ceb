//! In-process model source.
//!
//! A [`LocalBackend`] knows how to find and load models; the loaded
//! [`LocalModel`] tokenizes chat history and runs forward passes against a
//! per-layer cache. Only one model is resident at a time. Generation runs on
//! the blocking pool and reuses the previous turn's cache through
//! [`PromptCache`].

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use shared::agent_api::{ChatRequest, ModelInfo, StreamEvent, Usage, WireMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;

use crate::prompt_cache::{LayerCache, PromptCache, Reconciliation, TokenId};
use crate::ModelSource;

/// Default cap on generated tokens per completion
const DEFAULT_MAX_TOKENS: usize = 4096;

/// A loaded model.
pub trait LocalModel: Send + 'static {
    type Layer: LayerCache + Send;

    /// Apply the chat template and tokenize the conversation.
    fn encode_chat(&self, messages: &[WireMessage]) -> Result<Vec<TokenId>>;

    /// Fresh, empty per-layer cache.
    fn new_cache(&self) -> Vec<Self::Layer>;

    /// Process `tokens` into `cache` and sample the next token.
    fn forward(&mut self, cache: &mut [Self::Layer], tokens: &[TokenId]) -> Result<TokenId>;

    fn is_end_of_sequence(&self, token: TokenId) -> bool;

    fn decode(&self, tokens: &[TokenId]) -> String;
}

/// Discovers and loads models from disk.
pub trait LocalBackend: Send + Sync + 'static {
    type Model: LocalModel;

    fn available_models(&self) -> Result<Vec<ModelInfo>>;

    fn load(&self, model_id: &str) -> Result<Self::Model>;
}

/// Model loading progress, observable separately from chat streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading { model_id: String },
    Loaded { model_id: String },
    Failed { model_id: String, error: String },
}

struct Resident<M: LocalModel> {
    id: String,
    model: M,
    cache: PromptCache<M::Layer>,
}

type Slot<M> = Arc<Mutex<Option<Resident<M>>>>;

pub struct LocalSource<B: LocalBackend> {
    backend: Arc<B>,
    resident: Slot<B::Model>,
    state: watch::Sender<LoadState>,
    /// Bumped by `cancel`; a generation stops once the epoch moves past the one it started in
    cancel_epoch: Arc<AtomicU64>,
    load_lock: tokio::sync::Mutex<()>,
    max_tokens: usize,
}

impl<B: LocalBackend> LocalSource<B> {
    pub fn new(backend: B) -> Self {
        let (state, _) = watch::channel(LoadState::Unloaded);
        Self {
            backend: Arc::new(backend),
            resident: Arc::new(Mutex::new(None)),
            state,
            cancel_epoch: Arc::new(AtomicU64::new(0)),
            load_lock: tokio::sync::Mutex::new(()),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Watch model loading progress.
    pub fn load_state(&self) -> watch::Receiver<LoadState> {
        self.state.subscribe()
    }

    pub fn loaded_model(&self) -> Option<String> {
        match &*self.state.borrow() {
            LoadState::Loaded { model_id } => Some(model_id.clone()),
            _ => None,
        }
    }

    /// Load `model_id`, unloading the resident model first.
    ///
    /// Loads are serialised, and any in-flight generation is cancelled, so two
    /// models are never resident at once.
    pub async fn load(&self, model_id: &str) -> Result<()> {
        let _serial = self.load_lock.lock().await;
        self.cancel();
        self.unload_resident().await?;

        tracing::info!(model = model_id, "loading local model");
        self.state.send_replace(LoadState::Loading {
            model_id: model_id.to_string(),
        });

        let backend = self.backend.clone();
        let id = model_id.to_string();
        let loaded = tokio::task::spawn_blocking(move || backend.load(&id))
            .await
            .map_err(|e| anyhow!("model load task failed: {}", e))
            .and_then(|r| r);

        match loaded {
            Ok(model) => {
                let cache = PromptCache::new(model.new_cache());
                *self.resident.lock() = Some(Resident {
                    id: model_id.to_string(),
                    model,
                    cache,
                });
                self.state.send_replace(LoadState::Loaded {
                    model_id: model_id.to_string(),
                });
                tracing::info!(model = model_id, "local model loaded");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(model = model_id, "local model failed to load: {:#}", e);
                self.state.send_replace(LoadState::Failed {
                    model_id: model_id.to_string(),
                    error: format!("{:#}", e),
                });
                Err(e)
            }
        }
    }

    /// Drop the resident model and its prompt cache.
    pub async fn unload(&self) -> Result<()> {
        let _serial = self.load_lock.lock().await;
        self.cancel();
        self.unload_resident().await?;
        self.state.send_replace(LoadState::Unloaded);
        Ok(())
    }

    async fn unload_resident(&self) -> Result<()> {
        // A cancelled generation may still hold the slot until its next token.
        let slot = self.resident.clone();
        let previous = tokio::task::spawn_blocking(move || slot.lock().take())
            .await
            .context("model unload task failed")?;
        if let Some(previous) = previous {
            tracing::info!(model = %previous.id, "unloaded local model");
        }
        Ok(())
    }
}

#[async_trait]
impl<B: LocalBackend> ModelSource for LocalSource<B> {
    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || backend.available_models())
            .await
            .context("model discovery task failed")?
    }

    async fn prepare(&self, model_id: &str) -> Result<()> {
        if self.loaded_model().as_deref() == Some(model_id) {
            return Ok(());
        }
        self.load(model_id).await
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
        tx: UnboundedSender<StreamEvent>,
    ) -> Result<()> {
        let slot = self.resident.clone();
        let epoch = self.cancel_epoch.clone();
        let started_in = epoch.load(Ordering::SeqCst);
        let max_tokens = self.max_tokens;

        tokio::task::spawn_blocking(move || {
            let mut guard = slot.lock();
            let resident = guard
                .as_mut()
                .ok_or_else(|| anyhow!("no local model loaded"))?;
            if resident.id != request.model {
                return Err(anyhow!(
                    "model '{}' is not loaded (resident: '{}')",
                    request.model,
                    resident.id
                ));
            }
            let is_cancelled = || epoch.load(Ordering::SeqCst) != started_in;
            generate(resident, &request.messages, &tx, is_cancelled, max_tokens)
        })
        .await
        .map_err(|e| anyhow!("generation task failed: {}", e))?
    }

    fn cancel(&self) {
        self.cancel_epoch.fetch_add(1, Ordering::SeqCst);
    }
}

/// Decide which prompt tokens must be fed, consulting the prompt cache.
fn uncached_prompt<M: LocalModel>(resident: &mut Resident<M>, prompt: &[TokenId]) -> Vec<TokenId> {
    let mut uncached = match resident.cache.reconcile(prompt) {
        Reconciliation::Reused {
            prefix_len,
            uncached,
        } => {
            tracing::debug!(reused = prefix_len, uncached = uncached.len(), "prompt cache reconciled");
            uncached
        }
        Reconciliation::Invalidated => {
            tracing::debug!("prompt cache invalidated, processing full prompt");
            resident.cache.replace(resident.model.new_cache());
            resident.cache.extend(prompt);
            prompt.to_vec()
        }
    };

    // Sampling needs at least one fresh position; re-feed the final token.
    if uncached.is_empty() {
        let last = prompt.len() - 1;
        if resident.cache.trim_to(last) {
            resident.cache.extend(&prompt[last..]);
            uncached = prompt[last..].to_vec();
        } else {
            resident.cache.replace(resident.model.new_cache());
            resident.cache.extend(prompt);
            uncached = prompt.to_vec();
        }
    }
    uncached
}

/// Text of the full decode that has not been streamed yet. When the decode
/// no longer extends what was streamed, whatever lies past the streamed
/// length is still returned so the reply is not cut short.
fn unsent_tail<'a>(text: &'a str, emitted: &str) -> Option<&'a str> {
    let rest = match text.strip_prefix(emitted) {
        Some(rest) => rest,
        None => {
            tracing::warn!(
                streamed = emitted.len(),
                decoded = text.len(),
                "final decode diverged from streamed text"
            );
            let mut start = emitted.len().min(text.len());
            while !text.is_char_boundary(start) {
                start += 1;
            }
            &text[start..]
        }
    };
    (!rest.is_empty()).then_some(rest)
}

fn generate<M: LocalModel>(
    resident: &mut Resident<M>,
    messages: &[WireMessage],
    tx: &UnboundedSender<StreamEvent>,
    is_cancelled: impl Fn() -> bool,
    max_tokens: usize,
) -> Result<()> {
    let prompt = resident.model.encode_chat(messages)?;
    if prompt.is_empty() {
        return Err(anyhow!("chat template produced an empty prompt"));
    }

    let started = Instant::now();
    let uncached = uncached_prompt(resident, &prompt);
    let mut next = match resident.model.forward(resident.cache.layers_mut(), &uncached) {
        Ok(token) => token,
        Err(e) => {
            resident.cache.replace(resident.model.new_cache());
            return Err(e.context("prompt processing failed"));
        }
    };
    let prompt_time = started.elapsed().as_secs_f64();

    let generation_started = Instant::now();
    let mut generated: Vec<TokenId> = Vec::new();
    let mut emitted = String::new();
    let mut finish_reason = "stop";

    loop {
        if is_cancelled() {
            tracing::debug!(tokens = generated.len(), "local generation cancelled");
            return Ok(());
        }
        if resident.model.is_end_of_sequence(next) {
            break;
        }
        if generated.len() >= max_tokens {
            finish_reason = "length";
            break;
        }

        generated.push(next);
        let text = resident.model.decode(&generated);
        // Hold back text ending in a partial multi-byte sequence.
        if text.len() > emitted.len() && text.starts_with(&emitted) && !text.ends_with('\u{FFFD}')
        {
            let _ = tx.send(StreamEvent::Delta(text[emitted.len()..].to_string()));
            emitted = text;
        }

        match resident.model.forward(resident.cache.layers_mut(), &[next]) {
            Ok(token) => {
                resident.cache.extend(&[next]);
                next = token;
            }
            Err(e) => {
                resident.cache.replace(resident.model.new_cache());
                let _ = tx.send(StreamEvent::Error(format!("generation failed: {:#}", e)));
                return Ok(());
            }
        }
    }

    let text = resident.model.decode(&generated);
    if let Some(rest) = unsent_tail(&text, &emitted) {
        let _ = tx.send(StreamEvent::Delta(rest.to_string()));
    }

    let completion_tokens = generated.len() as u64;
    let _ = tx.send(StreamEvent::Usage(Usage {
        prompt_tokens: Some(prompt.len() as u64),
        completion_tokens: Some(completion_tokens),
        total_tokens: Some(prompt.len() as u64 + completion_tokens),
        prompt_time: Some(prompt_time),
        generation_time: Some(generation_started.elapsed().as_secs_f64()),
    }));
    let _ = tx.send(StreamEvent::Done {
        finish_reason: Some(finish_reason.to_string()),
    });
    Ok(())
}
