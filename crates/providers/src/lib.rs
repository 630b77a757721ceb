//! Model sources for the chat session.
//!
//! Two interchangeable backends stream completions through the same
//! [`ModelSource`] contract:
//! - [`openai::OpenAIClient`] talks to an OpenAI-compatible HTTP server
//! - [`local::LocalSource`] drives an in-process model and reuses its
//!   prompt cache across turns

pub mod local;
pub mod openai;
pub mod prompt_cache;
pub mod sse;

use anyhow::Result;
use async_trait::async_trait;
use shared::agent_api::{ChatRequest, ModelInfo, StreamEvent};
use tokio::sync::mpsc::UnboundedSender;

pub use local::{LoadState, LocalBackend, LocalModel, LocalSource};
pub use openai::OpenAIClient;
pub use prompt_cache::{LayerCache, PromptCache, Reconciliation, TokenId};

/// A backend able to stream chat completions.
///
/// Contract: if the request fails *before* any event is sent, `stream_chat`
/// returns `Err(...)`. Once streaming starts, failures are reported as
/// [`StreamEvent::Error`] and the method returns `Ok(())`. A successful stream
/// always ends with [`StreamEvent::Done`]; nothing follows `Done` or `Error`.
#[async_trait]
pub trait ModelSource: Send + Sync {
    /// Models this source can serve.
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;

    /// Make `model_id` ready for generation. Remote servers need no preparation.
    async fn prepare(&self, _model_id: &str) -> Result<()> {
        Ok(())
    }

    /// Stream one completion for `request` into `tx`, in arrival order.
    async fn stream_chat(&self, request: ChatRequest, tx: UnboundedSender<StreamEvent>)
        -> Result<()>;

    /// Abort the in-flight generation, if any. Best effort.
    fn cancel(&self);
}
