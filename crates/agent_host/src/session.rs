//! Chat session state machine.
//!
//! A session owns the conversation history and runs at most one turn at a
//! time. A turn streams a reply from the [`ModelSource`], and in agent mode
//! keeps going while the model asks for actions: each action result is
//! appended as a hidden user message and the model is asked again.
//!
//! State lives behind a `parking_lot` mutex that is never held across an
//! await. Cancellation bumps a generation counter; a turn whose generation is
//! stale stops touching session state.

use futures::future::{AbortHandle, AbortRegistration, Abortable};
use parking_lot::Mutex;
use providers::ModelSource;
use shared::agent_api::{
    ChatMessage, ChatMode, ChatRequest, MessageMetrics, ModelInfo, Role, StreamEvent, TurnState,
    Usage, WireMessage,
};
use shared::events::SessionEvent;
use shared::settings::AppSettings;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::action::{format_result, parse_action};
use crate::action_executor::ActionExecutor;
use crate::prompts::system_prompt;

/// Generation times at or below this are too small to derive a token rate from.
pub const MIN_GENERATION_SECS: f64 = 0.001;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("a turn is already in progress")]
    Busy,

    #[error("no model selected")]
    NoModelSelected,

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("connection error: {0}")]
    Transport(String),
}

/// How a submitted turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model answered without requesting another action
    Completed,
    Cancelled,
    /// An action was requested after the tool loop bound was reached; it was not run
    ToolLimitReached,
}

struct State {
    turn: TurnState,
    history: Vec<ChatMessage>,
    mode: ChatMode,
    sandbox_root: Option<PathBuf>,
    model: Option<String>,
    generation: u64,
    abort: Option<AbortHandle>,
}

struct Inner {
    source: Arc<dyn ModelSource>,
    executor: ActionExecutor,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    max_tool_iterations: Option<usize>,
    state: Mutex<State>,
}

/// Handle to a chat session. Clones share the same session.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<Inner>,
}

/// Result of streaming one model reply.
enum Streamed {
    Finished,
    Stale,
}

/// What the consumer saw on the event channel.
#[derive(Default)]
struct Reply {
    message_id: Option<Uuid>,
    time_to_first_token: Option<f64>,
    first_token_at: Option<Instant>,
    usage: Option<Usage>,
    error: Option<String>,
    stale: bool,
}

impl ChatSession {
    pub fn new(source: Arc<dyn ModelSource>, settings: &AppSettings) -> Self {
        Self::with_executor(source, settings, None, ActionExecutor::new())
    }

    /// Session that publishes [`SessionEvent`]s to `events`.
    pub fn with_events(
        source: Arc<dyn ModelSource>,
        settings: &AppSettings,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let executor = ActionExecutor::with_events(events.clone());
        Self::with_executor(source, settings, Some(events), executor)
    }

    pub fn with_executor(
        source: Arc<dyn ModelSource>,
        settings: &AppSettings,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
        executor: ActionExecutor,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                executor,
                events,
                max_tool_iterations: settings.max_tool_iterations,
                state: Mutex::new(State {
                    turn: TurnState::Idle,
                    history: Vec::new(),
                    mode: settings.mode,
                    sandbox_root: absolute_root(settings.sandbox_root.clone()),
                    model: settings.selected_model.clone(),
                    generation: 0,
                    abort: None,
                }),
            }),
        }
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.inner.state.lock().history.clone()
    }

    /// History without the hidden action-result messages.
    pub fn visible_history(&self) -> Vec<ChatMessage> {
        self.inner
            .state
            .lock()
            .history
            .iter()
            .filter(|m| !m.synthetic)
            .cloned()
            .collect()
    }

    pub fn turn_state(&self) -> TurnState {
        self.inner.state.lock().turn
    }

    pub fn mode(&self) -> ChatMode {
        self.inner.state.lock().mode
    }

    /// Takes effect on the next model request.
    pub fn set_mode(&self, mode: ChatMode) {
        self.inner.state.lock().mode = mode;
    }

    pub fn sandbox_root(&self) -> Option<PathBuf> {
        self.inner.state.lock().sandbox_root.clone()
    }

    /// Takes effect on the next action or model request. A relative root is
    /// treated as no folder.
    pub fn set_sandbox_root(&self, root: Option<PathBuf>) {
        self.inner.state.lock().sandbox_root = absolute_root(root);
    }

    pub fn model(&self) -> Option<String> {
        self.inner.state.lock().model.clone()
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, SessionError> {
        self.inner
            .source
            .list_models()
            .await
            .map_err(|e| SessionError::Transport(format!("{:#}", e)))
    }

    /// Switch models. An in-flight turn is cancelled first.
    pub async fn select_model(&self, model_id: &str) -> Result<(), SessionError> {
        self.cancel();
        self.inner.source.prepare(model_id).await.map_err(|e| {
            tracing::warn!(model = model_id, "model selection failed: {:#}", e);
            SessionError::ModelUnavailable(format!("{:#}", e))
        })?;
        self.inner.state.lock().model = Some(model_id.to_string());
        tracing::info!(model = model_id, "model selected");
        Ok(())
    }

    /// Empty the history. Only allowed while idle.
    pub fn clear(&self) -> Result<(), SessionError> {
        let mut st = self.inner.state.lock();
        if st.turn.is_busy() {
            return Err(SessionError::Busy);
        }
        st.history.clear();
        self.emit(SessionEvent::HistoryCleared);
        Ok(())
    }

    /// Abort the running turn. Returns `false` if there was nothing to cancel.
    ///
    /// Text streamed so far stays in history. Nothing the cancelled turn does
    /// afterwards is visible.
    pub fn cancel(&self) -> bool {
        {
            let mut st = self.inner.state.lock();
            if !st.turn.is_busy() {
                return false;
            }
            st.generation += 1;
            if let Some(handle) = st.abort.take() {
                handle.abort();
            }
            self.set_turn(&mut st, TurnState::Cancelled);
            self.set_turn(&mut st, TurnState::Idle);
        }
        self.inner.source.cancel();
        tracing::info!("turn cancelled");
        true
    }

    /// Send `text` as a user message and run the turn to completion,
    /// including any action round-trips.
    pub async fn submit(&self, text: &str) -> Result<TurnOutcome, SessionError> {
        let generation = {
            let mut st = self.inner.state.lock();
            if st.turn.is_busy() {
                return Err(SessionError::Busy);
            }
            if st.model.is_none() {
                return Err(SessionError::NoModelSelected);
            }
            let message = ChatMessage::user(text);
            st.history.push(message.clone());
            self.emit(SessionEvent::MessageAppended(message));
            self.set_turn(&mut st, TurnState::AwaitingFirstToken);
            st.generation
        };

        let mut iterations = 0usize;
        loop {
            if let Streamed::Stale = self.stream_reply(generation).await? {
                return Ok(TurnOutcome::Cancelled);
            }

            let (action, root) = {
                let mut st = self.inner.state.lock();
                if st.generation != generation {
                    return Ok(TurnOutcome::Cancelled);
                }
                self.set_turn(&mut st, TurnState::ExecutingAction);
                let action = match st.mode {
                    ChatMode::Agent => st
                        .history
                        .last()
                        .filter(|m| m.role == Role::Assistant)
                        .and_then(|m| parse_action(&m.content)),
                    ChatMode::Ask => None,
                };
                let Some(action) = action else {
                    self.finish(&mut st);
                    return Ok(TurnOutcome::Completed);
                };
                if let Some(max) = self.inner.max_tool_iterations {
                    if iterations >= max {
                        tracing::warn!(iterations, "tool loop bound reached");
                        self.emit(SessionEvent::ToolLoopLimit { iterations });
                        self.finish(&mut st);
                        return Ok(TurnOutcome::ToolLimitReached);
                    }
                }
                (action, st.sandbox_root.clone())
            };
            iterations += 1;

            let Some(registration) = self.arm(generation) else {
                return Ok(TurnOutcome::Cancelled);
            };
            self.emit(SessionEvent::ActionStarted {
                summary: action.summary(),
            });
            let execution = self.inner.executor.execute(&action, root.as_deref());
            let Ok(result) = Abortable::new(execution, registration).await else {
                return Ok(TurnOutcome::Cancelled);
            };

            let mut st = self.inner.state.lock();
            if st.generation != generation {
                return Ok(TurnOutcome::Cancelled);
            }
            let message = ChatMessage::action_result(format_result(&action, &result));
            st.history.push(message.clone());
            self.emit(SessionEvent::MessageAppended(message));
            self.set_turn(&mut st, TurnState::AwaitingFirstToken);
        }
    }

    /// Stream one reply into a new assistant message.
    async fn stream_reply(&self, generation: u64) -> Result<Streamed, SessionError> {
        let request = {
            let st = self.inner.state.lock();
            if st.generation != generation {
                return Ok(Streamed::Stale);
            }
            let mut messages = vec![WireMessage::system(system_prompt(
                st.mode,
                st.sandbox_root.as_deref(),
            ))];
            messages.extend(st.history.iter().map(ChatMessage::to_wire));
            ChatRequest {
                model: st.model.clone().ok_or(SessionError::NoModelSelected)?,
                messages,
            }
        };
        let Some(registration) = self.arm(generation) else {
            return Ok(Streamed::Stale);
        };

        tracing::debug!(messages = request.messages.len(), "requesting completion");
        let started = Instant::now();
        let (tx, rx) = mpsc::unbounded_channel();
        let source = self.inner.source.clone();
        let producer = async move { source.stream_chat(request, tx).await };
        let consumer = self.consume(rx, generation, started);

        let Ok((sent, reply)) =
            Abortable::new(async { tokio::join!(producer, consumer) }, registration).await
        else {
            return Ok(Streamed::Stale);
        };
        if reply.stale {
            return Ok(Streamed::Stale);
        }

        let failure = match sent {
            Err(e) => Some(format!("{:#}", e)),
            Ok(()) => reply.error.clone(),
        };

        let mut st = self.inner.state.lock();
        if st.generation != generation {
            return Ok(Streamed::Stale);
        }
        if let Some(message) = failure {
            tracing::warn!("generation failed: {}", message);
            self.emit(SessionEvent::Error(message.clone()));
            self.finish(&mut st);
            return Err(SessionError::Transport(message));
        }

        if let Some(id) = reply.message_id {
            let metrics = compute_metrics(&reply);
            if let Some(msg) = st.history.iter_mut().rev().find(|m| m.id == id) {
                msg.metrics = Some(metrics.clone());
            }
            self.emit(SessionEvent::MetricsUpdated {
                message_id: id,
                metrics,
            });
        }
        Ok(Streamed::Finished)
    }

    /// Apply stream events to the history in arrival order.
    async fn consume(
        &self,
        mut rx: mpsc::UnboundedReceiver<StreamEvent>,
        generation: u64,
        started: Instant,
    ) -> Reply {
        let mut reply = Reply::default();

        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Delta(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    let mut st = self.inner.state.lock();
                    if st.generation != generation {
                        reply.stale = true;
                        return reply;
                    }
                    let id = match reply.message_id {
                        Some(id) => id,
                        None => {
                            let message = ChatMessage::assistant("");
                            let id = message.id;
                            reply.message_id = Some(id);
                            reply.time_to_first_token = Some(started.elapsed().as_secs_f64());
                            reply.first_token_at = Some(Instant::now());
                            st.history.push(message.clone());
                            self.emit(SessionEvent::MessageAppended(message));
                            self.set_turn(&mut st, TurnState::Streaming);
                            id
                        }
                    };
                    if let Some(msg) = st.history.iter_mut().rev().find(|m| m.id == id) {
                        msg.content.push_str(&delta);
                    }
                    self.emit(SessionEvent::ContentDelta {
                        message_id: id,
                        delta,
                    });
                }
                StreamEvent::Usage(usage) => reply.usage = Some(usage),
                StreamEvent::Done { finish_reason } => {
                    tracing::debug!(?finish_reason, "stream finished");
                    break;
                }
                StreamEvent::Error(message) => {
                    reply.error = Some(message);
                    break;
                }
            }
        }
        reply
    }

    /// Register an abort handle for the next stage of turn `generation`.
    fn arm(&self, generation: u64) -> Option<AbortRegistration> {
        let mut st = self.inner.state.lock();
        if st.generation != generation {
            return None;
        }
        let (handle, registration) = AbortHandle::new_pair();
        st.abort = Some(handle);
        Some(registration)
    }

    fn finish(&self, st: &mut State) {
        st.abort = None;
        self.set_turn(st, TurnState::Idle);
    }

    fn set_turn(&self, st: &mut State, turn: TurnState) {
        if st.turn != turn {
            tracing::debug!(from = ?st.turn, to = ?turn, "turn state");
            st.turn = turn;
            self.emit(SessionEvent::TurnStateChanged(turn));
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.inner.events {
            let _ = events.send(event);
        }
    }
}

fn compute_metrics(reply: &Reply) -> MessageMetrics {
    let usage = reply.usage.clone().unwrap_or_default();
    let generation_time = usage
        .generation_time
        .or_else(|| reply.first_token_at.map(|t| t.elapsed().as_secs_f64()));
    let tokens_per_second = match (usage.completion_tokens, generation_time) {
        (Some(tokens), Some(secs)) if secs > MIN_GENERATION_SECS => Some(tokens as f64 / secs),
        _ => None,
    };
    MessageMetrics {
        time_to_first_token: reply.time_to_first_token,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        prompt_time: usage.prompt_time,
        generation_time,
        tokens_per_second,
    }
}

fn absolute_root(root: Option<PathBuf>) -> Option<PathBuf> {
    root.filter(|path| {
        let absolute = path.is_absolute();
        if !absolute {
            tracing::warn!(root = %path.display(), "ignoring folder that is not an absolute path");
        }
        absolute
    })
}
