pub mod events;

pub mod settings {
    use serde::{Deserialize, Serialize};
    use std::path::PathBuf;

    use crate::agent_api::ChatMode;

    pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8080";

    fn default_server_url() -> String {
        DEFAULT_SERVER_URL.to_string()
    }

    fn default_max_tool_iterations() -> Option<usize> {
        Some(25)
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AppSettings {
        /// Base URL of the OpenAI-compatible inference server
        #[serde(default = "default_server_url")]
        pub server_url: String,
        #[serde(default)]
        pub api_key: Option<String>,
        #[serde(default)]
        pub selected_model: Option<String>,
        #[serde(default)]
        pub mode: ChatMode,
        /// Folder the agent actions are confined to
        #[serde(default)]
        pub sandbox_root: Option<PathBuf>,
        /// Upper bound on automatic action round-trips per submission; `None` disables the guard
        #[serde(default = "default_max_tool_iterations")]
        pub max_tool_iterations: Option<usize>,
    }

    impl Default for AppSettings {
        fn default() -> Self {
            Self {
                server_url: default_server_url(),
                api_key: None,
                selected_model: None,
                mode: ChatMode::default(),
                sandbox_root: None,
                max_tool_iterations: default_max_tool_iterations(),
            }
        }
    }

}

pub mod agent_api {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Role {
        System,
        User,
        Assistant,
    }

    /// Which system prompt the session sends: Agent enables actions, Ask disables them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum ChatMode {
        #[default]
        Agent,
        Ask,
    }

    /// Lifecycle of the single active turn of a session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum TurnState {
        Idle,
        AwaitingFirstToken,
        Streaming,
        ExecutingAction,
        Cancelled,
    }

    impl TurnState {
        pub fn is_busy(&self) -> bool {
            !matches!(self, TurnState::Idle)
        }
    }

    /// Generation timings attached to an assistant message. Times are in seconds.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct MessageMetrics {
        pub time_to_first_token: Option<f64>,
        pub prompt_tokens: Option<u64>,
        pub completion_tokens: Option<u64>,
        pub prompt_time: Option<f64>,
        pub generation_time: Option<f64>,
        pub tokens_per_second: Option<f64>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ChatMessage {
        pub id: Uuid,
        pub role: Role,
        pub content: String,
        #[serde(default)]
        pub metrics: Option<MessageMetrics>,
        /// Action results fed back to the model; part of history, hidden from display
        #[serde(default)]
        pub synthetic: bool,
        pub created_at: DateTime<Utc>,
    }

    impl ChatMessage {
        pub fn new(role: Role, content: impl Into<String>) -> Self {
            Self {
                id: Uuid::new_v4(),
                role,
                content: content.into(),
                metrics: None,
                synthetic: false,
                created_at: Utc::now(),
            }
        }

        pub fn user(content: impl Into<String>) -> Self {
            Self::new(Role::User, content)
        }

        pub fn assistant(content: impl Into<String>) -> Self {
            Self::new(Role::Assistant, content)
        }

        /// User-role message carrying an action result back to the model.
        pub fn action_result(content: impl Into<String>) -> Self {
            Self {
                synthetic: true,
                ..Self::new(Role::User, content)
            }
        }

        pub fn to_wire(&self) -> WireMessage {
            WireMessage {
                role: self.role,
                content: self.content.clone(),
            }
        }
    }

    /// `{role, content}` as sent to the completions endpoint.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct WireMessage {
        pub role: Role,
        pub content: String,
    }

    impl WireMessage {
        pub fn system(content: impl Into<String>) -> Self {
            Self {
                role: Role::System,
                content: content.into(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ChatRequest {
        pub model: String,
        pub messages: Vec<WireMessage>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ModelInfo {
        pub id: String,
        pub display_name: String,
    }

    /// Terminal usage record of a generation.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct Usage {
        #[serde(default)]
        pub prompt_tokens: Option<u64>,
        #[serde(default)]
        pub completion_tokens: Option<u64>,
        #[serde(default)]
        pub total_tokens: Option<u64>,
        #[serde(default)]
        pub prompt_time: Option<f64>,
        #[serde(default)]
        pub generation_time: Option<f64>,
    }

    /// Events produced by a model source while streaming one completion.
    #[derive(Debug, Clone, PartialEq)]
    pub enum StreamEvent {
        Delta(String),
        Usage(Usage),
        Done { finish_reason: Option<String> },
        Error(String),
    }

}
