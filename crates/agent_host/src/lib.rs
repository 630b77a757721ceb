//! Agent Host - folder-scoped chat agent
//!
//! This crate provides:
//! - The `ACTION:` protocol parser and result formatter
//! - Sandboxed execution of file and shell actions
//! - System prompts for agent and ask modes
//! - The chat session state machine driving the tool loop

pub mod action;
pub mod action_executor;
pub mod executor;
pub mod prompts;
pub mod session;

pub use action::{
    format_result, parse_action, ActionKind, ActionPayload, ActionResult, ActionStatus,
    ParsedAction,
};
pub use action_executor::{resolve_in_sandbox, ActionError, ActionExecutor};
pub use executor::{execute_command, ProcessOutput, ProcessRunner, ShellRunner};
pub use prompts::system_prompt;
pub use session::{ChatSession, SessionError, TurnOutcome, MIN_GENERATION_SECS};
