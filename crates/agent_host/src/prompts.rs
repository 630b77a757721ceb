//! System prompts for the two chat modes.
//!
//! The agent prompt documents the action wire format the parser and the
//! result formatter implement, so the three must change together.

use shared::agent_api::ChatMode;
use std::path::Path;

const ACTION_REFERENCE: &str = r#"## Actions
You can act on the selected folder by writing exactly one action line:

ACTION: READ_FILE(path='relative/path')
ACTION: LIST_DIR(path='relative/dir')
ACTION: RUN_COMMAND(command='shell command')
ACTION: EDIT_FILE(path='relative/path')
CONTENT_START
<the complete new file content>
CONTENT_END

Rules:
- When you use an action, your reply must contain ONLY the action line (plus the content block for EDIT_FILE). No other text.
- One action per reply. Wait for the result before the next step.
- Paths are relative to the selected folder. You cannot access anything outside it.
- EDIT_FILE replaces the whole file and creates missing directories.
- RUN_COMMAND runs through `sh -c` inside the selected folder. There is no timeout, so avoid commands that wait for input.

## Results
Each result arrives as a user message:

ACTION_RESULT: READ_FILE(path='...')
STATUS: SUCCESS
CONTENT:
<file content>

LIST_DIR answers with LISTING: instead of CONTENT:, one entry per line, directories ending in /.
EDIT_FILE answers with STATUS: SUCCESS only.
RUN_COMMAND answers with:

ACTION_RESULT: RUN_COMMAND(command='...')
EXIT_CODE: <n>
STDOUT_START
<stdout>
STDOUT_END
STDERR_START
<stderr>
STDERR_END

Failures answer with STATUS: ERROR: <message>. Read the message and correct your next step.
When you have what you need, answer the user normally without any action line."#;

fn folder_line(root: Option<&Path>) -> String {
    match root {
        Some(root) => format!("The selected folder is: {}", root.display()),
        None => "No folder is selected yet. Ask the user to choose one before using actions."
            .to_string(),
    }
}

/// Get the system prompt for `mode`.
pub fn system_prompt(mode: ChatMode, root: Option<&Path>) -> String {
    match mode {
        ChatMode::Agent => format!(
            "You are a coding assistant working inside the user's project folder.\n\
             {}\n\n{}",
            folder_line(root),
            ACTION_REFERENCE
        ),
        ChatMode::Ask => format!(
            "You are a helpful coding assistant. Answer questions directly.\n\
             You cannot read files or run commands in this mode; if you need to, \
             tell the user to switch to agent mode.\n{}",
            folder_line(root)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_prompt_documents_wire_format() {
        let prompt = system_prompt(ChatMode::Agent, Some(Path::new("/proj")));
        assert!(prompt.contains("/proj"));
        for label in [
            "ACTION: READ_FILE",
            "CONTENT_START",
            "CONTENT_END",
            "STATUS: SUCCESS",
            "LISTING:",
            "EXIT_CODE:",
            "STDOUT_START",
            "STDERR_END",
            "STATUS: ERROR:",
        ] {
            assert!(prompt.contains(label), "missing {}", label);
        }
    }

    #[test]
    fn test_ask_prompt_has_no_actions() {
        let prompt = system_prompt(ChatMode::Ask, None);
        assert!(!prompt.contains("ACTION:"));
        assert!(prompt.contains("No folder is selected"));
    }
}
