//! Agent action protocol.
//!
//! The model requests an action by writing a single line
//!
//! ```text
//! ACTION: NAME(key='value', key2='value')
//! ```
//!
//! optionally followed (for `EDIT_FILE`) by a `CONTENT_START` / `CONTENT_END`
//! block. Only the first action line of a reply is honoured. Results are
//! rendered back into the fixed labeled text format the system prompt
//! documents.

use std::collections::BTreeMap;

use crate::executor::ProcessOutput;

const ACTION_PREFIX: &str = "ACTION:";
const CONTENT_START: &str = "CONTENT_START";
const CONTENT_END: &str = "CONTENT_END";

/// Closed set of actions the executor understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    ReadFile,
    ListDir,
    EditFile,
    RunCommand,
    /// Any other name; rejected at execution time
    Unknown(String),
}

impl ActionKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "READ_FILE" => ActionKind::ReadFile,
            "LIST_DIR" => ActionKind::ListDir,
            "EDIT_FILE" => ActionKind::EditFile,
            "RUN_COMMAND" => ActionKind::RunCommand,
            other => ActionKind::Unknown(other.to_string()),
        }
    }

    /// Parameter echoed in the result header.
    fn primary_parameter(&self) -> Option<&'static str> {
        match self {
            ActionKind::ReadFile | ActionKind::ListDir | ActionKind::EditFile => Some("path"),
            ActionKind::RunCommand => Some("command"),
            ActionKind::Unknown(_) => None,
        }
    }
}

/// An action request extracted from assistant text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAction {
    pub kind: ActionKind,
    /// Name as written by the model
    pub name: String,
    pub parameters: BTreeMap<String, String>,
    /// `EDIT_FILE` body; `None` when the block is missing or unterminated
    pub content: Option<String>,
}

impl ParsedAction {
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// Short human-readable form, e.g. `READ_FILE(path='src/main.rs')`.
    pub fn summary(&self) -> String {
        format!("{}({})", self.name, self.header_arguments())
    }

    fn header_arguments(&self) -> String {
        match self.kind.primary_parameter() {
            Some(key) => {
                let default = if self.kind == ActionKind::ListDir { "." } else { "" };
                format!("{}='{}'", key, self.parameter(key).unwrap_or(default))
            }
            None => self
                .parameters
                .iter()
                .map(|(k, v)| format!("{}='{}'", k, v))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionStatus {
    Success,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionPayload {
    FileContent(String),
    Listing(Vec<String>),
    Empty,
    Process(ProcessOutput),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResult {
    pub status: ActionStatus,
    pub payload: ActionPayload,
}

impl ActionResult {
    pub fn success(payload: ActionPayload) -> Self {
        Self {
            status: ActionStatus::Success,
            payload,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Error(message.into()),
            payload: ActionPayload::Empty,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

/// Find the first action request in `text`.
///
/// Returns `None` when there is no `ACTION:` line or the first one is
/// malformed; later lines are not consulted in either case.
pub fn parse_action(text: &str) -> Option<ParsedAction> {
    let mut lines = text.lines();
    let rest = lines.find_map(|line| line.trim().strip_prefix(ACTION_PREFIX))?;

    let open = rest.find('(')?;
    let close = rest.rfind(')')?;
    if close < open {
        return None;
    }
    let name = rest[..open].trim();
    if name.is_empty() {
        return None;
    }

    let kind = ActionKind::from_name(name);
    let content = if kind == ActionKind::EditFile {
        extract_content_block(lines)
    } else {
        None
    };

    Some(ParsedAction {
        kind,
        name: name.to_string(),
        parameters: parse_parameters(&rest[open + 1..close]),
        content,
    })
}

fn extract_content_block<'a>(mut lines: impl Iterator<Item = &'a str>) -> Option<String> {
    lines.find(|line| line.trim() == CONTENT_START)?;

    let mut body = Vec::new();
    for line in lines {
        if line.trim() == CONTENT_END {
            return Some(body.join("\n"));
        }
        body.push(line);
    }
    None
}

fn parse_parameters(args: &str) -> BTreeMap<String, String> {
    split_arguments(args)
        .into_iter()
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), unquote(value.trim()).to_string()))
        })
        .collect()
}

/// Split on commas that are not inside a quoted value. A quote only opens a
/// value when it is the first non-space character after the `=`.
fn split_arguments(args: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut seen_equals = false;
    let mut value_start = false;
    let mut start = 0;

    for (i, c) in args.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' if value_start => quote = Some(c),
            ',' => {
                parts.push(&args[start..i]);
                start = i + 1;
                seen_equals = false;
            }
            '=' if !seen_equals => {
                seen_equals = true;
                value_start = true;
                continue;
            }
            c if c.is_whitespace() => continue,
            _ => {}
        }
        value_start = false;
    }
    parts.push(&args[start..]);
    parts
}

fn unquote(value: &str) -> &str {
    for q in ['\'', '"'] {
        if value.len() >= 2 && value.starts_with(q) && value.ends_with(q) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Render an action result in the text format fed back to the model.
pub fn format_result(action: &ParsedAction, result: &ActionResult) -> String {
    let mut out = format!("ACTION_RESULT: {}\n", action.summary());

    if let ActionStatus::Error(message) = &result.status {
        out.push_str(&format!("STATUS: ERROR: {}", message));
        return out;
    }

    match &result.payload {
        ActionPayload::FileContent(content) => {
            out.push_str("STATUS: SUCCESS\nCONTENT:\n");
            out.push_str(content.trim_end_matches('\n'));
        }
        ActionPayload::Listing(entries) => {
            out.push_str("STATUS: SUCCESS\nLISTING:\n");
            out.push_str(entries.join("\n").trim_end_matches('\n'));
        }
        ActionPayload::Empty => out.push_str("STATUS: SUCCESS"),
        ActionPayload::Process(output) => {
            out.push_str(&format!("EXIT_CODE: {}\n", output.exit_code));
            out.push_str("STDOUT_START\n");
            push_section(&mut out, &output.stdout);
            out.push_str("STDOUT_END\nSTDERR_START\n");
            push_section(&mut out, &output.stderr);
            out.push_str("STDERR_END");
        }
    }
    out
}

fn push_section(out: &mut String, text: &str) {
    let text = text.trim_end_matches('\n');
    if !text.is_empty() {
        out.push_str(text);
        out.push('\n');
    }
}
