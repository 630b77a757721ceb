//! Executes parsed actions against the selected folder.
//!
//! Every failure becomes an `ERROR` result the model can read and react to;
//! nothing here aborts the session.

use shared::events::SessionEvent;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::action::{ActionKind, ActionPayload, ActionResult, ParsedAction};
use crate::executor::{ProcessRunner, ShellRunner};

/// Reasons an action is rejected or fails. The display strings are what the
/// model sees after `STATUS: ERROR:`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("no folder selected")]
    NoFolderSelected,

    #[error("access denied: path outside selected folder")]
    OutsideSandbox,

    #[error("missing required parameter '{0}'")]
    MissingParameter(&'static str),

    #[error("missing content block")]
    MissingContent,

    #[error("cannot write to the selected folder itself")]
    TargetIsFolder,

    #[error("{0}")]
    Io(String),
}

/// Runs actions with the sandbox checks applied.
pub struct ActionExecutor {
    runner: Arc<dyn ProcessRunner>,
    /// Receives `FileEdited` after a successful edit
    event_sender: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl Default for ActionExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionExecutor {
    pub fn new() -> Self {
        Self {
            runner: Arc::new(ShellRunner),
            event_sender: None,
        }
    }

    pub fn with_events(event_sender: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            runner: Arc::new(ShellRunner),
            event_sender: Some(event_sender),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub async fn execute(&self, action: &ParsedAction, root: Option<&Path>) -> ActionResult {
        match self.run(action, root).await {
            Ok(payload) => {
                tracing::info!(action = %action.summary(), "action succeeded");
                ActionResult::success(payload)
            }
            Err(e) => {
                tracing::info!(action = %action.summary(), error = %e, "action failed");
                ActionResult::error(e.to_string())
            }
        }
    }

    async fn run(
        &self,
        action: &ParsedAction,
        root: Option<&Path>,
    ) -> Result<ActionPayload, ActionError> {
        if let ActionKind::Unknown(name) = &action.kind {
            return Err(ActionError::UnknownAction(name.clone()));
        }
        let root = root.ok_or(ActionError::NoFolderSelected)?;

        match &action.kind {
            ActionKind::ReadFile => {
                let path = resolve_in_sandbox(root, required(action, "path")?)?;
                blocking(move || {
                    std::fs::read_to_string(&path)
                        .map(ActionPayload::FileContent)
                        .map_err(|e| ActionError::Io(format!("failed to read file: {}", e)))
                })
                .await
            }
            ActionKind::ListDir => {
                let rel = action.parameter("path").filter(|p| !p.is_empty()).unwrap_or(".");
                let path = resolve_in_sandbox(root, rel)?;
                blocking(move || list_entries(&path).map(ActionPayload::Listing)).await
            }
            ActionKind::EditFile => {
                let path = resolve_in_sandbox(root, required(action, "path")?)?;
                if path == normalize(root) {
                    return Err(ActionError::TargetIsFolder);
                }
                let content = action.content.clone().ok_or(ActionError::MissingContent)?;
                let written = path.clone();
                blocking(move || write_atomic(&path, &content)).await?;
                if let Some(sender) = &self.event_sender {
                    let _ = sender.send(SessionEvent::FileEdited { path: written });
                }
                Ok(ActionPayload::Empty)
            }
            ActionKind::RunCommand => {
                let command = required(action, "command")?;
                let output = self.runner.run(command, root).await;
                Ok(ActionPayload::Process(output))
            }
            ActionKind::Unknown(name) => Err(ActionError::UnknownAction(name.clone())),
        }
    }
}

fn required<'a>(action: &'a ParsedAction, key: &'static str) -> Result<&'a str, ActionError> {
    action
        .parameter(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ActionError::MissingParameter(key))
}

async fn blocking<T, F>(f: F) -> Result<T, ActionError>
where
    F: FnOnce() -> Result<T, ActionError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ActionError::Io(format!("worker failed: {}", e)))?
}

/// Fold `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve `rel` against `root` and require the result to start with the
/// root's string form.
///
/// A root that is not absolute contains nothing. Symlinks are not followed,
/// and a sibling whose name extends the root's name (`/proj` vs `/proj2`)
/// passes the prefix test.
pub fn resolve_in_sandbox(root: &Path, rel: &str) -> Result<PathBuf, ActionError> {
    if !root.is_absolute() {
        tracing::warn!(root = %root.display(), "rejected action against a relative folder");
        return Err(ActionError::OutsideSandbox);
    }
    let root = normalize(root);
    let resolved = normalize(&root.join(rel));
    if resolved
        .to_string_lossy()
        .starts_with(root.to_string_lossy().as_ref())
    {
        Ok(resolved)
    } else {
        tracing::warn!(path = rel, "rejected path outside selected folder");
        Err(ActionError::OutsideSandbox)
    }
}

fn list_entries(dir: &Path) -> Result<Vec<String>, ActionError> {
    let read = std::fs::read_dir(dir)
        .map_err(|e| ActionError::Io(format!("failed to list directory: {}", e)))?;

    let mut entries = Vec::new();
    for entry in read {
        let entry = entry.map_err(|e| ActionError::Io(format!("failed to list directory: {}", e)))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        if entry.path().is_dir() {
            entries.push(format!("{}/", name));
        } else {
            entries.push(name);
        }
    }
    entries.sort();
    Ok(entries)
}

/// Write through a temp file in the target directory, then rename over the target.
fn write_atomic(path: &Path, content: &str) -> Result<(), ActionError> {
    let io = |e: std::io::Error| ActionError::Io(format!("failed to write file: {}", e));
    let parent = path
        .parent()
        .ok_or_else(|| ActionError::Io("failed to write file: no parent directory".into()))?;

    std::fs::create_dir_all(parent).map_err(io)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(io)?;
    tmp.write_all(content.as_bytes()).map_err(io)?;
    tmp.as_file().sync_all().map_err(io)?;
    tmp.persist(path).map_err(|e| io(e.error))?;
    Ok(())
}
