//! End-to-end tests of the chat session driving the action loop against a
//! scripted model source.

use agent_host::{ChatSession, SessionError, TurnOutcome};
use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use providers::ModelSource;
use shared::agent_api::{
    ChatMode, ChatRequest, ModelInfo, Role, StreamEvent, TurnState, Usage,
};
use shared::events::SessionEvent;
use shared::settings::AppSettings;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

enum Reply {
    Events(Vec<StreamEvent>),
    /// Fails before any event is sent
    Fail(String),
    /// Sends the events, then never finishes
    Hang(Vec<StreamEvent>),
}

fn text(content: &str) -> Reply {
    Reply::Events(vec![
        StreamEvent::Delta(content.to_string()),
        StreamEvent::Done {
            finish_reason: Some("stop".into()),
        },
    ])
}

#[derive(Default)]
struct ScriptedSource {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ChatRequest>>,
    prepared: Mutex<Vec<String>>,
    cancels: AtomicUsize,
}

impl ScriptedSource {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        })
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ModelSource for ScriptedSource {
    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        Ok(vec![ModelInfo {
            id: "test-model".into(),
            display_name: "Test".into(),
        }])
    }

    async fn prepare(&self, model_id: &str) -> anyhow::Result<()> {
        if model_id == "missing" {
            return Err(anyhow!("no such model"));
        }
        self.prepared.lock().push(model_id.to_string());
        Ok(())
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
        tx: mpsc::UnboundedSender<StreamEvent>,
    ) -> anyhow::Result<()> {
        self.requests.lock().push(request);
        let reply = self.replies.lock().pop_front();
        match reply.unwrap_or_else(|| text("ok")) {
            Reply::Fail(message) => Err(anyhow!(message)),
            Reply::Events(events) => {
                for event in events {
                    let _ = tx.send(event);
                }
                Ok(())
            }
            Reply::Hang(events) => {
                for event in events {
                    let _ = tx.send(event);
                }
                futures::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

fn settings(root: Option<&Path>) -> AppSettings {
    AppSettings {
        selected_model: Some("test-model".into()),
        sandbox_root: root.map(Path::to_path_buf),
        ..AppSettings::default()
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Wait until `count` content deltas have been published.
async fn wait_for_deltas(rx: &mut mpsc::UnboundedReceiver<SessionEvent>, count: usize) {
    let mut seen = 0;
    tokio::time::timeout(Duration::from_secs(5), async {
        while seen < count {
            if let Some(SessionEvent::ContentDelta { .. }) = rx.recv().await {
                seen += 1;
            }
        }
    })
    .await
    .expect("deltas did not arrive");
}

/// Wait until the session reports that an action has started.
async fn wait_for_action(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(SessionEvent::ActionStarted { summary }) = rx.recv().await {
                return summary;
            }
        }
    })
    .await
    .expect("action did not start")
}

#[tokio::test]
async fn test_list_dir_result_is_fed_back() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "a").unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();

    let source = ScriptedSource::new(vec![
        text("ACTION: LIST_DIR(path='.')"),
        text("The folder has a.txt and sub/."),
    ]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = ChatSession::with_events(source.clone(), &settings(Some(dir.path())), tx);

    let outcome = session.submit("list files").await.unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);

    let history = session.history();
    assert_eq!(history.len(), 4);
    assert_eq!(history[2].role, Role::User);
    assert!(history[2].synthetic);
    assert!(history[2].content.contains("LISTING:\na.txt\nsub/"));
    assert_eq!(history[3].content, "The folder has a.txt and sub/.");
    assert_eq!(session.visible_history().len(), 3);

    let requests = source.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].messages[0].role, Role::System);
    let fed_back = requests[1].messages.last().unwrap();
    assert_eq!(fed_back.role, Role::User);
    assert_eq!(fed_back.content, history[2].content);

    let states: Vec<TurnState> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::TurnStateChanged(state) => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            TurnState::AwaitingFirstToken,
            TurnState::Streaming,
            TurnState::ExecutingAction,
            TurnState::AwaitingFirstToken,
            TurnState::Streaming,
            TurnState::ExecutingAction,
            TurnState::Idle,
        ]
    );
    assert_eq!(session.turn_state(), TurnState::Idle);
}

#[tokio::test]
async fn test_edit_file_creates_directories() {
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::new(vec![
        text("ACTION: EDIT_FILE(path='new/deep/file.txt')\nCONTENT_START\nhello\nCONTENT_END"),
        text("Created it."),
    ]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = ChatSession::with_events(source, &settings(Some(dir.path())), tx);

    session.submit("make a file").await.unwrap();

    let written = std::fs::read_to_string(dir.path().join("new/deep/file.txt")).unwrap();
    assert_eq!(written, "hello");
    assert_eq!(
        session.history()[2].content,
        "ACTION_RESULT: EDIT_FILE(path='new/deep/file.txt')\nSTATUS: SUCCESS"
    );
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        SessionEvent::FileEdited { path } if path.ends_with("new/deep/file.txt")
    )));
}

#[cfg(unix)]
#[tokio::test]
async fn test_run_command_output_is_fed_back() {
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::new(vec![
        text("ACTION: RUN_COMMAND(command='echo hi')"),
        text("It printed hi."),
    ]);
    let session = ChatSession::new(source, &settings(Some(dir.path())));

    session.submit("say hi").await.unwrap();

    let result = &session.history()[2].content;
    assert!(result.contains("EXIT_CODE: 0"));
    assert!(result.contains("STDOUT_START\nhi\nSTDOUT_END"));
}

#[tokio::test]
async fn test_read_outside_folder_is_denied() {
    let base = tempfile::tempdir().unwrap();
    let root = base.path().join("proj");
    std::fs::create_dir(&root).unwrap();
    let outside = base.path().join("outside.txt");
    std::fs::write(&outside, "secret").unwrap();

    let source = ScriptedSource::new(vec![
        text("ACTION: READ_FILE(path='../outside.txt')"),
        text("I cannot read that."),
    ]);
    let session = ChatSession::new(source, &settings(Some(&root)));

    session.submit("read the secret").await.unwrap();

    let result = &session.history()[2].content;
    assert!(result.contains("STATUS: ERROR: access denied"));
    assert!(!result.contains("secret"));
    assert_eq!(std::fs::read_to_string(&outside).unwrap(), "secret");
}

#[tokio::test]
async fn test_action_without_folder_reports_error() {
    let source = ScriptedSource::new(vec![text("ACTION: LIST_DIR()"), text("Pick a folder.")]);
    let session = ChatSession::new(source, &settings(None));

    session.submit("what's here").await.unwrap();
    assert!(session.history()[2]
        .content
        .ends_with("STATUS: ERROR: no folder selected"));
}

#[tokio::test]
async fn test_submit_while_busy_is_rejected() {
    let source = ScriptedSource::new(vec![Reply::Hang(vec![StreamEvent::Delta(
        "thinking".into(),
    )])]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = ChatSession::with_events(source, &settings(None), tx);

    let running = {
        let session = session.clone();
        tokio::spawn(async move { session.submit("first").await })
    };
    wait_for_deltas(&mut rx, 1).await;

    let before = session.history().len();
    assert_eq!(session.submit("second").await, Err(SessionError::Busy));
    assert_eq!(session.clear(), Err(SessionError::Busy));
    assert_eq!(session.history().len(), before);

    assert!(session.cancel());
    assert_eq!(running.await.unwrap(), Ok(TurnOutcome::Cancelled));
}

#[tokio::test]
async fn test_cancel_keeps_partial_reply() {
    let source = ScriptedSource::new(vec![Reply::Hang(vec![
        StreamEvent::Delta("Hel".into()),
        StreamEvent::Delta("lo, ".into()),
        StreamEvent::Delta("wor".into()),
    ])]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = ChatSession::with_events(source.clone(), &settings(None), tx);

    let running = {
        let session = session.clone();
        tokio::spawn(async move { session.submit("greet").await })
    };
    wait_for_deltas(&mut rx, 3).await;

    assert!(session.cancel());
    assert_eq!(running.await.unwrap(), Ok(TurnOutcome::Cancelled));

    assert_eq!(session.turn_state(), TurnState::Idle);
    assert_eq!(session.history().last().unwrap().content, "Hello, wor");
    assert_eq!(source.cancels.load(Ordering::SeqCst), 1);

    let after = drain(&mut rx);
    assert!(matches!(
        after.as_slice(),
        [
            SessionEvent::TurnStateChanged(TurnState::Cancelled),
            SessionEvent::TurnStateChanged(TurnState::Idle)
        ]
    ));
    assert!(!session.cancel());

    // The session accepts new input once cancelled.
    assert_eq!(session.submit("again").await, Ok(TurnOutcome::Completed));
}

#[cfg(unix)]
#[tokio::test]
async fn test_cancel_while_command_runs_kills_it() {
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::new(vec![
        text("ACTION: RUN_COMMAND(command='sleep 2; touch marker')"),
        text("Done."),
    ]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = ChatSession::with_events(source.clone(), &settings(Some(dir.path())), tx);

    let running = {
        let session = session.clone();
        tokio::spawn(async move { session.submit("slow task").await })
    };
    let summary = wait_for_action(&mut rx).await;
    assert!(summary.contains("sleep 2"));
    assert_eq!(session.turn_state(), TurnState::ExecutingAction);

    assert!(session.cancel());
    assert_eq!(running.await.unwrap(), Ok(TurnOutcome::Cancelled));
    assert_eq!(session.turn_state(), TurnState::Idle);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!dir.path().join("marker").exists());
    assert!(session.history().iter().all(|m| !m.synthetic));
    assert_eq!(session.history().len(), 2);
    assert_eq!(source.requests().len(), 1);
}

#[tokio::test]
async fn test_select_model_cancels_running_turn() {
    let source = ScriptedSource::new(vec![Reply::Hang(vec![StreamEvent::Delta(
        "partial".into(),
    )])]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = ChatSession::with_events(source.clone(), &settings(None), tx);

    let running = {
        let session = session.clone();
        tokio::spawn(async move { session.submit("first").await })
    };
    wait_for_deltas(&mut rx, 1).await;

    session.select_model("other-model").await.unwrap();

    assert_eq!(running.await.unwrap(), Ok(TurnOutcome::Cancelled));
    assert_eq!(source.cancels.load(Ordering::SeqCst), 1);
    assert_eq!(session.model().as_deref(), Some("other-model"));
    assert_eq!(source.prepared.lock().as_slice(), &["other-model".to_string()]);
    assert_eq!(session.turn_state(), TurnState::Idle);
    assert_eq!(session.history().last().unwrap().content, "partial");
}

#[tokio::test]
async fn test_relative_folder_is_treated_as_unselected() {
    let source = ScriptedSource::new(vec![
        text("ACTION: READ_FILE(path='/etc/hostname')"),
        text("No folder."),
    ]);
    let session = ChatSession::new(source, &settings(Some(Path::new("."))));
    assert_eq!(session.sandbox_root(), None);

    session.set_sandbox_root(Some("".into()));
    assert_eq!(session.sandbox_root(), None);

    session.submit("read it").await.unwrap();
    assert!(session.history()[2]
        .content
        .ends_with("STATUS: ERROR: no folder selected"));
}

#[tokio::test]
async fn test_connection_failure_returns_to_idle() {
    let source = ScriptedSource::new(vec![Reply::Fail("connection refused".into())]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = ChatSession::with_events(source, &settings(None), tx);

    let err = session.submit("hello").await.unwrap_err();
    assert!(matches!(&err, SessionError::Transport(m) if m.contains("connection refused")));
    assert_eq!(session.turn_state(), TurnState::Idle);
    assert_eq!(session.history().len(), 1);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, SessionEvent::Error(m) if m.contains("connection refused"))));
}

#[tokio::test]
async fn test_broken_stream_keeps_partial_text_without_running_action() {
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::new(vec![Reply::Events(vec![
        StreamEvent::Delta("ACTION: LIST_DIR(path='.')".into()),
        StreamEvent::Error("malformed stream chunk".into()),
    ])]);
    let session = ChatSession::new(source.clone(), &settings(Some(dir.path())));

    let err = session.submit("list").await.unwrap_err();
    assert_eq!(err, SessionError::Transport("malformed stream chunk".into()));

    let history = session.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, "ACTION: LIST_DIR(path='.')");
    assert_eq!(source.requests().len(), 1);
}

#[tokio::test]
async fn test_ask_mode_does_not_execute_actions() {
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::new(vec![text("ACTION: LIST_DIR(path='.')")]);
    let config = AppSettings {
        mode: ChatMode::Ask,
        ..settings(Some(dir.path()))
    };
    let session = ChatSession::new(source.clone(), &config);

    assert_eq!(session.submit("list").await, Ok(TurnOutcome::Completed));
    assert_eq!(session.history().len(), 2);

    let requests = source.requests();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].messages[0].content.contains("ACTION:"));
}

#[tokio::test]
async fn test_tool_loop_stops_at_bound() {
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::new(
        (0..5)
            .map(|_| text("ACTION: LIST_DIR(path='.')"))
            .collect(),
    );
    let config = AppSettings {
        max_tool_iterations: Some(2),
        ..settings(Some(dir.path()))
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = ChatSession::with_events(source.clone(), &config, tx);

    let outcome = session.submit("loop forever").await.unwrap();

    assert_eq!(outcome, TurnOutcome::ToolLimitReached);
    assert_eq!(source.requests().len(), 3);
    assert_eq!(session.history().iter().filter(|m| m.synthetic).count(), 2);
    assert_eq!(session.turn_state(), TurnState::Idle);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, SessionEvent::ToolLoopLimit { iterations: 2 })));
}

#[tokio::test]
async fn test_metrics_recorded_on_assistant_message() {
    let source = ScriptedSource::new(vec![Reply::Events(vec![
        StreamEvent::Delta("hi".into()),
        StreamEvent::Usage(Usage {
            prompt_tokens: Some(12),
            completion_tokens: Some(4),
            generation_time: Some(2.0),
            ..Usage::default()
        }),
        StreamEvent::Done {
            finish_reason: None,
        },
    ])]);
    let session = ChatSession::new(source, &settings(None));

    session.submit("hello").await.unwrap();

    let metrics = session.history()[1].metrics.clone().unwrap();
    assert_eq!(metrics.prompt_tokens, Some(12));
    assert_eq!(metrics.tokens_per_second, Some(2.0));
    assert!(metrics.time_to_first_token.is_some());
}

#[tokio::test]
async fn test_submit_requires_model() {
    let source = ScriptedSource::new(vec![]);
    let config = AppSettings {
        selected_model: None,
        ..settings(None)
    };
    let session = ChatSession::new(source, &config);

    assert_eq!(session.submit("hi").await, Err(SessionError::NoModelSelected));
    assert!(session.history().is_empty());
}

#[tokio::test]
async fn test_select_model_prepares_source() {
    let source = ScriptedSource::new(vec![]);
    let session = ChatSession::new(source.clone(), &AppSettings::default());

    session.select_model("qwen").await.unwrap();
    assert_eq!(session.model().as_deref(), Some("qwen"));
    assert_eq!(source.prepared.lock().as_slice(), &["qwen".to_string()]);

    let err = session.select_model("missing").await.unwrap_err();
    assert!(matches!(err, SessionError::ModelUnavailable(_)));
    assert_eq!(session.model().as_deref(), Some("qwen"));

    let models = session.list_models().await.unwrap();
    assert_eq!(models[0].id, "test-model");
}

#[tokio::test]
async fn test_clear_when_idle() {
    let source = ScriptedSource::new(vec![text("hello")]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = ChatSession::with_events(source, &settings(None), tx);

    session.submit("hi").await.unwrap();
    session.clear().unwrap();

    assert!(session.history().is_empty());
    assert!(matches!(drain(&mut rx).last(), Some(SessionEvent::HistoryCleared)));
}
