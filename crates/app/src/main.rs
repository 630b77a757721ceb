//! `folder-chat`: terminal front end for the folder agent.

mod utils;

use agent_host::{ChatSession, SessionError, TurnOutcome};
use anyhow::Result;
use providers::{ModelSource, OpenAIClient};
use shared::agent_api::{ChatMode, Role};
use shared::events::SessionEvent;
use shared::settings::AppSettings;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const HELP: &str = "\
commands:
  /agent            let the model act on the selected folder
  /ask              plain chat, no actions
  /folder <path>    select the folder actions are confined to
  /models           list models on the server
  /model <id>       select a model
  /clear            forget the conversation
  /history          show the conversation
  /quit             exit
Ctrl-C cancels a running reply.";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Submit(String),
    Mode(ChatMode),
    Folder(String),
    Models,
    Model(String),
    Clear,
    History,
    Help,
    Quit,
    Unknown(String),
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Submit(line.to_string()));
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    Some(match (name, arg) {
        ("agent", _) => Command::Mode(ChatMode::Agent),
        ("ask", _) => Command::Mode(ChatMode::Ask),
        ("folder", path) if !path.is_empty() => Command::Folder(path.to_string()),
        ("models", _) => Command::Models,
        ("model", id) if !id.is_empty() => Command::Model(id.to_string()),
        ("clear", _) => Command::Clear,
        ("history", _) => Command::History,
        ("help", _) => Command::Help,
        ("quit" | "exit", _) => Command::Quit,
        _ => Command::Unknown(line.to_string()),
    })
}

fn render_event(event: &SessionEvent) {
    match event {
        SessionEvent::ContentDelta { delta, .. } => {
            print!("{}", delta);
            let _ = std::io::stdout().flush();
        }
        SessionEvent::ActionStarted { summary } => println!("\n[action] {}", summary),
        SessionEvent::FileEdited { path } => println!("[edited] {}", path.display()),
        SessionEvent::MetricsUpdated { metrics, .. } => {
            println!();
            if let Some(rate) = metrics.tokens_per_second {
                println!("[{:.1} tok/s]", rate);
            }
        }
        SessionEvent::ToolLoopLimit { iterations } => {
            println!("[stopped after {} actions]", iterations)
        }
        SessionEvent::Error(message) => eprintln!("\nerror: {}", message),
        SessionEvent::HistoryCleared => println!("[history cleared]"),
        SessionEvent::TurnStateChanged(_) | SessionEvent::MessageAppended(_) => {}
    }
}

async fn render_events(mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = rx.recv().await {
        render_event(&event);
    }
}

fn print_history(session: &ChatSession) {
    for message in session.visible_history() {
        let who = match message.role {
            Role::User => "you",
            Role::Assistant => "model",
            Role::System => "system",
        };
        println!("{}: {}\n", who, message.content);
    }
}

async fn handle(command: Command, session: &ChatSession, settings: &mut AppSettings) -> bool {
    match command {
        Command::Submit(text) => match session.submit(&text).await {
            Ok(TurnOutcome::Cancelled) => println!("\n[cancelled]"),
            Ok(_) => {}
            Err(SessionError::Transport(_)) => {}
            Err(e) => eprintln!("error: {}", e),
        },
        Command::Mode(mode) => {
            session.set_mode(mode);
            settings.mode = mode;
            utils::save_settings(settings);
            println!("[mode: {:?}]", mode);
        }
        Command::Folder(input) => match utils::resolve_folder(&input) {
            Ok(root) => {
                println!("[folder: {}]", root.display());
                session.set_sandbox_root(Some(root.clone()));
                settings.sandbox_root = Some(root);
                utils::save_settings(settings);
            }
            Err(e) => eprintln!("error: {:#}", e),
        },
        Command::Models => match session.list_models().await {
            Ok(models) => {
                let current = session.model();
                for model in models {
                    let marker = if current.as_deref() == Some(model.id.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    println!("{} {} ({})", marker, model.id, model.display_name);
                }
            }
            Err(e) => eprintln!("error: {}", e),
        },
        Command::Model(id) => match session.select_model(&id).await {
            Ok(()) => {
                settings.selected_model = Some(id.clone());
                utils::save_settings(settings);
                println!("[model: {}]", id);
            }
            Err(e) => eprintln!("error: {}", e),
        },
        Command::Clear => {
            if let Err(e) = session.clear() {
                eprintln!("error: {}", e);
            }
        }
        Command::History => print_history(session),
        Command::Help => println!("{}", HELP),
        Command::Unknown(line) => eprintln!("unknown command: {} (try /help)", line),
        Command::Quit => return false,
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut settings = utils::load_settings_or_default();
    let client = OpenAIClient::new(&settings.server_url, settings.api_key.clone())?;
    tracing::info!(server = %client.base_url(), "using inference server");
    let source: Arc<dyn ModelSource> = Arc::new(client);

    let (tx, rx) = mpsc::unbounded_channel();
    let session = ChatSession::with_events(source, &settings, tx);
    tokio::spawn(render_events(rx));

    {
        let session = session.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !session.cancel() {
                    std::process::exit(0);
                }
            }
        });
    }

    match (session.model(), session.sandbox_root()) {
        (None, _) => println!("No model selected. Use /models and /model <id>."),
        (Some(model), Some(root)) => println!("[model: {}] [folder: {}]", model, root.display()),
        (Some(model), None) => println!("[model: {}] no folder selected, use /folder <path>", model),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = parse_command(&line) else {
            continue;
        };
        if !handle(command, &session, &mut settings).await {
            break;
        }
    }
    Ok(())
}
