//! Interactive chat mode with readline support.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use rustyline::error::ReadlineError;
use rustyline::history::FileHistory;
use rustyline::{Config, Editor};
use tracing::debug;

use dlg_core::{
    Acknowledgement, Invocation, Orchestrator, Outcome, SlotId, SwitchStore, VariableStore,
};

use crate::Session;

/// How long one frame waits for a key.
const FRAME: Duration = Duration::from_millis(50);

/// Interval between waiting-indicator frames.
const INDICATOR_TICK: Duration = Duration::from_millis(300);

/// Chat commands
#[derive(Debug, PartialEq)]
enum ChatCommand {
    Quit,
    Reset,
    Help,
    Variables,
    Set(String, String),
    Switch(String, bool),
    Invalid(String),
    None(String), // Regular message
}

fn parse_command(input: &str) -> ChatCommand {
    let trimmed = input.trim();

    if !trimmed.starts_with('/') {
        return ChatCommand::None(trimmed.to_string());
    }

    let mut parts = trimmed.splitn(3, ' ');
    let cmd = parts.next().unwrap_or_default().to_lowercase();
    let first = parts.next().map(str::trim).unwrap_or_default().to_string();
    let rest = parts.next().map(str::trim).unwrap_or_default().to_string();

    match cmd.as_str() {
        "/quit" | "/exit" | "/q" => ChatCommand::Quit,
        "/reset" | "/clear" | "/c" => ChatCommand::Reset,
        "/help" | "/?" => ChatCommand::Help,
        "/vars" | "/v" => ChatCommand::Variables,
        "/set" if !first.is_empty() => ChatCommand::Set(first, rest),
        "/switch" | "/sw" if !first.is_empty() => match rest.to_lowercase().as_str() {
            "on" | "true" | "1" => ChatCommand::Switch(first, true),
            "off" | "false" | "0" => ChatCommand::Switch(first, false),
            _ => ChatCommand::Invalid(format!("Usage: /switch <id> on|off (got '{}')", rest)),
        },
        _ => ChatCommand::Invalid(format!(
            "Unknown command: {}. Type /help for available commands.",
            cmd
        )),
    }
}

fn print_help() {
    println!(
        r#"
Chat Commands:
  /help, /?             Show this help message
  /quit, /exit          Exit chat mode
  /reset, /c            Forget the conversation memory
  /vars, /v             List stored variables
  /set <id> <text>      Store text in a variable
  /switch <id> on|off   Flip a switch (e.g. the hide switch)

While an answer is shown:
  Enter, Space or z     Scroll to the end, then continue
  Ctrl+C                Skip to the end and continue

Tips:
  - An empty line asks with the question slot's contents
  - Press Ctrl+D to exit
"#
    );
}

/// Run interactive chat mode
pub async fn run(session: &Session, base: Invocation) -> Result<()> {
    // Set up readline with history
    let config = Config::builder()
        .history_ignore_space(true)
        .history_ignore_dups(true)?
        .build();

    let history_path = get_history_path();
    let mut rl: Editor<(), FileHistory> = Editor::with_config(config)?;

    // Load history if available
    if let Some(path) = &history_path {
        let _ = rl.load_history(path);
    }

    println!("Chat mode started. Type /help for commands, /quit to exit.\n");

    loop {
        match rl.readline("you> ") {
            Ok(line) => {
                if !line.trim().is_empty() {
                    let _ = rl.add_history_entry(&line);
                }

                match parse_command(&line) {
                    ChatCommand::Quit => {
                        println!("Goodbye!");
                        break;
                    }
                    ChatCommand::Reset => reset_memory(session),
                    ChatCommand::Help => print_help(),
                    ChatCommand::Variables => list_variables(session),
                    ChatCommand::Set(id, text) => {
                        session
                            .variables
                            .set(&SlotId::from(id.as_str()), serde_json::Value::String(text));
                    }
                    ChatCommand::Switch(id, on) => {
                        let id = SlotId::from(id.as_str());
                        session.switches.set(&id, on);
                        let state = if session.switches.get(&id) { "on" } else { "off" };
                        println!("Switch {} is {}", id, state);
                    }
                    ChatCommand::Invalid(message) => eprintln!("{}", message),
                    ChatCommand::None(message) => {
                        let mut invocation = base.clone();
                        invocation.message = message;
                        ask(session, invocation).await?;
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                break;
            }
        }
    }

    // Save history
    if let Some(path) = &history_path {
        let _ = rl.save_history(path);
    }

    Ok(())
}

/// Run one invocation, animating the waiting indicator until the first
/// fragment shows up.
pub async fn invoke_with_indicator(session: &Session, invocation: Invocation) -> Outcome {
    let invoke = session.orchestrator.invoke(invocation);
    tokio::pin!(invoke);
    let mut ticker = tokio::time::interval(INDICATOR_TICK);

    let outcome = loop {
        tokio::select! {
            outcome = &mut invoke => break outcome,
            _ = ticker.tick() => session.surface.tick(),
        }
    };
    session.surface.stop_waiting();
    outcome
}

async fn ask(session: &Session, invocation: Invocation) -> Result<()> {
    match invoke_with_indicator(session, invocation).await {
        Outcome::Completed { answer } => {
            debug!(chars = answer.chars().count(), "Answer received");
            await_acknowledgement(&session.orchestrator)
        }
        Outcome::Skipped => {
            println!("(nothing to ask: type a message or /set the question slot)");
            Ok(())
        }
        Outcome::Rejected => {
            eprintln!("Another conversation is still in progress.");
            Ok(())
        }
        // Already reported on the message surface
        Outcome::Failed(_) => Ok(()),
    }
}

/// Frame loop: hold the prompt until the player has seen the whole answer.
fn await_acknowledgement(orchestrator: &Orchestrator) -> Result<()> {
    if !atty::is(atty::Stream::Stdin) {
        // No keyboard to acknowledge with.
        while orchestrator.acknowledge() == Acknowledgement::CaughtUp {}
        return Ok(());
    }

    let discarded = discard_typeahead()?;
    if discarded > 0 {
        debug!(discarded, "Dropped keys typed while the answer streamed");
    }

    while orchestrator.is_busy() {
        if !event::poll(FRAME)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        match gesture(&key) {
            Some(Gesture::Acknowledge) => {
                let ack = orchestrator.acknowledge();
                debug!(?ack, "Acknowledgement");
            }
            Some(Gesture::SkipToEnd) => {
                while orchestrator.acknowledge() == Acknowledgement::CaughtUp {}
            }
            None => {}
        }
    }
    Ok(())
}

/// What a key press does while an answer waits for acknowledgement.
#[derive(Debug, PartialEq, Eq)]
enum Gesture {
    Acknowledge,
    SkipToEnd,
}

fn gesture(key: &KeyEvent) -> Option<Gesture> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(Gesture::SkipToEnd)
        }
        KeyCode::Enter | KeyCode::Char(' ') | KeyCode::Char('z') => Some(Gesture::Acknowledge),
        _ => None,
    }
}

/// Drop keys queued before the answer finished; they were typed at a
/// locked prompt and must not count as acknowledgements.
fn discard_typeahead() -> Result<usize> {
    let mut discarded = 0;
    while event::poll(Duration::ZERO)? {
        event::read()?;
        discarded += 1;
    }
    Ok(discarded)
}

fn reset_memory(session: &Session) {
    match &session.memory_slot {
        Some(slot) => {
            session.variables.remove(slot);
            println!("Conversation memory cleared.");
        }
        None => println!("Memory is disabled for this session."),
    }
}

fn list_variables(session: &Session) {
    let entries = session.variables.snapshot();
    if entries.is_empty() {
        println!("No variables stored.");
        return;
    }
    for (id, value) in entries {
        let text = match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        let preview = if text.chars().count() > 60 {
            format!("{}...", text.chars().take(60).collect::<String>())
        } else {
            text
        };
        println!("  {}: {}", id, preview.replace('\n', " "));
    }
}

fn get_history_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("dlg").join("chat_history"))
}
