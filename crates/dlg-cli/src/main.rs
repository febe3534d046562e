use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dlg_core::{
    Acknowledgement, Host, Invocation, Memory, Orchestrator, Outcome, SlotId, StandardExpander,
};
use dlg_providers::OpenAiTransport;

mod chat;
mod config;
mod host;
mod setup;

use config::Config;
use host::{
    ConfigSwitches, FileVariableStore, NoInputLock, TerminalInputLock, TerminalMessages,
    TerminalSurface,
};

/// Log level for tracing output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Most verbose: every stream frame
    Trace,
    /// Verbose: requests, stream lifecycle
    Debug,
    /// Standard: invocation lifecycle, lock transitions
    Info,
    /// Quiet: only warnings and errors
    Warn,
    /// Minimal: only errors
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(name = "dlg")]
#[command(author, version, about = "Dialogue-stream: streamed chat answers with a context window", long_about = None)]
pub struct Cli {
    /// Model to use (overrides config)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Chat completions endpoint or relay URL (overrides config)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// System message (overrides config)
    #[arg(short, long)]
    pub system: Option<String>,

    /// Extra instruction sent as a second system message
    #[arg(short, long)]
    pub instruction: Option<String>,

    /// Temperature (0.0-2.0)
    #[arg(short, long)]
    pub temperature: Option<f32>,

    /// Nucleus sampling (0.0-1.0)
    #[arg(long)]
    pub top_p: Option<f32>,

    /// Maximum tokens to generate
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Exchanges kept in memory (0 disables retention)
    #[arg(short, long)]
    pub retention: Option<usize>,

    /// Disable streaming output
    #[arg(long)]
    pub no_stream: bool,

    /// Store answers without displaying them
    #[arg(long)]
    pub silent: bool,

    /// Variable slot holding the conversation memory
    #[arg(long, conflicts_with = "no_memory")]
    pub slot: Option<String>,

    /// Start every request from the system message alone
    #[arg(long)]
    pub no_memory: bool,

    /// Keep variables in memory only
    #[arg(long)]
    pub ephemeral: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_enum, default_value = "warn")]
    pub log_level: LogLevel,

    /// Enable debug logging (shorthand for --log-level debug)
    #[arg(short, long)]
    pub debug: bool,

    /// Write debug logs to file (JSON-lines format)
    #[arg(long)]
    pub log_file: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive conversation (default)
    Chat,
    /// Ask one question and print the answer
    Ask {
        /// Question text. Read from the question slot when omitted.
        prompt: Option<String>,

        /// Text placed before the question
        #[arg(long, default_value = "")]
        before: String,

        /// Text placed after the question
        #[arg(long, default_value = "")]
        after: String,

        /// Slot read when no prompt is given
        #[arg(long)]
        question_slot: Option<String>,

        /// Slot receiving the answer
        #[arg(long)]
        answer_slot: Option<String>,
    },
    /// Show current configuration
    Config,
    /// Initialize configuration files in ~/.config/dlg
    Setup,
}

/// Everything a conversation needs, wired to the terminal.
pub struct Session {
    pub orchestrator: Orchestrator,
    pub variables: Arc<FileVariableStore>,
    pub switches: Arc<ConfigSwitches>,
    pub surface: Arc<TerminalSurface>,
    pub memory_slot: Option<SlotId>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Live rendering owns the terminal in chat mode
    let interactive = matches!(cli.command, None | Some(Commands::Chat))
        && atty::is(atty::Stream::Stdout);

    // Resolve log level: --debug overrides --log-level
    let log_level = if cli.debug {
        LogLevel::Debug
    } else {
        cli.log_level
    };

    // Set up logging
    let filter = EnvFilter::new(log_level.as_filter());

    if interactive && cli.log_file.is_none() {
        // Interactive mode without log file: suppress all tracing output
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::sink)
            .init();
    } else if let Some(log_path) = &cli.log_file {
        // Log file specified: write JSON to file
        let file = std::fs::File::create(log_path)
            .with_context(|| format!("Failed to create log file: {:?}", log_path))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::sync::Mutex::new(file)))
            .init();
    } else {
        // Non-interactive mode: write to stderr
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    // Handle setup before config is read
    if matches!(&cli.command, Some(Commands::Setup)) {
        return setup::run();
    }

    let mut config = Config::load()?;
    apply_overrides(&cli, &mut config);
    config.validate()?;

    match &cli.command {
        Some(Commands::Config) => show_config(&config),
        Some(Commands::Ask {
            prompt,
            before,
            after,
            question_slot,
            answer_slot,
        }) => {
            let session = build_session(&cli, &config, false)?;
            let mut invocation = base_invocation(&cli, &config, &session);
            invocation.message = prompt.clone().unwrap_or_default();
            invocation.before = before.clone();
            invocation.after = after.clone();
            invocation.question_source = question_slot.as_deref().map(SlotId::from);
            invocation.answer_slot = answer_slot.as_deref().map(SlotId::from);

            if !ask_mode(&session, invocation).await {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Commands::Setup) => unreachable!(),
        None | Some(Commands::Chat) => {
            let session = build_session(&cli, &config, true)?;
            let invocation = base_invocation(&cli, &config, &session);
            chat::run(&session, invocation).await
        }
    }
}

/// Command-line flags win over the config file.
fn apply_overrides(cli: &Cli, config: &mut Config) {
    if let Some(model) = &cli.model {
        config.model = model.clone();
    }
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(system) = &cli.system {
        config.system_message = system.clone();
    }
    if let Some(temperature) = cli.temperature {
        config.sampling.temperature = temperature;
    }
    if let Some(top_p) = cli.top_p {
        config.sampling.top_p = top_p;
    }
    if let Some(max_tokens) = cli.max_tokens {
        config.sampling.max_tokens = max_tokens;
    }
    if let Some(retention) = cli.retention {
        config.retention = retention;
    }
    if cli.no_stream {
        config.stream = false;
    }
}

fn build_session(cli: &Cli, config: &Config, interactive: bool) -> Result<Session> {
    let variables = Arc::new(if cli.ephemeral {
        FileVariableStore::ephemeral()
    } else {
        FileVariableStore::open(config.variables_path()?)?
    });
    let switches = Arc::new(ConfigSwitches::new(&config.switches));

    let transport = OpenAiTransport::new(config.endpoint.clone())
        .with_api_key(config.resolve_api_key(variables.as_ref()));
    if !transport.has_api_key() {
        tracing::info!(endpoint = %config.endpoint, "No API key configured; relying on the endpoint");
    }

    let expander = StandardExpander::new(variables.clone())
        .with_actors(config.names.actor_table())
        .with_party(config.names.party.clone())
        .with_currency_unit(config.currency_unit.clone());

    let (input, viewport): (Arc<dyn dlg_core::InputLock>, usize) = if interactive {
        (Arc::new(TerminalInputLock::new()), config.viewport_lines)
    } else {
        (Arc::new(NoInputLock), 0)
    };

    let indicator = interactive && atty::is(atty::Stream::Stdout);
    let surface = Arc::new(TerminalSurface::new(viewport, indicator));
    let host = Host {
        variables: variables.clone(),
        switches: switches.clone(),
        input,
        surface: surface.clone(),
        messages: Arc::new(TerminalMessages),
        expander: Arc::new(expander),
    };

    let memory_slot = if cli.no_memory {
        None
    } else {
        Some(
            cli.slot
                .as_deref()
                .map(SlotId::from)
                .unwrap_or_else(|| config.slots.memory.clone()),
        )
    };

    Ok(Session {
        orchestrator: Orchestrator::new(Arc::new(transport), host, config.engine_settings()),
        variables,
        switches,
        surface,
        memory_slot,
    })
}

fn base_invocation(cli: &Cli, config: &Config, session: &Session) -> Invocation {
    let mut invocation = Invocation::new("");
    invocation.system = cli.instruction.clone();
    invocation.example = config.example.clone();
    invocation.sampling = config.sampling();
    invocation.retention = config.retention;
    invocation.silent = cli.silent;
    invocation.memory = match &session.memory_slot {
        None => Memory::Disabled,
        Some(slot) if *slot == config.slots.memory => Memory::Default,
        Some(slot) => Memory::Slot(slot.clone()),
    };
    invocation
}

/// Run a single invocation. Returns whether an answer was produced.
async fn ask_mode(session: &Session, invocation: Invocation) -> bool {
    match chat::invoke_with_indicator(session, invocation).await {
        Outcome::Completed { .. } => {
            // Nobody is there to acknowledge; release straight away.
            while session.orchestrator.acknowledge() == Acknowledgement::CaughtUp {}
            println!();
            true
        }
        Outcome::Skipped => {
            eprintln!("No question given and the question slot is empty.");
            false
        }
        Outcome::Rejected => {
            eprintln!("Another conversation is in progress.");
            false
        }
        Outcome::Failed(_) => false,
    }
}

fn show_config(config: &Config) -> Result<()> {
    println!("Configuration:");
    println!("  Config file: {}", Config::config_path()?.display());
    println!("  Endpoint: {}", config.endpoint);
    if config.api_key.is_some() {
        println!("  API key: (configured)");
    } else {
        println!("  API key: (none, relay mode)");
    }
    println!("  Model: {}", config.model);
    let system = if config.system_message.chars().count() > 60 {
        format!("{}...", config.system_message.chars().take(60).collect::<String>())
    } else {
        config.system_message.clone()
    };
    println!("  System message: {}", system.replace('\n', " "));
    println!(
        "  Sampling: temperature={} top_p={} max_tokens={}",
        config.sampling.temperature, config.sampling.top_p, config.sampling.max_tokens
    );
    println!("  Retention: {}", config.retention);
    println!("  Streaming: {}", config.stream);

    println!("\nSlots:");
    match &config.slots.question {
        Some(slot) => println!("  Question: {}", slot),
        None => println!("  Question: (not stored)"),
    }
    println!("  Answer: {}", config.slots.answer);
    println!("  Memory: {}", config.slots.memory);
    if let Some(switch) = &config.hide_switch {
        println!("  Hide switch: {}", switch);
    }
    println!("  Variables file: {}", config.variables_path()?.display());

    println!("\nDisplay:");
    println!(
        "  {}",
        toml::to_string(&config.display)
            .unwrap_or_default()
            .trim_end()
            .replace('\n', "\n  ")
    );
    if config.viewport_lines > 0 {
        println!("  viewport_lines = {}", config.viewport_lines);
    }
    Ok(())
}
