use acagi_bridge::{BridgeConfig, CodexBridge};
use acagi_console::{ConsoleChannel, ConsoleError, PtyConsole, WindowHandle};
use acagi_conversation::{ConversationConfig, ConversationLog, Embedder};
use acagi_coordinator::{BasicSafetyManager, Coordinator, CoordinatorConfig, UiEvent};
use acagi_core::{bus::EventBus, new_session_token, ConversationRole};
use acagi_ollama::{OllamaClient, OllamaConfig};
use acagi_prompt::PromptConfig;
use acagi_store::{TaskStore, DATASET_DIR};
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const ARCHIVE_MIRROR_DIR: &str = "Archived Conversations";

#[derive(Clone, Debug)]
struct Config {
    codex_cmd: String,
    workspace: PathBuf,
    data_root: PathBuf,
    session_id: String,
    ollama_url: String,
    model: String,
    interpreter: bool,
    share_context: bool,
    local_only: bool,
    metrics_interval: u64,
    debug: bool,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "acagi", about = "Terminal cockpit for a supervised Codex session")]
struct Args {
    /// Command line used to launch the Codex CLI inside the managed console.
    #[arg(long, default_value = "")]
    codex_cmd: String,
    /// Workspace root the session operates on.
    #[arg(long, default_value = "")]
    workspace: String,
    /// Root for datasets, transcripts, and logs; defaults to the workspace.
    #[arg(long, default_value = "")]
    data_dir: String,
    /// Session token. Tasks and conversation logs are keyed by it.
    #[arg(long, default_value = "")]
    session: String,
    /// Base URL of the local Ollama daemon.
    #[arg(long, default_value = "")]
    ollama_url: String,
    /// Chat model used for local replies and token budgeting.
    #[arg(long, default_value = "")]
    model: String,
    /// Disable the auto-continue interpreter.
    #[arg(long, default_value_t = false)]
    no_interpreter: bool,
    /// Do not prepend recent conversation context to injected prompts.
    #[arg(long, default_value_t = false)]
    no_context: bool,
    /// Skip the Codex console and route input to the local model.
    #[arg(long, default_value_t = false)]
    local_only: bool,
    /// Seconds between system.metrics publications; 0 disables the ticker.
    #[arg(long, default_value_t = 30)]
    metrics_interval: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config();
    let _log_guard = init_logging(&config);

    let store = Arc::new(TaskStore::open(&config.data_root).context("open task store")?);
    let bus = EventBus::new();

    let ollama = match OllamaClient::new(OllamaConfig {
        base_url: config.ollama_url.clone(),
        chat_model: config.model.clone(),
        ..OllamaConfig::default()
    }) {
        Ok(client) => {
            let client = Arc::new(client);
            if !client.health() {
                warn!(event = "ollama_unreachable", url = %config.ollama_url);
            }
            Some(client)
        }
        Err(err) => {
            warn!(event = "ollama_client_error", error = %err);
            None
        }
    };

    let embedder = ollama
        .as_ref()
        .map(|client| Arc::clone(client) as Arc<dyn Embedder>);
    let conversation = Arc::new(
        ConversationLog::open(
            config.data_root.join(DATASET_DIR).join("conversation"),
            &config.session_id,
            ConversationConfig {
                archive_mirror: Some(config.workspace.join(ARCHIVE_MIRROR_DIR)),
                ..ConversationConfig::default()
            },
            embedder,
        )
        .context("open conversation log")?,
    );

    let console: Arc<dyn ConsoleChannel> = if config.local_only {
        Arc::new(HeadlessConsole)
    } else {
        let tokens = shlex::split(&config.codex_cmd)
            .filter(|tokens| !tokens.is_empty())
            .ok_or_else(|| anyhow!("codex command is empty: {:?}", config.codex_cmd))?;
        let (program, args) = tokens
            .split_first()
            .ok_or_else(|| anyhow!("codex command is empty"))?;
        let pty = PtyConsole::spawn(program, args, Some(&config.workspace))
            .map_err(|err| anyhow!("spawn codex console: {err}"))?;
        Arc::new(pty)
    };

    let (bridge, mut bridge_rx) = CodexBridge::new(Arc::clone(&console), BridgeConfig::default());
    if let Some(pid) = console.child_pid() {
        bridge.attach(pid);
    }

    let (coordinator, mut ui_rx) = Coordinator::new(
        Arc::clone(&store),
        bus.clone(),
        conversation,
        bridge,
        Arc::new(BasicSafetyManager::default()),
        ollama,
        CoordinatorConfig {
            session_token: config.session_id.clone(),
            workspace: config.workspace.clone(),
            interpreter_enabled: config.interpreter,
            prompt: PromptConfig {
                share_context: config.share_context,
                model: config.model.clone(),
                ..PromptConfig::default()
            },
        },
    );

    let forward = coordinator.clone();
    tokio::spawn(async move {
        while let Some(event) = bridge_rx.recv().await {
            forward.on_bridge_event(event);
        }
    });

    tokio::spawn(async move {
        while let Some(event) = ui_rx.recv().await {
            render_event(&event);
        }
    });

    if config.metrics_interval > 0 {
        let metrics = coordinator.clone();
        let period = Duration::from_secs(config.metrics_interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(err) = metrics.publish_metrics() {
                    warn!(event = "metrics_publish_error", error = %err);
                }
            }
        });
    }

    if config.local_only {
        println!("[system] local mode: input goes to {}", config.model);
    } else {
        coordinator.bridge().start();
    }

    info!(
        event = "session_start",
        session_id = %config.session_id,
        workspace = %config.workspace.display(),
        local_only = config.local_only,
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => coordinator.submit(&line),
                Ok(None) => break,
                Err(err) => {
                    warn!(event = "stdin_error", error = %err);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    coordinator.bridge().stop();
    info!(event = "session_end", session_id = %config.session_id);
    Ok(())
}

fn render_event(event: &UiEvent) {
    match event {
        UiEvent::Message { role, text } => match role {
            // The terminal already echoes what the user typed.
            ConversationRole::User => {}
            ConversationRole::Assistant => println!("{text}"),
            ConversationRole::System => println!("[system] {text}"),
        },
        UiEvent::ApprovalShown { id, prompt } => {
            println!("[approval #{id}] {}", prompt.header);
            if !prompt.body.is_empty() {
                println!("{}", prompt.body);
            }
            println!(
                "[approval #{id}] reply with {} / {} / {} / {}",
                prompt.options.yes, prompt.options.always, prompt.options.no, prompt.options.feedback
            );
        }
        UiEvent::ApprovalState { id, state, detail } => match detail {
            Some(detail) => println!("[approval #{id}] {} ({detail})", state.as_str()),
            None => println!("[approval #{id}] {}", state.as_str()),
        },
        UiEvent::Led(led) => println!("[bridge] led {}", led.as_str()),
        UiEvent::Status(text) => println!("[bridge] {text}"),
    }
}

/// Stands in for the Codex console when the session runs local-only. Writes
/// always fail, so the coordinator keeps routing input to the local model.
struct HeadlessConsole;

impl ConsoleChannel for HeadlessConsole {
    fn attach(&self, _pid: u32) {}

    fn read_snapshot(&self) -> Result<String, ConsoleError> {
        Ok(String::new())
    }

    fn write_text(&self, _text: &str) -> Result<(), ConsoleError> {
        Err(ConsoleError::Write("no console attached".to_string()))
    }

    fn write_enter(&self) -> Result<(), ConsoleError> {
        Err(ConsoleError::Write("no console attached".to_string()))
    }

    fn foreground_enter_fallback(
        &self,
        _console: Option<WindowHandle>,
        _restore: Option<WindowHandle>,
    ) -> Result<(), ConsoleError> {
        Err(ConsoleError::Write("no console attached".to_string()))
    }

    fn show(&self) {}

    fn hide(&self) {}

    fn window_handle(&self) -> Option<WindowHandle> {
        None
    }

    fn child_pid(&self) -> Option<u32> {
        None
    }

    fn is_alive(&self) -> bool {
        false
    }
}

fn load_config() -> Config {
    let args = Args::parse();
    let mut session_id = args.session.clone();
    if session_id.is_empty() {
        session_id = resolve_session_id();
    }
    let workspace = resolve_workspace(&args.workspace);
    let data_root = resolve_data_root(&args.data_dir, &workspace);
    let debug = args.debug || env_true("ACAGI_DEBUG");
    Config {
        codex_cmd: resolve_flag(&args.codex_cmd, "ACAGI_CODEX_CMD", "codex"),
        workspace,
        data_root,
        session_id,
        ollama_url: resolve_flag(&args.ollama_url, "ACAGI_OLLAMA_URL", "http://127.0.0.1:11434"),
        model: resolve_flag(&args.model, "ACAGI_MODEL", "llama3.1"),
        interpreter: !(args.no_interpreter || env_true("ACAGI_NO_INTERPRETER")),
        share_context: !args.no_context,
        local_only: args.local_only || env_true("ACAGI_LOCAL_ONLY"),
        metrics_interval: args.metrics_interval,
        debug,
        log_dir: resolve_flag(&args.log_dir, "ACAGI_LOG_DIR", ".acagi/logs"),
    }
}

fn resolve_flag(flag: &str, env_key: &str, fallback: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    fallback.to_string()
}

fn resolve_session_id() -> String {
    if let Ok(value) = std::env::var("ACAGI_SESSION_ID") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    new_session_token()
}

fn resolve_workspace(flag: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag);
    }
    if let Ok(value) = std::env::var("ACAGI_WORKSPACE") {
        if !value.trim().is_empty() {
            return PathBuf::from(value);
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn resolve_data_root(flag: &str, workspace: &Path) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag);
    }
    if let Ok(value) = std::env::var("ACAGI_DATA_DIR") {
        if !value.trim().is_empty() {
            return PathBuf::from(value);
        }
    }
    workspace.to_path_buf()
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("ACAGI_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(config) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Duplicates log output to stderr and the session log file. Stdout is left
/// to the chat transcript.
struct MultiWriter {
    stderr: io::Stderr,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stderr: io::stderr(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stderr.write_all(buf);
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap();
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stderr.flush();
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap();
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(config: &Config) -> io::Result<LogGuard> {
    if config.log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let raw = PathBuf::from(&config.log_dir);
    let dir = if raw.is_absolute() {
        raw
    } else {
        config.data_root.join(raw)
    };
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let path = dir.join(format!("acagi-{}.log", config.session_id));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .write(true)
        .open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
