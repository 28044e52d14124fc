//! Session orchestrator tying the bridge, transcript, tasks, and bus together.
//!
//! The coordinator owns the submit path (prompt assembly, injection, echo
//! bookkeeping), the output path (transcript recording, auto-continue,
//! approval widgets), the `/task` command surface, and checked subprocess
//! runs with diff attribution. It pushes everything the UI needs onto a
//! typed [`UiEvent`] channel and never renders anything itself.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use acagi_approval::{ApprovalEvent, ApprovalParser};
use acagi_bridge::{BridgeEvent, CodexBridge, LedState};
use acagi_conversation::{ConversationError, ConversationLog};
use acagi_core::bus::{
    BusError, EventBus, Payload, Subscription, TOPIC_SYSTEM_METRICS, TOPIC_TASK_CONVERSATION,
    TOPIC_TASK_CREATED, TOPIC_TASK_DELETED, TOPIC_TASK_STATUS, TOPIC_TASK_UPDATED,
};
use acagi_core::{
    ApprovalAction, ApprovalOptions, ApprovalPrompt, ConversationEntry, ConversationRole,
    EntryReference, ErrorRecord, Task, TaskEvent, TaskEventKind, TaskStatus,
};
use acagi_diff::{DiffError, DiffRecorder};
use acagi_interpreter::Interpreter;
use acagi_ollama::{ChatMessage, OllamaClient};
use acagi_prompt::{HeuristicEstimator, PromptBuilder, PromptConfig};
use acagi_store::{StoreError, TaskStore};

mod runner;
pub mod safety;

pub use safety::{BasicSafetyManager, SafetyManager, SafetyViolation};

/// Actor recorded on task events originating from this surface.
const ACTOR: &str = "terminal";
/// Conversation turns handed to the local model as context.
const LOCAL_CONTEXT_TURNS: usize = 8;

const TASK_USAGE: &str =
    "Usage: /task \"<title>\" | /task <id> status <state> | /task <id> note <text>";

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Diff(#[from] DiffError),
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("json error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Lifecycle of an approval widget in the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetState {
    Pending,
    Responding,
    Submitted,
    Dismissed,
}

impl WidgetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WidgetState::Pending => "pending",
            WidgetState::Responding => "responding",
            WidgetState::Submitted => "submitted",
            WidgetState::Dismissed => "dismissed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalWidget {
    pub id: u64,
    pub prompt: ApprovalPrompt,
    pub state: WidgetState,
}

impl ApprovalWidget {
    fn is_active(&self) -> bool {
        matches!(self.state, WidgetState::Pending | WidgetState::Responding)
    }
}

/// Everything the UI layer renders, delivered in order on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// Transcript bubble.
    Message { role: ConversationRole, text: String },
    /// A new approval widget to render.
    ApprovalShown { id: u64, prompt: ApprovalPrompt },
    /// Widget state transition, with an optional detail line such as
    /// `Sent: Always` or a dismissal reason.
    ApprovalState { id: u64, state: WidgetState, detail: Option<String> },
    /// Bridge LED transition.
    Led(LedState),
    /// Short status line for the footer.
    Status(String),
}

/// Result of one checked subprocess run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub status: TaskStatus,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub session_token: String,
    pub workspace: PathBuf,
    pub interpreter_enabled: bool,
    pub prompt: PromptConfig,
}

struct CoordState {
    references: Vec<EntryReference>,
    widgets: Vec<ApprovalWidget>,
    next_widget_id: u64,
    llm_busy: bool,
}

struct Inner {
    store: Arc<TaskStore>,
    bus: EventBus,
    diffs: DiffRecorder,
    conversation: Arc<ConversationLog>,
    bridge: CodexBridge,
    prompt: PromptBuilder,
    parser: ApprovalParser,
    interpreter: Mutex<Interpreter>,
    safety: Arc<dyn SafetyManager>,
    ollama: Option<Arc<OllamaClient>>,
    ui: mpsc::UnboundedSender<UiEvent>,
    session_token: String,
    workspace: PathBuf,
    cancel_flag: AtomicBool,
    state: Mutex<CoordState>,
    conversation_sub: Mutex<Option<Subscription>>,
}

/// Cloneable handle; all clones share one session.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        store: Arc<TaskStore>,
        bus: EventBus,
        conversation: Arc<ConversationLog>,
        bridge: CodexBridge,
        safety: Arc<dyn SafetyManager>,
        ollama: Option<Arc<OllamaClient>>,
        config: CoordinatorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (ui, rx) = mpsc::unbounded_channel();
        let prompt = PromptBuilder::new(&config.workspace, config.prompt)
            .with_estimator(Arc::new(HeuristicEstimator));
        let inner = Arc::new(Inner {
            diffs: DiffRecorder::new(Arc::clone(&store), bus.clone()),
            store,
            bus,
            conversation,
            bridge,
            prompt,
            parser: ApprovalParser::new(),
            interpreter: Mutex::new(Interpreter::new(config.interpreter_enabled)),
            safety,
            ollama,
            ui,
            session_token: config.session_token,
            workspace: config.workspace,
            cancel_flag: AtomicBool::new(false),
            state: Mutex::new(CoordState {
                references: Vec::new(),
                widgets: Vec::new(),
                next_widget_id: 0,
                llm_busy: false,
            }),
            conversation_sub: Mutex::new(None),
        });
        let coordinator = Coordinator { inner };
        coordinator.subscribe_conversation_topic();
        (coordinator, rx)
    }

    pub fn session_token(&self) -> &str {
        &self.inner.session_token
    }

    pub fn bridge(&self) -> &CodexBridge {
        &self.inner.bridge
    }

    pub fn add_reference(&self, reference: EntryReference) {
        self.inner.state.lock().unwrap().references.push(reference);
    }

    pub fn references(&self) -> Vec<EntryReference> {
        self.inner.state.lock().unwrap().references.clone()
    }

    pub fn widgets(&self) -> Vec<ApprovalWidget> {
        self.inner.state.lock().unwrap().widgets.clone()
    }

    pub fn llm_busy(&self) -> bool {
        self.inner.state.lock().unwrap().llm_busy
    }

    /// Flags the current `run_checked` invocation (if any) for cancellation.
    pub fn request_cancel(&self) {
        self.inner.cancel_flag.store(true, Ordering::SeqCst);
    }

    /// Entry point for one line of user input: slash commands are handled
    /// locally, everything else goes to Codex (or the local model when no
    /// bridge is running).
    pub fn submit(&self, input: &str) {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return;
        }
        if self.handle_slash(trimmed) {
            return;
        }
        if !self.inner.bridge.is_running() {
            if self.inner.ollama.is_some() {
                self.local_reply(trimmed);
            } else {
                self.system_message("Codex bridge is not running");
            }
            return;
        }

        let references = { self.inner.state.lock().unwrap().references.clone() };
        let built = self.inner.prompt.build(
            trimmed,
            &references,
            true,
            Some(self.inner.conversation.as_ref()),
        );
        if built.payload.trim().is_empty() {
            self.system_message("Nothing to send");
            return;
        }

        if self.inner.bridge.send_text(&built.payload) {
            let consumed = {
                let mut state = self.inner.state.lock().unwrap();
                std::mem::take(&mut state.references)
            };
            let refs = if consumed.is_empty() { None } else { Some(consumed.as_slice()) };
            if let Err(err) = self.inner.conversation.append(ConversationRole::User, trimmed, &[], refs)
            {
                self.report_io("conversation", &err.to_string(), None);
            }
            self.inner.interpreter.lock().unwrap().observe_user(trimmed);
            self.ui(UiEvent::Message { role: ConversationRole::User, text: trimmed.to_string() });
            for notice in &built.notices {
                self.system_message(notice.clone());
            }
            self.inner.bridge.press_enter(None);
        } else {
            self.system_message("Send failed");
        }
    }

    /// Fans one bridge event into the UI, routing output deltas through the
    /// transcript, interpreter, and approval parser.
    pub fn on_bridge_event(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::Status(text) => self.ui(UiEvent::Status(text)),
            BridgeEvent::Led(led) => self.ui(UiEvent::Led(led)),
            BridgeEvent::Output(delta) => self.handle_output_delta(&delta),
        }
    }

    pub fn handle_output_delta(&self, delta: &str) {
        let trimmed_lower = delta.trim().to_lowercase();
        let is_bare_token = {
            let state = self.inner.state.lock().unwrap();
            let mut tokens: Vec<String> = state
                .widgets
                .iter()
                .flat_map(|w| w.prompt.options.tokens().into_iter().map(str::to_lowercase))
                .collect();
            let defaults = ApprovalOptions::default();
            tokens.extend(defaults.tokens().into_iter().map(str::to_lowercase));
            tokens.iter().any(|t| *t == trimmed_lower)
        };
        if is_bare_token {
            debug!(event = "approval_echo_ignored");
            return;
        }

        if let Err(err) = self.inner.conversation.append(ConversationRole::Assistant, delta, &[], None)
        {
            self.report_io("conversation", &err.to_string(), None);
        }

        let bridge_ready = self.inner.bridge.is_running()
            && !self.inner.bridge.is_busy()
            && !self.llm_busy();
        let follow_up =
            self.inner.interpreter.lock().unwrap().observe_output(delta, bridge_ready);
        if let Some(command) = follow_up {
            if self.inner.bridge.send_text(&command) {
                self.inner.interpreter.lock().unwrap().mark_sent(&command);
                self.system_message(format!("Auto-continue: {command}"));
                self.inner.bridge.press_enter(None);
            } else {
                self.inner.interpreter.lock().unwrap().mark_send_failed();
            }
        }

        for event in self.inner.parser.parse(delta) {
            match event {
                ApprovalEvent::Text(text) => {
                    self.ui(UiEvent::Message { role: ConversationRole::Assistant, text });
                }
                ApprovalEvent::Prompt(prompt) => {
                    let id = {
                        let mut state = self.inner.state.lock().unwrap();
                        state.next_widget_id += 1;
                        let id = state.next_widget_id;
                        state.widgets.push(ApprovalWidget {
                            id,
                            prompt: prompt.clone(),
                            state: WidgetState::Pending,
                        });
                        id
                    };
                    self.ui(UiEvent::ApprovalShown { id, prompt });
                }
                ApprovalEvent::Dismissal(reason) => {
                    let dismissed: Vec<u64> = {
                        let mut state = self.inner.state.lock().unwrap();
                        state
                            .widgets
                            .iter_mut()
                            .filter(|w| w.is_active())
                            .map(|w| {
                                w.state = WidgetState::Dismissed;
                                w.id
                            })
                            .collect()
                    };
                    for id in dismissed {
                        self.ui(UiEvent::ApprovalState {
                            id,
                            state: WidgetState::Dismissed,
                            detail: Some(reason.clone()),
                        });
                    }
                    self.system_message(reason);
                }
            }
        }
    }

    /// Button click on an approval widget. Sends the mapped token through
    /// the bridge; the widget only reaches `submitted` when the console
    /// accepted the write.
    pub fn respond_to_approval(&self, widget_id: u64, action: ApprovalAction) {
        let token = {
            let mut state = self.inner.state.lock().unwrap();
            let Some(widget) = state.widgets.iter_mut().find(|w| w.id == widget_id) else {
                drop(state);
                self.system_message(format!("No approval widget {widget_id}"));
                return;
            };
            if widget.state != WidgetState::Pending {
                return;
            }
            widget.state = WidgetState::Responding;
            widget.prompt.options.token(action).to_string()
        };
        self.ui(UiEvent::ApprovalState {
            id: widget_id,
            state: WidgetState::Responding,
            detail: None,
        });

        if self.inner.bridge.send_text(&token) {
            self.set_widget_state(widget_id, WidgetState::Submitted);
            self.ui(UiEvent::ApprovalState {
                id: widget_id,
                state: WidgetState::Submitted,
                detail: Some(format!("Sent: {}", action.display_name())),
            });
            self.inner.bridge.press_enter(None);
        } else {
            self.set_widget_state(widget_id, WidgetState::Pending);
            self.ui(UiEvent::ApprovalState {
                id: widget_id,
                state: WidgetState::Pending,
                detail: Some("Send failed".to_string()),
            });
        }
    }

    /// Runs `command` on behalf of a task: header and captured streams go to
    /// the task's run log, diffs are recorded, and the task status advances
    /// per the exit code and diff outcome.
    pub fn run_checked(
        &self,
        command: &[String],
        cwd: Option<&Path>,
        timeout: Option<Duration>,
        task_id: &str,
    ) -> Result<RunOutcome, CoordinatorError> {
        let mut task = self
            .inner
            .store
            .find_task(task_id)?
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        let workdir = cwd.map(Path::to_path_buf).unwrap_or_else(|| self.inner.workspace.clone());

        let header = format!(
            "{} $ {} (cwd={})",
            Utc::now().to_rfc3339(),
            command.join(" "),
            workdir.display()
        );
        let rel = self.inner.store.append_run_log(&task, &[header], Some("action"))?;
        if task.run_log_path.is_none() {
            let mut changes = Map::new();
            changes.insert("run_log_path".to_string(), json!(rel));
            task = self.inner.store.update_task(task_id, changes)?;
        }

        self.inner.cancel_flag.store(false, Ordering::SeqCst);
        let captured = match self.inner.safety.ensure_command_allowed(command) {
            Err(violation) => {
                self.system_message(violation.to_string());
                runner::CapturedRun {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: violation.to_string(),
                    cancelled: false,
                }
            }
            Ok(()) => runner::run_command(command, &workdir, timeout, &self.inner.cancel_flag),
        };

        let out_lines: Vec<String> = captured.stdout.lines().map(str::to_string).collect();
        if !out_lines.is_empty() {
            self.inner.store.append_run_log(&task, &out_lines, None)?;
        }
        let err_lines: Vec<String> = captured.stderr.lines().map(str::to_string).collect();
        if !err_lines.is_empty() {
            self.inner.store.append_run_log(&task, &err_lines, Some("stderr"))?;
        }
        self.inner.store.append_run_log(
            &task,
            &[format!("{} exit {}", Utc::now().to_rfc3339(), captured.exit_code)],
            None,
        )?;

        let diff = self.inner.diffs.record_diff(task_id, &task.files, &workdir, None)?;
        let (diff_added, diff_removed) =
            diff.as_ref().map(|o| (o.added, o.removed)).unwrap_or((0, 0));
        let cancelled = captured.cancelled;

        let next_status = if cancelled {
            Some(TaskStatus::Cancelled)
        } else if captured.exit_code == 0 && (diff_added > 0 || diff_removed > 0) {
            Some(TaskStatus::Merged)
        } else if captured.exit_code != 0 {
            Some(TaskStatus::Failed)
        } else {
            None
        };

        let mut final_task = diff.map(|o| o.task).unwrap_or(task);
        if let Some(status) = next_status {
            if status != final_task.status {
                let mut changes = Map::new();
                changes.insert("status".to_string(), json!(status.as_str()));
                changes.insert("updated_ts".to_string(), serde_json::to_value(Utc::now())?);
                final_task = self.inner.store.update_task(task_id, changes)?;
                self.inner.store.append_event(
                    &TaskEvent::new(task_id, TaskEventKind::Status, ACTOR)
                        .with_to(status.as_str())
                        .with_data(json!({
                            "exit_code": captured.exit_code,
                            "diff_added": diff_added,
                            "diff_removed": diff_removed,
                            "cancelled": cancelled,
                        })),
                )?;
                self.publish_task_change(&final_task)?;
            }
        }

        Ok(RunOutcome {
            exit_code: captured.exit_code,
            stdout: captured.stdout,
            stderr: captured.stderr,
            status: final_task.status,
            cancelled,
        })
    }

    /// Publishes a `system.metrics` summary of the session's components.
    pub fn publish_metrics(&self) -> Result<(), CoordinatorError> {
        let tasks = self.inner.store.load_tasks()?;
        let (interpreter_enabled, auto_command) = {
            let interpreter = self.inner.interpreter.lock().unwrap();
            (
                interpreter.is_enabled(),
                interpreter.last_auto_command().map(str::to_string),
            )
        };
        let payload = json!({
            "generated_at": Utc::now(),
            "components": [
                {
                    "name": "bridge",
                    "status": self.inner.bridge.led().as_str(),
                    "running": self.inner.bridge.is_running(),
                    "busy": self.inner.bridge.is_busy(),
                },
                {
                    "name": "conversation",
                    "status": "ok",
                    "entries": self.inner.conversation.entry_count(),
                },
                {
                    "name": "interpreter",
                    "status": if interpreter_enabled { "ok" } else { "off" },
                    "auto_command": auto_command,
                },
                {
                    "name": "tasks",
                    "status": "ok",
                    "count": tasks.len(),
                    "open": tasks.iter().filter(|t| !t.status.is_terminal()).count(),
                },
            ],
        });
        self.inner.bus.publish(TOPIC_SYSTEM_METRICS, payload)?;
        Ok(())
    }

    // ---- slash commands ----

    /// Intercepts `/task` and `/tasks`. Any other input, slash-prefixed or
    /// not, belongs to the prompt path.
    fn handle_slash(&self, input: &str) -> bool {
        let first = input.split_whitespace().next().unwrap_or("");
        if first != "/task" && first != "/tasks" {
            return false;
        }
        let Some(tokens) = shlex::split(input) else {
            self.system_message(TASK_USAGE);
            return true;
        };
        if tokens.first().map(String::as_str) == Some("/tasks") {
            self.list_tasks();
            return true;
        }
        match tokens.len() {
            2 => match self.create_task(&tokens[1]) {
                Ok(task) => {
                    self.system_message(format!("Task created: {} ({})", task.id, task.title));
                }
                Err(err) => self.report_io("task", &err.to_string(), None),
            },
            4 if tokens[2] == "status" => {
                let status = match tokens[3].parse::<TaskStatus>() {
                    Ok(status) => status,
                    Err(err) => {
                        self.system_message(err);
                        return true;
                    }
                };
                match self.set_task_status(&tokens[1], status) {
                    Ok(task) => {
                        self.system_message(format!("Task {} -> {}", task.id, task.status));
                    }
                    Err(CoordinatorError::Store(StoreError::NotFound(id))) => {
                        self.system_message(format!("Task not found: {id}"));
                    }
                    Err(err) => self.report_io("task", &err.to_string(), Some(&tokens[1])),
                }
            }
            n if n >= 4 && tokens[2] == "note" => {
                let note = tokens[3..].join(" ");
                match self.add_task_note(&tokens[1], &note) {
                    Ok(task) => self.system_message(format!("Note added to {}", task.id)),
                    Err(CoordinatorError::Store(StoreError::NotFound(id))) => {
                        self.system_message(format!("Task not found: {id}"));
                    }
                    Err(err) => self.report_io("task", &err.to_string(), Some(&tokens[1])),
                }
            }
            _ => self.system_message(TASK_USAGE),
        }
        true
    }

    fn create_task(&self, title: &str) -> Result<Task, CoordinatorError> {
        let mut task = Task::new(title, &self.inner.session_token, ACTOR);
        task.codex_conversation_id = Some(self.inner.conversation.session_token().to_string());
        self.inner.store.append_task(&task)?;
        self.inner
            .store
            .append_event(&TaskEvent::new(&task.id, TaskEventKind::Created, ACTOR))?;
        let payload = serde_json::to_value(&task)?;
        self.inner.bus.publish(TOPIC_TASK_CREATED, payload.clone())?;
        self.inner.bus.publish(TOPIC_TASK_UPDATED, payload)?;
        Ok(task)
    }

    fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<Task, CoordinatorError> {
        let mut changes = Map::new();
        changes.insert("status".to_string(), json!(status.as_str()));
        changes.insert("updated_ts".to_string(), serde_json::to_value(Utc::now())?);
        let task = self.inner.store.update_task(id, changes)?;
        self.inner.store.append_event(
            &TaskEvent::new(id, TaskEventKind::Status, ACTOR).with_to(status.as_str()),
        )?;
        self.publish_task_change(&task)?;
        Ok(task)
    }

    fn add_task_note(&self, id: &str, note: &str) -> Result<Task, CoordinatorError> {
        let task = self
            .inner
            .store
            .find_task(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let rel = self.inner.store.append_run_log(&task, &[note.to_string()], Some("note"))?;
        let mut changes = Map::new();
        changes.insert("updated_ts".to_string(), serde_json::to_value(Utc::now())?);
        changes.insert("run_log_path".to_string(), json!(rel));
        let task = self.inner.store.update_task(id, changes)?;
        self.inner.store.append_event(
            &TaskEvent::new(id, TaskEventKind::Note, ACTOR).with_data(json!({ "text": note })),
        )?;
        let mut payload = match serde_json::to_value(&task)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        payload.insert("last_note".to_string(), json!(note));
        self.inner.bus.publish(TOPIC_TASK_UPDATED, Value::Object(payload))?;
        Ok(task)
    }

    fn list_tasks(&self) {
        match self.inner.store.load_tasks() {
            Ok(tasks) => {
                let lines: Vec<String> = tasks
                    .iter()
                    .filter(|t| t.session_id == self.inner.session_token)
                    .map(|t| {
                        format!(
                            "[{}] {}: {} (+{} \u{2212}{}) @ {}",
                            t.status,
                            t.id,
                            t.title,
                            t.diffs.added,
                            t.diffs.removed,
                            t.updated_ts.format("%H:%M:%S")
                        )
                    })
                    .collect();
                if lines.is_empty() {
                    self.system_message("No tasks for this session");
                } else {
                    self.system_message(lines.join("\n"));
                }
            }
            Err(err) => self.report_io("task", &err.to_string(), None),
        }
    }

    // ---- local model fallback ----

    /// Answers with the local model while no Codex bridge is attached. The
    /// blocking HTTP call runs on its own thread; `llm_busy` holds off the
    /// interpreter until the reply lands.
    fn local_reply(&self, text: &str) {
        let Some(client) = self.inner.ollama.clone() else {
            return;
        };
        self.inner.state.lock().unwrap().llm_busy = true;
        self.ui(UiEvent::Message { role: ConversationRole::User, text: text.to_string() });
        if let Err(err) = self.inner.conversation.append(ConversationRole::User, text, &[], None) {
            self.report_io("conversation", &err.to_string(), None);
        }
        self.inner.interpreter.lock().unwrap().observe_user(text);

        let coordinator = self.clone();
        std::thread::spawn(move || {
            let mut messages =
                vec![ChatMessage::system("You are a concise assistant for this workspace.")];
            match coordinator.inner.conversation.recent(LOCAL_CONTEXT_TURNS) {
                Ok(recent) => {
                    for entry in recent {
                        messages.push(match entry.role {
                            ConversationRole::User => ChatMessage::user(entry.text),
                            ConversationRole::Assistant => ChatMessage::assistant(entry.text),
                            ConversationRole::System => ChatMessage::system(entry.text),
                        });
                    }
                }
                Err(err) => warn!(event = "local_context_unavailable", error = %err),
            }
            match client.chat(&messages) {
                Ok(reply) => {
                    if let Err(err) = coordinator.inner.conversation.append(
                        ConversationRole::Assistant,
                        &reply,
                        &[],
                        None,
                    ) {
                        coordinator.report_io("conversation", &err.to_string(), None);
                    }
                    coordinator.ui(UiEvent::Message {
                        role: ConversationRole::Assistant,
                        text: reply,
                    });
                }
                Err(err) => coordinator.system_message(format!("Local model error: {err}")),
            }
            coordinator.inner.state.lock().unwrap().llm_busy = false;
        });
    }

    // ---- cross-surface conversation loading ----

    fn subscribe_conversation_topic(&self) {
        let weak = Arc::downgrade(&self.inner);
        match self.inner.bus.subscribe(TOPIC_TASK_CONVERSATION, move |_topic, payload| {
            if let Some(inner) = weak.upgrade() {
                Coordinator { inner }.on_conversation_event(payload);
            }
        }) {
            Ok(sub) => *self.inner.conversation_sub.lock().unwrap() = Some(sub),
            Err(err) => warn!(event = "conversation_subscribe_failed", error = %err),
        }
    }

    fn on_conversation_event(&self, payload: &Payload) {
        let conversation_id =
            payload.get("conversation_id").and_then(Value::as_str).unwrap_or("");
        if conversation_id.is_empty() {
            return;
        }
        match self.inner.conversation.resolve_conversation(conversation_id) {
            Ok(Some(resolved)) => {
                for entry in read_entries_file(&resolved.jsonl) {
                    self.ui(UiEvent::Message { role: entry.role, text: entry.text });
                }
                self.system_message(format!(
                    "[Tasks] Conversation loaded ({}): {}",
                    resolved.source.as_str(),
                    resolved.dir.display()
                ));
            }
            Ok(None) => {
                self.system_message(format!("Conversation not found: {conversation_id}"));
            }
            Err(err) => self.report_io("conversation", &err.to_string(), None),
        }
    }

    // ---- plumbing ----

    fn publish_task_change(&self, task: &Task) -> Result<(), CoordinatorError> {
        self.inner.bus.publish(
            TOPIC_TASK_STATUS,
            json!({ "id": task.id, "status": task.status.as_str() }),
        )?;
        self.inner.bus.publish(TOPIC_TASK_UPDATED, serde_json::to_value(task)?)?;
        if task.status == TaskStatus::Deleted {
            self.inner.bus.publish(TOPIC_TASK_DELETED, json!({ "id": task.id }))?;
        }
        Ok(())
    }

    fn set_widget_state(&self, id: u64, new_state: WidgetState) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(widget) = state.widgets.iter_mut().find(|w| w.id == id) {
            widget.state = new_state;
        }
    }

    fn ui(&self, event: UiEvent) {
        let _ = self.inner.ui.send(event);
    }

    fn system_message(&self, text: impl Into<String>) {
        self.ui(UiEvent::Message { role: ConversationRole::System, text: text.into() });
    }

    /// Dataset-level failures are recorded in the error log and surfaced as
    /// a system bubble; the operation is not retried.
    fn report_io(&self, kind: &str, message: &str, task_id: Option<&str>) {
        let dataset = if kind == "conversation" {
            self.inner.conversation.root()
        } else {
            self.inner.store.dataset_dir()
        };
        let mut record =
            ErrorRecord::new("error", kind, message).with_path(dataset.display().to_string());
        if let Some(id) = task_id {
            record = record.with_task(id);
        }
        if let Err(err) = self.inner.store.append_error_record(&record) {
            warn!(event = "error_record_failed", error = %err);
        }
        self.system_message(format!("{kind} error: {message}"));
    }
}

fn read_entries_file(path: &Path) -> Vec<ConversationEntry> {
    let Ok(contents) = fs::read_to_string(path) else {
        return Vec::new();
    };
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicBool;

    use acagi_bridge::BridgeConfig;
    use acagi_console::{ConsoleChannel, ConsoleError, WindowHandle};
    use acagi_conversation::ConversationConfig;
    use tempfile::TempDir;

    struct FakeConsole {
        screen: Mutex<String>,
        written: Mutex<Vec<String>>,
        fail_writes: AtomicBool,
    }

    impl FakeConsole {
        fn new() -> Arc<Self> {
            Arc::new(FakeConsole {
                screen: Mutex::new(String::new()),
                written: Mutex::new(Vec::new()),
                fail_writes: AtomicBool::new(false),
            })
        }

        fn written(&self) -> Vec<String> {
            self.written.lock().unwrap().clone()
        }
    }

    impl ConsoleChannel for FakeConsole {
        fn attach(&self, _pid: u32) {}

        fn read_snapshot(&self) -> Result<String, ConsoleError> {
            Ok(self.screen.lock().unwrap().clone())
        }

        fn write_text(&self, text: &str) -> Result<(), ConsoleError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(ConsoleError::Write("pipe closed".to_string()));
            }
            self.written.lock().unwrap().push(text.to_string());
            Ok(())
        }

        fn write_enter(&self) -> Result<(), ConsoleError> {
            Ok(())
        }

        fn foreground_enter_fallback(
            &self,
            _console: Option<WindowHandle>,
            _restore: Option<WindowHandle>,
        ) -> Result<(), ConsoleError> {
            Ok(())
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
            true
        }
    }

    struct Fixture {
        _dir: TempDir,
        coordinator: Coordinator,
        rx: mpsc::UnboundedReceiver<UiEvent>,
        console: Arc<FakeConsole>,
        store: Arc<TaskStore>,
        bus: EventBus,
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn fixture_with(tweak: impl FnOnce(&mut CoordinatorConfig)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()).unwrap());
        let bus = EventBus::new();
        let conversation = Arc::new(
            ConversationLog::open(
                dir.path().join("conversation"),
                "session-t",
                ConversationConfig::default(),
                None,
            )
            .unwrap(),
        );
        let console = FakeConsole::new();
        let (bridge, _bridge_rx) = CodexBridge::new(
            console.clone(),
            BridgeConfig {
                busy_poll: Duration::from_millis(5),
                idle_poll: Duration::from_millis(10),
                settle_window: Duration::from_millis(40),
                settle_poll: Duration::from_millis(5),
            },
        );
        let mut config = CoordinatorConfig {
            session_token: "session-t".to_string(),
            workspace: dir.path().to_path_buf(),
            interpreter_enabled: true,
            prompt: PromptConfig::default(),
        };
        tweak(&mut config);
        let (coordinator, rx) = Coordinator::new(
            Arc::clone(&store),
            bus.clone(),
            conversation,
            bridge,
            Arc::new(BasicSafetyManager::default()),
            None,
            config,
        );
        Fixture { _dir: dir, coordinator, rx, console, store, bus }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<UiEvent>) -> Vec<UiEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn system_texts(events: &[UiEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                UiEvent::Message { role: ConversationRole::System, text } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn first_task(store: &TaskStore) -> Task {
        store.load_tasks().unwrap().into_iter().next().unwrap()
    }

    async fn settle_briefly() {
        tokio::time::sleep(Duration::from_millis(90)).await;
    }

    #[test]
    fn create_task_via_slash_command() {
        let mut fx = fixture();
        fx.coordinator.submit("/task \"fix the parser\"");
        let task = first_task(&fx.store);
        assert_eq!(task.title, "fix the parser");
        assert_eq!(task.status, TaskStatus::Open);
        assert_eq!(task.session_id, "session-t");
        assert_eq!(task.source, "terminal");
        assert_eq!(task.codex_conversation_id.as_deref(), Some("session-t"));
        let texts = system_texts(&drain(&mut fx.rx));
        assert!(texts.iter().any(|t| t.starts_with("Task created:")));
        let events = fx.store.load_events(&task.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, TaskEventKind::Created);
    }

    #[test]
    fn create_task_publishes_created_and_updated() {
        let fx = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = fx
            .bus
            .subscribe("task.*", move |topic, _payload| {
                seen_clone.lock().unwrap().push(topic.to_string());
            })
            .unwrap();
        fx.coordinator.submit("/task \"demo\"");
        let topics = seen.lock().unwrap().clone();
        assert_eq!(topics, vec!["task.created".to_string(), "task.updated".to_string()]);
    }

    #[test]
    fn status_change_publishes_and_records() {
        let mut fx = fixture();
        fx.coordinator.submit("/task \"demo\"");
        let task = first_task(&fx.store);
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let statuses_clone = Arc::clone(&statuses);
        let _sub = fx
            .bus
            .subscribe("task.status", move |_topic, payload| {
                statuses_clone
                    .lock()
                    .unwrap()
                    .push(payload.get("status").and_then(Value::as_str).unwrap_or("").to_string());
            })
            .unwrap();
        fx.coordinator.submit(&format!("/task {} status merged", task.id));
        assert_eq!(statuses.lock().unwrap().clone(), vec!["merged".to_string()]);
        assert_eq!(first_task(&fx.store).status, TaskStatus::Merged);
        drain(&mut fx.rx);
    }

    #[test]
    fn deleted_status_also_publishes_task_deleted() {
        let fx = fixture();
        fx.coordinator.submit("/task \"demo\"");
        let task = first_task(&fx.store);
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let deleted_clone = Arc::clone(&deleted);
        let _sub = fx
            .bus
            .subscribe("task.deleted", move |_topic, payload| {
                deleted_clone
                    .lock()
                    .unwrap()
                    .push(payload.get("id").and_then(Value::as_str).unwrap_or("").to_string());
            })
            .unwrap();
        fx.coordinator.submit(&format!("/task {} status deleted", task.id));
        assert_eq!(deleted.lock().unwrap().clone(), vec![task.id.clone()]);
    }

    #[test]
    fn unknown_status_yields_warning_not_change() {
        let mut fx = fixture();
        fx.coordinator.submit("/task \"demo\"");
        let task = first_task(&fx.store);
        drain(&mut fx.rx);
        fx.coordinator.submit(&format!("/task {} status nonsense", task.id));
        let texts = system_texts(&drain(&mut fx.rx));
        assert!(texts.iter().any(|t| t.contains("Unknown status")));
        assert_eq!(first_task(&fx.store).status, TaskStatus::Open);
    }

    #[test]
    fn note_appends_run_log_and_last_note() {
        let mut fx = fixture();
        fx.coordinator.submit("/task \"demo\"");
        let task = first_task(&fx.store);
        let notes = Arc::new(Mutex::new(Vec::new()));
        let notes_clone = Arc::clone(&notes);
        let _sub = fx
            .bus
            .subscribe("task.updated", move |_topic, payload| {
                if let Some(note) = payload.get("last_note").and_then(Value::as_str) {
                    notes_clone.lock().unwrap().push(note.to_string());
                }
            })
            .unwrap();
        fx.coordinator.submit(&format!("/task {} note remember the edge case", task.id));
        assert_eq!(notes.lock().unwrap().clone(), vec!["remember the edge case".to_string()]);
        let task = first_task(&fx.store);
        assert!(task.run_log_path.is_some());
        let tail = fx.store.load_run_log_tail(&task, 5).unwrap();
        assert!(tail.iter().any(|l| l == "[note] remember the edge case"));
        drain(&mut fx.rx);
    }

    #[test]
    fn tasks_listing_formats_entries() {
        let mut fx = fixture();
        fx.coordinator.submit("/task \"demo task\"");
        drain(&mut fx.rx);
        fx.coordinator.submit("/tasks");
        let texts = system_texts(&drain(&mut fx.rx));
        let listing = texts.last().unwrap();
        assert!(listing.contains("[open]"));
        assert!(listing.contains("demo task"));
        assert!(listing.contains("(+0 \u{2212}0) @"));
    }

    #[test]
    fn malformed_task_command_shows_usage() {
        let mut fx = fixture();
        fx.coordinator.submit("/task");
        let texts = system_texts(&drain(&mut fx.rx));
        assert!(texts.iter().any(|t| t.starts_with("Usage: /task")));
    }

    #[test]
    fn missing_task_id_warns() {
        let mut fx = fixture();
        fx.coordinator.submit("/task tsk_missing status merged");
        let texts = system_texts(&drain(&mut fx.rx));
        assert!(texts.iter().any(|t| t.contains("Task not found")));
    }

    #[test]
    fn other_slash_input_goes_to_the_prompt_path() {
        let mut fx = fixture();
        fx.coordinator.submit("/help me");
        let texts = system_texts(&drain(&mut fx.rx));
        assert!(texts.iter().any(|t| t.contains("bridge is not running")));
    }

    #[test]
    fn submit_without_bridge_is_a_notice() {
        let mut fx = fixture();
        fx.coordinator.submit("hello there");
        let texts = system_texts(&drain(&mut fx.rx));
        assert_eq!(texts, vec!["Codex bridge is not running".to_string()]);
    }

    #[tokio::test]
    async fn submit_sends_payload_and_records_user_turn() {
        let mut fx = fixture();
        fx.coordinator.bridge().start();
        settle_briefly().await;
        fx.coordinator.submit("run the tests");
        settle_briefly().await;
        assert_eq!(fx.console.written(), vec!["run the tests".to_string()]);
        let events = drain(&mut fx.rx);
        assert!(events.contains(&UiEvent::Message {
            role: ConversationRole::User,
            text: "run the tests".to_string(),
        }));
        fx.coordinator.bridge().stop();
    }

    #[tokio::test]
    async fn references_feed_the_prompt_and_are_consumed() {
        let fx = fixture();
        fs::write(fx._dir.path().join("notes.txt"), "remember the flag\n").unwrap();
        fx.coordinator.add_reference(EntryReference::file("notes.txt"));
        assert_eq!(fx.coordinator.references().len(), 1);

        fx.coordinator.bridge().start();
        settle_briefly().await;
        fx.coordinator.submit("apply the notes");
        settle_briefly().await;

        let written = fx.console.written();
        assert_eq!(written.len(), 1);
        assert!(written[0].starts_with("apply the notes"));
        assert!(written[0].contains("File notes.txt:"));
        assert!(written[0].contains("remember the flag"));
        assert!(fx.coordinator.references().is_empty());
        fx.coordinator.bridge().stop();
    }

    #[tokio::test]
    async fn approval_widget_lifecycle() {
        let mut fx = fixture();
        fx.coordinator.bridge().start();
        settle_briefly().await;
        drain(&mut fx.rx);

        fx.coordinator
            .handle_output_delta("Allow command?\n\n> pytest -q\n[y] Yes\n[n] No\n[a] Always allow\n");
        let events = drain(&mut fx.rx);
        let (id, prompt) = events
            .iter()
            .find_map(|e| match e {
                UiEvent::ApprovalShown { id, prompt } => Some((*id, prompt.clone())),
                _ => None,
            })
            .expect("approval widget event");
        assert_eq!(prompt.options.yes, "y");
        assert_eq!(prompt.options.always, "a");
        assert_eq!(prompt.options.feedback, "feedback");

        fx.coordinator.respond_to_approval(id, ApprovalAction::Always);
        settle_briefly().await;
        assert_eq!(fx.console.written(), vec!["a".to_string()]);
        let events = drain(&mut fx.rx);
        assert!(events.contains(&UiEvent::ApprovalState {
            id,
            state: WidgetState::Submitted,
            detail: Some("Sent: Always".to_string()),
        }));
        let widgets = fx.coordinator.widgets();
        assert_eq!(widgets.len(), 1);
        assert_eq!(widgets[0].state, WidgetState::Submitted);
        fx.coordinator.bridge().stop();
    }

    #[tokio::test]
    async fn failed_approval_send_returns_to_pending() {
        let mut fx = fixture();
        fx.coordinator.bridge().start();
        settle_briefly().await;
        fx.coordinator.handle_output_delta("Allow command?\n[y] Yes\n");
        let id = fx.coordinator.widgets()[0].id;
        fx.console.fail_writes.store(true, Ordering::SeqCst);
        fx.coordinator.respond_to_approval(id, ApprovalAction::Yes);
        let events = drain(&mut fx.rx);
        assert!(events.contains(&UiEvent::ApprovalState {
            id,
            state: WidgetState::Pending,
            detail: Some("Send failed".to_string()),
        }));
        assert_eq!(fx.coordinator.widgets()[0].state, WidgetState::Pending);
        fx.coordinator.bridge().stop();
    }

    #[tokio::test]
    async fn dismissal_marks_active_widgets() {
        let mut fx = fixture();
        fx.coordinator.bridge().start();
        settle_briefly().await;
        fx.coordinator.handle_output_delta("Allow command?\n[y] Yes\n");
        drain(&mut fx.rx);
        fx.coordinator.handle_output_delta("Approval prompt dismissed by user\n");
        let events = drain(&mut fx.rx);
        let id = fx.coordinator.widgets()[0].id;
        assert!(events.contains(&UiEvent::ApprovalState {
            id,
            state: WidgetState::Dismissed,
            detail: Some("Approval prompt dismissed by user".to_string()),
        }));
        assert_eq!(fx.coordinator.widgets()[0].state, WidgetState::Dismissed);
        fx.coordinator.bridge().stop();
    }

    #[tokio::test]
    async fn bare_approval_token_is_not_an_assistant_turn() {
        let mut fx = fixture();
        fx.coordinator.bridge().start();
        settle_briefly().await;
        fx.coordinator.handle_output_delta("Allow command?\n1. Yes\n");
        drain(&mut fx.rx);

        fx.coordinator.handle_output_delta("1");
        let events = drain(&mut fx.rx);
        assert!(events.is_empty());

        fx.coordinator.handle_output_delta("2");
        let events = drain(&mut fx.rx);
        assert!(events.contains(&UiEvent::Message {
            role: ConversationRole::Assistant,
            text: "2".to_string(),
        }));
        fx.coordinator.bridge().stop();
    }

    #[tokio::test]
    async fn continuation_prompt_triggers_auto_continue() {
        let mut fx = fixture();
        fx.coordinator.bridge().start();
        settle_briefly().await;
        fx.coordinator.submit("refactor the interpreter");
        settle_briefly().await;
        settle_briefly().await;
        assert!(!fx.coordinator.bridge().is_busy());

        fx.coordinator.handle_output_delta("Working... Would you like me to continue?");
        settle_briefly().await;
        let written = fx.console.written();
        assert_eq!(written.len(), 2);
        assert_eq!(written[1], "continue, focusing on refactor the interpreter");
        let texts = system_texts(&drain(&mut fx.rx));
        assert!(texts.iter().any(|t| t.starts_with("Auto-continue:")));

        // Held until the next user turn or completion.
        settle_briefly().await;
        settle_briefly().await;
        fx.coordinator.handle_output_delta("Should I keep going?");
        assert_eq!(fx.console.written().len(), 2);
        fx.coordinator.bridge().stop();
    }

    #[test]
    fn run_checked_merges_on_exit_zero_with_diff() {
        let mut fx = fixture();
        fx.coordinator.submit("/task \"touch file\"");
        let task = first_task(&fx.store);
        let mut changes = Map::new();
        changes.insert("files".to_string(), json!(["f.txt"]));
        fx.store.update_task(&task.id, changes).unwrap();

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let statuses_clone = Arc::clone(&statuses);
        let _sub = fx
            .bus
            .subscribe("task.status", move |_topic, payload| {
                statuses_clone
                    .lock()
                    .unwrap()
                    .push(payload.get("status").and_then(Value::as_str).unwrap_or("").to_string());
            })
            .unwrap();

        let cmd = vec!["sh".to_string(), "-c".to_string(), "echo x >> f.txt".to_string()];
        let outcome = fx.coordinator.run_checked(&cmd, None, None, &task.id).unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.status, TaskStatus::Merged);
        assert_eq!(statuses.lock().unwrap().clone(), vec!["merged".to_string()]);

        let task = first_task(&fx.store);
        assert_eq!(task.status, TaskStatus::Merged);
        assert!(task.diffs.added >= 1);
        let events = fx.store.load_events(&task.id).unwrap();
        let status_event = events
            .iter()
            .find(|e| e.event == TaskEventKind::Status)
            .expect("status event");
        assert_eq!(status_event.data.as_ref().unwrap()["exit_code"], json!(0));
        drain(&mut fx.rx);
    }

    #[test]
    fn run_checked_diffs_against_the_run_cwd() {
        let fx = fixture();
        let workdir = fx._dir.path().join("checkout");
        fs::create_dir_all(&workdir).unwrap();
        fx.coordinator.submit("/task \"work elsewhere\"");
        let task = first_task(&fx.store);
        let mut changes = Map::new();
        changes.insert("files".to_string(), json!(["f.txt"]));
        fx.store.update_task(&task.id, changes).unwrap();

        let cmd = vec!["sh".to_string(), "-c".to_string(), "echo x >> f.txt".to_string()];
        let outcome = fx
            .coordinator
            .run_checked(&cmd, Some(&workdir), None, &task.id)
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.status, TaskStatus::Merged);
        assert!(workdir.join("f.txt").exists());

        let task = first_task(&fx.store);
        assert_eq!(task.status, TaskStatus::Merged);
        assert!(task.diffs.added >= 1);
    }

    #[test]
    fn run_checked_blocks_unsafe_command() {
        let mut fx = fixture();
        fx.coordinator.submit("/task \"danger\"");
        let task = first_task(&fx.store);
        let cmd = vec!["rm".to_string(), "-rf".to_string(), "/".to_string()];
        let outcome = fx.coordinator.run_checked(&cmd, None, None, &task.id).unwrap();
        assert_eq!(outcome.exit_code, 1);
        assert!(outcome.stderr.contains("Blocked command"));
        assert_eq!(outcome.status, TaskStatus::Failed);
        let texts = system_texts(&drain(&mut fx.rx));
        assert!(texts.iter().any(|t| t.contains("Blocked command")));
        let task = first_task(&fx.store);
        let tail = fx.store.load_run_log_tail(&task, 10).unwrap();
        assert!(tail.iter().any(|l| l.contains("Blocked command")));
        assert!(tail.iter().any(|l| l.contains("exit 1")));
    }

    #[test]
    fn run_checked_failure_marks_task_failed() {
        let fx = fixture();
        fx.coordinator.submit("/task \"broken\"");
        let task = first_task(&fx.store);
        let cmd = vec!["sh".to_string(), "-c".to_string(), "exit 7".to_string()];
        let outcome = fx.coordinator.run_checked(&cmd, None, None, &task.id).unwrap();
        assert_eq!(outcome.exit_code, 7);
        assert_eq!(outcome.status, TaskStatus::Failed);
    }

    #[test]
    fn run_checked_quiet_success_keeps_status() {
        let fx = fixture();
        fx.coordinator.submit("/task \"noop\"");
        let task = first_task(&fx.store);
        let cmd = vec!["sh".to_string(), "-c".to_string(), "true".to_string()];
        let outcome = fx.coordinator.run_checked(&cmd, None, None, &task.id).unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.status, TaskStatus::Open);
    }

    #[test]
    fn run_checked_timeout_reports_exit_one() {
        let fx = fixture();
        fx.coordinator.submit("/task \"slow\"");
        let task = first_task(&fx.store);
        let cmd = vec!["sh".to_string(), "-c".to_string(), "sleep 5".to_string()];
        let outcome = fx
            .coordinator
            .run_checked(&cmd, None, Some(Duration::from_millis(120)), &task.id)
            .unwrap();
        assert_eq!(outcome.exit_code, 1);
        assert!(outcome.stderr.contains("timed out"));
        assert_eq!(outcome.status, TaskStatus::Failed);
    }

    #[test]
    fn run_checked_cancel_marks_task_cancelled() {
        let fx = fixture();
        fx.coordinator.submit("/task \"long run\"");
        let task = first_task(&fx.store);
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let statuses_clone = Arc::clone(&statuses);
        let _sub = fx
            .bus
            .subscribe("task.status", move |_topic, payload| {
                statuses_clone
                    .lock()
                    .unwrap()
                    .push(payload.get("status").and_then(Value::as_str).unwrap_or("").to_string());
            })
            .unwrap();
        let canceller = fx.coordinator.clone();
        let signal = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(250));
            canceller.request_cancel();
        });
        let cmd = vec!["sh".to_string(), "-c".to_string(), "sleep 5".to_string()];
        let outcome = fx.coordinator.run_checked(&cmd, None, None, &task.id).unwrap();
        signal.join().unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.exit_code, 1);
        assert_eq!(outcome.status, TaskStatus::Cancelled);
        assert_eq!(statuses.lock().unwrap().clone(), vec!["cancelled".to_string()]);
        assert_eq!(first_task(&fx.store).status, TaskStatus::Cancelled);
    }

    #[test]
    fn run_checked_missing_task_is_an_error() {
        let fx = fixture();
        let cmd = vec!["sh".to_string(), "-c".to_string(), "true".to_string()];
        let err = fx.coordinator.run_checked(&cmd, None, None, "tsk_missing").unwrap_err();
        assert!(matches!(err, CoordinatorError::Store(StoreError::NotFound(_))));
    }

    #[test]
    fn conversation_event_rehydrates_live_session() {
        let mut fx = fixture();
        fx.bus
            .publish(
                TOPIC_TASK_CONVERSATION,
                json!({
                    "id": "tsk_1",
                    "conversation_id": "session-t",
                    "session_id": "session-t",
                    "source": "tasks",
                }),
            )
            .unwrap();
        let texts = system_texts(&drain(&mut fx.rx));
        assert!(texts
            .iter()
            .any(|t| t.starts_with("[Tasks] Conversation loaded (live):")));
    }

    #[test]
    fn conversation_event_for_unknown_token_warns() {
        let mut fx = fixture();
        fx.bus
            .publish(
                TOPIC_TASK_CONVERSATION,
                json!({
                    "id": "tsk_1",
                    "conversation_id": "session-gone",
                    "session_id": "session-t",
                    "source": "tasks",
                }),
            )
            .unwrap();
        let texts = system_texts(&drain(&mut fx.rx));
        assert!(texts.iter().any(|t| t.contains("Conversation not found")));
    }

    #[test]
    fn metrics_payload_lists_components() {
        let fx = fixture();
        fx.coordinator.submit("/task \"alpha\"");
        fx.coordinator.submit("/task \"beta\"");
        let task = first_task(&fx.store);
        fx.coordinator.submit(&format!("/task {} status closed", task.id));
        let payloads = Arc::new(Mutex::new(Vec::new()));
        let payloads_clone = Arc::clone(&payloads);
        let _sub = fx
            .bus
            .subscribe(TOPIC_SYSTEM_METRICS, move |_topic, payload| {
                payloads_clone.lock().unwrap().push(payload.clone());
            })
            .unwrap();
        fx.coordinator.publish_metrics().unwrap();
        let payloads = payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].contains_key("generated_at"));
        let components = payloads[0]["components"].as_array().unwrap();
        assert_eq!(components.len(), 4);
        assert_eq!(components[0]["name"], json!("bridge"));
        assert_eq!(components[2]["status"], json!("ok"));
        assert_eq!(components[2]["auto_command"], json!(null));
        assert_eq!(components[3]["count"], json!(2));
        assert_eq!(components[3]["open"], json!(1));
    }
}
