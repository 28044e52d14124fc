use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use acagi_bridge::{BridgeConfig, CodexBridge, LedState};
use acagi_console::{ConsoleChannel, ConsoleError, WindowHandle};
use acagi_conversation::{ConversationConfig, ConversationLog};
use acagi_coordinator::{
    BasicSafetyManager, Coordinator, CoordinatorConfig, UiEvent, WidgetState,
};
use acagi_core::bus::EventBus;
use acagi_core::{ApprovalAction, ConversationRole};
use acagi_prompt::PromptConfig;
use acagi_store::TaskStore;
use tempfile::TempDir;

/// Console stand-in driven by the test: the screen grows only when the
/// test appends to it, and every injected write is recorded.
struct ScriptedConsole {
    screen: Mutex<String>,
    written: Mutex<Vec<String>>,
}

impl ScriptedConsole {
    fn new() -> Arc<Self> {
        Arc::new(ScriptedConsole {
            screen: Mutex::new(String::new()),
            written: Mutex::new(Vec::new()),
        })
    }

    fn append(&self, text: &str) {
        self.screen.lock().unwrap().push_str(text);
    }

    fn written(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }
}

impl ConsoleChannel for ScriptedConsole {
    fn attach(&self, _pid: u32) {}

    fn read_snapshot(&self) -> Result<String, ConsoleError> {
        Ok(self.screen.lock().unwrap().clone())
    }

    fn write_text(&self, text: &str) -> Result<(), ConsoleError> {
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

struct Session {
    _dir: TempDir,
    coordinator: Coordinator,
    console: Arc<ScriptedConsole>,
    events: Arc<Mutex<Vec<UiEvent>>>,
}

/// Wires the full stack the way the CLI does: bridge events are forwarded
/// into the coordinator and UI events are collected for assertions.
fn start_session() -> Session {
    let dir = TempDir::new().expect("temp workspace");
    let store = Arc::new(TaskStore::open(dir.path()).expect("open store"));
    let bus = EventBus::new();
    let conversation = Arc::new(
        ConversationLog::open(
            dir.path().join("conversation"),
            "session-int",
            ConversationConfig::default(),
            None,
        )
        .expect("open conversation"),
    );
    let console = ScriptedConsole::new();
    let (bridge, mut bridge_rx) = CodexBridge::new(
        console.clone(),
        BridgeConfig {
            busy_poll: Duration::from_millis(5),
            idle_poll: Duration::from_millis(10),
            settle_window: Duration::from_millis(40),
            settle_poll: Duration::from_millis(5),
        },
    );
    let (coordinator, mut ui_rx) = Coordinator::new(
        store,
        bus,
        conversation,
        bridge,
        Arc::new(BasicSafetyManager::default()),
        None,
        CoordinatorConfig {
            session_token: "session-int".to_string(),
            workspace: dir.path().to_path_buf(),
            interpreter_enabled: true,
            // Context sharing off keeps the injected payload equal to the
            // typed text, which is what the scripted echo reproduces.
            prompt: PromptConfig {
                share_context: false,
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

    let events: Arc<Mutex<Vec<UiEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    tokio::spawn(async move {
        while let Some(event) = ui_rx.recv().await {
            sink.lock().unwrap().push(event);
        }
    });

    coordinator.bridge().start();
    Session {
        _dir: dir,
        coordinator,
        console,
        events,
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Duration::from_secs(3);
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn snapshot(events: &Arc<Mutex<Vec<UiEvent>>>) -> Vec<UiEvent> {
    events.lock().unwrap().clone()
}

#[tokio::test]
async fn approval_prompt_round_trip_over_a_live_screen() {
    let session = start_session();

    // Codex banner comes up first; the bridge should go green.
    session
        .console
        .append("You are using OpenAI Codex v1.2\nType /status for details\nCtrl+J newline\n");
    let events = Arc::clone(&session.events);
    eventually("green led", move || {
        snapshot(&events).contains(&UiEvent::Led(LedState::Green))
    })
    .await;

    session.coordinator.submit("run the unit tests");
    let console = Arc::clone(&session.console);
    eventually("payload injection", move || {
        console.written() == vec!["run the unit tests".to_string()]
    })
    .await;

    // The console echoes the injected text; the echo must not become an
    // assistant turn.
    session.console.append("run the unit tests\n");
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(!snapshot(&session.events).contains(&UiEvent::Message {
        role: ConversationRole::Assistant,
        text: "run the unit tests".to_string(),
    }));

    session
        .console
        .append("Allow command?\n> pytest -q\n[y] Yes\n[n] No\n[a] Always allow\n");
    let events = Arc::clone(&session.events);
    eventually("approval widget", move || {
        snapshot(&events)
            .iter()
            .any(|e| matches!(e, UiEvent::ApprovalShown { .. }))
    })
    .await;

    let (id, prompt) = snapshot(&session.events)
        .iter()
        .find_map(|e| match e {
            UiEvent::ApprovalShown { id, prompt } => Some((*id, prompt.clone())),
            _ => None,
        })
        .expect("widget event");
    assert_eq!(prompt.header, "Allow command?");
    assert_eq!(prompt.body, "> pytest -q");
    assert_eq!(prompt.options.yes, "y");

    session.coordinator.respond_to_approval(id, ApprovalAction::Yes);
    let console = Arc::clone(&session.console);
    eventually("token injection", move || {
        console.written().last().map(String::as_str) == Some("y")
    })
    .await;
    let events = Arc::clone(&session.events);
    eventually("widget submitted", move || {
        snapshot(&events).contains(&UiEvent::ApprovalState {
            id,
            state: WidgetState::Submitted,
            detail: Some("Sent: Yes".to_string()),
        })
    })
    .await;

    let widgets = session.coordinator.widgets();
    assert_eq!(widgets.len(), 1);
    assert_eq!(widgets[0].state, WidgetState::Submitted);

    session.coordinator.bridge().stop();
}

#[tokio::test]
async fn continuation_question_is_answered_automatically() {
    let session = start_session();
    session
        .console
        .append("You are using OpenAI Codex v1.2\n");
    let events = Arc::clone(&session.events);
    eventually("green led", move || {
        snapshot(&events).contains(&UiEvent::Led(LedState::Green))
    })
    .await;

    session.coordinator.submit("tidy up the config loader");
    let console = Arc::clone(&session.console);
    eventually("payload injection", move || {
        console.written().len() == 1
    })
    .await;

    // Let the settle window elapse so the bridge reports idle again.
    let bridge = session.coordinator.bridge().clone();
    eventually("bridge idle", move || !bridge.is_busy()).await;

    session
        .console
        .append("Refactored two modules. Would you like me to continue?\n");
    let console = Arc::clone(&session.console);
    eventually("auto continue", move || {
        console.written().len() == 2
            && console.written()[1] == "continue, focusing on tidy up the config loader"
    })
    .await;

    let texts: Vec<String> = snapshot(&session.events)
        .iter()
        .filter_map(|e| match e {
            UiEvent::Message {
                role: ConversationRole::System,
                text,
            } => Some(text.clone()),
            _ => None,
        })
        .collect();
    assert!(texts.iter().any(|t| t.starts_with("Auto-continue:")));

    // A second nudge must not fire again before the next user turn.
    session
        .console
        .append("Continuing. Should I keep going?\n");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(session.console.written().len(), 2);

    session.coordinator.bridge().stop();
}
