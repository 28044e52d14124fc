//! Supervises a Codex CLI session running inside a [`ConsoleChannel`].
//!
//! The bridge owns two small polling loops. The idle loop watches the console
//! screen for appended output, suppresses the echo of the most recent
//! injection, and reports readiness when the Codex banner shows up. The settle
//! loop runs after an Enter keypress and holds the busy flag until the screen
//! has stopped changing for a quiet window. Consumers receive everything as
//! [`BridgeEvent`]s on an unbounded channel; the bridge itself never touches
//! the transcript or the task store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use acagi_console::{ConsoleChannel, WindowHandle};

/// Cadence of the idle loop while an injection is being serviced.
pub const BUSY_POLL: Duration = Duration::from_millis(200);
/// Cadence of the idle loop while the screen is not changing.
pub const IDLE_POLL: Duration = Duration::from_millis(900);
/// How long the screen must stay identical before an injection counts as
/// settled.
pub const SETTLE_WINDOW: Duration = Duration::from_millis(1200);
/// Cadence of the settle loop's snapshot polls.
pub const SETTLE_POLL: Duration = Duration::from_millis(200);

/// Traffic-light state surfaced next to the console toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedState {
    /// No session, or the last console interaction failed.
    Red,
    /// Session starting up or busy servicing an injection.
    Yellow,
    /// The Codex banner has been observed at least once.
    Green,
}

impl LedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedState::Red => "red",
            LedState::Yellow => "yellow",
            LedState::Green => "green",
        }
    }
}

/// Events emitted by the bridge loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A short status line for the UI footer.
    Status(String),
    /// LED transition.
    Led(LedState),
    /// Output appended to the console screen since the previous poll. Echoes
    /// of the bridge's own injections are filtered out before this fires.
    Output(String),
}

/// Polling intervals, overridable so tests can run on a fast clock.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub busy_poll: Duration,
    pub idle_poll: Duration,
    pub settle_window: Duration,
    pub settle_poll: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            busy_poll: BUSY_POLL,
            idle_poll: IDLE_POLL,
            settle_window: SETTLE_WINDOW,
            settle_poll: SETTLE_POLL,
        }
    }
}

/// Patterns that mark the Codex CLI as ready for input. Any single match on
/// the full screen snapshot flips the LED to green.
pub struct BannerRules {
    patterns: Vec<Regex>,
}

impl Default for BannerRules {
    fn default() -> Self {
        let patterns = vec![
            Regex::new(r"(?i)you are using openai codex").expect("valid regex"),
            Regex::new(r"(?i)/status\b").expect("valid regex"),
            Regex::new(r"(?i)ctrl\+j\s+newline").expect("valid regex"),
        ];
        BannerRules { patterns }
    }
}

impl BannerRules {
    pub fn matches(&self, snapshot: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(snapshot))
    }
}

struct BridgeState {
    running: bool,
    busy: bool,
    ready_seen: bool,
    led: LedState,
    last_injected: Option<String>,
    last_snapshot: String,
    last_digest: Option<[u8; 32]>,
}

impl BridgeState {
    fn new() -> Self {
        BridgeState {
            running: false,
            busy: false,
            ready_seen: false,
            led: LedState::Red,
            last_injected: None,
            last_snapshot: String::new(),
            last_digest: None,
        }
    }
}

struct BridgeInner {
    console: Arc<dyn ConsoleChannel>,
    events: mpsc::UnboundedSender<BridgeEvent>,
    config: BridgeConfig,
    banner: BannerRules,
    state: Mutex<BridgeState>,
    stop_tx: watch::Sender<bool>,
}

/// Cloneable handle over the bridge loops. All clones share one state.
#[derive(Clone)]
pub struct CodexBridge {
    inner: Arc<BridgeInner>,
}

impl CodexBridge {
    /// Creates a bridge over `console` together with the receiving end of its
    /// event channel. The bridge stays inert until [`CodexBridge::start`].
    pub fn new(
        console: Arc<dyn ConsoleChannel>,
        config: BridgeConfig,
    ) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        let inner = BridgeInner {
            console,
            events,
            config,
            banner: BannerRules::default(),
            state: Mutex::new(BridgeState::new()),
            stop_tx,
        };
        (CodexBridge { inner: Arc::new(inner) }, rx)
    }

    /// Records the pid of an externally launched Codex process on the
    /// underlying console.
    pub fn attach(&self, pid: u32) {
        self.inner.console.attach(pid);
        self.emit_status(format!("attached to pid {pid}"));
    }

    /// Starts the idle loop. Idempotent while already running.
    pub fn start(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.running {
                return;
            }
            state.running = true;
        }
        self.inner.stop_tx.send_replace(false);
        self.set_led(LedState::Yellow);
        self.emit_status("codex bridge started".to_string());
        let bridge = self.clone();
        let stop_rx = self.inner.stop_tx.subscribe();
        tokio::spawn(async move {
            bridge.idle_loop(stop_rx).await;
        });
    }

    /// Signals both loops to exit and drops the pending-echo slot.
    pub fn stop(&self) {
        self.inner.stop_tx.send_replace(true);
        {
            let mut state = self.inner.state.lock().unwrap();
            state.running = false;
            state.busy = false;
            state.last_injected = None;
        }
        self.set_led(LedState::Red);
        self.emit_status("codex bridge stopped".to_string());
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().unwrap().running
    }

    pub fn is_busy(&self) -> bool {
        self.inner.state.lock().unwrap().busy
    }

    pub fn led(&self) -> LedState {
        self.inner.state.lock().unwrap().led
    }

    /// Writes `text` into the console without pressing Enter. On success the
    /// bridge turns busy and remembers the text so its echo can be swallowed
    /// exactly once. Returns whether the write reached the console.
    pub fn send_text(&self, text: &str) -> bool {
        if !self.is_running() {
            self.emit_status("codex bridge is not running".to_string());
            return false;
        }
        match self.inner.console.write_text(text) {
            Ok(()) => {
                {
                    let mut state = self.inner.state.lock().unwrap();
                    state.busy = true;
                    state.last_injected = Some(text.to_string());
                }
                self.set_led(LedState::Yellow);
                self.emit_status(format!("sent {} bytes to codex", text.len()));
                true
            }
            Err(err) => {
                {
                    let mut state = self.inner.state.lock().unwrap();
                    state.last_injected = None;
                }
                self.set_led(LedState::Red);
                self.emit_status(format!("console write failed: {err}"));
                false
            }
        }
    }

    /// Presses Enter on a background task and then waits for the screen to
    /// settle. `restore` names the window that should regain focus if the
    /// console has to use its foreground fallback.
    pub fn press_enter(&self, restore: Option<WindowHandle>) {
        let bridge = self.clone();
        let stop_rx = self.inner.stop_tx.subscribe();
        tokio::spawn(async move {
            if let Err(err) = bridge.inner.console.write_enter() {
                warn!(event = "bridge_enter_fallback", error = %err);
                let console_handle = bridge.inner.console.window_handle();
                if let Err(err) = bridge
                    .inner
                    .console
                    .foreground_enter_fallback(console_handle, restore)
                {
                    bridge.set_led(LedState::Red);
                    bridge.emit_status(format!("enter failed: {err}"));
                }
            }
            bridge.settle_loop(stop_rx).await;
        });
    }

    async fn idle_loop(&self, mut stop_rx: watch::Receiver<bool>) {
        debug!(event = "bridge_idle_loop_start");
        loop {
            if *stop_rx.borrow() {
                break;
            }
            if self.is_busy() {
                if sleep_or_stop(&mut stop_rx, self.inner.config.busy_poll).await {
                    break;
                }
                continue;
            }
            let snapshot = match self.inner.console.read_snapshot() {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    self.set_led(LedState::Red);
                    self.emit_status(format!("console read failed: {err}"));
                    if sleep_or_stop(&mut stop_rx, self.inner.config.idle_poll).await {
                        break;
                    }
                    continue;
                }
            };
            let digest: [u8; 32] = Sha256::digest(snapshot.as_bytes()).into();
            let unchanged = {
                let state = self.inner.state.lock().unwrap();
                state.last_digest == Some(digest)
            };
            if unchanged {
                if sleep_or_stop(&mut stop_rx, self.inner.config.idle_poll).await {
                    break;
                }
                continue;
            }
            self.process_snapshot(&snapshot, digest);
        }
        debug!(event = "bridge_idle_loop_exit");
    }

    /// Folds one changed snapshot into the bridge state: delta extraction,
    /// echo suppression, banner detection.
    fn process_snapshot(&self, snapshot: &str, digest: [u8; 32]) {
        let (delta, swallowed) = {
            let mut state = self.inner.state.lock().unwrap();
            let delta = appended_delta(&state.last_snapshot, snapshot);
            state.last_snapshot = snapshot.to_string();
            state.last_digest = Some(digest);
            match delta {
                Some(delta) if !delta.trim().is_empty() => {
                    let echoed = state
                        .last_injected
                        .as_deref()
                        .map(|injected| {
                            delta.trim().to_lowercase() == injected.trim().to_lowercase()
                        })
                        .unwrap_or(false);
                    state.last_injected = None;
                    if echoed {
                        (None, true)
                    } else {
                        (Some(delta), false)
                    }
                }
                _ => (None, false),
            }
        };
        if swallowed {
            debug!(event = "bridge_echo_swallowed");
        }
        if let Some(delta) = delta {
            let _ = self.inner.events.send(BridgeEvent::Output(delta));
        }
        self.observe_banner(snapshot);
    }

    async fn settle_loop(&self, mut stop_rx: watch::Receiver<bool>) {
        let mut last = self.inner.console.read_snapshot().unwrap_or_default();
        let mut stable_since = Instant::now();
        loop {
            if *stop_rx.borrow() {
                break;
            }
            if sleep_or_stop(&mut stop_rx, self.inner.config.settle_poll).await {
                break;
            }
            let snapshot = self.inner.console.read_snapshot().unwrap_or_default();
            if snapshot != last {
                last = snapshot;
                stable_since = Instant::now();
                continue;
            }
            if stable_since.elapsed() >= self.inner.config.settle_window {
                break;
            }
        }
        // A stop signal already cleared busy and parked the LED on red;
        // settling on top of that would flip it green again.
        if *stop_rx.borrow() {
            return;
        }
        {
            let mut state = self.inner.state.lock().unwrap();
            state.busy = false;
        }
        debug!(event = "bridge_settled");
        self.observe_banner(&last);
        if self.inner.state.lock().unwrap().ready_seen {
            self.set_led(LedState::Green);
        }
    }

    fn observe_banner(&self, snapshot: &str) {
        let newly_ready = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.ready_seen && self.inner.banner.matches(snapshot) {
                state.ready_seen = true;
                true
            } else {
                false
            }
        };
        if newly_ready {
            self.set_led(LedState::Green);
            self.emit_status("codex is ready".to_string());
        }
    }

    fn set_led(&self, led: LedState) {
        let changed = {
            let mut state = self.inner.state.lock().unwrap();
            if state.led == led {
                false
            } else {
                state.led = led;
                true
            }
        };
        if changed {
            let _ = self.inner.events.send(BridgeEvent::Led(led));
        }
    }

    fn emit_status(&self, message: String) {
        let _ = self.inner.events.send(BridgeEvent::Status(message));
    }
}

/// Sleeps for `delay` unless the stop signal fires first. Returns whether the
/// caller should exit its loop.
async fn sleep_or_stop(stop_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = stop_rx.changed() => changed.is_err() || *stop_rx.borrow(),
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Lines appended to the screen since `prev`. A grown snapshot contributes
/// every line past the old count. Once the scrollback cap is reached the
/// screen stops growing and drains head lines instead, so an equal or
/// shrunken snapshot is aligned on the longest old tail still present at the
/// head of `next`; whatever follows that overlap is new. With no overlap at
/// all the change counts as an in-place rewrite and nothing is emitted.
fn appended_delta(prev: &str, next: &str) -> Option<String> {
    let prev_lines: Vec<&str> = prev.lines().collect();
    let next_lines: Vec<&str> = next.lines().collect();
    if next_lines.len() > prev_lines.len() {
        return Some(next_lines[prev_lines.len()..].join("\n"));
    }
    let max_overlap = next_lines.len().min(prev_lines.len());
    for overlap in (1..=max_overlap).rev() {
        if prev_lines[prev_lines.len() - overlap..] == next_lines[..overlap] {
            if overlap == next_lines.len() {
                return None;
            }
            return Some(next_lines[overlap..].join("\n"));
        }
    }
    None
}
