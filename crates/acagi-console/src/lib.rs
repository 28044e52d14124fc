use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

pub mod screen;

use screen::Screen;

const PTY_ROWS: u16 = 40;
const PTY_COLS: u16 = 120;

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("failed to spawn console child: {0}")]
    Spawn(String),
    #[error("console write failed: {0}")]
    Write(String),
    #[error("console read failed: {0}")]
    Read(String),
}

/// Opaque window identity. Carries an HWND on Windows builds; the PTY
/// adapter has no window system and never produces one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHandle(pub u64);

/// Capability the coordinator needs from a console hosting the Codex CLI:
/// read the visible text, inject keystrokes, and manage focus. Implementors
/// must be cheap to call; snapshots are expected to return in milliseconds.
pub trait ConsoleChannel: Send + Sync {
    /// Record the child process this channel fronts.
    fn attach(&self, pid: u32);

    /// Plain-text reconstruction of the visible buffer: trailing whitespace
    /// trimmed, lines joined with `\n`, terminated by `\n`.
    fn read_snapshot(&self) -> Result<String, ConsoleError>;

    /// Inject text without a trailing Enter.
    fn write_text(&self, text: &str) -> Result<(), ConsoleError>;

    /// Inject a single Enter keypress.
    fn write_enter(&self) -> Result<(), ConsoleError>;

    /// Last-resort Enter: briefly focus the console window, send a synthetic
    /// Return, restore focus. Adapters without a window system degrade to a
    /// plain Enter write.
    fn foreground_enter_fallback(
        &self,
        console: Option<WindowHandle>,
        restore: Option<WindowHandle>,
    ) -> Result<(), ConsoleError>;

    fn show(&self);
    fn hide(&self);
    fn window_handle(&self) -> Option<WindowHandle>;
    fn child_pid(&self) -> Option<u32>;
    fn is_alive(&self) -> bool;
}

/// Cross-platform ConsoleChannel over a pseudo-terminal. A reader thread
/// pumps child output into a [`Screen`]; a watcher thread reaps the child
/// and drops the liveness flag.
pub struct PtyConsole {
    screen: Arc<Mutex<Screen>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    alive: Arc<AtomicBool>,
    child_pid: Mutex<Option<u32>>,
}

impl PtyConsole {
    pub fn spawn(
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<Self, ConsoleError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: PTY_ROWS,
                cols: PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| ConsoleError::Spawn(err.to_string()))?;

        let mut builder = CommandBuilder::new(command);
        builder.args(args);
        if let Some(cwd) = cwd {
            builder.cwd(cwd);
        }
        if std::env::var("TERM").is_err() {
            builder.env("TERM", "xterm-256color");
        }

        let mut child = pair
            .slave
            .spawn_command(builder)
            .map_err(|err| ConsoleError::Spawn(err.to_string()))?;
        drop(pair.slave);

        let pid = child.process_id();
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| ConsoleError::Spawn(err.to_string()))?;
        let writer: Arc<Mutex<Box<dyn Write + Send>>> = Arc::new(Mutex::new(
            pair.master
                .take_writer()
                .map_err(|err| ConsoleError::Spawn(err.to_string()))?,
        ));

        let screen = Arc::new(Mutex::new(Screen::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let screen_pump = Arc::clone(&screen);
        let alive_pump = Arc::clone(&alive);
        std::thread::spawn(move || {
            // Keep the master alive for the lifetime of the pump so reads
            // see EOF only when the child side closes.
            let _master = pair.master;
            let mut buffer = [0u8; 8192];
            loop {
                let read = match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(count) => count,
                    Err(_) => break,
                };
                if let Ok(mut screen) = screen_pump.lock() {
                    screen.feed(&buffer[..read]);
                }
            }
            alive_pump.store(false, Ordering::SeqCst);
        });

        let alive_wait = Arc::clone(&alive);
        std::thread::spawn(move || {
            let status = child.wait();
            alive_wait.store(false, Ordering::SeqCst);
            match status {
                Ok(status) => debug!(event = "console_child_exit", code = status.exit_code()),
                Err(err) => warn!(event = "console_child_wait_failed", error = %err),
            }
        });

        debug!(event = "console_spawned", command = %command, pid = pid.unwrap_or(0));
        Ok(Self {
            screen,
            writer,
            alive,
            child_pid: Mutex::new(pid),
        })
    }

    fn write_bytes(&self, bytes: &[u8]) -> Result<(), ConsoleError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| ConsoleError::Write("writer lock poisoned".to_string()))?;
        writer
            .write_all(bytes)
            .map_err(|err| ConsoleError::Write(err.to_string()))?;
        writer
            .flush()
            .map_err(|err| ConsoleError::Write(err.to_string()))?;
        Ok(())
    }
}

impl ConsoleChannel for PtyConsole {
    fn attach(&self, pid: u32) {
        if let Ok(mut slot) = self.child_pid.lock() {
            *slot = Some(pid);
        }
    }

    fn read_snapshot(&self) -> Result<String, ConsoleError> {
        let screen = self
            .screen
            .lock()
            .map_err(|_| ConsoleError::Read("screen lock poisoned".to_string()))?;
        Ok(screen.snapshot())
    }

    fn write_text(&self, text: &str) -> Result<(), ConsoleError> {
        self.write_bytes(text.as_bytes())
    }

    fn write_enter(&self) -> Result<(), ConsoleError> {
        self.write_bytes(b"\r")
    }

    fn foreground_enter_fallback(
        &self,
        _console: Option<WindowHandle>,
        _restore: Option<WindowHandle>,
    ) -> Result<(), ConsoleError> {
        debug!(event = "foreground_enter_fallback_degraded");
        self.write_enter()
    }

    fn show(&self) {
        debug!(event = "console_show_noop");
    }

    fn hide(&self) {
        debug!(event = "console_hide_noop");
    }

    fn window_handle(&self) -> Option<WindowHandle> {
        None
    }

    fn child_pid(&self) -> Option<u32> {
        self.child_pid.lock().ok().and_then(|slot| *slot)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
