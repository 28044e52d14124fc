//! Blocking subprocess execution with timeout and cancellation.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::warn;

const WAIT_POLL: Duration = Duration::from_millis(50);

/// Everything observed from one subprocess run. Timeouts and cancellation
/// both surface as exit code 1; the timeout additionally replaces stderr
/// with an explanatory message.
pub(crate) struct CapturedRun {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub cancelled: bool,
}

pub(crate) fn run_command(
    command: &[String],
    cwd: &Path,
    timeout: Option<Duration>,
    cancel: &AtomicBool,
) -> CapturedRun {
    let Some((program, args)) = command.split_first() else {
        return failed_run("empty command");
    };

    let mut child = match Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => return failed_run(&format!("failed to spawn {program}: {err}")),
    };

    let stdout = reader_thread(child.stdout.take());
    let stderr = reader_thread(child.stderr.take());

    let start = Instant::now();
    let mut timed_out = false;
    let mut cancelled = false;
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code().unwrap_or(1),
            Ok(None) => {}
            Err(err) => {
                warn!(event = "run_wait_failed", error = %err);
                let _ = child.kill();
                let _ = child.wait();
                break 1;
            }
        }
        if cancel.load(Ordering::SeqCst) {
            cancelled = true;
            let _ = child.kill();
            let _ = child.wait();
            break 1;
        }
        if let Some(limit) = timeout {
            if start.elapsed() >= limit {
                timed_out = true;
                let _ = child.kill();
                let _ = child.wait();
                break 1;
            }
        }
        thread::sleep(WAIT_POLL);
    };

    let stdout = stdout.join().unwrap_or_default();
    let mut stderr = stderr.join().unwrap_or_default();
    if timed_out {
        if let Some(limit) = timeout {
            stderr = format!("command timed out after {}s", limit.as_secs_f32());
        }
    }

    CapturedRun { exit_code, stdout, stderr, cancelled }
}

fn failed_run(message: &str) -> CapturedRun {
    CapturedRun {
        exit_code: 1,
        stdout: String::new(),
        stderr: message.to_string(),
        cancelled: false,
    }
}

fn reader_thread<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    })
}
