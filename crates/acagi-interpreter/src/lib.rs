//! Auto-continue heuristic for Codex sessions.
//!
//! The interpreter watches assistant output for two stall shapes: an explicit
//! continuation question, and the same short plan printed twice in a row. In
//! either case it proposes a follow-up command derived from the last user
//! instruction. It never sends anything itself; the caller owns the bridge
//! and reports back with [`Interpreter::mark_sent`] or
//! [`Interpreter::mark_send_failed`].

use std::collections::VecDeque;

use regex::Regex;
use tracing::debug;

/// Plan-shaped snippets longer than this are treated as ordinary output.
pub const PLAN_MAX_CHARS: usize = 400;
/// How many consecutive plan-shaped snippets must match before a follow-up.
pub const PLAN_WINDOW: usize = 2;
/// Character cap for the instruction quoted inside a follow-up command.
pub const FOLLOW_UP_LIMIT: usize = 160;

/// Regex tables driving the interpreter, kept as data so they can be tuned
/// and tested apart from the state machine.
pub struct InterpreterRules {
    completion: Vec<Regex>,
    continuation: Vec<Regex>,
    plan_heading: Regex,
    plan_bullet: Regex,
}

impl Default for InterpreterRules {
    fn default() -> Self {
        let completion = vec![
            Regex::new(r"(?i)\bcompleted\b.*\bfile").expect("valid regex"),
            Regex::new(r"(?i)\bfinished\b.*\bfile").expect("valid regex"),
            Regex::new(r"(?i)\ball changes (have been )?(applied|completed)").expect("valid regex"),
            Regex::new(r"(?i)\bno further (changes|actions) required").expect("valid regex"),
        ];
        let continuation = vec![
            Regex::new(r"(?i)would you like me to continue").expect("valid regex"),
            Regex::new(r"(?i)should i keep going").expect("valid regex"),
            Regex::new(r"(?i)do you want me to continue").expect("valid regex"),
            Regex::new(r"(?i)can i continue").expect("valid regex"),
        ];
        InterpreterRules {
            completion,
            continuation,
            plan_heading: Regex::new(r"(?i)(plan|next steps|todo)[:?]").expect("valid regex"),
            plan_bullet: Regex::new(r"(?m)^\s*(?:[-*\u{2022}]|\d{1,3}[.)])\s+").expect("valid regex"),
        }
    }
}

impl InterpreterRules {
    fn is_completion(&self, snippet: &str) -> bool {
        self.completion.iter().any(|re| re.is_match(snippet))
    }

    fn is_continuation(&self, snippet: &str) -> bool {
        self.continuation.iter().any(|re| re.is_match(snippet))
    }

    fn is_plan_shaped(&self, snippet: &str) -> bool {
        snippet.chars().count() <= PLAN_MAX_CHARS
            && (self.plan_heading.is_match(snippet) || self.plan_bullet.is_match(snippet))
    }
}

/// State machine observing user turns and Codex output.
pub struct Interpreter {
    enabled: bool,
    rules: InterpreterRules,
    last_user_instruction: String,
    last_auto_command: Option<String>,
    recent_plan: VecDeque<String>,
    auto_active: bool,
    auto_completed: bool,
}

impl Interpreter {
    pub fn new(enabled: bool) -> Self {
        Interpreter {
            enabled,
            rules: InterpreterRules::default(),
            last_user_instruction: String::new(),
            last_auto_command: None,
            recent_plan: VecDeque::with_capacity(PLAN_WINDOW),
            auto_active: false,
            auto_completed: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn last_auto_command(&self) -> Option<&str> {
        self.last_auto_command.as_deref()
    }

    /// A fresh user turn re-arms the heuristic and becomes the focus of any
    /// later follow-up.
    pub fn observe_user(&mut self, text: &str) {
        self.last_user_instruction = text.trim().to_string();
        self.last_auto_command = None;
        self.recent_plan.clear();
        self.auto_active = false;
        self.auto_completed = false;
    }

    /// Feeds one output snippet through the trigger rules. Returns the
    /// follow-up command to inject when the session looks stalled.
    /// `bridge_ready` is the caller's view of "running, not busy, no local
    /// reply in flight"; nothing fires while it is false.
    pub fn observe_output(&mut self, snippet: &str, bridge_ready: bool) -> Option<String> {
        if self.rules.is_completion(snippet) {
            debug!(event = "interpreter_completion_seen");
            self.auto_completed = true;
            self.auto_active = false;
            self.last_auto_command = None;
            self.recent_plan.clear();
            return None;
        }
        if !self.enabled || self.auto_completed || self.auto_active || !bridge_ready {
            return None;
        }
        if self.rules.is_continuation(snippet) {
            debug!(event = "interpreter_continuation_seen");
            return Some(self.follow_up());
        }
        if self.rules.is_plan_shaped(snippet) {
            self.recent_plan.push_back(normalize_plan(snippet));
            while self.recent_plan.len() > PLAN_WINDOW {
                self.recent_plan.pop_front();
            }
            if self.recent_plan.len() == PLAN_WINDOW
                && self.recent_plan.iter().all(|p| p == &self.recent_plan[0])
            {
                debug!(event = "interpreter_repeated_plan");
                self.recent_plan.clear();
                return Some(self.follow_up());
            }
            return None;
        }
        self.recent_plan.clear();
        None
    }

    /// The caller injected `command` successfully; hold further follow-ups
    /// until completion or the next user turn.
    pub fn mark_sent(&mut self, command: &str) {
        self.last_auto_command = Some(command.to_string());
        self.auto_active = true;
    }

    /// The injection never reached the console, so the heuristic stays armed.
    pub fn mark_send_failed(&mut self) {
        self.last_auto_command = None;
        self.auto_active = false;
    }

    fn follow_up(&self) -> String {
        let instruction = self.last_user_instruction.trim();
        if instruction.is_empty() {
            "continue".to_string()
        } else {
            format!("continue, focusing on {}", truncate_chars(instruction, FOLLOW_UP_LIMIT))
        }
    }
}

/// Exact-equality basis for repeated-plan detection: case and runs of
/// whitespace are ignored, nothing else.
fn normalize_plan(snippet: &str) -> String {
    snippet
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max.saturating_sub(1)).collect();
    truncated.push('\u{2026}');
    truncated
}
