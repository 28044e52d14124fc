//! Command safety gate for task runs.

use regex::Regex;
use thiserror::Error;

/// Raised when a command is refused before execution.
#[derive(Debug, Clone, Error)]
#[error("Blocked command: {reason}")]
pub struct SafetyViolation {
    pub reason: String,
}

/// Collaborator consulted before every `run_checked` execution.
pub trait SafetyManager: Send + Sync {
    fn ensure_command_allowed(&self, command: &[String]) -> Result<(), SafetyViolation>;
}

/// Denylist over the joined command line. This is a coarse last line of
/// defense, not a sandbox; anything matching a destructive pattern is
/// refused outright.
pub struct BasicSafetyManager {
    denied: Vec<Regex>,
}

impl Default for BasicSafetyManager {
    fn default() -> Self {
        let denied = vec![
            Regex::new(r"(?i)\brm\s+-\w*(rf|fr)\w*\s+/(\*|\s|$)").expect("valid regex"),
            Regex::new(r"(?i)\bmkfs(\.|\s|$)").expect("valid regex"),
            Regex::new(r"(?i)\bdd\s+.*\bof=/dev/").expect("valid regex"),
            Regex::new(r">\s*/dev/sd[a-z]").expect("valid regex"),
        ];
        BasicSafetyManager { denied }
    }
}

impl SafetyManager for BasicSafetyManager {
    fn ensure_command_allowed(&self, command: &[String]) -> Result<(), SafetyViolation> {
        let joined = command.join(" ");
        for pattern in &self.denied {
            if pattern.is_match(&joined) {
                return Err(SafetyViolation { reason: joined });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn wipe_root_is_blocked() {
        let safety = BasicSafetyManager::default();
        let err = safety.ensure_command_allowed(&cmd(&["rm", "-rf", "/"])).unwrap_err();
        assert!(err.to_string().starts_with("Blocked command:"));
    }

    #[test]
    fn scoped_delete_is_allowed() {
        let safety = BasicSafetyManager::default();
        assert!(safety.ensure_command_allowed(&cmd(&["rm", "-rf", "target/debug"])).is_ok());
    }

    #[test]
    fn ordinary_commands_pass() {
        let safety = BasicSafetyManager::default();
        assert!(safety.ensure_command_allowed(&cmd(&["cargo", "test"])).is_ok());
        assert!(safety.ensure_command_allowed(&cmd(&["git", "status"])).is_ok());
    }

    #[test]
    fn device_write_is_blocked() {
        let safety = BasicSafetyManager::default();
        assert!(safety
            .ensure_command_allowed(&cmd(&["dd", "if=/dev/zero", "of=/dev/sda"]))
            .is_err());
    }
}
