//! Token-budgeted prompt assembly.
//!
//! A prompt going to Codex is built from up to three parts: shared
//! conversation context, the user's text, and the contents of any referenced
//! files or directories. The builder keeps the result inside the model's
//! context window using a pluggable [`TokenEstimator`]; without an estimator
//! the guard is disabled and everything is included.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;

use acagi_conversation::ConversationLog;
use acagi_core::{EntryReference, RefKind};

/// Most entries shown from a directory reference.
pub const DIR_LISTING_LIMIT: usize = 50;
/// Fallback window for models the estimator does not recognize.
pub const DEFAULT_CONTEXT_WINDOW: usize = 8192;

/// Rough token accounting for budget decisions. Exact counts do not matter;
/// the guard only needs to be conservative enough to avoid oversized prompts.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
    fn context_window(&self, model: &str) -> usize;
}

/// Four-characters-per-token estimate with a small window table keyed by
/// model name substrings.
pub struct HeuristicEstimator;

const MODEL_WINDOWS: &[(&str, usize)] = &[
    ("llama3.1", 131072),
    ("llama3", 8192),
    ("qwen", 32768),
    ("mistral", 32768),
];

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, text: &str) -> usize {
        (text.chars().count() + 3) / 4
    }

    fn context_window(&self, model: &str) -> usize {
        let lower = model.to_lowercase();
        MODEL_WINDOWS
            .iter()
            .find(|(name, _)| lower.contains(name))
            .map(|(_, window)| *window)
            .unwrap_or(DEFAULT_CONTEXT_WINDOW)
    }
}

#[derive(Debug, Clone)]
pub struct PromptConfig {
    /// Include recent or retrieved conversation lines ahead of the user text.
    pub share_context: bool,
    /// How many conversation entries to share.
    pub share_limit: usize,
    /// Expand file and directory references into payload blocks.
    pub reference_embed_contents: bool,
    /// Fraction of the context window the prompt may occupy, in percent.
    pub headroom_percent: u8,
    /// Model name used for window lookup.
    pub model: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        PromptConfig {
            share_context: true,
            share_limit: 5,
            reference_embed_contents: true,
            headroom_percent: 80,
            model: "llama3.1".to_string(),
        }
    }
}

/// Assembled prompt plus any user-facing notices produced along the way.
#[derive(Debug, Clone)]
pub struct BuiltPrompt {
    pub payload: String,
    pub notices: Vec<String>,
}

pub struct PromptBuilder {
    workspace: PathBuf,
    config: PromptConfig,
    estimator: Option<Arc<dyn TokenEstimator>>,
}

impl PromptBuilder {
    pub fn new(workspace: impl Into<PathBuf>, config: PromptConfig) -> Self {
        PromptBuilder { workspace: workspace.into(), config, estimator: None }
    }

    /// Enables the token guard.
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn config(&self) -> &PromptConfig {
        &self.config
    }

    /// Builds the outgoing prompt. `log` supplies shared context when
    /// `include_context` is set; references are resolved against the
    /// builder's workspace root.
    pub fn build(
        &self,
        user_text: &str,
        references: &[EntryReference],
        include_context: bool,
        log: Option<&ConversationLog>,
    ) -> BuiltPrompt {
        let mut notices = Vec::new();

        let mut context = Vec::new();
        if include_context && self.config.share_context {
            if let Some(log) = log {
                match log.retrieve(user_text, self.config.share_limit) {
                    Ok(entries) => {
                        context = entries
                            .iter()
                            .map(|e| format!("{}: {}", e.role.as_str(), e.text))
                            .collect();
                    }
                    Err(err) => {
                        warn!(event = "prompt_context_unavailable", error = %err);
                    }
                }
            }
        }

        let budget = self.estimator.as_ref().map(|est| {
            let window = est.context_window(&self.config.model);
            window * usize::from(self.config.headroom_percent) / 100
        });

        let mut base = self
            .estimator
            .as_ref()
            .map(|est| est.estimate(user_text) + context.iter().map(|l| est.estimate(l)).sum::<usize>());
        if let (Some(est), Some(budget), Some(tokens)) =
            (self.estimator.as_ref(), budget, base.as_mut())
        {
            let had_context = !context.is_empty();
            while *tokens > budget && !context.is_empty() {
                let dropped = context.remove(0);
                *tokens -= est.estimate(&dropped);
            }
            if *tokens > budget && had_context {
                notices.push("Shared context omitted to fit the model budget".to_string());
            }
        }

        let mut payloads = Vec::new();
        if self.config.reference_embed_contents {
            for reference in references {
                match self.reference_payload(reference) {
                    Some(payload) => payloads.push(payload),
                    None => notices.push(format!("Reference missing: {}", reference.path)),
                }
            }
        }

        let mut included = Vec::new();
        if let (Some(est), Some(budget), Some(tokens)) =
            (self.estimator.as_ref(), budget, base.as_mut())
        {
            let mut skipped = 0usize;
            for payload in payloads {
                let cost = est.estimate(&payload);
                if *tokens + cost <= budget {
                    *tokens += cost;
                    included.push(payload);
                } else {
                    skipped += 1;
                }
            }
            if skipped > 0 {
                notices.push(format!(
                    "Skipped {skipped} reference payload(s) to fit the model budget"
                ));
            }
        } else {
            included = payloads;
        }

        let mut sections = Vec::new();
        if !context.is_empty() {
            sections.push(context.join("\n"));
        }
        if !user_text.is_empty() {
            sections.push(user_text.to_string());
        }
        sections.extend(included);

        BuiltPrompt { payload: sections.join("\n\n"), notices }
    }

    /// Expands one reference into a payload block, or `None` if the path
    /// does not exist under the workspace.
    fn reference_payload(&self, reference: &EntryReference) -> Option<String> {
        let path = resolve(&self.workspace, &reference.path);
        match reference.kind {
            RefKind::Dir => {
                let mut names: Vec<String> = fs::read_dir(&path)
                    .ok()?
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .collect();
                names.sort();
                names.truncate(DIR_LISTING_LIMIT);
                Some(format!("Directory {}:\n{}", reference.path, names.join("\n")))
            }
            RefKind::File => {
                let bytes = fs::read(&path).ok()?;
                let contents = String::from_utf8_lossy(&bytes);
                if contents.trim().is_empty() {
                    Some(format!("File {} is empty.", reference.path))
                } else {
                    Some(format!("File {}:\n```\n{}\n```", reference.path, contents.trim_end()))
                }
            }
        }
    }
}

fn resolve(workspace: &Path, raw: &str) -> PathBuf {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        workspace.join(candidate)
    }
}
