//! Heuristic parser for Codex approval prompts.
//!
//! Codex asks for permission in loosely formatted text, often wrapped in
//! box-drawing borders. This crate turns an output delta into an ordered list
//! of [`ApprovalEvent`]s: plain text, structured prompts with action tokens,
//! and prompt dismissals. The rules live in [`ParserRules`] as data so they
//! can be tuned without touching the algorithm.

use std::collections::HashMap;

use regex::Regex;

use acagi_core::{ApprovalAction, ApprovalOptions, ApprovalPrompt};

/// One parsed event, in console order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalEvent {
    /// Plain output between prompts.
    Text(String),
    /// A structured approval prompt ready for widget rendering.
    Prompt(ApprovalPrompt),
    /// A line announcing that a pending prompt went away.
    Dismissal(String),
}

struct OptionPattern {
    re: Regex,
    /// Whether capture group 1 holds the token (true) or the label (false).
    token_first: bool,
}

/// Regex tables and alias maps driving the parser.
pub struct ParserRules {
    dismissal: Regex,
    interrogative: Regex,
    header_prefixes: Vec<&'static str>,
    header_phrases: Vec<&'static str>,
    option_patterns: Vec<OptionPattern>,
    aliases: HashMap<&'static str, ApprovalAction>,
    alias_word: Regex,
    numbered: Regex,
    bracketed: Regex,
    columns: Regex,
}

impl Default for ParserRules {
    fn default() -> Self {
        let option_patterns = vec![
            OptionPattern {
                re: Regex::new(r"^\[([^\]\s][^\]]{0,11})\]\s+(.+)$").expect("valid regex"),
                token_first: true,
            },
            OptionPattern {
                re: Regex::new(r"^\(([^)\s][^)]{0,11})\)\s+(.+)$").expect("valid regex"),
                token_first: true,
            },
            OptionPattern {
                re: Regex::new(r"^<([^>\s][^>]{0,11})>\s+(.+)$").expect("valid regex"),
                token_first: true,
            },
            OptionPattern {
                re: Regex::new(r"^([^\s()\[\]<>]{1,12})\)\s+(.+)$").expect("valid regex"),
                token_first: true,
            },
            OptionPattern {
                re: Regex::new(r"^([^\s:]{1,12}):\s+(.+)$").expect("valid regex"),
                token_first: true,
            },
            OptionPattern {
                re: Regex::new(r"^(\S{1,12})\s+-\s+(.+)$").expect("valid regex"),
                token_first: true,
            },
            OptionPattern {
                re: Regex::new(r"^([^\s.]{1,12})\.\s+(.+)$").expect("valid regex"),
                token_first: true,
            },
            OptionPattern {
                re: Regex::new(r"^(.{1,60}?)\s+\[([^\]]{1,12})\]$").expect("valid regex"),
                token_first: false,
            },
        ];

        let mut aliases: HashMap<&'static str, ApprovalAction> = HashMap::new();
        for alias in ["yes", "y", "approve", "allow", "run", "execute"] {
            aliases.insert(alias, ApprovalAction::Yes);
        }
        for alias in ["always", "a", "always allow", "always approve"] {
            aliases.insert(alias, ApprovalAction::Always);
        }
        for alias in ["no", "n", "deny", "don't", "cancel", "abort"] {
            aliases.insert(alias, ApprovalAction::No);
        }
        for alias in ["feedback", "f", "provide feedback", "report", "complaint"] {
            aliases.insert(alias, ApprovalAction::Feedback);
        }

        ParserRules {
            dismissal: Regex::new(r"(?i)(prompt|approval).*(dismissed|cancell?ed|aborted)")
                .expect("valid regex"),
            interrogative: Regex::new(r"(?i)\b(allow|approve|permission)\b.*\?")
                .expect("valid regex"),
            header_prefixes: vec![
                "select",
                "choose",
                "pick",
                "make a selection",
                "action required",
                "selection required",
            ],
            header_phrases: vec!["select an option", "choose an option", "make a selection"],
            option_patterns,
            aliases,
            alias_word: Regex::new(
                r"(?i)\b(yes|approve|allow|always|no|deny|don't|cancel|abort|feedback|report|complaint|run|execute)\b",
            )
            .expect("valid regex"),
            numbered: Regex::new(r"^\d{1,3}[.)]\s").expect("valid regex"),
            bracketed: Regex::new(r"\[[^\]]{1,20}\]").expect("valid regex"),
            columns: Regex::new(r"\s{2,}").expect("valid regex"),
        }
    }
}

impl ParserRules {
    fn is_dismissal(&self, line: &str) -> bool {
        !line.is_empty() && self.dismissal.is_match(line)
    }

    fn is_header(&self, line: &str) -> bool {
        if line.is_empty() {
            return false;
        }
        if self.interrogative.is_match(line) {
            return true;
        }
        let lower = line.to_lowercase();
        if self.header_prefixes.iter().any(|p| lower.starts_with(p)) {
            let interrogative_ish = lower.contains('?')
                || lower.contains("option")
                || lower.contains("action")
                || lower.contains("selection");
            if interrogative_ish {
                return true;
            }
        }
        self.header_phrases.iter().any(|p| lower.contains(p))
    }

    fn is_prompt_content(&self, line: &NormLine) -> bool {
        if line.text.is_empty() {
            return false;
        }
        line.indented
            || line.text.starts_with('>')
            || line.text.starts_with('-')
            || line.text.starts_with('\u{2022}')
            || self.bracketed.is_match(&line.text)
            || self.numbered.is_match(&line.text)
            || self.alias_word.is_match(&line.text)
    }

    fn action_for(&self, text: &str) -> Option<ApprovalAction> {
        let normalized = text
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        self.aliases.get(normalized.as_str()).copied()
    }

    /// Tries each single-line option form in order. A match only counts when
    /// the label or, failing that, the token maps to a known action.
    fn parse_option(&self, line: &str) -> Option<(ApprovalAction, String)> {
        for pattern in &self.option_patterns {
            if let Some(caps) = pattern.re.captures(line) {
                let (token, label) = if pattern.token_first {
                    (caps[1].trim().to_string(), caps[2].trim().to_string())
                } else {
                    (caps[2].trim().to_string(), caps[1].trim().to_string())
                };
                if let Some(action) = self.action_for(&label).or_else(|| self.action_for(&token)) {
                    return Some((action, token));
                }
            }
        }
        None
    }

    fn split_columns<'a>(&self, line: &'a str) -> Vec<&'a str> {
        self.columns
            .split(line)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Two-row table layout: a row of labels in columns, then a row of tokens
    /// in matching columns. Every label must map to an action.
    fn try_table(
        &self,
        labels_line: &NormLine,
        tokens_line: Option<&NormLine>,
    ) -> Option<Vec<(ApprovalAction, String)>> {
        let labels = self.split_columns(&labels_line.text);
        if labels.len() < 2 {
            return None;
        }
        let actions = labels
            .iter()
            .map(|label| self.action_for(label))
            .collect::<Option<Vec<_>>>()?;
        let tokens_line = tokens_line?;
        let mut tokens = self.split_columns(&tokens_line.text);
        if tokens.len() != actions.len() {
            tokens = tokens_line.text.split_whitespace().collect();
        }
        if tokens.len() != actions.len() {
            return None;
        }
        Some(
            actions
                .into_iter()
                .zip(tokens.into_iter().map(str::to_string))
                .collect(),
        )
    }
}

struct NormLine {
    text: String,
    indented: bool,
}

fn is_box_glyph(c: char) -> bool {
    ('\u{2500}'..='\u{259F}').contains(&c)
}

/// Strips CR, border glyph runs at either end, and surrounding whitespace.
/// `indented` reflects whether text sat after leading whitespace once the
/// border was removed.
fn normalize_line(raw: &str) -> NormLine {
    let no_cr = raw.strip_suffix('\r').unwrap_or(raw);
    let after_border = no_cr.trim_start_matches(is_box_glyph);
    let indented = after_border.starts_with(' ') || after_border.starts_with('\t');
    let trimmed = after_border
        .trim_end_matches(|c: char| is_box_glyph(c) || c.is_whitespace())
        .trim();
    NormLine {
        text: trimmed.to_string(),
        indented: indented && !trimmed.is_empty(),
    }
}

fn join_lines(lines: &[String]) -> String {
    lines.join("\n").trim().to_string()
}

/// Line-oriented approval prompt parser over [`ParserRules`].
pub struct ApprovalParser {
    rules: ParserRules,
}

impl Default for ApprovalParser {
    fn default() -> Self {
        ApprovalParser::new()
    }
}

impl ApprovalParser {
    pub fn new() -> Self {
        ApprovalParser { rules: ParserRules::default() }
    }

    pub fn with_rules(rules: ParserRules) -> Self {
        ApprovalParser { rules }
    }

    /// Parses one console output delta into ordered events. Text outside
    /// prompt blocks is buffered and flushed as non-empty [`ApprovalEvent::Text`]
    /// events; prompt blocks become [`ApprovalEvent::Prompt`]s with default
    /// tokens filled in for any action the block did not name.
    pub fn parse(&self, delta: &str) -> Vec<ApprovalEvent> {
        let lines: Vec<NormLine> = delta.lines().map(normalize_line).collect();
        let mut events = Vec::new();
        let mut text_buf: Vec<String> = Vec::new();
        let mut i = 0;
        while i < lines.len() {
            let line = &lines[i];
            if self.rules.is_dismissal(&line.text) {
                flush_text(&mut text_buf, &mut events);
                events.push(ApprovalEvent::Dismissal(line.text.clone()));
                i += 1;
                continue;
            }
            if self.rules.is_header(&line.text) {
                flush_text(&mut text_buf, &mut events);
                let (prompt, next) = self.collect_block(&lines, i);
                events.push(ApprovalEvent::Prompt(prompt));
                i = next;
                continue;
            }
            text_buf.push(line.text.clone());
            i += 1;
        }
        flush_text(&mut text_buf, &mut events);
        events
    }

    /// Collects the block starting at the header on `start` and returns the
    /// built prompt plus the index of the first line after the block. The
    /// block ends at the next header, a dismissal, or a pair of blank lines
    /// followed by a line that does not look like prompt content.
    fn collect_block(&self, lines: &[NormLine], start: usize) -> (ApprovalPrompt, usize) {
        let header = lines[start].text.clone();
        let mut block: Vec<&NormLine> = Vec::new();
        let mut blanks = 0;
        let mut j = start + 1;
        while j < lines.len() {
            let line = &lines[j];
            if self.rules.is_header(&line.text) || self.rules.is_dismissal(&line.text) {
                break;
            }
            if line.text.is_empty() {
                blanks += 1;
                block.push(line);
                j += 1;
                continue;
            }
            if blanks >= 2 && !self.rules.is_prompt_content(line) {
                break;
            }
            blanks = 0;
            block.push(line);
            j += 1;
        }

        let mut options = ApprovalOptions::default();
        let mut body: Vec<String> = Vec::new();
        let mut idx = 0;
        while idx < block.len() {
            let line = block[idx];
            if line.text.is_empty() {
                body.push(String::new());
                idx += 1;
                continue;
            }
            if let Some(pairs) = self.rules.try_table(line, block.get(idx + 1).copied()) {
                for (action, token) in pairs {
                    options.set_token(action, token);
                }
                idx += 2;
                continue;
            }
            if let Some((action, token)) = self.rules.parse_option(&line.text) {
                options.set_token(action, token);
                idx += 1;
                continue;
            }
            body.push(line.text.clone());
            idx += 1;
        }

        let prompt = ApprovalPrompt { header, body: join_lines(&body), options };
        (prompt, j)
    }
}

fn flush_text(buf: &mut Vec<String>, events: &mut Vec<ApprovalEvent>) {
    if buf.is_empty() {
        return;
    }
    let joined = join_lines(buf);
    buf.clear();
    if !joined.is_empty() {
        events.push(ApprovalEvent::Text(joined));
    }
}
