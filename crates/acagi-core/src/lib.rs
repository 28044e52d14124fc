use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod bus;

pub const TASK_ID_PREFIX: &str = "tsk_";

/// Mint a session token: wall-clock prefix plus a random tail so two
/// sessions started within the same second still differ.
pub fn new_session_token() -> String {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let tail = Uuid::new_v4().simple().to_string();
    format!("{}-{}", stamp, &tail[..8])
}

pub fn new_task_id() -> String {
    format!("{}{}", TASK_ID_PREFIX, Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    pub created_ts: DateTime<Utc>,
    pub updated_ts: DateTime<Utc>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub diffs: DiffStat,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub run_log_path: Option<String>,
    #[serde(default)]
    pub codex_conversation_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

impl Task {
    pub fn new(title: impl Into<String>, session_id: impl Into<String>, source: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_task_id(),
            title: title.into(),
            status: TaskStatus::Open,
            created_ts: now,
            updated_ts: now,
            session_id: session_id.into(),
            source: source.into(),
            labels: Vec::new(),
            diffs: DiffStat::default(),
            files: Vec::new(),
            run_log_path: None,
            codex_conversation_id: None,
            parent_id: None,
            extra: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Open,
    Merged,
    Closed,
    Cancelled,
    Failed,
    Deleted,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Open
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::Merged => "merged",
            TaskStatus::Closed => "closed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Failed => "failed",
            TaskStatus::Deleted => "deleted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Merged | TaskStatus::Closed | TaskStatus::Cancelled | TaskStatus::Deleted
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "open" => Ok(TaskStatus::Open),
            "merged" => Ok(TaskStatus::Merged),
            "closed" => Ok(TaskStatus::Closed),
            "cancelled" | "canceled" => Ok(TaskStatus::Cancelled),
            "failed" => Ok(TaskStatus::Failed),
            "deleted" => Ok(TaskStatus::Deleted),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffStat {
    #[serde(default)]
    pub added: u64,
    #[serde(default)]
    pub removed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub ts: DateTime<Utc>,
    pub task_id: String,
    pub event: TaskEventKind,
    pub by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl TaskEvent {
    pub fn new(task_id: impl Into<String>, event: TaskEventKind, by: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            task_id: task_id.into(),
            event,
            by: by.into(),
            to: None,
            data: None,
        }
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskEventKind {
    Created,
    Status,
    Note,
    Run,
}

impl TaskEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEventKind::Created => "created",
            TaskEventKind::Status => "status",
            TaskEventKind::Note => "note",
            TaskEventKind::Run => "run",
        }
    }
}

impl fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffSnapshot {
    pub ts: DateTime<Utc>,
    pub task_id: String,
    pub added: u64,
    pub removed: u64,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub ts: DateTime<Utc>,
    pub level: String,
    pub kind: String,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl ErrorRecord {
    pub fn new(level: impl Into<String>, kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            level: level.into(),
            kind: kind.into(),
            msg: msg.into(),
            path: None,
            task_id: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationRole {
    User,
    Assistant,
    System,
}

impl ConversationRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationRole::User => "user",
            ConversationRole::Assistant => "assistant",
            ConversationRole::System => "system",
        }
    }

    /// Capitalized form used in the markdown mirror.
    pub fn display_name(&self) -> &'static str {
        match self {
            ConversationRole::User => "User",
            ConversationRole::Assistant => "Assistant",
            ConversationRole::System => "System",
        }
    }
}

impl fmt::Display for ConversationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationRole {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "user" => Ok(ConversationRole::User),
            "assistant" => Ok(ConversationRole::Assistant),
            "system" => Ok(ConversationRole::System),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    File,
    Dir,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryReference {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: RefKind,
}

impl EntryReference {
    pub fn file(path: impl Into<String>) -> Self {
        Self { path: path.into(), kind: RefKind::File }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        Self { path: path.into(), kind: RefKind::Dir }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub timestamp: DateTime<Utc>,
    pub role: ConversationRole,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<Vec<EntryReference>>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalAction {
    Yes,
    Always,
    No,
    Feedback,
}

impl ApprovalAction {
    pub const ALL: [ApprovalAction; 4] = [
        ApprovalAction::Yes,
        ApprovalAction::Always,
        ApprovalAction::No,
        ApprovalAction::Feedback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalAction::Yes => "yes",
            ApprovalAction::Always => "always",
            ApprovalAction::No => "no",
            ApprovalAction::Feedback => "feedback",
        }
    }

    /// Button title shown on approval widgets.
    pub fn display_name(&self) -> &'static str {
        match self {
            ApprovalAction::Yes => "Yes",
            ApprovalAction::Always => "Always",
            ApprovalAction::No => "No",
            ApprovalAction::Feedback => "Feedback",
        }
    }
}

impl fmt::Display for ApprovalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token table for one approval prompt. Starts from the stock Codex tokens
/// and is overwritten per-action by whatever the parser extracted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalOptions {
    pub yes: String,
    pub always: String,
    pub no: String,
    pub feedback: String,
}

impl Default for ApprovalOptions {
    fn default() -> Self {
        Self {
            yes: "y".to_string(),
            always: "always".to_string(),
            no: "n".to_string(),
            feedback: "feedback".to_string(),
        }
    }
}

impl ApprovalOptions {
    pub fn token(&self, action: ApprovalAction) -> &str {
        match action {
            ApprovalAction::Yes => &self.yes,
            ApprovalAction::Always => &self.always,
            ApprovalAction::No => &self.no,
            ApprovalAction::Feedback => &self.feedback,
        }
    }

    pub fn set_token(&mut self, action: ApprovalAction, token: impl Into<String>) {
        let token = token.into();
        match action {
            ApprovalAction::Yes => self.yes = token,
            ApprovalAction::Always => self.always = token,
            ApprovalAction::No => self.no = token,
            ApprovalAction::Feedback => self.feedback = token,
        }
    }

    pub fn tokens(&self) -> [&str; 4] {
        ApprovalAction::ALL.map(|action| self.token(action))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalPrompt {
    pub header: String,
    pub body: String,
    pub options: ApprovalOptions,
}
