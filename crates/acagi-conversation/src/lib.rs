use acagi_core::{ConversationEntry, ConversationRole, EntryReference};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod rollover;

use rollover::{rollover_decision, threshold_decision, token_slug, ArchiveReason};

pub const MARKDOWN_FILE: &str = "conversation.md";
pub const JSONL_FILE: &str = "conversation.jsonl";
pub const VEC_FILE: &str = "conversation.vec";
pub const META_FILE: &str = "session.meta.json";
pub const ARCHIVES_DIR: &str = "archives";
pub const MARKDOWN_HEADER: &str = "# Conversation\n\n";

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

fn io_err(path: &Path, source: std::io::Error) -> ConversationError {
    ConversationError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Produces embedding vectors for transcript retrieval. Failures are soft;
/// the log degrades to recency ordering when the embedder misbehaves.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, String>;
}

#[derive(Debug, Clone)]
pub struct ConversationConfig {
    pub max_entries: usize,
    pub max_bytes: u64,
    /// Best-effort mirror for archived sessions, typically a repo-local
    /// "Archived Conversations" folder.
    pub archive_mirror: Option<PathBuf>,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            max_bytes: 2 * 1024 * 1024,
            archive_mirror: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionMeta {
    id: String,
    updated: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ArchiveMeta {
    reason: String,
    archived_at: DateTime<Utc>,
    session_token: String,
    source: String,
    entry_count: usize,
    total_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationSource {
    Live,
    Archive,
}

impl ConversationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationSource::Live => "live",
            ConversationSource::Archive => "archive",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConversation {
    pub source: ConversationSource,
    pub session_token: String,
    pub dir: PathBuf,
    pub jsonl: PathBuf,
    pub markdown: PathBuf,
}

struct LogState {
    entry_count: usize,
}

/// Session transcript over three aligned files: a human-readable markdown
/// mirror, the JSONL record of truth, and an optional embedding sidecar with
/// one vector line per JSONL line. One mutex serializes every file op;
/// outside readers open the files read-only and tolerate rotation.
pub struct ConversationLog {
    root: PathBuf,
    session_token: String,
    config: ConversationConfig,
    embedder: Option<Arc<dyn Embedder>>,
    state: Mutex<LogState>,
}

impl ConversationLog {
    pub fn open(
        root: impl Into<PathBuf>,
        session_token: impl Into<String>,
        config: ConversationConfig,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Result<Self, ConversationError> {
        let root = root.into();
        let session_token = session_token.into();
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;

        let log = Self {
            root,
            session_token,
            config,
            embedder,
            state: Mutex::new(LogState { entry_count: 0 }),
        };

        let mut state = log.state.lock().unwrap();
        state.entry_count = log.count_jsonl_lines();

        let stored = log.read_meta_token();
        if let Some(archived_token) =
            rollover_decision(stored.as_deref(), &log.session_token, state.entry_count > 0)
        {
            log.archive_locked(&mut state, ArchiveReason::SessionRollover, &archived_token)?;
        }

        log.write_meta()?;
        log.ensure_header()?;
        drop(state);
        Ok(log)
    }

    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().unwrap().entry_count
    }

    /// Append one turn. Thresholds are checked before the write, so the
    /// entry that reaches a cap lands in a fresh live file while its
    /// predecessors move into an archive.
    pub fn append(
        &self,
        role: ConversationRole,
        text: &str,
        images: &[String],
        references: Option<&[EntryReference]>,
    ) -> Result<ConversationEntry, ConversationError> {
        let mut state = self.state.lock().unwrap();

        if threshold_decision(
            state.entry_count,
            self.total_bytes(),
            self.config.max_entries,
            self.config.max_bytes,
        ) {
            self.archive_locked(&mut state, ArchiveReason::LengthThreshold, &self.session_token)?;
            self.write_meta()?;
            self.ensure_header()?;
        }

        let entry = ConversationEntry {
            timestamp: Utc::now(),
            role,
            text: text.to_string(),
            references: references.map(|r| r.to_vec()),
            extra: Default::default(),
        };

        self.ensure_header()?;
        let mut block = format!("\n**{}:**\n\n{}\n\n", role.display_name(), text);
        for image in images {
            block.push_str(&format!("![image](images/{image})\n"));
        }
        self.append_to(&self.root.join(MARKDOWN_FILE), &block)?;

        let line = serde_json::to_string(&entry)?;
        self.append_to(&self.root.join(JSONL_FILE), &format!("{line}\n"))?;

        if let Some(embedder) = &self.embedder {
            let vector = if text.trim().is_empty() {
                Vec::new()
            } else {
                match embedder.embed(text) {
                    Ok(v) => v,
                    Err(err) => {
                        warn!(event = "embed_failed", error = %err);
                        Vec::new()
                    }
                }
            };
            let line = serde_json::to_string(&vector)?;
            self.append_to(&self.root.join(VEC_FILE), &format!("{line}\n"))?;
        }

        state.entry_count += 1;
        Ok(entry)
    }

    /// Last `k` entries in chronological order.
    pub fn recent(&self, k: usize) -> Result<Vec<ConversationEntry>, ConversationError> {
        let _state = self.state.lock().unwrap();
        let entries = self.read_entries()?;
        let start = entries.len().saturating_sub(k);
        Ok(entries[start..].to_vec())
    }

    /// Embedding-ranked lookup over the live session. Falls back to recency
    /// when no embedder is configured or the query cannot be embedded.
    pub fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ConversationEntry>, ConversationError> {
        let embedder = match &self.embedder {
            Some(embedder) => Arc::clone(embedder),
            None => return self.recent(k),
        };
        let query_vec = match embedder.embed(query) {
            Ok(v) if !v.is_empty() => v,
            Ok(_) => return self.recent(k),
            Err(err) => {
                warn!(event = "retrieve_embed_failed", error = %err);
                return self.recent(k);
            }
        };

        let _state = self.state.lock().unwrap();
        let entries = self.read_entries()?;
        let vectors = self.read_vectors()?;

        let mut scored: Vec<(f32, ConversationEntry)> = entries
            .into_iter()
            .zip(vectors)
            .filter(|(_, v)| !v.is_empty())
            .map(|(entry, v)| (cosine(&query_vec, &v), entry))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(k).map(|(_, entry)| entry).collect())
    }

    /// Match an identifier against the live session first, then archived
    /// sessions newest-first.
    pub fn resolve_conversation(&self, identifier: &str) -> Result<Option<ResolvedConversation>, ConversationError> {
        if identifier == self.session_token {
            return Ok(Some(ResolvedConversation {
                source: ConversationSource::Live,
                session_token: self.session_token.clone(),
                dir: self.root.clone(),
                jsonl: self.root.join(JSONL_FILE),
                markdown: self.root.join(MARKDOWN_FILE),
            }));
        }

        let archives = self.root.join(ARCHIVES_DIR);
        let mut dirs: Vec<PathBuf> = match fs::read_dir(&archives) {
            Ok(read) => read
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_dir())
                .collect(),
            Err(_) => return Ok(None),
        };
        dirs.sort();
        dirs.reverse();

        for dir in dirs {
            let meta_path = dir.join("meta.json");
            let Ok(raw) = fs::read_to_string(&meta_path) else {
                continue;
            };
            let Ok(meta) = serde_json::from_str::<ArchiveMeta>(&raw) else {
                warn!(event = "archive_meta_unreadable", path = %meta_path.display());
                continue;
            };
            if meta.session_token == identifier {
                return Ok(Some(ResolvedConversation {
                    source: ConversationSource::Archive,
                    session_token: meta.session_token,
                    dir: dir.clone(),
                    jsonl: dir.join(JSONL_FILE),
                    markdown: dir.join(MARKDOWN_FILE),
                }));
            }
        }
        Ok(None)
    }

    fn archive_locked(
        &self,
        state: &mut LogState,
        reason: ArchiveReason,
        token: &str,
    ) -> Result<Option<PathBuf>, ConversationError> {
        let jsonl = self.root.join(JSONL_FILE);
        let entry_count = self.count_jsonl_lines();
        if entry_count == 0 {
            debug!(event = "archive_skipped_empty", token = %token);
            return Ok(None);
        }
        let total_bytes = self.total_bytes();

        let archives = self.root.join(ARCHIVES_DIR);
        fs::create_dir_all(&archives).map_err(|e| io_err(&archives, e))?;
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let base = format!("{}_{}", stamp, token_slug(token));
        let mut dest = archives.join(&base);
        let mut suffix = 1;
        while dest.exists() {
            suffix += 1;
            dest = archives.join(format!("{base}-{suffix}"));
        }
        fs::create_dir_all(&dest).map_err(|e| io_err(&dest, e))?;

        for name in [MARKDOWN_FILE, JSONL_FILE, VEC_FILE] {
            let from = self.root.join(name);
            if from.exists() {
                let to = dest.join(name);
                fs::rename(&from, &to).map_err(|e| io_err(&from, e))?;
            }
        }

        let meta = ArchiveMeta {
            reason: reason.as_str().to_string(),
            archived_at: Utc::now(),
            session_token: token.to_string(),
            source: self.root.to_string_lossy().into_owned(),
            entry_count,
            total_bytes,
        };
        let meta_path = dest.join("meta.json");
        fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)
            .map_err(|e| io_err(&meta_path, e))?;

        if let Some(mirror_root) = &self.config.archive_mirror {
            if let Some(name) = dest.file_name() {
                if let Err(err) = mirror_dir(&dest, &mirror_root.join(name)) {
                    warn!(event = "archive_mirror_failed", error = %err);
                }
            }
        }

        self.ensure_header()?;
        File::create(&jsonl).map_err(|e| io_err(&jsonl, e))?;
        state.entry_count = 0;
        info!(
            event = "conversation_archived",
            reason = %reason,
            token = %token,
            entries = entry_count,
            dest = %dest.display()
        );
        Ok(Some(dest))
    }

    fn ensure_header(&self) -> Result<(), ConversationError> {
        let path = self.root.join(MARKDOWN_FILE);
        let needs_header = match fs::metadata(&path) {
            Ok(meta) => meta.len() == 0,
            Err(_) => true,
        };
        if needs_header {
            fs::write(&path, MARKDOWN_HEADER).map_err(|e| io_err(&path, e))?;
        }
        Ok(())
    }

    fn write_meta(&self) -> Result<(), ConversationError> {
        let meta = SessionMeta {
            id: self.session_token.clone(),
            updated: Utc::now(),
        };
        let path = self.root.join(META_FILE);
        fs::write(&path, serde_json::to_string_pretty(&meta)?).map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    fn read_meta_token(&self) -> Option<String> {
        let raw = fs::read_to_string(self.root.join(META_FILE)).ok()?;
        let meta: SessionMeta = serde_json::from_str(&raw).ok()?;
        Some(meta.id)
    }

    fn count_jsonl_lines(&self) -> usize {
        match fs::read_to_string(self.root.join(JSONL_FILE)) {
            Ok(contents) => contents.lines().filter(|l| !l.trim().is_empty()).count(),
            Err(_) => 0,
        }
    }

    fn total_bytes(&self) -> u64 {
        [MARKDOWN_FILE, JSONL_FILE, VEC_FILE]
            .iter()
            .map(|name| {
                fs::metadata(self.root.join(name))
                    .map(|m| m.len())
                    .unwrap_or(0)
            })
            .sum()
    }

    fn read_entries(&self) -> Result<Vec<ConversationEntry>, ConversationError> {
        let path = self.root.join(JSONL_FILE);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(_) => return Ok(Vec::new()),
        };
        let mut entries = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ConversationEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(event = "conversation_line_skipped", error = %err),
            }
        }
        Ok(entries)
    }

    fn read_vectors(&self) -> Result<Vec<Vec<f32>>, ConversationError> {
        let path = self.root.join(VEC_FILE);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(_) => return Ok(Vec::new()),
        };
        let mut vectors = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Vec<f32>>(line) {
                Ok(vector) => vectors.push(vector),
                Err(_) => vectors.push(Vec::new()),
            }
        }
        Ok(vectors)
    }

    fn append_to(&self, path: &Path, contents: &str) -> Result<(), ConversationError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| io_err(path, e))?;
        file.write_all(contents.as_bytes())
            .map_err(|e| io_err(path, e))?;
        file.flush().map_err(|e| io_err(path, e))?;
        Ok(())
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    if len == 0 {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for i in 0..len {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn mirror_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.path().is_dir() {
            mirror_dir(&entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct KeywordEmbedder;

    impl Embedder for KeywordEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
            let lower = text.to_lowercase();
            Ok(vec![
                if lower.contains("parser") { 1.0 } else { 0.0 },
                if lower.contains("bridge") { 1.0 } else { 0.0 },
                if lower.contains("archive") { 1.0 } else { 0.0 },
            ])
        }
    }

    struct FailingEmbedder;

    impl Embedder for FailingEmbedder {
        fn embed(&self, _text: &str) -> Result<Vec<f32>, String> {
            Err("runtime offline".to_string())
        }
    }

    fn open_plain(root: &Path, token: &str) -> ConversationLog {
        ConversationLog::open(root, token, ConversationConfig::default(), None).unwrap()
    }

    #[test]
    fn append_mirrors_markdown_and_jsonl() {
        let dir = tempdir().unwrap();
        let log = open_plain(dir.path(), "session-a");

        log.append(ConversationRole::User, "hello codex", &[], None).unwrap();
        log.append(ConversationRole::Assistant, "hello user", &[], None).unwrap();

        let md = fs::read_to_string(dir.path().join(MARKDOWN_FILE)).unwrap();
        assert!(md.starts_with(MARKDOWN_HEADER));
        assert!(md.contains("**User:**\n\nhello codex"));
        assert!(md.contains("**Assistant:**\n\nhello user"));

        let entries = log.recent(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].role, ConversationRole::User);
        assert_eq!(entries[1].text, "hello user");
        assert_eq!(log.entry_count(), 2);
    }

    #[test]
    fn images_land_in_markdown_only() {
        let dir = tempdir().unwrap();
        let log = open_plain(dir.path(), "session-a");
        log.append(
            ConversationRole::User,
            "see screenshot",
            &["shot.png".to_string()],
            None,
        )
        .unwrap();

        let md = fs::read_to_string(dir.path().join(MARKDOWN_FILE)).unwrap();
        assert!(md.contains("![image](images/shot.png)"));
        let jsonl = fs::read_to_string(dir.path().join(JSONL_FILE)).unwrap();
        assert!(!jsonl.contains("shot.png"));
    }

    #[test]
    fn references_persist_in_jsonl() {
        let dir = tempdir().unwrap();
        let log = open_plain(dir.path(), "session-a");
        log.append(
            ConversationRole::User,
            "look here",
            &[],
            Some(&[EntryReference::file("src/lib.rs")]),
        )
        .unwrap();
        let entries = log.recent(1).unwrap();
        assert_eq!(
            entries[0].references.as_ref().unwrap()[0].path,
            "src/lib.rs"
        );
    }

    #[test]
    fn session_rollover_archives_previous_logs() {
        let dir = tempdir().unwrap();
        {
            let log = open_plain(dir.path(), "session-a");
            log.append(ConversationRole::User, "first", &[], None).unwrap();
            log.append(ConversationRole::Assistant, "second", &[], None).unwrap();
        }

        let log = open_plain(dir.path(), "session-b");
        assert_eq!(log.entry_count(), 0);

        let archives: Vec<_> = fs::read_dir(dir.path().join(ARCHIVES_DIR))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(archives.len(), 1);
        let archive_dir = archives[0].path();
        assert!(archive_dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("_session-a"));

        let jsonl = fs::read_to_string(archive_dir.join(JSONL_FILE)).unwrap();
        assert_eq!(jsonl.lines().count(), 2);
        let meta: ArchiveMeta =
            serde_json::from_str(&fs::read_to_string(archive_dir.join("meta.json")).unwrap()).unwrap();
        assert_eq!(meta.reason, "session-rollover");
        assert_eq!(meta.entry_count, 2);
        assert_eq!(meta.session_token, "session-a");

        let live = fs::read_to_string(dir.path().join(JSONL_FILE)).unwrap();
        assert!(live.is_empty());
        let md = fs::read_to_string(dir.path().join(MARKDOWN_FILE)).unwrap();
        assert_eq!(md, MARKDOWN_HEADER);
    }

    #[test]
    fn resolve_finds_live_then_archive() {
        let dir = tempdir().unwrap();
        {
            let log = open_plain(dir.path(), "session-a");
            log.append(ConversationRole::User, "past", &[], None).unwrap();
        }
        let log = open_plain(dir.path(), "session-b");
        log.append(ConversationRole::User, "present", &[], None).unwrap();

        let live = log.resolve_conversation("session-b").unwrap().unwrap();
        assert_eq!(live.source, ConversationSource::Live);
        assert_eq!(live.jsonl, dir.path().join(JSONL_FILE));

        let archived = log.resolve_conversation("session-a").unwrap().unwrap();
        assert_eq!(archived.source, ConversationSource::Archive);
        let contents = fs::read_to_string(&archived.jsonl).unwrap();
        assert!(contents.contains("past"));

        assert!(log.resolve_conversation("session-zz").unwrap().is_none());
    }

    #[test]
    fn reopening_same_token_keeps_live_logs() {
        let dir = tempdir().unwrap();
        {
            let log = open_plain(dir.path(), "session-a");
            log.append(ConversationRole::User, "kept", &[], None).unwrap();
        }
        let log = open_plain(dir.path(), "session-a");
        assert_eq!(log.entry_count(), 1);
        assert!(!dir.path().join(ARCHIVES_DIR).exists());
    }

    #[test]
    fn logs_without_meta_archive_as_unknown_predecessor() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(MARKDOWN_FILE), MARKDOWN_HEADER).unwrap();
        fs::write(
            dir.path().join(JSONL_FILE),
            "{\"timestamp\":\"2026-08-22T10:00:00Z\",\"role\":\"user\",\"text\":\"orphan\"}\n",
        )
        .unwrap();

        let _log = open_plain(dir.path(), "session-b");
        let archives: Vec<_> = fs::read_dir(dir.path().join(ARCHIVES_DIR))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(archives.len(), 1);
        let name = archives[0].file_name().to_string_lossy().into_owned();
        assert!(name.ends_with("_unknown"));
    }

    #[test]
    fn entry_threshold_archives_on_reaching_cap() {
        let dir = tempdir().unwrap();
        let config = ConversationConfig {
            max_entries: 2,
            ..ConversationConfig::default()
        };
        let log = ConversationLog::open(dir.path(), "session-a", config, None).unwrap();

        log.append(ConversationRole::User, "one", &[], None).unwrap();
        log.append(ConversationRole::User, "two", &[], None).unwrap();
        log.append(ConversationRole::User, "three", &[], None).unwrap();

        let archives: Vec<_> = fs::read_dir(dir.path().join(ARCHIVES_DIR))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(archives.len(), 1);
        let meta: ArchiveMeta = serde_json::from_str(
            &fs::read_to_string(archives[0].path().join("meta.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(meta.reason, "length-threshold");
        assert_eq!(meta.entry_count, 2);

        let live = fs::read_to_string(dir.path().join(JSONL_FILE)).unwrap();
        assert_eq!(live.lines().count(), 1);
        assert!(live.contains("three"));
        assert_eq!(log.entry_count(), 1);
    }

    #[test]
    fn byte_threshold_archives_before_next_append() {
        let dir = tempdir().unwrap();
        let config = ConversationConfig {
            max_bytes: 120,
            ..ConversationConfig::default()
        };
        let log = ConversationLog::open(dir.path(), "session-a", config, None).unwrap();

        log.append(ConversationRole::User, "a fairly long first message", &[], None).unwrap();
        // Files are past the byte cap now, so this append rolls first.
        log.append(ConversationRole::User, "tail", &[], None).unwrap();

        let archives: Vec<_> = fs::read_dir(dir.path().join(ARCHIVES_DIR))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(archives.len(), 1);
        let live = fs::read_to_string(dir.path().join(JSONL_FILE)).unwrap();
        assert_eq!(live.lines().count(), 1);
        assert!(live.contains("tail"));
    }

    #[test]
    fn vec_sidecar_stays_aligned_with_jsonl() {
        let dir = tempdir().unwrap();
        let log = ConversationLog::open(
            dir.path(),
            "session-a",
            ConversationConfig::default(),
            Some(Arc::new(KeywordEmbedder)),
        )
        .unwrap();

        log.append(ConversationRole::User, "the parser", &[], None).unwrap();
        log.append(ConversationRole::User, "", &[], None).unwrap();
        log.append(ConversationRole::User, "the bridge", &[], None).unwrap();

        let jsonl = fs::read_to_string(dir.path().join(JSONL_FILE)).unwrap();
        let vec = fs::read_to_string(dir.path().join(VEC_FILE)).unwrap();
        assert_eq!(jsonl.lines().count(), 3);
        assert_eq!(vec.lines().count(), 3);
        assert_eq!(vec.lines().nth(1).unwrap(), "[]");
    }

    #[test]
    fn failing_embedder_writes_placeholder_vector() {
        let dir = tempdir().unwrap();
        let log = ConversationLog::open(
            dir.path(),
            "session-a",
            ConversationConfig::default(),
            Some(Arc::new(FailingEmbedder)),
        )
        .unwrap();
        log.append(ConversationRole::User, "anything", &[], None).unwrap();
        let vec = fs::read_to_string(dir.path().join(VEC_FILE)).unwrap();
        assert_eq!(vec.trim(), "[]");
    }

    #[test]
    fn retrieve_ranks_by_similarity() {
        let dir = tempdir().unwrap();
        let log = ConversationLog::open(
            dir.path(),
            "session-a",
            ConversationConfig::default(),
            Some(Arc::new(KeywordEmbedder)),
        )
        .unwrap();

        log.append(ConversationRole::User, "fix the parser bug", &[], None).unwrap();
        log.append(ConversationRole::User, "restart the bridge", &[], None).unwrap();
        log.append(ConversationRole::User, "archive old sessions", &[], None).unwrap();

        let hits = log.retrieve("why does the parser fail", 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("parser"));
    }

    #[test]
    fn retrieve_without_embedder_falls_back_to_recent() {
        let dir = tempdir().unwrap();
        let log = open_plain(dir.path(), "session-a");
        log.append(ConversationRole::User, "alpha", &[], None).unwrap();
        log.append(ConversationRole::User, "beta", &[], None).unwrap();
        let hits = log.retrieve("anything", 1).unwrap();
        assert_eq!(hits[0].text, "beta");
    }

    #[test]
    fn archive_mirror_receives_best_effort_copy() {
        let dir = tempdir().unwrap();
        let mirror = tempdir().unwrap();
        {
            let config = ConversationConfig {
                archive_mirror: Some(mirror.path().to_path_buf()),
                ..ConversationConfig::default()
            };
            let log = ConversationLog::open(dir.path(), "session-a", config, None).unwrap();
            log.append(ConversationRole::User, "mirrored", &[], None).unwrap();
        }
        {
            let config = ConversationConfig {
                archive_mirror: Some(mirror.path().to_path_buf()),
                ..ConversationConfig::default()
            };
            let _log = ConversationLog::open(dir.path(), "session-b", config, None).unwrap();
        }

        let mirrored: Vec<_> = fs::read_dir(mirror.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(mirrored.len(), 1);
        let jsonl = fs::read_to_string(mirrored[0].path().join(JSONL_FILE)).unwrap();
        assert!(jsonl.contains("mirrored"));
    }

    #[test]
    fn markdown_blocks_track_jsonl_lines() {
        let dir = tempdir().unwrap();
        let log = open_plain(dir.path(), "session-a");
        let turns = [
            (ConversationRole::User, "q1"),
            (ConversationRole::Assistant, "a1"),
            (ConversationRole::System, "notice"),
        ];
        for (role, text) in &turns {
            log.append(*role, text, &[], None).unwrap();
        }

        let md = fs::read_to_string(dir.path().join(MARKDOWN_FILE)).unwrap();
        let entries = log.recent(10).unwrap();
        assert_eq!(entries.len(), turns.len());
        for entry in &entries {
            let block = format!("**{}:**\n\n{}", entry.role.display_name(), entry.text);
            assert!(md.contains(&block), "missing block for {}", entry.text);
        }
        let order: Vec<_> = turns
            .iter()
            .map(|(_, text)| md.find(text).unwrap())
            .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]));
    }
}
