//! Whole-file-rewrite source for Gemini CLI sessions (spec §4.5).
//!
//! Gemini rewrites its session JSON file wholesale on every update, and
//! names its per-project directory after a one-way SHA-256 hash of the
//! working directory, so discovery must first recover `hash -> cwd` by
//! scanning the live process table. Parsing always yields *absolute*
//! counters; this source converts them to deltas against its own
//! `prevCounts` cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;
use sysinfo::System;

use crate::error::{DiscoverError, ParseError, DEFAULT_MAX_FILE_LEN};
use crate::parser::hash_project_path;

use super::{Activity, SessionHandle, Source, SourceUpdate};

pub struct GeminiSource {
    root: PathBuf,
    discover_window: Duration,
    hash_to_path: HashMap<String, String>,
    last_parsed: HashMap<PathBuf, i64>,
    prev_counts: HashMap<PathBuf, (u64, u64)>,
    system: System,
}

impl GeminiSource {
    pub fn new(home: &Path, discover_window: Duration) -> Self {
        Self {
            root: home.join(".gemini").join("tmp"),
            discover_window,
            hash_to_path: HashMap::new(),
            last_parsed: HashMap::new(),
            prev_counts: HashMap::new(),
            system: System::new(),
        }
    }

    fn refresh_hash_to_path(&mut self) {
        self.system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
        for process in self.system.processes().values() {
            let exe_name = process
                .name()
                .to_str()
                .map(str::to_string)
                .unwrap_or_default();
            let is_gemini_like = exe_name == "gemini"
                || ((exe_name == "node" || exe_name == "npx")
                    && process.cmd().iter().any(|arg| {
                        let arg = arg.to_string_lossy();
                        arg.contains("gemini") && !arg.contains("node_modules/.bin/")
                    }));
            if !is_gemini_like {
                continue;
            }
            let Some(cwd) = process.cwd() else { continue };
            let cwd_str = cwd.to_string_lossy().into_owned();
            let hash = hash_project_path(&cwd_str);
            self.hash_to_path.insert(hash, cwd_str);
        }
    }
}

#[async_trait]
impl Source for GeminiSource {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn discover(&mut self) -> Result<Vec<SessionHandle>, DiscoverError> {
        self.refresh_hash_to_path();

        let mut handles = Vec::new();
        let mut active_hashes = std::collections::HashSet::new();
        let mut active_paths = std::collections::HashSet::new();
        let now = SystemTime::now();

        let hash_dirs = match std::fs::read_dir(&self.root) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.prune(&active_hashes, &active_paths);
                return Ok(handles);
            }
            Err(e) => return Err(DiscoverError::walk(&self.root, e)),
        };

        for hash_entry in hash_dirs.flatten() {
            let hash = hash_entry.file_name().to_string_lossy().into_owned();
            let chats_dir = hash_entry.path().join("chats");
            let Ok(files) = std::fs::read_dir(&chats_dir) else { continue };

            for file_entry in files.flatten() {
                let path = file_entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Ok(metadata) = file_entry.metadata() else { continue };
                let Ok(modified) = metadata.modified() else { continue };
                let age = now.duration_since(modified).unwrap_or_default();
                if age > self.discover_window {
                    continue;
                }

                active_hashes.insert(hash.clone());
                active_paths.insert(path.clone());

                let session_id = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();
                let working_dir = self.hash_to_path.get(&hash).cloned();

                handles.push(SessionHandle {
                    source: "gemini",
                    session_id,
                    log_path: path,
                    working_dir,
                    started_at: None,
                    known_slug: None,
                    known_subagent_parents: HashMap::new(),
                });
            }
        }

        self.prune(&active_hashes, &active_paths);
        Ok(handles)
    }

    async fn parse(
        &mut self,
        handle: &SessionHandle,
        _offset: i64,
    ) -> Result<(SourceUpdate, i64), ParseError> {
        let metadata = std::fs::metadata(&handle.log_path).map_err(|e| ParseError::io(&handle.log_path, e))?;
        if metadata.len() > DEFAULT_MAX_FILE_LEN {
            return Err(ParseError::ExceedsMax {
                path: handle.log_path.clone(),
                size: metadata.len(),
                max: DEFAULT_MAX_FILE_LEN,
            });
        }
        let mtime_nanos = mtime_as_nanos(&metadata);

        let unchanged = self
            .last_parsed
            .get(&handle.log_path)
            .is_some_and(|&prev| prev == mtime_nanos);
        if unchanged {
            // Critical: always return the current mtime, never 0, or the
            // monitor would think this session never received data.
            return Ok((SourceUpdate::default(), mtime_nanos));
        }

        let content = std::fs::read_to_string(&handle.log_path).map_err(|e| ParseError::io(&handle.log_path, e))?;
        let Ok(doc) = serde_json::from_str::<Value>(&content) else {
            self.last_parsed.insert(handle.log_path.clone(), mtime_nanos);
            return Ok((SourceUpdate::default(), mtime_nanos));
        };

        let messages = extract_messages(&doc);
        let mut update = SourceUpdate::default();
        let mut abs_messages = 0u64;
        let mut abs_tool_calls = 0u64;

        for message in &messages {
            if is_info_message(message) {
                continue;
            }
            abs_messages += 1;
            abs_tool_calls += tool_call_count(message);

            if let Some(role) = message_role(message) {
                update.activity = Some(role);
            }
            if let Some(tool) = last_tool_name(message) {
                update.last_tool = Some(tool);
            }
            if let Some((tokens_in, tokens_out)) = message_tokens(message) {
                update.tokens_in = tokens_in;
                update.tokens_out = tokens_out;
            }
        }

        let (prev_messages, prev_tools) = self.prev_counts.get(&handle.log_path).copied().unwrap_or((0, 0));
        update.message_count = abs_messages.saturating_sub(prev_messages);
        update.tool_calls = abs_tool_calls.saturating_sub(prev_tools);

        self.prev_counts.insert(handle.log_path.clone(), (abs_messages, abs_tool_calls));
        self.last_parsed.insert(handle.log_path.clone(), mtime_nanos);

        Ok((update, mtime_nanos))
    }
}

impl GeminiSource {
    fn prune(&mut self, active_hashes: &std::collections::HashSet<String>, active_paths: &std::collections::HashSet<PathBuf>) {
        self.hash_to_path.retain(|h, _| active_hashes.contains(h));
        self.last_parsed.retain(|p, _| active_paths.contains(p));
        self.prev_counts.retain(|p, _| active_paths.contains(p));
    }
}

fn mtime_as_nanos(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Accept a bare array, or an object keyed by `messages`/`conversation`/`history`.
fn extract_messages(doc: &Value) -> Vec<Value> {
    if let Some(arr) = doc.as_array() {
        return arr.clone();
    }
    for key in ["messages", "conversation", "history"] {
        if let Some(arr) = doc.get(key).and_then(|v| v.as_array()) {
            return arr.clone();
        }
    }
    Vec::new()
}

fn is_info_message(message: &Value) -> bool {
    message.get("type").and_then(|t| t.as_str()) == Some("info")
}

fn message_role(message: &Value) -> Option<Activity> {
    if let Some(role) = message.get("role").and_then(|r| r.as_str()) {
        return match role {
            "user" => Some(Activity::Waiting),
            "model" => Some(Activity::Thinking),
            _ => None,
        };
    }
    match message.get("type").and_then(|t| t.as_str()) {
        Some("user") => Some(Activity::Waiting),
        Some("gemini") => Some(Activity::Thinking),
        _ => None,
    }
}

fn tool_call_count(message: &Value) -> u64 {
    message
        .get("toolCalls")
        .and_then(|t| t.as_array())
        .map(|a| a.len() as u64)
        .unwrap_or(0)
}

fn last_tool_name(message: &Value) -> Option<String> {
    message
        .get("toolCalls")
        .and_then(|t| t.as_array())
        .and_then(|a| a.last())
        .and_then(|t| t.get("name"))
        .and_then(|n| n.as_str())
        .map(str::to_string)
}

/// API-format: `usageMetadata.promptTokenCount`/`candidatesTokenCount`.
/// CLI-format: `tokens.input`/`tokens.output`.
fn message_tokens(message: &Value) -> Option<(u64, u64)> {
    if let Some(usage) = message.get("usageMetadata") {
        let input = usage.get("promptTokenCount").and_then(|v| v.as_u64());
        let output = usage.get("candidatesTokenCount").and_then(|v| v.as_u64());
        if input.is_some() || output.is_some() {
            return Some((input.unwrap_or(0), output.unwrap_or(0)));
        }
    }
    if let Some(tokens) = message.get("tokens") {
        let input = tokens.get("input").and_then(|v| v.as_u64());
        let output = tokens.get("output").and_then(|v| v.as_u64());
        if input.is_some() || output.is_some() {
            return Some((input.unwrap_or(0), output.unwrap_or(0)));
        }
    }
    None
}
