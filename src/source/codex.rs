//! JSONL-envelope source for OpenAI Codex CLI session rollouts (spec §4.4).
//!
//! Discovery walks `${CODEX_HOME:-~/.codex}/sessions/YYYY/MM/DD/`. Each line
//! is either an `{"type","payload"}` envelope or, in the legacy "bare"
//! format, a top-level object whose own `type` matches one of the envelope's
//! inner kinds directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{DiscoverError, ParseError, DEFAULT_MAX_FILE_LEN, DEFAULT_MAX_LINE_LEN};
use crate::parser::{parse_rfc3339, read_new_lines};

use super::{Activity, SessionHandle, Source, SourceUpdate};

pub struct CodexSource {
    root: PathBuf,
    discover_window: Duration,
}

impl CodexSource {
    pub fn new(root: PathBuf, discover_window: Duration) -> Self {
        Self { root, discover_window }
    }

    /// `${CODEX_HOME:-~/.codex}/sessions`.
    pub fn from_env(home: &Path, discover_window: Duration) -> Self {
        let codex_home = std::env::var_os("CODEX_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".codex"));
        Self::new(codex_home.join("sessions"), discover_window)
    }
}

#[async_trait]
impl Source for CodexSource {
    fn name(&self) -> &'static str {
        "codex"
    }

    async fn discover(&mut self) -> Result<Vec<SessionHandle>, DiscoverError> {
        let mut handles = Vec::new();
        let now = SystemTime::now();
        walk_day_dirs(&self.root, &mut |path, metadata| {
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                return;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                return;
            };
            if !file_name.starts_with("rollout-") {
                return;
            }
            let Ok(modified) = metadata.modified() else {
                return;
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age > self.discover_window {
                return;
            }

            let session_id = extract_uuid(file_name).unwrap_or_else(|| {
                file_name
                    .trim_end_matches(".jsonl")
                    .rsplit('-')
                    .next()
                    .unwrap_or(file_name)
                    .to_string()
            });

            handles.push(SessionHandle {
                source: "codex",
                session_id,
                log_path: path.to_path_buf(),
                working_dir: None,
                started_at: None,
                known_slug: None,
                known_subagent_parents: HashMap::new(),
            });
        })?;
        Ok(handles)
    }

    async fn parse(
        &mut self,
        handle: &SessionHandle,
        offset: i64,
    ) -> Result<(SourceUpdate, i64), ParseError> {
        let batch = read_new_lines(
            &handle.log_path,
            offset.max(0) as u64,
            DEFAULT_MAX_LINE_LEN,
            DEFAULT_MAX_FILE_LEN,
        )?;

        let mut update = SourceUpdate::default();
        for line in &batch.lines {
            let Ok(entry) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            apply_line(&entry, &mut update);
        }

        Ok((update, batch.new_offset as i64))
    }
}

/// Extract the UUID from a `rollout-<ts>-<uuid>.jsonl` filename: the last 36
/// characters matching the 8-4-4-4-12 hyphen pattern.
fn extract_uuid(file_name: &str) -> Option<String> {
    let stem = file_name.trim_end_matches(".jsonl");
    if stem.len() < 36 {
        return None;
    }
    let candidate = &stem[stem.len() - 36..];
    is_uuid_shaped(candidate).then(|| candidate.to_string())
}

fn is_uuid_shaped(s: &str) -> bool {
    let groups: Vec<&str> = s.split('-').collect();
    groups.len() == 5
        && [8, 4, 4, 4, 12]
            .iter()
            .zip(&groups)
            .all(|(&len, g)| g.len() == len && g.chars().all(|c| c.is_ascii_hexdigit()))
}

fn walk_day_dirs(
    root: &Path,
    visit: &mut impl FnMut(&Path, std::fs::Metadata),
) -> Result<(), DiscoverError> {
    fn walk(dir: &Path, depth: u32, visit: &mut impl FnMut(&Path, std::fs::Metadata)) -> std::io::Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(metadata) = entry.metadata() else { continue };
            if metadata.is_dir() && depth < 3 {
                walk(&path, depth + 1, visit)?;
            } else if metadata.is_file() {
                visit(&path, metadata);
            }
        }
        Ok(())
    }

    walk(root, 0, visit).map_err(|e| DiscoverError::walk(root, e))
}

fn apply_line(entry: &Value, update: &mut SourceUpdate) {
    match entry.get("type").and_then(|t| t.as_str()) {
        Some("session_meta") => apply_session_meta(entry.get("payload").unwrap_or(entry), update),
        Some("env_context") | Some("turn_context") => {
            apply_cwd(entry.get("payload").unwrap_or(entry), update)
        }
        Some("response_item") => {
            if let Some(payload) = entry.get("payload") {
                apply_response_item(payload, update);
            }
        }
        Some("event_msg") => {
            if let Some(payload) = entry.get("payload") {
                apply_event_msg(payload, update);
            }
        }
        // Bare/legacy format: the inner kinds appear directly at top level.
        Some(_) => apply_bare(entry, update),
        None => {}
    }
}

fn apply_session_meta(payload: &Value, update: &mut SourceUpdate) {
    if let Some(model) = model_field(payload) {
        update.model = Some(model);
    }
    if let Some(ts) = payload.get("timestamp").and_then(|t| t.as_str()).and_then(parse_rfc3339) {
        update.last_time = Some(ts);
    }
}

fn apply_cwd(payload: &Value, update: &mut SourceUpdate) {
    if let Some(cwd) = payload.get("cwd").and_then(|c| c.as_str()) {
        if !cwd.is_empty() {
            update.working_dir = Some(cwd.to_string());
        }
    }
}

fn apply_response_item(payload: &Value, update: &mut SourceUpdate) {
    match payload.get("type").and_then(|t| t.as_str()) {
        Some("message") => {
            update.message_count += 1;
            update.activity = Some(Activity::Thinking);
        }
        Some("command_execution") => {
            update.tool_calls += 1;
            update.last_tool = Some("Bash".to_string());
            update.activity = Some(Activity::ToolUse);
        }
        Some("file_change") => {
            update.tool_calls += 1;
            update.last_tool = Some("FileEdit".to_string());
            update.activity = Some(Activity::ToolUse);
        }
        Some("mcp_tool_call") => {
            update.tool_calls += 1;
            let name = payload
                .get("tool_name")
                .or_else(|| payload.get("name"))
                .and_then(|n| n.as_str())
                .unwrap_or("mcp_tool");
            update.last_tool = Some(name.to_string());
            update.activity = Some(Activity::ToolUse);
        }
        Some("reasoning") => {
            update.activity = Some(Activity::Thinking);
        }
        Some("web_search") => {
            update.tool_calls += 1;
            update.last_tool = Some("WebSearch".to_string());
            update.activity = Some(Activity::ToolUse);
        }
        Some("function_call") => {
            update.tool_calls += 1;
            let name = payload.get("name").and_then(|n| n.as_str()).unwrap_or("function");
            update.last_tool = Some(name.to_string());
            update.activity = Some(Activity::ToolUse);
        }
        // function_call_output is explicitly not a tool call.
        _ => {}
    }
}

fn apply_event_msg(payload: &Value, update: &mut SourceUpdate) {
    match payload.get("type").and_then(|t| t.as_str()) {
        Some("user_message") => {
            update.message_count += 1;
            update.activity = Some(Activity::Waiting);
        }
        Some("agent_message") => {
            update.message_count += 1;
            update.activity = Some(Activity::Thinking);
        }
        Some("token_count") => apply_token_count(payload, update),
        Some("turn_started") => apply_context_window_only(payload, update),
        Some("tool_call") => {
            update.tool_calls += 1;
            update.activity = Some(Activity::ToolUse);
            if let Some(name) = payload.get("name").and_then(|n| n.as_str()) {
                update.last_tool = Some(name.to_string());
            }
        }
        Some("session_configured") => {
            // A later reconfigured model supersedes session_meta.
            if let Some(model) = model_field(payload) {
                update.model = Some(model);
            }
        }
        _ => {}
    }
}

/// Old "bare" line format: the inner kind is the top-level `type`.
fn apply_bare(entry: &Value, update: &mut SourceUpdate) {
    apply_response_item(entry, update);
    apply_event_msg(entry, update);
    apply_cwd(entry, update);
}

/// `token_count` payloads: flat (`input_tokens`, `cached_input_tokens`,
/// `output_tokens`, `model_context_window`) or nested under
/// `info.total_token_usage` with a sibling `model_context_window`.
/// `info: null` means "no real data yet" — skip entirely.
fn apply_token_count(payload: &Value, update: &mut SourceUpdate) {
    if payload.get("info").map(|v| v.is_null()).unwrap_or(false) {
        return;
    }

    let usage = payload.get("info").and_then(|i| i.get("total_token_usage")).unwrap_or(payload);
    let context_window_source = payload
        .get("info")
        .filter(|i| !i.is_null())
        .unwrap_or(payload);

    if let Some(input) = usage.get("input_tokens").and_then(|v| v.as_u64()) {
        let cached = usage.get("cached_input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        update.tokens_in = input + cached;
    }
    if let Some(output) = usage.get("output_tokens").and_then(|v| v.as_u64()) {
        update.tokens_out = output;
    }
    if let Some(window) = context_window_source
        .get("model_context_window")
        .and_then(|v| v.as_u64())
        .filter(|&w| w > 0)
    {
        update.max_context_tokens = window;
    }
}

fn apply_context_window_only(payload: &Value, update: &mut SourceUpdate) {
    if let Some(window) = payload.get("model_context_window").and_then(|v| v.as_u64()).filter(|&w| w > 0) {
        update.max_context_tokens = window;
    }
}

/// Model field may be a plain string or an object with `name`/`id`/`model`.
fn model_field(payload: &Value) -> Option<String> {
    let model = payload.get("model")?;
    if let Some(s) = model.as_str() {
        return Some(s.to_string());
    }
    model
        .get("name")
        .or_else(|| model.get("id"))
        .or_else(|| model.get("model"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}
