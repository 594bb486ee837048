//! JSONL-append source for Claude Code transcripts (spec §4.3).
//!
//! Discovery walks `<home>/.claude/projects/<encoded-cwd>/*.jsonl`. Parsing
//! consumes whole lines from a byte offset and dispatches on each entry's
//! `type` discriminator: `user`/`assistant` drive the top-level session,
//! `progress` entries accumulate into subagent records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{DiscoverError, ParseError, DEFAULT_MAX_FILE_LEN, DEFAULT_MAX_LINE_LEN};
use crate::parser::{decode_project_dir, parse_rfc3339, read_new_lines};

use super::{Activity, SessionHandle, Source, SourceUpdate, SubagentUpdate};

pub struct ClaudeSource {
    root: PathBuf,
    discover_window: Duration,
}

impl ClaudeSource {
    pub fn new(root: PathBuf, discover_window: Duration) -> Self {
        Self { root, discover_window }
    }

    pub fn with_home(home: &Path, discover_window: Duration) -> Self {
        Self::new(home.join(".claude").join("projects"), discover_window)
    }
}

#[async_trait]
impl Source for ClaudeSource {
    fn name(&self) -> &'static str {
        "claude"
    }

    async fn discover(&mut self) -> Result<Vec<SessionHandle>, DiscoverError> {
        let mut handles = Vec::new();
        let project_dirs = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(handles),
            Err(e) => return Err(DiscoverError::walk(&self.root, e)),
        };

        let now = SystemTime::now();
        for project_entry in project_dirs.flatten() {
            let project_path = project_entry.path();
            if !project_path.is_dir() {
                continue;
            }
            let working_dir = project_entry
                .file_name()
                .to_str()
                .map(decode_project_dir);

            let Ok(files) = std::fs::read_dir(&project_path) else {
                continue;
            };
            for file_entry in files.flatten() {
                let path = file_entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                let Ok(metadata) = file_entry.metadata() else {
                    continue;
                };
                let Ok(modified) = metadata.modified() else {
                    continue;
                };
                let age = now.duration_since(modified).unwrap_or_default();
                if age > self.discover_window {
                    continue;
                }

                let session_id = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();

                let started_at = first_line_timestamp(&path);

                handles.push(SessionHandle {
                    source: "claude",
                    session_id,
                    log_path: path,
                    working_dir: working_dir.clone(),
                    started_at,
                    known_slug: None,
                    known_subagent_parents: HashMap::new(),
                });
            }
        }

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
            apply_entry(&entry, handle, &mut update);
        }

        Ok((update, batch.new_offset as i64))
    }
}

fn first_line_timestamp(path: &Path) -> Option<chrono::DateTime<chrono::Utc>> {
    let content = std::fs::read_to_string(path).ok()?;
    let first_line = content.lines().next()?;
    let entry: Value = serde_json::from_str(first_line).ok()?;
    entry.get("timestamp").and_then(|t| t.as_str()).and_then(parse_rfc3339)
}

fn apply_entry(entry: &Value, handle: &SessionHandle, update: &mut SourceUpdate) {
    if let Some(cwd) = entry.get("cwd").and_then(|c| c.as_str()) {
        if !cwd.is_empty() {
            update.working_dir = Some(cwd.to_string());
        }
    }
    if let Some(ts) = entry.get("timestamp").and_then(|t| t.as_str()).and_then(parse_rfc3339) {
        update.last_time = Some(ts);
    }
    // Top-level entries (not `progress`) may carry the session's own slug;
    // the monitor remembers this across batches to filter self-progress.
    if entry.get("type").and_then(|t| t.as_str()) != Some("progress") {
        if let Some(slug) = entry.get("slug").and_then(|s| s.as_str()) {
            if !slug.is_empty() {
                update.slug = Some(slug.to_string());
            }
        }
    }

    match entry.get("type").and_then(|t| t.as_str()) {
        Some("user") => apply_user_entry(entry, handle, update),
        Some("assistant") => apply_assistant_entry(entry, None, update),
        Some("progress") => apply_progress_entry(entry, handle, update),
        _ => {}
    }
}

fn apply_user_entry(entry: &Value, handle: &SessionHandle, update: &mut SourceUpdate) {
    update.message_count += 1;
    update.activity = Some(Activity::Waiting);

    if let Some(filenames) = entry
        .pointer("/toolUseResult/filenames")
        .and_then(|f| f.as_array())
    {
        for name in filenames.iter().filter_map(|f| f.as_str()) {
            update.recent_files.push(name.to_string());
        }
    }

    let Some(blocks) = entry.pointer("/message/content").and_then(|c| c.as_array()) else {
        return;
    };
    for block in blocks {
        if block.get("type").and_then(|t| t.as_str()) != Some("tool_result") {
            continue;
        }
        let Some(tool_use_id) = block.get("tool_use_id").and_then(|i| i.as_str()) else {
            continue;
        };
        complete_subagent_for_parent(tool_use_id, handle, update);
    }
}

/// `parent_id_override` is used when called from the progress path, where
/// subagent tokens/tools are attributed to the subagent record rather than
/// the top-level update.
fn apply_assistant_entry(entry: &Value, parent: Option<&mut SubagentUpdate>, update: &mut SourceUpdate) {
    let message = entry.get("message");

    let model = message.and_then(|m| m.get("model")).and_then(|m| m.as_str());

    let usage = message.and_then(|m| m.get("usage"));
    let tokens_in = usage.map(sum_input_tokens);
    let tokens_out = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(|v| v.as_u64());

    let mut saw_tool_use = false;
    let mut last_tool = None;
    if let Some(blocks) = message.and_then(|m| m.get("content")).and_then(|c| c.as_array()) {
        for block in blocks {
            if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                saw_tool_use = true;
                if let Some(name) = block.get("name").and_then(|n| n.as_str()) {
                    last_tool = Some(name.to_string());
                }
            }
        }
    }

    match parent {
        Some(sub) => {
            sub.message_count += 1;
            if let Some(m) = model {
                sub.model = Some(m.to_string());
            }
            if let Some(t) = tokens_in {
                sub.tokens_in = t;
            }
            if let Some(t) = tokens_out {
                sub.tokens_out = t;
            }
            sub.activity = Some(Activity::Thinking);
            if saw_tool_use {
                sub.tool_calls += 1;
                sub.activity = Some(Activity::ToolUse);
            }
            if let Some(tool) = last_tool {
                sub.last_tool = Some(tool);
            }
        }
        None => {
            update.message_count += 1;
            if let Some(m) = model {
                update.model = Some(m.to_string());
            }
            if let Some(t) = tokens_in {
                update.tokens_in = t;
            }
            if let Some(t) = tokens_out {
                update.tokens_out = t;
            }
            update.activity = Some(Activity::Thinking);
            if saw_tool_use {
                update.tool_calls += 1;
                update.activity = Some(Activity::ToolUse);
            }
            if let Some(tool) = last_tool {
                update.last_tool = Some(tool);
            }
        }
    }
}

fn sum_input_tokens(usage: &Value) -> u64 {
    let get = |k: &str| usage.get(k).and_then(|v| v.as_u64()).unwrap_or(0);
    get("input_tokens") + get("cache_creation_input_tokens") + get("cache_read_input_tokens")
}

fn apply_progress_entry(entry: &Value, handle: &SessionHandle, update: &mut SourceUpdate) {
    let slug = entry.get("slug").and_then(|s| s.as_str());
    if let (Some(slug), Some(known)) = (slug, handle.known_slug.as_deref()) {
        if slug == known {
            return;
        }
    }

    let tool_use_id = entry.get("toolUseID").and_then(|s| s.as_str());
    let parent_tool_use_id = entry.get("parentToolUseID").and_then(|s| s.as_str());

    let (Some(tool_use_id), Some(parent_tool_use_id)) = (tool_use_id, parent_tool_use_id) else {
        return;
    };

    if tool_use_id == parent_tool_use_id {
        // Phantom self-referential progress entry: never creates a subagent.
        return;
    }

    let existing = update.subagents.contains_key(tool_use_id);
    if !existing {
        // Open question in the source material: progress entries without a
        // slug never start a new subagent; they're ignored until a slugged
        // entry establishes one.
        if slug.is_none() {
            return;
        }
        update.subagents.insert(
            tool_use_id.to_string(),
            SubagentUpdate {
                tool_use_id: tool_use_id.to_string(),
                parent_tool_use_id: parent_tool_use_id.to_string(),
                slug: slug.map(str::to_string),
                ..Default::default()
            },
        );
    }

    let sub = update.subagents.get_mut(tool_use_id).expect("just inserted or pre-existing");
    if let Some(inner_message) = entry.get("message") {
        let synthetic = serde_json::json!({ "message": inner_message });
        apply_assistant_entry(&synthetic, Some(sub), &mut SourceUpdate::default());
    }
}

/// Mark the subagent whose `parent_tool_use_id` matches `tool_use_id` as
/// completed. If this batch created no such subagent locally, consult the
/// monitor-supplied cross-batch map and emit a minimal completed record
/// (spec §4.3 "Cross-batch subagent completion").
fn complete_subagent_for_parent(tool_use_id: &str, handle: &SessionHandle, update: &mut SourceUpdate) {
    if let Some((_, sub)) = update
        .subagents
        .iter_mut()
        .find(|(_, sub)| sub.parent_tool_use_id == tool_use_id)
    {
        sub.completed = true;
        return;
    }

    if let Some(subagent_id) = handle.known_subagent_parents.get(tool_use_id) {
        update.subagents.insert(
            subagent_id.clone(),
            SubagentUpdate {
                tool_use_id: subagent_id.clone(),
                parent_tool_use_id: tool_use_id.to_string(),
                completed: true,
                ..Default::default()
            },
        );
    }
}
