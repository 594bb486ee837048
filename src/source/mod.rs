//! The `Source` abstraction (spec §4.2) and the uniform update shape every
//! concrete source (`claude`, `codex`, `gemini`) produces.

pub mod claude;
pub mod codex;
pub mod gemini;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{DiscoverError, ParseError};

/// Activity classification. `SourceUpdate`/`SubagentUpdate` only ever
/// populate the in-flight subset (`Thinking`, `ToolUse`, `Waiting`); the
/// terminal/idle/starting variants are set by the monitor, never a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Starting,
    Idle,
    Thinking,
    ToolUse,
    Waiting,
    Complete,
    Errored,
    Lost,
}

impl Activity {
    pub fn is_terminal(self) -> bool {
        matches!(self, Activity::Complete | Activity::Errored | Activity::Lost)
    }
}

/// Identifies one session discovered by a source, plus the cross-batch
/// context the monitor threads back on every `parse` call.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub source: &'static str,
    pub session_id: String,
    pub log_path: PathBuf,
    pub working_dir: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    /// Known slug from a prior batch, used by the Claude source to filter
    /// self-progress entries.
    pub known_slug: Option<String>,
    /// `parentToolUseID -> subagent toolUseID`, supplied by the monitor so a
    /// `tool_result` arriving in a later batch than its originating
    /// `progress` entries can still be attributed (spec §4.3).
    pub known_subagent_parents: HashMap<String, String>,
}

impl SessionHandle {
    /// The unique store key: `source:sessionID`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.source, self.session_id)
    }
}

/// One subagent's slice of a `SourceUpdate`, same field shape as the parent.
#[derive(Debug, Clone, Default)]
pub struct SubagentUpdate {
    pub tool_use_id: String,
    pub parent_tool_use_id: String,
    pub slug: Option<String>,
    pub model: Option<String>,
    pub last_tool: Option<String>,
    pub activity: Option<Activity>,
    pub message_count: u64,
    pub tool_calls: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub completed: bool,
    /// Newly touched files this batch (additive enrichment, see
    /// `toolUseResult.filenames`); not part of the core spec contract.
    pub recent_files: Vec<String>,
}

/// One-poll incremental result from `Source::parse`. Some fields are
/// deltas to be added to running totals (`message_count`, `tool_calls`);
/// others are cumulative snapshots where the latest non-default value wins
/// (`tokens_in`, `tokens_out`, `max_context_tokens`, `model`, ...).
#[derive(Debug, Clone, Default)]
pub struct SourceUpdate {
    pub slug: Option<String>,
    pub model: Option<String>,
    pub working_dir: Option<String>,
    pub branch: Option<String>,
    pub last_tool: Option<String>,
    pub activity: Option<Activity>,
    pub message_count: u64,
    pub tool_calls: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub max_context_tokens: u64,
    pub last_time: Option<DateTime<Utc>>,
    pub subagents: HashMap<String, SubagentUpdate>,
    /// Newly touched files this batch (additive enrichment).
    pub recent_files: Vec<String>,
}

impl SourceUpdate {
    /// True iff at least one field carries real information.
    pub fn has_data(&self) -> bool {
        self.slug.is_some()
            || self.model.is_some()
            || self.working_dir.is_some()
            || self.branch.is_some()
            || self.last_tool.is_some()
            || self.activity.is_some()
            || self.message_count > 0
            || self.tool_calls > 0
            || self.tokens_in > 0
            || self.tokens_out > 0
            || self.max_context_tokens > 0
            || self.last_time.is_some()
            || !self.subagents.is_empty()
            || !self.recent_files.is_empty()
    }
}

/// A log-tailing source. Implementations are driven exclusively by the
/// monitor's single poll task; they may hold per-source mutable state
/// (hash tables, mtime caches) without any internal synchronization.
#[async_trait]
pub trait Source: Send {
    /// Short lowercase tag: `"claude"`, `"codex"`, `"gemini"`.
    fn name(&self) -> &'static str;

    /// Handles currently "active" per the source's recency rule. Must be
    /// cheap enough to run every poll tick.
    async fn discover(&mut self) -> Result<Vec<SessionHandle>, DiscoverError>;

    /// Parse new data since `offset`. Returns the update and the offset to
    /// resume from on the next call; `new_offset < offset` is never valid.
    /// With no new data, returns a zero update and an offset that is either
    /// unchanged or a stable sentinel surviving restart-from-zero (see the
    /// Gemini source's mtime semantics).
    async fn parse(
        &mut self,
        handle: &SessionHandle,
        offset: i64,
    ) -> Result<(SourceUpdate, i64), ParseError>;
}
