//! The poll loop / state machine (spec §4.7): the single coordinator that
//! drives discovery and parsing across all sources, resolves token
//! strategy, classifies activity, handles terminal/resume/stale
//! transitions, and publishes to the broadcaster.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::broadcast::Broadcaster;
use crate::config::{MonitorConfig, TokenStrategy};
use crate::enrich::{ProcessActivityTracker, TmuxPanes};
use crate::health::HealthTracker;
use crate::source::{Activity, SessionHandle, Source, SourceUpdate};
use crate::store::{BurnRateTracker, SessionState, SessionStore, SubagentState};

/// Per-session bookkeeping the monitor owns (spec §3 "Monitor-local maps").
struct Tracked {
    offset: i64,
    last_data_time: DateTime<Utc>,
}

/// A session-end marker file dropped by Claude (spec §4.7 step 1).
#[derive(Debug, Deserialize)]
struct SessionEndMarker {
    session_id: String,
    transcript_path: Option<String>,
    #[allow(dead_code)]
    cwd: Option<String>,
    reason: String,
    #[allow(dead_code)]
    timestamp: Option<String>,
}

const ERROR_REASON_SUBSTRINGS: &[&str] = &[
    "error", "err", "failed", "failure", "crash", "crashed", "panic", "exception", "abort",
    "aborted", "fatal", "interrupted", "killed", "terminated",
];

fn classify_end_reason(reason: &str) -> Activity {
    let lower = reason.to_ascii_lowercase();
    if ERROR_REASON_SUBSTRINGS.iter().any(|needle| lower.contains(needle)) {
        Activity::Errored
    } else {
        Activity::Complete
    }
}

pub struct Monitor {
    config: MonitorConfig,
    store: Arc<SessionStore>,
    broadcaster: Broadcaster,
    sources: Vec<Box<dyn Source>>,
    health: HashMap<&'static str, Arc<HealthTracker>>,

    tracked: HashMap<String, Tracked>,
    pending_removal: HashMap<String, DateTime<Utc>>,
    removed_keys: HashSet<String>,

    known_slugs: HashMap<String, String>,
    known_subagent_parents: HashMap<String, HashMap<String, String>>,
    burn_rates: HashMap<String, BurnRateTracker>,

    process_activity: ProcessActivityTracker,
}

impl Monitor {
    /// Build one `HealthTracker` per source, keyed by `Source::name()`. The
    /// caller constructs this before moving `sources` into `Monitor::new` so
    /// the same map can also be handed to `Broadcaster::spawn`.
    pub fn build_health_trackers(
        sources: &[Box<dyn Source>],
        threshold: u32,
    ) -> HashMap<&'static str, Arc<HealthTracker>> {
        sources.iter().map(|s| (s.name(), Arc::new(HealthTracker::new(threshold)))).collect()
    }

    pub fn new(
        config: MonitorConfig,
        store: Arc<SessionStore>,
        broadcaster: Broadcaster,
        health: HashMap<&'static str, Arc<HealthTracker>>,
        sources: Vec<Box<dyn Source>>,
    ) -> Self {
        Self {
            config,
            store,
            broadcaster,
            sources,
            health,
            tracked: HashMap::new(),
            pending_removal: HashMap::new(),
            removed_keys: HashSet::new(),
            known_slugs: HashMap::new(),
            known_subagent_parents: HashMap::new(),
            burn_rates: HashMap::new(),
            process_activity: ProcessActivityTracker::new(),
        }
    }

    pub fn health_tracker(&self, source: &str) -> Option<Arc<HealthTracker>> {
        self.health.get(source).cloned()
    }

    /// Run the poll loop: one immediate tick, then ticker-driven, honoring a
    /// single-slot reconfigure channel that recreates the ticker before the
    /// next sleep (spec §4.7).
    pub async fn run(
        mut self,
        mut reconfigure: tokio::sync::mpsc::Receiver<MonitorConfig>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        self.poll(Utc::now()).await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll(Utc::now()).await;
                }
                Some(new_config) = reconfigure.recv() => {
                    ticker = tokio::time::interval(new_config.poll_interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    self.config = new_config;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Drive a single poll tick directly, bypassing the ticker in `run`.
    /// Exposed for tests and for embedders that want to control timing
    /// themselves (e.g. driving the monitor from an external scheduler).
    pub async fn poll_once(&mut self, now: DateTime<Utc>) {
        self.poll(now).await;
    }

    async fn poll(&mut self, now: DateTime<Utc>) {
        self.drain_session_end_markers(now);

        let mut tick_active_keys: HashSet<String> = HashSet::new();
        let mut tick_updates: Vec<SessionState> = Vec::new();

        for source_idx in 0..self.sources.len() {
            self.poll_source(source_idx, now, &mut tick_active_keys, &mut tick_updates).await;
        }

        self.process_enrichment(now);
        self.stale_detection_and_terminal_transitions(now, &tick_active_keys);
        self.purge_tombstones(&tick_active_keys);

        if !tick_updates.is_empty() {
            self.broadcaster.queue_update(tick_updates);
        }

        self.flush_removals(now);
        self.prune_inactive(&tick_active_keys);
    }

    fn drain_session_end_markers(&mut self, now: DateTime<Utc>) {
        let Some(dir) = self.config.session_end_dir.clone() else { return };
        let Ok(entries) = std::fs::read_dir(&dir) else { return };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(text) = std::fs::read_to_string(&path) else {
                let _ = std::fs::remove_file(&path);
                continue;
            };
            let marker: Result<SessionEndMarker, _> = serde_json::from_str(&text);
            let _ = std::fs::remove_file(&path);
            let Ok(marker) = marker else {
                warn!(path = %path.display(), "malformed session-end marker");
                continue;
            };

            let primary_key = format!("claude:{}", marker.session_id);
            let key = if self.store.get(&primary_key).is_some() {
                primary_key
            } else if let Some(transcript) = &marker.transcript_path {
                let stem = std::path::Path::new(transcript)
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or(transcript);
                format!("claude:{stem}")
            } else {
                primary_key
            };

            let Some(mut state) = self.store.get(&key) else { continue };
            state.activity = classify_end_reason(&marker.reason);
            state.completed_at = Some(now);
            self.pending_removal.insert(key.clone(), now + self.config.completion_remove_after);
            let intent = self.store.update(state);
            self.broadcaster.dispatch(intent);
        }
    }

    async fn poll_source(
        &mut self,
        source_idx: usize,
        now: DateTime<Utc>,
        tick_active_keys: &mut HashSet<String>,
        tick_updates: &mut Vec<SessionState>,
    ) {
        let source_name = self.sources[source_idx].name();
        let health = self.health.get(source_name).cloned().expect("health tracker per source");

        let discover_result = AssertUnwindSafe(self.sources[source_idx].discover()).catch_unwind().await;
        let handles = match discover_result {
            Ok(Ok(handles)) => {
                health.record_discover_success();
                handles
            }
            Ok(Err(e)) => {
                warn!(source = source_name, error = %e, "discover failed");
                health.record_discover_failure(e.to_string());
                return;
            }
            Err(_panic) => {
                warn!(source = source_name, "discover panicked");
                health.record_discover_failure("panic during discover");
                return;
            }
        };

        for mut handle in handles {
            let key = handle.key();
            tick_active_keys.insert(key.clone());

            let offset_before = self.tracked.get(&key).map(|t| t.offset).unwrap_or(0);
            self.tracked.entry(key.clone()).or_insert_with(|| Tracked { offset: 0, last_data_time: now });

            handle.known_slug = self.known_slugs.get(&key).cloned();
            handle.known_subagent_parents = self.known_subagent_parents.get(&key).cloned().unwrap_or_default();

            let parse_result = AssertUnwindSafe(self.sources[source_idx].parse(&handle, offset_before))
                .catch_unwind()
                .await;

            let (update, new_offset) = match parse_result {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    warn!(source = source_name, session = key, error = %e, "parse failed");
                    health.record_parse_failure(&key, e.to_string());
                    continue;
                }
                Err(_panic) => {
                    warn!(source = source_name, session = key, "parse panicked");
                    health.record_discover_failure("panic during parse");
                    continue;
                }
            };
            health.record_parse_success(&key);

            let has_new_data = new_offset > offset_before || update.has_data();
            let tracked = self.tracked.get_mut(&key).expect("inserted above");
            tracked.offset = new_offset;
            if has_new_data {
                tracked.last_data_time = update.last_time.unwrap_or(now);
            }

            if self.removed_keys.contains(&key) && has_new_data {
                self.removed_keys.remove(&key);
            }

            let existing = self.store.get(&key);

            // A tombstoned or not-yet-created session with nothing new this
            // tick is left alone rather than resurrected from a blank state
            // (spec §8.7 zombie prevention): the file may still match
            // discover's recency window with no bytes past `offset_before`.
            if existing.is_none() && !has_new_data {
                continue;
            }

            if existing.is_none() {
                if let Some(last_time) = update.last_time {
                    let stale_after = chrono::Duration::from_std(self.config.session_stale_after)
                        .unwrap_or_else(|_| chrono::Duration::days(3650));
                    if now.signed_duration_since(last_time) > stale_after {
                        // Dead on arrival: the session's first real content is
                        // already older than the stale threshold. Skip
                        // creating it this tick; `offset_before` has already
                        // advanced past this content so it won't be
                        // re-flagged as new unless the session genuinely
                        // resumes with fresh writes.
                        continue;
                    }
                }
            }

            if let Some(slug) = &update.slug {
                self.known_slugs.insert(key.clone(), slug.clone());
            }
            for sub in update.subagents.values() {
                self.known_subagent_parents
                    .entry(key.clone())
                    .or_default()
                    .insert(sub.parent_tool_use_id.clone(), sub.tool_use_id.clone());
            }

            let resuming = existing.as_ref().map(|s| s.is_terminal()).unwrap_or(false) && has_new_data;
            if resuming {
                self.pending_removal.remove(&key);
            }

            let burn_tracker = self.burn_rates.entry(key.clone()).or_default();
            let new_state = build_session_state(existing, &update, &handle, &self.config, burn_tracker, now, resuming);

            debug!(source = source_name, session = key, messages = new_state.message_count, "session updated");

            let intent = self.store.update(new_state.clone());
            self.broadcaster.dispatch(intent);
            tick_updates.push(new_state);
        }
    }

    fn process_enrichment(&mut self, _now: DateTime<Utc>) {
        let cpu_samples = self.process_activity.sample(self.config.churning_cpu_threshold);
        if cpu_samples.is_empty() {
            return;
        }

        let tmux_panes = TmuxPanes::capture();
        let system = sysinfo::System::new();

        for mut state in self.store.get_all() {
            if state.is_terminal() || matches!(state.activity, Activity::Waiting) {
                continue;
            }
            let Some(dir) = state.working_dir.clone() else { continue };
            let Some(sample) = cpu_samples.get(&PathBuf::from(&dir)) else { continue };

            let mut changed = false;
            if state.pid.is_none() {
                state.pid = Some(sample.pid);
                changed = true;
            }
            if state.is_churning != sample.is_churning {
                state.is_churning = sample.is_churning;
                changed = true;
            }
            if let Some(pid) = state.pid {
                if let Some(target) = tmux_panes.target_for_pid(&system, pid) {
                    if state.tmux_target.as_deref() != Some(target.as_str()) {
                        state.tmux_target = Some(target);
                        changed = true;
                    }
                }
            }

            if changed {
                let intent = self.store.update(state);
                self.broadcaster.dispatch(intent);
            }
        }
    }

    fn stale_detection_and_terminal_transitions(&mut self, now: DateTime<Utc>, tick_active_keys: &HashSet<String>) {
        let stale_after = chrono::Duration::from_std(self.config.session_stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(3650));
        let keys: Vec<String> = self.tracked.keys().cloned().collect();

        for key in keys {
            let active = tick_active_keys.contains(&key);
            let Some(existing) = self.store.get(&key) else { continue };

            if active && existing.is_terminal() {
                continue;
            }

            let tracked_last_data = self.tracked.get(&key).map(|t| t.last_data_time);
            let is_stale = tracked_last_data
                .map(|t| now.signed_duration_since(t) > stale_after)
                .unwrap_or(false);

            if active && is_stale {
                self.mark_lost(&key, now);
            } else if !active {
                if !existing.is_terminal() {
                    self.mark_lost(&key, now);
                }
                self.removed_keys.insert(key.clone());
                self.pending_removal.entry(key.clone()).or_insert(now + self.config.completion_remove_after);
            }
        }
    }

    fn mark_lost(&mut self, key: &str, now: DateTime<Utc>) {
        let Some(mut state) = self.store.get(key) else { return };
        if state.is_terminal() {
            return;
        }
        state.activity = Activity::Lost;
        state.completed_at = Some(now);
        let intent = self.store.update(state);
        self.broadcaster.dispatch(intent);
    }

    fn purge_tombstones(&mut self, tick_active_keys: &HashSet<String>) {
        self.removed_keys.retain(|key| tick_active_keys.contains(key));
    }

    fn flush_removals(&mut self, now: DateTime<Utc>) {
        let due: Vec<String> = self
            .pending_removal
            .iter()
            .filter(|(_, &at)| at <= now)
            .map(|(k, _)| k.clone())
            .collect();

        if due.is_empty() {
            return;
        }

        for key in &due {
            self.store.remove(key);
            self.pending_removal.remove(key);
            self.removed_keys.insert(key.clone());
            if let Some((source, _)) = key.split_once(':') {
                if let Some(health) = self.health.get(source) {
                    health.clear_session(key);
                }
            }
        }
        self.broadcaster.queue_removal(due);
    }

    /// Drop monitor-local bookkeeping for a key once its log file has aged
    /// out of the discover window and it is no longer tombstoned (spec §3: a
    /// `tracked` entry "is destroyed when the log file ages out of the
    /// discover window AND the key is not tombstoned"). A key still present
    /// in the store (e.g. terminal and waiting out its removal grace period)
    /// is left alone so a later resume doesn't have to re-parse from offset
    /// zero; `removed_keys` membership is what keeps a key's tombstone (and
    /// hence its `tracked` offset) alive while discover still finds the file.
    fn prune_inactive(&mut self, tick_active_keys: &HashSet<String>) {
        let keys: Vec<String> = self.tracked.keys().cloned().collect();
        let stale: Vec<String> = keys
            .into_iter()
            .filter(|key| {
                !tick_active_keys.contains(key) && !self.removed_keys.contains(key) && self.store.get(key).is_none()
            })
            .collect();

        for key in stale {
            self.tracked.remove(&key);
            self.burn_rates.remove(&key);
            self.known_slugs.remove(&key);
            self.known_subagent_parents.remove(&key);
        }
    }
}

/// Token-strategy resolution and `SessionState` construction (spec §4.7.1).
#[allow(clippy::too_many_arguments)]
fn build_session_state(
    existing: Option<SessionState>,
    update: &SourceUpdate,
    handle: &SessionHandle,
    config: &MonitorConfig,
    burn_tracker: &mut BurnRateTracker,
    now: DateTime<Utc>,
    resuming: bool,
) -> SessionState {
    let key = handle.key();
    let strategy = config.strategy_for(handle.source);

    let mut state = existing.unwrap_or_else(|| SessionState {
        id: key.clone(),
        name: handle
            .working_dir
            .as_deref()
            .and_then(|d| d.rsplit('/').next())
            .unwrap_or(&handle.session_id)
            .to_string(),
        source: handle.source.to_string(),
        working_dir: handle.working_dir.clone(),
        branch: None,
        model: None,
        pid: None,
        tmux_target: None,
        message_count: 0,
        tool_call_count: 0,
        tokens_used: 0,
        max_context_tokens: 0,
        context_utilization: 0.0,
        token_estimated: false,
        is_churning: false,
        activity: Activity::Starting,
        started_at: handle.started_at.unwrap_or(now),
        last_activity_at: now,
        last_data_received_at: now,
        completed_at: None,
        burn_rate_per_minute: 0.0,
        subagents: Vec::new(),
        recent_files: Vec::new(),
    });

    if resuming {
        state.completed_at = None;
    }

    state.message_count += update.message_count;
    state.tool_call_count += update.tool_calls;

    if let Some(model) = &update.model {
        state.model = Some(model.clone());
    }
    if let Some(dir) = &update.working_dir {
        state.working_dir = Some(dir.clone());
    }
    if let Some(branch) = &update.branch {
        state.branch = Some(branch.clone());
    }
    if let Some(activity) = update.activity {
        // A terminal state only moves once `resuming` says so explicitly;
        // otherwise a stray update can't silently flip it back in place.
        if resuming || !state.is_terminal() {
            state.activity = activity;
            // Sources never emit a terminal activity in practice (§4.2), but
            // keep `activity ∈ terminal ⇔ completedAt ≠ null` true regardless.
            if activity.is_terminal() && state.completed_at.is_none() {
                state.completed_at = Some(now);
            }
        }
    }
    if let Some(last_time) = update.last_time {
        state.last_activity_at = last_time;
        state.last_data_received_at = last_time;
    } else if update.has_data() {
        state.last_activity_at = now;
        state.last_data_received_at = now;
    }

    resolve_tokens(&mut state, update, strategy, config.tokens_per_message);

    let window = if update.max_context_tokens > 0 {
        update.max_context_tokens
    } else {
        config.context_window_for(state.model.as_deref())
    };
    state.max_context_tokens = window;
    state.context_utilization = if window > 0 {
        (state.tokens_used as f64 / window as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };

    state.burn_rate_per_minute = burn_tracker.record(state.tokens_used, std::time::SystemTime::now());

    for sub_update in update.subagents.values() {
        merge_subagent(&mut state.subagents, sub_update);
    }
    for file in &update.recent_files {
        touch_recent_file(&mut state.recent_files, file.clone());
    }

    state
}

fn resolve_tokens(state: &mut SessionState, update: &SourceUpdate, strategy: TokenStrategy, tokens_per_message: u64) {
    match strategy {
        TokenStrategy::Usage => {
            if update.tokens_in > 0 {
                let was_estimated = state.token_estimated;
                if !was_estimated && update.tokens_in < state.tokens_used {
                    // Monotonic except for the one-way estimate->real
                    // transition; without that transition a lower real
                    // value never regresses a higher real value.
                    return;
                }
                state.tokens_used = update.tokens_in;
                state.token_estimated = false;
            } else if state.tokens_used == 0 || state.token_estimated {
                state.tokens_used = state.message_count * tokens_per_message;
                state.token_estimated = true;
            }
        }
        TokenStrategy::Estimate | TokenStrategy::MessageCount => {
            state.tokens_used = state.message_count * tokens_per_message;
            state.token_estimated = true;
        }
        TokenStrategy::RealOnly => {
            if update.tokens_in > state.tokens_used {
                state.tokens_used = update.tokens_in;
            }
        }
    }
}

fn merge_subagent(subagents: &mut Vec<SubagentState>, update: &crate::source::SubagentUpdate) {
    if let Some(existing) = subagents.iter_mut().find(|s| s.id == update.tool_use_id) {
        existing.message_count += update.message_count;
        existing.tool_call_count += update.tool_calls;
        if update.tokens_in > 0 {
            existing.tokens_used = update.tokens_in;
        }
        if let Some(model) = &update.model {
            existing.model = Some(model.clone());
        }
        if let Some(tool) = &update.last_tool {
            existing.last_tool = Some(tool.clone());
        }
        if let Some(activity) = update.activity {
            existing.activity = activity;
        }
        if update.completed && existing.completed_at.is_none() {
            existing.completed_at = Some(Utc::now());
            existing.activity = Activity::Complete;
        }
    } else {
        subagents.push(SubagentState {
            id: update.tool_use_id.clone(),
            parent_tool_use_id: update.parent_tool_use_id.clone(),
            slug: update.slug.clone(),
            model: update.model.clone(),
            last_tool: update.last_tool.clone(),
            activity: if update.completed {
                Activity::Complete
            } else {
                update.activity.unwrap_or(Activity::Starting)
            },
            message_count: update.message_count,
            tool_call_count: update.tool_calls,
            tokens_used: update.tokens_in,
            completed_at: update.completed.then(Utc::now),
        });
    }
}

fn touch_recent_file(files: &mut Vec<String>, path: String) {
    files.retain(|f| f != &path);
    files.push(path);
    const MAX_RECENT: usize = 20;
    if files.len() > MAX_RECENT {
        files.remove(0);
    }
}
