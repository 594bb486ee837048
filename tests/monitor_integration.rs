//! End-to-end exercises of the poll loop's state machine, driven through a
//! fake `Source` rather than real on-disk logs. These cover the monitor-level
//! testable properties that the unit tests inside `monitor.rs` can't reach on
//! their own: zombie prevention across multiple ticks, resume-after-terminal,
//! and session-end-marker draining.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sessionwatch::broadcast::Broadcaster;
use sessionwatch::config::MonitorConfig;
use sessionwatch::error::{DiscoverError, ParseError};
use sessionwatch::monitor::Monitor;
use sessionwatch::source::{Activity, SessionHandle, Source, SourceUpdate};
use sessionwatch::store::SessionStore;

/// One scripted `parse` outcome for a given session id on a given tick.
#[derive(Clone)]
enum Step {
    /// Session is discovered; `parse` returns this update and new offset.
    Update(SourceUpdate, i64),
    /// Session is discovered but `parse` finds nothing new at this offset.
    NoChange(i64),
    /// Session is not returned by `discover` at all this tick.
    Absent,
}

struct FakeSource {
    session_id: String,
    started_at: DateTime<Utc>,
    /// Scripted per-tick behavior, consumed front-to-back; the last entry
    /// repeats once exhausted.
    script: Vec<Step>,
    tick: usize,
}

#[async_trait]
impl Source for FakeSource {
    fn name(&self) -> &'static str {
        "claude"
    }

    async fn discover(&mut self) -> Result<Vec<SessionHandle>, DiscoverError> {
        let step = self.script.get(self.tick).or_else(|| self.script.last()).cloned();
        self.tick += 1;
        match step {
            Some(Step::Absent) | None => Ok(vec![]),
            Some(_) => Ok(vec![SessionHandle {
                source: "claude",
                session_id: self.session_id.clone(),
                log_path: std::path::PathBuf::from(format!("/tmp/{}.jsonl", self.session_id)),
                working_dir: Some("/repo".to_string()),
                started_at: Some(self.started_at),
                known_slug: None,
                known_subagent_parents: HashMap::new(),
            }]),
        }
    }

    async fn parse(
        &mut self,
        _handle: &SessionHandle,
        offset: i64,
    ) -> Result<(SourceUpdate, i64), ParseError> {
        // `tick` was already advanced by `discover` this round; look at the
        // step that `discover` just consumed.
        let idx = self.tick - 1;
        let step = self.script.get(idx).or_else(|| self.script.last()).cloned();
        match step.unwrap_or(Step::NoChange(offset)) {
            Step::Update(update, new_offset) => Ok((update, new_offset)),
            Step::NoChange(new_offset) => Ok((SourceUpdate::default(), new_offset)),
            Step::Absent => Ok((SourceUpdate::default(), offset)),
        }
    }
}

fn base_update(message_count: u64, last_time: DateTime<Utc>) -> SourceUpdate {
    SourceUpdate {
        slug: Some("proj".to_string()),
        model: Some("claude-3-opus".to_string()),
        working_dir: Some("/repo".to_string()),
        message_count,
        activity: Some(Activity::Thinking),
        last_time: Some(last_time),
        ..Default::default()
    }
}

fn harness(script: Vec<Step>, config: MonitorConfig) -> (Monitor, Arc<SessionStore>) {
    let store = Arc::new(SessionStore::new());
    let sources: Vec<Box<dyn sessionwatch::source::Source>> = vec![Box::new(FakeSource {
        session_id: "s1".to_string(),
        started_at: Utc::now(),
        script,
        tick: 0,
    })];
    let health = Monitor::build_health_trackers(&sources, config.health_warning_threshold);
    let broadcaster = Broadcaster::spawn(
        store.clone(),
        health.iter().map(|(n, t)| (*n, t.clone())).collect(),
        config.max_connections,
        config.broadcast_throttle,
        config.snapshot_interval,
    );
    let monitor = Monitor::new(config, store.clone(), broadcaster, health, sources);
    (monitor, store)
}

/// A session whose very first real content is already older than the stale
/// threshold is never created at all (spec §8.6/§8.7): it must not flap
/// between "tracked" and "lost" tick after tick.
#[tokio::test]
async fn dead_on_arrival_session_is_never_created_and_stays_skipped() {
    let mut config = MonitorConfig::default();
    config.session_stale_after = StdDuration::from_secs(60);
    let now = Utc::now();
    let ancient = now - chrono::Duration::hours(2);

    let (mut monitor, store) = harness(
        vec![Step::Update(base_update(1, ancient), 100)],
        config,
    );

    for _ in 0..5 {
        monitor.poll_once(now).await;
        assert!(store.get("claude:s1").is_none(), "dead-on-arrival session must never materialize");
    }
}

/// Once a dead-on-arrival session genuinely resumes with fresh data (a new,
/// recent `last_time`), it must be created normally rather than staying
/// permanently blocked.
#[tokio::test]
async fn dead_on_arrival_session_resumes_once_real_new_data_arrives() {
    let mut config = MonitorConfig::default();
    config.session_stale_after = StdDuration::from_secs(60);
    let now = Utc::now();
    let ancient = now - chrono::Duration::hours(2);

    let (mut monitor, store) = harness(
        vec![
            Step::Update(base_update(1, ancient), 100),
            Step::NoChange(100),
            Step::Update(base_update(2, now), 200),
        ],
        config,
    );

    monitor.poll_once(now).await;
    assert!(store.get("claude:s1").is_none());

    monitor.poll_once(now).await;
    assert!(store.get("claude:s1").is_none());

    monitor.poll_once(now).await;
    let state = store.get("claude:s1").expect("session created once real new data arrives");
    assert_eq!(state.message_count, 2);
}

/// A session that goes terminal, then disappears from discovery, then
/// reappears with fresh data before its removal grace period elapses, must
/// resume rather than staying stuck as terminal (spec §6, resume-after-terminal).
#[tokio::test]
async fn resumes_after_terminal_when_fresh_data_returns() {
    let mut config = MonitorConfig::default();
    config.completion_remove_after = StdDuration::from_secs(3600);
    let now = Utc::now();

    let (mut monitor, store) = harness(
        vec![
            Step::Update(base_update(1, now), 100),
            Step::Update(
                SourceUpdate {
                    activity: Some(Activity::Complete),
                    last_time: Some(now),
                    ..Default::default()
                },
                100,
            ),
            Step::Absent,
            Step::Update(base_update(5, now), 300),
        ],
        config,
    );

    monitor.poll_once(now).await;
    assert_eq!(store.get("claude:s1").unwrap().activity, Activity::Thinking);

    monitor.poll_once(now).await;
    assert!(store.get("claude:s1").unwrap().is_terminal());

    monitor.poll_once(now).await;

    monitor.poll_once(now).await;
    let state = store.get("claude:s1").expect("session still present, resumed");
    assert!(!state.is_terminal(), "fresh data after terminal must clear the terminal state");
    assert_eq!(state.message_count, 1 + 5);
}

/// A session-end marker whose `reason` contains an error-ish substring
/// classifies as `Errored`, not `Complete` (concrete scenario S4).
#[tokio::test]
async fn session_end_marker_with_error_reason_classifies_as_errored() {
    let config = MonitorConfig::default();
    let now = Utc::now();

    let (mut monitor, store) = harness(
        vec![Step::Update(base_update(1, now), 100)],
        MonitorConfig {
            session_end_dir: None,
            ..config
        },
    );
    monitor.poll_once(now).await;
    assert_eq!(store.get("claude:s1").unwrap().activity, Activity::Thinking);

    let dir = tempfile::tempdir().unwrap();
    let marker_path = dir.path().join("s1.json");
    std::fs::write(
        &marker_path,
        r#"{"session_id":"s1","transcript_path":null,"cwd":null,"reason":"process crashed unexpectedly","timestamp":null}"#,
    )
    .unwrap();

    // Rebuild a monitor pointed at the marker directory but sharing the same
    // store, so the marker-drain step can find the already-created session.
    let mut config2 = MonitorConfig::default();
    config2.session_end_dir = Some(dir.path().to_path_buf());
    let sources: Vec<Box<dyn sessionwatch::source::Source>> = vec![Box::new(FakeSource {
        session_id: "s1".to_string(),
        started_at: now,
        script: vec![Step::Absent],
        tick: 0,
    })];
    let health = Monitor::build_health_trackers(&sources, config2.health_warning_threshold);
    let broadcaster = Broadcaster::spawn(
        store.clone(),
        health.iter().map(|(n, t)| (*n, t.clone())).collect(),
        config2.max_connections,
        config2.broadcast_throttle,
        config2.snapshot_interval,
    );
    let mut monitor2 = Monitor::new(config2, store.clone(), broadcaster, health, sources);
    monitor2.poll_once(now).await;

    let state = store.get("claude:s1").expect("session still present after marker drain");
    assert_eq!(state.activity, Activity::Errored);
    assert!(state.completed_at.is_some());
    assert!(!marker_path.exists(), "marker file is consumed after processing");

    drop(monitor);
}

/// Broadcast sequence numbers only ever increase (mod wraparound) across a
/// run that produces a snapshot, several deltas, and a completion (spec §8.8).
#[tokio::test]
async fn sequence_numbers_are_monotonic_across_mixed_messages() {
    let store = Arc::new(SessionStore::new());
    let broadcaster = Broadcaster::spawn(
        store.clone(),
        Vec::new(),
        8,
        StdDuration::from_millis(15),
        StdDuration::from_secs(30),
    );

    let mut sub = broadcaster.subscribe().await.expect("under connection cap");
    let mut seqs = Vec::new();

    let first = sub.rx.recv().await.unwrap();
    seqs.push(seq_of(&first));

    for i in 0..3u64 {
        let mut state = fixture_state(&format!("claude:{i}"));
        state.message_count = i;
        broadcaster.queue_update(vec![state]);
        let msg = tokio::time::timeout(StdDuration::from_millis(200), sub.rx.recv())
            .await
            .expect("delta arrives")
            .expect("channel open");
        seqs.push(seq_of(&msg));
    }

    broadcaster.dispatch(sessionwatch::store::EmitIntent::Completion {
        session_id: "claude:0".into(),
        activity: Activity::Complete,
        name: "proj".into(),
    });
    let completion = tokio::time::timeout(StdDuration::from_millis(200), sub.rx.recv())
        .await
        .expect("completion arrives")
        .expect("channel open");
    seqs.push(seq_of(&completion));

    for pair in seqs.windows(2) {
        assert!(pair[1] > pair[0], "sequence numbers must strictly increase: {seqs:?}");
    }
}

fn seq_of(msg: &sessionwatch::broadcast::OutboundMessage) -> u64 {
    match msg {
        sessionwatch::broadcast::OutboundMessage::Snapshot { seq, .. } => *seq,
        sessionwatch::broadcast::OutboundMessage::Delta { seq, .. } => *seq,
        sessionwatch::broadcast::OutboundMessage::Completion { seq, .. } => *seq,
    }
}

fn fixture_state(id: &str) -> sessionwatch::store::SessionState {
    sessionwatch::store::SessionState {
        id: id.to_string(),
        name: "proj".into(),
        source: "claude".into(),
        working_dir: None,
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
        activity: Activity::Thinking,
        started_at: Utc::now(),
        last_activity_at: Utc::now(),
        last_data_received_at: Utc::now(),
        completed_at: None,
        burn_rate_per_minute: 0.0,
        subagents: Vec::new(),
        recent_files: Vec::new(),
    }
}
