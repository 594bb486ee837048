//! TOML-backed configuration (SPEC_FULL §10.3), covering every knob named
//! in spec.md §6.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}
fn default_session_stale_after() -> Duration {
    Duration::from_secs(300)
}
fn default_completion_remove_after() -> Duration {
    Duration::from_secs(60)
}
fn default_broadcast_throttle() -> Duration {
    Duration::from_millis(250)
}
fn default_snapshot_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_health_warning_threshold() -> u32 {
    3
}
fn default_churning_cpu_threshold() -> f64 {
    80.0
}
fn default_tokens_per_message() -> u64 {
    2000
}
fn default_max_connections() -> usize {
    256
}
fn default_discover_window() -> Duration {
    Duration::from_secs(3600)
}

/// Per-source token-normalization strategy (spec §4.7.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStrategy {
    Usage,
    Estimate,
    MessageCount,
    #[serde(other)]
    RealOnly,
}

fn default_strategies() -> HashMap<String, TokenStrategy> {
    let mut m = HashMap::new();
    m.insert("claude".to_string(), TokenStrategy::Usage);
    m.insert("codex".to_string(), TokenStrategy::Usage);
    m.insert("gemini".to_string(), TokenStrategy::Usage);
    m
}

fn default_models() -> HashMap<String, u64> {
    let mut m = HashMap::new();
    m.insert("default".to_string(), 200_000);
    m
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(with = "humantime_serde_duration", default = "default_poll_interval")]
    pub poll_interval: Duration,

    #[serde(with = "humantime_serde_duration", default = "default_session_stale_after")]
    pub session_stale_after: Duration,

    #[serde(with = "humantime_serde_duration", default = "default_completion_remove_after")]
    pub completion_remove_after: Duration,

    #[serde(with = "humantime_serde_duration", default = "default_broadcast_throttle")]
    pub broadcast_throttle: Duration,

    #[serde(with = "humantime_serde_duration", default = "default_snapshot_interval")]
    pub snapshot_interval: Duration,

    #[serde(default = "default_health_warning_threshold")]
    pub health_warning_threshold: u32,

    #[serde(default = "default_churning_cpu_threshold")]
    pub churning_cpu_threshold: f64,

    #[serde(default)]
    pub churning_requires_network: bool,

    pub session_end_dir: Option<std::path::PathBuf>,

    #[serde(default = "default_strategies")]
    pub strategies: HashMap<String, TokenStrategy>,

    #[serde(default = "default_tokens_per_message")]
    pub tokens_per_message: u64,

    #[serde(default = "default_models")]
    pub models: HashMap<String, u64>,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(with = "humantime_serde_duration", default = "default_discover_window")]
    pub discover_window: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            session_stale_after: default_session_stale_after(),
            completion_remove_after: default_completion_remove_after(),
            broadcast_throttle: default_broadcast_throttle(),
            snapshot_interval: default_snapshot_interval(),
            health_warning_threshold: default_health_warning_threshold(),
            churning_cpu_threshold: default_churning_cpu_threshold(),
            churning_requires_network: false,
            session_end_dir: None,
            strategies: default_strategies(),
            tokens_per_message: default_tokens_per_message(),
            models: default_models(),
            max_connections: default_max_connections(),
            discover_window: default_discover_window(),
        }
    }
}

impl MonitorConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Resolve a model's context window by longest matching name-prefix,
    /// falling back to the `default` entry.
    pub fn context_window_for(&self, model: Option<&str>) -> u64 {
        if let Some(model) = model {
            let mut best: Option<(&str, u64)> = None;
            for (prefix, window) in &self.models {
                if prefix != "default" && model.starts_with(prefix.as_str()) {
                    if best.map(|(p, _)| prefix.len() > p.len()).unwrap_or(true) {
                        best = Some((prefix, *window));
                    }
                }
            }
            if let Some((_, window)) = best {
                return window;
            }
        }
        self.models.get("default").copied().unwrap_or(200_000)
    }

    pub fn strategy_for(&self, source: &str) -> TokenStrategy {
        self.strategies.get(source).copied().unwrap_or(TokenStrategy::RealOnly)
    }
}

/// Minimal `serde_with`-style duration (de)serializer accepting plain
/// integer seconds or humantime-style strings like `"250ms"`/`"5m"`,
/// without requiring another crate beyond what `toml`+`serde` already pull
/// in.
mod humantime_serde_duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Seconds(u64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Repr::Text(text) => parse_humanlike(&text).map_err(serde::de::Error::custom),
        }
    }

    fn parse_humanlike(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        let (num_part, unit) = text
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .map(|i| text.split_at(i))
            .unwrap_or((text, "s"));
        let value: f64 = num_part
            .parse()
            .map_err(|_| format!("invalid duration literal: {text}"))?;
        let multiplier = match unit {
            "ms" => 0.001,
            "s" | "" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            other => return Err(format!("unknown duration unit: {other}")),
        };
        Ok(Duration::from_secs_f64(value * multiplier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = MonitorConfig::default();
        assert_eq!(config.tokens_per_message, 2000);
        assert_eq!(config.models.get("default"), Some(&200_000));
    }

    #[test]
    fn parses_from_toml_with_duration_strings() {
        let text = r#"
            poll_interval = "5s"
            broadcast_throttle = "250ms"
            health_warning_threshold = 5
        "#;
        let config: MonitorConfig = toml::from_str(text).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.broadcast_throttle, Duration::from_millis(250));
        assert_eq!(config.health_warning_threshold, 5);
        // Untouched fields keep their defaults.
        assert_eq!(config.tokens_per_message, 2000);
    }

    #[test]
    fn context_window_prefers_longest_matching_prefix() {
        let mut config = MonitorConfig::default();
        config.models.insert("claude-3-opus".to_string(), 300_000);
        config.models.insert("claude".to_string(), 150_000);
        assert_eq!(config.context_window_for(Some("claude-3-opus-latest")), 300_000);
        assert_eq!(config.context_window_for(Some("claude-3-haiku")), 150_000);
        assert_eq!(config.context_window_for(Some("unknown-model")), 200_000);
        assert_eq!(config.context_window_for(None), 200_000);
    }

    #[test]
    fn strategy_defaults_to_real_only_for_unknown_source() {
        let config = MonitorConfig::default();
        assert_eq!(config.strategy_for("claude"), TokenStrategy::Usage);
        assert_eq!(config.strategy_for("unknown"), TokenStrategy::RealOnly);
    }
}
