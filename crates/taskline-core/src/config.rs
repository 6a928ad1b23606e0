use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;

pub const DEFAULT_MAX_HISTORY_CHARS: usize = 100_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Upper bound on cumulative conversation history characters.
    pub max_history_chars: usize,
    /// Event stream closes after this long without an event.
    pub stream_idle_timeout_secs: u64,
    pub summary_timeout_secs: u64,
    pub reap_interval_secs: u64,
    pub task_idle_ms: u64,
    pub reaper_enabled: bool,
    pub event_buffer: usize,
    pub keep_alive_secs: u64,
    pub workspace_root: PathBuf,
    pub log_retention_days: u64,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            max_history_chars: DEFAULT_MAX_HISTORY_CHARS,
            stream_idle_timeout_secs: 10 * 60,
            summary_timeout_secs: 10,
            reap_interval_secs: 5,
            task_idle_ms: 60 * 60 * 1000,
            reaper_enabled: true,
            event_buffer: 256,
            keep_alive_secs: 10,
            workspace_root: default_workspace_root(),
            log_retention_days: 14,
        }
    }
}

impl ControlPlaneConfig {
    /// Defaults, then the optional JSON file, then `TASKLINE_*` variables.
    pub async fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;
        if let Some(path) = path {
            if fs::try_exists(path).await.unwrap_or(false) {
                let raw = fs::read_to_string(path).await?;
                let file_layer: Value = serde_json::from_str(&raw)?;
                deep_merge(&mut merged, &file_layer);
            }
        }
        deep_merge(&mut merged, &env_layer());
        Ok(serde_json::from_value(merged)?)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs.max(1))
    }

    pub fn summary_timeout(&self) -> Duration {
        Duration::from_secs(self.summary_timeout_secs.max(1))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(1))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.workspace_root.join("logs")
    }
}

fn default_workspace_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".taskline")
}

fn env_layer() -> Value {
    let mut root = Value::Object(Map::new());

    for (var, key) in [
        ("TASKLINE_MAX_HISTORY_CHARS", "max_history_chars"),
        ("TASKLINE_STREAM_IDLE_TIMEOUT_SECS", "stream_idle_timeout_secs"),
        ("TASKLINE_SUMMARY_TIMEOUT_SECS", "summary_timeout_secs"),
        ("TASKLINE_REAP_INTERVAL_SECS", "reap_interval_secs"),
        ("TASKLINE_TASK_IDLE_MS", "task_idle_ms"),
        ("TASKLINE_LOG_RETENTION_DAYS", "log_retention_days"),
    ] {
        if let Some(v) = std::env::var(var).ok().and_then(|raw| parse_u64(&raw)) {
            deep_merge(&mut root, &json!({ key: v }));
        }
    }
    if let Ok(path) = std::env::var("TASKLINE_WORKSPACE_ROOT") {
        if !path.trim().is_empty() {
            deep_merge(&mut root, &json!({ "workspace_root": path.trim() }));
        }
    }
    if let Some(enabled) = std::env::var("TASKLINE_REAPER")
        .ok()
        .and_then(|raw| parse_bool_like(&raw))
    {
        deep_merge(&mut root, &json!({ "reaper_enabled": enabled }));
    }

    root
}

fn parse_u64(raw: &str) -> Option<u64> {
    raw.trim().replace('_', "").parse::<u64>().ok()
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn defaults_match_documented_bounds() {
        let config = ControlPlaneConfig::default();
        assert_eq!(config.max_history_chars, 100_000);
        assert_eq!(config.stream_idle_timeout(), Duration::from_secs(600));
        assert_eq!(config.summary_timeout(), Duration::from_secs(10));
        assert!(config.workspace_root.ends_with(".taskline"));
    }

    #[test]
    fn bool_like_values_parse() {
        assert_eq!(parse_bool_like(" Yes "), Some(true));
        assert_eq!(parse_bool_like("off"), Some(false));
        assert_eq!(parse_bool_like("maybe"), None);
        assert_eq!(parse_u64("100_000"), Some(100_000));
    }

    #[test]
    fn deep_merge_keeps_unrelated_keys() {
        let mut base = json!({"a": 1, "nested": {"x": 1, "y": 2}});
        deep_merge(&mut base, &json!({"nested": {"y": 3}, "b": null}));
        assert_eq!(base, json!({"a": 1, "nested": {"x": 1, "y": 3}}));
    }

    #[tokio::test]
    async fn file_layer_overrides_defaults() {
        let root = std::env::temp_dir().join(format!("taskline-config-test-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&root).await.expect("mkdir");
        let path = root.join("config.json");
        tokio::fs::write(&path, r#"{"summary_timeout_secs": 3, "event_buffer": 8}"#)
            .await
            .expect("write");
        let config = ControlPlaneConfig::load(Some(&path)).await.expect("load");
        assert_eq!(config.summary_timeout_secs, 3);
        assert_eq!(config.event_buffer, 8);
        assert_eq!(config.keep_alive_secs, 10);
        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
