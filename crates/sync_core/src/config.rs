use std::{collections::HashMap, fs, path::Path, str::FromStr, time::Duration};

use tracing::warn;

pub const SETTINGS_FILE: &str = "sync.toml";
const ENV_PREFIX: &str = "SYNC__";

const SETTING_KEYS: &[&str] = &[
    "heartbeat_interval_ms",
    "heartbeat_missed_limit",
    "handshake_timeout_ms",
    "reconnect_base_delay_ms",
    "reconnect_max_delay_ms",
    "max_reconnect_attempts",
    "poll_interval_ms",
    "typing_idle_timeout_ms",
    "typing_ttl_ms",
    "live_edge_threshold_px",
    "backfill_trigger_px",
    "page_size",
    "reconcile_window_ms",
];

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub heartbeat_interval: Duration,
    /// Consecutive heartbeat ticks without any inbound traffic before the link is declared dead.
    pub heartbeat_missed_limit: u8,
    /// Upper bound on one push connect attempt; expiry counts as an abnormal loss.
    pub handshake_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub poll_interval: Duration,
    pub typing_idle_timeout: Duration,
    pub typing_ttl: Duration,
    pub live_edge_threshold_px: f64,
    pub backfill_trigger_px: f64,
    pub page_size: u32,
    /// How far a server timestamp may drift from a pending send's submission time and
    /// still be matched to it.
    pub reconcile_window: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_missed_limit: 2,
            handshake_timeout: Duration::from_millis(10_000),
            reconnect_base_delay: Duration::from_millis(1_000),
            reconnect_max_delay: Duration::from_millis(30_000),
            max_reconnect_attempts: 5,
            poll_interval: Duration::from_millis(5_000),
            typing_idle_timeout: Duration::from_millis(3_000),
            typing_ttl: Duration::from_millis(5_000),
            live_edge_threshold_px: 50.0,
            backfill_trigger_px: 100.0,
            page_size: 30,
            reconcile_window: Duration::from_secs(120),
        }
    }
}

impl SyncSettings {
    fn apply(&mut self, key: &str, raw: &str) {
        let raw = raw.trim();
        let applied = match key {
            "heartbeat_interval_ms" => set_millis(&mut self.heartbeat_interval, raw),
            "heartbeat_missed_limit" => set_parsed(&mut self.heartbeat_missed_limit, raw),
            "handshake_timeout_ms" => set_millis(&mut self.handshake_timeout, raw),
            "reconnect_base_delay_ms" => set_millis(&mut self.reconnect_base_delay, raw),
            "reconnect_max_delay_ms" => set_millis(&mut self.reconnect_max_delay, raw),
            "max_reconnect_attempts" => set_parsed(&mut self.max_reconnect_attempts, raw),
            "poll_interval_ms" => set_millis(&mut self.poll_interval, raw),
            "typing_idle_timeout_ms" => set_millis(&mut self.typing_idle_timeout, raw),
            "typing_ttl_ms" => set_millis(&mut self.typing_ttl, raw),
            "live_edge_threshold_px" => set_parsed(&mut self.live_edge_threshold_px, raw),
            "backfill_trigger_px" => set_parsed(&mut self.backfill_trigger_px, raw),
            "page_size" => set_parsed(&mut self.page_size, raw),
            "reconcile_window_ms" => set_millis(&mut self.reconcile_window, raw),
            _ => {
                warn!(%key, "config: ignoring unknown sync setting");
                return;
            }
        };
        if !applied {
            warn!(%key, value = %raw, "config: ignoring malformed sync setting");
        }
    }
}

fn set_parsed<T: FromStr>(field: &mut T, raw: &str) -> bool {
    match raw.parse::<T>() {
        Ok(value) => {
            *field = value;
            true
        }
        Err(_) => false,
    }
}

fn set_millis(field: &mut Duration, raw: &str) -> bool {
    match raw.parse::<u64>() {
        Ok(ms) => {
            *field = Duration::from_millis(ms);
            true
        }
        Err(_) => false,
    }
}

fn toml_scalar(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(v) => Some(v.clone()),
        toml::Value::Integer(v) => Some(v.to_string()),
        toml::Value::Float(v) => Some(v.to_string()),
        toml::Value::Boolean(v) => Some(v.to_string()),
        _ => None,
    }
}

/// Defaults, then `sync.toml` in the working directory, then `SYNC__*` variables.
pub fn load_settings() -> SyncSettings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> SyncSettings {
    let mut settings = SyncSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => {
                for (key, value) in &file_cfg {
                    match toml_scalar(value) {
                        Some(v) => settings.apply(key, &v),
                        None => warn!(%key, "config: sync setting must be a scalar"),
                    }
                }
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "config: failed to parse sync settings file");
            }
        }
    }

    for key in SETTING_KEYS {
        let env_key = format!("{ENV_PREFIX}{}", key.to_ascii_uppercase());
        if let Some(v) = env(&env_key) {
            settings.apply(key, &v);
        }
    }

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
