use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_SETTINGS_FILE: &str = "sync.toml";
const ENV_PREFIX: &str = "SYNC__";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SyncSettings {
    pub api_base_url: String,
    pub realtime_url: String,
    pub cache_database_url: String,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_growth: f64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub throttle_interval_ms: u64,
    pub batch_window_ms: u64,
    pub dedup_ttl_secs: u64,
    pub dedup_max_entries: usize,
    pub typing_ttl_ms: u64,
    pub conversation_list_limit: u32,
    pub outage_buffer_limit: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:3000/api".into(),
            realtime_url: "ws://127.0.0.1:3000/realtime".into(),
            cache_database_url: "sqlite://./data/offline_cache.db".into(),
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 45_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_growth: 2.0,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 5,
            throttle_interval_ms: 100,
            batch_window_ms: 50,
            dedup_ttl_secs: 300,
            dedup_max_entries: 1_000,
            typing_ttl_ms: 3_000,
            conversation_list_limit: 50,
            outage_buffer_limit: 256,
        }
    }
}

/// Backoff schedule: `base * growth^attempt`, capped, bounded by `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub growth: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let growth = if self.growth.is_finite() && self.growth >= 1.0 {
            self.growth
        } else {
            1.0
        };
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_secs_f64() * growth.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub outage_buffer_limit: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub batch_window: Duration,
    pub dedup_ttl: Duration,
    pub dedup_max_entries: usize,
}

impl SyncSettings {
    pub fn connection(&self) -> ConnectionSettings {
        ConnectionSettings {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
                growth: self.reconnect_growth,
                max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
                max_attempts: self.max_reconnect_attempts,
            },
            outage_buffer_limit: self.outage_buffer_limit,
        }
    }

    pub fn pipeline(&self) -> PipelineSettings {
        PipelineSettings {
            batch_window: Duration::from_millis(self.batch_window_ms),
            dedup_ttl: Duration::from_secs(self.dedup_ttl_secs),
            dedup_max_entries: self.dedup_max_entries,
        }
    }

    pub fn throttle_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_interval_ms)
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_millis(self.typing_ttl_ms)
    }

    fn apply(&mut self, key: &str, value: &str) -> bool {
        let value = value.trim();
        match key {
            "api_base_url" => self.api_base_url = value.to_string(),
            "realtime_url" => self.realtime_url = value.to_string(),
            "cache_database_url" => self.cache_database_url = value.to_string(),
            "heartbeat_interval_ms" => return parse_into(value, &mut self.heartbeat_interval_ms),
            "heartbeat_timeout_ms" => return parse_into(value, &mut self.heartbeat_timeout_ms),
            "reconnect_base_delay_ms" => {
                return parse_into(value, &mut self.reconnect_base_delay_ms)
            }
            "reconnect_growth" => return parse_into(value, &mut self.reconnect_growth),
            "reconnect_max_delay_ms" => return parse_into(value, &mut self.reconnect_max_delay_ms),
            "max_reconnect_attempts" => return parse_into(value, &mut self.max_reconnect_attempts),
            "throttle_interval_ms" => return parse_into(value, &mut self.throttle_interval_ms),
            "batch_window_ms" => return parse_into(value, &mut self.batch_window_ms),
            "dedup_ttl_secs" => return parse_into(value, &mut self.dedup_ttl_secs),
            "dedup_max_entries" => return parse_into(value, &mut self.dedup_max_entries),
            "typing_ttl_ms" => return parse_into(value, &mut self.typing_ttl_ms),
            "conversation_list_limit" => {
                return parse_into(value, &mut self.conversation_list_limit)
            }
            "outage_buffer_limit" => return parse_into(value, &mut self.outage_buffer_limit),
            _ => return false,
        }
        true
    }
}

fn parse_into<T: std::str::FromStr>(raw: &str, slot: &mut T) -> bool {
    match raw.parse::<T>() {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(_) => false,
    }
}

fn toml_value_to_string(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(v) => Some(v.clone()),
        toml::Value::Integer(v) => Some(v.to_string()),
        toml::Value::Float(v) => Some(v.to_string()),
        toml::Value::Boolean(v) => Some(v.to_string()),
        _ => None,
    }
}

/// Defaults, then `sync.toml` in the working directory, then `SYNC__*` env vars.
pub fn load_settings() -> SyncSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> SyncSettings {
    let mut settings = SyncSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<toml::Table>(&raw) {
            Ok(table) => {
                for (key, value) in &table {
                    let applied = toml_value_to_string(value)
                        .map(|value| settings.apply(key, &value))
                        .unwrap_or(false);
                    if !applied {
                        warn!(key = %key, path = %path.display(), "config: ignoring unusable setting");
                    }
                }
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "config: settings file is not valid toml");
            }
        }
    }

    for (name, value) in std::env::vars() {
        let Some(key) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let key = key.to_ascii_lowercase();
        if !settings.apply(&key, &value) {
            warn!(variable = %name, "config: ignoring unusable environment override");
        }
    }

    settings
}

/// Maps a bare path or `sqlite:` url onto the `sqlite://` form sqlx expects.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return SyncSettings::default().cache_database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
