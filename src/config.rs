use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/touch_data.sqlite3")
}

fn default_channels() -> u8 {
    12
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_debounce_ms() -> u64 {
    50
}

fn default_max_sensor_errors() -> u32 {
    5
}

fn default_sensor_error_cooldown_secs() -> u64 {
    10
}

fn default_glad_threshold() -> u32 {
    20
}

fn default_rate_window_secs() -> u64 {
    3600
}

fn default_tick_interval_secs() -> u64 {
    10
}

fn default_retention_days() -> u32 {
    30
}

fn default_sad_color() -> [u8; 3] {
    [0, 0, 255]
}

fn default_glad_color() -> [u8; 3] {
    [255, 215, 0]
}

fn default_transition_secs() -> f64 {
    5.0
}

fn default_led_refresh_hz() -> u32 {
    30
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_subscriber_queue_len() -> usize {
    32
}

/// Application configuration, loaded from a JSON settings file at startup.
/// Missing fields fall back to their defaults, so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,

    /// Number of touch channels on the sensor (MPR121 exposes 12 electrodes).
    pub channels: u8,
    pub poll_interval_ms: u64,
    /// Minimum time between touch starts on the same channel.
    pub debounce_ms: u64,
    pub max_sensor_errors: u32,
    pub sensor_error_cooldown_secs: u64,

    /// Touches within `rate_window_secs` required to enter (and stay in) GLAD.
    pub glad_threshold: u32,
    pub rate_window_secs: u64,
    /// Cadence of the periodic re-evaluation / stats broadcast tick.
    pub tick_interval_secs: u64,

    pub retention_days: u32,

    pub sad_color: [u8; 3],
    pub glad_color: [u8; 3],
    pub transition_secs: f64,
    pub led_refresh_hz: u32,

    pub heartbeat_secs: u64,
    pub subscriber_queue_len: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            channels: default_channels(),
            poll_interval_ms: default_poll_interval_ms(),
            debounce_ms: default_debounce_ms(),
            max_sensor_errors: default_max_sensor_errors(),
            sensor_error_cooldown_secs: default_sensor_error_cooldown_secs(),
            glad_threshold: default_glad_threshold(),
            rate_window_secs: default_rate_window_secs(),
            tick_interval_secs: default_tick_interval_secs(),
            retention_days: default_retention_days(),
            sad_color: default_sad_color(),
            glad_color: default_glad_color(),
            transition_secs: default_transition_secs(),
            led_refresh_hz: default_led_refresh_hz(),
            heartbeat_secs: default_heartbeat_secs(),
            subscriber_queue_len: default_subscriber_queue_len(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `path`, falling back to defaults when the file
    /// is missing. A present-but-unparseable file is an error so typos don't
    /// silently run the device with defaults.
    pub fn load(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse settings from {}", path.display()))
    }

    pub fn debug_mode() -> bool {
        std::env::var("TOUCH_COMPANION_DEBUG")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        let config = AppConfig::load(&PathBuf::from("/nonexistent/settings.json")).unwrap();
        assert_eq!(config.glad_threshold, 20);
        assert_eq!(config.rate_window_secs, 3600);
        assert_eq!(config.channels, 12);
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"gladThreshold": 5, "rateWindowSecs": 60}"#).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.glad_threshold, 5);
        assert_eq!(config.rate_window_secs, 60);
        assert_eq!(config.port, 8000);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(AppConfig::load(&path).is_err());
    }
}
