use std::{collections::HashMap, fs, path::Path, time::Duration};

use tracing::warn;

use crate::connection::RetryPolicy;

const DEFAULT_CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub channel_path: String,
    pub session_database_url: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub typing_idle: Duration,
    pub unread_poll_interval: Duration,
    pub notification_preview_chars: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".into(),
            channel_path: "/ws".into(),
            session_database_url: "sqlite://./data/session.db".into(),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(1000),
            typing_idle: Duration::from_millis(3000),
            unread_poll_interval: Duration::from_millis(30_000),
            notification_preview_chars: 30,
        }
    }
}

impl ClientSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.reconnect_attempts.max(1),
            delay: self.reconnect_delay,
        }
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_CONFIG_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then the optional TOML file, then `APP__*` environment overrides.
pub fn load_settings_from(
    config_path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(config_path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => {
                let lookup = |key: &str| file_cfg.get(key).map(toml_value_to_string);
                apply_overrides(&mut settings, lookup);
            }
            Err(err) => warn!(
                path = %config_path.display(),
                "ignoring unparseable client config: {err}"
            ),
        }
    }

    apply_overrides(&mut settings, |key| env(&format!("APP__{}", key.to_ascii_uppercase())));
    settings
}

fn apply_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("server_url") {
        settings.server_url = v.trim_end_matches('/').to_string();
    }
    if let Some(v) = lookup("channel_path") {
        settings.channel_path = v;
    }
    if let Some(v) = lookup("session_database_url") {
        settings.session_database_url = v;
    }
    if let Some(v) = lookup("reconnect_attempts").and_then(|v| v.parse().ok()) {
        settings.reconnect_attempts = v;
    }
    if let Some(v) = lookup("reconnect_delay_ms").and_then(|v| v.parse().ok()) {
        settings.reconnect_delay = Duration::from_millis(v);
    }
    if let Some(v) = lookup("typing_idle_ms").and_then(|v| v.parse().ok()) {
        settings.typing_idle = Duration::from_millis(v);
    }
    if let Some(v) = lookup("unread_poll_interval_ms").and_then(|v| v.parse().ok()) {
        settings.unread_poll_interval = Duration::from_millis(v);
    }
    if let Some(v) = lookup("notification_preview_chars").and_then(|v| v.parse().ok()) {
        settings.notification_preview_chars = v;
    }
}

fn toml_value_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
