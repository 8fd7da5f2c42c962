use std::{collections::HashMap, fs, path::Path, time::Duration};

use server_api::{
    delivery::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_REPLAY_LIMIT},
    DeliveryConfig,
};
use storage::MEMORY_STORE_URL;

pub const CONFIG_FILE: &str = "server.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub server_bind: String,
    pub store_url: String,
    pub heartbeat_secs: u64,
    pub replay_limit: usize,
    pub max_active_streams: usize,
    pub max_request_bytes: usize,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:50051".into(),
            store_url: "sqlite://./data/chat.db".into(),
            heartbeat_secs: DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
            replay_limit: DEFAULT_REPLAY_LIMIT,
            max_active_streams: 10,
            max_request_bytes: 64 * 1024,
            log_filter: "info".into(),
        }
    }
}

impl Settings {
    pub fn delivery(&self) -> DeliveryConfig {
        DeliveryConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            replay_limit: self.replay_limit,
        }
    }
}

/// Defaults, then `server.toml` in the working directory, then the environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    apply_file(&mut settings, Path::new(CONFIG_FILE));
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings.store_url = normalize_store_url(&settings.store_url);
    settings
}

fn apply_file(settings: &mut Settings, path: &Path) {
    let Ok(raw) = fs::read_to_string(path) else {
        return;
    };
    match toml::from_str::<HashMap<String, String>>(&raw) {
        Ok(file_cfg) => apply_values(settings, |key| file_cfg.get(key).cloned()),
        Err(error) => tracing::warn!(path = %path.display(), %error, "ignoring unreadable config file"),
    }
}

fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = lookup("STORE_URL") {
        settings.store_url = v;
    }
    apply_values(settings, |key| lookup(&format!("APP__{}", key.to_uppercase())));
}

fn apply_values(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("bind_addr") {
        settings.server_bind = v;
    }
    if let Some(v) = lookup("store_url") {
        settings.store_url = v;
    }
    if let Some(v) = lookup("heartbeat_secs").and_then(|v| v.parse().ok()) {
        settings.heartbeat_secs = v;
    }
    if let Some(v) = lookup("replay_limit").and_then(|v| v.parse().ok()) {
        settings.replay_limit = v;
    }
    if let Some(v) = lookup("max_active_streams").and_then(|v| v.parse().ok()) {
        settings.max_active_streams = v;
    }
    if let Some(v) = lookup("max_request_bytes").and_then(|v| v.parse().ok()) {
        settings.max_request_bytes = v;
    }
    if let Some(v) = lookup("log_filter") {
        settings.log_filter = v;
    }
}

/// Accepts `memory:`, sqlite URLs, and bare file paths.
pub fn normalize_store_url(raw_store_url: &str) -> String {
    let raw_store_url = raw_store_url.trim();

    if raw_store_url.is_empty() {
        return Settings::default().store_url;
    }

    if raw_store_url == MEMORY_STORE_URL
        || raw_store_url.starts_with("sqlite::memory:")
        || raw_store_url.starts_with("sqlite://")
    {
        return raw_store_url.to_string();
    }

    if let Some(path) = raw_store_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_store_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
