use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server_url: String,
    /// sqlx url of the local account database.
    pub database_url: String,
    /// Enables the lock-ordering assertions in front of the group lock.
    pub strict_lock_checks: bool,
    pub group_lock_timeout_ms: u64,
    pub http_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            database_url: "sqlite://./data/client.db".into(),
            strict_lock_checks: cfg!(debug_assertions),
            group_lock_timeout_ms: 5000,
            http_timeout_secs: 30,
        }
    }
}

impl Settings {
    pub fn group_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.group_lock_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new("client.toml"), |key| std::env::var(key).ok())
}

pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<Settings>(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(path = %path.display(), "config: ignoring malformed settings file: {err}");
                Settings::default()
            }
        },
        Err(_) => Settings::default(),
    };

    if let Some(v) = env("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__STRICT_LOCK_CHECKS") {
        match parse_flag(&v) {
            Some(strict) => settings.strict_lock_checks = strict,
            None => warn!(value = %v, "config: ignoring unrecognized APP__STRICT_LOCK_CHECKS"),
        }
    }
    if let Some(v) = env("APP__GROUP_LOCK_TIMEOUT_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.group_lock_timeout_ms = parsed;
        }
    }
    if let Some(v) = env("APP__HTTP_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.http_timeout_secs = parsed;
        }
    }

    settings
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
