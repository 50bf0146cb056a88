use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    /// Default locator handed to registrations that do not bring their own.
    pub tunables_file: String,
    pub event_capacity: usize,
    pub max_poll_wait_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8787".into(),
            tunables_file: "./data/tunables.toml".into(),
            event_capacity: 500,
            max_poll_wait_ms: 30_000,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = std::fs::read_to_string("server.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("bind_addr") {
                settings.server_bind = v.clone();
            }
            if let Some(v) = file_cfg.get("tunables_file") {
                settings.tunables_file = v.clone();
            }
            if let Some(v) = file_cfg.get("event_capacity") {
                if let Ok(parsed) = v.parse::<usize>() {
                    settings.event_capacity = parsed;
                }
            }
            if let Some(v) = file_cfg.get("max_poll_wait_ms") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.max_poll_wait_ms = parsed;
                }
            }
        }
    }

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Ok(v) = std::env::var("TUNABLES_FILE") {
        settings.tunables_file = v;
    }
    if let Ok(v) = std::env::var("APP__TUNABLES_FILE") {
        settings.tunables_file = v;
    }

    if let Ok(v) = std::env::var("APP__EVENT_CAPACITY") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.event_capacity = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__MAX_POLL_WAIT_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.max_poll_wait_ms = parsed;
        }
    }

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
