use std::{fs, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_MESSAGE_LENGTH: usize = 500;
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub backend_url: String,
    pub reconnect_delay_ms: u64,
    pub channel_page_size: u32,
    pub message_page_size: u32,
    pub max_message_length: usize,
    pub session_cache: bool,
    pub session_cache_path: Option<PathBuf>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:3000".into(),
            reconnect_delay_ms: RECONNECT_DELAY.as_millis() as u64,
            channel_page_size: DEFAULT_PAGE_SIZE,
            message_page_size: DEFAULT_PAGE_SIZE,
            max_message_length: MAX_MESSAGE_LENGTH,
            session_cache: false,
            session_cache_path: None,
        }
    }
}

impl ClientSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Defaults, then `client.toml` in the working directory, then the environment.
pub fn load_settings() -> ClientSettings {
    let settings = match fs::read_to_string("client.toml") {
        Ok(raw) => parse_settings(&raw),
        Err(_) => ClientSettings::default(),
    };
    apply_env_overrides(settings, |name| std::env::var(name).ok())
}

pub fn parse_settings(raw: &str) -> ClientSettings {
    match toml::from_str::<ClientSettings>(raw) {
        Ok(mut settings) => {
            settings.backend_url = normalize_backend_url(&settings.backend_url);
            settings
        }
        Err(err) => {
            warn!("config: ignoring unreadable client.toml: {err}");
            ClientSettings::default()
        }
    }
}

pub fn apply_env_overrides(
    mut settings: ClientSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    if let Some(v) = lookup("PUBLIC_BACKEND_URL") {
        settings.backend_url = normalize_backend_url(&v);
    }
    if let Some(v) = lookup("APP__BACKEND_URL") {
        settings.backend_url = normalize_backend_url(&v);
    }

    if let Some(v) = lookup("APP__RECONNECT_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_delay_ms = parsed;
        }
    }

    if let Some(v) = lookup("APP__SESSION_CACHE") {
        if let Ok(parsed) = v.parse::<bool>() {
            settings.session_cache = parsed;
        }
    }

    if let Some(v) = lookup("APP__SESSION_CACHE_PATH") {
        settings.session_cache_path = Some(PathBuf::from(v));
    }

    settings
}

fn normalize_backend_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return ClientSettings::default().backend_url;
    }
    trimmed.to_string()
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
