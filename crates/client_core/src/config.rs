use std::{fs, path::PathBuf, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use url::Url;

use crate::{error::ConnectionError, retry::BackoffPolicy};

const DEFAULT_CONFIG_FILE: &str = "client.toml";
const CONFIG_PATH_ENV: &str = "CHAT_CLIENT_CONFIG";
const HUB_PATH: &str = "hub";
const MAX_PAGE_SIZE: u32 = 100;

/// Notification toggles. Persisting them is the embedding app's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub notifications_enabled: bool,
    pub sound_enabled: bool,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            notifications_enabled: true,
            sound_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    pub hub_url: Option<String>,
    pub user_id: String,
    pub page_size: u32,
    pub invoke_timeout_ms: u64,
    pub typing_ttl_ms: u64,
    pub echo_match_window_ms: u64,
    pub reconnect: BackoffPolicy,
    pub initial_connect: BackoffPolicy,
    /// Message sequences kept for inactive conversations. `0` keeps all.
    pub max_cached_conversations: usize,
    pub chat: ChatSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".into(),
            hub_url: None,
            user_id: String::new(),
            page_size: 50,
            invoke_timeout_ms: 10_000,
            typing_ttl_ms: 3_000,
            echo_match_window_ms: 5_000,
            reconnect: BackoffPolicy::reconnect(),
            initial_connect: BackoffPolicy::initial_connect(),
            max_cached_conversations: 50,
            chat: ChatSettings::default(),
        }
    }
}

impl ClientSettings {
    pub fn page_size(&self) -> u32 {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_millis(self.typing_ttl_ms)
    }

    pub fn echo_match_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.echo_match_window_ms as i64)
    }

    /// Hub endpoint: the explicit `hub_url`, or `server_url` with its scheme
    /// switched to ws/wss and `/hub` appended.
    pub fn hub_url(&self) -> Result<String, ConnectionError> {
        if let Some(hub_url) = &self.hub_url {
            return Ok(hub_url.clone());
        }

        let mut url = Url::parse(self.server_url.trim_end_matches('/'))
            .map_err(|_| ConnectionError::InvalidUrl(self.server_url.clone()))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            _ => return Err(ConnectionError::InvalidUrl(self.server_url.clone())),
        };
        url.set_scheme(scheme)
            .map_err(|_| ConnectionError::InvalidUrl(self.server_url.clone()))?;
        let path = format!("{}/{HUB_PATH}", url.path().trim_end_matches('/'));
        url.set_path(&path);
        Ok(url.to_string())
    }
}

pub fn load_settings() -> anyhow::Result<ClientSettings> {
    let path = std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut settings = if path.exists() {
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read client config '{}'", path.display()))?;
        toml::from_str::<ClientSettings>(&raw)
            .with_context(|| format!("failed to parse client config '{}'", path.display()))?
    } else {
        ClientSettings::default()
    };

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_env_overrides(settings: &mut ClientSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("APP__HUB_URL") {
        settings.hub_url = Some(v);
    }
    if let Some(v) = var("APP__USER_ID") {
        settings.user_id = v;
    }
    if let Some(parsed) = var("APP__PAGE_SIZE").and_then(|v| v.parse().ok()) {
        settings.page_size = parsed;
    }
    if let Some(parsed) = var("APP__TYPING_TTL_MS").and_then(|v| v.parse().ok()) {
        settings.typing_ttl_ms = parsed;
    }
    if let Some(parsed) = var("APP__MAX_CACHED_CONVERSATIONS").and_then(|v| v.parse().ok()) {
        settings.max_cached_conversations = parsed;
    }
    if let Some(parsed) = var("APP__NOTIFICATIONS").and_then(|v| parse_flag(&v)) {
        settings.chat.notifications_enabled = parsed;
    }
    if let Some(parsed) = var("APP__SOUND").and_then(|v| parse_flag(&v)) {
        settings.chat.sound_enabled = parsed;
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
