use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

pub const CONFIG_PATH: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrackedPlayer {
    pub name: String,
    #[serde(alias = "id")]
    pub account_id: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub webhook_enabled: bool,
    #[serde(default)]
    pub players: Vec<TrackedPlayer>,
}

impl FileConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        Self::parse(&text).with_context(|| format!("Invalid config {:?}", path))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// 0 posts to production, 1 routes posts to the debug webhook, 2 also dumps payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct DebugLevel(pub u8);

impl DebugLevel {
    pub fn routes_to_debug(&self) -> bool {
        self.0 >= 1
    }

    pub fn dumps_payloads(&self) -> bool {
        self.0 >= 2
    }
}

/// Environment-driven settings.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub stratz_token: String,
    pub gist_id: Option<String>,
    pub gist_token: Option<String>,
    pub prod_webhook: Option<String>,
    pub debug_webhook: Option<String>,
    pub debug_level: DebugLevel,
    pub pending_expiry: Option<Duration>,
    pub force_fallback: bool,
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn flag(key: &str) -> bool {
    non_empty(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let stratz_token = non_empty("STRATZ_TOKEN")
            .ok_or_else(|| anyhow::anyhow!("STRATZ_TOKEN must be set"))?;

        let debug_level = match non_empty("DEBUG_LEVEL") {
            Some(raw) => match raw.parse::<u8>() {
                Ok(v) => DebugLevel(v),
                Err(_) => {
                    warn!("Ignoring invalid DEBUG_LEVEL '{}'", raw);
                    DebugLevel::default()
                }
            },
            None => DebugLevel::default(),
        };

        let pending_expiry = match non_empty("PENDING_EXPIRE_SEC") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) => Some(Duration::from_secs(secs)),
                Err(_) => {
                    warn!("Ignoring invalid PENDING_EXPIRE_SEC '{}'", raw);
                    None
                }
            },
            None => None,
        };

        let settings = Self {
            stratz_token,
            gist_id: non_empty("GIST_ID"),
            gist_token: non_empty("GIST_TOKEN"),
            prod_webhook: non_empty("DISCORD_WEBHOOK_PROD"),
            debug_webhook: non_empty("DISCORD_WEBHOOK_DEBUG"),
            debug_level,
            pending_expiry,
            force_fallback: flag("TEST_FORCE_FALLBACK"),
        };
        info!(
            "Settings: debug level {}, gist {}, force fallback {}",
            settings.debug_level.0,
            if settings.gist_id.is_some() { "on" } else { "off" },
            settings.force_fallback
        );
        Ok(settings)
    }

    /// Debug webhook that replaces every post destination, if active.
    pub fn debug_override(&self) -> Option<String> {
        if self.debug_level.routes_to_debug() {
            self.debug_webhook.clone()
        } else {
            None
        }
    }

    /// Destination handed to posts before the debug override is applied.
    pub fn post_destination(&self, file: &FileConfig) -> Option<String> {
        if let Some(prod) = &self.prod_webhook {
            return Some(prod.clone());
        }
        if file.webhook_enabled && !file.webhook_url.trim().is_empty() {
            return Some(file.webhook_url.trim().to_string());
        }
        self.debug_override()
    }
}
