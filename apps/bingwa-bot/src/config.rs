use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const APP_NAME: &str = "Bingwa Data Deals Bot";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

const CONFIG_PATHS: [&str; 2] = ["./bingwa.toml", "/etc/bingwa/bot.toml"];

#[derive(Clone, Deserialize)]
pub struct PayHeroConfig {
    pub username: String,
    pub password: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_channel_id")]
    pub channel_id: u32,
    #[serde(default)]
    pub callback_url: String,
    /// Shared secret PayHero must echo back as `?token=` on the callback URL.
    #[serde(default)]
    pub callback_token: Option<String>,
    #[serde(default = "default_gateway_timeout")]
    pub timeout_secs: u64,
}

impl PayHeroConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl fmt::Debug for PayHeroConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayHeroConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("channel_id", &self.channel_id)
            .field("callback_url", &"<redacted>")
            .field("callback_token", &self.callback_token.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Clone, Deserialize)]
pub struct BotConfig {
    pub bot_token: String,
    pub payhero: PayHeroConfig,
    #[serde(default)]
    pub admin_ids: HashSet<i64>,
    #[serde(default = "default_callback_listen")]
    pub callback_listen: SocketAddr,
    #[serde(default = "default_user_data_file")]
    pub user_data_file: PathBuf,
    #[serde(default)]
    pub catalog_file: Option<PathBuf>,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_payment_timeout")]
    pub payment_timeout_secs: u64,
    #[serde(default = "default_unresolved_ttl")]
    pub unresolved_ttl_secs: u64,
    #[serde(default = "default_batch_size")]
    pub broadcast_batch_size: usize,
    #[serde(default = "default_batch_pause")]
    pub broadcast_pause_ms: u64,
    #[serde(default = "default_support_contact")]
    pub support_contact: String,
    #[serde(default = "default_support_phone")]
    pub support_phone: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotConfig")
            .field("bot_token", &"<redacted>")
            .field("payhero", &self.payhero)
            .field("admin_count", &self.admin_ids.len())
            .field("callback_listen", &self.callback_listen)
            .field("user_data_file", &self.user_data_file)
            .field("catalog_file", &self.catalog_file)
            .field("session_timeout_secs", &self.session_timeout_secs)
            .field("payment_timeout_secs", &self.payment_timeout_secs)
            .finish_non_exhaustive()
    }
}

impl BotConfig {
    /// TOML file first, then the process environment (after `.env`).
    pub fn load() -> Result<Self> {
        for path in CONFIG_PATHS {
            if let Ok(contents) = std::fs::read_to_string(path) {
                tracing::info!("Loading config from {}", path);
                return Self::from_toml(&contents).with_context(|| format!("Invalid config file {}", path));
            }
        }

        tracing::info!("Loading config from environment");
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .with_context(|| format!("{} must be set", key))
        };

        let payhero = PayHeroConfig {
            username: required("API_USERNAME")?,
            password: required("API_PASSWORD")?,
            base_url: lookup("PAYHERO_BASE_URL").unwrap_or_else(default_base_url),
            channel_id: parse_or(&lookup, "PAYHERO_CHANNEL_ID", default_channel_id())?,
            callback_url: lookup("PAYHERO_CALLBACK_URL").unwrap_or_default(),
            callback_token: lookup("PAYHERO_CALLBACK_TOKEN").filter(|v| !v.trim().is_empty()),
            timeout_secs: parse_or(&lookup, "GATEWAY_TIMEOUT_SECS", default_gateway_timeout())?,
        };

        Ok(Self {
            bot_token: required("BOT_TOKEN")?,
            payhero,
            admin_ids: parse_admin_ids(&lookup("ADMIN_USER_IDS").unwrap_or_default()),
            callback_listen: parse_or(&lookup, "CALLBACK_LISTEN", default_callback_listen())?,
            user_data_file: lookup("USER_DATA_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(default_user_data_file),
            catalog_file: lookup("CATALOG_FILE").filter(|v| !v.is_empty()).map(PathBuf::from),
            session_timeout_secs: parse_or(&lookup, "SESSION_TIMEOUT_SECS", default_session_timeout())?,
            payment_timeout_secs: parse_or(&lookup, "PAYMENT_TIMEOUT_SECS", default_payment_timeout())?,
            unresolved_ttl_secs: parse_or(&lookup, "UNRESOLVED_PAYMENT_TTL_SECS", default_unresolved_ttl())?,
            broadcast_batch_size: parse_or(&lookup, "BROADCAST_BATCH_SIZE", default_batch_size())?,
            broadcast_pause_ms: parse_or(&lookup, "BROADCAST_PAUSE_MS", default_batch_pause())?,
            support_contact: lookup("SUPPORT_CONTACT").unwrap_or_else(default_support_contact),
            support_phone: lookup("SUPPORT_PHONE").unwrap_or_else(default_support_phone),
            log_dir: lookup("LOG_DIR").map(PathBuf::from).unwrap_or_else(default_log_dir),
        })
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_secs(self.payment_timeout_secs)
    }

    pub fn unresolved_ttl(&self) -> Duration {
        Duration::from_secs(self.unresolved_ttl_secs)
    }

    pub fn broadcast_pause(&self) -> Duration {
        Duration::from_millis(self.broadcast_pause_ms)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}={:?}: {}", key, raw, e)),
        None => Ok(default),
    }
}

/// Comma-separated Telegram ids. Malformed entries are skipped.
pub fn parse_admin_ids(raw: &str) -> HashSet<i64> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<i64>() {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::warn!("Ignoring malformed admin id {:?}", s);
                None
            }
        })
        .collect()
}

fn default_base_url() -> String {
    "https://backend.payhero.co.ke".to_string()
}

fn default_channel_id() -> u32 {
    2486
}

fn default_gateway_timeout() -> u64 {
    30
}

fn default_callback_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_user_data_file() -> PathBuf {
    PathBuf::from("user_data.json")
}

fn default_session_timeout() -> u64 {
    180
}

fn default_payment_timeout() -> u64 {
    120
}

fn default_unresolved_ttl() -> u64 {
    24 * 60 * 60
}

fn default_batch_size() -> usize {
    25
}

fn default_batch_pause() -> u64 {
    1000
}

fn default_support_contact() -> String {
    "@bingwamta".to_string()
}

fn default_support_phone() -> String {
    "0707071631".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}
