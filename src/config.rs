use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::bot::database::DEFAULT_TABLE;
use crate::bot::datamall::DEFAULT_BASE_URL;

static TABLE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file '{}': {source}", .path.display())]
    ParseJson { path: PathBuf, source: serde_json::Error },
    #[error("config validation error: {0}")]
    Validation(String),
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    telegram_bot_token: String,
    /// LTA DataMall account key
    #[serde(default)]
    lta_api_key: String,
    lta_base_url: Option<String>,
    /// Directory for the database and logs. Defaults to current directory.
    data_dir: Option<String>,
    table_name: Option<String>,
    /// IANA name, e.g. "Asia/Singapore"
    timezone: Option<String>,
    #[serde(default = "default_tick_interval_secs")]
    tick_interval_secs: u64,
    #[serde(default = "default_upstream_timeout_secs")]
    upstream_timeout_secs: u64,
    #[serde(default = "default_upstream_retries")]
    upstream_retries: u32,
    #[serde(default = "default_session_ttl_minutes")]
    session_ttl_minutes: u64,
    #[serde(default = "default_cache_ttl_hours")]
    cache_ttl_hours: u64,
    #[serde(default = "default_cache_max_routes")]
    cache_max_routes: u64,
    #[serde(default = "default_buslist_page_size")]
    buslist_page_size: usize,
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_upstream_timeout_secs() -> u64 {
    5
}

fn default_upstream_retries() -> u32 {
    3
}

fn default_session_ttl_minutes() -> u64 {
    30
}

fn default_cache_ttl_hours() -> u64 {
    24
}

fn default_cache_max_routes() -> u64 {
    500
}

fn default_buslist_page_size() -> usize {
    10
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            telegram_bot_token: String::new(),
            lta_api_key: String::new(),
            lta_base_url: None,
            data_dir: None,
            table_name: None,
            timezone: None,
            tick_interval_secs: default_tick_interval_secs(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
            upstream_retries: default_upstream_retries(),
            session_ttl_minutes: default_session_ttl_minutes(),
            cache_ttl_hours: default_cache_ttl_hours(),
            cache_max_routes: default_cache_max_routes(),
            buslist_page_size: default_buslist_page_size(),
        }
    }
}

pub struct Config {
    /// Path the config was read from, if any.
    pub config_path: Option<PathBuf>,
    pub telegram_bot_token: String,
    pub lta_api_key: String,
    pub lta_base_url: String,
    pub data_dir: PathBuf,
    /// SQLite table holding reminders.
    pub table_name: String,
    /// Zone reminder times are interpreted in.
    pub timezone: Tz,
    pub tick_interval: Duration,
    /// Per-request HTTP timeout; also bounds each scheduled arrival lookup.
    pub upstream_timeout: Duration,
    pub upstream_retries: u32,
    pub session_ttl: Duration,
    pub cache_ttl: Duration,
    pub cache_max_routes: u64,
    pub buslist_page_size: usize,
}

impl Config {
    /// Load from an optional JSON file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    pub fn load_with_env(
        path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut file = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
                    path: path.to_path_buf(),
                    source: e,
                })?;
                serde_json::from_str::<ConfigFile>(&content).map_err(|e| ConfigError::ParseJson {
                    path: path.to_path_buf(),
                    source: e,
                })?
            }
            None => ConfigFile::default(),
        };

        let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        if let Some(token) = non_empty("TELEGRAM_BOT_TOKEN") {
            file.telegram_bot_token = token;
        }
        if let Some(key) = non_empty("LTA_API_KEY") {
            file.lta_api_key = key;
        }
        if let Some(table) = non_empty("BUSBUDDY_TABLE_NAME") {
            file.table_name = Some(table);
        }
        if let Some(tz) = non_empty("BUSBUDDY_TIMEZONE") {
            file.timezone = Some(tz);
        }

        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token is required (or set TELEGRAM_BOT_TOKEN)".into(),
            ));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into(),
            ));
        }
        if file.lta_api_key.trim().is_empty() {
            return Err(ConfigError::Validation(
                "lta_api_key is required (or set LTA_API_KEY)".into(),
            ));
        }

        let table_name = file.table_name.unwrap_or_else(|| DEFAULT_TABLE.to_string());
        if !TABLE_NAME.is_match(&table_name) {
            return Err(ConfigError::Validation(format!(
                "table_name '{table_name}' must be letters, digits and underscores"
            )));
        }

        let timezone_name = file.timezone.unwrap_or_else(|| "Asia/Singapore".to_string());
        let timezone: Tz = timezone_name.parse().map_err(|_| {
            ConfigError::Validation(format!("unknown timezone '{timezone_name}'"))
        })?;

        for (name, value) in [
            ("tick_interval_secs", file.tick_interval_secs),
            ("upstream_timeout_secs", file.upstream_timeout_secs),
            ("session_ttl_minutes", file.session_ttl_minutes),
            ("cache_ttl_hours", file.cache_ttl_hours),
            ("cache_max_routes", file.cache_max_routes),
            ("buslist_page_size", file.buslist_page_size as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{name} must be positive")));
            }
        }

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            config_path: path.map(Path::to_path_buf),
            telegram_bot_token: file.telegram_bot_token,
            lta_api_key: file.lta_api_key.trim().to_string(),
            lta_base_url: file
                .lta_base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            data_dir,
            table_name,
            timezone,
            tick_interval: Duration::from_secs(file.tick_interval_secs),
            upstream_timeout: Duration::from_secs(file.upstream_timeout_secs),
            upstream_retries: file.upstream_retries.max(1),
            session_ttl: Duration::from_secs(file.session_ttl_minutes * 60),
            cache_ttl: Duration::from_secs(file.cache_ttl_hours * 60 * 60),
            cache_max_routes: file.cache_max_routes,
            buslist_page_size: file.buslist_page_size,
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("reminders.db")
    }
}
