//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub supabase: SupabaseConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub realtime: RealtimeConfig,

    #[serde(default)]
    pub dashboard: DashboardConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Hosted project endpoint and public key
#[derive(Debug, Clone, Deserialize)]
pub struct SupabaseConfig {
    /// Project URL, e.g. "https://abcd.supabase.co"
    #[serde(default)]
    pub url: String,

    /// Public (anon) API key
    #[serde(default)]
    pub anon_key: String,

    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default = "default_schema")]
    pub schema: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_table() -> String {
    "bookmarks".to_string()
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for SupabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            anon_key: String::new(),
            table: default_table(),
            schema: default_schema(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl SupabaseConfig {
    /// Project URL without a trailing slash
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    /// Fail unless both the endpoint and the key are set
    pub fn require(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Missing("supabase.url"));
        }
        if self.anon_key.trim().is_empty() {
            return Err(ConfigError::Missing("supabase.anon_key"));
        }
        Ok(())
    }
}

/// Sign-in settings
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Local port for the OAuth callback listener
    #[serde(default = "default_callback_port")]
    pub callback_port: u16,

    /// Forwarded to the identity provider; "select_account" forces the picker
    #[serde(default = "default_prompt")]
    pub prompt: String,

    /// Refresh sessions this close to expiry
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: i64,
}

fn default_provider() -> String {
    "google".to_string()
}

fn default_callback_port() -> u16 {
    54321
}

fn default_prompt() -> String {
    "select_account".to_string()
}

fn default_refresh_margin() -> i64 {
    60
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            callback_port: default_callback_port(),
            prompt: default_prompt(),
            refresh_margin_secs: default_refresh_margin(),
        }
    }
}

impl AuthConfig {
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}/auth/callback", self.callback_port)
    }
}

/// Change feed connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default = "default_channel")]
    pub channel: String,

    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,

    #[serde(default = "default_max_reconnect")]
    pub max_reconnect_attempts: u32,
}

fn default_channel() -> String {
    "bookmarks-realtime".to_string()
}

fn default_heartbeat() -> u64 {
    30
}

fn default_max_reconnect() -> u32 {
    5
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            heartbeat_secs: default_heartbeat(),
            max_reconnect_attempts: default_max_reconnect(),
        }
    }
}

/// Dashboard presentation settings
#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    /// How long a freshly inserted bookmark stays highlighted
    #[serde(default = "default_highlight_ms")]
    pub highlight_ms: i64,

    #[serde(default = "default_date_format")]
    pub date_format: String,
}

fn default_highlight_ms() -> i64 {
    1500
}

fn default_date_format() -> String {
    "%b %-d, %Y".to_string()
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            highlight_ms: default_highlight_ms(),
            date_format: default_date_format(),
        }
    }
}

/// Local persisted state
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("linkshelf").to_string_lossy().to_string())
        .unwrap_or_else(|| "./linkshelf_data".to_string())
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    /// Data directory with a leading `~/` expanded
    pub fn data_path(&self) -> PathBuf {
        match (self.data_dir.strip_prefix("~/"), dirs::home_dir()) {
            (Some(rest), Some(home)) => home.join(rest),
            _ => PathBuf::from(&self.data_dir),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Where a config file is looked for when none is named, in order
    pub fn default_paths() -> Vec<PathBuf> {
        [
            dirs::config_dir().map(|p| p.join("linkshelf").join("config.toml")),
            Some(PathBuf::from("./linkshelf.toml")),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Load the first of `paths` that exists, or defaults plus environment
    ///
    /// Returns the path that was used. A file that exists but cannot be
    /// read or parsed is an error rather than a silent fallback.
    pub fn load_first(paths: &[PathBuf]) -> Result<(Self, Option<PathBuf>), ConfigError> {
        match paths.iter().find(|p| p.exists()) {
            Some(path) => Ok((Self::load_with_env(path)?, Some(path.clone()))),
            None => Ok((Self::from_env(), None)),
        }
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        match Self::load_first(&Self::default_paths()) {
            Ok((config, path)) => {
                tracing::debug!(path = ?path, "Loaded config");
                config
            }
            Err(e) => {
                tracing::warn!("{}, using defaults", e);
                Self::from_env()
            }
        }
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("LINKSHELF_SUPABASE_URL") {
            self.supabase.url = url;
        }
        if let Some(key) = lookup("LINKSHELF_SUPABASE_ANON_KEY") {
            self.supabase.anon_key = key;
        }

        if let Some(data_dir) = lookup("LINKSHELF_DATA_DIR") {
            self.storage.data_dir = data_dir;
        }

        if let Some(port) = lookup("LINKSHELF_CALLBACK_PORT") {
            if let Ok(p) = port.parse() {
                self.auth.callback_port = p;
            }
        }

        if let Some(level) = lookup("LINKSHELF_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("LINKSHELF_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Missing required setting `{0}` (set it in config.toml or the environment)")]
    Missing(&'static str),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Linkshelf Configuration
#
# Environment variables override these settings:
# - LINKSHELF_SUPABASE_URL
# - LINKSHELF_SUPABASE_ANON_KEY
# - LINKSHELF_DATA_DIR
# - LINKSHELF_CALLBACK_PORT
# - LINKSHELF_LOG_LEVEL
# - LINKSHELF_LOG_FORMAT

[supabase]
# Project URL and public anon key (Project Settings > API)
url = ""
anon_key = ""

# Table holding bookmark rows
table = "bookmarks"
schema = "public"

# HTTP request timeout in seconds
request_timeout_secs = 30

[auth]
# OAuth provider enabled on the project
provider = "google"

# Local port for the OAuth callback; add
# http://localhost:54321/auth/callback to the project's redirect URLs
callback_port = 54321

# Forces the account picker every time
prompt = "select_account"

# Refresh the session this many seconds before it expires
refresh_margin_secs = 60

[realtime]
channel = "bookmarks-realtime"
heartbeat_secs = 30
max_reconnect_attempts = 5

[dashboard]
# How long new bookmarks stay highlighted (ms)
highlight_ms = 1500
date_format = "%b %-d, %Y"

[storage]
# Directory for the persisted session
data_dir = "~/.local/share/linkshelf"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty or json
format = "pretty"
"#
    .to_string()
}
