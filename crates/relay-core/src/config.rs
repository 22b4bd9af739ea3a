//! Configuration management for relay.
//!
//! Loads configuration from ${RELAY_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Which part of the conversation is sent with each reply request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HistoryWindow {
    /// Send every agent-visible message.
    #[default]
    Full,
    /// Send only messages at or after the session's promoted-history mark.
    Promoted,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `relay_core=debug`.
    pub level: String,
    /// Whether to write to `${RELAY_HOME}/logs/relay.log`.
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: true,
        }
    }
}

/// Returns the default config template.
///
/// This is embedded from default_config.toml at compile time.
fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

/// Merges user config values into the default template.
///
/// New comments from the template stay present while the user's values win.
fn merge_with_template(user_config: &str) -> Result<String> {
    use toml_edit::DocumentMut;

    let mut doc: DocumentMut = default_config_template()
        .parse()
        .context("Failed to parse default config template")?;
    let user_doc: DocumentMut = user_config.parse().context("Failed to parse user config")?;

    merge_items(doc.as_table_mut(), user_doc.as_table());

    Ok(doc.to_string())
}

fn merge_items(target: &mut toml_edit::Table, source: &toml_edit::Table) {
    use toml_edit::Item;

    for (key, value) in source.iter() {
        match value {
            Item::Value(v) => {
                target[key] = Item::Value(v.clone());
            }
            Item::Table(src_table) => {
                if let Some(Item::Table(target_table)) = target.get_mut(key) {
                    merge_items(target_table, src_table);
                } else {
                    target[key] = Item::Table(src_table.clone());
                }
            }
            Item::ArrayOfTables(src_arr) => {
                target[key] = Item::ArrayOfTables(src_arr.clone());
            }
            Item::None => {}
        }
    }
}

/// Writes a file atomically (temp file + rename), creating parent directories.
pub(crate) fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            tmp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}

pub mod paths {
    //! Path resolution for relay configuration and data directories.
    //!
    //! RELAY_HOME resolution order:
    //! 1. RELAY_HOME environment variable (if set)
    //! 2. ~/.config/relay (default)

    use std::path::PathBuf;

    /// Returns the relay home directory.
    pub fn relay_home() -> PathBuf {
        if let Ok(home) = std::env::var("RELAY_HOME")
            && !home.trim().is_empty()
        {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || std::env::temp_dir().join("relay"),
            |h| h.join(".config").join("relay"),
        )
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        relay_home().join("config.toml")
    }

    /// Returns the path to the local state file (config schema version).
    pub fn state_path() -> PathBuf {
        relay_home().join("state.toml")
    }

    pub fn logs_dir() -> PathBuf {
        relay_home().join("logs")
    }

    /// Directory holding one marker file per accepted recipe hash.
    pub fn recipe_hashes_dir() -> PathBuf {
        relay_home().join("recipe_hashes")
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the agent server.
    pub server_url: String,

    /// Shared secret sent as `X-Secret-Key`.
    pub secret_key: Option<String>,

    /// Working directory reported for new sessions.
    pub working_dir: Option<PathBuf>,

    /// Timeout for non-streaming requests, in seconds (0 disables).
    pub request_timeout_secs: u64,

    /// Ceiling for held stream resources, in seconds.
    pub stream_watchdog_secs: u64,

    pub history_window: HistoryWindow,

    pub input_history_limit: usize,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3000";
    const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
    pub const DEFAULT_STREAM_WATCHDOG_SECS: u64 = 900;
    pub const DEFAULT_INPUT_HISTORY_LIMIT: usize = 200;

    /// Loads configuration from the default config path.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Creates a default config file at the given path.
    /// Returns an error if the file already exists.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        write_atomic(path, default_config_template())
    }

    /// Saves only the server_url field, preserving comments and other values.
    ///
    /// Creates the file with the default template if it doesn't exist.
    pub fn save_server_url_to(path: &Path, url: &str) -> Result<()> {
        use toml_edit::{DocumentMut, value};

        validate_url(url)?;

        let contents = if path.exists() {
            let user_config = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            merge_with_template(&user_config)?
        } else {
            default_config_template().to_string()
        };

        let mut doc: DocumentMut = contents
            .parse()
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        doc["server_url"] = value(url);

        write_atomic(path, &doc.to_string())
    }

    /// Server URL with precedence: RELAY_SERVER_URL > config > default.
    pub fn effective_server_url(&self) -> Result<url::Url> {
        let env = std::env::var("RELAY_SERVER_URL").ok();
        resolve_server_url(env.as_deref(), Some(&self.server_url))
    }

    /// Secret with precedence: RELAY_SECRET_KEY > config.
    pub fn effective_secret_key(&self) -> Option<String> {
        std::env::var("RELAY_SECRET_KEY")
            .ok()
            .or_else(|| self.secret_key.clone())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Configured working directory, or the process cwd.
    pub fn effective_working_dir(&self) -> Result<PathBuf> {
        match &self.working_dir {
            Some(dir) => Ok(dir.clone()),
            None => std::env::current_dir().context("Failed to read current directory"),
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    pub fn stream_watchdog(&self) -> Duration {
        Duration::from_secs(self.stream_watchdog_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: Self::DEFAULT_SERVER_URL.to_string(),
            secret_key: None,
            working_dir: None,
            request_timeout_secs: Self::DEFAULT_REQUEST_TIMEOUT_SECS,
            stream_watchdog_secs: Self::DEFAULT_STREAM_WATCHDOG_SECS,
            history_window: HistoryWindow::default(),
            input_history_limit: Self::DEFAULT_INPUT_HISTORY_LIMIT,
            logging: LoggingConfig::default(),
        }
    }
}

fn resolve_server_url(env_url: Option<&str>, config_url: Option<&str>) -> Result<url::Url> {
    for candidate in [env_url, config_url].into_iter().flatten() {
        let trimmed = candidate.trim();
        if !trimmed.is_empty() {
            return validate_url(trimmed);
        }
    }

    validate_url(Config::DEFAULT_SERVER_URL)
}

fn validate_url(url: &str) -> Result<url::Url> {
    url::Url::parse(url).with_context(|| format!("Invalid server URL: {url}"))
}

/// Client-side state that is not user configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalState {
    /// Config schema version this client last bootstrapped successfully.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_version: Option<u32>,
}

impl LocalState {
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read state from {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse state from {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string(self).context("Failed to serialize local state")?;
        write_atomic(path, &contents)
    }
}
