//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/tablecast/config.toml)
//! 3. Environment variables (TABLECAST_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::{BackoffPolicy, ConnectionConfig};
use crate::server::HubOptions;
use crate::table::{MetadataFilter, ParseOptions};

/// Environment variable prefix
const ENV_PREFIX: &str = "TABLECAST";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for uploads and logs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log file; stderr when unset
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub parser: ParserConfig,

    /// Data sources registered when the server starts
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

/// `[server]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket listen address
    pub ws_addr: String,
    /// HTTP listen address
    pub http_addr: String,
    /// Watcher debounce window
    pub debounce_ms: u64,
    /// Session ping interval
    pub ping_interval_secs: u64,
    /// Silence after which a session is dropped
    pub session_timeout_secs: u64,
    /// Outbound frames buffered per session
    pub queue_capacity: usize,
    /// Lower bound for client polling intervals
    pub min_poll_interval_ms: u64,
    /// Largest accepted upload
    pub max_upload_bytes: usize,
    /// Install filesystem watches on file sources
    pub watch_filesystem: bool,
    /// Upload directory; `<data_dir>/uploads` when unset
    pub upload_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_addr: "127.0.0.1:3001".to_string(),
            http_addr: "127.0.0.1:3002".to_string(),
            debounce_ms: 500,
            ping_interval_secs: 30,
            session_timeout_secs: 90,
            queue_capacity: 256,
            min_poll_interval_ms: 1000,
            max_upload_bytes: 5 * 1024 * 1024,
            watch_filesystem: true,
            upload_dir: None,
        }
    }
}

/// `[client]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket URL of the server
    pub server_url: String,
    /// Base URL of the server's HTTP API
    pub api_url: String,
    pub connect_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub max_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:3001".to_string(),
            api_url: "http://127.0.0.1:3002".to_string(),
            connect_timeout_secs: 10,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 5,
            backoff_base_ms: 1000,
            backoff_cap_ms: 30_000,
            max_attempts: 5,
        }
    }
}

/// `[parser]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    pub delimiter: char,
    /// Trim whitespace around unquoted fields
    pub trim: bool,
    /// First-cell substrings marking metadata rows
    pub metadata_keywords: Vec<String>,
    /// First-cell prefixes marking metadata rows
    pub metadata_prefixes: Vec<String>,
    /// Drop data rows whose first cell is blank
    pub drop_blank_rows: bool,
}

impl Default for ParserConfig {
    fn default() -> Self {
        let filter = MetadataFilter::default();
        Self {
            delimiter: ',',
            trim: true,
            metadata_keywords: filter.keywords,
            metadata_prefixes: filter.prefixes,
            drop_blank_rows: filter.drop_blank_first_cell,
        }
    }
}

/// `[[sources]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub id: String,
    /// Display title; the file stem when unset
    #[serde(default)]
    pub title: Option<String>,
    pub path: PathBuf,
}

impl SourceEntry {
    /// Title, falling back to the file stem, then the id
    pub fn display_title(&self) -> String {
        self.title.clone().unwrap_or_else(|| {
            self.path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.id.clone())
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            log_file: None,
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            parser: ParserConfig::default(),
            sources: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (TABLECAST_DATA_DIR, TABLECAST_WS_ADDR, ...)
    /// 2. Config file (~/.config/tablecast/config.toml or TABLECAST_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load from an explicit path when given, otherwise the default location
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        let var = |name: &str| std::env::var(format!("{}_{}", ENV_PREFIX, name)).ok();

        if let Some(val) = var("DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }
        if let Some(val) = var("WS_ADDR") {
            self.server.ws_addr = val;
        }
        if let Some(val) = var("HTTP_ADDR") {
            self.server.http_addr = val;
        }
        if let Some(val) = var("SERVER_URL") {
            self.client.server_url = val;
        }
        if let Some(val) = var("API_URL") {
            self.client.api_url = val;
        }
        if let Some(val) = var("LOG_LEVEL") {
            if !val.is_empty() {
                self.log_level = val;
            }
        }
    }

    /// Reject values the server cannot run with
    fn validate(&self) -> Result<()> {
        if self.server.queue_capacity == 0 {
            bail!("server.queue_capacity must be at least 1");
        }
        if self.server.ping_interval_secs == 0 {
            bail!("server.ping_interval_secs must be at least 1");
        }
        if self.client.max_attempts == 0 {
            bail!("client.max_attempts must be at least 1");
        }
        for (i, source) in self.sources.iter().enumerate() {
            if source.id.trim().is_empty() {
                bail!("sources[{}] has an empty id", i);
            }
            if self.sources[..i].iter().any(|s| s.id == source.id) {
                bail!("Duplicate source id '{}'", source.id);
            }
        }
        Ok(())
    }

    /// Set a value by key, as used by `tablecast config set`
    ///
    /// A value that fails validation leaves the configuration unchanged.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut candidate = self.clone();
        candidate.assign(key, value)?;
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }

    fn assign(&mut self, key: &str, value: &str) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid value for {}: '{}'", key, value))
        }

        fn optional(value: &str) -> Option<String> {
            if value.is_empty() || value == "none" {
                None
            } else {
                Some(value.to_string())
            }
        }

        match key {
            "data_dir" => self.data_dir = value.into(),
            "log_level" => self.log_level = value.to_string(),
            "log_file" => self.log_file = optional(value).map(PathBuf::from),
            "server.ws_addr" => self.server.ws_addr = value.to_string(),
            "server.http_addr" => self.server.http_addr = value.to_string(),
            "server.debounce_ms" => self.server.debounce_ms = parse(key, value)?,
            "server.ping_interval_secs" => self.server.ping_interval_secs = parse(key, value)?,
            "server.session_timeout_secs" => self.server.session_timeout_secs = parse(key, value)?,
            "server.queue_capacity" => self.server.queue_capacity = parse(key, value)?,
            "server.min_poll_interval_ms" => self.server.min_poll_interval_ms = parse(key, value)?,
            "server.max_upload_bytes" => self.server.max_upload_bytes = parse(key, value)?,
            "server.watch_filesystem" => self.server.watch_filesystem = parse(key, value)?,
            "server.upload_dir" => self.server.upload_dir = optional(value).map(PathBuf::from),
            "client.server_url" => self.client.server_url = value.to_string(),
            "client.api_url" => self.client.api_url = value.to_string(),
            "client.connect_timeout_secs" => self.client.connect_timeout_secs = parse(key, value)?,
            "client.heartbeat_interval_secs" => {
                self.client.heartbeat_interval_secs = parse(key, value)?
            }
            "client.heartbeat_timeout_secs" => {
                self.client.heartbeat_timeout_secs = parse(key, value)?
            }
            "client.backoff_base_ms" => self.client.backoff_base_ms = parse(key, value)?,
            "client.backoff_cap_ms" => self.client.backoff_cap_ms = parse(key, value)?,
            "client.max_attempts" => self.client.max_attempts = parse(key, value)?,
            "parser.delimiter" => self.parser.delimiter = parse(key, value)?,
            "parser.trim" => self.parser.trim = parse(key, value)?,
            _ => bail!(
                "Unknown configuration key: '{}'\n\
                 Valid keys: data_dir, log_level, log_file, server.*, client.*, parser.delimiter, parser.trim",
                key
            ),
        }

        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with TABLECAST_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tablecast")
            .join("config.toml")
    }

    /// Directory where uploads are stored
    pub fn upload_dir(&self) -> PathBuf {
        self.server
            .upload_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("uploads"))
    }

    /// Parser options from the `[parser]` section
    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            delimiter: self.parser.delimiter,
            trim_unquoted: self.parser.trim,
            metadata: MetadataFilter {
                keywords: self.parser.metadata_keywords.clone(),
                prefixes: self.parser.metadata_prefixes.clone(),
                drop_blank_first_cell: self.parser.drop_blank_rows,
            },
        }
    }

    /// Hub options from the `[server]` and `[parser]` sections
    pub fn hub_options(&self) -> HubOptions {
        HubOptions {
            debounce: Duration::from_millis(self.server.debounce_ms),
            parse: self.parse_options(),
            watch_filesystem: self.server.watch_filesystem,
            session_ping_interval: Duration::from_secs(self.server.ping_interval_secs),
            session_timeout: Duration::from_secs(self.server.session_timeout_secs),
            session_queue_capacity: self.server.queue_capacity,
            min_poll_interval: Duration::from_millis(self.server.min_poll_interval_ms),
            upload_dir: self.upload_dir(),
            max_upload_bytes: self.server.max_upload_bytes,
        }
    }

    /// Client connection settings from the `[client]` section
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            url: self.client.server_url.clone(),
            connect_timeout: Duration::from_secs(self.client.connect_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.client.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(self.client.heartbeat_timeout_secs),
            backoff: BackoffPolicy {
                base: Duration::from_millis(self.client.backoff_base_ms),
                cap: Duration::from_millis(self.client.backoff_cap_ms),
                max_attempts: self.client.max_attempts,
            },
        }
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tablecast")
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "TABLECAST_DATA_DIR",
        "TABLECAST_WS_ADDR",
        "TABLECAST_HTTP_ADDR",
        "TABLECAST_SERVER_URL",
        "TABLECAST_API_URL",
        "TABLECAST_LOG_LEVEL",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.server.ws_addr, "127.0.0.1:3001");
        assert!(config.sources.is_empty());
        assert!(config.data_dir.ends_with("tablecast"));
        assert!(config.upload_dir().ends_with("uploads"));
    }

    #[test]
    fn test_env_overrides() {
        let _guard = EnvGuard::new(ENV_VARS);
        let mut config = Config::default();

        env::set_var("TABLECAST_WS_ADDR", "0.0.0.0:9001");
        env::set_var("TABLECAST_SERVER_URL", "ws://example.com:9001");
        env::set_var("TABLECAST_LOG_LEVEL", "debug");
        config.apply_env_overrides();

        assert_eq!(config.server.ws_addr, "0.0.0.0:9001");
        assert_eq!(config.client.server_url, "ws://example.com:9001");
        assert_eq!(config.log_level, "debug");

        // Empty level keeps the current one
        env::set_var("TABLECAST_LOG_LEVEL", "");
        config.apply_env_overrides();
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_load_from_str_with_sections() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/srv/tablecast"
            log_level = "warn"

            [server]
            debounce_ms = 250
            queue_capacity = 16

            [client]
            max_attempts = 3

            [parser]
            delimiter = ";"
            metadata_keywords = []

            [[sources]]
            id = "colors"
            path = "/srv/sheets/colors.csv"

            [[sources]]
            id = "sizes"
            title = "Sizes"
            path = "/srv/sheets/sizes.csv"
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/tablecast"));
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.server.debounce_ms, 250);
        // Unset fields in a section keep their defaults
        assert_eq!(config.server.ping_interval_secs, 30);
        assert_eq!(config.upload_dir(), PathBuf::from("/srv/tablecast/uploads"));

        let hub = config.hub_options();
        assert_eq!(hub.debounce, Duration::from_millis(250));
        assert_eq!(hub.session_queue_capacity, 16);
        assert_eq!(hub.parse.delimiter, ';');
        assert!(hub.parse.metadata.keywords.is_empty());

        let conn = config.connection_config();
        assert_eq!(conn.backoff.max_attempts, 3);
        assert_eq!(conn.backoff.base, Duration::from_secs(1));

        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].display_title(), "colors");
        assert_eq!(config.sources[1].display_title(), "Sizes");
    }

    #[test]
    fn test_duplicate_source_ids_rejected() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            [[sources]]
            id = "colors"
            path = "a.csv"

            [[sources]]
            id = "colors"
            path = "b.csv"
        "#;

        let err = Config::load_from_str(toml).unwrap_err();
        assert!(err.to_string().contains("Duplicate source id 'colors'"));
    }

    #[test]
    fn test_set_values() {
        let mut config = Config::default();

        config.set("server.debounce_ms", "100").unwrap();
        assert_eq!(config.server.debounce_ms, 100);

        config.set("log_file", "/tmp/tablecast.log").unwrap();
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/tablecast.log")));
        config.set("log_file", "none").unwrap();
        assert!(config.log_file.is_none());

        assert!(config.set("server.debounce_ms", "soon").is_err());
        assert!(config.set("server.queue_capacity", "0").is_err());
        assert!(config.set("nonsense", "1").is_err());
    }

    #[test]
    fn test_rejected_set_leaves_config_unchanged() {
        let mut config = Config::default();
        config.set("client.max_attempts", "7").unwrap();

        assert!(config.set("client.max_attempts", "0").is_err());
        assert_eq!(config.client.max_attempts, 7);

        let capacity = config.server.queue_capacity;
        assert!(config.set("server.queue_capacity", "0").is_err());
        assert_eq!(config.server.queue_capacity, capacity);
    }

    #[test]
    fn test_save_and_reload() {
        let _guard = EnvGuard::new(ENV_VARS);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config.sources.push(SourceEntry {
            id: "colors".to_string(),
            title: None,
            path: PathBuf::from("colors.csv"),
        });
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.data_dir, config.data_dir);
        assert_eq!(loaded.sources, config.sources);
        assert_eq!(loaded.parser.delimiter, ',');
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.server.http_addr, "127.0.0.1:3002");
    }
}
