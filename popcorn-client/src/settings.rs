//! Client configuration from `POPCORN_*` environment variables

use std::path::PathBuf;
use tracing::Level;

/// Client configuration, read once at startup
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Compilation servers as `host:port` pairs
    pub servers: Vec<String>,
    /// Log file; stderr when absent
    pub log_filename: Option<PathBuf>,
    /// Maximum log level
    pub log_level: Level,
    /// Enables the server-side compiled-object cache
    pub use_object_cache: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            log_filename: None,
            log_level: Level::WARN,
            use_object_cache: false,
        }
    }
}

fn parse_severity(value: &str) -> Option<Level> {
    match value.to_ascii_uppercase().as_str() {
        "INFO" => Some(Level::INFO),
        "WARNING" => Some(Level::WARN),
        "ERROR" => Some(Level::ERROR),
        _ => None,
    }
}

fn is_truthy(value: &str) -> bool {
    !matches!(
        value.to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

impl ClientSettings {
    /// Read `POPCORN_SERVERS`, `POPCORN_LOG_FILENAME`,
    /// `POPCORN_LOG_SEVERITY` and `POPCORN_OBJ_CACHE`
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(servers) = std::env::var("POPCORN_SERVERS") {
            settings.servers = parse_servers(&servers);
        }
        if let Ok(filename) = std::env::var("POPCORN_LOG_FILENAME") {
            if !filename.is_empty() {
                settings.log_filename = Some(PathBuf::from(filename));
            }
        }
        if let Ok(severity) = std::env::var("POPCORN_LOG_SEVERITY") {
            if let Some(level) = parse_severity(&severity) {
                settings.log_level = level;
            }
        }
        if let Ok(flag) = std::env::var("POPCORN_OBJ_CACHE") {
            settings.use_object_cache = is_truthy(&flag);
        }
        settings
    }
}

fn parse_servers(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(ToString::to_string)
        .collect()
}
