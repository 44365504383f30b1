//! Server configuration

use crate::logging::Severity;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Compilation server for the popcorn distributed compiler
#[derive(Parser, Debug, Clone)]
#[command(name = "popcorn-server", version, about)]
pub struct ServerSettings {
    /// Binding address
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Listening port
    #[arg(long, default_value_t = 43210)]
    pub port: u16,

    /// Directory for caches and session working trees
    #[arg(long, default_value = "/tmp/popcorn-server")]
    pub working_dir: PathBuf,

    /// Byte limit of the source/header cache
    #[arg(long, default_value_t = 4 * 1024 * 1024 * 1024)]
    pub src_cache_limit: u64,

    /// Byte limit of the compiled-object cache
    #[arg(long, default_value_t = 8 * 1024 * 1024 * 1024)]
    pub obj_cache_limit: u64,

    /// Log file; stdout when omitted
    #[arg(long)]
    pub log_filename: Option<PathBuf>,

    /// Log severity: INFO, WARNING or ERROR
    #[arg(long, default_value = "INFO")]
    pub log_severity: Severity,

    /// statsd address (`host:port`) for metric gauges
    #[arg(long)]
    pub statsd: Option<String>,

    /// How long a TransferFile call waits for a competing uploader before
    /// claiming the upload itself
    #[arg(long, default_value_t = 6)]
    pub cache_wait_secs: u64,

    /// Poll interval while waiting for a competing uploader
    #[arg(long, default_value_t = 100)]
    pub cache_poll_ms: u64,

    /// Age after which an upload claim is presumed stuck
    #[arg(long, default_value_t = 5)]
    pub transfer_stale_secs: u64,
}

impl ServerSettings {
    /// Source/header cache directory
    pub fn src_cache_dir(&self) -> PathBuf {
        self.working_dir.join("src-cache")
    }

    /// Compiled-object cache directory
    pub fn obj_cache_dir(&self) -> PathBuf {
        self.working_dir.join("obj-cache")
    }

    /// Root of all session working directories
    pub fn sessions_dir(&self) -> PathBuf {
        self.working_dir.join("sessions")
    }

    /// Upper bound on waiting for a competing uploader
    pub fn cache_wait(&self) -> Duration {
        Duration::from_secs(self.cache_wait_secs)
    }

    /// Poll interval of the wait loop
    pub fn cache_poll(&self) -> Duration {
        Duration::from_millis(self.cache_poll_ms)
    }

    /// Stale threshold for upload claims
    pub fn transfer_stale(&self) -> Duration {
        Duration::from_secs(self.transfer_stale_secs)
    }

    /// Listen address in `host:port` form
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ServerSettings::parse_from(["popcorn-server"]);
        assert_eq!(settings.listen_address(), "0.0.0.0:43210");
        assert_eq!(settings.cache_wait(), Duration::from_secs(6));
        assert_eq!(settings.cache_poll(), Duration::from_millis(100));
        assert_eq!(settings.transfer_stale(), Duration::from_secs(5));
        assert_eq!(
            settings.src_cache_dir(),
            PathBuf::from("/tmp/popcorn-server/src-cache")
        );
    }

    #[test]
    fn test_timing_flags_are_configurable() {
        let settings = ServerSettings::parse_from([
            "popcorn-server",
            "--cache-wait-secs",
            "2",
            "--cache-poll-ms",
            "10",
            "--transfer-stale-secs",
            "1",
        ]);
        assert_eq!(settings.cache_wait(), Duration::from_secs(2));
        assert_eq!(settings.cache_poll(), Duration::from_millis(10));
        assert_eq!(settings.transfer_stale(), Duration::from_secs(1));
    }
}
