// # Engine Configuration
//
// Process-wide settings for the job queue, network layer and HTTP client.

use crate::error::{IoError, Result};
use serde::Deserialize;
use std::path::Path;

/// Upper bound on worker threads regardless of core count.
pub const MAX_WORKER_THREADS: usize = 16;

/// Default cap on a downloaded HTTP document (bytes).
pub const DEFAULT_MAX_HTTP_DOC_SIZE: usize = 5_000_000;

/// Default network connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default network read/write timeout in seconds.
pub const DEFAULT_IO_TIMEOUT_SECS: u64 = 60;

/// Engine configuration.
///
/// Loaded once at startup and handed to [`crate::runtime::init`]. All
/// fields have working defaults, so `Settings::default()` is a valid
/// configuration for tests and small tools.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Maximum number of job-queue worker threads.
    pub max_worker_threads: usize,

    /// Software name sent as the HTTP User-Agent.
    pub client_software_name: String,

    /// HTTP proxy host name, if any.
    pub proxy_host: Option<String>,

    /// HTTP proxy port.
    pub proxy_port: u16,

    /// Route HTTP requests through the configured proxy.
    pub use_proxy: bool,

    /// Hard cap on a downloaded document, in bytes.
    pub max_http_doc_size: usize,

    /// Network connect timeout, seconds.
    pub connect_timeout_secs: u64,

    /// Network read/write timeout, seconds.
    pub io_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_worker_threads: MAX_WORKER_THREADS,
            client_software_name: format!("polystream/{}", env!("CARGO_PKG_VERSION")),
            proxy_host: None,
            proxy_port: 0,
            use_proxy: false,
            max_http_doc_size: DEFAULT_MAX_HTTP_DOC_SIZE,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            io_timeout_secs: DEFAULT_IO_TIMEOUT_SECS,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. Missing fields fall back to defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&text)
            .map_err(|e| IoError::InvalidArg(format!("bad settings file: {}", e)))
    }

    /// Number of worker threads to actually spawn.
    pub fn worker_thread_count(&self) -> usize {
        (num_cpus::get() + 1).min(self.max_worker_threads).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.max_worker_threads, MAX_WORKER_THREADS);
        assert!(!settings.use_proxy);
        assert_eq!(settings.max_http_doc_size, DEFAULT_MAX_HTTP_DOC_SIZE);
        assert!(settings.worker_thread_count() >= 1);
        assert!(settings.worker_thread_count() <= MAX_WORKER_THREADS);
    }

    #[test]
    fn test_settings_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{ "max_worker_threads": 2, "use_proxy": true, "proxy_host": "proxy.example.com", "proxy_port": 8080 }"#,
        )
        .unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.max_worker_threads, 2);
        assert!(settings.use_proxy);
        assert_eq!(settings.proxy_host.as_deref(), Some("proxy.example.com"));
        assert_eq!(settings.proxy_port, 8080);
        // Unspecified fields keep their defaults.
        assert_eq!(settings.max_http_doc_size, DEFAULT_MAX_HTTP_DOC_SIZE);
    }
}
