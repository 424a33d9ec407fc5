//! # Configuration Management
//!
//! Server configuration loaded from a TOML file (or defaults), covering
//! network binding, the update-buffer flush cadence, and logging.
//!
//! ## Example Configuration File (config.toml)
//! ```toml
//! host = "127.0.0.1"
//! port = 8765
//! log_level = "info"
//! update_buffer_interval_ms = 50
//! ```

use anyhow::Result;
use config::{Config as ConfigLib, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure for the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// IP address to bind the WebSocket listener to (e.g. "127.0.0.1" or "0.0.0.0").
    pub host: String,

    /// Port number for the WebSocket listener to listen on.
    pub port: u16,

    /// `log` level filter string (e.g. "info", "debug,topicsync=trace").
    pub log_level: String,

    /// How often, in milliseconds, the update buffer flushes queued
    /// non-stateful changes to subscribers.
    pub update_buffer_interval_ms: u64,
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = ConfigLib::builder().add_source(File::from(path)).build()?;
        let config: ServerConfig = settings.try_deserialize()?;
        Ok(config)
    }

    /// Sensible defaults for development: localhost:8765, info logging, a
    /// 50ms update-buffer flush interval.
    pub fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            log_level: "info".to_string(),
            update_buffer_interval_ms: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn load_parses_a_toml_file() {
        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            temp_file.as_file_mut(),
            r#"
host = "0.0.0.0"
port = 9000
log_level = "debug"
update_buffer_interval_ms = 100
            "#
        )
        .unwrap();

        let config = ServerConfig::load(temp_file.path()).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.update_buffer_interval_ms, 100);
    }

    #[test]
    fn default_is_usable_standalone() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8765);
        assert_eq!(config.update_buffer_interval_ms, 50);
    }
}
