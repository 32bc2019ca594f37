//! Configuration management

use anyhow::{bail, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::heos::health::{HealthConfig, RetryConfig};
use crate::heos::session::SessionConfig;
use crate::heos::types::DEFAULT_PORT;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Device address; without it the session has to be given one via `set_host`
    pub host: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Player to select after discovery (takes precedence over `player_name`)
    pub player_id: Option<i64>,
    pub player_name: Option<String>,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_max_heartbeat_failures")]
    pub max_heartbeat_failures: u32,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Upper bound applied to every volume change
    pub volume_limit: Option<u8>,

    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_max_heartbeat_failures() -> u32 {
    1
}

fn default_event_buffer() -> usize {
    256
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    5
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            player_id: None,
            player_name: None,
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_heartbeat_failures: default_max_heartbeat_failures(),
            reconnect: ReconnectConfig::default(),
            volume_limit: None,
            event_buffer: default_event_buffer(),
        }
    }
}

impl Config {
    /// Runtime session settings derived from this config
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            host: self.host.clone().filter(|h| !h.trim().is_empty()),
            port: self.port,
            player_id: self.player_id,
            player_name: self.player_name.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            health: HealthConfig {
                heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
                max_failures: self.max_heartbeat_failures,
                retry: RetryConfig {
                    initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
                    max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                    max_retries: self.reconnect.max_retries,
                },
            },
            volume_limit: self.volume_limit,
            event_buffer: self.event_buffer,
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(limit) = self.volume_limit {
            if limit > 100 {
                bail!("volume_limit must be between 0 and 100, got {}", limit);
            }
        }
        if self.port == 0 {
            bail!("port must not be 0");
        }
        if self.request_timeout_ms == 0 {
            bail!("request_timeout_ms must be greater than 0");
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            bail!(
                "reconnect.initial_delay_ms ({}) exceeds reconnect.max_delay_ms ({})",
                self.reconnect.initial_delay_ms,
                self.reconnect.max_delay_ms
            );
        }
        Ok(())
    }
}

/// Get config directory (HEOS_CONFIG_DIR, XDG_CONFIG_HOME or platform default)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("HEOS_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library/Application Support/heos-control");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join("heos-control");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config/heos-control");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("heos-control");
        }
    }

    // Fallback to current directory
    PathBuf::from(".")
}

/// Load configuration: defaults, then `config.{toml,json,yaml}` from the config
/// directory, then `HEOS_*` environment variables.
pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let config = ::config::Config::builder()
        .set_default("port", DEFAULT_PORT as i64)?
        // Load from config file if it exists
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        // Override with environment variables (HEOS_HOST, HEOS_RECONNECT__MAX_RETRIES, etc.)
        .add_source(
            ::config::Environment::with_prefix("HEOS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config: Config = config.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const ENV_VARS: &[&str] = &[
        "HEOS_HOST",
        "HEOS_PORT",
        "HEOS_PLAYER_NAME",
        "HEOS_VOLUME_LIMIT",
        "HEOS_RECONNECT__MAX_RETRIES",
        "HEOS_CONFIG_DIR",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn defaults_without_file_or_env() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        env::set_var("HEOS_CONFIG_DIR", dir.path());

        let config = load_config().expect("config should load");
        clear_env();

        assert_eq!(config, Config::default());
        let session = config.session_config();
        assert_eq!(session.port, 1255);
        assert_eq!(session.request_timeout, Duration::from_secs(5));
        assert_eq!(session.health.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(session.health.retry.max_retries, 5);
    }

    #[test]
    #[serial]
    fn reads_toml_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
host = "192.168.1.40"
player_name = "Living Room"
volume_limit = 60

[reconnect]
max_retries = 2
"#,
        )
        .unwrap();
        env::set_var("HEOS_CONFIG_DIR", dir.path());

        let config = load_config().expect("config should load");
        clear_env();

        assert_eq!(config.host.as_deref(), Some("192.168.1.40"));
        assert_eq!(config.player_name.as_deref(), Some("Living Room"));
        assert_eq!(config.volume_limit, Some(60));
        assert_eq!(config.reconnect.max_retries, 2);
        assert_eq!(config.reconnect.initial_delay_ms, 500);
    }

    #[test]
    #[serial]
    fn env_overrides_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "host = \"10.0.0.1\"\nport = 1255\n").unwrap();
        env::set_var("HEOS_CONFIG_DIR", dir.path());
        env::set_var("HEOS_HOST", "heos-receiver.local");
        env::set_var("HEOS_PORT", "2255");
        env::set_var("HEOS_RECONNECT__MAX_RETRIES", "9");

        let config = load_config().expect("config should load");
        clear_env();

        assert_eq!(config.host.as_deref(), Some("heos-receiver.local"));
        assert_eq!(config.port, 2255);
        assert_eq!(config.reconnect.max_retries, 9);
    }

    #[test]
    #[serial]
    fn rejects_volume_limit_over_100() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        env::set_var("HEOS_CONFIG_DIR", dir.path());
        env::set_var("HEOS_VOLUME_LIMIT", "150");

        let result = load_config();
        clear_env();

        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn config_dir_env_var_wins() {
        env::set_var("HEOS_CONFIG_DIR", "/tmp/heos-test-config");
        let dir = get_config_dir();
        env::remove_var("HEOS_CONFIG_DIR");
        assert_eq!(dir, PathBuf::from("/tmp/heos-test-config"));
    }
}
