//! Client configuration.
//!
//! Defaults can be overridden with builder methods, a JSON file
//! ([`ClientConfig::load`]) or environment variables
//! ([`ClientConfig::from_env`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::{LogFacility, LogLevel};

/// Socket file name used when no endpoint is configured.
const SOCKET_NAME: &str = "simcommander.sock";

/// Resolve the default socket path for the automation server.
///
/// Resolution order:
/// 1. `$XDG_RUNTIME_DIR/simcommander.sock` (Linux standard)
/// 2. `~/Library/Caches/simcommander.sock` (macOS)
/// 3. `/tmp/simcommander.sock` (fallback)
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(SOCKET_NAME);
    }

    if let Some(cache_dir) = dirs::cache_dir() {
        return cache_dir.join(SOCKET_NAME);
    }

    PathBuf::from("/tmp").join(SOCKET_NAME)
}

/// Where the host process listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    /// Local Unix domain socket.
    Unix(PathBuf),
    /// `host:port` TCP address.
    Tcp(String),
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::Unix(default_socket_path())
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

/// Server-side log level to push after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLogLevel {
    pub level: LogLevel,
    #[serde(default)]
    pub facility: LogFacility,
}

/// Configuration for one client instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Unique id of this client on the server.
    pub client_id: u32,
    /// Human-readable name, used in logs and the connect command.
    pub client_name: String,
    pub endpoint: Endpoint,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    /// Outbound frame queue capacity.
    pub outbound_queue: usize,
    pub server_log_level: Option<ServerLogLevel>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: 0x5343_4D44,
            client_name: "simcommander".to_string(),
            endpoint: Endpoint::default(),
            connect_timeout_ms: 2000,
            request_timeout_ms: 1000,
            ping_timeout_ms: 500,
            outbound_queue: 64,
            server_log_level: None,
        }
    }
}

impl ClientConfig {
    pub fn new(client_id: u32, client_name: impl Into<String>) -> Self {
        Self {
            client_id,
            client_name: client_name.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_socket(self, path: impl Into<PathBuf>) -> Self {
        self.with_endpoint(Endpoint::Unix(path.into()))
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_outbound_queue(mut self, capacity: usize) -> Self {
        self.outbound_queue = capacity;
        self
    }

    pub fn with_server_log_level(mut self, level: LogLevel, facility: LogFacility) -> Self {
        self.server_log_level = Some(ServerLogLevel { level, facility });
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Defaults with environment overrides applied.
    ///
    /// Recognized variables:
    /// - `SIMCOMMANDER_SOCKET`: Unix socket path
    /// - `SIMCOMMANDER_TCP`: `host:port` (wins over the socket)
    /// - `SIMCOMMANDER_CLIENT_ID`: decimal or `0x` hex client id
    /// - `SIMCOMMANDER_TIMEOUT_MS`: request timeout
    /// - `SIMCOMMANDER_PING_TIMEOUT_MS`: ping timeout
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("SIMCOMMANDER_SOCKET") {
            self.endpoint = Endpoint::Unix(PathBuf::from(path));
        }
        if let Some(addr) = lookup("SIMCOMMANDER_TCP") {
            self.endpoint = Endpoint::Tcp(addr);
        }
        if let Some(id) = lookup("SIMCOMMANDER_CLIENT_ID") {
            self.client_id = parse_client_id(&id)
                .with_context(|| format!("Invalid SIMCOMMANDER_CLIENT_ID: {}", id))?;
        }
        if let Some(ms) = lookup("SIMCOMMANDER_TIMEOUT_MS") {
            self.request_timeout_ms = ms
                .trim()
                .parse()
                .with_context(|| format!("Invalid SIMCOMMANDER_TIMEOUT_MS: {}", ms))?;
        }
        if let Some(ms) = lookup("SIMCOMMANDER_PING_TIMEOUT_MS") {
            self.ping_timeout_ms = ms
                .trim()
                .parse()
                .with_context(|| format!("Invalid SIMCOMMANDER_PING_TIMEOUT_MS: {}", ms))?;
        }
        Ok(self)
    }
}

fn parse_client_id(value: &str) -> Result<u32> {
    let value = value.trim();
    let id = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16)?,
        None => value.parse()?,
    };
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_millis(2000));
        assert_eq!(config.request_timeout(), Duration::from_millis(1000));
        assert_eq!(config.ping_timeout(), Duration::from_millis(500));
        assert_eq!(config.outbound_queue, 64);
        assert!(config.server_log_level.is_none());
    }

    #[test]
    fn test_default_socket_path_name() {
        let path = default_socket_path();
        assert!(path.to_string_lossy().ends_with("simcommander.sock"));
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::new(0xC57, "demo")
            .with_endpoint(Endpoint::Tcp("127.0.0.1:4506".into()))
            .with_request_timeout(Duration::from_millis(250))
            .with_server_log_level(LogLevel::Debug, LogFacility::Remote);

        assert_eq!(config.client_id, 0xC57);
        assert_eq!(config.client_name, "demo");
        assert_eq!(config.endpoint.to_string(), "tcp:127.0.0.1:4506");
        assert_eq!(config.request_timeout_ms, 250);
        assert_eq!(
            config.server_log_level,
            Some(ServerLogLevel {
                level: LogLevel::Debug,
                facility: LogFacility::Remote
            })
        );
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SIMCOMMANDER_SOCKET", "/run/sim.sock"),
            ("SIMCOMMANDER_CLIENT_ID", "0x1F"),
            ("SIMCOMMANDER_TIMEOUT_MS", "300"),
        ]
        .into_iter()
        .collect();

        let config = ClientConfig::default()
            .with_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.endpoint, Endpoint::Unix(PathBuf::from("/run/sim.sock")));
        assert_eq!(config.client_id, 0x1F);
        assert_eq!(config.request_timeout_ms, 300);
        assert_eq!(config.ping_timeout_ms, 500);
    }

    #[test]
    fn test_tcp_override_wins() {
        let config = ClientConfig::default()
            .with_overrides(|key| match key {
                "SIMCOMMANDER_SOCKET" => Some("/run/sim.sock".into()),
                "SIMCOMMANDER_TCP" => Some("10.0.0.2:4506".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.endpoint, Endpoint::Tcp("10.0.0.2:4506".into()));
    }

    #[test]
    fn test_invalid_override_reports_variable() {
        let err = ClientConfig::default()
            .with_overrides(|key| (key == "SIMCOMMANDER_TIMEOUT_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("SIMCOMMANDER_TIMEOUT_MS"));
    }

    #[test]
    fn test_load_partial_json() {
        let path = std::env::temp_dir().join(format!(
            "simcommander-config-{}-{}.json",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
        ));
        std::fs::write(
            &path,
            r#"{"client_id": 7, "endpoint": {"tcp": "localhost:4506"}}"#,
        )
        .unwrap();

        let config = ClientConfig::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(config.client_id, 7);
        assert_eq!(config.endpoint, Endpoint::Tcp("localhost:4506".into()));
        assert_eq!(config.request_timeout_ms, 1000);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ClientConfig::load("/nonexistent/simcommander.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
