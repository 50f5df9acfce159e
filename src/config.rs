//! Client configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LxdError, Result};
use crate::retry::{RetryPolicy, DEFAULT_IPV4_ATTEMPTS, DEFAULT_IPV6_ATTEMPTS};

pub const DEFAULT_SOCKET_PATH: &str = "/var/lib/lxd/unix.socket";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 300;
/// Non-terminal wait replies tolerated before giving up on an operation.
pub const DEFAULT_MAX_OPERATION_WAITS: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// `unix:///path/to/socket` or `http(s)://host:port`
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Client-side timeout for ordinary requests
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Client-side timeout for each operation wait call
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// Server-side `timeout` passed on wait calls (optional)
    #[serde(default)]
    pub server_wait_secs: Option<u64>,

    /// Wait calls issued for one operation before it is abandoned
    #[serde(default = "default_max_operation_waits")]
    pub max_operation_waits: u32,

    /// Skip TLS verification for self-signed daemons
    #[serde(default)]
    pub accept_invalid_certs: bool,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub exec: ExecConfig,
}

/// Address polling, e.g. waiting for a container's IPv4 lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,

    #[serde(default = "default_ipv4_attempts")]
    pub ipv4_attempts: u32,

    #[serde(default = "default_ipv6_attempts")]
    pub ipv6_attempts: u32,
}

impl PollingConfig {
    pub fn ipv4_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.interval_ms), self.ipv4_attempts)
    }

    pub fn ipv6_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.interval_ms), self.ipv6_attempts)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            ipv4_attempts: default_ipv4_attempts(),
            ipv6_attempts: default_ipv6_attempts(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Environment added to every exec unless the call overrides a key
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

fn default_endpoint() -> String { format!("unix://{}", DEFAULT_SOCKET_PATH) }
fn default_request_timeout() -> u64 { DEFAULT_REQUEST_TIMEOUT_SECS }
fn default_operation_timeout() -> u64 { DEFAULT_OPERATION_TIMEOUT_SECS }
fn default_max_operation_waits() -> u32 { DEFAULT_MAX_OPERATION_WAITS }
fn default_poll_interval() -> u64 { 1000 }
fn default_ipv4_attempts() -> u32 { DEFAULT_IPV4_ATTEMPTS }
fn default_ipv6_attempts() -> u32 { DEFAULT_IPV6_ATTEMPTS }

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            request_timeout_secs: default_request_timeout(),
            operation_timeout_secs: default_operation_timeout(),
            server_wait_secs: None,
            max_operation_waits: default_max_operation_waits(),
            accept_invalid_certs: false,
            polling: PollingConfig::default(),
            exec: ExecConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| LxdError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LxdError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        Endpoint::parse(&self.endpoint)?;
        if self.request_timeout_secs == 0 || self.operation_timeout_secs == 0 {
            return Err(LxdError::Config("Timeouts must be at least one second".into()));
        }
        if self.max_operation_waits == 0 {
            return Err(LxdError::Config("max_operation_waits must be positive".into()));
        }
        if self.polling.interval_ms == 0 {
            return Err(LxdError::Config("polling.interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Result<Endpoint> {
        Endpoint::parse(&self.endpoint)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

/// Where the daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    /// Base URL without a trailing slash
    Http(String),
}

impl Endpoint {
    /// Accepts `unix://<path>`, a bare absolute socket path, or an
    /// `http(s)://` URL.
    pub fn parse(endpoint: &str) -> Result<Self> {
        let endpoint = endpoint.trim();
        if let Some(path) = endpoint.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(LxdError::Config("unix:// endpoint needs a socket path".into()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if endpoint.starts_with('/') {
            return Ok(Endpoint::Unix(PathBuf::from(endpoint)));
        }
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return Ok(Endpoint::Http(endpoint.trim_end_matches('/').to_string()));
        }
        Err(LxdError::Config(format!("Unsupported endpoint: {}", endpoint)))
    }
}
