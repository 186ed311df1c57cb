//! Configuration data types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Where and how the server listens
    #[serde(default)]
    pub serving: ServingConfig,

    /// Graceful shutdown timing
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Json,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Serving configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServingConfig {
    /// IP address to bind
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Port to bind; 0 disables serving unless `required` is set
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// Network to bind: tcp, tcp4 or tcp6
    #[serde(default)]
    pub bind_network: BindNetwork,

    /// Serving cannot be turned off with port 0
    #[serde(default)]
    pub required: bool,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
            bind_network: BindNetwork::Tcp,
            required: false,
        }
    }
}

/// Network family to bind.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BindNetwork {
    /// IPv4 or IPv6, following the bind address
    #[default]
    Tcp,
    /// IPv4 only
    Tcp4,
    /// IPv6 only
    Tcp6,
}

impl BindNetwork {
    /// Whether this network can listen on `address`.
    pub fn accepts(&self, address: &IpAddr) -> bool {
        match self {
            BindNetwork::Tcp => true,
            BindNetwork::Tcp4 => address.is_ipv4(),
            BindNetwork::Tcp6 => address.is_ipv6(),
        }
    }
}

impl fmt::Display for BindNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BindNetwork::Tcp => "tcp",
            BindNetwork::Tcp4 => "tcp4",
            BindNetwork::Tcp6 => "tcp6",
        };
        f.write_str(name)
    }
}

/// Graceful shutdown timing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShutdownConfig {
    /// Hard deadline for draining open connections once the server stops
    /// accepting new requests
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// How long to keep serving after shutdown is initiated, while readiness
    /// already reports failure
    #[serde(default, with = "humantime_serde")]
    pub delay_duration: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: default_shutdown_timeout(),
            delay_duration: Duration::ZERO,
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_bind_port() -> u16 {
    8080
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
