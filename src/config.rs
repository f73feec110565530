//! Gateway configuration
//!
//! Loaded from a YAML document. Every field has a default, so an empty file
//! is a valid configuration:
//!
//! ```yaml
//! upstream_dns: 1.1.1.1
//! retention_days: 730
//! udp:
//!   listen: 0.0.0.0:6199
//!   cloud_host: api.besmart-home.com
//! http:
//!   weather_location: { latitude: 45.07, longitude: 7.69 }
//!   rules:
//!     - { pattern: '/api/v2/.*', behaviour: ONLY_LOCAL }
//! capture:
//!   udp: /var/log/shadowgate/udp.log
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::proxy::{Behaviour, DEFAULT_LOCAL_HOSTS, PolicyRule, PolicyTable};
use crate::{GatewayError, Result};

/// Default UDP port of the thermostat protocol.
pub const DEFAULT_UDP_PORT: u16 = 6199;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Nameserver for upstream hostnames
    pub upstream_dns: IpAddr,
    /// Log filter directive, overridden by `RUST_LOG`
    pub log_level: String,
    /// Days of records kept by the purge task
    pub retention_days: u32,
    /// How long a command waits for the device's reply
    pub command_timeout_ms: u64,
    pub udp: UdpConfig,
    pub http: HttpConfig,
    pub capture: CaptureConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            upstream_dns: IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            log_level: "info".to_string(),
            retention_days: 365 * 2,
            command_timeout_ms: 5_000,
            udp: UdpConfig::default(),
            http: HttpConfig::default(),
            capture: CaptureConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    pub listen: SocketAddr,
    /// Vendor cloud hostname, resolved through `upstream_dns`
    pub cloud_host: String,
    pub cloud_port: u16,
    /// Forward device datagrams to the cloud
    pub relay_upstream: bool,
    /// Decode every cloud datagram locally instead of relaying it
    pub decode_cloud: bool,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_UDP_PORT)),
            cloud_host: "api.besmart-home.com".to_string(),
            cloud_port: DEFAULT_UDP_PORT,
            relay_upstream: true,
            decode_cloud: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub upstream_port: u16,
    /// Hosts matching this pattern are served locally without proxying
    pub local_hosts: String,
    /// Rules checked before the stock ones
    pub rules: Vec<RuleConfig>,
    pub weather_location: Option<WeatherLocation>,
    /// Age after which a pooled upstream client is rebuilt
    pub pool_max_age_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            upstream_port: 80,
            local_hosts: DEFAULT_LOCAL_HOSTS.to_string(),
            rules: Vec::new(),
            weather_location: None,
            pool_max_age_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub pattern: String,
    pub behaviour: Behaviour,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherLocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// Raw traffic dump files, disabled when unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub udp: Option<PathBuf>,
    pub http: Option<PathBuf>,
}

impl GatewayConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::file_error(path.to_path_buf(), e))?;
        Self::from_yaml(&text)
    }

    /// Reject values the gateway cannot start with.
    pub fn validate(&self) -> Result<()> {
        EnvFilter::try_new(&self.log_level).map_err(|e| GatewayError::Config {
            reason: format!("invalid log_level '{}'", self.log_level),
            source: Some(Box::new(e)),
        })?;
        if self.retention_days == 0 {
            return Err(GatewayError::config("retention_days must be at least 1"));
        }
        if self.command_timeout_ms == 0 {
            return Err(GatewayError::config("command_timeout_ms must be positive"));
        }
        if self.udp.cloud_host.trim().is_empty() {
            return Err(GatewayError::config("udp.cloud_host is empty"));
        }
        regex::Regex::new(&self.http.local_hosts)?;
        for rule in &self.http.rules {
            PolicyRule::new(rule.pattern.clone(), rule.behaviour)?;
        }
        if let Some(location) = &self.http.weather_location {
            if !(-90.0..=90.0).contains(&location.latitude) || !(-180.0..=180.0).contains(&location.longitude) {
                return Err(GatewayError::config(format!(
                    "weather_location {},{} is out of range",
                    location.latitude, location.longitude
                )));
            }
        }
        Ok(())
    }

    /// Configured rules followed by the stock ones.
    pub fn policy_table(&self) -> Result<PolicyTable> {
        let mut table = PolicyTable::with_defaults(self.http.weather_location.is_some())?;
        for rule in self.http.rules.iter().rev() {
            table.prepend(rule.pattern.clone(), rule.behaviour)?;
        }
        Ok(table)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn pool_max_age(&self) -> Duration {
        Duration::from_secs(self.http.pool_max_age_secs)
    }
}
