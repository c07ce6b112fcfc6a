//! Mesh node configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::attributes;

/// Environment variable naming the YAML configuration file
pub const CONFIG_PATH_ENV: &str = "MESH_CONFIG";
/// Environment override for the node identifier
pub const IDENTIFIER_ENV: &str = "MESH_IDENTIFIER";
/// Environment override for the HTTP listen port
pub const HTTP_PORT_ENV: &str = "MESH_HTTP_PORT";
/// Environment override for the control channel port
pub const SCP_PORT_ENV: &str = "MESH_SCP_PORT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {name}: {value}")]
    InvalidOverride { name: &'static str, value: String },

    #[error("Invalid {field} {value:?}: must be non-empty and free of '*', '$', '&' and '='")]
    InvalidToken { field: &'static str, value: String },
}

/// Top-level configuration for one mesh node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Stable per-process identifier; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,

    /// Logical service name advertised to peers
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub http: HttpConfig,

    /// Port of the local control channel advertised to peers
    #[serde(default = "default_scp_port")]
    pub scp_port: u16,

    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Services explicitly configured by the operator
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,

    #[serde(default)]
    pub log_format: LogFormat,
}

/// Multicast discovery settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// UDP port shared by every participant on the group
    #[serde(default = "default_discovery_port")]
    pub port: u16,

    /// Multicast group address
    #[serde(default = "default_multicast_address")]
    pub multicast_address: Ipv4Addr,

    /// Local interface used to join the group
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,

    /// Keepalive announcement interval; 0 disables keepalives
    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,

    #[serde(default = "default_multicast_ttl")]
    pub multicast_ttl: u32,
}

/// HTTP front door settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_listen")]
    pub listen: SocketAddr,
}

/// Reverse proxy settings
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Connect timeout for backend connections. Requests themselves are never timed out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
}

/// A service explicitly configured by the operator
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ServiceDefinition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl MeshConfig {
    /// Load configuration from the file named by `MESH_CONFIG`, then apply env overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load(&path)?,
            Err(_) => {
                debug!("{} not set, using default configuration", CONFIG_PATH_ENV);
                Self::default()
            }
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_yaml(&text)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would not survive the gossip wire format
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_token("name", &self.name)?;
        if let Some(identifier) = &self.identifier {
            check_token("identifier", identifier)?;
        }
        Ok(())
    }

    /// Apply overrides looked up by variable name
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(identifier) = lookup(IDENTIFIER_ENV) {
            self.identifier = Some(identifier);
        }
        if let Some(value) = lookup(HTTP_PORT_ENV) {
            let port = value.parse::<u16>().map_err(|_| ConfigError::InvalidOverride {
                name: HTTP_PORT_ENV,
                value: value.clone(),
            })?;
            self.http.listen.set_port(port);
        }
        if let Some(value) = lookup(SCP_PORT_ENV) {
            self.scp_port = value.parse::<u16>().map_err(|_| ConfigError::InvalidOverride {
                name: SCP_PORT_ENV,
                value: value.clone(),
            })?;
        }
        self.validate()
    }

    /// The configured identifier, or a freshly generated unique one
    pub fn resolve_identifier(&self) -> String {
        match &self.identifier {
            Some(identifier) => identifier.clone(),
            None => format!("{}-{}", self.name, uuid::Uuid::new_v4().simple()),
        }
    }

    /// Attributes this node advertises in its gossip
    pub fn advertised_attributes(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(attributes::SERVICE_NAME.to_string(), self.name.clone());
        map.insert(attributes::HTTP_PORT.to_string(), self.http.listen.port().to_string());
        map.insert(attributes::SCP_PORT.to_string(), self.scp_port.to_string());
        map
    }
}

impl DiscoveryConfig {
    /// Keepalive interval, None when disabled
    pub fn announce_interval(&self) -> Option<Duration> {
        match self.announce_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            identifier: None,
            name: default_name(),
            discovery: DiscoveryConfig::default(),
            http: HttpConfig::default(),
            scp_port: default_scp_port(),
            proxy: ProxyConfig::default(),
            services: Vec::new(),
            log_format: LogFormat::default(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: default_discovery_port(),
            multicast_address: default_multicast_address(),
            interface: default_interface(),
            announce_interval_ms: default_announce_interval_ms(),
            multicast_ttl: default_multicast_ttl(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
        }
    }
}

fn check_token(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() || !attributes::is_wire_safe(value) {
        return Err(ConfigError::InvalidToken {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

// Default values
fn default_name() -> String {
    "mesh-node".to_string()
}

fn default_scp_port() -> u16 {
    8081
}

fn default_discovery_port() -> u16 {
    47000
}

fn default_multicast_address() -> Ipv4Addr {
    Ipv4Addr::new(239, 255, 42, 99)
}

fn default_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_announce_interval_ms() -> u64 {
    5000
}

fn default_multicast_ttl() -> u32 {
    1
}

fn default_http_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}
