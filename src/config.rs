//! Configuration model
//!
//! The YAML file declares base listener settings, a base firewall layer and a
//! list of hosts, each with forwarding rules. [`Config::validate`] applies
//! defaults and rejects the whole file on the first problem, before any
//! listener is opened.

use crate::firewall::{Firewall, FirewallError, Policy};
use crate::web::host_pattern;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PORT: u16 = 443;
pub const DEFAULT_API_ADDR: &str = "127.0.0.1:2035";

pub const FORWARD_TYPE_PORT: &str = "port";
pub const FORWARD_TYPE_PORT_RANGE: &str = "port_range";
pub const FORWARD_TYPE_WEB: &str = "web";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("type is not defined: {0}")]
    UnknownType(String),

    #[error("malformed api field: {0}")]
    MalformedApi(String),

    #[error("error parsing host {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("src or dst not set")]
    PortNotSet,

    #[error("malformed port range: {0}")]
    MalformedRange(String),

    #[error("hostnames being empty")]
    EmptyHostnames,

    #[error("invalid hostname pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error(transparent)]
    Firewall(#[from] FirewallError),

    #[error("duplicate ports to listen on: {0:?}")]
    DuplicatePorts(Vec<u16>),
}

/// Root of the config file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub base: BaseConfig,
    #[serde(default)]
    pub hosts: Vec<Host>,
}

/// Process-wide listener settings and the outermost firewall layer
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BaseConfig {
    #[serde(default)]
    pub http: u16,
    #[serde(default)]
    pub https: u16,
    #[serde(default)]
    pub api: String,
    #[serde(default)]
    pub secret: String,
    #[serde(flatten)]
    pub firewall: Firewall,
}

/// A backend host and the traffic forwarded to it
#[derive(Debug, Clone, Deserialize)]
pub struct Host {
    pub host: String,
    #[serde(default)]
    pub forwards: Vec<Forward>,
    #[serde(flatten)]
    pub firewall: Firewall,
}

/// One forwarding rule with its own firewall layer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawForward")]
pub struct Forward {
    pub kind: ForwardKind,
    pub firewall: Firewall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardKind {
    /// Single source port to a single destination port, TCP and UDP
    Port { src: u16, dst: u16 },
    /// Identical source and destination ports
    PortRange(PortRange),
    /// Hostnames routed through the shared HTTP/HTTPS listeners
    Web(WebForward),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebForward {
    pub http: u16,
    pub https: u16,
    pub hostnames: Vec<String>,
}

/// Flat on-disk form of a forward rule
#[derive(Debug, Deserialize)]
struct RawForward {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    src: u16,
    #[serde(default)]
    dst: u16,
    #[serde(default)]
    port_range: String,
    #[serde(default)]
    http: u16,
    #[serde(default)]
    https: u16,
    #[serde(default)]
    hostnames: Vec<String>,
    #[serde(default)]
    allow: String,
    #[serde(default)]
    deny: String,
}

impl TryFrom<RawForward> for Forward {
    type Error = ConfigError;

    fn try_from(raw: RawForward) -> Result<Self, Self::Error> {
        let kind = match raw.kind.as_str() {
            FORWARD_TYPE_PORT => ForwardKind::Port {
                src: raw.src,
                dst: raw.dst,
            },
            FORWARD_TYPE_PORT_RANGE => ForwardKind::PortRange(PortRange::new(raw.port_range)),
            FORWARD_TYPE_WEB => ForwardKind::Web(WebForward {
                http: raw.http,
                https: raw.https,
                hostnames: raw.hostnames,
            }),
            other => return Err(ConfigError::UnknownType(other.to_string())),
        };
        Ok(Forward {
            kind,
            firewall: Firewall {
                allow: raw.allow,
                deny: raw.deny,
            },
        })
    }
}

impl Forward {
    /// Check this rule, apply its defaults and record the ports it listens on.
    fn check(&mut self, ports: &mut Vec<u16>) -> Result<(), ConfigError> {
        Policy::compile(&self.firewall)?;
        match &mut self.kind {
            ForwardKind::Port { src, dst } => {
                if *src == 0 || *dst == 0 {
                    return Err(ConfigError::PortNotSet);
                }
                ports.push(*src);
            }
            ForwardKind::PortRange(range) => ports.extend(range.ports()?),
            ForwardKind::Web(web) => {
                if web.http == 0 {
                    web.http = DEFAULT_HTTP_PORT;
                }
                if web.https == 0 {
                    web.https = DEFAULT_HTTPS_PORT;
                }
                if web.hostnames.is_empty() {
                    return Err(ConfigError::EmptyHostnames);
                }
                for hostname in &web.hostnames {
                    host_pattern(hostname).map_err(|e| ConfigError::InvalidPattern {
                        pattern: hostname.clone(),
                        reason: e.to_string(),
                    })?;
                }
            }
        }
        Ok(())
    }
}

/// Textual port list such as `"8000-8010,9000"`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRange(String);

impl PortRange {
    pub fn new(spec: impl Into<String>) -> Self {
        Self(spec.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Expand to the listed ports, in order.
    pub fn ports(&self) -> Result<Vec<u16>, ConfigError> {
        let spec: String = self.0.chars().filter(|c| !c.is_whitespace()).collect();
        let mut ports = Vec::new();
        for segment in spec.split(',') {
            let bounds: Vec<&str> = segment.split('-').collect();
            match bounds.as_slice() {
                [single] => ports.push(parse_port(single, segment)?),
                [start, end] => {
                    let start = parse_port(start, segment)?;
                    let end = parse_port(end, segment)?;
                    if start > end {
                        return Err(ConfigError::MalformedRange(segment.to_string()));
                    }
                    ports.extend(start..=end);
                }
                _ => return Err(ConfigError::MalformedRange(segment.to_string())),
            }
        }
        Ok(ports)
    }
}

fn parse_port(value: &str, segment: &str) -> Result<u16, ConfigError> {
    match value.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ConfigError::MalformedRange(segment.to_string())),
    }
}

impl Config {
    /// Parse a config from YAML text. No validation is done here.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read, parse and validate a config file.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
        let mut config = Self::parse(&text)?;
        config.validate().await?;
        Ok(config)
    }

    /// Full validation: [`Config::check`] plus DNS resolution of every host.
    pub async fn validate(&mut self) -> Result<(), ConfigError> {
        self.check()?;
        for host in &self.hosts {
            resolve_host(&host.host).await?;
        }
        Ok(())
    }

    /// Apply defaults and check everything that needs no network access.
    ///
    /// Every listening port (HTTP, HTTPS, admin API and raw forwarding
    /// sources) must be unique across the whole file.
    pub fn check(&mut self) -> Result<(), ConfigError> {
        let mut ports = Vec::new();

        if self.base.http == 0 {
            self.base.http = DEFAULT_HTTP_PORT;
        }
        ports.push(self.base.http);
        if self.base.https == 0 {
            self.base.https = DEFAULT_HTTPS_PORT;
        }
        ports.push(self.base.https);
        if self.base.api.is_empty() {
            self.base.api = DEFAULT_API_ADDR.to_string();
        }
        ports.push(self.base.api_port()?);
        Policy::compile(&self.base.firewall)?;

        for host in &mut self.hosts {
            Policy::compile(&host.firewall)?;
            for forward in &mut host.forwards {
                forward.check(&mut ports)?;
            }
        }

        let duplicates = find_duplicates(&ports);
        if !duplicates.is_empty() {
            return Err(ConfigError::DuplicatePorts(duplicates));
        }
        Ok(())
    }
}

impl Config {
    /// Whether any firewall layer in the file names a country code.
    pub fn uses_countries(&self) -> Result<bool, ConfigError> {
        let layers = std::iter::once(&self.base.firewall).chain(
            self.hosts.iter().flat_map(|host| {
                std::iter::once(&host.firewall).chain(host.forwards.iter().map(|f| &f.firewall))
            }),
        );
        for firewall in layers {
            if Policy::compile(firewall)?.has_countries() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl BaseConfig {
    /// Port of the admin API address (`host:port`, host may be empty).
    pub fn api_port(&self) -> Result<u16, ConfigError> {
        let malformed = || ConfigError::MalformedApi(self.api.clone());
        let (_, port) = self.api.rsplit_once(':').ok_or_else(malformed)?;
        port.parse::<u16>().map_err(|_| malformed())
    }

    /// Admin API address to bind; an empty host means every interface.
    pub fn api_listen_addr(&self) -> String {
        match self.api.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{}", port),
            None => self.api.clone(),
        }
    }
}

fn find_duplicates(ports: &[u16]) -> Vec<u16> {
    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    for port in ports {
        if !seen.insert(*port) {
            duplicates.insert(*port);
        }
    }
    duplicates.into_iter().collect()
}

/// Resolve a host name (or literal address) to the first address returned.
pub async fn resolve_host(host: &str) -> Result<IpAddr, ConfigError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let resolve_err = |reason: String| ConfigError::Resolve {
        host: host.to_string(),
        reason,
    };
    let mut addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| resolve_err(e.to_string()))?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| resolve_err("no addresses found".to_string()))
}
