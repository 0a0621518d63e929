//! Epok Forwarder - a declarative multi-protocol forwarder
//!
//! Built from one YAML config, it provides:
//! - Raw TCP and UDP port forwarding (single ports and port ranges)
//! - HTTP reverse proxying routed by `Host` header
//! - HTTPS passthrough routed by TLS SNI, without terminating TLS
//! - Layered allow/deny firewall by IP, CIDR or GeoIP country
//! - Hot reload through an admin endpoint, with revert on failure

pub mod api;
pub mod cli;
pub mod config;
pub mod firewall;
pub mod forwarder;
pub mod geo;
pub mod host;
pub mod proxy;
pub mod relay;
pub mod sni;
pub mod udp;
pub mod web;

pub use api::{AdminServer, ReloadError, Reloader};
pub use config::{Config, ConfigError};
pub use firewall::{Firewall, FirewallStack, Policy, Verdict};
pub use forwarder::{Forwarder, ForwarderError};
pub use geo::{CountryResolver, GeoDatabase, NoCountries};
