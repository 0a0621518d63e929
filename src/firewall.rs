//! Layered allow/deny firewall
//!
//! A [`Firewall`] is the raw `allow`/`deny` pair found at the base, host and
//! rule level of the config. It is compiled into a [`Policy`] once per
//! generation; a [`FirewallStack`] evaluates the policies outermost first.
//!
//! Within one layer the deny list is scanned first and then the allow list,
//! so an allow match overrides a deny match. Across layers, the last layer
//! with a non-default verdict wins.

use crate::geo::CountryResolver;
use ipnet::IpNet;
use serde::Deserialize;
use std::cell::OnceCell;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while compiling firewall entries
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FirewallError {
    #[error("invalid firewall entry {0:?}: expected an IP address, a CIDR block or a two-letter country code")]
    InvalidEntry(String),
}

/// Raw allow/deny lists as written in the config file
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Firewall {
    #[serde(default)]
    pub allow: String,
    #[serde(default)]
    pub deny: String,
}

impl Firewall {
    pub fn new(allow: &str, deny: &str) -> Self {
        Self {
            allow: allow.to_string(),
            deny: deny.to_string(),
        }
    }
}

/// Why a verdict was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// No rule matched
    Default,
    IpAddress,
    Geo,
    Cidr,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reason::Default => "default",
            Reason::IpAddress => "IP address",
            Reason::Geo => "geo",
            Reason::Cidr => "IP CIDR",
        };
        f.write_str(s)
    }
}

/// Result of evaluating a policy against a client address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    pub reason: Reason,
}

impl Verdict {
    pub const DEFAULT: Verdict = Verdict {
        allowed: true,
        reason: Reason::Default,
    };

    pub fn allow(reason: Reason) -> Self {
        Self {
            allowed: true,
            reason,
        }
    }

    pub fn deny(reason: Reason) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Ip(IpAddr),
    Cidr(IpNet),
    Country(String),
}

impl Entry {
    fn parse(token: &str) -> Result<Self, FirewallError> {
        if let Ok(ip) = token.parse::<IpAddr>() {
            return Ok(Entry::Ip(ip.to_canonical()));
        }
        if let Ok(net) = token.parse::<IpNet>() {
            return Ok(Entry::Cidr(net));
        }
        if token.len() == 2 && token.chars().all(|c| c.is_ascii_alphabetic()) {
            return Ok(Entry::Country(token.to_ascii_uppercase()));
        }
        Err(FirewallError::InvalidEntry(token.to_string()))
    }

    fn matches(&self, ip: IpAddr, country: &dyn Fn() -> String) -> Option<Reason> {
        match self {
            Entry::Ip(addr) if *addr == ip => Some(Reason::IpAddress),
            Entry::Cidr(net) if net.contains(&ip) => Some(Reason::Cidr),
            Entry::Country(code) if code.eq_ignore_ascii_case(&country()) => Some(Reason::Geo),
            _ => None,
        }
    }
}

fn parse_list(list: &str) -> Result<Vec<Entry>, FirewallError> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(Entry::parse)
        .collect()
}

/// One compiled firewall layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    allow: Vec<Entry>,
    deny: Vec<Entry>,
}

impl Policy {
    pub fn compile(firewall: &Firewall) -> Result<Self, FirewallError> {
        Ok(Self {
            allow: parse_list(&firewall.allow)?,
            deny: parse_list(&firewall.deny)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }

    /// Whether any entry of this layer is a country code
    pub fn has_countries(&self) -> bool {
        self.allow
            .iter()
            .chain(&self.deny)
            .any(|e| matches!(e, Entry::Country(_)))
    }

    /// Evaluate this layer alone.
    ///
    /// The country of `ip` is looked up at most once, and only when a
    /// country entry is actually reached.
    pub fn evaluate(&self, ip: IpAddr, geo: &dyn CountryResolver) -> Verdict {
        let ip = ip.to_canonical();
        let country = OnceCell::new();
        let lookup = || country.get_or_init(|| geo.country_code(ip)).clone();

        let mut verdict = Verdict::DEFAULT;
        if let Some(reason) = self.deny.iter().find_map(|e| e.matches(ip, &lookup)) {
            verdict = Verdict::deny(reason);
        }
        if let Some(reason) = self.allow.iter().find_map(|e| e.matches(ip, &lookup)) {
            verdict = Verdict::allow(reason);
        }
        verdict
    }
}

/// Ordered firewall layers, outermost (base) first
#[derive(Debug, Clone, Default)]
pub struct FirewallStack {
    layers: Vec<Arc<Policy>>,
}

impl FirewallStack {
    pub fn new(layers: Vec<Arc<Policy>>) -> Self {
        Self { layers }
    }

    /// Return a copy of this stack with one more inner layer.
    pub fn with_layer(&self, layer: Arc<Policy>) -> Self {
        let mut layers = self.layers.clone();
        layers.push(layer);
        Self { layers }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn evaluate(&self, ip: IpAddr, geo: &dyn CountryResolver) -> Verdict {
        let mut verdict = Verdict::DEFAULT;
        for layer in self.layers.iter().filter(|l| !l.is_empty()) {
            let v = layer.evaluate(ip, geo);
            if !v.allowed || v.reason != Reason::Default {
                verdict = v;
            }
        }
        verdict
    }
}
