//! Generation orchestrator
//!
//! A [`Forwarder`] is one running generation built from one config snapshot.
//! Every listener it opens runs on a shared [`TaskTracker`] and watches a
//! shared [`CancellationToken`]; [`Forwarder::stop`] cancels the token and
//! waits for the tracker to drain, so no port of this generation is still
//! bound once it returns.

use crate::config::{Config, ConfigError};
use crate::firewall::{FirewallError, FirewallStack, Policy};
use crate::geo::CountryResolver;
use crate::host::HostForwarder;
use crate::web::WebForwarder;
use glob::PatternError;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot listen on {proto} {addr}: {source}")]
    Bind {
        proto: &'static str,
        addr: SocketAddr,
        source: io::Error,
    },

    #[error(transparent)]
    Firewall(#[from] FirewallError),

    #[error("invalid hostname pattern {pattern}: {source}")]
    Pattern {
        pattern: String,
        source: PatternError,
    },

    #[error("country firewall rules need a GeoIP database, none is loaded")]
    GeoUnavailable,

    #[error("this instance has already stopped")]
    AlreadyStopped,
}

/// Refuse a config with country entries when `geo` cannot resolve countries,
/// so such rules never silently stop matching.
pub fn require_geo(config: &Config, geo: &dyn CountryResolver) -> Result<(), ForwarderError> {
    if !geo.has_database() && config.uses_countries()? {
        return Err(ForwarderError::GeoUnavailable);
    }
    Ok(())
}

pub struct Forwarder {
    config: Config,
    hosts: Vec<HostForwarder>,
    token: CancellationToken,
    tracker: TaskTracker,
    stopped: AtomicBool,
}

impl Forwarder {
    /// Build and start a generation from `config`.
    ///
    /// Every listener is bound before this returns. On failure, whatever
    /// was already bound is released before the error is returned.
    pub async fn start(
        mut config: Config,
        geo: Arc<dyn CountryResolver>,
    ) -> Result<Self, ForwarderError> {
        config.check()?;
        require_geo(&config, geo.as_ref())?;
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();

        match build(&config, geo, &token, &tracker).await {
            Ok(hosts) => Ok(Self {
                config,
                hosts,
                token,
                tracker,
                stopped: AtomicBool::new(false),
            }),
            Err(e) => {
                token.cancel();
                tracker.close();
                tracker.wait().await;
                Err(e)
            }
        }
    }

    /// Close every listener of this generation and wait until they are gone.
    ///
    /// Established relays are left to drain on their own.
    pub async fn stop(&self) -> Result<(), ForwarderError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(ForwarderError::AlreadyStopped);
        }
        info!("Shutting down all listeners...");
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("All listeners closed");
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Config snapshot this generation was built from, defaults applied
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hosts(&self) -> &[HostForwarder] {
        &self.hosts
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn build(
    config: &Config,
    geo: Arc<dyn CountryResolver>,
    token: &CancellationToken,
    tracker: &TaskTracker,
) -> Result<Vec<HostForwarder>, ForwarderError> {
    let base = FirewallStack::new(vec![Arc::new(Policy::compile(&config.base.firewall)?)]);
    let mut web = WebForwarder::new(config.base.http, config.base.https, geo.clone());

    let mut hosts = Vec::with_capacity(config.hosts.len());
    for host in &config.hosts {
        let forwarder =
            HostForwarder::start(host, &base, geo.clone(), &mut web, token, tracker).await?;
        hosts.push(forwarder);
    }
    web.start(token, tracker).await?;
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{CountryTable, NoCountries};
    use tokio::net::TcpListener;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("0.0.0.0:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn config(yaml: &str) -> Config {
        Config::parse(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_stop_twice_fails() {
        let yaml = format!(
            "http: {}\nhttps: {}\napi: 127.0.0.1:{}\nhosts: []\n",
            free_port(),
            free_port(),
            free_port()
        );
        let forwarder = Forwarder::start(config(&yaml), Arc::new(NoCountries)).await.unwrap();
        assert!(!forwarder.is_stopped());
        forwarder.stop().await.unwrap();
        assert!(forwarder.is_stopped());
        let err = forwarder.stop().await.unwrap_err();
        assert_eq!(err.to_string(), "this instance has already stopped");
    }

    #[tokio::test]
    async fn test_stop_releases_ports() {
        let (http, https, src) = (free_port(), free_port(), free_port());
        let yaml = format!(
            "http: {http}\nhttps: {https}\napi: 127.0.0.1:{}\nhosts:\n  - host: 127.0.0.1\n    forwards:\n      - type: port\n        src: {src}\n        dst: 9\n",
            free_port()
        );
        let forwarder = Forwarder::start(config(&yaml), Arc::new(NoCountries)).await.unwrap();
        assert_eq!(forwarder.hosts().len(), 1);
        assert!(TcpListener::bind(("0.0.0.0", http)).await.is_err());

        forwarder.stop().await.unwrap();
        for port in [http, https, src] {
            TcpListener::bind(("0.0.0.0", port)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_failed_start_unwinds() {
        let (http, https, src) = (free_port(), free_port(), free_port());
        let _taken = std::net::TcpListener::bind(("0.0.0.0", https)).unwrap();
        let yaml = format!(
            "http: {http}\nhttps: {https}\napi: 127.0.0.1:{}\nhosts:\n  - host: 127.0.0.1\n    forwards:\n      - type: port\n        src: {src}\n        dst: 9\n",
            free_port()
        );
        let err = Forwarder::start(config(&yaml), Arc::new(NoCountries)).await.err().unwrap();
        assert!(matches!(err, ForwarderError::Bind { proto: "https", .. }));

        TcpListener::bind(("0.0.0.0", http)).await.unwrap();
        TcpListener::bind(("0.0.0.0", src)).await.unwrap();
    }

    #[tokio::test]
    async fn test_country_rules_need_database() {
        let yaml = format!(
            "http: {}\nhttps: {}\napi: 127.0.0.1:{}\ndeny: CN\n",
            free_port(),
            free_port(),
            free_port()
        );
        let err = Forwarder::start(config(&yaml), Arc::new(NoCountries)).await.err().unwrap();
        assert!(matches!(err, ForwarderError::GeoUnavailable));

        let forwarder = Forwarder::start(config(&yaml), Arc::new(CountryTable::new()))
            .await
            .unwrap();
        forwarder.stop().await.unwrap();
    }

    #[test]
    fn test_require_geo_without_country_rules() {
        let plain = config("deny: 10.0.0.0/8\n");
        require_geo(&plain, &NoCountries).unwrap();
        let countries = config("allow: us\n");
        assert!(require_geo(&countries, &NoCountries).is_err());
        require_geo(&countries, &CountryTable::new()).unwrap();
    }
}
