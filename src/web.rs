//! Web forwarder
//!
//! Owns the shared HTTP and HTTPS listeners of a generation. Both route by
//! hostname against the same target registry:
//! - HTTP requests are matched on the `Host` header and reverse-proxied to
//!   the target's HTTP port.
//! - HTTPS connections are matched on the ClientHello SNI and passed through
//!   untouched to the target's HTTPS port.
//!
//! Targets are registered while the generation is being built and are
//! read-only once [`WebForwarder::start`] has been called.

use crate::firewall::FirewallStack;
use crate::forwarder::ForwarderError;
use crate::geo::CountryResolver;
use crate::proxy::{text_response, ProxyBody, ReverseProxy};
use crate::relay::{accept_backoff, dial, relay};
use crate::sni::read_client_hello;
use dashmap::DashMap;
use glob::{MatchOptions, Pattern, PatternError};
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// How long a client may take to send its ClientHello
pub const CLIENT_HELLO_TIMEOUT: Duration = Duration::from_secs(5);

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Compile a hostname pattern (`*` and `?` wildcards)
pub fn host_pattern(hostname: &str) -> Result<Pattern, PatternError> {
    Pattern::new(hostname)
}

/// Request-level failures that end the client connection without a response
#[derive(Debug, Error)]
pub enum WebError {
    #[error("client {client} denied by firewall ({reason})")]
    Denied { client: IpAddr, reason: String },
}

/// A hostname pattern bound to one backend and its firewall stack
#[derive(Debug, Clone)]
pub struct WebTarget {
    pub hostname: String,
    pattern: Pattern,
    pub dst_ip: IpAddr,
    pub http_port: u16,
    pub https_port: u16,
    pub firewall: FirewallStack,
}

impl WebTarget {
    pub fn new(
        hostname: &str,
        dst_ip: IpAddr,
        http_port: u16,
        https_port: u16,
        firewall: FirewallStack,
    ) -> Result<Self, PatternError> {
        Ok(Self {
            hostname: hostname.to_string(),
            pattern: host_pattern(hostname)?,
            dst_ip,
            http_port,
            https_port,
            firewall,
        })
    }

    pub fn matches(&self, host: &str) -> bool {
        self.pattern.matches_with(host, MATCH_OPTIONS)
    }

    pub fn http_dest(&self) -> SocketAddr {
        SocketAddr::new(self.dst_ip, self.http_port)
    }

    pub fn https_dest(&self) -> SocketAddr {
        SocketAddr::new(self.dst_ip, self.https_port)
    }

    /// `Host` header sent upstream: the registered name, unless it is a
    /// wildcard pattern, in which case the name the client asked for.
    pub fn upstream_host<'a>(&'a self, requested: &'a str) -> &'a str {
        if is_wildcard(&self.hostname) {
            requested
        } else {
            &self.hostname
        }
    }
}

fn is_wildcard(hostname: &str) -> bool {
    hostname.contains(['*', '?', '['])
}

/// Strip an optional `:port` suffix from a `Host` header value.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port))
            if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) =>
        {
            name
        }
        _ => host,
    }
}

/// Builder side of the web forwarder, alive while a generation is constructed
pub struct WebForwarder {
    http_port: u16,
    https_port: u16,
    targets: Vec<WebTarget>,
    geo: Arc<dyn CountryResolver>,
}

impl WebForwarder {
    pub fn new(http_port: u16, https_port: u16, geo: Arc<dyn CountryResolver>) -> Self {
        Self {
            http_port,
            https_port,
            targets: Vec::new(),
            geo,
        }
    }

    /// Add a target. Registration order decides which pattern wins when
    /// several match.
    pub fn register(&mut self, target: WebTarget) {
        info!(
            hostname = %target.hostname,
            dst_ip = %target.dst_ip,
            http = target.http_port,
            https = target.https_port,
            "Register web forwarder"
        );
        self.targets.push(target);
    }

    pub fn targets(&self) -> &[WebTarget] {
        &self.targets
    }

    /// Bind both listeners and start serving on them.
    ///
    /// Accept loops run on `tracker` and exit when `token` is cancelled.
    pub async fn start(
        self,
        token: &CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<(), ForwarderError> {
        let http_addr = SocketAddr::from(([0, 0, 0, 0], self.http_port));
        let https_addr = SocketAddr::from(([0, 0, 0, 0], self.https_port));
        let http_listener = bind(http_addr, "http").await?;
        let https_listener = bind(https_addr, "https").await?;

        let router = Arc::new(WebRouter {
            targets: self.targets,
            geo: self.geo,
            proxies: DashMap::new(),
        });

        info!("HTTP server listening on {}", http_addr);
        tracker.spawn(router.clone().serve_http(http_listener, token.clone()));
        info!("HTTPS server listening on {}", https_addr);
        tracker.spawn(router.serve_https(https_listener, token.clone()));
        Ok(())
    }
}

async fn bind(addr: SocketAddr, proto: &'static str) -> Result<TcpListener, ForwarderError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ForwarderError::Bind {
            proto,
            addr,
            source,
        })
}

/// Serving side: the frozen target registry plus the reverse proxy cache
struct WebRouter {
    targets: Vec<WebTarget>,
    geo: Arc<dyn CountryResolver>,
    proxies: DashMap<SocketAddr, Arc<ReverseProxy>>,
}

impl WebRouter {
    fn find_target(&self, host: &str) -> Option<&WebTarget> {
        self.targets.iter().find(|t| t.matches(host))
    }

    /// Reverse proxy for `dest`, created at most once.
    fn proxy_for(&self, dest: SocketAddr) -> Arc<ReverseProxy> {
        self.proxies
            .entry(dest)
            .or_insert_with(|| Arc::new(ReverseProxy::new(dest)))
            .clone()
    }

    async fn serve_http(self: Arc<Self>, listener: TcpListener, token: CancellationToken) {
        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Cannot accept http conn: {}", e);
                        if !accept_backoff(&token).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            let router = self.clone();
            tokio::spawn(async move {
                if let Err(e) = router.handle_connection(stream, remote_addr).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
        info!("Close http listener");
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> Result<(), hyper::Error> {
        let io = TokioIo::new(stream);

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let router = self.clone();
                    async move { router.handle_request(req, remote_addr).await }
                }),
            )
            .with_upgrades()
            .await
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, WebError> {
        let requested = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| req.uri().authority().map(|a| a.as_str()))
            .map(strip_port)
            .unwrap_or("")
            .to_string();

        let Some(target) = self.find_target(&requested) else {
            warn!("No hostname matches {}", requested);
            return Ok(text_response(
                StatusCode::BAD_REQUEST,
                &format!("no hostname matches {}", requested),
            ));
        };

        let verdict = target.firewall.evaluate(remote_addr.ip(), self.geo.as_ref());
        if !verdict.allowed {
            info!(
                client = %remote_addr,
                hostname = %requested,
                reason = %verdict.reason,
                "Deny http request"
            );
            return Err(WebError::Denied {
                client: remote_addr.ip(),
                reason: verdict.reason.to_string(),
            });
        }

        let proxy = self.proxy_for(target.http_dest());
        info!(dest = %proxy.dest(), hostname = %target.hostname, "Serve http");
        Ok(proxy
            .forward(req, remote_addr, target.upstream_host(&requested))
            .await)
    }

    async fn serve_https(self: Arc<Self>, listener: TcpListener, token: CancellationToken) {
        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Cannot accept https conn: {}", e);
                        if !accept_backoff(&token).await {
                            break;
                        }
                        continue;
                    }
                },
            };
            tokio::spawn(self.clone().handle_tls(stream, remote_addr));
        }
        info!("Close https listener");
    }

    async fn handle_tls(self: Arc<Self>, mut stream: TcpStream, remote_addr: SocketAddr) {
        let hello =
            match tokio::time::timeout(CLIENT_HELLO_TIMEOUT, read_client_hello(&mut stream)).await {
                Ok(Ok(hello)) => hello,
                Ok(Err(e)) => {
                    warn!("Cannot peek client hello from {}: {}", remote_addr, e);
                    return;
                }
                Err(_) => {
                    warn!("Timed out waiting for client hello from {}", remote_addr);
                    return;
                }
            };

        let server_name = hello.server_name.as_deref().unwrap_or("");
        let Some(target) = self.find_target(server_name) else {
            warn!("No hostname matches {}", server_name);
            return;
        };

        let verdict = target.firewall.evaluate(remote_addr.ip(), self.geo.as_ref());
        if !verdict.allowed {
            info!(
                client = %remote_addr,
                hostname = %server_name,
                reason = %verdict.reason,
                "Deny https connection"
            );
            return;
        }

        let dest = target.https_dest();
        let backend = match dial(dest).await {
            Ok(s) => s,
            Err(e) => {
                warn!("Cannot dial backend {}: {}", dest, e);
                return;
            }
        };
        info!(dest = %dest, hostname = %server_name, "Serve https");

        let stats = relay(stream, backend, hello.consumed).await;
        debug!(
            client = %remote_addr,
            dest = %dest,
            up = stats.client_to_backend,
            down = stats.backend_to_client,
            "Https relay finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::{Firewall, Policy};
    use crate::geo::NoCountries;

    fn target(hostname: &str, http_port: u16) -> WebTarget {
        WebTarget::new(
            hostname,
            "127.0.0.1".parse().unwrap(),
            http_port,
            443,
            FirewallStack::default(),
        )
        .unwrap()
    }

    fn router(targets: Vec<WebTarget>) -> WebRouter {
        WebRouter {
            targets,
            geo: Arc::new(NoCountries),
            proxies: DashMap::new(),
        }
    }

    #[test]
    fn test_wildcard_matching() {
        let t = target("*.site.test", 80);
        assert!(t.matches("a.site.test"));
        assert!(t.matches("A.Site.Test"));
        assert!(t.matches("deep.a.site.test"));
        assert!(!t.matches("site.test"));
        assert!(!t.matches("a.site.test.evil"));

        let t = target("api?.site.test", 80);
        assert!(t.matches("api1.site.test"));
        assert!(!t.matches("api.site.test"));
    }

    #[test]
    fn test_first_registered_match_wins() {
        let r = router(vec![
            target("*.site.test", 8001),
            target("a.site.test", 8002),
        ]);
        assert_eq!(r.find_target("a.site.test").unwrap().http_port, 8001);
        assert!(r.find_target("other.test").is_none());
    }

    #[test]
    fn test_upstream_host() {
        let exact = target("Site.Test", 80);
        assert_eq!(exact.upstream_host("site.test"), "Site.Test");
        let wildcard = target("*.site.test", 80);
        assert_eq!(wildcard.upstream_host("a.site.test"), "a.site.test");
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("a.site.test:8080"), "a.site.test");
        assert_eq!(strip_port("a.site.test"), "a.site.test");
        assert_eq!(strip_port("[::1]:80"), "::1");
        assert_eq!(strip_port("::1"), "::1");
    }

    #[test]
    fn test_proxy_cache_shared_per_destination() {
        let r = router(vec![target("a.site.test", 8080), target("b.site.test", 8080)]);
        let a = r.proxy_for(r.targets[0].http_dest());
        let b = r.proxy_for(r.targets[1].http_dest());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(r.proxies.len(), 1);
    }

    #[test]
    fn test_target_carries_firewall() {
        let policy = Policy::compile(&Firewall::new("", "127.0.0.1")).unwrap();
        let stack = FirewallStack::new(vec![Arc::new(policy)]);
        let t = WebTarget::new("a.site.test", "10.0.0.5".parse().unwrap(), 80, 443, stack).unwrap();
        let verdict = t.firewall.evaluate("127.0.0.1".parse().unwrap(), &NoCountries);
        assert!(!verdict.allowed);
        assert_eq!(t.https_dest(), "10.0.0.5:443".parse().unwrap());
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(host_pattern("[a.site.test").is_err());
    }
}
