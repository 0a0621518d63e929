//! Reverse proxy for one backend destination
//! Keeps a pooled HTTP/1.1 client so connections to the backend are reused

use crate::relay::{relay, CONNECT_TIMEOUT};
use anyhow::Result;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use tracing::{debug, warn};

/// Body type of every response produced by the web forwarder
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that only apply to a single hop
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Long-lived proxy to a single `ip:port`
pub struct ReverseProxy {
    dest: SocketAddr,
    client: Client<HttpConnector, Incoming>,
}

impl ReverseProxy {
    pub fn new(dest: SocketAddr) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { dest, client }
    }

    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    /// Send `req` to the backend with `host` as its `Host` header.
    ///
    /// A request asking for a protocol upgrade keeps its `Upgrade` header.
    /// When the backend switches protocols, both upgraded connections are
    /// joined by a byte relay.
    pub async fn forward(
        &self,
        mut req: Request<Incoming>,
        remote_addr: SocketAddr,
        host: &str,
    ) -> Response<ProxyBody> {
        let upgrade = upgrade_type(req.headers());
        let client_upgrade = upgrade.is_some().then(|| hyper::upgrade::on(&mut req));

        let proxy_req = match self.build_request(req, remote_addr, host, upgrade) {
            Ok(r) => r,
            Err(e) => {
                warn!("Cannot build request for {}: {}", self.dest, e);
                return text_response(StatusCode::BAD_REQUEST, "Bad Request");
            }
        };

        debug!("Proxying {} {} to {}", proxy_req.method(), proxy_req.uri(), self.dest);

        let mut response = match self.client.request(proxy_req).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Failed to reach backend {}: {}", self.dest, e);
                return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let Some(client_upgrade) = client_upgrade else {
                warn!("Backend {} switched protocols without being asked", self.dest);
                return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            };
            let backend_upgrade = hyper::upgrade::on(&mut response);
            tokio::spawn(tunnel(client_upgrade, backend_upgrade, remote_addr, self.dest));
        }
        response.map(|body| body.boxed())
    }

    fn build_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        host: &str,
        upgrade: Option<HeaderValue>,
    ) -> Result<Request<Incoming>> {
        let (mut parts, body) = req.into_parts();

        let original_host = parts
            .headers
            .get(HOST)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(""));
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = format!("http://{}{}", self.dest, path).parse::<Uri>()?;
        parts.version = Version::HTTP_11;

        strip_hop_by_hop(&mut parts.headers);
        if let Some(protocol) = upgrade {
            parts
                .headers
                .insert(CONNECTION, HeaderValue::from_static("upgrade"));
            parts.headers.insert(UPGRADE, protocol);
        }
        parts.headers.insert(HOST, HeaderValue::from_str(host)?);

        let client_ip = remote_addr.ip().to_canonical().to_string();
        let forwarded_for = match parts.headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{}, {}", prior, client_ip),
            None => client_ip,
        };
        parts.headers.insert(
            HeaderName::from_static(X_FORWARDED_FOR),
            HeaderValue::from_str(&forwarded_for)?,
        );
        parts
            .headers
            .insert(HeaderName::from_static(X_FORWARDED_HOST), original_host);
        parts.headers.insert(
            HeaderName::from_static(X_FORWARDED_PROTO),
            HeaderValue::from_static("http"),
        );

        Ok(Request::from_parts(parts, body))
    }
}

/// The protocol a request asks to switch to, if `Connection` lists `upgrade`
fn upgrade_type(headers: &HeaderMap) -> Option<HeaderValue> {
    let requested = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case("upgrade"));
    if requested {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

/// Relay bytes between the upgraded client and backend connections.
async fn tunnel(
    client: OnUpgrade,
    backend: OnUpgrade,
    remote_addr: SocketAddr,
    dest: SocketAddr,
) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(pair) => pair,
        Err(e) => {
            warn!("Upgrade between {} and {} failed: {}", remote_addr, dest, e);
            return;
        }
    };
    let stats = relay(TokioIo::new(client), TokioIo::new(backend), Bytes::new()).await;
    debug!(
        client = %remote_addr,
        dest = %dest,
        up = stats.client_to_backend,
        down = stats.backend_to_client,
        "Upgraded relay finished"
    );
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();
    for name in HOP_BY_HOP.iter().copied().chain(listed.iter().map(String::as_str)) {
        headers.remove(name);
    }
}

/// Create a plain-text response
pub fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(full_body(Bytes::from(body.to_string())))
        .unwrap()
}

/// Create full body
pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, X-Trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);

        assert!(headers.get("connection").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-trace").is_none());
        assert_eq!(headers.get("accept").unwrap(), "*/*");
    }

    #[test]
    fn test_upgrade_type() {
        let mut headers = HeaderMap::new();
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        assert!(upgrade_type(&headers).is_none());

        headers.insert("connection", HeaderValue::from_static("keep-alive, Upgrade"));
        assert_eq!(upgrade_type(&headers).unwrap(), "websocket");

        headers.remove("upgrade");
        assert!(upgrade_type(&headers).is_none());
    }

    #[test]
    fn test_text_response() {
        let response = text_response(StatusCode::BAD_REQUEST, "no hostname matches x");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers().get("content-type").unwrap(), "text/plain");
    }

    #[tokio::test]
    async fn test_new_keeps_destination() {
        let dest: SocketAddr = "10.0.0.5:8080".parse().unwrap();
        assert_eq!(ReverseProxy::new(dest).dest(), dest);
    }
}
