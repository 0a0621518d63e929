//! Host forwarder
//!
//! Resolves one configured host and opens its raw port listeners. `web`
//! rules do not listen on their own; their hostnames are registered with the
//! shared [`WebForwarder`].

use crate::config::{resolve_host, ForwardKind, Host};
use crate::firewall::{FirewallStack, Policy};
use crate::forwarder::ForwarderError;
use crate::geo::CountryResolver;
use crate::relay::{accept_backoff, dial, relay};
use crate::udp::DatagramProxy;
use crate::web::{WebForwarder, WebTarget};
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// The listeners opened for one configured host
#[derive(Debug)]
pub struct HostForwarder {
    host: String,
    dst_ip: IpAddr,
    ports: Vec<(u16, u16)>,
}

impl HostForwarder {
    /// Resolve `host`, bind every port rule and register every web rule.
    ///
    /// `base` is the global firewall stack; each rule is evaluated against
    /// `base`, then the host layer, then its own layer.
    pub async fn start(
        host: &Host,
        base: &FirewallStack,
        geo: Arc<dyn CountryResolver>,
        web: &mut WebForwarder,
        token: &CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<Self, ForwarderError> {
        let dst_ip = resolve_host(&host.host).await?;
        let host_stack = base.with_layer(Arc::new(Policy::compile(&host.firewall)?));

        let mut forwarder = Self {
            host: host.host.clone(),
            dst_ip,
            ports: Vec::new(),
        };

        for forward in &host.forwards {
            let stack = host_stack.with_layer(Arc::new(Policy::compile(&forward.firewall)?));
            match &forward.kind {
                ForwardKind::Port { src, dst } => {
                    forwarder
                        .listen(*src, *dst, &stack, &geo, token, tracker)
                        .await?;
                }
                ForwardKind::PortRange(range) => {
                    for port in range.ports()? {
                        forwarder
                            .listen(port, port, &stack, &geo, token, tracker)
                            .await?;
                    }
                }
                ForwardKind::Web(rule) => {
                    for hostname in &rule.hostnames {
                        let target =
                            WebTarget::new(hostname, dst_ip, rule.http, rule.https, stack.clone())
                                .map_err(|source| ForwarderError::Pattern {
                                    pattern: hostname.clone(),
                                    source,
                                })?;
                        web.register(target);
                    }
                }
            }
        }
        Ok(forwarder)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn dst_ip(&self) -> IpAddr {
        self.dst_ip
    }

    /// `(source, destination)` pairs of every bound port, TCP and UDP alike
    pub fn ports(&self) -> &[(u16, u16)] {
        &self.ports
    }

    /// Bind TCP and UDP on `src_port` and forward both to `dst_port`.
    async fn listen(
        &mut self,
        src_port: u16,
        dst_port: u16,
        firewall: &FirewallStack,
        geo: &Arc<dyn CountryResolver>,
        token: &CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<(), ForwarderError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], src_port));
        let dest = SocketAddr::new(self.dst_ip, dst_port);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ForwarderError::Bind {
                proto: "tcp",
                addr,
                source,
            })?;
        info!(src_port, dst_port, dst_ip = %self.dst_ip, "Register tcp forwarder");
        tracker.spawn(serve_tcp(
            listener,
            dest,
            firewall.clone(),
            geo.clone(),
            token.clone(),
        ));

        let datagrams = DatagramProxy::bind(addr, dest, firewall.clone(), geo.clone())
            .await
            .map_err(|source| ForwarderError::Bind {
                proto: "udp",
                addr,
                source,
            })?;
        info!(src_port, dst_port, dst_ip = %self.dst_ip, "Register udp forwarder");
        tracker.spawn(Arc::new(datagrams).run(token.clone(), tracker.clone()));

        self.ports.push((src_port, dst_port));
        Ok(())
    }
}

async fn serve_tcp(
    listener: TcpListener,
    dest: SocketAddr,
    firewall: FirewallStack,
    geo: Arc<dyn CountryResolver>,
    token: CancellationToken,
) {
    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Cannot accept tcp conn: {}", e);
                    if !accept_backoff(&token).await {
                        break;
                    }
                    continue;
                }
            },
        };

        let verdict = firewall.evaluate(remote_addr.ip(), geo.as_ref());
        if !verdict.allowed {
            info!(
                client = %remote_addr,
                dest = %dest,
                reason = %verdict.reason,
                "Deny tcp connection"
            );
            continue;
        }
        debug!(client = %remote_addr, dest = %dest, "Accept tcp connection");
        tokio::spawn(forward_tcp(stream, remote_addr, dest));
    }
    info!(dest = %dest, "Close tcp listener");
}

async fn forward_tcp(stream: TcpStream, remote_addr: SocketAddr, dest: SocketAddr) {
    let backend = match dial(dest).await {
        Ok(s) => s,
        Err(e) => {
            warn!("Cannot dial tcp {}: {}", dest, e);
            return;
        }
    };
    let stats = relay(stream, backend, Bytes::new()).await;
    debug!(
        client = %remote_addr,
        dest = %dest,
        up = stats.client_to_backend,
        down = stats.backend_to_client,
        "Tcp relay finished"
    );
}
