//! Session-based UDP forwarding
//!
//! Every client address gets its own connected upstream socket, so replies
//! from the backend can be routed back to the right client. A session is
//! dropped after it has been idle for the configured timeout.

use crate::firewall::FirewallStack;
use crate::geo::CountryResolver;
use crate::relay::accept_backoff;
use dashmap::DashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Idle time after which a client mapping is forgotten
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

const DATAGRAM_SIZE: usize = 64 * 1024;

struct Session {
    upstream: UdpSocket,
    /// Milliseconds since the proxy started, at the last datagram either way
    last_active: AtomicU64,
}

/// One listening UDP port forwarding to one backend address
pub struct DatagramProxy {
    socket: UdpSocket,
    dest: SocketAddr,
    firewall: FirewallStack,
    geo: Arc<dyn CountryResolver>,
    idle_timeout: Duration,
    epoch: Instant,
    sessions: DashMap<SocketAddr, Arc<Session>>,
}

impl DatagramProxy {
    pub async fn bind(
        addr: SocketAddr,
        dest: SocketAddr,
        firewall: FirewallStack,
        geo: Arc<dyn CountryResolver>,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            dest,
            firewall,
            geo,
            idle_timeout: UDP_IDLE_TIMEOUT,
            epoch: Instant::now(),
            sessions: DashMap::new(),
        })
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Receive client datagrams until `token` is cancelled.
    ///
    /// Reply loops are spawned on `tracker`, so waiting on the tracker also
    /// waits for the listening socket to be released.
    pub async fn run(self: Arc<Self>, token: CancellationToken, tracker: TaskTracker) {
        let mut buf = vec![0u8; DATAGRAM_SIZE];
        loop {
            let (n, client) = tokio::select! {
                _ = token.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("UDP receive error on {}: {}", self.dest, e);
                        if !accept_backoff(&token).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            // Touched under the map guard, so an idle reply loop either sees
            // the new timestamp or has already removed the session.
            let now = self.now_millis();
            let existing = self.sessions.get(&client).map(|s| {
                s.last_active.store(now, Ordering::Relaxed);
                s.clone()
            });
            let session = match existing {
                Some(session) => session,
                None => match self.open_session(client).await {
                    Some(session) => {
                        let replies =
                            self.clone().reply_loop(client, session.clone(), token.clone());
                        tracker.spawn(replies);
                        session
                    }
                    None => continue,
                },
            };

            if let Err(e) = session.upstream.send(&buf[..n]).await {
                debug!(client = %client, dest = %self.dest, "UDP send upstream failed: {}", e);
            }
        }
        info!(dest = %self.dest, "Close udp listener");
    }

    async fn open_session(&self, client: SocketAddr) -> Option<Arc<Session>> {
        let verdict = self.firewall.evaluate(client.ip(), self.geo.as_ref());
        if !verdict.allowed {
            info!(client = %client, reason = %verdict.reason, "Deny udp session");
            return None;
        }

        let local: SocketAddr = if self.dest.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let upstream = match UdpSocket::bind(local).await {
            Ok(s) => s,
            Err(e) => {
                warn!("Cannot bind udp upstream socket: {}", e);
                return None;
            }
        };
        if let Err(e) = upstream.connect(self.dest).await {
            warn!("Cannot connect udp upstream {}: {}", self.dest, e);
            return None;
        }

        debug!(client = %client, dest = %self.dest, "Open udp session");
        let session = Arc::new(Session {
            upstream,
            last_active: AtomicU64::new(self.now_millis()),
        });
        self.sessions.insert(client, session.clone());
        Some(session)
    }

    async fn reply_loop(
        self: Arc<Self>,
        client: SocketAddr,
        session: Arc<Session>,
        token: CancellationToken,
    ) {
        let mut buf = vec![0u8; DATAGRAM_SIZE];
        let idle_millis = self.idle_timeout.as_millis() as u64;
        loop {
            let last = session.last_active.load(Ordering::Relaxed);
            let deadline = self.epoch + Duration::from_millis(last + idle_millis);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {
                    let expired = self.sessions.remove_if(&client, |_, s| {
                        Arc::ptr_eq(s, &session) && s.last_active.load(Ordering::Relaxed) == last
                    });
                    if expired.is_some() {
                        debug!(client = %client, dest = %self.dest, "UDP session idle");
                        return;
                    }
                    if session.last_active.load(Ordering::Relaxed) == last {
                        break;
                    }
                }
                received = session.upstream.recv(&mut buf) => match received {
                    Ok(n) => {
                        session.last_active.store(self.now_millis(), Ordering::Relaxed);
                        if let Err(e) = self.socket.send_to(&buf[..n], client).await {
                            debug!(client = %client, "UDP send to client failed: {}", e);
                        }
                    }
                    Err(e) => {
                        debug!(client = %client, dest = %self.dest, "UDP upstream error: {}", e);
                        break;
                    }
                },
            }
        }
        self.sessions.remove_if(&client, |_, s| Arc::ptr_eq(s, &session));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::{Firewall, Policy};
    use crate::geo::NoCountries;

    async fn echo_server() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], peer).await;
            }
        });
        addr
    }

    async fn start(
        firewall: FirewallStack,
        idle: Duration,
    ) -> (Arc<DatagramProxy>, CancellationToken, TaskTracker) {
        let dest = echo_server().await;
        let listen = "127.0.0.1:0".parse().unwrap();
        let proxy = DatagramProxy::bind(listen, dest, firewall, Arc::new(NoCountries))
            .await
            .unwrap()
            .with_idle_timeout(idle);
        let proxy = Arc::new(proxy);
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(proxy.clone().run(token.clone(), tracker.clone()));
        (proxy, token, tracker)
    }

    #[tokio::test]
    async fn test_echo_through_proxy() {
        let (proxy, token, tracker) = start(FirewallStack::default(), UDP_IDLE_TIMEOUT).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(proxy.local_addr().unwrap()).await.unwrap();

        client.send(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(proxy.session_count(), 1);

        token.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_idle_session_expires() {
        let idle = Duration::from_millis(100);
        let (proxy, token, tracker) = start(FirewallStack::default(), idle).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(proxy.local_addr().unwrap()).await.unwrap();

        client.send(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        client.recv(&mut buf).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(proxy.session_count(), 0);

        token.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_session_reopens_after_expiry() {
        let idle = Duration::from_millis(100);
        let (proxy, token, tracker) = start(FirewallStack::default(), idle).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(proxy.local_addr().unwrap()).await.unwrap();
        let mut buf = [0u8; 16];

        client.send(b"one").await.unwrap();
        client.recv(&mut buf).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(proxy.session_count(), 0);

        client.send(b"two").await.unwrap();
        let n = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"two");
        assert_eq!(proxy.session_count(), 1);

        token.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_datagrams_at_idle_boundary_get_replies() {
        let idle = Duration::from_millis(40);
        let (proxy, token, tracker) = start(FirewallStack::default(), idle).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(proxy.local_addr().unwrap()).await.unwrap();
        let mut buf = [0u8; 16];

        for i in 0u8..20 {
            client.send(&[i]).await.unwrap();
            let n = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..n], &[i]);
            tokio::time::sleep(idle).await;
        }
        assert!(proxy.session_count() <= 1);

        token.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_denied_client_gets_no_session() {
        let policy = Policy::compile(&Firewall::new("", "127.0.0.1")).unwrap();
        let stack = FirewallStack::new(vec![Arc::new(policy)]);
        let (proxy, token, tracker) = start(stack, UDP_IDLE_TIMEOUT).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(proxy.local_addr().unwrap()).await.unwrap();

        client.send(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let reply = tokio::time::timeout(Duration::from_millis(300), client.recv(&mut buf)).await;
        assert!(reply.is_err());
        assert_eq!(proxy.session_count(), 0);

        token.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_stop_releases_port() {
        let (proxy, token, tracker) = start(FirewallStack::default(), UDP_IDLE_TIMEOUT).await;
        let addr = proxy.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"x", addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        drop(proxy);
        token.cancel();
        tracker.close();
        tracker.wait().await;

        UdpSocket::bind(addr).await.unwrap();
    }
}
