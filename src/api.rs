//! Admin API
//!
//! `POST /api/reload` re-reads the config file and swaps the running
//! generation for a new one, reverting to the previous config when the new
//! one cannot be started.

use crate::config::{Config, ConfigError};
use crate::forwarder::{require_geo, Forwarder, ForwarderError};
use crate::geo::CountryResolver;
use crate::proxy::{text_response, ProxyBody};
use crate::relay::ACCEPT_RETRY_DELAY;
use arc_swap::ArcSwap;
use hyper::body::Incoming;
use hyper::header::AUTHORIZATION;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

pub const RELOAD_PATH: &str = "/api/reload";

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error(transparent)]
    Config(ConfigError),

    #[error(transparent)]
    Stop(ForwarderError),

    #[error(transparent)]
    Start(ForwarderError),

    #[error("failed to revert: {source} (new config failed with: {cause})")]
    RevertFailed {
        cause: ForwarderError,
        source: ForwarderError,
    },
}

impl ReloadError {
    /// The process is left without a running generation
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReloadError::RevertFailed { .. })
    }
}

/// Owns the current generation and replaces it on reload
pub struct Reloader {
    config_path: PathBuf,
    geo: Arc<dyn CountryResolver>,
    current: ArcSwap<Forwarder>,
    lock: Mutex<()>,
}

impl Reloader {
    pub fn new(config_path: &Path, geo: Arc<dyn CountryResolver>, current: Forwarder) -> Self {
        Self {
            config_path: config_path.to_path_buf(),
            geo,
            current: ArcSwap::from_pointee(current),
            lock: Mutex::new(()),
        }
    }

    /// The generation serving right now
    pub fn current(&self) -> Arc<Forwarder> {
        self.current.load_full()
    }

    /// Replace the running generation with one built from the config file.
    ///
    /// An unreadable or invalid file, or one with country rules while no
    /// GeoIP database is loaded, leaves the running generation alone.
    /// If the new generation fails to start, the previous config is started
    /// again and the start error is returned.
    pub async fn reload(&self) -> Result<(), ReloadError> {
        let _guard = self.lock.lock().await;

        let config = Config::load(&self.config_path)
            .await
            .map_err(ReloadError::Config)?;
        require_geo(&config, self.geo.as_ref()).map_err(ReloadError::Start)?;

        let previous = self.current.load_full();
        info!("Stopping previous forwarder instance...");
        previous.stop().await.map_err(ReloadError::Stop)?;

        info!("Starting new forwarder instance...");
        let cause = match Forwarder::start(config, self.geo.clone()).await {
            Ok(next) => {
                self.current.store(Arc::new(next));
                info!("Started new forwarder");
                return Ok(());
            }
            Err(e) => e,
        };

        error!("Could not start new forwarder, reverting...: {}", cause);
        match Forwarder::start(previous.config().clone(), self.geo.clone()).await {
            Ok(reverted) => {
                self.current.store(Arc::new(reverted));
                info!("Reverted to previous forwarder");
                Err(ReloadError::Start(cause))
            }
            Err(source) => Err(ReloadError::RevertFailed { cause, source }),
        }
    }

    /// Stop the running generation for good.
    pub async fn shutdown(&self) -> Result<(), ForwarderError> {
        let _guard = self.lock.lock().await;
        self.current.load_full().stop().await
    }
}

/// HTTP listener for the admin API
pub struct AdminServer {
    listener: TcpListener,
    reloader: Arc<Reloader>,
}

impl AdminServer {
    pub async fn bind(addr: &str, reloader: Arc<Reloader>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, reloader })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until a reload fails in a way that cannot be recovered from.
    pub async fn run(self) -> Result<(), ReloadError> {
        if let Ok(addr) = self.local_addr() {
            info!("Admin API listening on {}", addr);
        }

        let (fatal_tx, mut fatal_rx) = mpsc::channel::<ReloadError>(1);
        let handler = Arc::new(Handler {
            reloader: self.reloader,
            fatal: fatal_tx,
        });

        loop {
            let (stream, remote_addr) = tokio::select! {
                fatal = fatal_rx.recv() => match fatal {
                    Some(e) => return Err(e),
                    None => continue,
                },
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Cannot accept api conn: {}", e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                        continue;
                    }
                },
            };

            let handler = handler.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler.handle(req).await) }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("API connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }
}

struct Handler {
    reloader: Arc<Reloader>,
    fatal: mpsc::Sender<ReloadError>,
}

impl Handler {
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        if req.uri().path() != RELOAD_PATH {
            return text_response(StatusCode::NOT_FOUND, "not found");
        }
        if req.method() != Method::POST {
            return text_response(StatusCode::BAD_REQUEST, "only POST requests are accepted");
        }
        // Secret of the running generation
        let secret = self.reloader.current().config().base.secret.clone();
        if !secret.is_empty() {
            let token = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.strip_prefix("Bearer ").unwrap_or(v))
                .unwrap_or("");
            if token != secret {
                warn!("Rejected reload request with wrong secret");
                return text_response(StatusCode::FORBIDDEN, "unauthorized");
            }
        }

        match self.reloader.reload().await {
            Ok(()) => text_response(StatusCode::OK, "ok"),
            Err(e) if e.is_fatal() => {
                error!("{}", e);
                let response = text_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
                let _ = self.fatal.send(e).await;
                response
            }
            Err(e) => {
                warn!("Reload failed: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::NoCountries;
    use tempfile::NamedTempFile;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("0.0.0.0:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn write_config(file: &NamedTempFile, http: u16, https: u16) {
        let yaml = format!("http: {}\nhttps: {}\napi: 127.0.0.1:{}\n", http, https, free_port());
        std::fs::write(file.path(), yaml).unwrap();
    }

    async fn reloader(file: &NamedTempFile) -> Reloader {
        let config = Config::load(file.path()).await.unwrap();
        let forwarder = Forwarder::start(config, Arc::new(NoCountries)).await.unwrap();
        Reloader::new(file.path(), Arc::new(NoCountries), forwarder)
    }

    #[tokio::test]
    async fn test_reload_swaps_generation() {
        let file = NamedTempFile::new().unwrap();
        let (http, https) = (free_port(), free_port());
        write_config(&file, http, https);
        let reloader = reloader(&file).await;
        let first = reloader.current();

        let new_http = free_port();
        write_config(&file, new_http, https);
        reloader.reload().await.unwrap();

        assert!(first.is_stopped());
        let current = reloader.current();
        assert_eq!(current.config().base.http, new_http);
        assert!(!current.is_stopped());
        TcpListener::bind(("0.0.0.0", http)).await.unwrap();
        reloader.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_keeps_generation() {
        let file = NamedTempFile::new().unwrap();
        write_config(&file, free_port(), free_port());
        let reloader = reloader(&file).await;
        let first = reloader.current();

        std::fs::write(file.path(), "http: 80\nhttps: 80\n").unwrap();
        let err = reloader.reload().await.unwrap_err();

        assert!(matches!(err, ReloadError::Config(ConfigError::DuplicatePorts(_))));
        assert!(!first.is_stopped());
        assert!(Arc::ptr_eq(&first, &reloader.current()));
        reloader.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_country_rules_without_database_keep_generation() {
        let file = NamedTempFile::new().unwrap();
        write_config(&file, free_port(), free_port());
        let reloader = reloader(&file).await;
        let first = reloader.current();

        let yaml = format!(
            "http: {}\nhttps: {}\napi: 127.0.0.1:{}\ndeny: CN\n",
            free_port(),
            free_port(),
            free_port()
        );
        std::fs::write(file.path(), yaml).unwrap();
        let err = reloader.reload().await.unwrap_err();

        assert!(matches!(err, ReloadError::Start(ForwarderError::GeoUnavailable)));
        assert!(!first.is_stopped());
        assert!(Arc::ptr_eq(&first, &reloader.current()));
        reloader.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_reverts() {
        let file = NamedTempFile::new().unwrap();
        let (http, https) = (free_port(), free_port());
        write_config(&file, http, https);
        let reloader = reloader(&file).await;

        let busy = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let busy_port = busy.local_addr().unwrap().port();
        write_config(&file, busy_port, https);
        let err = reloader.reload().await.unwrap_err();

        assert!(matches!(err, ReloadError::Start(ForwarderError::Bind { .. })));
        assert!(!err.is_fatal());
        let current = reloader.current();
        assert_eq!(current.config().base.http, http);
        assert!(TcpListener::bind(("0.0.0.0", http)).await.is_err());
        reloader.shutdown().await.unwrap();
    }
}
