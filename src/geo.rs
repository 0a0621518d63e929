//! Country lookup for firewall geo rules
//! Backed by a MaxMind `Country.mmdb` database that is downloaded on first run

use ipnet::IpNet;
use maxminddb::{geoip2, MaxMindDBError, Reader};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Database file name looked up next to the executable
pub const DB_FILE_NAME: &str = "Country.mmdb";

/// Canonical download location of the database
pub const DB_UPSTREAM_URL: &str =
    "https://raw.githubusercontent.com/Loyalsoldier/geoip/release/Country.mmdb";

/// Download sources, tried in order
pub const DB_MIRRORS: &[&str] = &[
    "https://mirror.ghproxy.com/raw.githubusercontent.com/Loyalsoldier/geoip/release/Country.mmdb",
    DB_UPSTREAM_URL,
    "https://cdn.jsdelivr.net/gh/Loyalsoldier/geoip@release/Country.mmdb",
];

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("failed to open geo database: {0}")]
    Open(#[from] MaxMindDBError),
    #[error("i/o error on geo database: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not download geo database to {path}, please download it manually from {url}")]
    Download { path: PathBuf, url: &'static str },
}

/// Resolves a client address to an ISO country code.
///
/// Implementations must be safe to call concurrently and must not block on
/// I/O. An empty string means "unknown" and matches no firewall entry.
pub trait CountryResolver: Send + Sync {
    fn country_code(&self, ip: IpAddr) -> String;

    /// `false` when country entries can never match
    fn has_database(&self) -> bool {
        true
    }
}

/// Resolver that knows no countries
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCountries;

impl CountryResolver for NoCountries {
    fn country_code(&self, _ip: IpAddr) -> String {
        String::new()
    }

    fn has_database(&self) -> bool {
        false
    }
}

/// Fixed table of networks to country codes, first match wins
#[derive(Debug, Clone, Default)]
pub struct CountryTable {
    entries: Vec<(IpNet, String)>,
}

impl CountryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, net: IpNet, code: &str) {
        self.entries.push((net, code.to_ascii_uppercase()));
    }
}

impl CountryResolver for CountryTable {
    fn country_code(&self, ip: IpAddr) -> String {
        self.entries
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .map(|(_, code)| code.clone())
            .unwrap_or_default()
    }
}

/// In-memory MaxMind country database
pub struct GeoDatabase {
    reader: Reader<Vec<u8>>,
}

impl GeoDatabase {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, GeoError> {
        let reader = Reader::open_readfile(path.as_ref())?;
        info!("Opened geo file: {}", path.as_ref().display());
        Ok(Self { reader })
    }
}

impl CountryResolver for GeoDatabase {
    fn country_code(&self, ip: IpAddr) -> String {
        match self.reader.lookup::<geoip2::Country>(ip) {
            Ok(record) => record
                .country
                .and_then(|c| c.iso_code)
                .map(str::to_string)
                .unwrap_or_default(),
            Err(e) => {
                debug!("Could not get country for {}: {}", ip, e);
                String::new()
            }
        }
    }
}

/// Default database location: beside the running executable, or the
/// working directory when that cannot be determined.
pub fn default_db_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DB_FILE_NAME)))
        .unwrap_or_else(|| PathBuf::from(DB_FILE_NAME))
}

/// Make sure the database exists at `path`, downloading it if needed, and
/// load it.
pub async fn setup(path: &Path) -> Result<GeoDatabase, GeoError> {
    if tokio::fs::metadata(path).await.is_err() {
        info!("Start downloading geo file to {}", path.display());
        download(path).await?;
        info!("Downloaded geo file");
    }
    GeoDatabase::open(path)
}

async fn download(path: &Path) -> Result<(), GeoError> {
    let failed = || GeoError::Download {
        path: path.to_path_buf(),
        url: DB_UPSTREAM_URL,
    };
    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|e| {
            warn!("Cannot build download client: {}", e);
            failed()
        })?;

    for url in DB_MIRRORS {
        let response = match client.get(*url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("Get geo file from {} failed: {}", url, e);
                continue;
            }
        };
        if !response.status().is_success() {
            warn!("Get geo file from {} failed with status {}", url, response.status());
            continue;
        }
        match response.bytes().await {
            Ok(body) => {
                tokio::fs::write(path, &body).await?;
                return Ok(());
            }
            Err(e) => warn!("Get geo file from {} failed: {}", url, e),
        }
    }

    let _ = tokio::fs::remove_file(path).await;
    Err(failed())
}
