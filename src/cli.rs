//! Command line helpers: the reload client (`-r`) and credentials file
//! generation (`-g`)

use crate::api::RELOAD_PATH;
use crate::config::BaseConfig;
use anyhow::{bail, Context, Result};
use reqwest::header::AUTHORIZATION;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const ENV_API: &str = "EPOK_API";
pub const ENV_SECRET: &str = "EPOK_SECRET";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// `~/.config/epok-forwarder/.env`
pub fn env_file() -> Result<PathBuf> {
    let home = dirs::home_dir().context("cannot determine home directory")?;
    Ok(home.join(".config").join("epok-forwarder").join(".env"))
}

/// Talks to the admin API of a running forwarder
pub struct ReloadClient {
    api: String,
    secret: String,
    client: reqwest::Client,
}

impl ReloadClient {
    pub fn new(api: &str, secret: &str) -> Result<Self> {
        let api = api.trim_end_matches('/');
        if api.is_empty() {
            bail!("{} is not set", ENV_API);
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            api: api.to_string(),
            secret: secret.to_string(),
            client,
        })
    }

    /// Build from `EPOK_API` / `EPOK_SECRET`, reading the credentials file
    /// first. Variables already set in the environment win.
    pub fn from_env() -> Result<Self> {
        let path = env_file()?;
        if dotenvy::from_path(&path).is_ok() {
            info!("Loaded credentials from {}", path.display());
        }
        let api = std::env::var(ENV_API).unwrap_or_default();
        let secret = std::env::var(ENV_SECRET).unwrap_or_default();
        Self::new(&api, &secret)
    }

    /// Ask the server to reload its config. Returns the response body.
    pub async fn reload(&self) -> Result<String> {
        let url = format!("{}{}", self.api, RELOAD_PATH);
        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.secret))
            .send()
            .await
            .with_context(|| format!("failed to reach {}", url))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("error hot reload ({}): {}", status, body);
        }
        Ok(body)
    }
}

/// Write the credentials file the reload client reads.
pub fn generate(base: &BaseConfig, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    // An empty api host listens everywhere, loopback reaches it
    let api = match base.api.strip_prefix(':') {
        Some(port) => format!("127.0.0.1:{}", port),
        None => base.api.clone(),
    };
    let contents = format!(
        "{}=http://{}\n{}={}\n",
        ENV_API, api, ENV_SECRET, base.secret
    );
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!("Generated env file: {}", path.display());
    Ok(())
}
